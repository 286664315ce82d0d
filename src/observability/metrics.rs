use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Central registry for all Prometheus metrics, one group per pipeline
/// stage (SPEC_FULL.md §4). `bus::consumer::ConsumerMetrics` tracks
/// per-topic poll/commit counters separately and renders its own text via
/// `to_prometheus_text`; this registry covers the domain-level counts each
/// stage produces regardless of transport.
pub struct MetricsRegistry {
	registry: Registry,

	// Ingest processor (SPEC_FULL.md §4.2)
	pub ingest_records_total: IntCounter,
	pub ingest_relationships_total: IntCounter,
	pub ingest_errors_total: IntCounter,
	pub ingest_duration_seconds: Histogram,

	// CDC dispatcher (SPEC_FULL.md §4.3)
	pub cdc_events_processed_total: IntCounter,
	pub cdc_events_failed_total: IntCounter,
	pub cdc_idempotent_skips_total: IntCounter,

	// Match engine (SPEC_FULL.md §4.4)
	pub match_candidates_total: IntCounter,
	pub match_rules_evaluated_total: IntCounter,
	pub match_duration_seconds: Histogram,

	// Merge engine (SPEC_FULL.md §4.5)
	pub merge_operations_total: IntCounter,
	pub merge_consolidations_total: IntCounter,
	pub merge_conflicts_total: IntCounter,

	// Relationship resolver (SPEC_FULL.md §4.6)
	pub relationship_edges_upserted_total: IntCounter,
	pub relationship_rewires_total: IntCounter,
	pub relationship_late_endpoints_resolved_total: IntCounter,

	// Deletion engine (SPEC_FULL.md §4.7)
	pub deletion_rows_deleted_total: IntCounter,
	pub deletion_policy_runs_total: IntCounter,

	// Outbound event bus (SPEC_FULL.md §4.9)
	pub outbound_events_published_total: IntCounter,
	pub outbound_events_dropped_total: IntCounter,
	pub consumer_lag_gauge: IntGauge,
}

impl MetricsRegistry {
	pub fn new() -> Self {
		let registry = Registry::new();

		let ingest_records_total = int_counter(
			"heimdall_ingest_records_total",
			"Total number of staged records upserted by the ingest processor",
		);
		let ingest_relationships_total = int_counter(
			"heimdall_ingest_relationships_total",
			"Total number of staged relationships upserted by the ingest processor",
		);
		let ingest_errors_total = int_counter(
			"heimdall_ingest_errors_total",
			"Total number of ingest processing errors",
		);
		let ingest_duration_seconds = histogram(
			"heimdall_ingest_duration_seconds",
			"Duration of ingest processor operations in seconds",
			vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
		);

		let cdc_events_processed_total = int_counter(
			"heimdall_cdc_events_processed_total",
			"Total CDC events successfully dispatched",
		);
		let cdc_events_failed_total = int_counter(
			"heimdall_cdc_events_failed_total",
			"Total CDC events that failed dispatch and were left uncommitted",
		);
		let cdc_idempotent_skips_total = int_counter(
			"heimdall_cdc_idempotent_skips_total",
			"Total CDC events skipped because the fingerprint was unchanged",
		);

		let match_candidates_total = int_counter(
			"heimdall_match_candidates_total",
			"Total candidate records produced by match engine Phase A",
		);
		let match_rules_evaluated_total = int_counter(
			"heimdall_match_rules_evaluated_total",
			"Total match rules evaluated across all candidates in Phase B",
		);
		let match_duration_seconds = histogram(
			"heimdall_match_duration_seconds",
			"Duration of find_matches calls in seconds",
			vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
		);

		let merge_operations_total = int_counter(
			"heimdall_merge_operations_total",
			"Total golden record merges performed",
		);
		let merge_consolidations_total = int_counter(
			"heimdall_merge_consolidations_total",
			"Total cluster consolidations performed",
		);
		let merge_conflicts_total = int_counter(
			"heimdall_merge_conflicts_total",
			"Total field merge conflicts recorded",
		);

		let relationship_edges_upserted_total = int_counter(
			"heimdall_relationship_edges_upserted_total",
			"Total golden edges upserted",
		);
		let relationship_rewires_total = int_counter(
			"heimdall_relationship_rewires_total",
			"Total golden edges rewired during cluster consolidation",
		);
		let relationship_late_endpoints_resolved_total = int_counter(
			"heimdall_relationship_late_endpoints_resolved_total",
			"Total staged relationships resolved after their missing endpoint merged",
		);

		let deletion_rows_deleted_total = int_counter(
			"heimdall_deletion_rows_deleted_total",
			"Total rows soft-deleted by the deletion engine",
		);
		let deletion_policy_runs_total = int_counter(
			"heimdall_deletion_policy_runs_total",
			"Total deletion policy evaluations",
		);

		let outbound_events_published_total = int_counter(
			"heimdall_outbound_events_published_total",
			"Total events published to the outbound event bus",
		);
		let outbound_events_dropped_total = int_counter(
			"heimdall_outbound_events_dropped_total",
			"Total outbound events dropped due to publish failure",
		);
		let consumer_lag_gauge = IntGauge::with_opts(
			Opts::new("heimdall_consumer_lag", "Estimated consumer lag across topics").namespace("heimdall"),
		)
		.unwrap();

		let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
			Box::new(ingest_records_total.clone()),
			Box::new(ingest_relationships_total.clone()),
			Box::new(ingest_errors_total.clone()),
			Box::new(ingest_duration_seconds.clone()),
			Box::new(cdc_events_processed_total.clone()),
			Box::new(cdc_events_failed_total.clone()),
			Box::new(cdc_idempotent_skips_total.clone()),
			Box::new(match_candidates_total.clone()),
			Box::new(match_rules_evaluated_total.clone()),
			Box::new(match_duration_seconds.clone()),
			Box::new(merge_operations_total.clone()),
			Box::new(merge_consolidations_total.clone()),
			Box::new(merge_conflicts_total.clone()),
			Box::new(relationship_edges_upserted_total.clone()),
			Box::new(relationship_rewires_total.clone()),
			Box::new(relationship_late_endpoints_resolved_total.clone()),
			Box::new(deletion_rows_deleted_total.clone()),
			Box::new(deletion_policy_runs_total.clone()),
			Box::new(outbound_events_published_total.clone()),
			Box::new(outbound_events_dropped_total.clone()),
			Box::new(consumer_lag_gauge.clone()),
		];
		for metric in collectors {
			registry.register(metric).unwrap();
		}

		Self {
			registry,
			ingest_records_total,
			ingest_relationships_total,
			ingest_errors_total,
			ingest_duration_seconds,
			cdc_events_processed_total,
			cdc_events_failed_total,
			cdc_idempotent_skips_total,
			match_candidates_total,
			match_rules_evaluated_total,
			match_duration_seconds,
			merge_operations_total,
			merge_consolidations_total,
			merge_conflicts_total,
			relationship_edges_upserted_total,
			relationship_rewires_total,
			relationship_late_endpoints_resolved_total,
			deletion_rows_deleted_total,
			deletion_policy_runs_total,
			outbound_events_published_total,
			outbound_events_dropped_total,
			consumer_lag_gauge,
		}
	}

	/// Encode metrics in Prometheus text format
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		match encoder.encode_to_string(&metric_families) {
			Ok(s) => s,
			Err(e) => {
				eprintln!("Failed to encode metrics: {}", e);
				String::new()
			}
		}
	}
}

fn int_counter(name: &str, help: &str) -> IntCounter {
	IntCounter::with_opts(Opts::new(name, help).namespace("heimdall")).unwrap()
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
	Histogram::with_opts(HistogramOpts::new(name, help).namespace("heimdall").buckets(buckets)).unwrap()
}

impl Default for MetricsRegistry {
	fn default() -> Self {
		Self::new()
	}
}

/// Initialize the global metrics registry
pub fn init_metrics() -> anyhow::Result<Arc<MetricsRegistry>> {
	Ok(Arc::new(MetricsRegistry::new()))
}

#[cfg(feature = "unit-tests")]
mod tests {
	#[test]
	fn metrics_registry_creation() {
		let registry = super::MetricsRegistry::new();
		assert!(!registry.encode().is_empty());
	}

	#[test]
	fn metrics_increment() {
		let registry = super::MetricsRegistry::new();
		registry.ingest_records_total.inc();
		registry.merge_operations_total.inc_by(3);
		assert!(!registry.encode().is_empty());
	}
}
