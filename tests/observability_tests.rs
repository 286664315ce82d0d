use vanopticon_heimdall::observability::{init_metrics, MetricsRegistry};

#[cfg(feature = "unit-tests")]
#[test]
fn test_metrics_registry_creation() {
	let registry = MetricsRegistry::new();
	let output = registry.encode();

	assert!(output.contains("heimdall_ingest_records_total"));
	assert!(output.contains("heimdall_cdc_events_processed_total"));
	assert!(output.contains("heimdall_match_candidates_total"));
	assert!(output.contains("heimdall_merge_operations_total"));
	assert!(output.contains("heimdall_relationship_edges_upserted_total"));
	assert!(output.contains("heimdall_deletion_rows_deleted_total"));
}

#[cfg(feature = "unit-tests")]
#[test]
fn test_metrics_increment() {
	let registry = MetricsRegistry::new();

	registry.ingest_records_total.inc();
	registry.ingest_relationships_total.inc_by(5);
	registry.merge_operations_total.inc_by(10);

	let output = registry.encode();

	assert!(output.contains("heimdall_ingest_records_total 1"));
	assert!(output.contains("heimdall_ingest_relationships_total 5"));
	assert!(output.contains("heimdall_merge_operations_total 10"));
}

#[cfg(feature = "unit-tests")]
#[test]
fn test_metrics_gauge_operations() {
	let registry = MetricsRegistry::new();

	registry.consumer_lag_gauge.set(50);
	let output = registry.encode();
	assert!(output.contains("heimdall_consumer_lag 50"));

	registry.consumer_lag_gauge.inc();
	registry.consumer_lag_gauge.dec();
	let output2 = registry.encode();
	assert!(output2.contains("heimdall_consumer_lag 50"));
}

#[cfg(feature = "unit-tests")]
#[test]
fn test_metrics_histogram_observations() {
	let registry = MetricsRegistry::new();

	registry.match_duration_seconds.observe(0.01);
	registry.match_duration_seconds.observe(0.1);
	registry.match_duration_seconds.observe(1.0);

	let output = registry.encode();

	assert!(output.contains("heimdall_match_duration_seconds_bucket"));
	assert!(output.contains("heimdall_match_duration_seconds_sum"));
	assert!(output.contains("heimdall_match_duration_seconds_count"));
}

#[cfg(feature = "unit-tests")]
#[test]
fn test_init_metrics() {
	let result = init_metrics();
	assert!(result.is_ok());
	let metrics = result.unwrap();
	assert!(!metrics.encode().is_empty());
}
