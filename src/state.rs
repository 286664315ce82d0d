use std::sync::Arc;

use sqlx::PgPool;

use crate::bus::consumer::ConsumerMetrics;
use crate::observability::MetricsRegistry;
use crate::sink::GraphSink;

/// Application state passed to the health/metrics HTTP handlers.
#[derive(Clone)]
pub struct AppState {
	pub pool: PgPool,
	pub sink: Arc<dyn GraphSink>,
	pub metrics: Arc<MetricsRegistry>,
	/// One entry per bus topic consumer, surfaced alongside the registry's
	/// own counters at `/metrics`.
	pub consumer_metrics: Arc<Vec<(String, Arc<ConsumerMetrics>)>>,
}
