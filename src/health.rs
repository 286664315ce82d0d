use axum::{extract::State, http::StatusCode, response::IntoResponse};

/// DB health endpoint: returns 200 OK when the configured graph sink can run
/// a simple query, otherwise returns 503 Service Unavailable.
pub async fn db_health(State(state): State<crate::state::AppState>) -> impl IntoResponse {
	match state.sink.ping().await {
		Ok(()) => (StatusCode::OK, "OK").into_response(),
		Err(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("db error: {}", e)).into_response(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{MergedRecord, MergedRelationship};
	use crate::observability::MetricsRegistry;
	use crate::sink::GraphSink;
	use async_trait::async_trait;
	use std::sync::Arc;

	struct MockSink {
		should_succeed: bool,
	}

	#[async_trait]
	impl GraphSink for MockSink {
		async fn upsert_node(&self, _tenant_id: &str, _record: &MergedRecord) -> anyhow::Result<()> {
			Ok(())
		}
		async fn delete_node(&self, _tenant_id: &str, _id: uuid::Uuid, _entity_type: &str) -> anyhow::Result<()> {
			Ok(())
		}
		async fn upsert_edge(&self, _tenant_id: &str, _edge: &MergedRelationship) -> anyhow::Result<()> {
			Ok(())
		}
		async fn delete_edge(&self, _tenant_id: &str, _id: uuid::Uuid) -> anyhow::Result<()> {
			Ok(())
		}
		async fn ping(&self) -> anyhow::Result<()> {
			if self.should_succeed {
				Ok(())
			} else {
				Err(anyhow::anyhow!("database unavailable"))
			}
		}
	}

	fn state_with(should_succeed: bool) -> crate::state::AppState {
		crate::state::AppState {
			pool: sqlx::Pool::connect_lazy("postgres://localhost/invalid").unwrap(),
			sink: Arc::new(MockSink { should_succeed }),
			metrics: Arc::new(MetricsRegistry::new()),
		}
	}

	#[tokio::test]
	async fn health_check_returns_ok_when_db_healthy() {
		let response = db_health(State(state_with(true))).await.into_response();
		assert_eq!(response.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn health_check_returns_service_unavailable_when_db_fails() {
		let response = db_health(State(state_with(false))).await.into_response();
		assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
	}
}
