use crate::error::DeletionError;
use sqlx::PgPool;

#[derive(Clone)]
pub struct DeletionRepo {
	pool: PgPool,
}

impl DeletionRepo {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}

	pub async fn soft_delete_stale_execution(
		&self,
		tenant_id: &str,
		source_key: &str,
		entity_type: Option<&str>,
		execution_id: &str,
	) -> Result<u64, DeletionError> {
		let result = sqlx::query(
			r#"
			UPDATE staged_records
			SET deleted_at = now()
			WHERE tenant_id = $1 AND source_key = $2 AND deleted_at IS NULL
			  AND ($3::text IS NULL OR entity_type = $3)
			  AND (last_seen_execution IS NULL OR last_seen_execution <> $4)
			"#,
		)
		.bind(tenant_id)
		.bind(source_key)
		.bind(entity_type)
		.bind(execution_id)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected())
	}

	pub async fn soft_delete_stale(
		&self,
		tenant_id: &str,
		max_age_days: i64,
		integration: Option<&str>,
	) -> Result<u64, DeletionError> {
		let result = sqlx::query(
			r#"
			UPDATE staged_records
			SET deleted_at = now()
			WHERE tenant_id = $1 AND deleted_at IS NULL
			  AND updated_at < now() - ($2 || ' days')::interval
			  AND ($3::text IS NULL OR integration = $3)
			"#,
		)
		.bind(tenant_id)
		.bind(max_age_days.to_string())
		.bind(integration)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected())
	}

	pub async fn soft_delete_retention(&self, tenant_id: &str, retention_days: i64) -> Result<u64, DeletionError> {
		let result = sqlx::query(
			r#"
			UPDATE staged_records
			SET deleted_at = now()
			WHERE tenant_id = $1 AND deleted_at IS NULL
			  AND created_at < now() - ($2 || ' days')::interval
			"#,
		)
		.bind(tenant_id)
		.bind(retention_days.to_string())
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected())
	}
}
