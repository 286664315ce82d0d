use crate::deletion::DeletionPolicy;
use crate::error::IngestError;
use crate::fingerprint::{fingerprint, ExcludeSet};
use crate::model::{Criteria, StagedRecord};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Clone)]
pub struct IngestRepo {
	pool: PgPool,
}

impl IngestRepo {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}

	pub async fn fingerprint_excludes(&self, tenant_id: &str, entity_type: &str) -> Result<ExcludeSet, IngestError> {
		let rows: Vec<(String,)> = sqlx::query_as(
			"SELECT dot_path FROM fingerprint_excludes WHERE tenant_id = $1 AND entity_type = $2",
		)
		.bind(tenant_id)
		.bind(entity_type)
		.fetch_all(&self.pool)
		.await?;
		Ok(ExcludeSet::new(rows.into_iter().map(|(p,)| p)))
	}

	/// SPEC_FULL.md §4.2 upsert: right-biased shallow merge of the incoming
	/// payload onto the existing one, then re-fingerprint.
	#[allow(clippy::too_many_arguments)]
	pub async fn upsert_staged_record(
		&self,
		tenant_id: &str,
		entity_type: &str,
		source_id: &str,
		integration: &str,
		source_key: &str,
		config_id: &str,
		execution_id: Option<&str>,
		incoming: &serde_json::Value,
		excludes: &ExcludeSet,
	) -> Result<(StagedRecord, bool, bool), IngestError> {
		let mut tx = self.pool.begin().await?;

		let existing = sqlx::query_as::<_, StagedRecord>(
			r#"
			SELECT id, tenant_id, entity_type, source_id, integration, source_key, config_id,
			       last_seen_execution, payload, fingerprint, previous_fingerprint,
			       created_at, updated_at, deleted_at
			FROM staged_records
			WHERE tenant_id = $1 AND entity_type = $2 AND source_id = $3 AND integration = $4
			  AND source_key = $5 AND config_id = $6
			FOR UPDATE
			"#,
		)
		.bind(tenant_id)
		.bind(entity_type)
		.bind(source_id)
		.bind(integration)
		.bind(source_key)
		.bind(config_id)
		.fetch_optional(&mut *tx)
		.await?;

		let (merged_payload, is_new) = match &existing {
			Some(row) => (shallow_merge(&row.payload, incoming), false),
			None => (incoming.clone(), true),
		};

		let new_fingerprint = fingerprint(&merged_payload, excludes)?;
		let is_changed = existing
			.as_ref()
			.map(|row| row.fingerprint != new_fingerprint)
			.unwrap_or(true);

		let record = if let Some(row) = existing {
			if is_changed {
				sqlx::query_as::<_, StagedRecord>(
					r#"
					UPDATE staged_records
					SET payload = $3, fingerprint = $4, previous_fingerprint = $5,
					    last_seen_execution = COALESCE($6, last_seen_execution),
					    updated_at = now(), deleted_at = NULL
					WHERE tenant_id = $1 AND id = $2
					RETURNING id, tenant_id, entity_type, source_id, integration, source_key, config_id,
					          last_seen_execution, payload, fingerprint, previous_fingerprint,
					          created_at, updated_at, deleted_at
					"#,
				)
				.bind(tenant_id)
				.bind(row.id)
				.bind(&merged_payload)
				.bind(&new_fingerprint)
				.bind(&row.fingerprint)
				.bind(execution_id)
				.fetch_one(&mut *tx)
				.await?
			} else {
				sqlx::query_as::<_, StagedRecord>(
					r#"
					UPDATE staged_records
					SET last_seen_execution = COALESCE($3, last_seen_execution), deleted_at = NULL
					WHERE tenant_id = $1 AND id = $2
					RETURNING id, tenant_id, entity_type, source_id, integration, source_key, config_id,
					          last_seen_execution, payload, fingerprint, previous_fingerprint,
					          created_at, updated_at, deleted_at
					"#,
				)
				.bind(tenant_id)
				.bind(row.id)
				.bind(execution_id)
				.fetch_one(&mut *tx)
				.await?
			}
		} else {
			sqlx::query_as::<_, StagedRecord>(
				r#"
				INSERT INTO staged_records
					(id, tenant_id, entity_type, source_id, integration, source_key, config_id,
					 last_seen_execution, payload, fingerprint, previous_fingerprint, created_at, updated_at)
				VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NULL, now(), now())
				RETURNING id, tenant_id, entity_type, source_id, integration, source_key, config_id,
				          last_seen_execution, payload, fingerprint, previous_fingerprint,
				          created_at, updated_at, deleted_at
				"#,
			)
			.bind(Uuid::new_v4())
			.bind(tenant_id)
			.bind(entity_type)
			.bind(source_id)
			.bind(integration)
			.bind(source_key)
			.bind(config_id)
			.bind(execution_id)
			.bind(&merged_payload)
			.bind(&new_fingerprint)
			.fetch_one(&mut *tx)
			.await?
		};

		tx.commit().await?;
		Ok((record, is_new, is_changed))
	}

	#[allow(clippy::too_many_arguments)]
	pub async fn upsert_criteria(
		&self,
		tenant_id: &str,
		relationship_type: &str,
		from_entity_type: &str,
		from_source_id: &str,
		from_integration: &str,
		to_entity_type: &str,
		to_integration: &str,
		config_id: &str,
		criteria: &Criteria,
	) -> Result<(Uuid, bool), IngestError> {
		let criteria_json = serde_json::to_value(criteria).unwrap_or(serde_json::Value::Null);
		let criteria_hash = crate::model::criteria::hash_value(&criteria_json);

		let existing: Option<(Uuid,)> = sqlx::query_as(
			r#"
			SELECT id FROM staged_relationship_criteria
			WHERE tenant_id = $1 AND relationship_type = $2 AND from_entity_type = $3
			  AND from_source_id = $4 AND from_integration = $5 AND to_entity_type = $6
			  AND to_integration = $7 AND criteria_hash = $8 AND config_id = $9
			"#,
		)
		.bind(tenant_id)
		.bind(relationship_type)
		.bind(from_entity_type)
		.bind(from_source_id)
		.bind(from_integration)
		.bind(to_entity_type)
		.bind(to_integration)
		.bind(&criteria_hash)
		.bind(config_id)
		.fetch_optional(&self.pool)
		.await?;

		if let Some((id,)) = existing {
			return Ok((id, false));
		}

		let id = Uuid::new_v4();
		sqlx::query(
			r#"
			INSERT INTO staged_relationship_criteria
				(id, tenant_id, relationship_type, from_entity_type, from_source_id, from_integration,
				 to_entity_type, to_integration, config_id, criteria, criteria_hash, created_at)
			VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, now())
			"#,
		)
		.bind(id)
		.bind(tenant_id)
		.bind(relationship_type)
		.bind(from_entity_type)
		.bind(from_source_id)
		.bind(from_integration)
		.bind(to_entity_type)
		.bind(to_integration)
		.bind(config_id)
		.bind(&criteria_json)
		.bind(&criteria_hash)
		.execute(&self.pool)
		.await?;

		Ok((id, true))
	}

	#[allow(clippy::too_many_arguments)]
	pub async fn upsert_staged_relationship(
		&self,
		id: Uuid,
		tenant_id: &str,
		relationship_type: &str,
		from_entity_type: &str,
		from_source_id: &str,
		from_integration: &str,
		to_entity_type: &str,
		to_source_id: Option<&str>,
		to_integration: Option<&str>,
		config_id: &str,
		execution_id: Option<&str>,
		payload: &serde_json::Value,
	) -> Result<(), IngestError> {
		let from_staged = sqlx::query_scalar::<_, Uuid>(
			"SELECT id FROM staged_records WHERE tenant_id = $1 AND entity_type = $2 AND source_id = $3 AND integration = $4",
		)
		.bind(tenant_id)
		.bind(from_entity_type)
		.bind(from_source_id)
		.bind(from_integration)
		.fetch_optional(&self.pool)
		.await?;

		let to_staged = match to_source_id {
			Some(to_source_id) => {
				sqlx::query_scalar::<_, Uuid>(
					"SELECT id FROM staged_records WHERE tenant_id = $1 AND entity_type = $2 AND source_id = $3 AND integration = $4",
				)
				.bind(tenant_id)
				.bind(to_entity_type)
				.bind(to_source_id)
				.bind(to_integration.unwrap_or(from_integration))
				.fetch_optional(&self.pool)
				.await?
			}
			None => None,
		};

		sqlx::query(
			r#"
			INSERT INTO staged_relationships
				(id, tenant_id, relationship_type, from_entity_type, from_source_id, from_integration,
				 to_entity_type, to_source_id, to_integration, from_staged_entity_id, to_staged_entity_id,
				 config_id, last_seen_execution, payload, created_at, updated_at)
			VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, now(), now())
			ON CONFLICT (id) DO UPDATE SET
				payload = staged_relationships.payload || excluded.payload,
				from_staged_entity_id = COALESCE(staged_relationships.from_staged_entity_id, excluded.from_staged_entity_id),
				to_staged_entity_id = COALESCE(staged_relationships.to_staged_entity_id, excluded.to_staged_entity_id),
				last_seen_execution = excluded.last_seen_execution,
				updated_at = now(),
				deleted_at = NULL
			"#,
		)
		.bind(id)
		.bind(tenant_id)
		.bind(relationship_type)
		.bind(from_entity_type)
		.bind(from_source_id)
		.bind(from_integration)
		.bind(to_entity_type)
		.bind(to_source_id)
		.bind(to_integration)
		.bind(from_staged)
		.bind(to_staged)
		.bind(config_id)
		.bind(execution_id)
		.bind(payload)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	/// `source_key` optionally disambiguates the natural-key lookup per
	/// SPEC_FULL.md §4.2 "ProcessExplicitDelete" ("resolve the staged record
	/// by (entity-type, source-id) optionally disambiguated by source-key").
	pub async fn soft_delete_by_source_id(
		&self,
		tenant_id: &str,
		entity_type: &str,
		entity_id: &str,
		source_key: Option<&str>,
	) -> Result<(), IngestError> {
		let mut tx = self.pool.begin().await?;
		match source_key {
			Some(key) => {
				sqlx::query(
					"UPDATE staged_records SET deleted_at = now() WHERE tenant_id = $1 AND entity_type = $2 AND source_id = $3 AND source_key = $4",
				)
				.bind(tenant_id)
				.bind(entity_type)
				.bind(entity_id)
				.bind(key)
				.execute(&mut *tx)
				.await?;
			}
			None => {
				sqlx::query(
					"UPDATE staged_records SET deleted_at = now() WHERE tenant_id = $1 AND entity_type = $2 AND source_id = $3",
				)
				.bind(tenant_id)
				.bind(entity_type)
				.bind(entity_id)
				.execute(&mut *tx)
				.await?;
			}
		}
		sqlx::query(
			r#"
			UPDATE staged_relationships SET deleted_at = now()
			WHERE tenant_id = $1
			  AND ((from_entity_type = $2 AND from_source_id = $3) OR (to_entity_type = $2 AND to_source_id = $3))
			"#,
		)
		.bind(tenant_id)
		.bind(entity_type)
		.bind(entity_id)
		.execute(&mut *tx)
		.await?;
		tx.commit().await?;
		Ok(())
	}

	/// Fetch a staged record by id, including soft-deleted rows — the CDC
	/// dispatcher needs the after-image's full row regardless of delete
	/// state to decide which path to take. SPEC_FULL.md §4.3.
	pub async fn staged_record_by_id(&self, tenant_id: &str, id: Uuid) -> Result<Option<StagedRecord>, IngestError> {
		let row = sqlx::query_as::<_, StagedRecord>(
			r#"
			SELECT id, tenant_id, entity_type, source_id, integration, source_key, config_id,
			       last_seen_execution, payload, fingerprint, previous_fingerprint,
			       created_at, updated_at, deleted_at
			FROM staged_records
			WHERE tenant_id = $1 AND id = $2
			"#,
		)
		.bind(tenant_id)
		.bind(id)
		.fetch_optional(&self.pool)
		.await?;
		Ok(row)
	}

	/// All active staged records for a tenant, oldest first. Used by the
	/// `replay-backlog` CLI operational task (SPEC_FULL.md §1 "ambient
	/// stack") to re-drive the match/merge/relationship pipeline for a
	/// tenant without waiting for new CDC events.
	pub async fn active_staged_records_for_tenant(&self, tenant_id: &str) -> Result<Vec<StagedRecord>, IngestError> {
		let rows = sqlx::query_as::<_, StagedRecord>(
			r#"
			SELECT id, tenant_id, entity_type, source_id, integration, source_key, config_id,
			       last_seen_execution, payload, fingerprint, previous_fingerprint,
			       created_at, updated_at, deleted_at
			FROM staged_records
			WHERE tenant_id = $1 AND deleted_at IS NULL
			ORDER BY created_at ASC
			"#,
		)
		.bind(tenant_id)
		.fetch_all(&self.pool)
		.await?;
		Ok(rows)
	}

	pub async fn deletion_policies(&self, tenant_id: &str, source_key: &str) -> Result<Vec<DeletionPolicy>, IngestError> {
		let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
			"SELECT policy FROM deletion_policies WHERE tenant_id = $1 AND source_key = $2",
		)
		.bind(tenant_id)
		.bind(source_key)
		.fetch_all(&self.pool)
		.await?;
		Ok(rows
			.into_iter()
			.filter_map(|(v,)| serde_json::from_value(v).ok())
			.collect())
	}
}

/// Right-biased shallow merge: top-level keys in `incoming` overwrite
/// `existing`; keys present only in `existing` are kept. SPEC_FULL.md §9
/// "ingest-time payload merge is shallow/right-biased".
fn shallow_merge(existing: &serde_json::Value, incoming: &serde_json::Value) -> serde_json::Value {
	let mut merged = existing.as_object().cloned().unwrap_or_default();
	if let Some(incoming_obj) = incoming.as_object() {
		for (k, v) in incoming_obj {
			merged.insert(k.clone(), v.clone());
		}
	}
	serde_json::Value::Object(merged)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn shallow_merge_is_right_biased_and_shallow() {
		let existing = json!({"name": "Ann", "meta": {"a": 1}});
		let incoming = json!({"email": "a@x", "meta": {"b": 2}});
		let merged = shallow_merge(&existing, &incoming);
		assert_eq!(merged["name"], json!("Ann"));
		assert_eq!(merged["email"], json!("a@x"));
		// shallow: "meta" from incoming fully replaces existing's "meta"
		assert_eq!(merged["meta"], json!({"b": 2}));
	}
}
