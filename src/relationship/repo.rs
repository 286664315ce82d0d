use crate::error::RelationshipError;
use crate::model::{MergedRelationship, StagedRelationship};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

#[derive(Clone)]
pub struct RelationshipRepo {
	pool: PgPool,
}

impl RelationshipRepo {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}

	pub async fn upsert_edge(
		&self,
		tenant_id: &str,
		id: Uuid,
		relationship_type: &str,
		from_merged: Uuid,
		to_merged: Uuid,
		payload: &serde_json::Value,
	) -> Result<MergedRelationship, RelationshipError> {
		let row = sqlx::query_as::<_, MergedRelationship>(
			r#"
			INSERT INTO merged_relationships
				(id, tenant_id, relationship_type, from_merged_id, to_merged_id, payload, created_at, updated_at)
			VALUES ($1, $2, $3, $4, $5, $6, now(), now())
			ON CONFLICT (id) DO UPDATE SET
				payload = jsonb_strip_nulls(merged_relationships.payload || excluded.payload),
				deleted_at = NULL,
				updated_at = now()
			RETURNING id, tenant_id, relationship_type, from_merged_id, to_merged_id, payload,
			          created_at, updated_at, deleted_at
			"#,
		)
		.bind(id)
		.bind(tenant_id)
		.bind(relationship_type)
		.bind(from_merged)
		.bind(to_merged)
		.bind(payload)
		.fetch_one(&self.pool)
		.await?;
		Ok(row)
	}

	pub async fn upsert_edge_tx(
		&self,
		tx: &mut Transaction<'_, Postgres>,
		tenant_id: &str,
		id: Uuid,
		relationship_type: &str,
		from_merged: Uuid,
		to_merged: Uuid,
		payload: &serde_json::Value,
	) -> Result<(), RelationshipError> {
		sqlx::query(
			r#"
			INSERT INTO merged_relationships
				(id, tenant_id, relationship_type, from_merged_id, to_merged_id, payload, created_at, updated_at)
			VALUES ($1, $2, $3, $4, $5, $6, now(), now())
			ON CONFLICT (id) DO UPDATE SET
				payload = jsonb_strip_nulls(merged_relationships.payload || excluded.payload),
				deleted_at = NULL,
				updated_at = now()
			"#,
		)
		.bind(id)
		.bind(tenant_id)
		.bind(relationship_type)
		.bind(from_merged)
		.bind(to_merged)
		.bind(payload)
		.execute(&mut **tx)
		.await?;
		Ok(())
	}

	pub async fn edges_touching_tx(
		&self,
		tx: &mut Transaction<'_, Postgres>,
		tenant_id: &str,
		merged_id: Uuid,
	) -> Result<Vec<MergedRelationship>, RelationshipError> {
		let rows = sqlx::query_as::<_, MergedRelationship>(
			r#"
			SELECT id, tenant_id, relationship_type, from_merged_id, to_merged_id, payload,
			       created_at, updated_at, deleted_at
			FROM merged_relationships
			WHERE tenant_id = $1 AND deleted_at IS NULL
			  AND (from_merged_id = $2 OR to_merged_id = $2)
			"#,
		)
		.bind(tenant_id)
		.bind(merged_id)
		.fetch_all(&mut **tx)
		.await?;
		Ok(rows)
	}

	pub async fn move_relationship_cluster_members_tx(
		&self,
		tx: &mut Transaction<'_, Postgres>,
		tenant_id: &str,
		from_edge_id: Uuid,
		to_edge_id: Uuid,
	) -> Result<(), RelationshipError> {
		sqlx::query(
			r#"
			UPDATE relationship_clusters SET merged_relationship_id = $3
			WHERE tenant_id = $1 AND merged_relationship_id = $2 AND removed_at IS NULL
			"#,
		)
		.bind(tenant_id)
		.bind(from_edge_id)
		.bind(to_edge_id)
		.execute(&mut **tx)
		.await?;
		Ok(())
	}

	pub async fn soft_delete_edge_tx(
		&self,
		tx: &mut Transaction<'_, Postgres>,
		tenant_id: &str,
		edge_id: Uuid,
	) -> Result<(), RelationshipError> {
		sqlx::query("UPDATE merged_relationships SET deleted_at = now() WHERE tenant_id = $1 AND id = $2")
			.bind(tenant_id)
			.bind(edge_id)
			.execute(&mut **tx)
			.await?;
		Ok(())
	}

	pub async fn cascade_delete_edges(&self, tenant_id: &str, merged_id: Uuid) -> Result<usize, RelationshipError> {
		let result = sqlx::query(
			r#"
			UPDATE merged_relationships SET deleted_at = now()
			WHERE tenant_id = $1 AND deleted_at IS NULL AND (from_merged_id = $2 OR to_merged_id = $2)
			"#,
		)
		.bind(tenant_id)
		.bind(merged_id)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected() as usize)
	}

	pub async fn incomplete_relationships(
		&self,
		tenant_id: &str,
		entity_type: &str,
		source_id: &str,
		integration: &str,
	) -> Result<Vec<StagedRelationship>, RelationshipError> {
		let rows = sqlx::query_as::<_, StagedRelationship>(
			r#"
			SELECT id, tenant_id, relationship_type, from_entity_type, from_source_id, from_integration,
			       to_entity_type, to_source_id, to_integration, criteria_id, from_staged_entity_id,
			       to_staged_entity_id, config_id, last_seen_execution, payload, created_at, updated_at, deleted_at
			FROM staged_relationships
			WHERE tenant_id = $1 AND deleted_at IS NULL
			  AND (from_staged_entity_id IS NULL OR to_staged_entity_id IS NULL)
			  AND (
			    (from_entity_type = $2 AND from_source_id = $3 AND from_integration = $4)
			    OR (to_entity_type = $2 AND to_source_id = $3 AND to_integration = $4)
			  )
			"#,
		)
		.bind(tenant_id)
		.bind(entity_type)
		.bind(source_id)
		.bind(integration)
		.fetch_all(&self.pool)
		.await?;
		Ok(rows)
	}

	/// Fill in `staged_record_id` on exactly the sides flagged by `from`/`to`
	/// (whichever the caller has determined actually match this record's
	/// identity triple), leaving any other still-unresolved side untouched.
	pub async fn resolve_endpoint(
		&self,
		tenant_id: &str,
		relationship_id: Uuid,
		staged_record_id: Uuid,
		from: bool,
		to: bool,
	) -> Result<StagedRelationship, RelationshipError> {
		let row = sqlx::query_as::<_, StagedRelationship>(
			r#"
			UPDATE staged_relationships
			SET from_staged_entity_id = CASE WHEN from_staged_entity_id IS NULL AND $3
			      THEN $4 ELSE from_staged_entity_id END,
			    to_staged_entity_id = CASE WHEN to_staged_entity_id IS NULL AND $5
			      THEN $4 ELSE to_staged_entity_id END,
			    updated_at = now()
			WHERE tenant_id = $1 AND id = $2
			RETURNING id, tenant_id, relationship_type, from_entity_type, from_source_id, from_integration,
			          to_entity_type, to_source_id, to_integration, criteria_id, from_staged_entity_id,
			          to_staged_entity_id, config_id, last_seen_execution, payload, created_at, updated_at, deleted_at
			"#,
		)
		.bind(tenant_id)
		.bind(relationship_id)
		.bind(from)
		.bind(staged_record_id)
		.bind(to)
		.fetch_one(&self.pool)
		.await?;
		Ok(row)
	}

	pub async fn merged_for_staged(&self, tenant_id: &str, staged_id: Uuid) -> Result<Option<Uuid>, RelationshipError> {
		let row: Option<(Uuid,)> = sqlx::query_as(
			"SELECT merged_record_id FROM entity_clusters WHERE tenant_id = $1 AND staged_record_id = $2 AND removed_at IS NULL",
		)
		.bind(tenant_id)
		.bind(staged_id)
		.fetch_optional(&self.pool)
		.await?;
		Ok(row.map(|(id,)| id))
	}

	pub async fn upsert_relationship_cluster(
		&self,
		tenant_id: &str,
		merged_relationship_id: Uuid,
		staged_relationship_id: Uuid,
	) -> Result<(), RelationshipError> {
		sqlx::query(
			r#"
			INSERT INTO relationship_clusters (id, tenant_id, merged_relationship_id, staged_relationship_id, added_at, removed_at)
			VALUES ($1, $2, $3, $4, now(), NULL)
			ON CONFLICT (tenant_id, staged_relationship_id) DO UPDATE SET
				merged_relationship_id = excluded.merged_relationship_id, removed_at = NULL
			"#,
		)
		.bind(Uuid::new_v4())
		.bind(tenant_id)
		.bind(merged_relationship_id)
		.bind(staged_relationship_id)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	pub async fn backfill_criteria_matches(&self, tenant_id: &str, criteria_id: Uuid) -> Result<usize, RelationshipError> {
		let criteria: (String, String, String, String, String, String, serde_json::Value) = sqlx::query_as(
			r#"
			SELECT relationship_type, from_entity_type, from_source_id, from_integration,
			       to_entity_type, to_integration, criteria
			FROM staged_relationship_criteria
			WHERE tenant_id = $1 AND id = $2
			"#,
		)
		.bind(tenant_id)
		.bind(criteria_id)
		.fetch_one(&self.pool)
		.await?;
		let (rel_type, from_type, from_source_id, from_integration, to_type, to_integration, criteria_json) = criteria;
		let predicate: crate::model::Criteria = serde_json::from_value(criteria_json)
			.map_err(|e| RelationshipError::InvalidCriteria(criteria_id, e))?;

		let candidates: Vec<(Uuid, serde_json::Value)> = sqlx::query_as(
			"SELECT id, payload FROM staged_records WHERE tenant_id = $1 AND entity_type = $2 AND integration = $3 AND deleted_at IS NULL",
		)
		.bind(tenant_id)
		.bind(&to_type)
		.bind(&to_integration)
		.fetch_all(&self.pool)
		.await?;

		let mut inserted = 0;
		for (to_staged_id, payload) in candidates {
			if !predicate.matches(&payload) {
				continue;
			}
			let id = crate::relationship::staged_relationship_id(
				tenant_id,
				&rel_type,
				&format!("{from_type}|{from_source_id}|{from_integration}"),
				&format!("criteria:{to_staged_id}"),
				"criteria-backfill",
			);
			sqlx::query(
				r#"
				INSERT INTO staged_relationships
					(id, tenant_id, relationship_type, from_entity_type, from_source_id, from_integration,
					 to_entity_type, to_source_id, to_integration, criteria_id, to_staged_entity_id,
					 config_id, payload, created_at, updated_at)
				VALUES ($1, $2, $3, $4, $5, $6, $7, NULL, $8, $9, $10, 'criteria-backfill', '{}'::jsonb, now(), now())
				ON CONFLICT (id) DO NOTHING
				"#,
			)
			.bind(id)
			.bind(tenant_id)
			.bind(&rel_type)
			.bind(&from_type)
			.bind(&from_source_id)
			.bind(&from_integration)
			.bind(&to_type)
			.bind(&to_integration)
			.bind(criteria_id)
			.bind(to_staged_id)
			.execute(&self.pool)
			.await?;
			inserted += 1;
		}
		Ok(inserted)
	}

	/// Mark a staged relationship's cluster membership removed, e.g. when
	/// the staged relationship itself is soft-deleted. Does not touch the
	/// golden edge; that only cascades from a merged-record soft-delete
	/// (SPEC_FULL.md §4.6 "Cascade delete").
	pub async fn remove_cluster_member(&self, tenant_id: &str, staged_relationship_id: Uuid) -> Result<(), RelationshipError> {
		sqlx::query(
			"UPDATE relationship_clusters SET removed_at = now() WHERE tenant_id = $1 AND staged_relationship_id = $2 AND removed_at IS NULL",
		)
		.bind(tenant_id)
		.bind(staged_relationship_id)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	pub async fn staged_relationship_by_id(
		&self,
		tenant_id: &str,
		id: Uuid,
	) -> Result<Option<StagedRelationship>, RelationshipError> {
		let row = sqlx::query_as::<_, StagedRelationship>(
			r#"
			SELECT id, tenant_id, relationship_type, from_entity_type, from_source_id, from_integration,
			       to_entity_type, to_source_id, to_integration, criteria_id, from_staged_entity_id,
			       to_staged_entity_id, config_id, last_seen_execution, payload, created_at, updated_at, deleted_at
			FROM staged_relationships WHERE tenant_id = $1 AND id = $2
			"#,
		)
		.bind(tenant_id)
		.bind(id)
		.fetch_optional(&self.pool)
		.await?;
		Ok(row)
	}
}
