use crate::error::MergeError;
use crate::merge_engine::strategy::FieldStrategy;
use crate::model::{CandidateStatus, MatchCandidate, MergedRecord, StagedRecord};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

/// Per-entity-type field merge configuration, loaded from the match-rule
/// store's sibling `entity_schemas` table.
#[derive(Debug, Clone, Default)]
pub struct EntitySchema {
	pub field_strategies: HashMap<String, FieldStrategy>,
	pub source_priority: HashMap<String, i32>,
}

#[derive(Clone)]
pub struct MergeRepo {
	pool: PgPool,
}

impl MergeRepo {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}

	pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, MergeError> {
		Ok(self.pool.begin().await?)
	}

	pub async fn clusters_for_staged(
		&self,
		tenant_id: &str,
		staged_ids: &[Uuid],
	) -> Result<HashMap<Uuid, Uuid>, MergeError> {
		if staged_ids.is_empty() {
			return Ok(HashMap::new());
		}
		let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
			r#"
			SELECT staged_record_id, merged_record_id FROM entity_clusters
			WHERE tenant_id = $1 AND staged_record_id = ANY($2) AND removed_at IS NULL
			"#,
		)
		.bind(tenant_id)
		.bind(staged_ids)
		.fetch_all(&self.pool)
		.await?;
		Ok(rows.into_iter().collect())
	}

	pub async fn cluster_for_staged_tx(
		&self,
		tx: &mut Transaction<'_, Postgres>,
		tenant_id: &str,
		staged_id: Uuid,
	) -> Result<Option<Uuid>, MergeError> {
		let row: Option<(Uuid,)> = sqlx::query_as(
			r#"
			SELECT merged_record_id FROM entity_clusters
			WHERE tenant_id = $1 AND staged_record_id = $2 AND removed_at IS NULL
			"#,
		)
		.bind(tenant_id)
		.bind(staged_id)
		.fetch_optional(&mut **tx)
		.await?;
		Ok(row.map(|(id,)| id))
	}

	pub async fn create_merged_tx(
		&self,
		tx: &mut Transaction<'_, Postgres>,
		source: &StagedRecord,
		payload: &serde_json::Value,
	) -> Result<Uuid, MergeError> {
		let id = Uuid::new_v4();
		sqlx::query(
			r#"
			INSERT INTO merged_records
				(id, tenant_id, entity_type, payload, source_count, primary_source_id, version, created_at, updated_at)
			VALUES ($1, $2, $3, $4, 1, $5, 1, now(), now())
			"#,
		)
		.bind(id)
		.bind(&source.tenant_id)
		.bind(&source.entity_type)
		.bind(payload)
		.bind(source.id)
		.execute(&mut **tx)
		.await?;
		Ok(id)
	}

	pub async fn merged_records_by_ids(
		&self,
		tx: &mut Transaction<'_, Postgres>,
		tenant_id: &str,
		ids: &[Uuid],
	) -> Result<Vec<MergedRecord>, MergeError> {
		let rows = sqlx::query_as::<_, MergedRecord>(
			r#"
			SELECT id, tenant_id, entity_type, payload, source_count, primary_source_id,
			       version, created_at, updated_at, deleted_at
			FROM merged_records
			WHERE tenant_id = $1 AND id = ANY($2)
			"#,
		)
		.bind(tenant_id)
		.bind(ids)
		.fetch_all(&mut **tx)
		.await?;
		Ok(rows)
	}

	pub async fn move_cluster_members_tx(
		&self,
		tx: &mut Transaction<'_, Postgres>,
		tenant_id: &str,
		from_merged_id: Uuid,
		to_merged_id: Uuid,
	) -> Result<(), MergeError> {
		sqlx::query(
			r#"
			UPDATE entity_clusters SET merged_record_id = $3
			WHERE tenant_id = $1 AND merged_record_id = $2 AND removed_at IS NULL
			"#,
		)
		.bind(tenant_id)
		.bind(from_merged_id)
		.bind(to_merged_id)
		.execute(&mut **tx)
		.await?;
		Ok(())
	}

	pub async fn soft_delete_merged_tx(
		&self,
		tx: &mut Transaction<'_, Postgres>,
		tenant_id: &str,
		merged_id: Uuid,
	) -> Result<(), MergeError> {
		sqlx::query(
			"UPDATE merged_records SET deleted_at = now(), source_count = 0 WHERE tenant_id = $1 AND id = $2",
		)
		.bind(tenant_id)
		.bind(merged_id)
		.execute(&mut **tx)
		.await?;
		Ok(())
	}

	pub async fn upsert_cluster_member_tx(
		&self,
		tx: &mut Transaction<'_, Postgres>,
		tenant_id: &str,
		merged_id: Uuid,
		staged_id: Uuid,
	) -> Result<(), MergeError> {
		sqlx::query(
			r#"
			INSERT INTO entity_clusters (id, tenant_id, merged_record_id, staged_record_id, is_primary, added_at, removed_at)
			VALUES ($1, $2, $3, $4, false, now(), NULL)
			ON CONFLICT (tenant_id, merged_record_id, staged_record_id)
			DO UPDATE SET removed_at = NULL
			"#,
		)
		.bind(Uuid::new_v4())
		.bind(tenant_id)
		.bind(merged_id)
		.bind(staged_id)
		.execute(&mut **tx)
		.await?;
		Ok(())
	}

	pub async fn remove_cluster_member_tx(
		&self,
		tx: &mut Transaction<'_, Postgres>,
		tenant_id: &str,
		merged_id: Uuid,
		staged_id: Uuid,
	) -> Result<(), MergeError> {
		sqlx::query(
			r#"
			UPDATE entity_clusters SET removed_at = now()
			WHERE tenant_id = $1 AND merged_record_id = $2 AND staged_record_id = $3 AND removed_at IS NULL
			"#,
		)
		.bind(tenant_id)
		.bind(merged_id)
		.bind(staged_id)
		.execute(&mut **tx)
		.await?;
		Ok(())
	}

	pub async fn member_count_tx(
		&self,
		tx: &mut Transaction<'_, Postgres>,
		tenant_id: &str,
		merged_id: Uuid,
	) -> Result<i64, MergeError> {
		let (count,): (i64,) = sqlx::query_as(
			"SELECT COUNT(*) FROM entity_clusters WHERE tenant_id = $1 AND merged_record_id = $2 AND removed_at IS NULL",
		)
		.bind(tenant_id)
		.bind(merged_id)
		.fetch_one(&mut **tx)
		.await?;
		Ok(count)
	}

	pub async fn entity_schema_tx(
		&self,
		tx: &mut Transaction<'_, Postgres>,
		tenant_id: &str,
		entity_type: &str,
	) -> Result<EntitySchema, MergeError> {
		let rows: Vec<(String, String)> = sqlx::query_as(
			"SELECT field_name, strategy FROM entity_field_strategies WHERE tenant_id = $1 AND entity_type = $2",
		)
		.bind(tenant_id)
		.bind(entity_type)
		.fetch_all(&mut **tx)
		.await?;
		let field_strategies = rows
			.into_iter()
			.map(|(field, strategy)| (field, FieldStrategy::from_name(&strategy)))
			.collect();

		let priority_rows: Vec<(String, i32)> = sqlx::query_as(
			"SELECT integration, priority FROM source_priorities WHERE tenant_id = $1",
		)
		.bind(tenant_id)
		.fetch_all(&mut **tx)
		.await?;
		let source_priority = priority_rows.into_iter().collect();

		Ok(EntitySchema {
			field_strategies,
			source_priority,
		})
	}

	pub async fn cluster_member_payloads_tx(
		&self,
		tx: &mut Transaction<'_, Postgres>,
		tenant_id: &str,
		merged_id: Uuid,
	) -> Result<Vec<(StagedRecord, bool)>, MergeError> {
		let rows = sqlx::query_as::<_, ClusterMemberRow>(
			r#"
			SELECT s.id, s.tenant_id, s.entity_type, s.source_id, s.integration, s.source_key,
			       s.config_id, s.last_seen_execution, s.payload, s.fingerprint, s.previous_fingerprint,
			       s.created_at, s.updated_at, s.deleted_at, c.is_primary
			FROM entity_clusters c
			JOIN staged_records s ON s.id = c.staged_record_id AND s.tenant_id = c.tenant_id
			WHERE c.tenant_id = $1 AND c.merged_record_id = $2 AND c.removed_at IS NULL AND s.deleted_at IS NULL
			ORDER BY c.added_at ASC
			"#,
		)
		.bind(tenant_id)
		.bind(merged_id)
		.fetch_all(&mut **tx)
		.await?;
		Ok(rows.into_iter().map(ClusterMemberRow::split).collect())
	}

	pub async fn update_merged_tx(
		&self,
		tx: &mut Transaction<'_, Postgres>,
		tenant_id: &str,
		merged_id: Uuid,
		payload: &serde_json::Value,
		source_count: i32,
	) -> Result<MergedRecord, MergeError> {
		let record = sqlx::query_as::<_, MergedRecord>(
			r#"
			UPDATE merged_records
			SET payload = $3, source_count = $4, version = version + 1, updated_at = now(), deleted_at = NULL
			WHERE tenant_id = $1 AND id = $2
			RETURNING id, tenant_id, entity_type, payload, source_count, primary_source_id,
			          version, created_at, updated_at, deleted_at
			"#,
		)
		.bind(tenant_id)
		.bind(merged_id)
		.bind(payload)
		.bind(source_count)
		.fetch_one(&mut **tx)
		.await?;
		Ok(record)
	}

	/// Insert or refresh a pending review row for a non-blocked,
	/// sub-auto-merge candidate. Idempotent on `(tenant, staged_record_id,
	/// candidate_staged_record_id)`; a human decision already recorded
	/// (approved/rejected/deferred) is never overwritten by a later replay.
	/// SPEC_FULL.md §3 "MatchCandidate".
	pub async fn upsert_pending_candidate(
		&self,
		tenant_id: &str,
		candidate: &MatchCandidate,
	) -> Result<(), MergeError> {
		sqlx::query(
			r#"
			INSERT INTO match_candidates
				(id, tenant_id, staged_record_id, candidate_staged_record_id, score, rule_matched, status, created_at)
			VALUES ($1, $2, $3, $4, $5, $6, 'pending', now())
			ON CONFLICT (tenant_id, staged_record_id, candidate_staged_record_id)
			DO UPDATE SET score = excluded.score, rule_matched = excluded.rule_matched
			WHERE match_candidates.status = 'pending'
			"#,
		)
		.bind(candidate.id)
		.bind(tenant_id)
		.bind(candidate.staged_record_id)
		.bind(candidate.candidate_staged_record_id)
		.bind(candidate.score)
		.bind(&candidate.rule_matched)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	pub async fn pending_candidate_by_id(
		&self,
		tenant_id: &str,
		candidate_id: Uuid,
	) -> Result<Option<MatchCandidate>, MergeError> {
		let row = sqlx::query_as::<_, MatchCandidateRow>(
			r#"
			SELECT id, staged_record_id, candidate_staged_record_id, score, rule_matched, status
			FROM match_candidates
			WHERE tenant_id = $1 AND id = $2 AND status = 'pending'
			"#,
		)
		.bind(tenant_id)
		.bind(candidate_id)
		.fetch_optional(&self.pool)
		.await?;
		Ok(row.map(MatchCandidateRow::into_model))
	}

	pub async fn mark_candidate_status(
		&self,
		tenant_id: &str,
		candidate_id: Uuid,
		status: &str,
	) -> Result<(), MergeError> {
		sqlx::query("UPDATE match_candidates SET status = $3 WHERE tenant_id = $1 AND id = $2")
			.bind(tenant_id)
			.bind(candidate_id)
			.bind(status)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	pub async fn staged_record_by_id(
		&self,
		tenant_id: &str,
		staged_id: Uuid,
	) -> Result<Option<StagedRecord>, MergeError> {
		let record = sqlx::query_as::<_, StagedRecord>(
			r#"
			SELECT id, tenant_id, entity_type, source_id, integration, source_key, config_id,
			       last_seen_execution, payload, fingerprint, previous_fingerprint,
			       created_at, updated_at, deleted_at
			FROM staged_records
			WHERE tenant_id = $1 AND id = $2 AND deleted_at IS NULL
			"#,
		)
		.bind(tenant_id)
		.bind(staged_id)
		.fetch_optional(&self.pool)
		.await?;
		Ok(record)
	}
}

#[derive(sqlx::FromRow)]
struct MatchCandidateRow {
	id: Uuid,
	staged_record_id: Uuid,
	candidate_staged_record_id: Uuid,
	score: f64,
	rule_matched: Option<String>,
	status: String,
}

impl MatchCandidateRow {
	fn into_model(self) -> MatchCandidate {
		MatchCandidate {
			id: self.id,
			staged_record_id: self.staged_record_id,
			candidate_staged_record_id: self.candidate_staged_record_id,
			score: self.score,
			blocked: false,
			rule_matched: self.rule_matched,
			auto_merge: false,
			status: match self.status.as_str() {
				"approved" => CandidateStatus::Approved,
				"rejected" => CandidateStatus::Rejected,
				"deferred" => CandidateStatus::Deferred,
				"auto_merged" => CandidateStatus::AutoMerged,
				_ => CandidateStatus::Pending,
			},
		}
	}
}

#[derive(sqlx::FromRow)]
struct ClusterMemberRow {
	id: Uuid,
	tenant_id: String,
	entity_type: String,
	source_id: String,
	integration: String,
	source_key: String,
	config_id: String,
	last_seen_execution: Option<String>,
	payload: serde_json::Value,
	fingerprint: String,
	previous_fingerprint: Option<String>,
	created_at: chrono::DateTime<chrono::Utc>,
	updated_at: chrono::DateTime<chrono::Utc>,
	deleted_at: Option<chrono::DateTime<chrono::Utc>>,
	is_primary: bool,
}

impl ClusterMemberRow {
	fn split(self) -> (StagedRecord, bool) {
		(
			StagedRecord {
				id: self.id,
				tenant_id: self.tenant_id,
				entity_type: self.entity_type,
				source_id: self.source_id,
				integration: self.integration,
				source_key: self.source_key,
				config_id: self.config_id,
				last_seen_execution: self.last_seen_execution,
				payload: self.payload,
				fingerprint: self.fingerprint,
				previous_fingerprint: self.previous_fingerprint,
				created_at: self.created_at,
				updated_at: self.updated_at,
				deleted_at: self.deleted_at,
			},
			self.is_primary,
		)
	}
}
