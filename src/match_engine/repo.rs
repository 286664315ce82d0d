use crate::error::MatchError;
use crate::model::{MatchFieldRow, MatchRule, StagedRecord};
use sqlx::PgPool;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Clone)]
pub struct MatchRepo {
	pool: PgPool,
}

impl MatchRepo {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}

	pub async fn active_rules(
		&self,
		tenant_id: &str,
		entity_type: &str,
	) -> Result<Vec<MatchRule>, MatchError> {
		let rules = sqlx::query_as::<_, MatchRule>(
			r#"
			SELECT id, tenant_id, entity_type, name, priority, active, score_weight, conditions
			FROM match_rules
			WHERE tenant_id = $1 AND entity_type = $2 AND active = true
			ORDER BY priority DESC
			"#,
		)
		.bind(tenant_id)
		.bind(entity_type)
		.fetch_all(&self.pool)
		.await?;
		Ok(rules)
	}

	pub async fn index_rows_for(
		&self,
		tenant_id: &str,
		staged_record_id: Uuid,
	) -> Result<Vec<MatchFieldRow>, MatchError> {
		let rows = sqlx::query_as::<_, MatchFieldRow>(
			r#"
			SELECT id, tenant_id, entity_type, staged_record_id, field_name, match_type,
			       normalizer, value_text, token, value_num, value_ts
			FROM match_field_index
			WHERE tenant_id = $1 AND staged_record_id = $2
			"#,
		)
		.bind(tenant_id)
		.bind(staged_record_id)
		.fetch_all(&self.pool)
		.await?;
		Ok(rows)
	}

	pub async fn index_rows_for_many(
		&self,
		tenant_id: &str,
		ids: &HashSet<Uuid>,
	) -> Result<Vec<MatchFieldRow>, MatchError> {
		let ids: Vec<Uuid> = ids.iter().copied().collect();
		let rows = sqlx::query_as::<_, MatchFieldRow>(
			r#"
			SELECT id, tenant_id, entity_type, staged_record_id, field_name, match_type,
			       normalizer, value_text, token, value_num, value_ts
			FROM match_field_index
			WHERE tenant_id = $1 AND staged_record_id = ANY($2)
			"#,
		)
		.bind(tenant_id)
		.bind(&ids)
		.fetch_all(&self.pool)
		.await?;
		Ok(rows)
	}

	/// Replace every index row for `record` with `rows`, atomically.
	pub async fn replace_index_rows(
		&self,
		record: &StagedRecord,
		rows: Vec<MatchFieldRow>,
	) -> Result<(), MatchError> {
		let mut tx = self.pool.begin().await?;
		sqlx::query("DELETE FROM match_field_index WHERE tenant_id = $1 AND staged_record_id = $2")
			.bind(&record.tenant_id)
			.bind(record.id)
			.execute(&mut *tx)
			.await?;

		for row in rows {
			sqlx::query(
				r#"
				INSERT INTO match_field_index
					(id, tenant_id, entity_type, staged_record_id, field_name, match_type,
					 normalizer, value_text, token, value_num, value_ts)
				VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
				"#,
			)
			.bind(row.id)
			.bind(row.tenant_id)
			.bind(row.entity_type)
			.bind(row.staged_record_id)
			.bind(row.field_name)
			.bind(row.match_type)
			.bind(row.normalizer)
			.bind(row.value_text)
			.bind(row.token)
			.bind(row.value_num)
			.bind(row.value_ts)
			.execute(&mut *tx)
			.await?;
		}

		tx.commit().await?;
		Ok(())
	}

	/// Candidate ids whose index rows match every (field, value) pair via
	/// exact text or phonetic token equality, ANDed together.
	pub async fn candidates_by_indexable(
		&self,
		tenant_id: &str,
		entity_type: &str,
		lookups: &[(String, Option<String>)],
		cap: usize,
	) -> Result<HashSet<Uuid>, MatchError> {
		let mut result: Option<HashSet<Uuid>> = None;
		for (field, value) in lookups {
			let Some(value) = value else { continue };
			let rows: Vec<(Uuid,)> = sqlx::query_as(
				r#"
				SELECT staged_record_id FROM match_field_index
				WHERE tenant_id = $1 AND entity_type = $2 AND field_name = $3
				  AND (value_text = $4 OR token = $4)
				LIMIT $5
				"#,
			)
			.bind(tenant_id)
			.bind(entity_type)
			.bind(field)
			.bind(value)
			.bind(cap as i64)
			.fetch_all(&self.pool)
			.await?;
			let ids: HashSet<Uuid> = rows.into_iter().map(|(id,)| id).collect();
			result = Some(match result {
				Some(existing) => existing.intersection(&ids).copied().collect(),
				None => ids,
			});
		}
		Ok(result.unwrap_or_default())
	}

	/// Candidate ids for a fuzzy anchor field, filtered to those whose
	/// trigram similarity against `text` is above `threshold`. Because
	/// similarity is computed application-side, this first fetches every
	/// indexed value for the field (bounded by `cap`) and filters locally;
	/// a production deployment replaces this with a `pg_trgm` `%` operator
	/// query evaluated in the database.
	pub async fn candidates_by_fuzzy(
		&self,
		tenant_id: &str,
		entity_type: &str,
		field: &str,
		text: &str,
		threshold: f64,
		cap: usize,
	) -> Result<HashSet<Uuid>, MatchError> {
		let rows: Vec<(Uuid, Option<String>)> = sqlx::query_as(
			r#"
			SELECT staged_record_id, value_text FROM match_field_index
			WHERE tenant_id = $1 AND entity_type = $2 AND field_name = $3 AND match_type = 'fuzzy'
			LIMIT $4
			"#,
		)
		.bind(tenant_id)
		.bind(entity_type)
		.bind(field)
		.bind(cap as i64)
		.fetch_all(&self.pool)
		.await?;

		let source_trigrams = crate::normalize::trigrams(text);
		let mut out = HashSet::new();
		for (id, value_text) in rows {
			if let Some(value_text) = value_text {
				let sim = crate::normalize::trigram_similarity(
					&source_trigrams,
					&crate::normalize::trigrams(&value_text),
				);
				if sim >= threshold {
					out.insert(id);
				}
			}
		}
		Ok(out)
	}
}
