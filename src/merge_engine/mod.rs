//! The merge engine: produces/updates golden records per cluster and
//! performs cluster consolidation. See SPEC_FULL.md §4.5.

pub mod repo;
pub mod strategy;

use crate::error::MergeError;
use crate::model::{MatchCandidate, MergedRecord, StagedRecord};
use crate::observability::MetricsRegistry;
use crate::relationship::RelationshipResolver;
use crate::sink::GraphSink;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use strategy::{merge_field, FieldStrategy, MergeConflict, SourcedValue};

pub use repo::{EntitySchema, MergeRepo};

/// Outcome of [`MergeEngine::merge_with_matches`].
#[derive(Debug)]
pub struct MergeOutcome {
	pub merged: MergedRecord,
	pub is_new: bool,
	pub conflicts: Vec<MergeConflict>,
}

pub struct MergeEngine {
	repo: MergeRepo,
	resolver: Arc<RelationshipResolver>,
	sink: Arc<dyn GraphSink>,
	metrics: Arc<MetricsRegistry>,
}

impl MergeEngine {
	pub fn new(
		pool: PgPool,
		resolver: Arc<RelationshipResolver>,
		sink: Arc<dyn GraphSink>,
		metrics: Arc<MetricsRegistry>,
	) -> Self {
		Self {
			repo: MergeRepo::new(pool),
			resolver,
			sink,
			metrics,
		}
	}

	/// SPEC_FULL.md §4.5. `matches` excludes `source` itself. Only
	/// `auto_merge` candidates drive cluster topology; candidates scoring
	/// between `MinMatchScore` and `AutoMergeThreshold` are recorded as
	/// pending review rows instead (SPEC_FULL.md §3 "MatchCandidate", §8
	/// scenario 2) and left untouched by this call.
	pub async fn merge_with_matches(
		&self,
		source: &StagedRecord,
		matches: &[MatchCandidate],
	) -> Result<MergeOutcome, MergeError> {
		let pending: Vec<&MatchCandidate> = matches
			.iter()
			.filter(|m| !m.blocked && !m.auto_merge)
			.collect();
		for candidate in &pending {
			self.repo.upsert_pending_candidate(&source.tenant_id, candidate).await?;
		}

		let auto: Vec<&MatchCandidate> = matches.iter().filter(|m| !m.blocked && m.auto_merge).collect();
		let candidate_ids: Vec<uuid::Uuid> = auto
			.iter()
			.map(|m| m.candidate_staged_record_id)
			.collect();

		self.cluster_with_candidates(source, &candidate_ids).await
	}

	/// Apply a human reviewer's decision to a pending [`MatchCandidate`]
	/// (SPEC_FULL.md §3 status transitions `pending -> approved|rejected`).
	/// Approval runs the same clustering path as an automatic auto-merge;
	/// the review queue's HTTP surface that invokes this is out of scope
	/// (SPEC_FULL.md §1) but the decision itself belongs to the merge engine.
	pub async fn resolve_candidate(
		&self,
		tenant_id: &str,
		candidate_id: uuid::Uuid,
		approve: bool,
	) -> Result<Option<MergeOutcome>, MergeError> {
		let Some(candidate) = self.repo.pending_candidate_by_id(tenant_id, candidate_id).await? else {
			return Ok(None);
		};

		if !approve {
			self.repo.mark_candidate_status(tenant_id, candidate_id, "rejected").await?;
			return Ok(None);
		}

		let source = self
			.repo
			.staged_record_by_id(tenant_id, candidate.staged_record_id)
			.await?
			.ok_or(MergeError::CandidateNotFound(candidate_id))?;

		let outcome = self
			.cluster_with_candidates(&source, &[candidate.candidate_staged_record_id])
			.await?;
		self.repo.mark_candidate_status(tenant_id, candidate_id, "approved").await?;
		Ok(Some(outcome))
	}

	/// Shared clustering path: fold `candidate_ids` (already filtered to
	/// records that should actually merge with `source`) into a single
	/// cluster, consolidating if they currently belong to more than one.
	/// SPEC_FULL.md §4.5 steps 3-4.
	async fn cluster_with_candidates(
		&self,
		source: &StagedRecord,
		candidate_ids: &[uuid::Uuid],
	) -> Result<MergeOutcome, MergeError> {
		let existing_clusters = self
			.repo
			.clusters_for_staged(&source.tenant_id, candidate_ids)
			.await?;
		let mut distinct_cluster_ids: Vec<uuid::Uuid> = existing_clusters
			.values()
			.copied()
			.collect::<std::collections::HashSet<_>>()
			.into_iter()
			.collect();
		distinct_cluster_ids.sort();

		let mut tx = self.repo.begin().await?;

		let merged_id = if distinct_cluster_ids.is_empty() {
			// No matches, or matches whose clusters don't exist yet.
			match self.repo.cluster_for_staged_tx(&mut tx, &source.tenant_id, source.id).await? {
				Some(existing) => existing,
				None => {
					self
						.repo
						.create_merged_tx(&mut tx, source, &source.payload)
						.await?
				}
			}
		} else if distinct_cluster_ids.len() == 1 {
			distinct_cluster_ids[0]
		} else {
			// Cluster consolidation: survivor = oldest by created_at, ties
			// broken by id ascending. SPEC_FULL.md invariant 3 and §8
			// scenario 3.
			self.metrics.merge_consolidations_total.inc();
			let clusters = self
				.repo
				.merged_records_by_ids(&mut tx, &source.tenant_id, &distinct_cluster_ids)
				.await?;
			let survivor = clusters
				.iter()
				.min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
				.map(|r| r.id)
				.expect("distinct_cluster_ids is non-empty");

			for other in clusters.iter().filter(|r| r.id != survivor) {
				self
					.repo
					.move_cluster_members_tx(&mut tx, &source.tenant_id, other.id, survivor)
					.await?;
				self
					.resolver
					.rewire_merged_entity_tx(&mut tx, &source.tenant_id, other.id, survivor)
					.await
					.map_err(|e| MergeError::ConsolidationConflict {
						tenant: source.tenant_id.clone(),
						detail: e.to_string(),
					})?;
				self.repo.soft_delete_merged_tx(&mut tx, &source.tenant_id, other.id).await?;
			}
			survivor
		};

		self
			.repo
			.upsert_cluster_member_tx(&mut tx, &source.tenant_id, merged_id, source.id)
			.await?;

		let already_member = self
			.repo
			.cluster_for_staged_tx(&mut tx, &source.tenant_id, source.id)
			.await?
			== Some(merged_id);
		let is_new_merged = !already_member
			&& self
				.repo
				.member_count_tx(&mut tx, &source.tenant_id, merged_id)
				.await?
				<= 1;

		for candidate_id in candidate_ids {
			self
				.repo
				.upsert_cluster_member_tx(&mut tx, &source.tenant_id, merged_id, *candidate_id)
				.await?;
		}

		let schema = self.repo.entity_schema_tx(&mut tx, &source.tenant_id, &source.entity_type).await?;
		let members = self
			.repo
			.cluster_member_payloads_tx(&mut tx, &source.tenant_id, merged_id)
			.await?;

		let (payload, conflicts) = merge_payload(&schema, &members);
		let source_count = members.len() as i32;

		let merged = self
			.repo
			.update_merged_tx(&mut tx, &source.tenant_id, merged_id, &payload, source_count)
			.await?;

		tx.commit().await.map_err(MergeError::Database)?;

		self.sink.upsert_node(&merged.tenant_id, &merged).await.ok();

		self.metrics.merge_operations_total.inc();
		self.metrics.merge_conflicts_total.inc_by(conflicts.len() as u64);

		Ok(MergeOutcome {
			merged,
			is_new: is_new_merged,
			conflicts,
		})
	}

	/// Drop a staged record from its cluster, re-deriving the golden payload
	/// from the remaining members or soft-deleting the merged record if none
	/// remain. Used by the CDC dispatcher's cascade-cleanup path. SPEC_FULL.md
	/// §4.3.
	pub async fn remove_from_cluster(
		&self,
		tenant_id: &str,
		staged_id: uuid::Uuid,
	) -> Result<Option<RemovalOutcome>, MergeError> {
		let mut tx = self.repo.begin().await?;

		let merged_id = match self.repo.cluster_for_staged_tx(&mut tx, tenant_id, staged_id).await? {
			Some(id) => id,
			None => return Ok(None),
		};

		let entity_type = self
			.repo
			.merged_records_by_ids(&mut tx, tenant_id, &[merged_id])
			.await?
			.into_iter()
			.next()
			.map(|r| r.entity_type)
			.unwrap_or_default();

		self.repo.remove_cluster_member_tx(&mut tx, tenant_id, merged_id, staged_id).await?;
		let remaining = self.repo.member_count_tx(&mut tx, tenant_id, merged_id).await?;

		let emptied = remaining == 0;
		if emptied {
			self.repo.soft_delete_merged_tx(&mut tx, tenant_id, merged_id).await?;
		} else {
			let members = self.repo.cluster_member_payloads_tx(&mut tx, tenant_id, merged_id).await?;
			let schema = self.repo.entity_schema_tx(&mut tx, tenant_id, &entity_type).await?;
			let (payload, _conflicts) = merge_payload(&schema, &members);
			self.repo
				.update_merged_tx(&mut tx, tenant_id, merged_id, &payload, members.len() as i32)
				.await?;
		}

		tx.commit().await.map_err(MergeError::Database)?;

		if emptied {
			self.sink.delete_node(tenant_id, merged_id, &entity_type).await.ok();
		}

		Ok(Some(RemovalOutcome { merged_id, emptied }))
	}
}

/// Outcome of [`MergeEngine::remove_from_cluster`].
#[derive(Debug, Clone, Copy)]
pub struct RemovalOutcome {
	pub merged_id: uuid::Uuid,
	pub emptied: bool,
}

/// Reduce every cluster member's payload fields via the entity's strategy
/// registry. SPEC_FULL.md §4.5 step 4.
fn merge_payload(
	schema: &EntitySchema,
	members: &[(StagedRecord, bool)],
) -> (serde_json::Value, Vec<MergeConflict>) {
	let mut field_names: Vec<String> = Vec::new();
	for (record, _) in members {
		if let serde_json::Value::Object(map) = &record.payload {
			for key in map.keys() {
				if !field_names.contains(key) {
					field_names.push(key.clone());
				}
			}
		}
	}

	let mut payload = serde_json::Map::new();
	let mut conflicts = Vec::new();

	for field in field_names {
		let strategy = schema
			.field_strategies
			.get(&field)
			.copied()
			.unwrap_or(FieldStrategy::PreferNonEmpty);

		let values: Vec<SourcedValue> = members
			.iter()
			.filter_map(|(record, _)| {
				record.payload.get(&field).filter(|v| !v.is_null()).map(|v| SourcedValue {
					value: v.clone(),
					updated_at: record.updated_at,
					integration: record.integration.clone(),
					staged_id: record.id,
				})
			})
			.collect();

		if let Some((value, conflict)) = merge_field(&field, strategy, &schema.source_priority, &values) {
			payload.insert(field, value);
			if let Some(conflict) = conflict {
				conflicts.push(conflict);
			}
		}
	}

	(serde_json::Value::Object(payload), conflicts)
}

pub fn now() -> chrono::DateTime<Utc> {
	Utc::now()
}
