//! The relationship resolver: maintains golden edges in lockstep with
//! golden records, including deterministic ids and rewiring on cluster
//! consolidation. See SPEC_FULL.md §4.6. Grounded on the teacher's
//! `age_client.rs` sink-over-raw-SQL idiom, generalized into a small
//! repository plus a deterministic-id helper.

pub mod repo;

use crate::error::RelationshipError;
use crate::model::{MergedRelationship, StagedRelationship};
use crate::observability::MetricsRegistry;
use crate::sink::GraphSink;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use uuid::Uuid;

pub use repo::RelationshipRepo;

/// Fixed namespace UUID for this service's deterministic relationship ids.
/// Any stable UUID works; this one has no special meaning beyond being
/// constant across the codebase.
const NAMESPACE: Uuid = Uuid::from_bytes([
	0x6b, 0xa7, 0xb8, 0x14, 0x9d, 0xad, 0x11, 0xd1, 0x80, 0xb4, 0x00, 0xc0, 0x4f, 0xd4, 0x30, 0xc8,
]);

/// `uuidv5(namespace, "tenant|type|from-merged|to-merged")`. SPEC_FULL.md
/// invariant 3.
pub fn golden_edge_id(tenant_id: &str, relationship_type: &str, from_merged: Uuid, to_merged: Uuid) -> Uuid {
	let name = format!("{tenant_id}|{relationship_type}|{from_merged}|{to_merged}");
	Uuid::new_v5(&NAMESPACE, name.as_bytes())
}

/// `uuidv5(namespace, "tenant|type|from-triple|to-triple|config")`.
/// SPEC_FULL.md invariant 6.
pub fn staged_relationship_id(
	tenant_id: &str,
	relationship_type: &str,
	from_triple: &str,
	to_triple: &str,
	config_id: &str,
) -> Uuid {
	let name = format!("{tenant_id}|{relationship_type}|{from_triple}|{to_triple}|{config_id}");
	Uuid::new_v5(&NAMESPACE, name.as_bytes())
}

pub struct RelationshipResolver {
	repo: RelationshipRepo,
	sink: Arc<dyn GraphSink>,
	metrics: Arc<MetricsRegistry>,
}

impl RelationshipResolver {
	pub fn new(pool: PgPool, sink: Arc<dyn GraphSink>, metrics: Arc<MetricsRegistry>) -> Self {
		Self {
			repo: RelationshipRepo::new(pool),
			sink,
			metrics,
		}
	}

	/// Insert-or-update a golden edge, merging payload via right-biased
	/// strip-nulls union. SPEC_FULL.md §4.6 "Upsert".
	pub async fn upsert(
		&self,
		tenant_id: &str,
		relationship_type: &str,
		from_merged: Uuid,
		to_merged: Uuid,
		payload: serde_json::Value,
	) -> Result<MergedRelationship, RelationshipError> {
		let id = golden_edge_id(tenant_id, relationship_type, from_merged, to_merged);
		let edge = self
			.repo
			.upsert_edge(tenant_id, id, relationship_type, from_merged, to_merged, &payload)
			.await?;
		self.sink.upsert_edge(tenant_id, &edge).await.ok();
		self.metrics.relationship_edges_upserted_total.inc();
		Ok(edge)
	}

	/// Resolve any staged relationships whose from/to triple now matches a
	/// newly-merged record's identity, and upsert golden edges once both
	/// sides are known. SPEC_FULL.md §4.6 "Resolve late endpoints".
	pub async fn resolve_late_endpoints(
		&self,
		tenant_id: &str,
		entity_type: &str,
		source_id: &str,
		integration: &str,
		staged_record_id: Uuid,
		merged_record_id: Uuid,
	) -> Result<usize, RelationshipError> {
		let pending = self
			.repo
			.incomplete_relationships(tenant_id, entity_type, source_id, integration)
			.await?;

		let mut resolved = 0;
		for rel in pending {
			let matches_from = rel.from_entity_type == entity_type
				&& rel.from_source_id == source_id
				&& rel.from_integration == integration;
			let matches_to = rel.to_entity_type == entity_type
				&& rel.to_source_id.as_deref() == Some(source_id)
				&& rel.to_integration.as_deref() == Some(integration);
			if !matches_from && !matches_to {
				continue;
			}

			let rel = self
				.repo
				.resolve_endpoint(tenant_id, rel.id, staged_record_id, matches_from, matches_to)
				.await?;
			if let (Some(from_id), Some(to_id)) = (rel.from_staged_entity_id, rel.to_staged_entity_id) {
				let from_merged = if rel.from_staged_entity_id == Some(staged_record_id) {
					Some(merged_record_id)
				} else {
					self.repo.merged_for_staged(tenant_id, from_id).await?
				};
				let to_merged = if rel.to_staged_entity_id == Some(staged_record_id) {
					Some(merged_record_id)
				} else {
					self.repo.merged_for_staged(tenant_id, to_id).await?
				};
				if let (Some(from_merged), Some(to_merged)) = (from_merged, to_merged) {
					let edge = self
						.upsert(tenant_id, &rel.relationship_type, from_merged, to_merged, rel.payload.clone())
						.await?;
					self.repo.upsert_relationship_cluster(tenant_id, edge.id, rel.id).await?;
					resolved += 1;
				}
			}
		}
		self.metrics.relationship_late_endpoints_resolved_total.inc_by(resolved as u64);
		Ok(resolved)
	}

	/// Rewire every active edge touching `from_merged` to instead touch
	/// `to_merged`, moving relationship-cluster membership along with it.
	/// SPEC_FULL.md §4.6 "RewireMergedEntity"; invariant 3.
	pub async fn rewire_merged_entity_tx(
		&self,
		tx: &mut Transaction<'_, Postgres>,
		tenant_id: &str,
		from_merged: Uuid,
		to_merged: Uuid,
	) -> Result<usize, RelationshipError> {
		let edges = self.repo.edges_touching_tx(tx, tenant_id, from_merged).await?;
		let mut count = 0;
		for edge in edges {
			let new_from = if edge.from_merged_id == from_merged { to_merged } else { edge.from_merged_id };
			let new_to = if edge.to_merged_id == from_merged { to_merged } else { edge.to_merged_id };
			let new_id = golden_edge_id(tenant_id, &edge.relationship_type, new_from, new_to);

			self
				.repo
				.upsert_edge_tx(tx, tenant_id, new_id, &edge.relationship_type, new_from, new_to, &edge.payload)
				.await?;

			if new_id != edge.id {
				self
					.repo
					.move_relationship_cluster_members_tx(tx, tenant_id, edge.id, new_id)
					.await?;
				self.repo.soft_delete_edge_tx(tx, tenant_id, edge.id).await?;
			}
			count += 1;
		}
		self.metrics.relationship_rewires_total.inc_by(count as u64);
		Ok(count)
	}

	/// Soft-delete every merged edge touching a soft-deleted merged record.
	/// SPEC_FULL.md §4.6 "Cascade delete".
	pub async fn cascade_delete(&self, tenant_id: &str, merged_id: Uuid) -> Result<usize, RelationshipError> {
		self.repo.cascade_delete_edges(tenant_id, merged_id).await
	}

	/// Enumerate to-side candidates for a newly-inserted criteria row and
	/// materialize staged relationships per match. SPEC_FULL.md §4.6
	/// "Criteria backfill".
	pub async fn backfill_criteria(
		&self,
		tenant_id: &str,
		criteria_id: Uuid,
	) -> Result<usize, RelationshipError> {
		self.repo.backfill_criteria_matches(tenant_id, criteria_id).await
	}

	pub async fn by_id(&self, tenant_id: &str, relationship_id: Uuid) -> Result<Option<StagedRelationship>, RelationshipError> {
		self.repo.staged_relationship_by_id(tenant_id, relationship_id).await
	}

	/// Look up the active merged record a staged record currently belongs
	/// to, if any. Used by the CDC dispatcher to resolve both sides of a
	/// staged relationship before upserting a golden edge.
	pub async fn merged_for_staged(&self, tenant_id: &str, staged_id: Uuid) -> Result<Option<Uuid>, RelationshipError> {
		self.repo.merged_for_staged(tenant_id, staged_id).await
	}

	/// Link a staged relationship to the golden edge that now covers it.
	pub async fn link_cluster(&self, tenant_id: &str, merged_relationship_id: Uuid, staged_relationship_id: Uuid) -> Result<(), RelationshipError> {
		self.repo.upsert_relationship_cluster(tenant_id, merged_relationship_id, staged_relationship_id).await
	}

	/// Drop a staged relationship's cluster membership without touching the
	/// golden edge. Used by the CDC dispatcher's cascade-cleanup path for
	/// the staged-relationships topic.
	pub async fn unlink_cluster(&self, tenant_id: &str, staged_relationship_id: Uuid) -> Result<(), RelationshipError> {
		self.repo.remove_cluster_member(tenant_id, staged_relationship_id).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn golden_edge_id_is_deterministic() {
		let a = Uuid::new_v4();
		let b = Uuid::new_v4();
		let id1 = golden_edge_id("tenant1", "works_at", a, b);
		let id2 = golden_edge_id("tenant1", "works_at", a, b);
		assert_eq!(id1, id2);
	}

	#[test]
	fn golden_edge_id_differs_by_direction() {
		let a = Uuid::new_v4();
		let b = Uuid::new_v4();
		assert_ne!(
			golden_edge_id("tenant1", "works_at", a, b),
			golden_edge_id("tenant1", "works_at", b, a)
		);
	}

	#[test]
	fn golden_edge_id_differs_by_tenant() {
		let a = Uuid::new_v4();
		let b = Uuid::new_v4();
		assert_ne!(
			golden_edge_id("tenant1", "works_at", a, b),
			golden_edge_id("tenant2", "works_at", a, b)
		);
	}
}
