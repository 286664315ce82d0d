//! The CDC dispatcher: consumes Debezium-shaped row-level change events
//! from the staged tables and drives the match → merge → relationship
//! pipeline, decoupled from ingest write volume. See SPEC_FULL.md §4.3.
//!
//! Grounded on `src/bus/consumer.rs`'s generic worker loop (poll, handle,
//! commit-on-success) for the outer cooperative-consumer shape; the
//! envelope parsing and op-code policy below are this module's own, since
//! the teacher has no row-level CDC concept.

use crate::bus::{EventPublisher, EventType, OutboundEvent};
use crate::error::CdcError;
use crate::ingest::IngestRepo;
use crate::match_engine::MatchEngine;
use crate::merge_engine::MergeEngine;
use crate::observability::MetricsRegistry;
use crate::relationship::RelationshipResolver;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Debezium op codes. SPEC_FULL.md §6 "CDC envelopes".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
	#[serde(rename = "c")]
	Create,
	#[serde(rename = "u")]
	Update,
	#[serde(rename = "d")]
	Delete,
	#[serde(rename = "r")]
	Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdcSource {
	pub table: String,
	pub db: String,
	pub ts_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdcPayload {
	pub before: Option<Value>,
	pub after: Option<Value>,
	pub source: CdcSource,
	pub op: Op,
	pub ts_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdcEnvelope {
	pub payload: CdcPayload,
}

/// The subset of a `staged_records` row's after-image the dispatcher needs
/// to decide a routing path, without re-deserializing the whole row twice.
#[derive(Debug, Deserialize)]
struct StagedEntityAfter {
	id: Uuid,
	tenant_id: String,
	entity_type: String,
	fingerprint: String,
	previous_fingerprint: Option<String>,
	deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct StagedRelationshipAfter {
	id: Uuid,
	tenant_id: String,
	from_staged_entity_id: Option<Uuid>,
	to_staged_entity_id: Option<Uuid>,
	deleted_at: Option<DateTime<Utc>>,
}

pub struct CdcDispatcher {
	repo: IngestRepo,
	match_engine: Arc<MatchEngine>,
	merge_engine: Arc<MergeEngine>,
	resolver: Arc<RelationshipResolver>,
	publisher: Arc<dyn EventPublisher>,
	metrics: Arc<MetricsRegistry>,
}

impl CdcDispatcher {
	pub fn new(
		repo: IngestRepo,
		match_engine: Arc<MatchEngine>,
		merge_engine: Arc<MergeEngine>,
		resolver: Arc<RelationshipResolver>,
		publisher: Arc<dyn EventPublisher>,
		metrics: Arc<MetricsRegistry>,
	) -> Self {
		Self {
			repo,
			match_engine,
			merge_engine,
			resolver,
			publisher,
			metrics,
		}
	}

	/// Route one `staged-entities` topic event. SPEC_FULL.md §4.3.
	pub async fn dispatch_staged_entity(&self, envelope: CdcEnvelope) -> Result<(), CdcError> {
		let result = self.dispatch_staged_entity_inner(envelope).await;
		match &result {
			Ok(()) => self.metrics.cdc_events_processed_total.inc(),
			Err(_) => self.metrics.cdc_events_failed_total.inc(),
		}
		result
	}

	async fn dispatch_staged_entity_inner(&self, envelope: CdcEnvelope) -> Result<(), CdcError> {
		if envelope.payload.op == Op::Delete {
			// Hard deletes are skipped; soft-delete is the only real
			// deletion path.
			return Ok(());
		}

		let Some(after_raw) = &envelope.payload.after else {
			return Err(CdcError::MalformedEnvelope(
				"staged-entities event missing after-image".to_string(),
			));
		};
		let after: StagedEntityAfter = serde_json::from_value(after_raw.clone())
			.map_err(|e| CdcError::MalformedEnvelope(e.to_string()))?;

		if after.deleted_at.is_some() {
			return self.cascade_cleanup_entity(&after).await;
		}

		if after
			.previous_fingerprint
			.as_deref()
			.is_some_and(|prev| prev == after.fingerprint)
		{
			// Idempotent replay: nothing changed since the last time this
			// record was processed.
			self.metrics.cdc_idempotent_skips_total.inc();
			return Ok(());
		}

		let record = self
			.repo
			.staged_record_by_id(&after.tenant_id, after.id)
			.await
			.map_err(CdcError::Ingest)?
			.ok_or_else(|| CdcError::MalformedEnvelope(format!("staged record {} not found", after.id)))?;

		self.match_engine.index_record(&record).await?;
		let matches = self.match_engine.find_matches(&record).await?;
		let outcome = self.merge_engine.merge_with_matches(&record, &matches).await?;

		self.resolver
			.resolve_late_endpoints(
				&after.tenant_id,
				&after.entity_type,
				&record.source_id,
				&record.integration,
				record.id,
				outcome.merged.id,
			)
			.await
			.ok();

		// Only auto_merge candidates actually change cluster membership; a
		// pending (sub-auto-merge) or blocked match leaves this an update.
		let event_type = if outcome.is_new {
			EventType::EntityCreated
		} else if matches.iter().any(|m| m.auto_merge) {
			EventType::EntityMerged
		} else {
			EventType::EntityUpdated
		};

		self.publisher
			.publish(OutboundEvent {
				event_type,
				tenant_id: after.tenant_id,
				id: outcome.merged.id,
				entity_or_relationship_type: after.entity_type,
				data: outcome.merged.payload.clone(),
				source_entities: Some(
					matches
						.iter()
						.filter(|m| m.auto_merge)
						.map(|m| m.candidate_staged_record_id)
						.collect(),
				),
				version: outcome.merged.version,
				timestamp: Utc::now(),
			})
			.await
			.ok();

		Ok(())
	}

	async fn cascade_cleanup_entity(&self, after: &StagedEntityAfter) -> Result<(), CdcError> {
		let removal = self
			.merge_engine
			.remove_from_cluster(&after.tenant_id, after.id)
			.await?;

		let Some(removal) = removal else {
			return Ok(());
		};

		if removal.emptied {
			self.resolver
				.cascade_delete(&after.tenant_id, removal.merged_id)
				.await?;

			self.publisher
				.publish(OutboundEvent {
					event_type: EventType::EntityDeleted,
					tenant_id: after.tenant_id.clone(),
					id: removal.merged_id,
					entity_or_relationship_type: after.entity_type.clone(),
					data: Value::Null,
					source_entities: None,
					version: 0,
					timestamp: Utc::now(),
				})
				.await
				.ok();
		}

		Ok(())
	}

	/// Route one `staged-relationships` topic event. SPEC_FULL.md §4.3, §4.6.
	pub async fn dispatch_staged_relationship(&self, envelope: CdcEnvelope) -> Result<(), CdcError> {
		let result = self.dispatch_staged_relationship_inner(envelope).await;
		match &result {
			Ok(()) => self.metrics.cdc_events_processed_total.inc(),
			Err(_) => self.metrics.cdc_events_failed_total.inc(),
		}
		result
	}

	async fn dispatch_staged_relationship_inner(&self, envelope: CdcEnvelope) -> Result<(), CdcError> {
		if envelope.payload.op == Op::Delete {
			return Ok(());
		}

		let Some(after_raw) = &envelope.payload.after else {
			return Err(CdcError::MalformedEnvelope(
				"staged-relationships event missing after-image".to_string(),
			));
		};
		let after: StagedRelationshipAfter = serde_json::from_value(after_raw.clone())
			.map_err(|e| CdcError::MalformedEnvelope(e.to_string()))?;

		if after.deleted_at.is_some() {
			self.resolver.unlink_cluster(&after.tenant_id, after.id).await?;
			return Ok(());
		}

		let (Some(from_staged), Some(to_staged)) = (after.from_staged_entity_id, after.to_staged_entity_id) else {
			// One side still unresolved; `resolve_late_endpoints` picks this
			// row up once the missing side's entity merges.
			return Ok(());
		};

		let rel = self
			.resolver
			.by_id(&after.tenant_id, after.id)
			.await?
			.ok_or_else(|| CdcError::MalformedEnvelope(format!("staged relationship {} not found", after.id)))?;

		let from_merged = self.resolver.merged_for_staged(&after.tenant_id, from_staged).await?;
		let to_merged = self.resolver.merged_for_staged(&after.tenant_id, to_staged).await?;

		let (Some(from_merged), Some(to_merged)) = (from_merged, to_merged) else {
			return Ok(());
		};

		let edge = self
			.resolver
			.upsert(&after.tenant_id, &rel.relationship_type, from_merged, to_merged, rel.payload.clone())
			.await?;
		self.resolver.link_cluster(&after.tenant_id, edge.id, rel.id).await?;

		self.publisher
			.publish(OutboundEvent {
				event_type: EventType::RelationshipCreated,
				tenant_id: after.tenant_id,
				id: edge.id,
				entity_or_relationship_type: rel.relationship_type,
				data: edge.payload.clone(),
				source_entities: None,
				version: 0,
				timestamp: Utc::now(),
			})
			.await
			.ok();

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hard_delete_op_deserializes() {
		let raw = serde_json::json!({
			"payload": {
				"before": null,
				"after": null,
				"source": {"table": "staged_records", "db": "heimdall", "ts_ms": 1},
				"op": "d",
				"ts_ms": 1
			}
		});
		let envelope: CdcEnvelope = serde_json::from_value(raw).unwrap();
		assert_eq!(envelope.payload.op, Op::Delete);
	}

	#[test]
	fn staged_entity_after_image_parses_soft_delete() {
		let raw = serde_json::json!({
			"id": Uuid::new_v4(),
			"tenant_id": "t1",
			"entity_type": "person",
			"fingerprint": "abc",
			"previous_fingerprint": "abc",
			"deleted_at": "2026-01-01T00:00:00Z",
		});
		let after: StagedEntityAfter = serde_json::from_value(raw).unwrap();
		assert!(after.deleted_at.is_some());
	}
}
