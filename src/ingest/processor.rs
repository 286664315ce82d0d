//! Operation contracts for the ingest processor. SPEC_FULL.md §4.2.
//!
//! Ingest only validates, fingerprints and upserts staged rows; it does not
//! call the match/merge/relationship engines directly. That decoupling is
//! the point of the CDC dispatcher (SPEC_FULL.md §4.3, `crate::cdc`): the
//! staged-table write here is what the dispatcher observes and acts on.

use super::messages::{
	EmbeddedRelationship, ExecutionCompletedEvent, ExplicitDeleteMessage, MappedRecordEnvelope, TargetKind,
};
use super::repo::IngestRepo;
use crate::deletion::DeletionEngine;
use crate::error::IngestError;
use crate::model::StagedRecord;
use crate::observability::MetricsRegistry;
use crate::relationship::{staged_relationship_id, RelationshipResolver};
use std::sync::Arc;

pub struct IngestOutcome {
	pub record: StagedRecord,
	pub is_new: bool,
	pub is_changed: bool,
}

pub struct IngestProcessor {
	repo: IngestRepo,
	deletion: Arc<DeletionEngine>,
	/// Used only for the one-off criteria-backfill enumeration on a newly
	/// inserted `_to_criteria` definition (SPEC_FULL.md §4.2), not for the
	/// per-record match/merge hot path — that is the CDC dispatcher's job.
	resolver: Arc<RelationshipResolver>,
	metrics: Arc<MetricsRegistry>,
}

impl IngestProcessor {
	pub fn new(
		repo: IngestRepo,
		deletion: Arc<DeletionEngine>,
		resolver: Arc<RelationshipResolver>,
		metrics: Arc<MetricsRegistry>,
	) -> Self {
		Self {
			repo,
			deletion,
			resolver,
			metrics,
		}
	}

	/// SPEC_FULL.md §4.2 "ProcessRecord". Schema validation is assumed to
	/// have already run (warn-only, external collaborator per SPEC_FULL.md
	/// §1) by the time a message reaches this processor.
	pub async fn process_record(&self, msg: &MappedRecordEnvelope) -> Result<IngestOutcome, IngestError> {
		let entity_type = entity_type_of(msg)?;
		let source_id = msg
			.data
			.get("_source_id")
			.and_then(|v| v.as_str())
			.ok_or(IngestError::MissingIdentity("source_id"))?;

		let timer = self.metrics.ingest_duration_seconds.start_timer();
		let excludes = self.repo.fingerprint_excludes(&msg.source.tenant_id, &entity_type).await?;

		let (record, is_new, is_changed) = self
			.repo
			.upsert_staged_record(
				&msg.source.tenant_id,
				&entity_type,
				source_id,
				&msg.source.integration,
				&msg.source.source_key,
				&msg.source.config_id,
				msg.source.execution_id.as_deref(),
				&msg.data,
				&excludes,
			)
			.await?;
		timer.observe_duration();
		self.metrics.ingest_records_total.inc();

		for rel in &msg.relationships {
			// Embedded relationships inherit the parent's integration on
			// the to-side; preserved literally per SPEC_FULL.md §9.
			self.process_embedded_relationship(msg, &entity_type, source_id, rel).await.ok();
		}

		Ok(IngestOutcome {
			record,
			is_new,
			is_changed,
		})
	}

	/// SPEC_FULL.md §4.2 "ProcessRelationship" — direct mode.
	pub async fn process_relationship(&self, msg: &MappedRecordEnvelope) -> Result<(), IngestError> {
		let rel_type = msg
			.data
			.get("_relationship_type")
			.and_then(|v| v.as_str())
			.ok_or(IngestError::MissingRelationshipField("_relationship_type"))?;
		let from_entity_type = msg
			.data
			.get("_from_entity_type")
			.and_then(|v| v.as_str())
			.unwrap_or("");
		let from_source_id = msg
			.data
			.get("_from_source_id")
			.and_then(|v| v.as_str())
			.ok_or(IngestError::MissingRelationshipField("_from_source_id"))?;
		let from_integration = msg
			.data
			.get("_from_integration")
			.and_then(|v| v.as_str())
			.unwrap_or(&msg.source.integration);

		if let Some(to_criteria) = msg.data.get("_to_criteria") {
			let to_entity_type = msg.data.get("_to_entity_type").and_then(|v| v.as_str()).unwrap_or("");
			let to_integration = msg.data.get("_to_integration").and_then(|v| v.as_str()).unwrap_or("");
			let criteria: crate::model::Criteria = serde_json::from_value(to_criteria.clone())
				.map_err(|_| IngestError::MissingRelationshipField("_to_criteria"))?;
			let (criteria_id, is_new) = self
				.repo
				.upsert_criteria(
					&msg.source.tenant_id,
					rel_type,
					from_entity_type,
					from_source_id,
					from_integration,
					to_entity_type,
					to_integration,
					&msg.source.config_id,
					&criteria,
				)
				.await?;
			if is_new {
				self.resolver.backfill_criteria(&msg.source.tenant_id, criteria_id).await.ok();
			}
			return Ok(());
		}

		let to_entity_type = msg
			.data
			.get("_to_entity_type")
			.and_then(|v| v.as_str())
			.ok_or(IngestError::MissingRelationshipField("_to_entity_type"))?;
		let to_source_id = msg.data.get("_to_source_id").and_then(|v| v.as_str());
		let to_integration = msg
			.data
			.get("_to_integration")
			.and_then(|v| v.as_str())
			.unwrap_or(&msg.source.integration);

		let id = staged_relationship_id(
			&msg.source.tenant_id,
			rel_type,
			&format!("{from_entity_type}|{from_source_id}|{from_integration}"),
			&format!("{to_entity_type}|{}|{to_integration}", to_source_id.unwrap_or("")),
			&msg.source.config_id,
		);

		self.repo
			.upsert_staged_relationship(
				id,
				&msg.source.tenant_id,
				rel_type,
				from_entity_type,
				from_source_id,
				from_integration,
				to_entity_type,
				to_source_id,
				Some(to_integration),
				&msg.source.config_id,
				msg.source.execution_id.as_deref(),
				&msg.data,
			)
			.await?;
		self.metrics.ingest_relationships_total.inc();
		Ok(())
	}

	/// SPEC_FULL.md §4.2 "ProcessEmbeddedRelationship": always direct, and
	/// the to-side's integration is implicitly the parent's integration.
	async fn process_embedded_relationship(
		&self,
		msg: &MappedRecordEnvelope,
		parent_entity_type: &str,
		parent_source_id: &str,
		rel: &EmbeddedRelationship,
	) -> Result<(), IngestError> {
		let id = staged_relationship_id(
			&msg.source.tenant_id,
			&rel.relationship_type,
			&format!("{parent_entity_type}|{parent_source_id}|{}", msg.source.integration),
			&format!("{}|{}|{}", rel.to_entity_type, rel.to_source_id, msg.source.integration),
			&msg.source.config_id,
		);
		self.repo
			.upsert_staged_relationship(
				id,
				&msg.source.tenant_id,
				&rel.relationship_type,
				parent_entity_type,
				parent_source_id,
				&msg.source.integration,
				&rel.to_entity_type,
				Some(&rel.to_source_id),
				Some(&msg.source.integration),
				&msg.source.config_id,
				msg.source.execution_id.as_deref(),
				&rel.data,
			)
			.await?;
		self.metrics.ingest_relationships_total.inc();
		Ok(())
	}

	/// SPEC_FULL.md §4.2 "ProcessExplicitDelete".
	pub async fn process_explicit_delete(&self, msg: &ExplicitDeleteMessage) -> Result<(), IngestError> {
		self.repo
			.soft_delete_by_source_id(
				&msg.source.tenant_id,
				&msg.entity_type,
				&msg.entity_id,
				Some(&msg.source.key).filter(|k| !k.is_empty()),
			)
			.await?;
		Ok(())
	}

	/// SPEC_FULL.md §4.2 "ProcessExecutionCompleted".
	pub async fn process_execution_completed(&self, evt: &ExecutionCompletedEvent) -> Result<u64, IngestError> {
		let policies = self
			.repo
			.deletion_policies(&evt.tenant_id, &evt.source_key)
			.await?;
		let mut total = 0;
		for policy in &policies {
			total += self
				.deletion
				.apply(&evt.tenant_id, policy, Some(&evt.execution_id))
				.await
				.map_err(|e| IngestError::Database(sqlx::Error::Protocol(e.to_string())))?;
		}
		Ok(total)
	}
}

fn entity_type_of(msg: &MappedRecordEnvelope) -> Result<String, IngestError> {
	if let Some(schema) = &msg.target_schema {
		if schema.kind == TargetKind::Entity {
			return Ok(schema.key.clone());
		}
	}
	msg.data
		.get("_entity_type")
		.and_then(|v| v.as_str())
		.map(str::to_string)
		.ok_or(IngestError::MissingIdentity("entity_type"))
}
