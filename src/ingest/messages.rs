//! Inbound event bus payload shapes. See SPEC_FULL.md §6 "Inbound event bus".

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSource {
	pub integration: String,
	pub source_id: String,
	pub source_key: String,
	pub tenant_id: String,
	pub execution_id: Option<String>,
	pub config_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
	Entity,
	Relationship,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSchema {
	#[serde(rename = "type")]
	pub kind: TargetKind,
	pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedRelationship {
	#[serde(rename = "type")]
	pub relationship_type: String,
	pub to_entity_type: String,
	pub to_source_id: String,
	#[serde(default)]
	pub data: Value,
}

/// The mapped-records topic envelope. SPEC_FULL.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappedRecordEnvelope {
	pub source: RecordSource,
	pub target_schema: Option<TargetSchema>,
	pub data: Value,
	#[serde(default)]
	pub relationships: Vec<EmbeddedRelationship>,
}

impl MappedRecordEnvelope {
	/// A payload with any `_relationship_*` well-known key is a
	/// relationship even without an explicit `target_schema`.
	pub fn is_relationship(&self) -> bool {
		match &self.target_schema {
			Some(schema) => schema.kind == TargetKind::Relationship,
			None => self
				.data
				.as_object()
				.is_some_and(|obj| obj.keys().any(|k| k.starts_with("_relationship"))),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplicitDeleteSource {
	pub tenant_id: String,
	pub key: String,
	pub config_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplicitDeleteMessage {
	pub action: String,
	pub entity_type: String,
	pub entity_id: String,
	pub source: ExplicitDeleteSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
	Success,
	Partial,
	Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionCompletedEvent {
	#[serde(rename = "type")]
	pub event_type: String,
	pub tenant_id: String,
	pub source_key: String,
	pub execution_id: String,
	pub status: ExecutionStatus,
	#[serde(default)]
	pub stats: Value,
	pub timestamp: chrono::DateTime<chrono::Utc>,
}
