//! The event bus boundary: a narrow outbound publisher trait plus a
//! consumer worker-loop helper. Grounded on the teacher's `sync/agent.rs`
//! `sync_loop` (interval polling + exponential backoff with jitter,
//! atomic metrics counters), transport swapped from length-prefixed TLS
//! framing to `rdkafka`. See SPEC_FULL.md §4.8, §4.9.

pub mod consumer;
pub mod kafka;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
	EntityCreated,
	EntityUpdated,
	EntityDeleted,
	EntityMerged,
	RelationshipCreated,
	RelationshipUpdated,
	RelationshipDeleted,
}

/// Outbound event bus message. SPEC_FULL.md §6 "Outbound event bus".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEvent {
	pub event_type: EventType,
	pub tenant_id: String,
	pub id: uuid::Uuid,
	pub entity_or_relationship_type: String,
	pub data: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub source_entities: Option<Vec<uuid::Uuid>>,
	pub version: i64,
	pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
	async fn publish(&self, event: OutboundEvent) -> anyhow::Result<()>;
}

/// A publisher that drops events; useful for tests and for running the
/// resolution core without a bus configured.
pub struct NullPublisher;

#[async_trait]
impl EventPublisher for NullPublisher {
	async fn publish(&self, _event: OutboundEvent) -> anyhow::Result<()> {
		Ok(())
	}
}
