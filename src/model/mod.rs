//! Core data model. See SPEC_FULL.md §3.
//!
//! These types mirror the relational schema assumed to already exist in the
//! target Postgres database (provisioned externally, as with the teacher's
//! own AGE-backed store). Every row is tenant-scoped; every repository
//! method below takes a tenant id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod criteria;

pub use criteria::{Criteria, CriteriaOp};

/// A source-system observation of an entity. Natural key: (tenant,
/// entity_type, source_id, integration, source_key, config_id).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StagedRecord {
	pub id: Uuid,
	pub tenant_id: String,
	pub entity_type: String,
	pub source_id: String,
	pub integration: String,
	pub source_key: String,
	pub config_id: String,
	pub last_seen_execution: Option<String>,
	pub payload: Value,
	pub fingerprint: String,
	pub previous_fingerprint: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub deleted_at: Option<DateTime<Utc>>,
}

/// A canonical, merged record for a cluster of staged records.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MergedRecord {
	pub id: Uuid,
	pub tenant_id: String,
	pub entity_type: String,
	pub payload: Value,
	pub source_count: i32,
	pub primary_source_id: Uuid,
	pub version: i64,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub deleted_at: Option<DateTime<Utc>>,
}

/// Membership edge: a staged record belongs to at most one active cluster.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EntityCluster {
	pub id: Uuid,
	pub tenant_id: String,
	pub merged_record_id: Uuid,
	pub staged_record_id: Uuid,
	pub is_primary: bool,
	pub added_at: DateTime<Utc>,
	pub removed_at: Option<DateTime<Utc>>,
}

/// The closed set of match condition types. See SPEC_FULL.md §9 "Polymorphism".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
	Exact,
	Fuzzy,
	Phonetic,
	Numeric,
	DateRange,
}

impl MatchType {
	pub fn as_str(&self) -> &'static str {
		match self {
			MatchType::Exact => "exact",
			MatchType::Fuzzy => "fuzzy",
			MatchType::Phonetic => "phonetic",
			MatchType::Numeric => "numeric",
			MatchType::DateRange => "date_range",
		}
	}
}

/// One denormalized index row per (field, match_type, normalizer) a rule
/// references for a given staged record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MatchFieldRow {
	pub id: Uuid,
	pub tenant_id: String,
	pub entity_type: String,
	pub staged_record_id: Uuid,
	pub field_name: String,
	pub match_type: String,
	pub normalizer: Option<String>,
	pub value_text: Option<String>,
	pub token: Option<String>,
	pub value_num: Option<f64>,
	pub value_ts: Option<DateTime<Utc>>,
}

/// A single condition within a [`MatchRule`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCondition {
	pub field: String,
	pub match_type: MatchType,
	pub normalizer: Option<String>,
	#[serde(default = "default_weight")]
	pub weight: f64,
	pub threshold: Option<f64>,
	#[serde(default)]
	pub required: bool,
	#[serde(default)]
	pub invert: bool,
	#[serde(default)]
	pub no_merge: bool,
}

fn default_weight() -> f64 {
	1.0
}

impl MatchCondition {
	pub fn threshold_or_default(&self) -> f64 {
		self.threshold.unwrap_or(0.7)
	}
}

/// A tenant-scoped, per-entity-type rule: an ordered set of conditions plus
/// a priority used only for presentation/ordering (scores are independent).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MatchRule {
	pub id: Uuid,
	pub tenant_id: String,
	pub entity_type: String,
	pub name: String,
	pub priority: i32,
	pub active: bool,
	#[serde(default = "default_weight")]
	pub score_weight: f64,
	#[sqlx(json)]
	pub conditions: Vec<MatchCondition>,
}

/// A source-system assertion of a directed relationship between two
/// records, possibly with the to-side defined dynamically via criteria.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StagedRelationship {
	pub id: Uuid,
	pub tenant_id: String,
	pub relationship_type: String,
	pub from_entity_type: String,
	pub from_source_id: String,
	pub from_integration: String,
	pub to_entity_type: String,
	pub to_source_id: Option<String>,
	pub to_integration: Option<String>,
	pub criteria_id: Option<Uuid>,
	pub from_staged_entity_id: Option<Uuid>,
	pub to_staged_entity_id: Option<Uuid>,
	pub config_id: String,
	pub last_seen_execution: Option<String>,
	pub payload: Value,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub deleted_at: Option<DateTime<Utc>>,
}

/// A golden edge between two merged records. `id` is deterministic: see
/// [`crate::relationship::golden_edge_id`].
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MergedRelationship {
	pub id: Uuid,
	pub tenant_id: String,
	pub relationship_type: String,
	pub from_merged_id: Uuid,
	pub to_merged_id: Uuid,
	pub payload: Value,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub deleted_at: Option<DateTime<Utc>>,
}

/// Membership edge: a staged relationship belongs to at most one golden edge.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RelationshipCluster {
	pub id: Uuid,
	pub tenant_id: String,
	pub merged_relationship_id: Uuid,
	pub staged_relationship_id: Uuid,
	pub added_at: DateTime<Utc>,
	pub removed_at: Option<DateTime<Utc>>,
}

/// A predicate that selects to-side records dynamically instead of a fixed
/// source id.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StagedRelationshipCriteria {
	pub id: Uuid,
	pub tenant_id: String,
	pub relationship_type: String,
	pub from_entity_type: String,
	pub from_source_id: String,
	pub from_integration: String,
	pub to_entity_type: String,
	pub to_integration: String,
	pub config_id: String,
	#[sqlx(json)]
	pub criteria: Criteria,
	pub criteria_hash: String,
	pub created_at: DateTime<Utc>,
}

/// Status of a pending pairwise match surfaced for manual review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
	Pending,
	Approved,
	Rejected,
	Deferred,
	AutoMerged,
}

/// A candidate match between a source record and an existing staged record,
/// produced by the match engine's Phase B. Candidates scoring between
/// `MinMatchScore` and `AutoMergeThreshold` are persisted with
/// `status = pending` for manual review; the review queue itself (approve/
/// reject/defer) is the out-of-scope HTTP control plane per SPEC_FULL.md §1 —
/// this type is the row it operates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCandidate {
	pub id: Uuid,
	pub staged_record_id: Uuid,
	pub candidate_staged_record_id: Uuid,
	pub score: f64,
	pub blocked: bool,
	pub rule_matched: Option<String>,
	pub auto_merge: bool,
	pub status: CandidateStatus,
}
