use thiserror::Error;

/// Errors raised while processing an ingest message.
#[derive(Debug, Error)]
pub enum IngestError {
	#[error("record is missing a required identity field: {0}")]
	MissingIdentity(&'static str),
	#[error("relationship is missing a required field: {0}")]
	MissingRelationshipField(&'static str),
	#[error("fingerprint computation failed: {0}")]
	Fingerprint(#[from] crate::fingerprint::FingerprintError),
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),
}

/// Errors raised by the match engine.
#[derive(Debug, Error)]
pub enum MatchError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),
	#[error("no active rules for entity type {0}")]
	NoRules(String),
}

/// Errors raised by the merge engine.
#[derive(Debug, Error)]
pub enum MergeError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),
	#[error("cluster consolidation conflict for tenant {tenant}: {detail}")]
	ConsolidationConflict { tenant: String, detail: String },
	#[error("match candidate {0} not found or its source record no longer exists")]
	CandidateNotFound(uuid::Uuid),
}

/// Errors raised by the relationship resolver.
#[derive(Debug, Error)]
pub enum RelationshipError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),
	#[error("both endpoints unresolved for staged relationship {0}")]
	BothEndpointsUnresolved(uuid::Uuid),
	#[error("stored criteria {0} failed to deserialize: {1}")]
	InvalidCriteria(uuid::Uuid, serde_json::Error),
}

/// Errors raised by the deletion engine.
#[derive(Debug, Error)]
pub enum DeletionError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),
	#[error("unknown deletion policy kind: {0}")]
	UnknownPolicy(String),
}

/// Errors raised while dispatching a change-data-capture event.
#[derive(Debug, Error)]
pub enum CdcError {
	#[error("malformed CDC envelope: {0}")]
	MalformedEnvelope(String),
	#[error(transparent)]
	Ingest(#[from] IngestError),
	#[error(transparent)]
	Match(#[from] MatchError),
	#[error(transparent)]
	Merge(#[from] MergeError),
	#[error(transparent)]
	Relationship(#[from] RelationshipError),
	#[error(transparent)]
	Deletion(#[from] DeletionError),
}

/// Classification used by worker loops to decide whether to commit an offset,
/// retry, or drop and move on. See SPEC_FULL.md §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
	/// Bad input; drop the message and commit the offset.
	Validation,
	/// Infra hiccup; do not commit, retry.
	Transient,
	/// Concurrent write conflict; do not commit, retry.
	LogicalConflict,
	/// Unparseable message; commit the offset to avoid head-of-line blocking.
	PermanentProcessing,
}

impl CdcError {
	pub fn class(&self) -> ErrorClass {
		match self {
			CdcError::MalformedEnvelope(_) => ErrorClass::PermanentProcessing,
			CdcError::Ingest(IngestError::MissingIdentity(_))
			| CdcError::Ingest(IngestError::MissingRelationshipField(_)) => ErrorClass::Validation,
			CdcError::Ingest(IngestError::Database(_))
			| CdcError::Match(MatchError::Database(_))
			| CdcError::Merge(MergeError::Database(_))
			| CdcError::Relationship(RelationshipError::Database(_))
			| CdcError::Deletion(DeletionError::Database(_)) => ErrorClass::Transient,
			CdcError::Merge(MergeError::ConsolidationConflict { .. }) => ErrorClass::LogicalConflict,
			_ => ErrorClass::PermanentProcessing,
		}
	}
}
