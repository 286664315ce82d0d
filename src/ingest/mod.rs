//! The ingest processor: validates incoming records/relationships,
//! fingerprints and upserts staged rows, and fans out relationships. See
//! SPEC_FULL.md §4.2. Retargets the teacher's streaming-validate-normalize
//! sequencing onto bus messages instead of HTTP bodies.

pub mod messages;
pub mod processor;
pub mod repo;

pub use messages::{ExecutionCompletedEvent, ExplicitDeleteMessage, MappedRecordEnvelope};
pub use processor::{IngestOutcome, IngestProcessor};
pub use repo::IngestRepo;
