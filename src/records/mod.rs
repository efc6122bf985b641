//! Persisted records.
//!
//! Instances are stored flat, one record per `(tag, id)`, with graph edges
//! kept as `(tag, id)` pairs and resolved when the record is loaded.

mod files;
mod record;

pub use files::{LoadedRecord, RecordFiles, WriteOutcome};
pub use record::{Edge, StoredRecord};
