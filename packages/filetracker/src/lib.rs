//! Per-disk object index.
//!
//! Maps `(content hash, shard)` to the newest version of an object stored on
//! one disk. The keyspace is split into `2^P` partitions by the high bits of
//! the hash; each partition has its own SQLite index and blob directory.
//! Writes go to a temp file first and are published by rename inside the
//! index transaction that records them.

pub mod db;
pub mod diagnostics;
pub mod error;
pub mod hash;
pub mod metadata;
pub mod storage;

pub use db::FileTrackerItem;
pub use diagnostics::{Diagnostic, DiagnosticSink, TracingSink};
pub use error::{TrackerError, TrackerResult};
pub use hash::{ContentHash, Partitioner};
pub use metadata::{JsonCodec, MetaStore, MetadataCodec, MetadataError};
pub use storage::{
    CommitOutcome, FileEntry, FileTracker, ObjectIndex, TrackerConfig, WriteHandle,
};
