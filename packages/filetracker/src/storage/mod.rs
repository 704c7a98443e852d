// Object index trait and the on-disk tracker
mod config;
mod temp;
mod tracker;

pub use config::TrackerConfig;
pub use temp::WriteHandle;
pub use tracker::{CommitOutcome, FileEntry, FileTracker};

use crate::db::FileTrackerItem;
use crate::error::TrackerResult;
use async_trait::async_trait;

/// Operations the object server calls on a disk's index
#[async_trait]
pub trait ObjectIndex: Send + Sync {
    /// Open a temp file to stream the bytes of `hash` into
    async fn temp_file(&self, hash: &str, size_hint: Option<u64>) -> TrackerResult<WriteHandle>;

    /// Publish a written temp file as the `timestamp` version of `(hash, shard)`
    async fn commit(
        &self,
        handle: WriteHandle,
        hash: &str,
        shard: u32,
        timestamp: i64,
        metahash: Option<&str>,
        metadata: Option<&[u8]>,
    ) -> TrackerResult<CommitOutcome>;

    /// Current version of `(hash, shard)`
    async fn lookup(&self, hash: &str, shard: u32) -> TrackerResult<FileEntry>;

    /// Every record whose hash lies in `start..=stop`
    async fn list(&self, start: &str, stop: &str) -> TrackerResult<Vec<FileTrackerItem>>;
}
