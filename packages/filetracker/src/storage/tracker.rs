// Partitioned file tracker for one disk
use super::{ObjectIndex, TrackerConfig, WriteHandle};
use crate::db::{FileRecord, FileTrackerItem, PartitionStore};
use crate::diagnostics::{Diagnostic, DiagnosticSink, TracingSink};
use crate::error::{TrackerError, TrackerResult};
use crate::hash::{ContentHash, Partitioner};
use crate::metadata::{reconcile, JsonCodec, Metadata, MetadataCodec, StoredVersion};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a successful commit did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// First version of the key.
    Inserted,
    /// Replaced an older version.
    Replaced { previous_timestamp: i64 },
    /// A version at least as new was already stored; nothing changed.
    Stale { stored_timestamp: i64 },
}

/// Current version of a key, as returned by lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub hash: String,
    pub shard: u32,
    pub timestamp: i64,
    pub metahash: Option<String>,
    pub metadata: Option<Vec<u8>>,
    pub path: PathBuf,
}

/// Tracks the whole-file blobs of one disk.
///
/// Layout under the root:
/// `temp/` for in-progress writes and one `<pp>/` directory per partition
/// holding `filetracker_<pp>.sqlite3` and blobs named
/// `<hash>.<shard:02x>.<timestamp:019>`.
pub struct FileTracker<C: MetadataCodec = JsonCodec> {
    root: PathBuf,
    temp_path: PathBuf,
    partitioner: Partitioner,
    partitions: Vec<PartitionStore>,
    codec: C,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl FileTracker<JsonCodec> {
    /// Open the tracker for `config.root` with JSON metadata and tracing diagnostics
    pub async fn open(config: &TrackerConfig) -> TrackerResult<Self> {
        Self::open_with(config, JsonCodec, Arc::new(TracingSink)).await
    }
}

impl<C: MetadataCodec> FileTracker<C> {
    /// Open every partition of the disk. If any partition fails, the ones
    /// already opened are closed before the error is returned.
    pub async fn open_with(
        config: &TrackerConfig,
        codec: C,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> TrackerResult<Self> {
        config.validate()?;
        let partitioner = Partitioner::new(config.partition_power)?;

        let temp_path = config.temp_path();
        tokio::fs::create_dir_all(&temp_path).await?;

        let mut partitions = Vec::with_capacity(partitioner.count());
        for index in 0..partitioner.count() {
            match PartitionStore::open(config.partition_dir(index), index, config.max_connections)
                .await
            {
                Ok(store) => partitions.push(store),
                Err(e) => {
                    for store in &partitions {
                        store.close().await;
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!(
            root = %config.root.display(),
            partitions = partitioner.count(),
            "Opened file tracker"
        );

        Ok(Self {
            root: config.root.clone(),
            temp_path,
            partitioner,
            partitions,
            codec,
            diagnostics,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    /// Close every partition's index. The tracker cannot be used afterwards;
    /// open a new one to use the disk again.
    pub async fn close(self) {
        for store in &self.partitions {
            store.close().await;
        }
        tracing::debug!(root = %self.root.display(), "Closed file tracker");
    }

    /// Open a temp file for the bytes of `hash`.
    pub async fn temp_file(&self, hash: &str, size_hint: Option<u64>) -> TrackerResult<WriteHandle> {
        self.partitioner.partition(hash)?;
        Ok(WriteHandle::create(&self.temp_path, size_hint).await?)
    }

    /// Directory holding the blobs of `hash`'s partition.
    pub fn whole_file_dir(&self, hash: &str) -> TrackerResult<PathBuf> {
        let (_, partition) = self.partitioner.partition(hash)?;
        Ok(self.partitions[partition].dir().to_path_buf())
    }

    /// Final location of the `timestamp` version of `(hash, shard)`.
    pub fn whole_file_path(&self, hash: &str, shard: u32, timestamp: i64) -> TrackerResult<PathBuf> {
        let (hash, partition) = self.partitioner.partition(hash)?;
        Ok(self.blob_path(&hash, partition, shard, timestamp))
    }

    fn blob_path(&self, hash: &ContentHash, partition: usize, shard: u32, timestamp: i64) -> PathBuf {
        self.partitions[partition]
            .dir()
            .join(format!("{}.{:02x}.{:019}", hash, shard, timestamp))
    }

    /// Publish `handle` as the `timestamp` version of `(hash, shard)`.
    ///
    /// A version that is not newer than the stored one is discarded and
    /// reported as [`CommitOutcome::Stale`]. When the metahashes differ, the
    /// stored metadata is merged into the incoming one. The superseded blob
    /// is removed only once the new record is committed. The temp file is
    /// released on every path out of this function.
    pub async fn commit(
        &self,
        mut handle: WriteHandle,
        hash: &str,
        shard: u32,
        timestamp: i64,
        metahash: Option<&str>,
        metadata: Option<&[u8]>,
    ) -> TrackerResult<CommitOutcome> {
        let (hash, partition) = self.partitioner.partition(hash)?;
        if timestamp < 0 {
            return Err(TrackerError::InvalidInput(format!(
                "timestamp must not be negative, got {}",
                timestamp
            )));
        }
        let hex = hash.to_hex();

        let mut txn = self.partitions[partition].begin_write().await?;
        let current = txn.current(&hex, shard).await?;

        let mut incoming = Metadata {
            metahash: metahash.map(str::to_owned),
            metadata: metadata.map(<[u8]>::to_vec),
        };

        if let Some(stored) = &current {
            if stored.timestamp >= timestamp {
                tracing::debug!(
                    hash = %hex,
                    shard,
                    timestamp,
                    stored_timestamp = stored.timestamp,
                    "Discarding stale write"
                );
                return Ok(CommitOutcome::Stale {
                    stored_timestamp: stored.timestamp,
                });
            }

            if incoming.metahash != stored.metahash {
                let version = StoredVersion {
                    hash: &hex,
                    shard,
                    timestamp: stored.timestamp,
                    metahash: stored.metahash.as_deref(),
                    metadata: stored.metadata.as_deref(),
                };
                incoming = reconcile(&self.codec, self.diagnostics.as_ref(), &version, incoming)
                    .map_err(TrackerError::InvalidMetadata)?;
            }
        }

        let size_hint = handle.size_hint();
        let bytes = handle.bytes_written();
        let path = self.blob_path(&hash, partition, shard, timestamp);
        handle
            .save(&path)
            .await
            .map_err(|source| TrackerError::Persist {
                path: path.display().to_string(),
                source,
            })?;

        let record = FileRecord {
            hash: hex,
            shard,
            timestamp,
            metahash: incoming.metahash,
            metadata: incoming.metadata,
        };
        let written = match &current {
            None => txn.insert(&record).await,
            Some(_) => txn.update(&record).await,
        };
        let committed = match written {
            Ok(()) => txn.commit().await,
            Err(e) => {
                drop(txn);
                Err(e)
            }
        };
        // Only a returned error removes the new blob. A cancelled commit may
        // still land, so it must leave the blob in place.
        if let Err(e) = committed {
            self.discard_unreferenced(path).await;
            return Err(e);
        }

        let Some(previous) = current else {
            tracing::debug!(
                hash = %record.hash,
                shard,
                timestamp,
                bytes,
                size_hint = ?size_hint,
                "Committed new file"
            );
            return Ok(CommitOutcome::Inserted);
        };

        let older = self.blob_path(&hash, partition, shard, previous.timestamp);
        if let Err(e) = tokio::fs::remove_file(&older).await {
            self.diagnostics.record(Diagnostic::StaleBlobNotRemoved {
                path: older,
                error: e.to_string(),
            });
        }

        tracing::debug!(
            hash = %record.hash,
            shard,
            timestamp,
            previous_timestamp = previous.timestamp,
            bytes,
            size_hint = ?size_hint,
            "Committed newer file"
        );
        Ok(CommitOutcome::Replaced {
            previous_timestamp: previous.timestamp,
        })
    }

    async fn discard_unreferenced(&self, path: PathBuf) {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            self.diagnostics.record(Diagnostic::UnreferencedBlobNotRemoved {
                path,
                error: e.to_string(),
            });
        }
    }

    /// Current version of `(hash, shard)` and the path of its blob.
    pub async fn lookup(&self, hash: &str, shard: u32) -> TrackerResult<FileEntry> {
        let (hash, partition) = self.partitioner.partition(hash)?;
        let hex = hash.to_hex();

        let record = self.partitions[partition]
            .get(&hex, shard)
            .await?
            .ok_or_else(|| TrackerError::NotFound {
                hash: hex.clone(),
                shard,
            })?;

        Ok(FileEntry {
            path: self.blob_path(&hash, partition, shard, record.timestamp),
            hash: record.hash,
            shard: record.shard,
            timestamp: record.timestamp,
            metahash: record.metahash,
            metadata: record.metadata,
        })
    }

    /// Every record with `start <= hash <= stop`, grouped by partition.
    pub async fn list(&self, start: &str, stop: &str) -> TrackerResult<Vec<FileTrackerItem>> {
        let (start, start_partition) = self.partitioner.partition(start)?;
        let (stop, stop_partition) = self.partitioner.partition(stop)?;
        if start > stop {
            return Err(TrackerError::InvalidInput(format!(
                "start hash greater than stop hash: {} > {}",
                start, stop
            )));
        }

        let (start, stop) = (start.to_hex(), stop.to_hex());
        let scans = self.partitions[start_partition..=stop_partition]
            .iter()
            .map(|store| store.range(&start, &stop));
        let listing = try_join_all(scans).await?.into_iter().flatten().collect();
        Ok(listing)
    }
}

#[async_trait]
impl<C: MetadataCodec> ObjectIndex for FileTracker<C> {
    async fn temp_file(&self, hash: &str, size_hint: Option<u64>) -> TrackerResult<WriteHandle> {
        FileTracker::temp_file(self, hash, size_hint).await
    }

    async fn commit(
        &self,
        handle: WriteHandle,
        hash: &str,
        shard: u32,
        timestamp: i64,
        metahash: Option<&str>,
        metadata: Option<&[u8]>,
    ) -> TrackerResult<CommitOutcome> {
        FileTracker::commit(self, handle, hash, shard, timestamp, metahash, metadata).await
    }

    async fn lookup(&self, hash: &str, shard: u32) -> TrackerResult<FileEntry> {
        FileTracker::lookup(self, hash, shard).await
    }

    async fn list(&self, start: &str, stop: &str) -> TrackerResult<Vec<FileTrackerItem>> {
        FileTracker::list(self, start, stop).await
    }
}
