//! Side channel for non-fatal events.
//!
//! The tracker reports problems it deliberately swallows (corrupt stored
//! metadata, stale blobs it could not remove) to a [`DiagnosticSink`]. Sinks
//! only observe; nothing they do feeds back into commit results.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// Stored metadata could not be decoded and was dropped in favour of the
    /// incoming metadata.
    CorruptStoredMetadata {
        hash: String,
        shard: u32,
        stored_timestamp: i64,
        stored_metahash: Option<String>,
        error: String,
    },

    /// Neither the merged nor the stored metadata could be re-encoded; the
    /// incoming metadata was kept unmerged.
    StoredMetadataReencodeFailed {
        hash: String,
        shard: u32,
        stored_timestamp: i64,
        error: String,
    },

    /// The blob of a superseded record could not be removed after commit.
    StaleBlobNotRemoved { path: PathBuf, error: String },

    /// A blob published by a commit that later failed could not be removed.
    UnreferencedBlobNotRemoved { path: PathBuf, error: String },
}

pub trait DiagnosticSink: Send + Sync {
    fn record(&self, diagnostic: Diagnostic);
}

/// Default sink: emits every diagnostic as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn record(&self, diagnostic: Diagnostic) {
        match diagnostic {
            Diagnostic::CorruptStoredMetadata {
                hash,
                shard,
                stored_timestamp,
                stored_metahash,
                error,
            } => tracing::error!(
                %hash,
                shard,
                stored_timestamp,
                stored_metahash = stored_metahash.as_deref().unwrap_or(""),
                %error,
                "error decoding metadata from db; discarding"
            ),
            Diagnostic::StoredMetadataReencodeFailed {
                hash,
                shard,
                stored_timestamp,
                error,
            } => tracing::error!(
                %hash,
                shard,
                stored_timestamp,
                %error,
                "error reencoding metadata from db; discarding"
            ),
            Diagnostic::StaleBlobNotRemoved { path, error } => tracing::error!(
                path = %path.display(),
                %error,
                "error removing older file"
            ),
            Diagnostic::UnreferencedBlobNotRemoved { path, error } => tracing::warn!(
                path = %path.display(),
                %error,
                "error removing blob of failed commit"
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Sink that keeps everything it is given.
    #[derive(Default)]
    pub(crate) struct MemorySink {
        events: Mutex<Vec<Diagnostic>>,
    }

    impl MemorySink {
        pub(crate) fn events(&self) -> Vec<Diagnostic> {
            self.events.lock().unwrap().clone()
        }
    }

    impl DiagnosticSink for MemorySink {
        fn record(&self, diagnostic: Diagnostic) {
            self.events.lock().unwrap().push(diagnostic);
        }
    }
}
