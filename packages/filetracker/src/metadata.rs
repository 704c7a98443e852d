//! Mergeable object metadata.
//!
//! The tracker treats metadata as an opaque byte blob plus a `metahash`. When
//! a winning write carries a different metahash than the stored record, the
//! two stores are merged with [`reconcile`] through a [`MetadataCodec`], so the
//! wire format can change without touching the commit protocol.

use crate::diagnostics::{Diagnostic, DiagnosticSink};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),
}

/// Capability the tracker needs from a metadata format.
pub trait MetadataCodec: Send + Sync {
    type Store: Send;

    /// Store used when a write carries no metadata at all.
    fn empty(&self) -> Self::Store;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Store, MetadataError>;

    fn encode(&self, store: &Self::Store) -> Result<Vec<u8>, MetadataError>;

    /// Deterministic content hash of `store`.
    fn hash(&self, store: &Self::Store) -> String;

    /// Fold `other` into `into` without dropping keys only `other` has.
    fn absorb(&self, into: &mut Self::Store, other: &Self::Store);
}

/// A single metadata value and the logical time it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaEntry {
    pub ts: i64,
    pub value: serde_json::Value,
}

/// Last-writer-wins map of metadata entries.
///
/// Encoded as a JSON object keyed by entry name; keys are kept sorted so the
/// encoding, and therefore the hash, is canonical.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetaStore {
    entries: BTreeMap<String, MetaEntry>,
}

impl MetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, ts: i64, value: impl Into<serde_json::Value>) {
        self.entries.insert(
            key.into(),
            MetaEntry {
                ts,
                value: value.into(),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn entry(&self, key: &str) -> Option<&MetaEntry> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every key from `other` that is missing here, and any entry whose
    /// timestamp is strictly newer than ours. Ties keep our entry.
    pub fn absorb(&mut self, other: &MetaStore) {
        for (key, theirs) in &other.entries {
            match self.entries.get(key) {
                Some(ours) if ours.ts >= theirs.ts => {}
                _ => {
                    self.entries.insert(key.clone(), theirs.clone());
                }
            }
        }
    }

    /// First 128 bits of BLAKE3 over the entries, as 32 lowercase hex chars.
    pub fn hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (key, entry) in &self.entries {
            hasher.update(&(key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
            hasher.update(&entry.ts.to_le_bytes());
            let value = entry.value.to_string();
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        hex::encode(&hasher.finalize().as_bytes()[..16])
    }
}

/// JSON encoding of [`MetaStore`].
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl MetadataCodec for JsonCodec {
    type Store = MetaStore;

    fn empty(&self) -> MetaStore {
        MetaStore::new()
    }

    fn decode(&self, bytes: &[u8]) -> Result<MetaStore, MetadataError> {
        serde_json::from_slice(bytes).map_err(|e| MetadataError::Decode(e.to_string()))
    }

    fn encode(&self, store: &MetaStore) -> Result<Vec<u8>, MetadataError> {
        serde_json::to_vec(store).map_err(|e| MetadataError::Encode(e.to_string()))
    }

    fn hash(&self, store: &MetaStore) -> String {
        store.hash()
    }

    fn absorb(&self, into: &mut MetaStore, other: &MetaStore) {
        into.absorb(other);
    }
}

/// Metahash and serialized metadata as carried by one record version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub metahash: Option<String>,
    pub metadata: Option<Vec<u8>>,
}

/// The record currently stored for a key, seen from the reconciler.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StoredVersion<'a> {
    pub hash: &'a str,
    pub shard: u32,
    pub timestamp: i64,
    pub metahash: Option<&'a str>,
    pub metadata: Option<&'a [u8]>,
}

/// Merge the stored metadata into the metadata of a winning write.
///
/// Incoming metadata that does not decode is the caller's fault and fails
/// the commit. Stored metadata that does not decode is reported and dropped.
/// If the merged store cannot be re-encoded the caller is blamed, unless the
/// stored store cannot be re-encoded either; then the incoming metadata is
/// kept unmerged.
pub(crate) fn reconcile<C: MetadataCodec + ?Sized>(
    codec: &C,
    sink: &dyn DiagnosticSink,
    stored: &StoredVersion<'_>,
    incoming: Metadata,
) -> Result<Metadata, MetadataError> {
    let mut merged = match incoming.metadata.as_deref() {
        Some(bytes) => codec.decode(bytes)?,
        None => codec.empty(),
    };

    let Some(stored_bytes) = stored.metadata else {
        return Ok(incoming);
    };

    let stored_store = match codec.decode(stored_bytes) {
        Ok(store) => store,
        Err(e) => {
            sink.record(Diagnostic::CorruptStoredMetadata {
                hash: stored.hash.to_string(),
                shard: stored.shard,
                stored_timestamp: stored.timestamp,
                stored_metahash: stored.metahash.map(str::to_owned),
                error: e.to_string(),
            });
            return Ok(incoming);
        }
    };

    codec.absorb(&mut merged, &stored_store);

    match codec.encode(&merged) {
        Ok(bytes) => Ok(Metadata {
            metahash: Some(codec.hash(&merged)),
            metadata: Some(bytes),
        }),
        Err(e) => match codec.encode(&stored_store) {
            Ok(_) => Err(e),
            Err(stored_err) => {
                sink.record(Diagnostic::StoredMetadataReencodeFailed {
                    hash: stored.hash.to_string(),
                    shard: stored.shard,
                    stored_timestamp: stored.timestamp,
                    error: stored_err.to_string(),
                });
                Ok(incoming)
            }
        },
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// JSON codec that refuses to encode any store holding a `poison` key.
    #[derive(Debug, Default, Clone, Copy)]
    pub(crate) struct PoisonCodec;

    impl MetadataCodec for PoisonCodec {
        type Store = MetaStore;

        fn empty(&self) -> MetaStore {
            JsonCodec.empty()
        }

        fn decode(&self, bytes: &[u8]) -> Result<MetaStore, MetadataError> {
            JsonCodec.decode(bytes)
        }

        fn encode(&self, store: &MetaStore) -> Result<Vec<u8>, MetadataError> {
            if store.get("poison").is_some() {
                return Err(MetadataError::Encode("poisoned store".to_string()));
            }
            JsonCodec.encode(store)
        }

        fn hash(&self, store: &MetaStore) -> String {
            store.hash()
        }

        fn absorb(&self, into: &mut MetaStore, other: &MetaStore) {
            into.absorb(other);
        }
    }

    pub(crate) fn encoded(pairs: &[(&str, i64, serde_json::Value)]) -> (String, Vec<u8>) {
        let mut store = MetaStore::new();
        for (key, ts, value) in pairs {
            store.set(*key, *ts, value.clone());
        }
        (store.hash(), serde_json::to_vec(&store).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{encoded, PoisonCodec};
    use super::*;
    use crate::diagnostics::testing::MemorySink;
    use serde_json::json;

    const HASH: &str = "0123456789abcdef0123456789abcdef";

    fn stored<'a>(metahash: &'a str, metadata: &'a [u8]) -> StoredVersion<'a> {
        StoredVersion {
            hash: HASH,
            shard: 0,
            timestamp: 100,
            metahash: Some(metahash),
            metadata: Some(metadata),
        }
    }

    fn incoming(metahash: String, metadata: Vec<u8>) -> Metadata {
        Metadata {
            metahash: Some(metahash),
            metadata: Some(metadata),
        }
    }

    #[test]
    fn test_absorb_keeps_keys_from_both_sides() {
        let mut ours = MetaStore::new();
        ours.set("b", 1, 2);
        let mut theirs = MetaStore::new();
        theirs.set("a", 1, 1);

        ours.absorb(&theirs);
        assert_eq!(ours.get("a"), Some(&json!(1)));
        assert_eq!(ours.get("b"), Some(&json!(2)));
        assert_eq!(ours.len(), 2);
    }

    #[test]
    fn test_absorb_conflicts_prefer_receiver_unless_strictly_newer() {
        let mut ours = MetaStore::new();
        ours.set("tie", 5, "ours");
        ours.set("older", 5, "ours");
        let mut theirs = MetaStore::new();
        theirs.set("tie", 5, "theirs");
        theirs.set("older", 9, "theirs");

        ours.absorb(&theirs);
        assert_eq!(ours.get("tie"), Some(&json!("ours")));
        assert_eq!(ours.get("older"), Some(&json!("theirs")));
    }

    #[test]
    fn test_absorb_converges_regardless_of_order() {
        let mut a = MetaStore::new();
        a.set("x", 1, "a");
        a.set("y", 7, "a");
        let mut b = MetaStore::new();
        b.set("x", 3, "b");
        b.set("z", 2, "b");

        let mut ab = a.clone();
        ab.absorb(&b);
        let mut ba = b.clone();
        ba.absorb(&a);
        assert_eq!(ab, ba);
        assert_eq!(ab.hash(), ba.hash());

        // Idempotent
        let before = ab.clone();
        ab.absorb(&b);
        assert_eq!(ab, before);
    }

    #[test]
    fn test_hash_is_deterministic_and_content_sensitive() {
        let mut one = MetaStore::new();
        one.set("k", 1, "v");
        one.set("j", 2, "w");
        let mut two = MetaStore::new();
        two.set("j", 2, "w");
        two.set("k", 1, "v");
        assert_eq!(one.hash(), two.hash());
        assert_eq!(one.hash().len(), 32);

        two.set("k", 1, "changed");
        assert_ne!(one.hash(), two.hash());
    }

    #[test]
    fn test_json_codec_decodes_what_it_encodes() {
        let mut store = MetaStore::new();
        store.set("content-type", 10, "text/plain");
        let bytes = JsonCodec.encode(&store).unwrap();
        assert_eq!(JsonCodec.decode(&bytes).unwrap(), store);
        assert!(JsonCodec.decode(b"not json").is_err());
    }

    #[test]
    fn test_reconcile_merges_stored_keys() {
        let sink = MemorySink::default();
        let (stored_hash, stored_bytes) = encoded(&[("a", 1, json!(1))]);
        let (in_hash, in_bytes) = encoded(&[("b", 2, json!(2))]);

        let merged = reconcile(
            &JsonCodec,
            &sink,
            &stored(&stored_hash, &stored_bytes),
            incoming(in_hash.clone(), in_bytes),
        )
        .unwrap();

        let store = JsonCodec.decode(merged.metadata.as_deref().unwrap()).unwrap();
        assert_eq!(store.get("a"), Some(&json!(1)));
        assert_eq!(store.get("b"), Some(&json!(2)));
        assert_eq!(merged.metahash, Some(store.hash()));
        assert_ne!(merged.metahash, Some(in_hash));
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_reconcile_rejects_bad_incoming_metadata() {
        let sink = MemorySink::default();
        let (stored_hash, stored_bytes) = encoded(&[("a", 1, json!(1))]);

        let err = reconcile(
            &JsonCodec,
            &sink,
            &stored(&stored_hash, &stored_bytes),
            incoming("ffff".to_string(), b"{broken".to_vec()),
        )
        .unwrap_err();
        assert!(matches!(err, MetadataError::Decode(_)));
    }

    #[test]
    fn test_reconcile_discards_corrupt_stored_metadata() {
        let sink = MemorySink::default();
        let (in_hash, in_bytes) = encoded(&[("b", 2, json!(2))]);
        let original = incoming(in_hash, in_bytes);

        let result = reconcile(
            &JsonCodec,
            &sink,
            &stored("stale", b"\x00garbage"),
            original.clone(),
        )
        .unwrap();

        assert_eq!(result, original);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            Diagnostic::CorruptStoredMetadata { stored_timestamp: 100, .. }
        ));
    }

    #[test]
    fn test_reconcile_without_incoming_metadata_keeps_stored_keys() {
        let sink = MemorySink::default();
        let (stored_hash, stored_bytes) = encoded(&[("a", 1, json!("kept"))]);

        let merged = reconcile(
            &JsonCodec,
            &sink,
            &stored(&stored_hash, &stored_bytes),
            Metadata::default(),
        )
        .unwrap();

        let store = JsonCodec.decode(merged.metadata.as_deref().unwrap()).unwrap();
        assert_eq!(store.get("a"), Some(&json!("kept")));
    }

    #[test]
    fn test_reconcile_without_stored_metadata_keeps_incoming() {
        let sink = MemorySink::default();
        let (in_hash, in_bytes) = encoded(&[("b", 2, json!(2))]);
        let original = incoming(in_hash, in_bytes);
        let version = StoredVersion {
            hash: HASH,
            shard: 1,
            timestamp: 5,
            metahash: None,
            metadata: None,
        };

        let result = reconcile(&JsonCodec, &sink, &version, original.clone()).unwrap();
        assert_eq!(result, original);
    }

    #[test]
    fn test_reconcile_blames_caller_when_only_merge_fails_to_encode() {
        let sink = MemorySink::default();
        let (stored_hash, stored_bytes) = encoded(&[("a", 1, json!(1))]);
        let (in_hash, in_bytes) = encoded(&[("poison", 2, json!(true))]);

        let err = reconcile(
            &PoisonCodec,
            &sink,
            &stored(&stored_hash, &stored_bytes),
            incoming(in_hash, in_bytes),
        )
        .unwrap_err();
        assert!(matches!(err, MetadataError::Encode(_)));
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_reconcile_double_encode_failure_keeps_incoming_unmerged() {
        let sink = MemorySink::default();
        let (stored_hash, stored_bytes) = encoded(&[("poison", 1, json!(true))]);
        let (in_hash, in_bytes) = encoded(&[("b", 2, json!(2))]);
        let original = incoming(in_hash, in_bytes);

        let result = reconcile(
            &PoisonCodec,
            &sink,
            &stored(&stored_hash, &stored_bytes),
            original.clone(),
        )
        .unwrap();

        assert_eq!(result, original);
        assert!(matches!(
            sink.events().as_slice(),
            [Diagnostic::StoredMetadataReencodeFailed { .. }]
        ));
    }
}
