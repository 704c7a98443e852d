// Content hashes and disk partitioning
use crate::error::{TrackerError, TrackerResult};
use anyhow::Context;
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

/// Length in hex characters of a rendered content hash.
pub const HASH_HEX_LEN: usize = 32;

/// Default number of high hash bits used to pick a disk partition.
pub const DEFAULT_PARTITION_POWER: u8 = 6;

/// 128-bit content hash, always rendered as 32 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; 16]);

impl ContentHash {
    /// Compute a content hash from a file using streaming I/O
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Failed to open file: {}", path.display()))?;

        let reader = BufReader::with_capacity(1024 * 1024, file); // 1MB buffer
        Self::from_reader(reader)
            .with_context(|| format!("Failed to hash file: {}", path.display()))
    }

    /// Compute a content hash from any reader
    ///
    /// The hash is the first 128 bits of the BLAKE3 digest.
    pub fn from_reader<R: Read>(mut reader: R) -> anyhow::Result<Self> {
        let mut hasher = Hasher::new();
        let mut buffer = [0u8; 16384]; // 16KB chunks

        loop {
            let bytes_read = reader
                .read(&mut buffer)
                .context("Failed to read data for hashing")?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(Self::truncate(hasher.finalize()))
    }

    /// Compute a content hash from bytes in memory
    pub fn from_bytes(data: &[u8]) -> Self {
        Self::truncate(blake3::hash(data))
    }

    fn truncate(digest: blake3::Hash) -> Self {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest.as_bytes()[..16]);
        ContentHash(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = TrackerError;

    /// Accepts upper or lower case; anything but 32 hex characters is rejected.
    fn from_str(s: &str) -> TrackerResult<Self> {
        if s.len() != HASH_HEX_LEN {
            return Err(TrackerError::InvalidHash {
                hash: s.to_string(),
                reason: format!("length was {} not {}", s.len(), HASH_HEX_LEN),
            });
        }

        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s.to_ascii_lowercase(), &mut bytes).map_err(|e| {
            TrackerError::InvalidHash {
                hash: s.to_string(),
                reason: format!("decoding error: {}", e),
            }
        })?;

        Ok(ContentHash(bytes))
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Maps content hashes onto `2^power` disk partitions using the high bits
/// of the first hash byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    power: u8,
}

impl Partitioner {
    pub fn new(power: u8) -> TrackerResult<Self> {
        if !(1..=8).contains(&power) {
            return Err(TrackerError::InvalidConfig(format!(
                "partition power must be between 1 and 8, got {}",
                power
            )));
        }
        Ok(Self { power })
    }

    pub fn power(&self) -> u8 {
        self.power
    }

    /// Number of partitions.
    pub fn count(&self) -> usize {
        1 << self.power
    }

    /// Validate and normalize `hash`, returning it with its partition index.
    pub fn partition(&self, hash: &str) -> TrackerResult<(ContentHash, usize)> {
        let hash = ContentHash::from_str(hash)?;
        let partition = self.partition_of(&hash);
        Ok((hash, partition))
    }

    pub fn partition_of(&self, hash: &ContentHash) -> usize {
        (hash.0[0] >> (8 - self.power)) as usize
    }
}

impl Default for Partitioner {
    fn default() -> Self {
        Self {
            power: DEFAULT_PARTITION_POWER,
        }
    }
}
