//! Content digests used for archive integrity.
//!
//! Every digest in an archive is SHA-256, hex encoded in the manifest. Payload digests are
//! memoized by payload identity in a [`HashCache`], and the manifest digest is computed over a
//! canonical JSON form so key order never changes the result.

use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicUsize, Ordering},
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::payload::{Payload, PayloadId};

/// Name written to `integrity.algorithm`.
pub const DIGEST_ALGORITHM: &str = "sha256";

/// A 256-bit content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the digest of content bytes.
    pub fn compute(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.to_hex())
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ContentDigest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(format!("Invalid digest length: expected 64, got {}", s.len()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| e.to_string())?;
        Ok(Self(bytes))
    }
}

impl Serialize for ContentDigest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Payload digests memoized by payload identity.
///
/// Payload bytes are immutable once wrapped, so an entry never goes stale and the cache
/// survives builder resets.
#[derive(Debug)]
pub struct HashCache {
    digests: DashMap<PayloadId, ContentDigest>,
    computations: AtomicUsize,
    available: bool,
}

impl HashCache {
    /// `available = false` models a runtime without secure hashing: every lookup yields `None`.
    pub fn new(available: bool) -> Self {
        Self {
            digests: DashMap::new(),
            computations: AtomicUsize::new(0),
            available,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Digest of `payload`, computed at most once per payload identity.
    pub async fn precompute(&self, payload: &Payload) -> Option<ContentDigest> {
        if !self.available {
            return None;
        }
        if let Some(d) = self.digests.get(&payload.id()) {
            return Some(*d);
        }
        tokio::task::yield_now().await;
        let digest = *self.digests.entry(payload.id()).or_insert_with(|| {
            self.computations.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(name = payload.name(), size = payload.size(), "hashing payload");
            ContentDigest::compute(payload.bytes())
        });
        Some(digest)
    }

    /// Previously computed digest, without computing.
    pub fn get(&self, id: PayloadId) -> Option<ContentDigest> {
        self.digests.get(&id).map(|d| *d)
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Number of digests actually computed (cache misses).
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::Relaxed)
    }
}

impl Default for HashCache {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Digest of a value's canonical JSON form (object keys sorted recursively).
pub fn canonical_json_digest<T: Serialize>(value: &T) -> Result<ContentDigest, serde_json::Error> {
    let mut value = serde_json::to_value(value)?;
    canonicalize_json(&mut value);
    let content = serde_json::to_vec(&value)?;
    Ok(ContentDigest::compute(&content))
}

fn canonicalize_json(value: &mut Value) {
    match value {
        Value::Array(items) => {
            for item in items.iter_mut() {
                canonicalize_json(item);
            }
        }
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = serde_json::Map::with_capacity(entries.len());
            for (key, mut value) in entries {
                canonicalize_json(&mut value);
                sorted.insert(key, value);
            }
            *map = sorted;
        }
        _ => {}
    }
}
