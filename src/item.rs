use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::VersionHash;

/// The atomic unit of replication: one key's current state. Owned by the
/// local store behind an `Arc` and never mutated after being indexed — every
/// change produces a new `Item`, and the freshness index detects staleness by
/// pointer identity against the live entry.
#[derive(Clone)]
pub struct Item {
    pub key: String,
    /// Registered type tag naming the merge handler for `data`.
    pub tag: String,
    /// Bincode encoding of the typed payload. Retained on tombstones so
    /// deletions still merge correctly against concurrent writes.
    pub data: Vec<u8>,
    /// Cached version hash of the payload.
    pub value_hash: VersionHash,
    pub deleted: bool,
    /// Absolute local deadline in unix ms; expired items read as absent.
    pub expires_at: Option<i64>,
    /// Backend-local logical timestamp, assigned at commit.
    pub freshness: u64,
    /// Set once the value reports itself deletable; the cleanup sweep purges
    /// it after the configured linger.
    pub removable_since: Option<i64>,
}

impl Item {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }

    /// Remaining lifetime relative to `now_ms`, as carried on the wire.
    pub fn expires_in_ms(&self, now_ms: i64) -> Option<i64> {
        self.expires_at.map(|at| at - now_ms)
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("key", &self.key)
            .field("tag", &self.tag)
            .field("bytes", &self.data.len())
            .field("deleted", &self.deleted)
            .field("freshness", &self.freshness)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Wire form of an [`Item`]: expiry is carried as a remaining duration so
/// servers with different wall clocks agree approximately, and the sender's
/// freshness is kept for group-preserving application on the receiver.
#[derive(Clone, Serialize, Deserialize)]
pub struct WireItem {
    pub key: String,
    pub tag: String,
    pub data: Vec<u8>,
    pub deleted: bool,
    pub expires_in_ms: Option<i64>,
    pub freshness: u64,
}

impl WireItem {
    pub fn from_item(item: &Item, now_ms: i64) -> Self {
        Self {
            key: item.key.clone(),
            tag: item.tag.clone(),
            data: item.data.clone(),
            deleted: item.deleted,
            expires_in_ms: item.expires_in_ms(now_ms),
            freshness: item.freshness,
        }
    }
}

impl fmt::Debug for WireItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireItem")
            .field("key", &self.key)
            .field("bytes", &self.data.len())
            .field("deleted", &self.deleted)
            .field("freshness", &self.freshness)
            .finish()
    }
}

/// Typed read including removal state, for callers that need to observe
/// tombstones and expired values still held for replication.
#[derive(Debug, Clone)]
pub struct ItemInfo<T> {
    pub value: T,
    pub deleted: bool,
    pub expired: bool,
    pub expires_in_ms: Option<i64>,
}
