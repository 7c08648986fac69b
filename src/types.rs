use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{BitOr, BitOrAssign, BitXor, BitXorAssign};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identifier of a server in the cluster. Comparison, hashing and ordering are
/// case-insensitive, matching the tie-break rules of the gossip handshake.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercased form, used as a map key wherever servers index state.
    pub fn normalized(&self) -> String {
        self.0.to_lowercase()
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl PartialEq for ServerId {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for ServerId {}

impl PartialOrd for ServerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServerId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized().cmp(&other.normalized())
    }
}

impl Hash for ServerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerId({})", self.0)
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ServerId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// How one mergeable value relates to another.
///
/// `Conflict` means the merge of the two strictly dominates both inputs while
/// neither input dominates the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relationship {
    Equal,
    Less,
    Greater,
    Conflict,
}

impl Relationship {
    pub fn from_ordering(ord: Ordering) -> Self {
        match ord {
            Ordering::Less => Relationship::Less,
            Ordering::Equal => Relationship::Equal,
            Ordering::Greater => Relationship::Greater,
        }
    }

    /// True for `Greater` and `Conflict`, i.e. the left side contributed
    /// something the right side did not have.
    pub fn has_greater(self) -> bool {
        matches!(self, Relationship::Greater | Relationship::Conflict)
    }
}

impl BitOr for Relationship {
    type Output = Relationship;

    fn bitor(self, rhs: Relationship) -> Relationship {
        use Relationship::*;
        match (self, rhs) {
            (Equal, r) => r,
            (l, Equal) => l,
            (Conflict, _) | (_, Conflict) => Conflict,
            (Less, Less) => Less,
            (Greater, Greater) => Greater,
            (Less, Greater) | (Greater, Less) => Conflict,
        }
    }
}

impl BitOrAssign for Relationship {
    fn bitor_assign(&mut self, rhs: Relationship) {
        *self = *self | rhs;
    }
}

/// FNV-1a 64-bit hash over a value's version-relevant bytes. XOR-combined into
/// the rolling database hash, so contributions can be added and removed
/// incrementally.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionHash(pub u64);

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

impl VersionHash {
    pub fn hash_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hash = FNV_OFFSET;
        for part in parts {
            for byte in part {
                hash ^= u64::from(*byte);
                hash = hash.wrapping_mul(FNV_PRIME);
            }
            // separator so ("ab","c") and ("a","bc") differ
            hash ^= 0xff;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        Self(hash)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl BitXor for VersionHash {
    type Output = VersionHash;

    fn bitxor(self, rhs: VersionHash) -> VersionHash {
        VersionHash(self.0 ^ rhs.0)
    }
}

impl BitXorAssign for VersionHash {
    fn bitxor_assign(&mut self, rhs: VersionHash) {
        self.0 ^= rhs.0;
    }
}

impl fmt::Debug for VersionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionHash({:016x})", self.0)
    }
}

/// Contract for replicated values: a commutative, associative, idempotent
/// merge, a cheap version hash, and an optional signal that the value has
/// become safe to purge from the store.
pub trait Mergeable: Sized {
    /// Merge `self` (the incoming value) with `other` (the stored value).
    /// The returned relationship classifies `self` relative to `other`.
    fn merge_with(&self, other: &Self) -> (Self, Relationship);

    /// Hash over the bytes that identify this value's version. Two values
    /// with equal version hashes are assumed identical.
    fn version_hash(&self) -> VersionHash;

    /// Whether the value may be garbage-collected once merge-stable.
    fn can_delete(&self) -> bool {
        false
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| Error::Codec(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| Error::Codec(e.to_string()))
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(Error::InvalidArgument("key must not be blank".into()));
    }
    Ok(())
}
