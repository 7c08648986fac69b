use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{Mergeable, Relationship, ServerId, VersionHash};

/// Per-entry value of a [`Vector`]. Missing entries compare as the type's
/// default, and `merge` must be commutative, associative and idempotent.
pub trait VectorValue:
    Clone + Default + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn merge(left: &Self, right: &Self) -> Self;
    fn compare(left: &Self, right: &Self) -> Relationship;
    fn hash_bytes(&self) -> Vec<u8>;
}

impl VectorValue for u64 {
    fn merge(left: &Self, right: &Self) -> Self {
        (*left).max(*right)
    }

    fn compare(left: &Self, right: &Self) -> Relationship {
        Relationship::from_ordering(left.cmp(right))
    }

    fn hash_bytes(&self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }
}

impl VectorValue for i64 {
    fn merge(left: &Self, right: &Self) -> Self {
        (*left).max(*right)
    }

    fn compare(left: &Self, right: &Self) -> Relationship {
        Relationship::from_ordering(left.cmp(right))
    }

    fn hash_bytes(&self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }
}

/// One `(server, value)` entry of a vector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct VectorItem<T> {
    pub server: ServerId,
    pub value: T,
}

/// A CRDT vector: an unordered set of per-server values, unique per server id.
/// Comparison is pairwise per server (missing entries read as the default) and
/// the overall relationship is the bitwise-or of the per-entry relationships.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct Vector<T: VectorValue> {
    items: Vec<VectorItem<T>>,
}

impl<T: VectorValue> Vector<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn single(server: impl Into<ServerId>, value: T) -> Self {
        Self {
            items: vec![VectorItem {
                server: server.into(),
                value,
            }],
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VectorItem<T>> {
        self.items.iter()
    }

    /// The value recorded for `server`, or the default if absent.
    pub fn get(&self, server: &ServerId) -> T {
        self.items
            .iter()
            .find(|i| &i.server == server)
            .map(|i| i.value.clone())
            .unwrap_or_default()
    }

    /// Return a new vector with `server`'s entry replaced by
    /// `modifier(current)`, inserting the entry if absent.
    pub fn modify(&self, server: &ServerId, modifier: impl FnOnce(T) -> T) -> Self {
        let mut items = self.items.clone();
        match items.iter_mut().find(|i| &i.server == server) {
            Some(item) => item.value = modifier(item.value.clone()),
            None => items.push(VectorItem {
                server: server.clone(),
                value: modifier(T::default()),
            }),
        }
        Self { items }
    }

    pub fn with(&self, server: &ServerId, value: T) -> Self {
        self.modify(server, |_| value)
    }

    /// Pairwise join keyed by normalized server id. Duplicate entries for one
    /// server on the same side are merged before joining.
    fn join<'a>(&'a self, other: &'a Self) -> Vec<(ServerId, T, T)> {
        let mut joined: BTreeMap<String, (ServerId, Option<T>, Option<T>)> = BTreeMap::new();
        for item in &self.items {
            let entry = joined
                .entry(item.server.normalized())
                .or_insert_with(|| (item.server.clone(), None, None));
            entry.1 = Some(match entry.1.take() {
                Some(existing) => T::merge(&existing, &item.value),
                None => item.value.clone(),
            });
        }
        for item in &other.items {
            let entry = joined
                .entry(item.server.normalized())
                .or_insert_with(|| (item.server.clone(), None, None));
            entry.2 = Some(match entry.2.take() {
                Some(existing) => T::merge(&existing, &item.value),
                None => item.value.clone(),
            });
        }
        joined
            .into_values()
            .map(|(server, left, right)| {
                (server, left.unwrap_or_default(), right.unwrap_or_default())
            })
            .collect()
    }

    pub fn compare(&self, other: &Self) -> Relationship {
        self.join(other)
            .into_iter()
            .fold(Relationship::Equal, |acc, (_, left, right)| {
                acc | T::compare(&left, &right)
            })
    }

    pub fn merged(&self, other: &Self) -> Self {
        let items = self
            .join(other)
            .into_iter()
            .map(|(server, left, right)| VectorItem {
                value: T::merge(&left, &right),
                server,
            })
            .collect();
        Self { items }
    }
}

impl<T: VectorValue> Default for Vector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: VectorValue> PartialEq for Vector<T> {
    fn eq(&self, other: &Self) -> bool {
        self.join(other)
            .into_iter()
            .all(|(_, left, right)| left == right)
    }
}

impl<T: VectorValue> fmt::Debug for Vector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_map();
        for item in &self.items {
            list.entry(&item.server, &item.value);
        }
        list.finish()
    }
}

impl<T: VectorValue> Mergeable for Vector<T> {
    fn merge_with(&self, other: &Self) -> (Self, Relationship) {
        (self.merged(other), self.compare(other))
    }

    fn version_hash(&self) -> VersionHash {
        let mut parts: Vec<Vec<u8>> = Vec::with_capacity(self.items.len() * 2);
        let mut sorted: Vec<&VectorItem<T>> = self.items.iter().collect();
        sorted.sort_by_key(|i| i.server.normalized());
        for item in sorted {
            parts.push(item.server.normalized().into_bytes());
            parts.push(item.value.hash_bytes());
        }
        VersionHash::hash_parts(parts.iter().map(|p| p.as_slice()))
    }
}

/// Classic vector clock: one monotonically increasing counter per server,
/// merged with max.
pub type VectorClock = Vector<u64>;

impl VectorClock {
    /// Bump this server's slot by one.
    pub fn next(&self, own: &ServerId) -> Self {
        self.modify(own, |n| n + 1)
    }
}

/// Per-server counters merged with max; the logical total is the sum. Each
/// server only ever increments its own slot, so max-merge loses nothing.
pub type CountVector = Vector<i64>;

impl CountVector {
    pub fn increment(&self, own: &ServerId) -> Self {
        self.modify(own, |n| n + 1)
    }

    pub fn increment_by(&self, own: &ServerId, by: i64) -> Self {
        self.modify(own, |n| n + by)
    }

    pub fn total(&self) -> i64 {
        self.iter().map(|i| i.value).sum()
    }
}

/// The state of a distributed transaction on one server. States are bit flags
/// ordered by severity; merging takes the numerically larger value.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionState(u8);

impl TransactionState {
    pub const NONE: Self = Self(0);
    pub const PREPARED: Self = Self(1);
    pub const REJECTED: Self = Self(2);
    pub const DONE: Self = Self(4);
    pub const SUCCESS: Self = Self(1 | 4);
    pub const FAIL: Self = Self(2 | 4);

    pub fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0 && flag.0 != 0
    }
}

impl fmt::Debug for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::NONE => "None",
            Self::PREPARED => "Prepared",
            Self::REJECTED => "Rejected",
            Self::DONE => "Done",
            Self::SUCCESS => "Success",
            Self::FAIL => "Fail",
            _ => return write!(f, "TransactionState({:#b})", self.0),
        };
        f.write_str(name)
    }
}

impl VectorValue for TransactionState {
    fn merge(left: &Self, right: &Self) -> Self {
        (*left).max(*right)
    }

    fn compare(left: &Self, right: &Self) -> Relationship {
        Relationship::from_ordering(left.cmp(right))
    }

    fn hash_bytes(&self) -> Vec<u8> {
        vec![self.0]
    }
}

/// Vector of per-server transaction states; the CRDT that carries the votes
/// of a distributed transaction.
pub type TransactionVector = Vector<TransactionState>;

impl TransactionVector {
    fn count(&self, flag: TransactionState) -> usize {
        self.iter().filter(|i| i.value.contains(flag)).count()
    }

    /// More than half of the known slots voted prepared.
    pub fn is_prepared(&self) -> bool {
        self.count(TransactionState::PREPARED) > self.len() / 2
    }

    /// More than half of the known slots voted rejected.
    pub fn is_rejected(&self) -> bool {
        self.count(TransactionState::REJECTED) > self.len() / 2
    }

    pub fn is_done(&self) -> bool {
        self.count(TransactionState::DONE) > 0
    }

    pub fn is_success(&self) -> bool {
        self.iter().any(|i| i.value == TransactionState::SUCCESS)
    }

    pub fn is_fail(&self) -> bool {
        self.iter().any(|i| i.value == TransactionState::FAIL)
    }

    /// More than half of the slots reached a done state; the transaction info
    /// may then be purged.
    pub fn done_majority(&self) -> bool {
        self.count(TransactionState::DONE) > self.len() / 2
    }
}
