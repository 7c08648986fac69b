use serde::{Deserialize, Serialize};

use crate::types::{Mergeable, Relationship, ServerId, VersionHash};
use crate::vector::VectorClock;

/// A plain value tagged with a vector clock. This is how values without
/// native CRDT semantics enter the store: the clock decides which version
/// dominates, and [`Multiple`] keeps the survivors when neither does.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub value: T,
    pub clock: VectorClock,
}

impl<T> Versioned<T> {
    pub fn new(value: T, clock: VectorClock) -> Self {
        Self { value, clock }
    }

    /// Initial version authored by `server`.
    pub fn first(value: T, server: &ServerId) -> Self {
        Self {
            value,
            clock: VectorClock::new().next(server),
        }
    }

    /// The same value under a clock bumped for `server`; replace `value`
    /// afterwards to author the next version.
    pub fn next_version(&self, server: &ServerId) -> Self
    where
        T: Clone,
    {
        Self {
            value: self.value.clone(),
            clock: self.clock.next(server),
        }
    }
}

/// The set of mutually conflicting versions of a value. Merging unions the
/// version sets and drops any version dominated by a surviving one, so the
/// set only holds versions no participant has superseded yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Multiple<T> {
    versions: Vec<Versioned<T>>,
}

impl<T: Clone + PartialEq> Multiple<T> {
    pub fn new() -> Self {
        Self {
            versions: Vec::new(),
        }
    }

    pub fn single(version: Versioned<T>) -> Self {
        Self {
            versions: vec![version],
        }
    }

    pub fn versions(&self) -> &[Versioned<T>] {
        &self.versions
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// The single surviving version, if there is exactly one.
    pub fn single_version(&self) -> Option<&Versioned<T>> {
        match self.versions.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    /// Union of all surviving versions' clocks.
    pub fn clock(&self) -> VectorClock {
        self.versions
            .iter()
            .fold(VectorClock::new(), |acc, v| acc.merged(&v.clock))
    }
}

impl<T: Clone + PartialEq> Default for Multiple<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + PartialEq> From<Versioned<T>> for Multiple<T> {
    fn from(version: Versioned<T>) -> Self {
        Self::single(version)
    }
}

impl<T: Clone + PartialEq> Mergeable for Multiple<T> {
    fn merge_with(&self, other: &Self) -> (Self, Relationship) {
        let relationship = self.clock().compare(&other.clock());

        let all: Vec<&Versioned<T>> =
            self.versions.iter().chain(other.versions.iter()).collect();
        let mut survivors: Vec<Versioned<T>> = Vec::new();
        for candidate in &all {
            let dominated = all
                .iter()
                .any(|v| candidate.clock.compare(&v.clock) == Relationship::Less);
            let duplicate = survivors.iter().any(|kept| kept.clock == candidate.clock);
            if !dominated && !duplicate {
                survivors.push((*candidate).clone());
            }
        }

        (
            Self {
                versions: survivors,
            },
            relationship,
        )
    }

    fn version_hash(&self) -> VersionHash {
        self.clock().version_hash()
    }
}
