//! The freshness index: answers "what changed since freshness F" without
//! keeping history. Only the current item per key exists; the index orders
//! entries by the commit-time freshness counter, and entries whose item was
//! superseded are skipped lazily and dropped on compaction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use crate::item::Item;

#[derive(Clone)]
pub(crate) struct IndexEntry {
    pub freshness: u64,
    pub item: Arc<Item>,
}

struct IndexInner {
    /// Bumped on compaction; cursors from an older generation re-locate by
    /// freshness instead of position.
    generation: u64,
    /// Ascending by freshness. Scans walk it back to front (newest first).
    entries: Vec<IndexEntry>,
}

/// Resumable position in a scan: the entry at `pos` is the next one to
/// consider, walking toward older entries. Survives across transactions;
/// revalidated against generation and item identity on resume.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Cursor {
    pub generation: u64,
    pub pos: usize,
    pub freshness: u64,
}

pub struct FreshnessIndex {
    inner: Arc<RwLock<IndexInner>>,
    last: Arc<AtomicU64>,
}

impl Clone for FreshnessIndex {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            last: self.last.clone(),
        }
    }
}

impl FreshnessIndex {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(IndexInner {
                generation: 0,
                entries: Vec::new(),
            })),
            last: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current maximum freshness; monotonic, never decreases.
    pub fn last_freshness(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    /// Append a committed item. Must run under the commit lock so appends
    /// stay ordered by freshness.
    pub(crate) fn append(&self, item: Arc<Item>) {
        let freshness = item.freshness;
        let mut inner = self.inner.write().expect("index lock poisoned");
        debug_assert!(inner
            .entries
            .last()
            .is_none_or(|e| e.freshness <= freshness));
        inner.entries.push(IndexEntry { freshness, item });
        self.last.fetch_max(freshness, Ordering::AcqRel);
    }

    pub(crate) fn read(&self) -> IndexGuard<'_> {
        IndexGuard {
            inner: self.inner.read().expect("index lock poisoned"),
        }
    }

    /// Drop entries whose item is no longer live. `is_live` receives the
    /// indexed item and must compare it against the store's current entry.
    pub(crate) fn compact(&self, is_live: impl Fn(&Arc<Item>) -> bool) -> usize {
        let mut inner = self.inner.write().expect("index lock poisoned");
        let before = inner.entries.len();
        inner.entries.retain(|entry| is_live(&entry.item));
        let dropped = before - inner.entries.len();
        if dropped > 0 {
            inner.generation += 1;
        }
        dropped
    }

    /// Fraction-free stale estimate used to decide when to compact.
    pub(crate) fn entry_count(&self) -> usize {
        self.inner.read().expect("index lock poisoned").entries.len()
    }
}

impl Default for FreshnessIndex {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct IndexGuard<'a> {
    inner: RwLockReadGuard<'a, IndexInner>,
}

impl IndexGuard<'_> {
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn entry(&self, pos: usize) -> &IndexEntry {
        &self.inner.entries[pos]
    }

    /// Re-locate a cursor from an older generation: the position of the
    /// newest entry with freshness at or below `freshness`, or `None` if the
    /// scan is exhausted.
    pub fn locate_at_or_below(&self, freshness: u64) -> Option<usize> {
        let entries = &self.inner.entries;
        let upper = entries.partition_point(|e| e.freshness <= freshness);
        upper.checked_sub(1)
    }
}
