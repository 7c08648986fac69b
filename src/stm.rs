//! A compact optimistic STM backing all shared-state mutation.
//!
//! A transaction buffers writes and records the version of everything it
//! read. Commit takes a process-wide lock, validates the read versions,
//! applies the buffered writes, runs commit-phase finalizers (still under the
//! lock), then releases and runs queued side effects exactly once. A failed
//! validation silently re-executes the body, so bodies must be free of
//! non-idempotent external effects — those belong in `side_effect`.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

static NEXT_STM_ID: AtomicU64 = AtomicU64::new(1);

/// Serializes validate+apply across all transactions in the process.
static COMMIT_LOCK: Mutex<()> = Mutex::new(());

fn next_stm_id() -> u64 {
    NEXT_STM_ID.fetch_add(1, Ordering::Relaxed)
}

type LogKey = (u64, Option<String>);

struct ReadEntry {
    cached: Box<dyn Any>,
    check: Box<dyn Fn() -> bool>,
}

struct WriteEntry {
    value: Box<dyn Any>,
    apply: Box<dyn FnOnce(Box<dyn Any>)>,
}

/// Explicit abort of the current attempt.
#[derive(Debug)]
pub enum TxAbort {
    /// Roll back and re-execute the body from the start.
    Retry,
}

pub type TxResult<T> = Result<T, TxAbort>;

/// Request a rollback-and-retry of the enclosing transaction.
pub fn retry<T>() -> TxResult<T> {
    Err(TxAbort::Retry)
}

/// The transaction context. Handed to the body by [`atomic`]; all access to
/// [`TxCell`], [`TxDict`] and [`TxLocal`] values goes through it.
pub struct Tx {
    reads: HashMap<LogKey, ReadEntry>,
    writes: HashMap<LogKey, WriteEntry>,
    finalizers: Vec<Box<dyn FnOnce()>>,
    effects: Vec<Box<dyn FnOnce()>>,
    locals: HashMap<u64, Box<dyn Any>>,
}

impl Tx {
    fn new() -> Self {
        Self {
            reads: HashMap::new(),
            writes: HashMap::new(),
            finalizers: Vec::new(),
            effects: Vec::new(),
            locals: HashMap::new(),
        }
    }

    /// Queue a closure to run after a successful commit. Never runs for a
    /// rolled-back attempt.
    pub fn side_effect(&mut self, f: impl FnOnce() + 'static) {
        self.effects.push(Box::new(f));
    }

    /// Queue a closure to run during commit, after the buffered writes were
    /// applied, still under the commit lock. Used for freshness stamping and
    /// index appends, which must observe a settled post-write state.
    pub(crate) fn finalize(&mut self, f: impl FnOnce() + 'static) {
        self.finalizers.push(Box::new(f));
    }

    fn get_write<U: Clone + 'static>(&self, key: &LogKey) -> Option<U> {
        self.writes.get(key).map(|w| {
            w.value
                .downcast_ref::<U>()
                .expect("stm write log type mismatch")
                .clone()
        })
    }

    fn get_read<U: Clone + 'static>(&self, key: &LogKey) -> Option<U> {
        self.reads.get(key).map(|r| {
            r.cached
                .downcast_ref::<U>()
                .expect("stm read log type mismatch")
                .clone()
        })
    }

    fn record_read<U: Clone + 'static>(
        &mut self,
        key: LogKey,
        cached: U,
        check: impl Fn() -> bool + 'static,
    ) {
        self.reads.entry(key).or_insert_with(|| ReadEntry {
            cached: Box::new(cached),
            check: Box::new(check),
        });
    }

    fn record_write<U: 'static>(
        &mut self,
        key: LogKey,
        value: U,
        apply: impl FnOnce(Box<dyn Any>) + 'static,
    ) {
        match self.writes.entry(key) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                entry.get_mut().value = Box::new(value);
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(WriteEntry {
                    value: Box::new(value),
                    apply: Box::new(apply),
                });
            }
        }
    }

    fn commit(mut self) -> bool {
        let effects = std::mem::take(&mut self.effects);
        let committed = {
            let _guard = COMMIT_LOCK.lock().expect("commit lock poisoned");
            if self.reads.values().all(|r| (r.check)()) {
                for (_, write) in self.writes.drain() {
                    (write.apply)(write.value);
                }
                for finalizer in self.finalizers.drain(..) {
                    finalizer();
                }
                true
            } else {
                false
            }
        };
        if committed {
            for effect in effects {
                effect();
            }
        }
        committed
    }
}

/// Run `body` in a transaction, retrying automatically on conflict or
/// explicit [`retry`] until it commits. The body may run any number of times.
pub fn atomic<T>(mut body: impl FnMut(&mut Tx) -> TxResult<T>) -> T {
    loop {
        let mut tx = Tx::new();
        match body(&mut tx) {
            Err(TxAbort::Retry) => {
                std::thread::yield_now();
            }
            Ok(value) => {
                if tx.commit() {
                    return value;
                }
            }
        }
    }
}

struct Slot<T> {
    version: u64,
    value: T,
}

/// A single transactional value.
pub struct TxCell<T> {
    id: u64,
    slot: Arc<RwLock<Slot<T>>>,
}

impl<T> Clone for TxCell<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            slot: self.slot.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> TxCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            id: next_stm_id(),
            slot: Arc::new(RwLock::new(Slot { version: 0, value })),
        }
    }

    pub fn get(&self, tx: &mut Tx) -> T {
        let key = (self.id, None);
        if let Some(value) = tx.get_write::<T>(&key) {
            return value;
        }
        if let Some(value) = tx.get_read::<T>(&key) {
            return value;
        }
        let (version, value) = {
            let slot = self.slot.read().expect("cell lock poisoned");
            (slot.version, slot.value.clone())
        };
        let slot = self.slot.clone();
        tx.record_read(key, value.clone(), move || {
            slot.read().expect("cell lock poisoned").version == version
        });
        value
    }

    pub fn set(&self, tx: &mut Tx, value: T) {
        let key = (self.id, None);
        let slot = self.slot.clone();
        tx.record_write(key, value, move |boxed| {
            let value = *boxed.downcast::<T>().expect("stm write log type mismatch");
            let mut slot = slot.write().expect("cell lock poisoned");
            slot.version += 1;
            slot.value = value;
        });
    }

    /// Committed value, read without transaction tracking.
    pub fn peek(&self) -> T {
        self.slot.read().expect("cell lock poisoned").value.clone()
    }

    /// Mutate in place, bumping the version so concurrent readers revalidate.
    /// Only sound under the commit lock, i.e. from a finalizer.
    pub(crate) fn update_direct(&self, f: impl FnOnce(&mut T)) {
        let mut slot = self.slot.write().expect("cell lock poisoned");
        slot.version += 1;
        f(&mut slot.value);
    }
}

struct DictSlot<V> {
    version: u64,
    value: Option<V>,
}

/// A transactional string-keyed map with per-key conflict detection. Removed
/// keys keep a versioned tombstone slot so absence is validated correctly.
pub struct TxDict<V> {
    id: u64,
    slots: Arc<RwLock<HashMap<String, DictSlot<V>>>>,
}

impl<V> Clone for TxDict<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            slots: self.slots.clone(),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> TxDict<V> {
    pub fn new() -> Self {
        Self {
            id: next_stm_id(),
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn get(&self, tx: &mut Tx, key: &str) -> Option<V> {
        let log_key = (self.id, Some(key.to_string()));
        if let Some(value) = tx.get_write::<Option<V>>(&log_key) {
            return value;
        }
        if let Some(value) = tx.get_read::<Option<V>>(&log_key) {
            return value;
        }
        let (version, value) = {
            let slots = self.slots.read().expect("dict lock poisoned");
            match slots.get(key) {
                Some(slot) => (slot.version, slot.value.clone()),
                None => (0, None),
            }
        };
        let slots = self.slots.clone();
        let owned_key = key.to_string();
        tx.record_read(log_key, value.clone(), move || {
            let slots = slots.read().expect("dict lock poisoned");
            match slots.get(&owned_key) {
                Some(slot) => slot.version == version,
                None => version == 0,
            }
        });
        value
    }

    pub fn set(&self, tx: &mut Tx, key: &str, value: V) {
        self.write(tx, key, Some(value));
    }

    pub fn remove(&self, tx: &mut Tx, key: &str) {
        self.write(tx, key, None);
    }

    fn write(&self, tx: &mut Tx, key: &str, value: Option<V>) {
        let log_key = (self.id, Some(key.to_string()));
        let slots = self.slots.clone();
        let owned_key = key.to_string();
        tx.record_write(log_key, value, move |boxed| {
            let value = *boxed
                .downcast::<Option<V>>()
                .expect("stm write log type mismatch");
            let mut slots = slots.write().expect("dict lock poisoned");
            let slot = slots.entry(owned_key).or_insert(DictSlot {
                version: 0,
                value: None,
            });
            slot.version += 1;
            slot.value = value;
        });
    }

    /// Committed value for `key`, read without transaction tracking.
    pub fn peek(&self, key: &str) -> Option<V> {
        self.slots
            .read()
            .expect("dict lock poisoned")
            .get(key)
            .and_then(|slot| slot.value.clone())
    }

    /// Committed live entries, read without transaction tracking.
    pub fn snapshot(&self) -> Vec<(String, V)> {
        self.slots
            .read()
            .expect("dict lock poisoned")
            .iter()
            .filter_map(|(k, slot)| slot.value.clone().map(|v| (k.clone(), v)))
            .collect()
    }

    /// Number of committed live entries.
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .expect("dict lock poisoned")
            .values()
            .filter(|slot| slot.value.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write bypassing the transaction log, bumping the key's version.
    /// Only sound under the commit lock, i.e. from a finalizer.
    pub(crate) fn write_direct(&self, key: &str, value: Option<V>) {
        let mut slots = self.slots.write().expect("dict lock poisoned");
        let slot = slots.entry(key.to_string()).or_insert(DictSlot {
            version: 0,
            value: None,
        });
        slot.version += 1;
        slot.value = value;
    }
}

impl<V: Clone + Send + Sync + 'static> Default for TxDict<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Transaction-local storage: a typed slot that lives for one transaction
/// attempt and is dropped on retry or commit.
pub struct TxLocal<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TxLocal<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            _marker: PhantomData,
        }
    }
}

impl<T: 'static> TxLocal<T> {
    pub fn new() -> Self {
        Self {
            id: next_stm_id(),
            _marker: PhantomData,
        }
    }

    pub fn entry<'a>(&self, tx: &'a mut Tx, init: impl FnOnce() -> T) -> &'a mut T {
        tx.locals
            .entry(self.id)
            .or_insert_with(|| Box::new(init()))
            .downcast_mut::<T>()
            .expect("stm local type mismatch")
    }

    pub fn get<'a>(&self, tx: &'a Tx) -> Option<&'a T> {
        tx.locals.get(&self.id).and_then(|b| b.downcast_ref())
    }
}

impl<T: 'static> Default for TxLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}
