//! The consistent transaction layer: a two-phase prepare/commit protocol
//! without a coordinator service. The transaction ledger is itself a CRDT
//! stored under an ordinary key, so votes and decisions propagate through
//! the same direct-mail and anti-entropy paths as every other value.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::stm::{atomic, Tx};
use crate::store::GossipNode;
use crate::types::{
    decode, encode, now_ms, validate_key, Mergeable, Relationship, ServerId, VersionHash,
};
use crate::vector::{TransactionState, TransactionVector, VectorValue};
use crate::versioned::{Multiple, Versioned};

/// Keys holding transaction ledgers start with this prefix.
pub const TRANSACTION_PREFIX: &str = "tx|";

const TRANSACTION_TAG: &str = "~tx-info";

/// One key read by a consistent transaction, with the version hash of the
/// value seen (or `None` for an absent/removed value). Voters re-validate
/// these against their own store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadStamp {
    pub key: String,
    pub value_hash: Option<VersionHash>,
}

/// One key changed by a consistent transaction: the merged payload the
/// initiator computed, applied verbatim by every server on commit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxChange {
    pub key: String,
    pub tag: String,
    pub data: Vec<u8>,
    pub deleted: bool,
    pub expires_in_ms: Option<i64>,
}

/// The replicated transaction ledger. Reads and changes are set once by the
/// initiator and never modified; merging merges only the vote vector.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub initiator: ServerId,
    pub reads: Vec<ReadStamp>,
    pub changes: Vec<TxChange>,
    pub state: TransactionVector,
}

impl TransactionInfo {
    pub fn all_keys(&self) -> impl Iterator<Item = &str> {
        self.reads
            .iter()
            .map(|r| r.key.as_str())
            .chain(self.changes.iter().map(|c| c.key.as_str()))
    }

    pub fn with_state(&self, server: &ServerId, state: TransactionState) -> Self {
        Self {
            initiator: self.initiator.clone(),
            reads: self.reads.clone(),
            changes: self.changes.clone(),
            state: self
                .state
                .modify(server, |current| TransactionState::merge(&current, &state)),
        }
    }
}

impl Mergeable for TransactionInfo {
    fn merge_with(&self, other: &Self) -> (Self, Relationship) {
        let relationship = self.state.compare(&other.state);
        (
            Self {
                initiator: self.initiator.clone(),
                reads: self.reads.clone(),
                changes: self.changes.clone(),
                state: self.state.merged(&other.state),
            },
            relationship,
        )
    }

    fn version_hash(&self) -> VersionHash {
        self.state.version_hash()
    }

    /// Safe once a majority recorded Done: a revived copy re-validates its
    /// reads, fails, and becomes deletable again.
    fn can_delete(&self) -> bool {
        self.state.done_majority()
    }
}

/// Outcome the initiator waits on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TxOutcome {
    Pending,
    Committed,
    Rejected,
}

enum Attempt<T> {
    Started {
        tx_key: String,
        receiver: watch::Receiver<TxOutcome>,
        value: T,
    },
    LocalConflict {
        value: T,
    },
}

/// Records the reads and writes of a consistent transaction body. Writes are
/// buffered here, not applied to the store, until the cluster votes.
pub struct ConsistentTx<'a> {
    tx: &'a mut Tx,
    node: &'a ConsistentNode,
    reads: Vec<ReadStamp>,
    read_keys: HashSet<String>,
    changes: Vec<TxChange>,
    change_index: HashMap<String, usize>,
}

impl ConsistentTx<'_> {
    fn stamp(&mut self, key: &str) {
        if self.read_keys.insert(key.to_string()) {
            let value_hash = self
                .node
                .base
                .get_active_item(self.tx, key)
                .map(|i| i.value_hash);
            self.reads.push(ReadStamp {
                key: key.to_string(),
                value_hash,
            });
        }
    }

    pub fn try_get<T>(&mut self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + 'static,
    {
        validate_key(key)?;
        if let Some(&i) = self.change_index.get(key) {
            let change = &self.changes[i];
            if change.deleted {
                return Ok(None);
            }
            return Ok(Some(decode(&change.data)?));
        }
        self.stamp(key);
        self.node.base.try_get_tx(self.tx, key)
    }

    pub fn contains_key(&mut self, key: &str) -> Result<bool> {
        validate_key(key)?;
        if let Some(&i) = self.change_index.get(key) {
            return Ok(!self.changes[i].deleted);
        }
        self.stamp(key);
        Ok(self.node.base.get_active_item(self.tx, key).is_some())
    }

    pub fn set<T>(&mut self, key: &str, value: &T, expire_in_ms: Option<i64>) -> Result<Relationship>
    where
        T: Mergeable + Serialize + DeserializeOwned + 'static,
    {
        validate_key(key)?;
        if expire_in_ms.is_some_and(|ms| ms <= 0) {
            return Err(Error::InvalidArgument(
                "expire_in_ms must be positive".into(),
            ));
        }
        let tag = self.node.base.registry().tag_of::<T>()?;
        self.stamp(key);
        let current: Option<T> = if let Some(&i) = self.change_index.get(key) {
            let change = &self.changes[i];
            if change.deleted {
                None
            } else {
                Some(decode(&change.data)?)
            }
        } else {
            match self.node.base.get_active_item(self.tx, key) {
                Some(item) if item.tag == tag => Some(decode(&item.data)?),
                Some(_) => return Err(Error::TagConflict { tag }),
                None => None,
            }
        };
        let (data, relationship) = match current {
            Some(old) => {
                let (merged, rel) = value.merge_with(&old);
                if matches!(rel, Relationship::Less | Relationship::Equal) {
                    return Ok(rel);
                }
                (encode(&merged)?, rel)
            }
            None => (encode(value)?, Relationship::Greater),
        };
        self.record_change(TxChange {
            key: key.to_string(),
            tag,
            data,
            deleted: false,
            expires_in_ms: expire_in_ms,
        });
        Ok(relationship)
    }

    pub fn set_versioned<T>(
        &mut self,
        key: &str,
        version: Versioned<T>,
        expire_in_ms: Option<i64>,
    ) -> Result<Relationship>
    where
        T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.set(key, &Multiple::single(version), expire_in_ms)
    }

    pub fn remove(&mut self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.stamp(key);
        let current = if let Some(&i) = self.change_index.get(key) {
            let change = &self.changes[i];
            if change.deleted {
                None
            } else {
                Some((change.tag.clone(), change.data.clone()))
            }
        } else {
            self.node
                .base
                .get_active_item(self.tx, key)
                .map(|item| (item.tag.clone(), item.data.clone()))
        };
        let Some((tag, data)) = current else {
            return Ok(false);
        };
        self.record_change(TxChange {
            key: key.to_string(),
            tag,
            data,
            deleted: true,
            expires_in_ms: None,
        });
        Ok(true)
    }

    fn record_change(&mut self, change: TxChange) {
        match self.change_index.get(&change.key) {
            Some(&i) => self.changes[i] = change,
            None => {
                self.change_index
                    .insert(change.key.clone(), self.changes.len());
                self.changes.push(change);
            }
        }
    }
}

/// A handle to a prepared but undecided transaction. Dropping it without
/// committing records a rollback vote.
pub struct PreparedTransaction<T> {
    node: Arc<ConsistentNode>,
    tx_key: String,
    receiver: watch::Receiver<TxOutcome>,
    value: Option<T>,
    finished: bool,
}

impl<T> PreparedTransaction<T> {
    pub fn value(&self) -> &T {
        self.value.as_ref().expect("value taken")
    }

    /// Wait for the cluster's decision. `(true, _)` once a majority
    /// committed; `(false, _)` on rejection or when the deadline passes
    /// without a majority (a best-effort rollback vote is recorded then).
    pub async fn commit(mut self, timeout: Duration) -> Result<(bool, T)> {
        self.finished = true;
        let value = self.value.take().expect("value taken");
        let wait = tokio::time::timeout(
            timeout,
            self.receiver.wait_for(|o| *o != TxOutcome::Pending),
        )
        .await;
        let committed = match wait {
            Ok(Ok(outcome)) => *outcome == TxOutcome::Committed,
            Ok(Err(_)) => false,
            Err(_) => {
                self.node.try_rollback_key(&self.tx_key);
                false
            }
        };
        self.node.forget(&self.tx_key);
        Ok((committed, value))
    }

    /// Record a rollback vote and release the handle.
    pub fn try_rollback(mut self) {
        self.rollback_once();
    }

    fn rollback_once(&mut self) {
        if !self.finished {
            self.finished = true;
            self.node.try_rollback_key(&self.tx_key);
            self.node.forget(&self.tx_key);
        }
    }
}

impl<T> Drop for PreparedTransaction<T> {
    fn drop(&mut self) {
        self.rollback_once();
    }
}

/// A [`GossipNode`] with the consistent transaction protocol on top. Derefs
/// to the underlying node, so eventually-consistent operations stay
/// available.
pub struct ConsistentNode {
    self_ref: Weak<ConsistentNode>,
    base: Arc<GossipNode>,
    /// Data key → transaction key of the unresolved transaction touching it.
    locks: crate::stm::TxDict<String>,
    outcomes: Mutex<HashMap<String, watch::Sender<TxOutcome>>>,
}

impl std::ops::Deref for ConsistentNode {
    type Target = GossipNode;

    fn deref(&self) -> &GossipNode {
        &self.base
    }
}

impl ConsistentNode {
    pub fn new(base: Arc<GossipNode>) -> Result<Arc<Self>> {
        base.register::<TransactionInfo>(TRANSACTION_TAG)?;
        let node = Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            base: base.clone(),
            locks: crate::stm::TxDict::new(),
            outcomes: Mutex::new(HashMap::new()),
        });
        let weak = Arc::downgrade(&node);
        base.on_changed(move |event| {
            if event.key.starts_with(TRANSACTION_PREFIX) && !event.deleted {
                if let Some(node) = weak.upgrade() {
                    node.process_transaction(&event.key);
                }
            }
        });
        Ok(node)
    }

    pub fn gossip(&self) -> &Arc<GossipNode> {
        &self.base
    }

    /// Run `body` as a distributed transaction: record its reads and writes,
    /// replicate them, and wait for a majority vote. Rejected attempts are
    /// retried with a fresh view until `timeout`; `(false, _)` means no
    /// attempt reached a majority in time, which is distinct from rejection.
    pub async fn run_consistent<T>(
        &self,
        mut body: impl FnMut(&mut ConsistentTx<'_>) -> Result<T>,
        timeout: Duration,
    ) -> Result<(bool, T)> {
        let deadline = tokio::time::Instant::now() + timeout;
        let attempt_slice = (timeout / 10).max(Duration::from_millis(20));
        loop {
            match self.prepare_attempt(&mut body)? {
                Attempt::LocalConflict { value } => {
                    if tokio::time::Instant::now() >= deadline {
                        return Ok((false, value));
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Attempt::Started {
                    tx_key,
                    mut receiver,
                    value,
                } => {
                    let wait_until = (tokio::time::Instant::now() + attempt_slice).min(deadline);
                    let wait = tokio::time::timeout_at(
                        wait_until,
                        receiver.wait_for(|o| *o != TxOutcome::Pending),
                    )
                    .await;
                    match wait {
                        Ok(Ok(outcome)) => {
                            let decided = *outcome;
                            drop(outcome);
                            self.forget(&tx_key);
                            match decided {
                                TxOutcome::Committed => return Ok((true, value)),
                                TxOutcome::Rejected => {
                                    if tokio::time::Instant::now() >= deadline {
                                        return Ok((false, value));
                                    }
                                }
                                TxOutcome::Pending => unreachable!(),
                            }
                        }
                        Ok(Err(_)) => {
                            self.forget(&tx_key);
                            return Ok((false, value));
                        }
                        Err(_) => {
                            // no majority within this attempt's slice
                            self.try_rollback_key(&tx_key);
                            self.forget(&tx_key);
                            if tokio::time::Instant::now() >= deadline {
                                return Ok((false, value));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Run `body` and replicate the prepared transaction, returning a handle
    /// to commit or roll back explicitly. `None` when a local unresolved
    /// transaction already touches an overlapping key set.
    pub fn prepare<T>(
        &self,
        mut body: impl FnMut(&mut ConsistentTx<'_>) -> Result<T>,
    ) -> Result<Option<PreparedTransaction<T>>> {
        match self.prepare_attempt(&mut body)? {
            Attempt::LocalConflict { .. } => Ok(None),
            Attempt::Started {
                tx_key,
                receiver,
                value,
            } => Ok(Some(PreparedTransaction {
                node: self.self_ref.upgrade().expect("node alive"),
                tx_key,
                receiver,
                value: Some(value),
                finished: false,
            })),
        }
    }

    fn prepare_attempt<T, F>(&self, body: &mut F) -> Result<Attempt<T>>
    where
        F: FnMut(&mut ConsistentTx<'_>) -> Result<T>,
    {
        atomic(|tx| {
            let mut ctx = ConsistentTx {
                tx,
                node: self,
                reads: Vec::new(),
                read_keys: HashSet::new(),
                changes: Vec::new(),
                change_index: HashMap::new(),
            };
            let value = match body(&mut ctx) {
                Ok(value) => value,
                Err(e) => return Ok(Err(e)),
            };
            let ConsistentTx {
                tx, reads, changes, ..
            } = ctx;

            let keys: Vec<String> = reads
                .iter()
                .map(|r| r.key.clone())
                .chain(changes.iter().map(|c| c.key.clone()))
                .collect();
            for key in &keys {
                if let Some(owner) = self.locks.get(tx, key) {
                    if self.is_unresolved(tx, &owner) {
                        trace!(key = %key, owner = %owner, "local consistent conflict");
                        return Ok(Ok(Attempt::LocalConflict { value }));
                    }
                }
            }

            let own = self.base.own_id();
            let tx_key = format!("{TRANSACTION_PREFIX}{}", Uuid::new_v4());
            // one slot per currently known server; late joiners extend the
            // vector when they vote, shifting the majority threshold
            let mut state = TransactionVector::new();
            for server in self.base.transport().servers() {
                state = state.with(&server, TransactionState::NONE);
            }
            state = state.with(&own, TransactionState::PREPARED);
            let info = TransactionInfo {
                initiator: own,
                reads,
                changes,
                state,
            };

            for key in &keys {
                self.locks.set(tx, key, tx_key.clone());
            }

            let (sender, receiver) = watch::channel(TxOutcome::Pending);
            {
                // registered as the first side effect, so the waiter exists
                // before the change observer sees the transaction
                let weak = self.self_ref.clone();
                let key = tx_key.clone();
                tx.side_effect(move || {
                    if let Some(node) = weak.upgrade() {
                        node.outcomes
                            .lock()
                            .expect("outcome lock poisoned")
                            .insert(key, sender);
                    }
                });
            }

            if let Err(e) = self.base.set_tx(tx, &tx_key, &info, None) {
                return Ok(Err(e));
            }
            debug!(key = %tx_key, reads = info.reads.len(), changes = info.changes.len(), "prepared");
            Ok(Ok(Attempt::Started {
                tx_key,
                receiver,
                value,
            }))
        })
    }

    fn is_unresolved(&self, tx: &mut Tx, tx_key: &str) -> bool {
        match self.base.get_active_item(tx, tx_key) {
            None => false,
            Some(item) => match decode::<TransactionInfo>(&item.data) {
                Ok(info) => !info.state.is_done(),
                Err(_) => false,
            },
        }
    }

    /// Vote, decide and apply for one observed transaction key. Runs on
    /// every server, including the initiator, each time the ledger changes.
    fn process_transaction(&self, key: &str) {
        let result: Result<Option<TxOutcome>> = atomic(|tx| Ok(self.process_in(tx, key)));
        match result {
            Ok(Some(outcome)) => self.update_waiter(key, outcome),
            Ok(None) => {}
            Err(e) => self.base.notify_error(&e),
        }
    }

    fn process_in(&self, tx: &mut Tx, key: &str) -> Result<Option<TxOutcome>> {
        let Some(item) = self.base.get_active_item(tx, key) else {
            return Ok(None);
        };
        let info: TransactionInfo = decode(&item.data)?;
        let own = self.base.own_id();
        let current_slot = info.state.get(&own);
        let mut new_slot: Option<TransactionState> = None;

        if current_slot == TransactionState::NONE {
            let vote = if self.validate_reads(tx, &info)? && !self.conflicts_with_other(tx, key, &info) {
                TransactionState::PREPARED
            } else {
                TransactionState::REJECTED
            };
            trace!(key = %key, ?vote, "voting");
            if vote == TransactionState::PREPARED {
                for k in info.all_keys() {
                    self.locks.set(tx, k, key.to_string());
                }
            }
            new_slot = Some(vote);
        }

        let mut working = match new_slot {
            Some(slot) => info.with_state(&own, slot),
            None => info.clone(),
        };

        if !working.state.get(&own).contains(TransactionState::DONE) {
            if working.state.is_prepared() {
                // a revived ledger whose reads no longer validate completes
                // with no effect and becomes deletable again
                if self.validate_reads(tx, &working)? {
                    self.apply_changes(tx, &working)?;
                }
                new_slot = Some(TransactionState::SUCCESS);
                self.unlock_keys(tx, key, &working);
            } else if working.state.is_rejected() {
                new_slot = Some(TransactionState::FAIL);
                self.unlock_keys(tx, key, &working);
            }
        }

        if let Some(slot) = new_slot {
            working = info.with_state(&own, slot);
            self.base.set_tx(tx, key, &working, None)?;
        }

        let outcome = if working.state.is_success() {
            Some(TxOutcome::Committed)
        } else if working.state.is_fail() || working.state.is_rejected() {
            Some(TxOutcome::Rejected)
        } else {
            None
        };
        Ok(outcome)
    }

    fn validate_reads(&self, tx: &mut Tx, info: &TransactionInfo) -> Result<bool> {
        for stamp in &info.reads {
            let current = self.base.get_active_item(tx, &stamp.key);
            let matches = match (&stamp.value_hash, &current) {
                (None, None) => true,
                (Some(hash), Some(item)) => item.value_hash == *hash,
                _ => false,
            };
            if !matches {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn conflicts_with_other(&self, tx: &mut Tx, my_key: &str, info: &TransactionInfo) -> bool {
        let keys: Vec<String> = info.all_keys().map(String::from).collect();
        for key in keys {
            if let Some(owner) = self.locks.get(tx, &key) {
                if owner != my_key && self.is_unresolved(tx, &owner) {
                    return true;
                }
            }
        }
        false
    }

    /// Apply the recorded changes through the ordinary merge path, in one
    /// transaction so they share a freshness group, without direct mail —
    /// every server applies from its own copy of the ledger.
    fn apply_changes(&self, tx: &mut Tx, info: &TransactionInfo) -> Result<()> {
        let now = now_ms();
        for change in &info.changes {
            self.base.set_bytes_tx(
                tx,
                &change.key,
                &change.tag,
                change.data.clone(),
                change.deleted,
                change.expires_in_ms.map(|ms| now + ms),
                false,
            )?;
        }
        Ok(())
    }

    fn unlock_keys(&self, tx: &mut Tx, tx_key: &str, info: &TransactionInfo) {
        let keys: Vec<String> = info.all_keys().map(String::from).collect();
        for key in keys {
            if self.locks.get(tx, &key).as_deref() == Some(tx_key) {
                self.locks.remove(tx, &key);
            }
        }
    }

    fn try_rollback_key(&self, tx_key: &str) {
        let result: Result<()> = atomic(|tx| Ok(self.rollback_in(tx, tx_key)));
        if let Err(e) = result {
            self.base.notify_error(&e);
        }
    }

    fn rollback_in(&self, tx: &mut Tx, tx_key: &str) -> Result<()> {
        let Some(item) = self.base.get_active_item(tx, tx_key) else {
            return Ok(());
        };
        let info: TransactionInfo = decode(&item.data)?;
        let own = self.base.own_id();
        if info.state.get(&own).contains(TransactionState::DONE) {
            return Ok(());
        }
        debug!(key = %tx_key, "rollback vote");
        let updated = info.with_state(&own, TransactionState::REJECTED);
        self.base.set_tx(tx, tx_key, &updated, None)?;
        Ok(())
    }

    fn update_waiter(&self, key: &str, outcome: TxOutcome) {
        let outcomes = self.outcomes.lock().expect("outcome lock poisoned");
        if let Some(sender) = outcomes.get(key) {
            sender.send_if_modified(|current| {
                if *current == TxOutcome::Pending {
                    *current = outcome;
                    true
                } else {
                    false
                }
            });
        }
    }

    fn forget(&self, key: &str) {
        self.outcomes
            .lock()
            .expect("outcome lock poisoned")
            .remove(key);
    }
}
