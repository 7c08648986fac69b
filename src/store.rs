use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::{DirectMailMode, GossipConfig};
use crate::error::{Error, Result};
use crate::freshness::FreshnessIndex;
use crate::gossip::GossipState;
use crate::item::{Item, ItemInfo, WireItem};
use crate::messages::{DirectMail, Message};
use crate::registry::Registry;
use crate::stm::{atomic, Tx, TxCell, TxDict, TxLocal};
use crate::transport::Transport;
use crate::types::{
    decode, encode, now_ms, validate_key, Mergeable, Relationship, ServerId, VersionHash,
};
use crate::versioned::{Multiple, Versioned};

/// Raised synchronously after a commit that changed `key`.
#[derive(Debug, Clone)]
pub struct ChangedEvent {
    pub key: String,
    pub deleted: bool,
}

pub type ChangedObserver = Arc<dyn Fn(&ChangedEvent) + Send + Sync>;
pub type ErrorObserver = Arc<dyn Fn(&Error) + Send + Sync>;

struct Watcher {
    key: String,
    sender: watch::Sender<()>,
}

/// Accumulates the appends of one transaction so commit can stamp them with
/// a shared freshness base and flush direct mail exactly once.
struct PendingCommit {
    stamp: Arc<OnceLock<u64>>,
    mailbox: Arc<Mutex<Vec<Arc<Item>>>>,
    mail_registered: bool,
}

impl PendingCommit {
    fn new() -> Self {
        Self {
            stamp: Arc::new(OnceLock::new()),
            mailbox: Arc::new(Mutex::new(Vec::new())),
            mail_registered: false,
        }
    }
}

/// Snapshot of a node's replication state, for monitoring and tests.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub id: ServerId,
    pub items: usize,
    pub last_freshness: u64,
    pub db_hash: VersionHash,
    pub index_entries: usize,
}

pub(crate) fn item_hash(key: &str, value_hash: VersionHash) -> VersionHash {
    VersionHash::hash_parts([key.as_bytes(), value_hash.0.to_le_bytes().as_slice()])
}

/// A replicated key/value store node: the local CRDT store plus the gossip
/// anti-entropy engine (`gossip.rs`) keeping it convergent with its peers.
///
/// All mutation runs inside the ambient optimistic transaction; use the
/// one-shot methods (`set`, `remove`, ...) for single operations or
/// [`crate::stm::atomic`] with the `_tx` variants to compose several.
pub struct GossipNode {
    pub(crate) self_ref: Weak<GossipNode>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: GossipConfig,
    registry: Registry,
    pub(crate) items: TxDict<Arc<Item>>,
    pub(crate) index: FreshnessIndex,
    pub(crate) db_hash: TxCell<VersionHash>,
    pub(crate) sessions: TxDict<GossipState>,
    pending: TxLocal<PendingCommit>,
    pub(crate) freshness_ctx: TxLocal<u64>,
    observers: Mutex<Vec<ChangedObserver>>,
    error_observers: Mutex<Vec<ErrorObserver>>,
    watchers: Mutex<Vec<Watcher>>,
    cleanup_gate: Mutex<()>,
    cleanup_watermark: AtomicU64,
}

impl GossipNode {
    pub fn new(transport: Arc<dyn Transport>, config: GossipConfig) -> Arc<Self> {
        let node = Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            transport,
            config,
            registry: Registry::new(),
            items: TxDict::new(),
            index: FreshnessIndex::new(),
            db_hash: TxCell::new(VersionHash::default()),
            sessions: TxDict::new(),
            pending: TxLocal::new(),
            freshness_ctx: TxLocal::new(),
            observers: Mutex::new(Vec::new()),
            error_observers: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
            cleanup_gate: Mutex::new(()),
            cleanup_watermark: AtomicU64::new(0),
        });
        node.spawn_tasks();
        node
    }

    fn spawn_tasks(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime; periodic gossip and cleanup disabled");
            return;
        };
        let weak = self.self_ref.clone();
        let period = self.config.gossip_interval;
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(node) = weak.upgrade() else { break };
                node.spread_rumors();
            }
        });
        let weak = self.self_ref.clone();
        let period = self.config.cleanup_interval;
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(node) = weak.upgrade() else { break };
                node.cleanup_tick();
            }
        });
    }

    pub fn own_id(&self) -> ServerId {
        self.transport.own_id()
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Register a value type under a stable wire tag. Every type passed to
    /// `set`/`try_get` must be registered on all servers first.
    pub fn register<T>(&self, tag: &str) -> Result<()>
    where
        T: Mergeable + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.registry.register::<T>(tag)
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn on_changed(&self, observer: impl Fn(&ChangedEvent) + Send + Sync + 'static) {
        self.observers
            .lock()
            .expect("observer lock poisoned")
            .push(Arc::new(observer));
    }

    pub fn on_error(&self, observer: impl Fn(&Error) + Send + Sync + 'static) {
        self.error_observers
            .lock()
            .expect("observer lock poisoned")
            .push(Arc::new(observer));
    }

    /// Notified on every change to `key`.
    pub fn watch(&self, key: &str) -> watch::Receiver<()> {
        let (sender, receiver) = watch::channel(());
        self.watchers
            .lock()
            .expect("watcher lock poisoned")
            .push(Watcher {
                key: key.to_string(),
                sender,
            });
        receiver
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.own_id(),
            items: self.items.len(),
            last_freshness: self.index.last_freshness(),
            db_hash: self.db_hash.peek(),
            index_entries: self.index.entry_count(),
        }
    }

    pub(crate) fn notify_error(&self, err: &Error) {
        warn!(error = %err, "background failure");
        let observers: Vec<ErrorObserver> = self
            .error_observers
            .lock()
            .expect("observer lock poisoned")
            .clone();
        for obs in observers {
            obs(err);
        }
    }

    fn notify_changed(&self, key: &str, deleted: bool) {
        let event = ChangedEvent {
            key: key.to_string(),
            deleted,
        };
        let observers: Vec<ChangedObserver> = self
            .observers
            .lock()
            .expect("observer lock poisoned")
            .clone();
        for obs in observers {
            obs(&event);
        }
        let mut watchers = self.watchers.lock().expect("watcher lock poisoned");
        watchers.retain(|w| {
            if w.key == key {
                w.sender.send(()).is_ok()
            } else {
                true
            }
        });
    }

    // ---- reads ----

    pub(crate) fn get_item(&self, tx: &mut Tx, key: &str) -> Option<Arc<Item>> {
        self.items.get(tx, key)
    }

    pub(crate) fn get_active_item(&self, tx: &mut Tx, key: &str) -> Option<Arc<Item>> {
        self.items
            .get(tx, key)
            .filter(|i| !i.deleted && !i.is_expired(now_ms()))
    }

    /// Read the active value under `key`, if any.
    pub fn try_get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + 'static,
    {
        atomic(|tx| Ok(self.try_get_tx(tx, key)))
    }

    pub fn try_get_tx<T>(&self, tx: &mut Tx, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + 'static,
    {
        validate_key(key)?;
        let Some(item) = self.get_active_item(tx, key) else {
            return Ok(None);
        };
        let tag = self.registry.tag_of::<T>()?;
        if item.tag != tag {
            return Err(Error::TagConflict { tag });
        }
        Ok(Some(decode(&item.data)?))
    }

    /// Read the value under `key` including tombstones and expired entries
    /// still held for replication.
    pub fn try_get_info<T>(&self, key: &str) -> Result<Option<ItemInfo<T>>>
    where
        T: DeserializeOwned + 'static,
    {
        atomic(|tx| Ok(self.try_get_info_tx(tx, key)))
    }

    pub fn try_get_info_tx<T>(&self, tx: &mut Tx, key: &str) -> Result<Option<ItemInfo<T>>>
    where
        T: DeserializeOwned + 'static,
    {
        validate_key(key)?;
        let Some(item) = self.get_item(tx, key) else {
            return Ok(None);
        };
        let tag = self.registry.tag_of::<T>()?;
        if item.tag != tag {
            return Err(Error::TagConflict { tag });
        }
        let now = now_ms();
        Ok(Some(ItemInfo {
            value: decode(&item.data)?,
            deleted: item.deleted,
            expired: item.is_expired(now),
            expires_in_ms: item.expires_in_ms(now),
        }))
    }

    pub fn contains_key(&self, key: &str) -> Result<bool> {
        atomic(|tx| Ok(self.contains_key_tx(tx, key)))
    }

    pub fn contains_key_tx(&self, tx: &mut Tx, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.get_active_item(tx, key).is_some())
    }

    pub fn contains_key_with_info(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        atomic(|tx| Ok(Ok(self.get_item(tx, key).is_some())))
    }

    // ---- writes ----

    /// Set `key` to `value`, merging with any existing value. Returns the
    /// relationship of the new value to the old one, `Greater` if there was
    /// none. `expire_in_ms` is ignored when the result is `Less` or `Equal`.
    pub fn set<T>(&self, key: &str, value: &T, expire_in_ms: Option<i64>) -> Result<Relationship>
    where
        T: Mergeable + Serialize + 'static,
    {
        atomic(|tx| Ok(self.set_tx(tx, key, value, expire_in_ms)))
    }

    pub fn set_tx<T>(
        &self,
        tx: &mut Tx,
        key: &str,
        value: &T,
        expire_in_ms: Option<i64>,
    ) -> Result<Relationship>
    where
        T: Mergeable + Serialize + 'static,
    {
        if expire_in_ms.is_some_and(|ms| ms <= 0) {
            return Err(Error::InvalidArgument(
                "expire_in_ms must be positive".into(),
            ));
        }
        let tag = self.registry.tag_of::<T>()?;
        let data = encode(value)?;
        let expires_at = expire_in_ms.map(|ms| now_ms() + ms);
        self.set_bytes_tx(tx, key, &tag, data, false, expires_at, true)
    }

    /// Store a clocked version of a plain value, wrapped into a
    /// [`Multiple`] so concurrent versions survive side by side.
    pub fn set_versioned<T>(
        &self,
        key: &str,
        version: Versioned<T>,
        expire_in_ms: Option<i64>,
    ) -> Result<Relationship>
    where
        T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.set(key, &Multiple::single(version), expire_in_ms)
    }

    /// Remove `key`, leaving a replicated tombstone. Returns whether an
    /// active value was removed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        atomic(|tx| Ok(self.remove_tx(tx, key)))
    }

    pub fn remove_tx(&self, tx: &mut Tx, key: &str) -> Result<bool> {
        validate_key(key)?;
        let Some(old) = self.get_item(tx, key) else {
            return Ok(false);
        };
        if old.deleted {
            return Ok(false);
        }
        self.tombstone_tx(tx, old, true)
    }

    /// A non-update: re-stamp `key` so the next direct mail and gossip
    /// packages carry it even though its value did not change.
    pub fn touch(&self, key: &str) -> Result<()> {
        atomic(|tx| Ok(self.touch_tx(tx, key)))
    }

    pub fn touch_tx(&self, tx: &mut Tx, key: &str) -> Result<()> {
        validate_key(key)?;
        let Some(old) = self.get_item(tx, key) else {
            return Ok(());
        };
        let proto = (*old).clone();
        self.queue_append(tx, proto, true, VersionHash::default());
        Ok(())
    }

    pub(crate) fn tombstone_tx(&self, tx: &mut Tx, old: Arc<Item>, mail: bool) -> Result<bool> {
        let was_active = !old.is_expired(now_ms());
        let delta = if old.deleted {
            VersionHash::default()
        } else {
            item_hash(&old.key, old.value_hash)
        };
        let proto = Item {
            deleted: true,
            expires_at: None,
            removable_since: None,
            ..(*old).clone()
        };
        let key = proto.key.clone();
        self.queue_append(tx, proto, mail, delta);
        self.queue_changed(tx, &key, true);
        Ok(was_active)
    }

    /// The shared merge path: apply `data` (tagged payload bytes) to `key`.
    /// Used by typed sets, direct mail, gossip packages and the consistent
    /// layer's change application.
    pub(crate) fn set_bytes_tx(
        &self,
        tx: &mut Tx,
        key: &str,
        tag: &str,
        data: Vec<u8>,
        deleted_in: bool,
        expires_at_in: Option<i64>,
        mail: bool,
    ) -> Result<Relationship> {
        validate_key(key)?;
        let handler = self.registry.handler(tag)?;
        let now = now_ms();
        match self.get_item(tx, key) {
            Some(old) => {
                if old.tag != tag {
                    return Err(Error::TagConflict { tag: tag.into() });
                }
                let merged = handler.merge(&data, Some(&old.data))?;
                let mut rel = merged.relationship;
                let deleted = match rel {
                    Relationship::Greater => deleted_in,
                    Relationship::Less => old.deleted,
                    Relationship::Equal | Relationship::Conflict => deleted_in || old.deleted,
                };
                // a tombstone for a value we hold as live dominates it
                if rel == Relationship::Equal && deleted != old.deleted {
                    rel = Relationship::Greater;
                }
                if matches!(rel, Relationship::Less | Relationship::Equal) {
                    return Ok(rel);
                }
                let expires_at = match rel {
                    Relationship::Greater => expires_at_in,
                    _ => match (expires_at_in, old.expires_at) {
                        (Some(a), Some(b)) => Some(a.max(b)),
                        _ => None,
                    },
                };
                let removable_since = if merged.can_delete && !deleted {
                    old.removable_since.or(Some(now))
                } else {
                    None
                };
                let old_contrib = if old.deleted {
                    VersionHash::default()
                } else {
                    item_hash(key, old.value_hash)
                };
                let new_contrib = if deleted {
                    VersionHash::default()
                } else {
                    item_hash(key, merged.value_hash)
                };
                let proto = Item {
                    key: key.to_string(),
                    tag: tag.to_string(),
                    data: merged.data,
                    value_hash: merged.value_hash,
                    deleted,
                    expires_at,
                    freshness: 0,
                    removable_since,
                };
                self.queue_append(tx, proto, mail, old_contrib ^ new_contrib);
                self.queue_changed(tx, key, deleted);
                Ok(rel)
            }
            None => {
                if deleted_in || expires_at_in.is_some_and(|at| at <= now) {
                    return Ok(Relationship::Equal);
                }
                let merged = handler.merge(&data, None)?;
                let removable_since = merged.can_delete.then_some(now);
                let contrib = item_hash(key, merged.value_hash);
                let proto = Item {
                    key: key.to_string(),
                    tag: tag.to_string(),
                    data: merged.data,
                    value_hash: merged.value_hash,
                    deleted: false,
                    expires_at: expires_at_in,
                    freshness: 0,
                    removable_since,
                };
                self.queue_append(tx, proto, mail, contrib);
                self.queue_changed(tx, key, false);
                Ok(Relationship::Greater)
            }
        }
    }

    /// Apply incoming items, oldest freshness group first. Groups that
    /// produced local changes get distinct local freshness values via the
    /// per-transaction context, so anti-entropy windows never regroup them.
    /// Returns the keys whose local value now equals the received one.
    pub(crate) fn apply_items(
        &self,
        tx: &mut Tx,
        items: &[WireItem],
        respect_freshness: bool,
    ) -> Result<Option<HashSet<String>>> {
        if items.is_empty() {
            return Ok(None);
        }
        let now = now_ms();
        let mut prev_freshness = items[items.len() - 1].freshness;
        let mut freshness_utilized = false;
        let mut equal_keys: Option<HashSet<String>> = None;
        for item in items.iter().rev() {
            if item.data.is_empty() {
                continue;
            }
            if let Some(current) = self.get_item(tx, &item.key) {
                if current.deleted == item.deleted
                    && current.data == item.data
                    && self.expiry_close(&current, item, now)
                {
                    equal_keys
                        .get_or_insert_with(HashSet::new)
                        .insert(item.key.clone());
                    continue;
                }
            }
            if respect_freshness && prev_freshness != item.freshness {
                prev_freshness = item.freshness;
                if freshness_utilized {
                    *self.freshness_ctx.entry(tx, || 0) += 1;
                }
                freshness_utilized = false;
            }
            let expires_at = item.expires_in_ms.map(|ms| now + ms);
            let rel = self.set_bytes_tx(
                tx,
                &item.key,
                &item.tag,
                item.data.clone(),
                item.deleted,
                expires_at,
                false,
            )?;
            freshness_utilized |= rel.has_greater();
            if matches!(rel, Relationship::Greater | Relationship::Equal) {
                equal_keys
                    .get_or_insert_with(HashSet::new)
                    .insert(item.key.clone());
            }
        }
        Ok(equal_keys)
    }

    fn expiry_close(&self, current: &Item, incoming: &WireItem, now: i64) -> bool {
        match (current.expires_in_ms(now), incoming.expires_in_ms) {
            (None, None) => true,
            (Some(ours), Some(theirs)) => {
                (ours - theirs).abs() <= self.config.expiry_tolerance_ms
            }
            _ => false,
        }
    }

    /// Buffer an item append. The commit-phase finalizer stamps the item
    /// with the transaction's freshness base plus the current freshness
    /// context offset, writes it into the store and the index, and (when
    /// `mail` is set) into the transaction's outgoing mailbox.
    fn queue_append(&self, tx: &mut Tx, proto: Item, mail: bool, hash_delta: VersionHash) {
        let offset = self.freshness_ctx.get(tx).copied().unwrap_or(0);
        let (stamp, mailbox, register_mail) = {
            let pending = self.pending.entry(tx, PendingCommit::new);
            let register = mail && !pending.mail_registered;
            if register {
                pending.mail_registered = true;
            }
            (pending.stamp.clone(), pending.mailbox.clone(), register)
        };

        let key = proto.key.clone();
        let provisional = Arc::new(proto);
        self.items.set(tx, &key, provisional.clone());

        let items = self.items.clone();
        let index = self.index.clone();
        let mail_slot = mail.then(|| mailbox.clone());
        tx.finalize(move || {
            let base = *stamp.get_or_init(|| index.last_freshness() + 1);
            let stamped = Arc::new(Item {
                freshness: base + offset,
                ..(*provisional).clone()
            });
            items.write_direct(&stamped.key, Some(stamped.clone()));
            index.append(stamped.clone());
            if let Some(mb) = mail_slot {
                mb.lock().expect("mailbox poisoned").push(stamped);
            }
        });

        if !hash_delta.is_zero() {
            let hash = self.db_hash.clone();
            tx.finalize(move || hash.update_direct(|h| *h ^= hash_delta));
        }

        if register_mail {
            let weak = self.self_ref.clone();
            tx.side_effect(move || {
                if let Some(node) = weak.upgrade() {
                    let items = std::mem::take(&mut *mailbox.lock().expect("mailbox poisoned"));
                    node.do_direct_mail(items);
                }
            });
        }
    }

    fn queue_changed(&self, tx: &mut Tx, key: &str, deleted: bool) {
        let weak = self.self_ref.clone();
        let key = key.to_string();
        tx.side_effect(move || {
            if let Some(node) = weak.upgrade() {
                node.notify_changed(&key, deleted);
            }
        });
    }

    fn do_direct_mail(&self, items: Vec<Arc<Item>>) {
        if self.config.direct_mail == DirectMailMode::Off || items.is_empty() {
            return;
        }
        // last write per key wins
        let mut by_key: HashMap<&str, &Arc<Item>> = HashMap::new();
        for item in &items {
            by_key.insert(item.key.as_str(), item);
        }
        let now = now_ms();
        let mut wire: Vec<WireItem> = by_key
            .into_values()
            .map(|item| WireItem::from_item(item, now))
            .collect();
        wire.sort_by(|a, b| b.freshness.cmp(&a.freshness));
        debug!(count = wire.len(), "direct mail");
        let package = Message::DirectMail(DirectMail { items: wire });
        match self.config.direct_mail {
            DirectMailMode::Always => self.transport.broadcast(package),
            DirectMailMode::GossipSuppressed => {
                for server in self.transport.servers() {
                    if !self.is_gossip_active(&server) {
                        self.transport.send(&server, package.clone(), false);
                    }
                }
            }
            DirectMailMode::StartGossip => {
                for server in self.transport.servers() {
                    self.start_gossip(&server);
                }
            }
            DirectMailMode::Off => {}
        }
    }

    // ---- cleanup sweep ----

    /// One pass of the expiry / tombstone / deletable sweep. Guarded by a
    /// try-lock so overlapping timer ticks are skipped rather than queued.
    pub(crate) fn cleanup_tick(&self) {
        let Ok(_gate) = self.cleanup_gate.try_lock() else {
            return;
        };
        let now = now_ms();
        let watermark = self.cleanup_watermark.load(Ordering::Acquire);
        let linger_ms = self.config.removable_linger.as_millis() as i64;

        enum Sweep {
            Purge,
            Tombstone,
        }
        let mut candidates: Vec<(String, Arc<Item>, Sweep)> = Vec::new();
        for (key, item) in self.items.snapshot() {
            if item.deleted {
                // tombstones survive one full sweep interval so slow peers
                // still receive the deletion
                if item.freshness <= watermark {
                    candidates.push((key, item, Sweep::Purge));
                }
            } else if item.is_expired(now) {
                candidates.push((key, item, Sweep::Tombstone));
            } else if item.removable_since.is_some_and(|t| now - t >= linger_ms) {
                candidates.push((key, item, Sweep::Tombstone));
            }
        }
        let new_watermark = self.index.last_freshness();

        if !candidates.is_empty() {
            let result: Result<()> = atomic(|tx| {
                let mut out = Ok(());
                for (key, expected, action) in &candidates {
                    let Some(current) = self.items.get(tx, key) else {
                        continue;
                    };
                    if !Arc::ptr_eq(&current, expected) {
                        continue;
                    }
                    match action {
                        Sweep::Purge => self.items.remove(tx, key),
                        Sweep::Tombstone => {
                            if let Err(e) = self.tombstone_tx(tx, current, false) {
                                out = Err(e);
                                break;
                            }
                        }
                    }
                }
                Ok(out)
            });
            if let Err(e) = result {
                self.notify_error(&e);
            }
        }
        self.cleanup_watermark.store(new_watermark, Ordering::Release);

        let live = self.items.len();
        if self.index.entry_count() > live.saturating_mul(2).max(64) {
            let items = self.items.clone();
            let dropped = self.index.compact(|indexed| {
                items
                    .peek(&indexed.key)
                    .is_some_and(|cur| Arc::ptr_eq(&cur, indexed))
            });
            debug!(dropped, "compacted freshness index");
        }
    }
}
