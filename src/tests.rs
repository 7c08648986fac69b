use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::config::{DirectMailMode, GossipConfig};
use crate::consistent::{ConsistentNode, TransactionInfo};
use crate::item::WireItem;
use crate::messages::{next_message_id, DirectMail, GossipReply, KillGossip, Message};
use crate::stm::{atomic, retry, TxCell};
use crate::store::GossipNode;
use crate::transport::Transport;
use crate::types::{encode, Mergeable, Relationship, ServerId, VersionHash};
use crate::vector::{CountVector, TransactionState, TransactionVector, VectorClock, VectorValue};
use crate::versioned::{Multiple, Versioned};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct TestEntity {
    id: i32,
    name: String,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

// ---- in-memory loopback network with one queue for the whole cluster ----

struct Envelope {
    from: ServerId,
    to: ServerId,
    msg: Message,
}

#[derive(Default)]
struct Network {
    nodes: Mutex<HashMap<ServerId, Weak<GossipNode>>>,
    queue: Mutex<VecDeque<Envelope>>,
    blocked: Mutex<HashSet<(ServerId, ServerId)>>,
}

impl Network {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn transport(self: &Arc<Self>, own: &str, peers: &[&str]) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            own: ServerId::new(own),
            peers: peers.iter().map(|p| ServerId::new(*p)).collect(),
            network: self.clone(),
        })
    }

    fn register(&self, node: &Arc<GossipNode>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(node.own_id(), Arc::downgrade(node));
    }

    fn disconnect(&self, a: &str, b: &str) {
        let (a, b) = (ServerId::new(a), ServerId::new(b));
        let mut blocked = self.blocked.lock().unwrap();
        blocked.insert((a.clone(), b.clone()));
        blocked.insert((b, a));
    }

    fn reconnect(&self, a: &str, b: &str) {
        let (a, b) = (ServerId::new(a), ServerId::new(b));
        let mut blocked = self.blocked.lock().unwrap();
        blocked.remove(&(a.clone(), b.clone()));
        blocked.remove(&(b, a));
    }

    fn post(&self, from: ServerId, to: ServerId, msg: Message) {
        if self
            .blocked
            .lock()
            .unwrap()
            .contains(&(from.clone(), to.clone()))
        {
            return;
        }
        self.queue
            .lock()
            .unwrap()
            .push_back(Envelope { from, to, msg });
    }

    /// Deliver queued messages, including responses, until quiet.
    fn settle(&self) {
        for _ in 0..100_000 {
            let env = self.queue.lock().unwrap().pop_front();
            let Some(env) = env else {
                return;
            };
            let target = self
                .nodes
                .lock()
                .unwrap()
                .get(&env.to)
                .and_then(Weak::upgrade);
            let Some(target) = target else {
                continue;
            };
            if let Some(response) = target.handle_message(env.msg) {
                self.post(env.to, env.from, response);
            }
        }
        panic!("network did not settle");
    }

    fn spawn_pump(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let network = self.clone();
        tokio::spawn(async move {
            loop {
                network.settle();
                sleep(Duration::from_millis(5)).await;
            }
        })
    }
}

struct LoopbackTransport {
    own: ServerId,
    peers: Vec<ServerId>,
    network: Arc<Network>,
}

impl Transport for LoopbackTransport {
    fn own_id(&self) -> ServerId {
        self.own.clone()
    }

    fn servers(&self) -> Vec<ServerId> {
        self.peers.clone()
    }

    fn send(&self, server: &ServerId, msg: Message, _is_request: bool) {
        self.network.post(self.own.clone(), server.clone(), msg);
    }

    fn broadcast(&self, msg: Message) {
        for server in &self.peers {
            self.send(server, msg.clone(), false);
        }
    }
}

fn quiet_config() -> GossipConfig {
    GossipConfig {
        gossip_interval: Duration::from_secs(3600),
        cleanup_interval: Duration::from_secs(3600),
        direct_mail: DirectMailMode::Off,
        ..GossipConfig::default()
    }
}

fn make_node(
    network: &Arc<Network>,
    own: &str,
    peers: &[&str],
    config: GossipConfig,
) -> Arc<GossipNode> {
    let node = GossipNode::new(network.transport(own, peers), config);
    network.register(&node);
    node.register::<Multiple<TestEntity>>("test-entity").unwrap();
    node.register::<CountVector>("count").unwrap();
    node.register::<VectorClock>("clock").unwrap();
    node
}

fn entity(id: i32, name: &str) -> TestEntity {
    TestEntity {
        id,
        name: name.to_string(),
    }
}

// ---- CRDT merge algebra ----

#[test]
fn vector_clock_merge_laws() {
    let sa = ServerId::new("A");
    let sb = ServerId::new("B");
    let sc = ServerId::new("C");
    let a = VectorClock::single("A", 3).with(&sb, 1);
    let b = VectorClock::single("B", 4).with(&sc, 2);
    let c = VectorClock::single("A", 1).with(&sc, 5);

    let ab = a.merge_with(&b).0;
    let ba = b.merge_with(&a).0;
    assert_eq!(ab, ba);

    let ab_c = ab.merge_with(&c).0;
    let a_bc = a.merge_with(&b.merge_with(&c).0).0;
    assert_eq!(ab_c, a_bc);

    assert_eq!(a.merge_with(&a).0, a);
    assert_eq!(a.compare(&a), Relationship::Equal);
    assert_eq!(ab.get(&sa), 3);
    assert_eq!(ab.get(&sb), 4);
}

#[test]
fn vector_compare_relationships() {
    let sb = ServerId::new("B");
    let v1 = VectorClock::single("A", 1);
    let v2 = VectorClock::single("A", 2);
    assert_eq!(v1.compare(&v2), Relationship::Less);
    assert_eq!(v2.compare(&v1), Relationship::Greater);

    // missing entries read as zero
    let v3 = v1.with(&sb, 1);
    assert_eq!(v1.compare(&v3), Relationship::Less);

    let x = VectorClock::single("A", 2).with(&sb, 1);
    let y = VectorClock::single("A", 1).with(&sb, 2);
    assert_eq!(x.compare(&y), Relationship::Conflict);
    assert_eq!(x.merge_with(&y).1, Relationship::Conflict);
    let merged = x.merge_with(&y).0;
    assert_eq!(merged.compare(&x), Relationship::Greater);
    assert_eq!(merged.compare(&y), Relationship::Greater);
}

#[test]
fn server_ids_compare_case_insensitively() {
    let clock = VectorClock::single("node-1", 5);
    assert_eq!(clock.get(&ServerId::new("NODE-1")), 5);
    assert_eq!(
        clock.compare(&VectorClock::single("Node-1", 5)),
        Relationship::Equal
    );
    assert!(ServerId::new("alpha") < ServerId::new("Beta"));
}

#[test]
fn count_vector_sums_per_server_counters() {
    let sa = ServerId::new("A");
    let sb = ServerId::new("B");
    let a = CountVector::new().increment(&sa).increment(&sa);
    let b = CountVector::new().increment(&sb);
    let merged = a.merge_with(&b).0;
    assert_eq!(merged.total(), 3);
    // idempotent under repeated exchange
    assert_eq!(merged.merge_with(&a).0.total(), 3);
}

#[test]
fn transaction_vector_majority_predicates() {
    let (sa, sb, sc) = (ServerId::new("A"), ServerId::new("B"), ServerId::new("C"));
    let seeded = TransactionVector::new()
        .with(&sa, TransactionState::PREPARED)
        .with(&sb, TransactionState::NONE)
        .with(&sc, TransactionState::NONE);
    assert!(!seeded.is_prepared());
    assert!(!seeded.is_rejected());
    assert!(!seeded.is_done());

    let two_of_three = seeded.with(&sb, TransactionState::PREPARED);
    assert!(two_of_three.is_prepared());

    // once a majority prepared, later merges keep it prepared
    let with_reject = two_of_three.with(&sc, TransactionState::REJECTED);
    assert!(with_reject.is_prepared());
    assert!(!with_reject.is_rejected());

    let done = two_of_three
        .with(&sa, TransactionState::SUCCESS)
        .with(&sb, TransactionState::SUCCESS);
    assert!(done.is_done());
    assert!(done.is_success());
    assert!(done.done_majority());

    // exactly half is not a majority
    let half = TransactionVector::new()
        .with(&sa, TransactionState::PREPARED)
        .with(&sb, TransactionState::NONE);
    assert!(!half.is_prepared());
}

#[test]
fn transaction_state_merges_by_severity() {
    let merged = VectorValue::merge(&TransactionState::PREPARED, &TransactionState::REJECTED);
    assert_eq!(merged, TransactionState::REJECTED);
    assert!(TransactionState::SUCCESS.contains(TransactionState::DONE));
    assert!(TransactionState::SUCCESS.contains(TransactionState::PREPARED));
    assert!(!TransactionState::SUCCESS.contains(TransactionState::REJECTED));
}

#[test]
fn multiple_keeps_conflicting_versions_and_drops_dominated() {
    let sa = ServerId::new("A");
    let sb = ServerId::new("B");
    let v1 = Versioned::first(entity(1, "left"), &sa);
    let v2 = Versioned::first(entity(1, "right"), &sb);

    let (merged, rel) = Multiple::single(v1.clone()).merge_with(&Multiple::single(v2.clone()));
    assert_eq!(rel, Relationship::Conflict);
    assert_eq!(merged.len(), 2);
    assert_eq!(merged.clock().compare(&v1.clock), Relationship::Greater);
    assert_eq!(merged.clock().compare(&v2.clock), Relationship::Greater);

    // a later version dominating both collapses the set again
    let v3 = Versioned::new(entity(1, "resolved"), merged.clock().next(&sa));
    let (resolved, rel) = Multiple::single(v3.clone()).merge_with(&merged);
    assert_eq!(rel, Relationship::Greater);
    assert_eq!(resolved.single_version().unwrap().value, v3.value);

    // idempotent
    let (again, rel) = resolved.merge_with(&resolved);
    assert_eq!(rel, Relationship::Equal);
    assert_eq!(again, resolved);
}

#[test]
fn transaction_info_merges_state_only() {
    let sa = ServerId::new("A");
    let sb = ServerId::new("B");
    let info = TransactionInfo {
        initiator: sa.clone(),
        reads: vec![],
        changes: vec![],
        state: TransactionVector::new()
            .with(&sa, TransactionState::PREPARED)
            .with(&sb, TransactionState::NONE),
    };
    let voted = info.with_state(&sb, TransactionState::PREPARED);
    let (merged, rel) = info.merge_with(&voted);
    assert_eq!(rel, Relationship::Less);
    assert!(merged.state.is_prepared());
    assert!(!info.can_delete());

    let done = voted
        .with_state(&sa, TransactionState::SUCCESS)
        .with_state(&sb, TransactionState::SUCCESS);
    assert!(done.can_delete());
}

// ---- ambient transaction ----

#[test]
fn stm_conflicting_increments_all_land() {
    let cell = TxCell::new(0i64);
    let threads: Vec<_> = (0..4)
        .map(|_| {
            let cell = cell.clone();
            std::thread::spawn(move || {
                for _ in 0..250 {
                    atomic(|tx| {
                        let value = cell.get(tx);
                        cell.set(tx, value + 1);
                        Ok(())
                    });
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(cell.peek(), 1000);
}

#[test]
fn stm_explicit_retry_reruns_body_and_effects_run_once() {
    let cell = TxCell::new(0u64);
    let attempts = Arc::new(AtomicUsize::new(0));
    let effects = Arc::new(AtomicUsize::new(0));
    let result = atomic(|tx| {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst);
        let effects = effects.clone();
        tx.side_effect(move || {
            effects.fetch_add(1, Ordering::SeqCst);
        });
        if attempt == 0 {
            return retry();
        }
        cell.set(tx, 7);
        Ok(attempt)
    });
    assert_eq!(result, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(effects.load(Ordering::SeqCst), 1);
    assert_eq!(cell.peek(), 7);
}

// ---- local store ----

#[tokio::test]
async fn basic_set_get_remove() -> anyhow::Result<()> {
    let network = Network::new();
    let node = make_node(&network, "A", &[], quiet_config());
    let sa = node.own_id();

    let rel = node.set_versioned("key", Versioned::first(entity(1, "one"), &sa), None)?;
    assert_eq!(rel, Relationship::Greater);

    let read: Multiple<TestEntity> = node.try_get("key")?.unwrap();
    let version = read.single_version().unwrap();
    assert_eq!(version.value, entity(1, "one"));
    assert_eq!(version.clock, VectorClock::single("A", 1));

    // same value again is a no-op
    let rel = node.set("key", &Multiple::single(version.clone()), None)?;
    assert_eq!(rel, Relationship::Equal);

    assert!(node.contains_key("key")?);
    assert!(node.remove("key")?);
    assert!(!node.remove("key")?);
    assert!(node.try_get::<Multiple<TestEntity>>("key")?.is_none());
    assert!(!node.contains_key("key")?);

    // the tombstone stays visible through the info variant
    let info = node
        .try_get_info::<Multiple<TestEntity>>("key")?
        .unwrap();
    assert!(info.deleted);
    assert!(node.contains_key_with_info("key")?);
    Ok(())
}

#[tokio::test]
async fn argument_validation_fails_fast() {
    let network = Network::new();
    let node = make_node(&network, "A", &[], quiet_config());

    assert!(node
        .set("  ", &CountVector::new().increment(&node.own_id()), None)
        .is_err());
    assert!(node
        .set("k", &CountVector::new().increment(&node.own_id()), Some(0))
        .is_err());
    assert!(node.try_get::<CountVector>("").is_err());

    node.set("k", &CountVector::new().increment(&node.own_id()), None)
        .unwrap();

    // unregistered type
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Unregistered;
    assert!(node.try_get::<Multiple<Unregistered>>("k").is_err());
    // registered, but not the type stored under this key
    assert!(node.try_get::<Multiple<TestEntity>>("k").is_err());
}

#[tokio::test]
async fn expiring_items_read_as_absent() {
    let network = Network::new();
    let node = make_node(&network, "A", &[], quiet_config());
    let counter = CountVector::new().increment(&node.own_id());

    node.set("k", &counter, Some(150)).unwrap();
    assert!(node.try_get::<CountVector>("k").unwrap().is_some());

    sleep(Duration::from_millis(200)).await;
    assert!(node.try_get::<CountVector>("k").unwrap().is_none());
    let info = node.try_get_info::<CountVector>("k").unwrap().unwrap();
    assert!(info.expired);
    assert!(!info.deleted);
}

#[tokio::test]
async fn freshness_is_strictly_monotonic() {
    let network = Network::new();
    let node = make_node(&network, "A", &[], quiet_config());
    let sa = node.own_id();
    let mut last = node.status().last_freshness;
    for i in 0..5 {
        node.set(&format!("k{i}"), &CountVector::new().increment(&sa), None)
            .unwrap();
        let now = node.status().last_freshness;
        assert!(now > last, "freshness must strictly increase");
        last = now;
    }
    // touch re-stamps without changing the value
    node.touch("k0").unwrap();
    assert!(node.status().last_freshness > last);
}

#[tokio::test]
async fn changed_observers_and_watchers_fire() {
    let network = Network::new();
    let node = make_node(&network, "A", &[], quiet_config());
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        node.on_changed(move |event| seen.lock().unwrap().push(event.key.clone()));
    }
    let mut rx = node.watch("k");

    node.set("k", &CountVector::new().increment(&node.own_id()), None)
        .unwrap();
    tokio::time::timeout(Duration::from_millis(200), rx.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen.lock().unwrap().clone(), vec!["k".to_string()]);
}

// ---- package windowing ----

#[tokio::test]
async fn package_never_splits_a_freshness_group() {
    let network = Network::new();
    let config = GossipConfig {
        items_cutoff: 4,
        initial_package_size: 2,
        ..quiet_config()
    };
    let node = make_node(&network, "A", &[], config);
    let sa = node.own_id();
    let one = CountVector::new().increment(&sa);

    node.set("k1", &one, None).unwrap();
    // three keys committed in one transaction share one freshness value
    atomic(|tx| {
        node.set_tx(tx, "g1", &one, None).unwrap();
        node.set_tx(tx, "g2", &one, None).unwrap();
        node.set_tx(tx, "g3", &one, None).unwrap();
        Ok(())
    });
    node.set("k2", &one, None).unwrap();

    let (full, _) = atomic(|tx| Ok(node.build_package(tx, usize::MAX, None, None, None, None)));
    let group: Vec<u64> = full
        .iter()
        .filter(|i| i.key.starts_with('g'))
        .map(|i| i.freshness)
        .collect();
    assert_eq!(group.len(), 3);
    assert!(
        group.windows(2).all(|w| w[0] == w[1]),
        "grouped commits share one freshness"
    );
    let group_freshness = group[0];

    // a small package stops at group boundaries, never inside: the group is
    // either fully present or fully absent
    let (small, _) = atomic(|tx| Ok(node.build_package(tx, 2, None, None, None, None)));
    let in_package = small
        .iter()
        .filter(|i| i.freshness == group_freshness)
        .count();
    assert!(
        in_package == 0 || in_package == 3,
        "freshness group was split: {in_package}"
    );
}

#[tokio::test]
async fn package_rewinds_when_the_cutoff_lands_inside_a_group() {
    let network = Network::new();
    let config = GossipConfig {
        items_cutoff: 2,
        initial_package_size: 2,
        ..quiet_config()
    };
    let node = make_node(&network, "A", &[], config);
    let sa = node.own_id();
    let one = CountVector::new().increment(&sa);

    atomic(|tx| {
        node.set_tx(tx, "g1", &one, None).unwrap();
        node.set_tx(tx, "g2", &one, None).unwrap();
        node.set_tx(tx, "g3", &one, None).unwrap();
        Ok(())
    });
    node.set("k1", &one, None).unwrap();

    // the cutoff is reached inside the group: the scan rewinds to its start
    // and leaves the whole group for the next round
    let (package, cursor) =
        atomic(|tx| Ok(node.build_package(tx, usize::MAX, None, None, None, None)));
    let group_freshness = node
        .items
        .peek("g1")
        .map(|item| item.freshness)
        .unwrap();
    assert!(package.iter().all(|i| i.freshness != group_freshness));
    assert_eq!(package.len(), 1);
    assert_eq!(cursor.unwrap().freshness, group_freshness);
}

// ---- anti-entropy ----

#[tokio::test]
async fn gossip_replicates_a_single_value() {
    init_tracing();
    let network = Network::new();
    let a = make_node(&network, "A", &["B"], quiet_config());
    let b = make_node(&network, "B", &["A"], quiet_config());
    let sa = a.own_id();

    a.set_versioned("k", Versioned::first(entity(1, "one"), &sa), None)
        .unwrap();
    assert!(a.start_gossip(&b.own_id()));
    network.settle();

    let read: Multiple<TestEntity> = b.try_get("k").unwrap().unwrap();
    let version = read.single_version().unwrap();
    assert_eq!(version.value, entity(1, "one"));
    assert_eq!(version.clock, VectorClock::single("A", 1));
    assert_eq!(a.status().db_hash, b.status().db_hash);
}

#[tokio::test]
async fn gossip_converges_conflicting_writes() {
    let network = Network::new();
    let a = make_node(&network, "A", &["B"], quiet_config());
    let b = make_node(&network, "B", &["A"], quiet_config());

    a.set_versioned("k", Versioned::first(entity(1, "from a"), &a.own_id()), None)
        .unwrap();
    b.set_versioned("k", Versioned::first(entity(1, "from b"), &b.own_id()), None)
        .unwrap();

    a.start_gossip(&b.own_id());
    network.settle();
    b.start_gossip(&a.own_id());
    network.settle();

    assert_eq!(a.status().db_hash, b.status().db_hash);
    for node in [&a, &b] {
        let read: Multiple<TestEntity> = node.try_get("k").unwrap().unwrap();
        assert_eq!(read.len(), 2);
        let union = read.clock();
        assert_eq!(union.get(&a.own_id()), 1);
        assert_eq!(union.get(&b.own_id()), 1);
        for version in read.versions() {
            assert_eq!(union.compare(&version.clock), Relationship::Greater);
        }
    }
}

#[tokio::test]
async fn gossip_converges_many_keys_over_multiple_rounds() {
    init_tracing();
    let network = Network::new();
    let config = GossipConfig {
        initial_package_size: 4,
        items_cutoff: 16,
        ..quiet_config()
    };
    let a = make_node(&network, "A", &["B"], config.clone());
    let b = make_node(&network, "B", &["A"], config);
    let sa = a.own_id();
    let sb = b.own_id();

    for i in 0..80 {
        a.set(&format!("a{i}"), &CountVector::new().increment(&sa), None)
            .unwrap();
    }
    for i in 0..40 {
        b.set(&format!("b{i}"), &CountVector::new().increment(&sb), None)
            .unwrap();
    }

    // one exchange moves a bounded window; repeat until converged
    for _ in 0..40 {
        if a.status().db_hash == b.status().db_hash {
            break;
        }
        a.start_gossip(&sb);
        network.settle();
    }
    assert_eq!(a.status().db_hash, b.status().db_hash);
    assert!(b.try_get::<CountVector>("a79").unwrap().is_some());
    assert!(a.try_get::<CountVector>("b39").unwrap().is_some());
}

#[tokio::test]
async fn gossip_deletion_propagates_and_tombstones_collect() {
    let network = Network::new();
    let config = GossipConfig {
        removable_linger: Duration::from_millis(0),
        ..quiet_config()
    };
    let a = make_node(&network, "A", &["B"], config.clone());
    let b = make_node(&network, "B", &["A"], config);
    let sa = a.own_id();

    a.set("k", &CountVector::new().increment(&sa), None).unwrap();
    a.start_gossip(&b.own_id());
    network.settle();
    assert!(b.try_get::<CountVector>("k").unwrap().is_some());

    a.remove("k").unwrap();
    a.start_gossip(&b.own_id());
    network.settle();
    assert!(b.try_get::<CountVector>("k").unwrap().is_none());
    assert!(b.contains_key_with_info("k").unwrap());
    assert_eq!(a.status().db_hash, b.status().db_hash);

    // the watermark trails one sweep behind, so purging takes a few passes
    for _ in 0..3 {
        b.cleanup_tick();
    }
    assert!(!b.contains_key_with_info("k").unwrap());
    assert_eq!(a.status().db_hash, b.status().db_hash);
}

#[tokio::test]
async fn serially_connected_cluster_converges() {
    let network = Network::new();
    let a = make_node(&network, "A", &["B"], quiet_config());
    let b = make_node(&network, "B", &["A", "C"], quiet_config());
    let c = make_node(&network, "C", &["B"], quiet_config());
    network.disconnect("A", "C");

    a.set_versioned("k", Versioned::first(entity(1, "one"), &a.own_id()), None)
        .unwrap();

    a.start_gossip(&b.own_id());
    network.settle();
    b.start_gossip(&c.own_id());
    network.settle();

    let read: Multiple<TestEntity> = c.try_get("k").unwrap().unwrap();
    assert_eq!(read.single_version().unwrap().value, entity(1, "one"));
    assert_eq!(a.status().db_hash, c.status().db_hash);
}

#[tokio::test]
async fn direct_mail_always_pushes_immediately() {
    let network = Network::new();
    let config = GossipConfig {
        direct_mail: DirectMailMode::Always,
        ..quiet_config()
    };
    let a = make_node(&network, "A", &["B"], config.clone());
    let b = make_node(&network, "B", &["A"], config);

    a.set("k", &CountVector::new().increment(&a.own_id()), None)
        .unwrap();
    network.settle();
    assert_eq!(b.try_get::<CountVector>("k").unwrap().unwrap().total(), 1);
}

#[tokio::test]
async fn direct_mail_start_gossip_mode_converges() {
    let network = Network::new();
    let config = GossipConfig {
        direct_mail: DirectMailMode::StartGossip,
        ..quiet_config()
    };
    let a = make_node(&network, "A", &["B"], config.clone());
    let b = make_node(&network, "B", &["A"], config);

    a.set("k", &CountVector::new().increment(&a.own_id()), None)
        .unwrap();
    network.settle();
    assert_eq!(a.status().db_hash, b.status().db_hash);
    assert!(b.try_get::<CountVector>("k").unwrap().is_some());
}

#[tokio::test]
async fn simultaneous_starts_tie_break_deterministically() {
    let network = Network::new();
    let a = make_node(&network, "A", &["B"], quiet_config());
    let b = make_node(&network, "B", &["A"], quiet_config());

    a.set("ka", &CountVector::new().increment(&a.own_id()), None)
        .unwrap();
    b.set("kb", &CountVector::new().increment(&b.own_id()), None)
        .unwrap();

    // both sides open an exchange before either message is delivered; the
    // tie-break lets exactly one chain survive
    assert!(a.start_gossip(&b.own_id()));
    assert!(b.start_gossip(&a.own_id()));
    network.settle();
    for _ in 0..10 {
        if a.status().db_hash == b.status().db_hash {
            break;
        }
        a.start_gossip(&b.own_id());
        network.settle();
    }
    assert_eq!(a.status().db_hash, b.status().db_hash);
}

#[tokio::test]
async fn stale_reply_draws_a_kill() {
    let network = Network::new();
    let a = make_node(&network, "A", &["B"], quiet_config());
    let _b = make_node(&network, "B", &["A"], quiet_config());

    let bogus = Message::Reply(GossipReply {
        id: next_message_id(),
        from: ServerId::new("B"),
        db_hash: VersionHash(123),
        items: Vec::new(),
        window_start: 0,
        window_end: 0,
        last_window_start: 0,
        last_window_end: 0,
        reply_to: 999_999,
    });
    match a.handle_message(bogus) {
        Some(Message::Kill(kill)) => assert_eq!(kill.from, a.own_id()),
        other => panic!("expected kill, got {other:?}"),
    }
}

#[tokio::test]
async fn kill_only_removes_the_addressed_session() {
    let network = Network::new();
    let a = make_node(&network, "A", &["B"], quiet_config());
    let b = make_node(&network, "B", &["A"], quiet_config());
    let sb = b.own_id();

    a.set("k", &CountVector::new().increment(&a.own_id()), None)
        .unwrap();
    assert!(a.start_gossip(&sb));
    assert!(a.is_gossip_active(&sb));
    let session = a.sessions.peek(&sb.normalized()).unwrap();

    // a kill for some other exchange must not destroy the session
    a.handle_message(Message::Kill(KillGossip {
        from: sb.clone(),
        reply_to: session.last_sent - 1,
    }));
    assert!(a.is_gossip_active(&sb));

    a.handle_message(Message::Kill(KillGossip {
        from: sb.clone(),
        reply_to: session.last_sent,
    }));
    assert!(!a.is_gossip_active(&sb));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timer_driven_cluster_converges() {
    init_tracing();
    let network = Network::new();
    let config = GossipConfig {
        gossip_interval: Duration::from_millis(25),
        cleanup_interval: Duration::from_secs(3600),
        direct_mail: DirectMailMode::Off,
        ..GossipConfig::default()
    };
    let nodes = [
        make_node(&network, "A", &["B", "C"], config.clone()),
        make_node(&network, "B", &["A", "C"], config.clone()),
        make_node(&network, "C", &["A", "B"], config),
    ];
    let pump = network.spawn_pump();

    for (i, node) in nodes.iter().enumerate() {
        node.set(
            &format!("k{i}"),
            &CountVector::new().increment(&node.own_id()),
            None,
        )
        .unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let hash = nodes[0].status().db_hash;
        if nodes.iter().all(|n| n.status().db_hash == hash) && hash != VersionHash::default() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "cluster did not converge"
        );
        sleep(Duration::from_millis(50)).await;
    }
    for node in &nodes {
        for i in 0..3 {
            assert!(node
                .try_get::<CountVector>(&format!("k{i}"))
                .unwrap()
                .is_some());
        }
    }
    pump.abort();
}

// ---- consistent transactions ----

#[tokio::test]
async fn consistent_single_node_commits_immediately() {
    let network = Network::new();
    let base = make_node(&network, "A", &[], quiet_config());
    let node = ConsistentNode::new(base).unwrap();
    let sa = node.own_id();

    let (ok, _) = node
        .run_consistent(
            |ctx| {
                let current: CountVector = ctx.try_get("cnt")?.unwrap_or_default();
                ctx.set("cnt", &current.increment(&sa), None)?;
                Ok(())
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert!(ok);
    assert_eq!(
        node.try_get::<CountVector>("cnt").unwrap().unwrap().total(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consistent_commit_reaches_the_cluster() {
    init_tracing();
    let network = Network::new();
    let config = GossipConfig {
        direct_mail: DirectMailMode::Always,
        ..quiet_config()
    };
    let nodes: Vec<Arc<ConsistentNode>> = [
        ("A", vec!["B", "C"]),
        ("B", vec!["A", "C"]),
        ("C", vec!["A", "B"]),
    ]
    .into_iter()
    .map(|(own, peers)| {
        let base = make_node(&network, own, &peers, config.clone());
        ConsistentNode::new(base).unwrap()
    })
    .collect();
    let pump = network.spawn_pump();

    let sa = nodes[0].own_id();
    let (ok, _) = nodes[0]
        .run_consistent(
            |ctx| {
                let current: CountVector = ctx.try_get("cnt")?.unwrap_or_default();
                ctx.set("cnt", &current.increment(&sa), None)?;
                Ok(())
            },
            Duration::from_secs(3),
        )
        .await
        .unwrap();
    assert!(ok);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let spread = nodes
            .iter()
            .all(|n| matches!(n.try_get::<CountVector>("cnt"), Ok(Some(v)) if v.total() == 1));
        if spread {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "commit did not spread"
        );
        sleep(Duration::from_millis(25)).await;
    }
    pump.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consistent_commits_with_minority_offline() {
    let network = Network::new();
    let config = GossipConfig {
        direct_mail: DirectMailMode::Always,
        ..quiet_config()
    };
    let a = ConsistentNode::new(make_node(&network, "A", &["B", "C"], config.clone())).unwrap();
    let _b = ConsistentNode::new(make_node(&network, "B", &["A", "C"], config.clone())).unwrap();
    let _c = ConsistentNode::new(make_node(&network, "C", &["A", "B"], config)).unwrap();
    network.disconnect("A", "C");
    network.disconnect("B", "C");
    let pump = network.spawn_pump();

    let sa = a.own_id();
    let (ok, _) = a
        .run_consistent(
            |ctx| {
                let current: CountVector = ctx.try_get("cnt")?.unwrap_or_default();
                ctx.set("cnt", &current.increment(&sa), None)?;
                Ok(())
            },
            Duration::from_secs(3),
        )
        .await
        .unwrap();
    assert!(ok, "two of three is a majority");
    pump.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consistent_without_quorum_times_out_distinctly() {
    let network = Network::new();
    let config = GossipConfig {
        direct_mail: DirectMailMode::Always,
        ..quiet_config()
    };
    // B never votes: it is a plain gossip node without the consistent layer
    let a = ConsistentNode::new(make_node(&network, "A", &["B"], config.clone())).unwrap();
    let _b = make_node(&network, "B", &["A"], config);
    let pump = network.spawn_pump();

    let sa = a.own_id();
    let (ok, _) = a
        .run_consistent(
            |ctx| {
                ctx.set("cnt", &CountVector::new().increment(&sa), None)?;
                Ok(())
            },
            Duration::from_millis(400),
        )
        .await
        .unwrap();
    assert!(!ok, "no quorum must read as failure, not commit");
    assert!(a.try_get::<CountVector>("cnt").unwrap().is_none());
    pump.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consistent_retries_a_stale_read_instead_of_committing_it() {
    init_tracing();
    let network = Network::new();
    let config = GossipConfig {
        direct_mail: DirectMailMode::Always,
        ..quiet_config()
    };
    let a = ConsistentNode::new(make_node(&network, "A", &["B"], config.clone())).unwrap();
    let b = ConsistentNode::new(make_node(&network, "B", &["A"], config)).unwrap();
    let sa = a.own_id();
    let sb = b.own_id();

    // a value exists on A but has not replicated to B yet
    network.disconnect("A", "B");
    a.set("k", &CountVector::new().increment(&sa), None).unwrap();
    network.reconnect("A", "B");
    let pump = network.spawn_pump();

    // replication arrives while the transaction is already retrying
    {
        let a = a.clone();
        let sb = sb.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(150)).await;
            a.start_gossip(&sb);
        });
    }

    let attempts = Arc::new(AtomicUsize::new(0));
    let (ok, seen) = {
        let attempts = attempts.clone();
        b.run_consistent(
            move |ctx| {
                attempts.fetch_add(1, Ordering::SeqCst);
                let seen: Option<CountVector> = ctx.try_get("k")?;
                if let Some(v) = &seen {
                    ctx.set("mirror", v, None)?;
                }
                Ok(seen)
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap()
    };

    assert!(ok);
    assert_eq!(seen.unwrap().total(), 1, "committed against the fresh read");
    assert!(attempts.load(Ordering::SeqCst) >= 2, "stale attempt retried");
    assert_eq!(
        b.try_get::<CountVector>("mirror").unwrap().unwrap().total(),
        1
    );
    pump.abort();
}

#[tokio::test]
async fn prepared_handle_commits_or_rolls_back() {
    let network = Network::new();
    let base = make_node(&network, "A", &[], quiet_config());
    let node = ConsistentNode::new(base).unwrap();
    let sa = node.own_id();

    let prepared = node
        .prepare(|ctx| {
            ctx.set("cnt", &CountVector::new().increment(&sa), None)?;
            Ok(())
        })
        .unwrap()
        .unwrap();
    let (ok, _) = prepared.commit(Duration::from_secs(1)).await.unwrap();
    assert!(ok);
    assert_eq!(
        node.try_get::<CountVector>("cnt").unwrap().unwrap().total(),
        1
    );

    // a lone node is its own majority, so rollback needs an undecided
    // cluster: B never votes and the prepare stays short of a quorum
    let network = Network::new();
    let a = ConsistentNode::new(make_node(&network, "A", &["B"], quiet_config())).unwrap();
    let _b = make_node(&network, "B", &["A"], quiet_config());
    let sa = a.own_id();

    let prepared = a
        .prepare(|ctx| {
            ctx.set("other", &CountVector::new().increment(&sa), None)?;
            Ok(())
        })
        .unwrap()
        .unwrap();
    prepared.try_rollback();
    sleep(Duration::from_millis(20)).await;
    assert!(a.try_get::<CountVector>("other").unwrap().is_none());
}

#[tokio::test]
async fn replayed_transaction_after_cleanup_is_idempotent() {
    init_tracing();
    let network = Network::new();
    let config = GossipConfig {
        removable_linger: Duration::from_millis(0),
        ..quiet_config()
    };
    let base = make_node(&network, "A", &[], config);
    let node = ConsistentNode::new(base).unwrap();
    let sa = node.own_id();

    let (ok, _) = node
        .run_consistent(
            |ctx| {
                let current: CountVector = ctx.try_get("cnt")?.unwrap_or_default();
                ctx.set("cnt", &current.increment(&sa), None)?;
                Ok(())
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert!(ok);
    assert_eq!(
        node.try_get::<CountVector>("cnt").unwrap().unwrap().total(),
        1
    );

    // capture the ledger as the initiator originally broadcast it
    let (tx_key, original) = node
        .items
        .snapshot()
        .into_iter()
        .find(|(key, _)| key.starts_with(crate::TRANSACTION_PREFIX))
        .map(|(key, item)| {
            let stored: TransactionInfo = crate::types::decode(&item.data).unwrap();
            let original = TransactionInfo {
                initiator: stored.initiator.clone(),
                reads: stored.reads.clone(),
                changes: stored.changes.clone(),
                state: TransactionVector::new().with(&sa, TransactionState::PREPARED),
            };
            (key, original)
        })
        .expect("transaction ledger present");

    // done-majority ledgers become deletable and sweep out over a few passes
    for _ in 0..4 {
        node.cleanup_tick();
    }
    assert!(!node.contains_key_with_info(&tx_key).unwrap());

    // re-delivering the original prepare must fail read validation and
    // leave the counter untouched
    node.handle_message(Message::DirectMail(DirectMail {
        items: vec![WireItem {
            key: tx_key.clone(),
            tag: "~tx-info".to_string(),
            data: encode(&original).unwrap(),
            deleted: false,
            expires_in_ms: None,
            freshness: 1,
        }],
    }));
    sleep(Duration::from_millis(20)).await;
    assert_eq!(
        node.try_get::<CountVector>("cnt").unwrap().unwrap().total(),
        1
    );
}
