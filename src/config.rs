use std::time::Duration;

/// When a locally committed change is eagerly pushed to peers, ahead of the
/// next anti-entropy round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectMailMode {
    /// Never push; changes spread only via gossip.
    Off,
    /// Broadcast every change to all known servers.
    Always,
    /// Push to a server unless an anti-entropy session with it is already
    /// active (the session will carry the change anyway).
    GossipSuppressed,
    /// Do not push items; start an anti-entropy exchange instead.
    StartGossip,
}

/// Tunables of the gossip backend. `Default` gives a working mid-size setup;
/// tests shrink the intervals.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// How often the gossip timer fires and picks a random peer.
    pub gossip_interval: Duration,
    /// A session with no traffic for this long no longer counts as active
    /// and will not block a fresh exchange.
    pub idle_timeout: Duration,
    /// Item count of the first package of an exchange; doubles per
    /// round-trip up to `items_cutoff`.
    pub initial_package_size: usize,
    /// Hard upper bound on items per package.
    pub items_cutoff: usize,
    /// Hard upper bound on payload bytes per package, checked at freshness
    /// group boundaries.
    pub bytes_cutoff: usize,
    /// How many times the gossip timer re-picks when the chosen peer already
    /// has an active session.
    pub hunting_limit: u32,
    pub direct_mail: DirectMailMode,
    /// How often the expiry / tombstone / deletable sweep runs.
    pub cleanup_interval: Duration,
    /// How long a deletable value lingers before the sweep removes it.
    pub removable_linger: Duration,
    /// Two items count as byte-equal if their remaining expiries differ by
    /// at most this much.
    pub expiry_tolerance_ms: i64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_millis(1000),
            idle_timeout: Duration::from_millis(10_000),
            initial_package_size: 16,
            items_cutoff: 256,
            bytes_cutoff: 1024 * 1024,
            hunting_limit: 2,
            direct_mail: DirectMailMode::GossipSuppressed,
            cleanup_interval: Duration::from_millis(15_000),
            removable_linger: Duration::from_millis(60_000),
            expiry_tolerance_ms: 100,
        }
    }
}
