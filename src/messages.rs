use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use crate::item::WireItem;
use crate::types::{ServerId, VersionHash};

static NEXT_MESSAGE_ID: AtomicI64 = AtomicI64::new(1);

/// Locally unique, monotonically increasing id carried by every gossip
/// message; the sequencing checks of the handshake chain on it.
pub fn next_message_id() -> i64 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Eager push of just-committed items, outside any anti-entropy session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectMail {
    pub items: Vec<WireItem>,
}

/// Opens an anti-entropy exchange. Carries the sender's database hash, an
/// initial package, and the freshness window the package covers. `reply_to`
/// names the last message received from this peer, if any, letting the peer
/// detect a stale chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipStart {
    pub id: i64,
    pub from: ServerId,
    pub db_hash: VersionHash,
    /// Sorted by descending freshness; may be empty.
    pub items: Vec<WireItem>,
    /// Freshness of the next item the sender has yet to cover, 0 when the
    /// scan is complete.
    pub window_start: u64,
    /// Newest freshness covered by this package.
    pub window_end: u64,
    pub reply_to: Option<i64>,
}

/// One round of the exchange. Echoes the peer's window so both sides can
/// resume their own scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipReply {
    pub id: i64,
    pub from: ServerId,
    pub db_hash: VersionHash,
    pub items: Vec<WireItem>,
    pub window_start: u64,
    pub window_end: u64,
    /// The peer's `window_start` from the message this replies to.
    pub last_window_start: u64,
    /// The peer's `window_end` from the message this replies to.
    pub last_window_end: u64,
    pub reply_to: i64,
}

/// Terminates an exchange. `success` is true when both databases hashed
/// equal; false when the hashes differ but neither side had items to send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipEnd {
    pub id: i64,
    pub from: ServerId,
    pub success: bool,
    pub db_hash: VersionHash,
    pub window_end: u64,
    pub last_window_end: u64,
    pub reply_to: i64,
}

/// Tells the peer its session with us is stale and should be dropped.
/// Addressed to a specific message id so a kill for an old session cannot
/// destroy a newer one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillGossip {
    pub from: ServerId,
    pub reply_to: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    DirectMail(DirectMail),
    Start(GossipStart),
    Reply(GossipReply),
    End(GossipEnd),
    Kill(KillGossip),
}

impl Message {
    pub fn message_id(&self) -> Option<i64> {
        match self {
            Message::Start(m) => Some(m.id),
            Message::Reply(m) => Some(m.id),
            Message::End(m) => Some(m.id),
            Message::DirectMail(_) | Message::Kill(_) => None,
        }
    }
}
