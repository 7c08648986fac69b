//! The anti-entropy exchange: a bounded, resumable, bidirectional handshake
//! per (self, peer) pair. A session moves Idle → Started → Replying → Ended;
//! each round compares database hashes, exchanges windowed packages built
//! from the freshness index, and doubles the package size until the hashes
//! agree or neither side has anything left to send.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rand::Rng;
use tracing::{debug, trace};

use crate::error::Result;
use crate::freshness::Cursor;
use crate::item::{Item, WireItem};
use crate::messages::{
    next_message_id, GossipEnd, GossipReply, GossipStart, KillGossip, Message,
};
use crate::stm::{atomic, Tx};
use crate::store::GossipNode;
use crate::types::{now_ms, ServerId, VersionHash};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum MessageKind {
    Start,
    Reply,
    End,
}

/// Per-peer session state, held only while an exchange is in flight.
#[derive(Clone)]
pub(crate) struct GossipState {
    pub last_received: Option<i64>,
    pub last_sent: i64,
    pub last_sent_kind: MessageKind,
    /// Where our deep scan stopped; the next round resumes here.
    pub window_cursor: Option<Cursor>,
    pub last_package_size: usize,
    /// When the last sent message was a Start that superseded an End, the
    /// End's id — a late reply to it continues the old chain.
    pub previous_end_id: Option<i64>,
    pub created_at: Instant,
}

/// Common view of the package-carrying gossip messages (Start and Reply).
struct News<'a> {
    id: i64,
    from: &'a ServerId,
    items: &'a [WireItem],
    window_start: u64,
    window_end: u64,
}

fn news_of(msg: &Message) -> Option<News<'_>> {
    match msg {
        Message::Start(m) => Some(News {
            id: m.id,
            from: &m.from,
            items: &m.items,
            window_start: m.window_start,
            window_end: m.window_end,
        }),
        Message::Reply(m) => Some(News {
            id: m.id,
            from: &m.from,
            items: &m.items,
            window_start: m.window_start,
            window_end: m.window_end,
        }),
        _ => None,
    }
}

fn as_reply(msg: &Message) -> Option<&GossipReply> {
    match msg {
        Message::Reply(m) => Some(m),
        _ => None,
    }
}

fn as_end(msg: &Message) -> Option<&GossipEnd> {
    match msg {
        Message::End(m) => Some(m),
        _ => None,
    }
}

fn gossip_from(msg: &Message) -> &ServerId {
    match msg {
        Message::Start(m) => &m.from,
        Message::Reply(m) => &m.from,
        Message::End(m) => &m.from,
        _ => unreachable!("not a gossip message"),
    }
}

fn gossip_id(msg: &Message) -> i64 {
    msg.message_id().expect("gossip message carries an id")
}

fn gossip_db_hash(msg: &Message) -> VersionHash {
    match msg {
        Message::Start(m) => m.db_hash,
        Message::Reply(m) => m.db_hash,
        Message::End(m) => m.db_hash,
        _ => unreachable!("not a gossip message"),
    }
}

fn reply_to_of(msg: &Message) -> Option<i64> {
    match msg {
        Message::Start(m) => m.reply_to,
        Message::Reply(m) => Some(m.reply_to),
        Message::End(m) => Some(m.reply_to),
        _ => None,
    }
}

impl GossipNode {
    /// Entry point for every inbound message. Returns the response to send
    /// back to the peer, if any.
    pub fn handle_message(&self, msg: Message) -> Option<Message> {
        match msg {
            Message::DirectMail(mail) => {
                let applied: Result<()> =
                    atomic(|tx| Ok(self.apply_items(tx, &mail.items, true).map(|_| ())));
                if let Err(e) = applied {
                    self.notify_error(&e);
                }
                None
            }
            Message::Kill(kill) => {
                self.handle_kill(&kill);
                None
            }
            msg @ (Message::Start(_) | Message::Reply(_) | Message::End(_)) => {
                self.handle_gossip(&msg)
            }
        }
    }

    fn handle_kill(&self, kill: &KillGossip) {
        let key = kill.from.normalized();
        let reply_to = kill.reply_to;
        atomic(|tx| {
            // only a kill addressed to our live message may drop the session
            if let Some(state) = self.sessions.get(tx, &key) {
                if state.last_sent == reply_to {
                    self.sessions.remove(tx, &key);
                }
            }
            Ok(())
        })
    }

    fn handle_gossip(&self, msg: &Message) -> Option<Message> {
        let mut ignore_up_to: Option<u64> = None;
        let mut keys_to_ignore: Option<HashSet<String>> = None;

        if let Some(news) = news_of(msg) {
            if !news.items.is_empty() && gossip_db_hash(msg) != self.db_hash.peek() {
                let watermark: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
                let applied: Result<Option<HashSet<String>>> = atomic(|tx| {
                    let keys = match self.apply_items(tx, news.items, true) {
                        Ok(keys) => keys,
                        Err(e) => return Ok(Err(e)),
                    };
                    let wm = watermark.clone();
                    let index = self.index.clone();
                    tx.finalize(move || {
                        *wm.lock().expect("watermark poisoned") = Some(index.last_freshness());
                    });
                    Ok(Ok(keys))
                });
                match applied {
                    Ok(keys) => {
                        if keys.is_some() {
                            keys_to_ignore = keys;
                            ignore_up_to = *watermark.lock().expect("watermark poisoned");
                        }
                    }
                    Err(e) => {
                        self.notify_error(&e);
                        return None;
                    }
                }
            }
        }

        atomic(|tx| Ok(self.get_reply(tx, msg, ignore_up_to, keys_to_ignore.as_ref())))
    }

    fn has_timed_out(&self, state: &GossipState) -> bool {
        state.created_at.elapsed() >= self.config.idle_timeout
    }

    /// Whether an exchange with `server` is currently in flight and fresh.
    pub fn is_gossip_active(&self, server: &ServerId) -> bool {
        atomic(|tx| {
            let Some(state) = self.sessions.get(tx, &server.normalized()) else {
                return Ok(false);
            };
            Ok(state.last_sent_kind != MessageKind::End && !self.has_timed_out(&state))
        })
    }

    /// Gossip timer body: pick a random peer, re-picking a bounded number of
    /// times when the pick already has an active session.
    pub(crate) fn spread_rumors(&self) {
        let servers = self.transport.servers();
        if servers.is_empty() {
            return;
        }
        let mut rng = rand::thread_rng();
        let mut remaining = i64::from(self.config.hunting_limit);
        loop {
            let server = &servers[rng.gen_range(0..servers.len())];
            if self.start_gossip(server) {
                break;
            }
            remaining -= 1;
            if remaining < 0 {
                break;
            }
        }
    }

    /// Open an exchange with `server`. Returns false when a session with it
    /// is already active.
    pub fn start_gossip(&self, server: &ServerId) -> bool {
        atomic(|tx| {
            let key = server.normalized();
            let old = self.sessions.get(tx, &key);
            if let Some(state) = &old {
                if state.last_sent_kind != MessageKind::End && !self.has_timed_out(state) {
                    return Ok(false);
                }
            }
            let last_received = old.as_ref().and_then(|s| s.last_received);
            let (to_send, cursor) = self.build_package(
                tx,
                self.config.initial_package_size,
                None,
                None,
                None,
                None,
            );
            let now = now_ms();
            let items: Vec<WireItem> = to_send
                .iter()
                .map(|item| WireItem::from_item(item, now))
                .collect();
            let window_end = if items.is_empty() {
                self.index.last_freshness()
            } else {
                items[0].freshness
            };
            let window_start = if items.is_empty() {
                0
            } else {
                cursor.map(|c| c.freshness).unwrap_or(0)
            };
            let msg = GossipStart {
                id: next_message_id(),
                from: self.own_id(),
                db_hash: self.db_hash.get(tx),
                items,
                window_start,
                window_end,
                reply_to: last_received,
            };
            let previous_end_id = old
                .filter(|s| s.last_sent_kind == MessageKind::End)
                .map(|s| s.last_sent);
            self.sessions.set(
                tx,
                &key,
                GossipState {
                    last_received: None,
                    last_sent: msg.id,
                    last_sent_kind: MessageKind::Start,
                    window_cursor: cursor,
                    last_package_size: self.config.initial_package_size,
                    previous_end_id,
                    created_at: Instant::now(),
                },
            );
            trace!(server = %server, id = msg.id, "starting gossip");
            let transport = self.transport.clone();
            let target = server.clone();
            tx.side_effect(move || transport.send(&target, Message::Start(msg), true));
            Ok(true)
        })
    }

    /// Validate protocol sequencing. Returns (accept, continuing session,
    /// answer with kill). Sequencing that cannot happen without a local
    /// logic error panics.
    fn should_reply(
        &self,
        tx: &mut Tx,
        msg: &Message,
    ) -> (bool, Option<GossipState>, bool) {
        let from = gossip_from(msg);
        let is_starter = matches!(msg, Message::Start(_));
        let his_reply = as_reply(msg);

        let state = match self.sessions.get(tx, &from.normalized()) {
            Some(state) if !self.has_timed_out(&state) => state,
            // obsolete or missing state: only starters are welcome
            _ => return (is_starter, None, his_reply.is_some()),
        };

        if is_starter {
            // he saw our last message, whatever it was, and chose to start
            // over; this happens when our End got lost
            if reply_to_of(msg) == Some(state.last_sent) {
                return (true, None, false);
            }
            // simultaneous start: deterministic tie-break, lower id wins
            let accept = state.last_sent_kind == MessageKind::End
                || (state.last_sent_kind == MessageKind::Start && *from < self.own_id());
            return (accept, None, false);
        }

        // a reply to our End that arrived after we already sent a new Start:
        // prefer continuing the old chain
        if state.last_sent_kind == MessageKind::Start
            && state.previous_end_id.is_some()
            && state.previous_end_id == reply_to_of(msg)
        {
            let Some(reply) = his_reply else {
                panic!("reply chain logic failure: end message chained to a finished exchange");
            };
            if reply.last_window_start > 0 {
                panic!("reply chain logic failure: resumed chain claims a live window");
            }
            return (true, None, false);
        }

        if reply_to_of(msg) != Some(state.last_sent) {
            let kill = his_reply.is_some_and(|r| Some(r.id) != state.last_received);
            return (false, None, kill);
        }

        let our_last_start = his_reply.map(|r| r.last_window_start).unwrap_or(0);
        let stored = state.window_cursor.map(|c| c.freshness).unwrap_or(0);
        if our_last_start > 0 && our_last_start != stored {
            panic!("reply chain logic failure: window echo does not match our cursor");
        }

        (true, Some(state), false)
    }

    fn get_reply(
        &self,
        tx: &mut Tx,
        msg: &Message,
        ignore_up_to: Option<u64>,
        keys_to_ignore: Option<&HashSet<String>>,
    ) -> Option<Message> {
        let from = gossip_from(msg);
        let session_key = from.normalized();
        let news = news_of(msg);
        let his_reply = as_reply(msg);
        let his_end = as_end(msg);

        let (accept, current_state, send_kill) = self.should_reply(tx, msg);
        if !accept {
            if send_kill {
                debug!(server = %from, "killing stale gossip chain");
                return Some(Message::Kill(KillGossip {
                    from: self.own_id(),
                    reply_to: gossip_id(msg),
                }));
            }
            return None;
        }

        let last_window_start = his_reply.map(|r| r.last_window_start).unwrap_or(0);
        let last_window_end = his_reply
            .map(|r| r.last_window_end)
            .or_else(|| his_end.map(|e| e.last_window_end));

        let own_hash = self.db_hash.get(tx);
        if own_hash == gossip_db_hash(msg) {
            if his_end.is_some() {
                self.sessions.remove(tx, &session_key);
                return None;
            }
            let news = news.expect("package-carrying message expected");
            let size = current_state
                .as_ref()
                .map(|s| s.last_package_size)
                .unwrap_or(0);
            return Some(self.prepare_end(tx, &news, size, true));
        }

        let package_size = match &current_state {
            None => self.config.initial_package_size,
            Some(state) => self
                .config
                .initial_package_size
                .max(self.config.items_cutoff.min(state.last_package_size * 2)),
        };
        let resume = if last_window_start > 0 {
            current_state.as_ref().and_then(|s| s.window_cursor)
        } else {
            None
        };
        let (to_send, new_cursor) = self.build_package(
            tx,
            package_size,
            resume,
            last_window_end,
            ignore_up_to,
            keys_to_ignore,
        );

        let last_size = current_state
            .as_ref()
            .map(|s| s.last_package_size)
            .unwrap_or(0);

        if to_send.is_empty() {
            return match news {
                // his End, and we have nothing left either: the chain is done
                None => {
                    self.sessions.remove(tx, &session_key);
                    None
                }
                Some(news) if news.items.is_empty() => {
                    Some(self.prepare_end(tx, &news, last_size, false))
                }
                // keep the round alive so the peer can finish its own scan
                Some(news) => {
                    let reply = GossipReply {
                        id: next_message_id(),
                        from: self.own_id(),
                        db_hash: own_hash,
                        items: Vec::new(),
                        window_start: 0,
                        window_end: self.index.last_freshness(),
                        last_window_start: news.window_start,
                        last_window_end: news.window_end,
                        reply_to: news.id,
                    };
                    Some(self.prepare_reply(tx, from, reply, None, last_size))
                }
            };
        }

        let now = now_ms();
        let items: Vec<WireItem> = to_send
            .iter()
            .map(|item| WireItem::from_item(item, now))
            .collect();
        let reply = GossipReply {
            id: next_message_id(),
            from: self.own_id(),
            db_hash: own_hash,
            items,
            window_start: new_cursor.map(|c| c.freshness).unwrap_or(0),
            window_end: self.index.last_freshness(),
            last_window_start: news.as_ref().map(|n| n.window_start).unwrap_or(0),
            last_window_end: news
                .as_ref()
                .map(|n| n.window_end)
                .or_else(|| his_end.map(|e| e.window_end))
                .expect("gossip message carries a window end"),
            reply_to: gossip_id(msg),
        };
        Some(self.prepare_reply(tx, from, reply, new_cursor, package_size))
    }

    fn prepare_end(
        &self,
        tx: &mut Tx,
        news: &News<'_>,
        last_package_size: usize,
        success: bool,
    ) -> Message {
        let end = GossipEnd {
            id: next_message_id(),
            from: self.own_id(),
            success,
            db_hash: self.db_hash.get(tx),
            window_end: self.index.last_freshness(),
            last_window_end: news.window_end,
            reply_to: news.id,
        };
        // ending state is written in-transaction so is_gossip_active and the
        // acceptance checks see it immediately
        self.sessions.set(
            tx,
            &news.from.normalized(),
            GossipState {
                last_received: Some(news.id),
                last_sent: end.id,
                last_sent_kind: MessageKind::End,
                window_cursor: None,
                last_package_size,
                previous_end_id: None,
                created_at: Instant::now(),
            },
        );
        Message::End(end)
    }

    fn prepare_reply(
        &self,
        tx: &mut Tx,
        server: &ServerId,
        reply: GossipReply,
        cursor: Option<Cursor>,
        package_size: usize,
    ) -> Message {
        // reply transactions stay read-only since they conflict too easily;
        // whatever a session update misses now shows up in the next round
        let sessions = self.sessions.clone();
        let key = server.normalized();
        let last_received = reply.reply_to;
        let last_sent = reply.id;
        tx.side_effect(move || {
            atomic(|tx| {
                sessions.set(
                    tx,
                    &key,
                    GossipState {
                        last_received: Some(last_received),
                        last_sent,
                        last_sent_kind: MessageKind::Reply,
                        window_cursor: cursor,
                        last_package_size: package_size,
                        previous_end_id: None,
                        created_at: Instant::now(),
                    },
                );
                Ok(())
            })
        });
        Message::Reply(reply)
    }

    /// Build an outbound package by scanning the freshness index newest
    /// first. Two hard limits (item count, payload bytes) are enforced at
    /// freshness-group boundaries; a group is never split — when the count
    /// cutoff lands mid-group the scan rewinds to the group's start.
    ///
    /// Phase 1 collects items newer than the window the chain has already
    /// covered (`last_window_end`); phase 2 resumes the deep scan at the
    /// cursor stored from the previous round.
    pub(crate) fn build_package(
        &self,
        tx: &mut Tx,
        package_size: usize,
        resume: Option<Cursor>,
        last_window_end: Option<u64>,
        ignore_up_to: Option<u64>,
        keys_to_ignore: Option<&HashSet<String>>,
    ) -> (Vec<Arc<Item>>, Option<Cursor>) {
        debug_assert!(package_size > 0);
        let cutoff = self.config.items_cutoff;
        let bytes_cutoff = self.config.bytes_cutoff;
        let mut result: Vec<Arc<Item>> = Vec::new();
        let mut bytes = 0usize;
        let guard = self.index.read();
        let generation = guard.generation();

        // freshness of the group being collected and its first position
        let mut group: Option<(u64, usize)> = None;

        let mut pos = guard.len();
        while pos > 0 {
            let entry = guard.entry(pos - 1);
            let live = self.get_item(tx, &entry.item.key);
            if !live.as_ref().is_some_and(|l| Arc::ptr_eq(l, &entry.item)) {
                pos -= 1;
                continue;
            }
            if last_window_end.is_some_and(|lwe| entry.freshness <= lwe) {
                break;
            }
            if group.is_none_or(|(f, _)| f != entry.freshness) {
                if result.len() >= cutoff
                    || bytes >= bytes_cutoff
                    || (last_window_end.is_none() && result.len() >= package_size)
                {
                    return (
                        result,
                        Some(Cursor {
                            generation,
                            pos: pos - 1,
                            freshness: entry.freshness,
                        }),
                    );
                }
                group = Some((entry.freshness, pos - 1));
            }
            let ignored = keys_to_ignore.is_some_and(|keys| {
                ignore_up_to.is_some_and(|up| entry.freshness <= up)
                    && keys.contains(&entry.item.key)
            });
            if !ignored {
                if result.len() == cutoff {
                    let (freshness, start_pos) =
                        group.expect("cutoff reached outside a group");
                    let first = result
                        .iter()
                        .position(|i| i.freshness == freshness)
                        .unwrap_or(result.len());
                    result.truncate(first);
                    return (
                        result,
                        Some(Cursor {
                            generation,
                            pos: start_pos,
                            freshness,
                        }),
                    );
                }
                bytes += entry.item.data.len();
                result.push(entry.item.clone());
            }
            pos -= 1;
        }

        // phase 1 done; continue the deep scan from the stored cursor
        let Some(rc) = resume else {
            return (result, None);
        };
        let mut pos = if rc.generation == generation
            && rc.pos < guard.len()
            && guard.entry(rc.pos).freshness == rc.freshness
        {
            Some(rc.pos)
        } else {
            guard.locate_at_or_below(rc.freshness)
        };
        // the stored position may reference superseded entries; advance to
        // the next older live one
        while let Some(p) = pos {
            let entry = guard.entry(p);
            let live = self.get_item(tx, &entry.item.key);
            if live.as_ref().is_some_and(|l| Arc::ptr_eq(l, &entry.item)) {
                break;
            }
            pos = p.checked_sub(1);
        }
        let Some(mut p) = pos else {
            return (result, None);
        };
        loop {
            let entry = guard.entry(p);
            let is_live = {
                let live = self.get_item(tx, &entry.item.key);
                live.as_ref().is_some_and(|l| Arc::ptr_eq(l, &entry.item))
            };
            if is_live {
                if group.is_none_or(|(f, _)| f != entry.freshness) {
                    if result.len() >= cutoff
                        || bytes >= bytes_cutoff
                        || result.len() >= package_size
                    {
                        return (
                            result,
                            Some(Cursor {
                                generation,
                                pos: p,
                                freshness: entry.freshness,
                            }),
                        );
                    }
                    group = Some((entry.freshness, p));
                }
                if result.len() == cutoff {
                    let (freshness, start_pos) =
                        group.expect("cutoff reached outside a group");
                    let first = result
                        .iter()
                        .position(|i| i.freshness == freshness)
                        .unwrap_or(result.len());
                    result.truncate(first);
                    return (
                        result,
                        Some(Cursor {
                            generation,
                            pos: start_pos,
                            freshness,
                        }),
                    );
                }
                bytes += entry.item.data.len();
                result.push(entry.item.clone());
            }
            match p.checked_sub(1) {
                Some(next) => p = next,
                None => break,
            }
        }
        (result, None)
    }
}
