//! Room membership and fan-out
//!
//! A room maps connection ids to egress senders. Broadcast is best-effort:
//! each recipient gets a non-blocking push onto its queue, and a full queue
//! means that recipient misses that one message.
//!
//! The membership entry holds the queue's only persistent sender, so
//! removing the entry — unregister, idle sweep, or shutdown — is what closes
//! a connection's egress queue, and it can only happen once.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::RngCore;
use tokio::sync::mpsc;

/// Egress queue capacity per connection.
pub const EGRESS_BUFFER: usize = 512;

pub type EgressSender = mpsc::Sender<Bytes>;
pub type EgressReceiver = mpsc::Receiver<Bytes>;

/// Create the bounded egress queue for one connection.
pub fn egress_channel() -> (EgressSender, EgressReceiver) {
    mpsc::channel(EGRESS_BUFFER)
}

/// Random 128-bit connection identifier, unique for the process lifetime.
/// This — not `peer_id` — is the key for membership and sender exclusion:
/// several connections may legitimately announce the same peer id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId([u8; 16]);

impl ConnId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnId({})", self)
    }
}

/// Shared descriptor for one live connection.
///
/// `peer_id` starts as the token's claim and may be relearned once from the
/// first non-voice inbound frame, so it sits behind a lock.
pub struct ClientHandle {
    pub conn_id: ConnId,
    pub room_id: String,
    pub role: String,
    pub source: String,
    peer_id: Mutex<String>,
}

impl ClientHandle {
    pub fn new(room_id: String, peer_id: String, role: String, source: String) -> Self {
        Self {
            conn_id: ConnId::generate(),
            room_id,
            role,
            source,
            peer_id: Mutex::new(peer_id),
        }
    }

    pub fn peer_id(&self) -> String {
        self.peer_id.lock().unwrap().clone()
    }

    /// Adopt the identity the client actually uses on the wire.
    pub fn relearn_peer_id(&self, peer_id: String) {
        *self.peer_id.lock().unwrap() = peer_id;
    }
}

/// One room's membership set and activity clock.
///
/// Mutation (add/remove/close) goes through the hub supervisor, which holds
/// the map entry's write side; broadcast only needs a shared reference, so
/// `last_activity` is an atomic updated with `fetch_max` to stay monotonic
/// without a lock upgrade.
pub struct Room {
    members: HashMap<ConnId, EgressSender>,
    created: Instant,
    last_activity_ms: AtomicU64,
}

impl Default for Room {
    fn default() -> Self {
        Self::new()
    }
}

impl Room {
    pub fn new() -> Self {
        Self {
            members: HashMap::new(),
            created: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    pub fn add(&mut self, conn_id: ConnId, tx: EgressSender) {
        self.members.insert(conn_id, tx);
        self.touch();
    }

    /// Remove a member, dropping its egress sender and thereby closing its
    /// queue.
    pub fn remove(&mut self, conn_id: ConnId) {
        self.members.remove(&conn_id);
        self.touch();
    }

    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// Fan `data` out to every member except the sender. A member whose
    /// egress queue is full silently misses this message; the others are
    /// unaffected.
    pub fn broadcast(&self, sender: ConnId, data: &Bytes) {
        self.touch();
        for (conn_id, tx) in &self.members {
            if *conn_id == sender {
                continue;
            }
            let _ = tx.try_send(data.clone());
        }
    }

    /// Drop every membership entry, closing each member's egress queue.
    /// Writers observe the closed queue and wind their sockets down.
    pub fn close_all(&mut self) {
        self.members.clear();
    }

    /// How long since the last add, remove, or broadcast.
    pub fn idle_for(&self) -> Duration {
        let now_ms = self.created.elapsed().as_millis() as u64;
        Duration::from_millis(now_ms.saturating_sub(self.last_activity_ms.load(Ordering::Relaxed)))
    }

    fn touch(&self) {
        let now_ms = self.created.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now_ms, Ordering::Relaxed);
    }
}
