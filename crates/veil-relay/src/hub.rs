//! Room orchestration
//!
//! The hub owns the room map and the host-key registry. All structural
//! mutation is funneled through one supervisor task consuming bounded intake
//! queues, so register, unregister, broadcast, and the idle sweep are
//! serialized without a global lock. The admission handler only does point
//! lookups (room count, member count, host key) against the shared maps.
//!
//! Intake queues are bounded; a full queue blocks the producer, which is the
//! back-pressure signal for systemic overload.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::room::{ClientHandle, ConnId, EgressSender, Room};

const REGISTER_BUFFER: usize = 64;
const UNREGISTER_BUFFER: usize = 64;
const BROADCAST_BUFFER: usize = 2048;

/// How often the supervisor checks rooms for idleness.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// An inbound frame queued for fan-out. `sender` is the exclusion key.
pub struct Envelope {
    pub room_id: String,
    pub sender: ConnId,
    pub data: Bytes,
}

struct Shared {
    rooms: DashMap<String, Room>,
    host_keys: DashMap<String, [u8; 32]>,
}

/// Cloneable handle to the hub. Producers push through the intake queues;
/// lookups read the shared maps directly.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<Shared>,
    register_tx: mpsc::Sender<Connection>,
    unregister_tx: mpsc::Sender<Arc<ClientHandle>>,
    broadcast_tx: mpsc::Sender<Envelope>,
}

impl Hub {
    pub fn new(idle_timeout: Duration) -> (Hub, Supervisor) {
        let (register_tx, register_rx) = mpsc::channel(REGISTER_BUFFER);
        let (unregister_tx, unregister_rx) = mpsc::channel(UNREGISTER_BUFFER);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_BUFFER);

        let hub = Hub {
            shared: Arc::new(Shared {
                rooms: DashMap::new(),
                host_keys: DashMap::new(),
            }),
            register_tx,
            unregister_tx,
            broadcast_tx,
        };
        let supervisor = Supervisor {
            hub: hub.clone(),
            register_rx,
            unregister_rx,
            broadcast_rx,
            idle_timeout,
        };
        (hub, supervisor)
    }

    /// Hand a freshly admitted connection to the supervisor.
    pub async fn register(&self, conn: Connection) {
        let _ = self.register_tx.send(conn).await;
    }

    pub async fn unregister(&self, client: Arc<ClientHandle>) {
        let _ = self.unregister_tx.send(client).await;
    }

    pub async fn broadcast(&self, envelope: Envelope) {
        let _ = self.broadcast_tx.send(envelope).await;
    }

    pub fn room_count(&self) -> usize {
        self.shared.rooms.len()
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        self.shared
            .rooms
            .get(room_id)
            .map(|room| room.count())
            .unwrap_or(0)
    }

    pub fn host_key(&self, room_id: &str) -> Option<[u8; 32]> {
        self.shared.host_keys.get(room_id).map(|key| *key)
    }

    /// Bind a room's verification key. Re-binding overwrites: hosts may
    /// rotate keys, at the cost of invalidating guest tokens signed with the
    /// old one at their next admission. Connected guests are not evicted.
    pub fn bind_host_key(&self, room_id: &str, key: [u8; 32]) {
        self.shared.host_keys.insert(room_id.to_string(), key);
    }
}

/// Single consumer of the hub's intake queues.
pub struct Supervisor {
    hub: Hub,
    register_rx: mpsc::Receiver<Connection>,
    unregister_rx: mpsc::Receiver<Arc<ClientHandle>>,
    broadcast_rx: mpsc::Receiver<Envelope>,
    idle_timeout: Duration,
}

impl Supervisor {
    /// Event loop: registration, unregistration, broadcast, a periodic idle
    /// sweep, and shutdown. Runs until the cancellation token fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let start = tokio::time::Instant::now() + SWEEP_INTERVAL;
        let mut sweep = tokio::time::interval_at(start, SWEEP_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.close_all();
                    return;
                }
                Some(conn) = self.register_rx.recv() => self.register(conn),
                Some(client) = self.unregister_rx.recv() => self.unregister(client),
                Some(envelope) = self.broadcast_rx.recv() => self.broadcast(envelope),
                _ = sweep.tick() => self.sweep_idle(),
            }
        }
    }

    fn register(&self, conn: Connection) {
        let client = conn.client();
        self.add_to_room(&client, conn.egress_sender());
        info!(
            peer = %client.peer_id(),
            conn = %client.conn_id,
            room = %client.room_id,
            role = %client.role,
            source = %client.source,
            "peer joined room"
        );
        conn.spawn(self.hub.clone());
    }

    /// Insert the membership entry. The entry takes the egress queue's only
    /// persistent sender; dropping it later is what closes the queue.
    fn add_to_room(&self, client: &ClientHandle, tx: EgressSender) {
        let mut room = self
            .hub
            .shared
            .rooms
            .entry(client.room_id.clone())
            .or_default();
        room.add(client.conn_id, tx);
    }

    fn unregister(&self, client: Arc<ClientHandle>) {
        let room_id = client.room_id.as_str();
        let peer_id = client.peer_id();

        // Decide removal under the entry guard, but remove outside it: the
        // shard is write-locked while the guard lives.
        let destroy = {
            let Some(mut room) = self.hub.shared.rooms.get_mut(room_id) else {
                return;
            };
            room.remove(client.conn_id);
            if room.count() == 0 {
                true
            } else {
                room.broadcast(client.conn_id, &leave_notice(&peer_id));
                false
            }
        };

        if destroy {
            self.hub.shared.rooms.remove(room_id);
            self.hub.shared.host_keys.remove(room_id);
            info!(room = %room_id, "room destroyed (no clients)");
        }
        info!(peer = %peer_id, room = %room_id, "peer left room");
    }

    fn broadcast(&self, envelope: Envelope) {
        // A missing room is not an error: the sender raced room teardown.
        if let Some(room) = self.hub.shared.rooms.get(&envelope.room_id) {
            room.broadcast(envelope.sender, &envelope.data);
        }
    }

    fn sweep_idle(&self) {
        let idle_timeout = self.idle_timeout;
        let host_keys = &self.hub.shared.host_keys;
        self.hub.shared.rooms.retain(|room_id, room| {
            if room.idle_for() > idle_timeout {
                room.close_all();
                host_keys.remove(room_id);
                info!(room = %room_id, "room cleaned up (idle timeout)");
                false
            } else {
                true
            }
        });
    }

    fn close_all(&self) {
        for mut entry in self.hub.shared.rooms.iter_mut() {
            entry.close_all();
        }
        self.hub.shared.rooms.clear();
        self.hub.shared.host_keys.clear();
        debug!("hub shut down, all rooms closed");
    }
}

/// Synthetic envelope telling remaining members that a peer disconnected.
/// Carries the peer's client-visible identity, which may have been relearned
/// from its first inbound frame.
#[derive(Serialize)]
struct LeaveNotice<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    from: &'a str,
    ts: i64,
    nonce: u64,
    payload: Option<()>,
    sig: Option<()>,
}

fn leave_notice(peer_id: &str) -> Bytes {
    let notice = LeaveNotice {
        id: "",
        kind: "session:leave",
        from: peer_id,
        ts: chrono::Utc::now().timestamp_millis(),
        nonce: 0,
        payload: None,
        sig: None,
    };
    serde_json::to_vec(&notice).map(Bytes::from).unwrap_or_default()
}
