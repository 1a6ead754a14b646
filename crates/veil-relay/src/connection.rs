//! Per-connection reader and writer pumps
//!
//! After admission every connection runs two tasks. The reader normalizes
//! inbound frames into broadcast envelopes and enforces liveness through a
//! pong-extended read deadline. The writer drains the egress queue with two
//! scheduling classes:
//!
//! - **Voice frames** (magic prefix `0x4B 0x56`) go out as one WebSocket
//!   binary message each. Encrypted voice bytes may contain `0x0A`, the data
//!   batch separator, so voice is never concatenated.
//! - **Data frames** (everything else) are drained and joined with `0x0A`
//!   into a single binary message for throughput. Voice frames encountered
//!   mid-drain are deferred and flushed as standalone messages afterwards.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info};

use crate::hub::{Envelope, Hub};
use crate::room::{ClientHandle, EgressReceiver, EgressSender};

/// A peer must pong (or send traffic) within this window.
const PONG_WAIT: Duration = Duration::from_secs(60);

/// Pings go out at 90% of the pong window.
const PING_PERIOD: Duration = Duration::from_secs(PONG_WAIT.as_secs() * 9 / 10);

/// Deadline applied to every socket write.
const WRITE_WAIT: Duration = Duration::from_secs(60);

/// Magic prefix marking real-time voice payloads ("KV").
const VOICE_MAGIC: [u8; 2] = [0x4B, 0x56];

pub fn is_voice_frame(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == VOICE_MAGIC[0] && data[1] == VOICE_MAGIC[1]
}

/// A connection that passed admission but is not yet pumping.
///
/// Carries both halves of the egress queue: the hub moves the sender into
/// the room membership entry at registration, and `spawn` hands the receiver
/// to the writer. After that the entry owns the queue's only persistent
/// sender, so removing it is what shuts the writer down.
pub struct Connection {
    socket: WebSocket,
    client: Arc<ClientHandle>,
    tx: EgressSender,
    egress: EgressReceiver,
}

impl Connection {
    pub fn new(
        socket: WebSocket,
        client: Arc<ClientHandle>,
        tx: EgressSender,
        egress: EgressReceiver,
    ) -> Self {
        Self {
            socket,
            client,
            tx,
            egress,
        }
    }

    pub fn client(&self) -> Arc<ClientHandle> {
        Arc::clone(&self.client)
    }

    /// Sender for the room membership entry.
    pub fn egress_sender(&self) -> EgressSender {
        self.tx.clone()
    }

    /// Split the socket and start the two pumps. Drops this connection's own
    /// sender copy, leaving the membership entry as the queue's sole owner.
    pub fn spawn(self, hub: Hub) {
        let (sink, stream) = self.socket.split();
        tokio::spawn(write_pump(sink, self.egress, Arc::clone(&self.client)));
        tokio::spawn(read_pump(stream, self.client, hub));
    }
}

/// Envelope peek used only to learn the sender's client-visible identity.
#[derive(Deserialize)]
struct InboundEnvelope {
    #[serde(default)]
    from: String,
}

fn extract_from_field(data: &[u8]) -> Option<String> {
    serde_json::from_slice::<InboundEnvelope>(data)
        .ok()
        .map(|envelope| envelope.from)
        .filter(|from| !from.is_empty())
}

/// Read frames until error, close, or deadline, forwarding each one to the
/// hub as a broadcast envelope. Exiting schedules unregistration.
async fn read_pump(mut stream: SplitStream<WebSocket>, client: Arc<ClientHandle>, hub: Hub) {
    let mut deadline = Instant::now() + PONG_WAIT;
    let mut peer_id_learned = false;

    loop {
        let message = match timeout_at(deadline, stream.next()).await {
            // No pong inside the window: the peer is gone.
            Err(_) => break,
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(
                    peer = %client.peer_id(),
                    room = %client.room_id,
                    "read error: {err}"
                );
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        let data: Bytes = match message {
            Message::Binary(data) => data,
            Message::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            Message::Pong(_) => {
                deadline = Instant::now() + PONG_WAIT;
                continue;
            }
            // The protocol layer answers pings for us.
            Message::Ping(_) => continue,
            Message::Close(_) => break,
        };

        // Learn the client's actual peer id from the first non-voice frame.
        // A shared invite can put several guests behind one token, so the
        // envelope's `from` supersedes the claim for leave notifications.
        // Observational only; the token is not re-validated.
        if !peer_id_learned && !is_voice_frame(&data) {
            if let Some(real_id) = extract_from_field(&data) {
                if real_id != client.peer_id() {
                    info!(
                        peer = %client.peer_id(),
                        identified_as = %real_id,
                        room = %client.room_id,
                        "peer identified"
                    );
                    client.relearn_peer_id(real_id);
                }
            }
            peer_id_learned = true;
        }

        hub.broadcast(Envelope {
            room_id: client.room_id.clone(),
            sender: client.conn_id,
            data,
        })
        .await;
    }

    hub.unregister(client).await;
}

/// Consume the egress queue and keep the peer alive with pings. Exits when
/// the queue closes (hub removed the membership entry) or a write fails.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut egress: EgressReceiver,
    client: Arc<ClientHandle>,
) {
    let start = Instant::now() + PING_PERIOD;
    let mut ping = tokio::time::interval_at(start, PING_PERIOD);

    loop {
        tokio::select! {
            maybe = egress.recv() => {
                let Some(frame) = maybe else {
                    // Queue closed; say goodbye and let the reader wind down.
                    let _ = timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
                    break;
                };
                if write_frames(&mut sink, &mut egress, frame).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if write_with_deadline(&mut sink, Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Closing our half completes the close handshake and unblocks the
    // reader promptly instead of leaving it to the read deadline.
    let _ = timeout(WRITE_WAIT, sink.close()).await;
    debug!(peer = %client.peer_id(), room = %client.room_id, "writer stopped");
}

#[derive(Debug)]
enum WriteError {
    Timeout,
    Transport,
}

async fn write_with_deadline<S>(sink: &mut S, message: Message) -> Result<(), WriteError>
where
    S: Sink<Message> + Unpin,
{
    match timeout(WRITE_WAIT, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(WriteError::Transport),
        Err(_) => Err(WriteError::Timeout),
    }
}

/// Dispatch one dequeued frame plus whatever else is queued, respecting the
/// two egress classes.
async fn write_frames<S>(
    sink: &mut S,
    egress: &mut EgressReceiver,
    first: Bytes,
) -> Result<(), WriteError>
where
    S: Sink<Message> + Unpin,
{
    if !is_voice_frame(&first) {
        return write_data_batch(sink, egress, first).await;
    }

    write_with_deadline(sink, Message::Binary(first)).await?;

    // Keep flushing queued voice immediately for latency; the first data
    // frame switches to the batching path.
    loop {
        match egress.try_recv() {
            Ok(next) if is_voice_frame(&next) => {
                write_with_deadline(sink, Message::Binary(next)).await?;
            }
            Ok(next) => return write_data_batch(sink, egress, next).await,
            Err(_) => return Ok(()),
        }
    }
}

/// Write one data message, folding queued data frames into it with the
/// `0x0A` separator. Queued voice frames are deferred, then sent standalone
/// after the batch is flushed.
async fn write_data_batch<S>(
    sink: &mut S,
    egress: &mut EgressReceiver,
    first: Bytes,
) -> Result<(), WriteError>
where
    S: Sink<Message> + Unpin,
{
    let mut batch = BytesMut::from(first.as_ref());
    let mut deferred_voice: Vec<Bytes> = Vec::new();

    let queued = egress.len();
    for _ in 0..queued {
        match egress.try_recv() {
            Ok(next) if is_voice_frame(&next) => deferred_voice.push(next),
            Ok(next) => {
                batch.extend_from_slice(b"\n");
                batch.extend_from_slice(&next);
            }
            Err(_) => break,
        }
    }

    write_with_deadline(sink, Message::Binary(batch.freeze())).await?;

    for frame in deferred_voice {
        write_with_deadline(sink, Message::Binary(frame)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_is_voice_frame() {
        assert!(is_voice_frame(&[0x4B, 0x56]));
        assert!(is_voice_frame(&[0x4B, 0x56, 0x0A, 0x00, 0xFF]));
        assert!(!is_voice_frame(&[0x4B]));
        assert!(!is_voice_frame(&[]));
        assert!(!is_voice_frame(b"{\"type\":\"chat\"}"));
        assert!(!is_voice_frame(&[0x56, 0x4B, 0x00]));
    }

    #[test]
    fn test_extract_from_field() {
        assert_eq!(
            extract_from_field(br#"{"type":"chat","from":"peer-7"}"#),
            Some("peer-7".to_string())
        );
        assert_eq!(extract_from_field(br#"{"type":"chat"}"#), None);
        assert_eq!(extract_from_field(br#"{"from":""}"#), None);
        assert_eq!(extract_from_field(b"not json"), None);
        assert_eq!(extract_from_field(&[0x4B, 0x56, 0x01]), None);
    }

    /// Collect everything `op` wrote through a test sink.
    async fn written<F, Fut>(op: F) -> Vec<Message>
    where
        F: FnOnce(futures::channel::mpsc::UnboundedSender<Message>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let (sink, collector) = futures::channel::mpsc::unbounded::<Message>();
        op(sink).await;
        collector.collect().await
    }

    #[tokio::test]
    async fn test_data_frames_batch_with_newline() {
        let (tx, mut rx) = mpsc::channel::<Bytes>(16);
        tx.try_send(Bytes::from_static(b"second")).unwrap();
        tx.try_send(Bytes::from_static(b"third")).unwrap();

        let messages = written(|mut sink| async move {
            write_data_batch(&mut sink, &mut rx, Bytes::from_static(b"first"))
                .await
                .unwrap();
        })
        .await;

        assert_eq!(
            messages,
            vec![Message::Binary(Bytes::from_static(b"first\nsecond\nthird"))]
        );
    }

    #[tokio::test]
    async fn test_voice_in_data_drain_is_deferred_not_batched() {
        let voice = Bytes::from_static(&[0x4B, 0x56, 0x0A, 0x00, 0xFF]);
        let (tx, mut rx) = mpsc::channel::<Bytes>(16);
        tx.try_send(Bytes::from_static(b"data-2")).unwrap();
        tx.try_send(voice.clone()).unwrap();
        tx.try_send(Bytes::from_static(b"data-3")).unwrap();

        let messages = written(|mut sink| async move {
            write_data_batch(&mut sink, &mut rx, Bytes::from_static(b"data-1"))
                .await
                .unwrap();
        })
        .await;

        // Data coalesced, voice flushed afterwards as its own message with
        // the embedded 0x0A intact.
        assert_eq!(
            messages,
            vec![
                Message::Binary(Bytes::from_static(b"data-1\ndata-2\ndata-3")),
                Message::Binary(voice),
            ]
        );
    }

    #[tokio::test]
    async fn test_voice_frames_are_never_concatenated() {
        let voice_a = Bytes::from_static(&[0x4B, 0x56, 0x01]);
        let voice_b = Bytes::from_static(&[0x4B, 0x56, 0x02]);
        let (tx, mut rx) = mpsc::channel::<Bytes>(16);
        tx.try_send(voice_b.clone()).unwrap();

        let first = voice_a.clone();
        let messages = written(|mut sink| async move {
            write_frames(&mut sink, &mut rx, first).await.unwrap();
        })
        .await;

        assert_eq!(
            messages,
            vec![Message::Binary(voice_a), Message::Binary(voice_b)]
        );
    }

    #[tokio::test]
    async fn test_voice_then_data_switches_to_batching() {
        let voice = Bytes::from_static(&[0x4B, 0x56, 0x09]);
        let (tx, mut rx) = mpsc::channel::<Bytes>(16);
        tx.try_send(Bytes::from_static(b"data-1")).unwrap();
        tx.try_send(Bytes::from_static(b"data-2")).unwrap();

        let first = voice.clone();
        let messages = written(|mut sink| async move {
            write_frames(&mut sink, &mut rx, first).await.unwrap();
        })
        .await;

        assert_eq!(
            messages,
            vec![
                Message::Binary(voice),
                Message::Binary(Bytes::from_static(b"data-1\ndata-2")),
            ]
        );
    }

    #[tokio::test]
    async fn test_single_data_frame_passes_through_unchanged() {
        let (_tx, mut rx) = mpsc::channel::<Bytes>(16);

        let messages = written(|mut sink| async move {
            write_frames(&mut sink, &mut rx, Bytes::from_static(b"lonely"))
                .await
                .unwrap();
        })
        .await;

        assert_eq!(messages, vec![Message::Binary(Bytes::from_static(b"lonely"))]);
    }

    #[tokio::test]
    async fn test_voice_passthrough_preserves_bytes() {
        // The embedded 0x0A must survive: voice is forwarded as one message,
        // not split or joined at the separator byte.
        let voice = Bytes::from_static(&[0x4B, 0x56, 0x0A, 0x00, 0xFF]);
        let (_tx, mut rx) = mpsc::channel::<Bytes>(16);

        let first = voice.clone();
        let messages = written(|mut sink| async move {
            write_frames(&mut sink, &mut rx, first).await.unwrap();
        })
        .await;

        assert_eq!(messages, vec![Message::Binary(voice)]);
    }
}
