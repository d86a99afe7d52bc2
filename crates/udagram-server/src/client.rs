use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use udagram_core::{ConnectionId, DeliveryError, Transport};

const MIN_HEARTBEAT: Duration = Duration::from_millis(100);
/// Heartbeats a peer may miss before its session is dropped.
const MISSED_PONGS: u32 = 3;

/// Outbound queues of the WebSocket sessions hosted by this process.
///
/// Each live session owns the receiving half of a bounded channel; its writer
/// task drains it onto the socket. The registry only holds senders.
pub struct ClientRegistry {
    clients: DashMap<ConnectionId, mpsc::Sender<String>>,
    max_send_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Allocate a connection id and its outbound queue.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.clients.insert(id.clone(), tx);
        (id, rx)
    }

    /// Drop the sender for `id`. The session's writer sees the channel close.
    pub fn unregister(&self, id: &ConnectionId) {
        self.clients.remove(id);
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.clients.contains_key(id)
    }

    /// Number of sessions hosted locally.
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Drop every sender so all local sessions close. Returns how many there were.
    pub fn close_all(&self) -> usize {
        let closed = self.clients.len();
        self.clients.clear();
        closed
    }
}

#[async_trait]
impl Transport for ClientRegistry {
    async fn send(&self, connection_id: &ConnectionId, payload: &str) -> Result<(), DeliveryError> {
        // Clone the sender so the map shard is not held across the send.
        let tx = match self.clients.get(connection_id) {
            Some(entry) => entry.value().clone(),
            None => return Err(DeliveryError::Gone),
        };
        match tx.try_send(payload.to_owned()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    msg_len = msg.len(),
                    "send queue full, dropping message"
                );
                Err(DeliveryError::Transient("send queue full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Gone),
        }
    }
}

/// First frame of every session, telling the client its connection id.
pub fn connected_frame(connection_id: &ConnectionId) -> String {
    serde_json::json!({
        "type": "connected",
        "connectionId": connection_id,
    })
    .to_string()
}

/// Pong bookkeeping for one session, shared by its reader and writer.
struct Liveness {
    started: Instant,
    last_pong_ms: AtomicU64,
    timeout: Duration,
}

impl Liveness {
    fn new(timeout: Duration) -> Self {
        Self {
            started: Instant::now(),
            last_pong_ms: AtomicU64::new(0),
            timeout,
        }
    }

    fn record_pong(&self) {
        let elapsed = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_pong_ms.store(elapsed, Ordering::Relaxed);
    }

    fn is_alive(&self) -> bool {
        let last = Duration::from_millis(self.last_pong_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last) < self.timeout
    }
}

async fn send_within(
    ws_tx: &mut SplitSink<WebSocket, WsMessage>,
    msg: WsMessage,
    deadline: Duration,
) -> Result<(), &'static str> {
    match tokio::time::timeout(deadline, ws_tx.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err("write failed"),
        Err(_) => Err("write timed out"),
    }
}

/// Drive one WebSocket session until either side stops.
///
/// The writer sends the `connected` frame, then forwards queued payloads and
/// pings every `heartbeat`. The session ends when a write fails or stalls for
/// a full heartbeat, when no pong arrives for `MISSED_PONGS` heartbeats, or
/// when the peer sends a close frame. Inbound text is ignored.
pub async fn run_session(
    socket: WebSocket,
    connection_id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    heartbeat: Duration,
) {
    let heartbeat = heartbeat.max(MIN_HEARTBEAT);
    let liveness = Arc::new(Liveness::new(heartbeat * MISSED_PONGS));
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = connection_id.clone();
    let writer_liveness = Arc::clone(&liveness);
    let mut writer = tokio::spawn(async move {
        let hello = WsMessage::Text(connected_frame(&writer_cid).into());
        if let Err(reason) = send_within(&mut ws_tx, hello, heartbeat).await {
            tracing::debug!(connection_id = %writer_cid, reason, "connected frame not sent");
            return;
        }

        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else { break };
                    if let Err(reason) = send_within(&mut ws_tx, WsMessage::Text(text.into()), heartbeat).await {
                        tracing::debug!(connection_id = %writer_cid, reason, "dropping session");
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if !writer_liveness.is_alive() {
                        tracing::info!(connection_id = %writer_cid, "no pong from client, dropping session");
                        break;
                    }
                    if let Err(reason) = send_within(&mut ws_tx, WsMessage::Ping(Vec::new().into()), heartbeat).await {
                        tracing::debug!(connection_id = %writer_cid, reason, "ping failed");
                        break;
                    }
                    tracing::trace!(connection_id = %writer_cid, "sent ping");
                }
            }
        }
        let _ = tokio::time::timeout(heartbeat, ws_tx.close()).await;
    });

    let reader_cid = connection_id.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Close(_) => break,
                WsMessage::Pong(_) => liveness.record_pong(),
                WsMessage::Text(text) => {
                    tracing::trace!(connection_id = %reader_cid, len = text.as_str().len(), "ignoring inbound text");
                }
                // axum answers pings itself
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let registry = ClientRegistry::new(32);
        assert_eq!(registry.count(), 0);

        let (id1, _rx1) = registry.register();
        let (id2, _rx2) = registry.register();
        assert_ne!(id1, id2);
        assert_eq!(registry.count(), 2);
        assert!(registry.contains(&id1));

        registry.unregister(&id1);
        assert_eq!(registry.count(), 1);
        assert!(!registry.contains(&id1));

        registry.unregister(&id2);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn send_to_live_connection() {
        let registry = ClientRegistry::new(32);
        let (id, mut rx) = registry.register();

        registry.send(&id, "hello").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn unknown_connection_is_gone() {
        let registry = ClientRegistry::new(32);
        let err = registry
            .send(&ConnectionId::from_raw("conn_elsewhere"), "x")
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::Gone);
    }

    #[tokio::test]
    async fn closed_receiver_is_gone() {
        let registry = ClientRegistry::new(32);
        let (id, rx) = registry.register();
        drop(rx);

        let err = registry.send(&id, "x").await.unwrap_err();
        assert!(err.is_stale());
    }

    #[tokio::test]
    async fn full_queue_is_transient() {
        let registry = ClientRegistry::new(2);
        let (id, _rx) = registry.register();

        registry.send(&id, "msg1").await.unwrap();
        registry.send(&id, "msg2").await.unwrap();

        let err = registry.send(&id, "msg3").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transient(_)));
        assert!(registry.contains(&id));
    }

    #[tokio::test]
    async fn unregistered_connection_is_gone() {
        let registry = ClientRegistry::new(4);
        let (id, _rx) = registry.register();
        registry.unregister(&id);
        assert_eq!(registry.send(&id, "x").await, Err(DeliveryError::Gone));
    }

    #[test]
    fn close_all_drops_every_sender() {
        let registry = ClientRegistry::new(4);
        let (_id1, mut rx1) = registry.register();
        let (_id2, _rx2) = registry.register();

        assert_eq!(registry.close_all(), 2);
        assert_eq!(registry.count(), 0);
        assert!(rx1.try_recv().is_err());
        assert!(rx1.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_expires_without_pongs() {
        let liveness = Liveness::new(Duration::from_millis(300));
        assert!(liveness.is_alive());

        tokio::time::advance(Duration::from_millis(200)).await;
        liveness.record_pong();
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(liveness.is_alive());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!liveness.is_alive());
    }

    #[test]
    fn connected_frame_shape() {
        let id = ConnectionId::from_raw("conn_abc");
        let frame: serde_json::Value = serde_json::from_str(&connected_frame(&id)).unwrap();
        assert_eq!(frame["type"], "connected");
        assert_eq!(frame["connectionId"], "conn_abc");
    }
}
