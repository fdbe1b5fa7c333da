use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use relay_core::{ConnectionId, Transport, TransportError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A connected WebSocket client.
pub struct Client {
    pub id: ConnectionId,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
    /// Fires when the registry drops the client, closing its socket tasks.
    closed: CancellationToken,
}

impl Client {
    fn new(id: ConnectionId, tx: mpsc::Sender<String>, closed: CancellationToken) -> Self {
        Self {
            id,
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
            closed,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed) && !self.tx.is_closed()
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.closed.cancel();
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Live WebSocket connections, keyed by the handle issued at connect.
/// Also the in-process [`Transport`]: posting to a handle queues a text frame.
pub struct ClientRegistry {
    clients: DashMap<ConnectionId, Arc<Client>>,
    max_send_queue: usize,
    client_timeout: Duration,
    /// Parent of every client's `closed` token.
    root: CancellationToken,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize, client_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
            client_timeout,
            root: CancellationToken::new(),
        }
    }

    /// Close every client when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: &CancellationToken) -> Self {
        self.root = shutdown.child_token();
        self
    }

    /// Register a client under `id` and return its outbound queue.
    pub fn register(&self, id: ConnectionId) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let client = Arc::new(Client::new(id.clone(), tx, self.root.child_token()));
        let _ = self.clients.insert(id, client);
        rx
    }

    /// Remove a client. Returns whether it was registered.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        match self.clients.remove(id) {
            Some((_, client)) => {
                client.mark_disconnected();
                true
            }
            None => false,
        }
    }

    /// Queue a frame without waiting.
    pub fn try_send(&self, id: &ConnectionId, message: String) -> Result<(), TransportError> {
        let client = self
            .clients
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::Gone(id.clone()))?;
        if !client.is_connected() {
            return Err(TransportError::Gone(id.clone()));
        }

        match client.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    connection_id = %id,
                    msg_len = msg.len(),
                    "send queue full, dropping frame"
                );
                Err(TransportError::Unavailable("send queue full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Gone(id.clone())),
        }
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.clients.contains_key(id)
    }

    /// Token that fires when the client is dropped. `None` once it is gone.
    pub fn closed_token(&self, id: &ConnectionId) -> Option<CancellationToken> {
        self.get(id).map(|client| client.closed.clone())
    }

    fn get(&self, id: &ConnectionId) -> Option<Arc<Client>> {
        self.clients.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop clients that have not answered a ping within the client timeout.
    /// Returns the handles removed so their subscriptions can be cleared.
    pub fn cleanup_dead_clients(&self) -> Vec<ConnectionId> {
        let dead: Vec<ConnectionId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive(self.client_timeout))
            .map(|entry| entry.key().clone())
            .collect();

        for id in &dead {
            if self.unregister(id) {
                tracing::info!(connection_id = %id, "cleaned up dead client");
            }
        }
        dead
    }
}

#[async_trait]
impl Transport for ClientRegistry {
    async fn post_to_connection(
        &self,
        connection_id: &ConnectionId,
        data: Bytes,
    ) -> Result<(), TransportError> {
        let text = String::from_utf8(data.to_vec())
            .map_err(|e| TransportError::Unavailable(format!("frame is not UTF-8: {e}")))?;
        self.try_send(connection_id, text)
    }
}

/// Pump one WebSocket: queued frames and pings out, text frames in.
/// Returns once either side closes, the registry drops the client, or `shutdown` fires.
pub async fn handle_ws_connection(
    socket: WebSocket,
    connection_id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    heartbeat_interval: Duration,
    on_message: mpsc::Sender<(ConnectionId, String)>,
    shutdown: CancellationToken,
) {
    let Some(client) = registry.get(&connection_id) else {
        return;
    };
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_id = connection_id.clone();
    let writer = async move {
        let mut ping_interval = tokio::time::interval(heartbeat_interval);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(text) => {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %writer_id, "sent ping");
                }
            }
        }
        let _ = ws_tx.close().await;
    };

    let reader_client = Arc::clone(&client);
    let reader = async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if on_message
                        .send((reader_client.id.clone(), text.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                WsMessage::Pong(_) => reader_client.record_pong(),
                WsMessage::Close(_) => break,
                // axum answers pings itself
                _ => {}
            }
        }
    };

    tokio::select! {
        () = writer => {},
        () = reader => {},
        () = client.closed.cancelled() => {},
        () = shutdown.cancelled() => {},
    }

    client.mark_disconnected();
}

/// Periodically drop dead clients and hand their handles to `on_dead`.
pub fn start_cleanup_task<F>(
    registry: Arc<ClientRegistry>,
    interval: Duration,
    shutdown: CancellationToken,
    on_dead: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(&ConnectionId) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = registry.cleanup_dead_clients();
                    for id in &removed {
                        on_dead(id);
                    }
                    if !removed.is_empty() {
                        tracing::info!(removed = removed.len(), "dead client cleanup");
                    }
                }
            }
        }
    })
}
