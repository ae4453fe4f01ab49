//! WebSocket sync client for connecting to the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Document binding and update send/receive
//! - Offline queue for updates produced while disconnected
//!
//! Duplicate delivery after a replay is safe: the server's merge is
//! idempotent, so replayed updates can only advance convergence.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::protocol::{MessageKind, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Received an update (incremental or snapshot push) for a document
    RemoteUpdate { doc: String, update: Vec<u8> },
    /// Heartbeat response from the server
    Pong,
}

/// Offline queue for updates produced while disconnected.
///
/// Queued updates are replayed on the next successful connect.
pub struct OfflineQueue {
    queue: VecDeque<QueuedUpdate>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    doc: String,
    payload: Vec<u8>,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update for later replay.
    pub fn enqueue(&mut self, doc: impl Into<String>, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false; // Queue full
        }
        self.queue.push_back(QueuedUpdate {
            doc: doc.into(),
            payload,
        });
        true
    }

    /// Drain all queued updates for replay.
    pub fn drain(&mut self) -> Vec<(String, Vec<u8>)> {
        self.queue.drain(..).map(|q| (q.doc, q.payload)).collect()
    }

    /// Number of queued updates.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Clear all queued updates.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|q| q.payload.len()).sum()
    }
}

/// The sync client.
///
/// Manages a WebSocket connection to the sync server, binds documents,
/// sends updates and surfaces remote updates as [`SyncEvent`]s.
pub struct SyncClient {
    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Documents announced to the server (re-announced on reconnect)
    bound: Arc<RwLock<HashSet<String>>>,

    /// Offline queue for disconnected edits
    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection tasks)
    event_tx: mpsc::Sender<SyncEvent>,

    /// Server URL
    server_url: String,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            bound: Arc::new(RwLock::new(HashSet::new())),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages,
    /// re-announces bound documents and replays the offline queue.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(ok) => ok,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                log::warn!("Connect to {} failed: {e}", self.server_url);
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing frames to the WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx.clone());
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Text(text.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        // Re-announce every bound document so the server restores
        // subscriptions and pushes fresh snapshots.
        for doc in self.bound.read().await.iter() {
            if let Ok(frame) = SyncMessage::bind(doc.clone()).encode() {
                let _ = out_tx.send(frame).await;
            }
        }

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Replay offline queue
        {
            let mut queue = self.offline_queue.lock().await;
            let queued = queue.drain();
            if !queued.is_empty() {
                log::info!("Replaying {} queued updates", queued.len());
                for (doc, payload) in queued {
                    if let Ok(frame) = SyncMessage::sync(doc, &payload).encode() {
                        let _ = out_tx.send(frame).await;
                    }
                }
            }
        }

        // Reader task: surface incoming frames as events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                        let sync_msg = match SyncMessage::decode(text.as_str()) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Undecodable frame from server: {e}");
                                continue;
                            }
                        };
                        let event = match sync_msg.kind {
                            MessageKind::Sync => {
                                match (sync_msg.doc(), sync_msg.update_bytes()) {
                                    (Ok(doc), Ok(Some(update))) => Some(SyncEvent::RemoteUpdate {
                                        doc: doc.to_string(),
                                        update,
                                    }),
                                    _ => None,
                                }
                            }
                            MessageKind::Pong => Some(SyncEvent::Pong),
                            _ => None,
                        };
                        if let Some(evt) = event {
                            let _ = event_tx.send(evt).await;
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Bind a document: announce interest and request a snapshot push.
    ///
    /// When disconnected the binding is recorded and announced on the next
    /// connect.
    pub async fn bind(&self, doc: impl Into<String>) -> Result<(), ProtocolError> {
        let doc = doc.into();
        self.bound.write().await.insert(doc.clone());

        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        let frame = SyncMessage::bind(doc).encode()?;
        self.send_frame(frame).await
    }

    /// Send an update for a document.
    ///
    /// If disconnected, queues the update for replay on reconnect.
    pub async fn send_update(
        &self,
        doc: impl Into<String>,
        update: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        let doc = doc.into();
        self.bound.write().await.insert(doc.clone());

        if *self.state.read().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(doc, update) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }

        let frame = SyncMessage::sync(doc, &update).encode()?;
        self.send_frame(frame).await
    }

    /// Send a heartbeat request.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let frame = SyncMessage::ping().encode()?;
        self.send_frame(frame).await
    }

    async fn send_frame(&self, frame: String) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Documents this client has bound.
    pub async fn bound_documents(&self) -> Vec<String> {
        self.bound.read().await.iter().cloned().collect()
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Get offline queue length.
    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = SyncClient::new("ws://localhost:9090");
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.offline_queue_len().await, 0);
        assert!(client.bound_documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_update_offline_queues() {
        let client = SyncClient::new("ws://localhost:9090");

        // Not connected — updates should be queued
        client.send_update("room1", vec![1, 2, 3]).await.unwrap();
        assert_eq!(client.offline_queue_len().await, 1);

        client.send_update("room1", vec![4, 5, 6]).await.unwrap();
        assert_eq!(client.offline_queue_len().await, 2);

        // The document is remembered for the next connect
        assert_eq!(client.bound_documents().await, vec!["room1".to_string()]);
    }

    #[tokio::test]
    async fn test_bind_offline_recorded() {
        let client = SyncClient::new("ws://localhost:9090");
        client.bind("room1").await.unwrap();
        client.bind("room2").await.unwrap();

        let mut docs = client.bound_documents().await;
        docs.sort();
        assert_eq!(docs, vec!["room1".to_string(), "room2".to_string()]);
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);

        queue.enqueue("room1", vec![1, 2, 3]);
        queue.enqueue("room2", vec![4, 5, 6, 7]);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, "room1");
        assert_eq!(drained[0].1, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(3);

        assert!(queue.enqueue("d", vec![1]));
        assert!(queue.enqueue("d", vec![2]));
        assert!(queue.enqueue("d", vec![3]));
        assert!(!queue.enqueue("d", vec![4])); // Full

        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_offline_queue_clear() {
        let mut queue = OfflineQueue::new(100);
        queue.enqueue("d", vec![1]);
        queue.enqueue("d", vec![2]);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new("ws://localhost:9090");

        // First take should succeed
        assert!(client.take_event_rx().is_some());
        // Second take should return None
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_disconnected() {
        let mut client = SyncClient::new("ws://127.0.0.1:1");
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }
}
