//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!            ├── connection task ── DocumentRegistry (merge)
//! Client B ──┘        │                    │
//!                     │                    ▼
//!                     │             BroadcastBridge ── broker ── other instances
//!                     │                    │
//!                     └────────── FanoutTable (local peers) ◄──┘
//! ```
//!
//! One task per socket runs the connection state machine: OPEN with no
//! bindings, BOUND once the first sync message names a document, CLOSED on
//! socket close or eviction. Each message is processed against the document
//! it names, so one socket can be a member of many documents at once.
//!
//! A document is bound the first time it appears on a message: the
//! connection registers for local fan-out, takes a reference on the broker
//! subscription, and is pushed the current snapshot so it converges without
//! waiting for the next incremental update.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::bridge::BroadcastBridge;
use crate::broker::{LocalBroker, MessageBroker};
use crate::fanout::{ConnId, ConnectionHandle, FanoutTable};
use crate::protocol::{MessageKind, SyncMessage};
use crate::registry::DocumentRegistry;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frames buffered per connection before it counts as stalled
    pub send_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            send_queue_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub protocol_errors: u64,
    pub rejected_updates: u64,
    pub evicted_connections: u64,
    pub active_documents: usize,
}

/// Atomic server stats — lock-free on the hot path.
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    protocol_errors: AtomicU64,
    rejected_updates: AtomicU64,
    evicted_connections: AtomicU64,
}

impl AtomicServerStats {
    fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            rejected_updates: AtomicU64::new(0),
            evicted_connections: AtomicU64::new(0),
        }
    }

    fn snapshot(&self, active_documents: usize) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            rejected_updates: self.rejected_updates.load(Ordering::Relaxed),
            evicted_connections: self.evicted_connections.load(Ordering::Relaxed),
            active_documents,
        }
    }
}

type WsSink =
    futures_util::stream::SplitSink<tokio_tungstenite::WebSocketStream<TcpStream>, Message>;

/// Outcome of one socket write.
enum SendOutcome {
    Sent,
    /// The socket is gone
    Closed,
    /// Fan-out evicted this connection while the write was blocked
    Evicted,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
    fanout: Arc<FanoutTable>,
    bridge: Arc<BroadcastBridge>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Create a new sync server on top of the given broker.
    pub fn new(config: ServerConfig, broker: Arc<dyn MessageBroker>) -> Self {
        let registry = Arc::new(DocumentRegistry::new());
        let fanout = Arc::new(FanoutTable::new());
        let bridge = Arc::new(BroadcastBridge::new(
            broker,
            registry.clone(),
            fanout.clone(),
        ));
        Self {
            config,
            registry,
            fanout,
            bridge,
            stats: Arc::new(AtomicServerStats::new()),
        }
    }

    /// Create with default configuration and an in-process broker.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), Arc::new(LocalBroker::new()))
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let fanout = self.fanout.clone();
            let bridge = self.bridge.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, fanout, bridge, stats, config)
                        .await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<DocumentRegistry>,
        fanout: Arc<FanoutTable>,
        bridge: Arc<BroadcastBridge>,
        stats: Arc<AtomicServerStats>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let conn_id: ConnId = Uuid::new_v4();
        log::info!("WebSocket connection {conn_id} established from {addr}");

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        // Outbound queue fed by sibling connections and the bridge; the
        // shutdown signal fires when fan-out evicts this connection.
        let (out_tx, mut out_rx) = mpsc::channel::<String>(config.send_queue_capacity);
        let shutdown = Arc::new(Notify::new());
        let handle = ConnectionHandle::new(out_tx, shutdown.clone());

        // Documents this socket is currently bound to
        let mut bound: HashSet<String> = HashSet::new();
        let mut evicted = false;

        'conn: loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            stats.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);

                            let replies = Self::process_frame(
                                text.as_str(), conn_id, &handle, &mut bound,
                                &registry, &fanout, &bridge, &stats,
                            ).await;

                            for reply in replies {
                                match Self::send_frame(
                                    &mut ws_sender, &shutdown, Message::Text(reply.into()),
                                ).await {
                                    SendOutcome::Sent => {}
                                    SendOutcome::Closed => break 'conn,
                                    SendOutcome::Evicted => {
                                        evicted = true;
                                        break 'conn;
                                    }
                                }
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            // Wire format is JSON text only
                            stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                            log::debug!("Ignoring binary frame from {conn_id}");
                        }

                        Some(Ok(Message::Ping(data))) => {
                            match Self::send_frame(
                                &mut ws_sender, &shutdown, Message::Pong(data),
                            ).await {
                                SendOutcome::Sent => {}
                                SendOutcome::Closed => break 'conn,
                                SendOutcome::Evicted => {
                                    evicted = true;
                                    break 'conn;
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {conn_id} closed by peer");
                            break 'conn;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error on {conn_id}: {e}");
                            break 'conn;
                        }

                        _ => {}
                    }
                }

                // Frame fanned out by a sibling connection or the bridge
                frame = out_rx.recv() => {
                    match frame {
                        Some(text) => {
                            match Self::send_frame(
                                &mut ws_sender, &shutdown, Message::Text(text.into()),
                            ).await {
                                SendOutcome::Sent => {}
                                SendOutcome::Closed => break 'conn,
                                SendOutcome::Evicted => {
                                    evicted = true;
                                    break 'conn;
                                }
                            }
                        }
                        None => break 'conn,
                    }
                }

                // Evicted for not draining its queue
                _ = shutdown.notified() => {
                    evicted = true;
                    break 'conn;
                }
            }
        }

        if evicted {
            log::warn!("Connection {conn_id} evicted as a slow consumer");
            stats.evicted_connections.fetch_add(1, Ordering::Relaxed);
        }

        // Cleanup: release every binding this connection held
        for doc in &bound {
            fanout.deregister(doc, conn_id).await;
            bridge.unsubscribe(doc).await;
        }
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection {conn_id} from {addr} released ({} bindings)", bound.len());

        Ok(())
    }

    /// Write one frame, racing the write against the eviction signal so a
    /// stalled socket cannot wedge the connection task.
    async fn send_frame(ws_sender: &mut WsSink, shutdown: &Notify, msg: Message) -> SendOutcome {
        tokio::select! {
            result = ws_sender.send(msg) => {
                if result.is_ok() {
                    SendOutcome::Sent
                } else {
                    SendOutcome::Closed
                }
            }
            _ = shutdown.notified() => SendOutcome::Evicted,
        }
    }

    /// Process one text frame; returns replies for the caller to send.
    ///
    /// Malformed frames are dropped and the connection stays open in its
    /// current state.
    #[allow(clippy::too_many_arguments)]
    async fn process_frame(
        text: &str,
        conn_id: ConnId,
        handle: &ConnectionHandle,
        bound: &mut HashSet<String>,
        registry: &DocumentRegistry,
        fanout: &FanoutTable,
        bridge: &BroadcastBridge,
        stats: &AtomicServerStats,
    ) -> Vec<String> {
        let msg = match SyncMessage::decode(text) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Protocol error on {conn_id}: {e}");
                stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                return Vec::new();
            }
        };

        match msg.kind {
            MessageKind::Sync => {
                let doc = match msg.doc() {
                    Ok(d) => d.to_string(),
                    Err(e) => {
                        log::warn!("Protocol error on {conn_id}: {e}");
                        stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                        return Vec::new();
                    }
                };
                let update = match msg.update_bytes() {
                    Ok(u) => u,
                    Err(e) => {
                        log::warn!("Rejecting update on {conn_id}: {e}");
                        stats.rejected_updates.fetch_add(1, Ordering::Relaxed);
                        return Vec::new();
                    }
                };

                let fresh = bound.insert(doc.clone());
                if fresh {
                    fanout.register(&doc, conn_id, handle.clone()).await;
                    bridge.subscribe(&doc).await;
                    log::debug!("Connection {conn_id} bound {doc:?}");
                }

                if let Some(bytes) = update {
                    if registry.apply_update(&doc, &bytes).await.is_accepted() {
                        bridge.publish(&doc, &bytes, conn_id).await;
                        // Verbatim forward: duplicates are safe under the
                        // idempotent merge, so the original frame is reused.
                        fanout.fan_out(&doc, text, Some(conn_id)).await;
                    } else {
                        stats.rejected_updates.fetch_add(1, Ordering::Relaxed);
                    }
                }

                if fresh {
                    let snapshot = registry.snapshot(&doc).await;
                    match SyncMessage::sync(&doc, &snapshot).encode() {
                        Ok(reply) => return vec![reply],
                        Err(e) => log::error!("Failed to encode snapshot for {doc:?}: {e}"),
                    }
                }
                Vec::new()
            }

            MessageKind::Ping => match SyncMessage::pong().encode() {
                Ok(reply) => vec![reply],
                Err(_) => Vec::new(),
            },

            MessageKind::Pong | MessageKind::Unknown => {
                log::debug!("Ignoring {:?} message on {conn_id}", msg.kind);
                Vec::new()
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.snapshot(self.registry.doc_count().await)
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the document registry.
    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    /// Get the broadcast bridge.
    pub fn bridge(&self) -> &Arc<BroadcastBridge> {
        &self.bridge
    }
}
