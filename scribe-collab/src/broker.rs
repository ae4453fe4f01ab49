//! Generic pub/sub broker interface and the in-process implementation.
//!
//! The sync core consumes a broker through [`MessageBroker`]: named channels,
//! fire-and-forget publish, one payload stream per subscription. Any product
//! that offers publish/subscribe per channel can sit behind this trait;
//! [`LocalBroker`] is the in-process implementation used by tests and
//! single-instance deployments.
//!
//! Delivery is best-effort. Lost payloads degrade convergence latency only,
//! because merges are idempotent and peers can pull a full snapshot when they
//! (re)join.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc, Mutex};

/// Buffered payloads per channel before a slow local subscriber lags.
const CHANNEL_CAPACITY: usize = 256;

/// Broker errors.
#[derive(Debug, Clone)]
pub enum BrokerError {
    PublishFailed(String),
    SubscribeFailed(String),
    /// The broker connection is gone; the caller may retry
    Disconnected(String),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PublishFailed(e) => write!(f, "Publish failed: {e}"),
            Self::SubscribeFailed(e) => write!(f, "Subscribe failed: {e}"),
            Self::Disconnected(e) => write!(f, "Broker disconnected: {e}"),
        }
    }
}

impl std::error::Error for BrokerError {}

/// One live subscription to a broker channel.
///
/// Yields payloads in the order the broker delivers them. `None` means the
/// stream ended — the subscription was closed or the broker connection was
/// lost — and the holder decides whether to resubscribe.
pub struct BrokerSubscription {
    receiver: mpsc::Receiver<Vec<u8>>,
}

impl BrokerSubscription {
    pub fn new(receiver: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { receiver }
    }

    /// Next payload on this channel, or `None` when the stream ends.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }
}

/// A named-channel pub/sub broker.
#[async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    /// Fire-and-forget send to `channel`.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Open a subscription to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<BrokerSubscription, BrokerError>;

    /// Close this process's subscription to `channel`.
    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError>;
}

/// In-process broker backed by one tokio broadcast channel per name.
///
/// Shared (via `Arc`) between server instances in the same process it gives
/// the same channel semantics a networked broker would: per-channel publish
/// order, no cross-channel order, best-effort delivery.
pub struct LocalBroker {
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    published: AtomicU64,
    subscribes: AtomicU64,
    unsubscribes: AtomicU64,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            published: AtomicU64::new(0),
            subscribes: AtomicU64::new(0),
            unsubscribes: AtomicU64::new(0),
        }
    }

    async fn sender_for(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn subscribe_count(&self) -> u64 {
        self.subscribes.load(Ordering::Relaxed)
    }

    pub fn unsubscribe_count(&self) -> u64 {
        self.unsubscribes.load(Ordering::Relaxed)
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for LocalBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let sender = self.sender_for(channel).await;
        // No receivers is not an error: fire-and-forget
        let _ = sender.send(payload);
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BrokerSubscription, BrokerError> {
        let mut source = self.sender_for(channel).await.subscribe();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let name = channel.to_string();

        // Forward until the subscription handle is dropped or the channel
        // sender goes away.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = source.recv() => match msg {
                        Ok(payload) => {
                            if tx.send(payload).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Local broker channel {name:?} lagged by {n} payloads");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tx.closed() => break,
                }
            }
        });

        self.subscribes.fetch_add(1, Ordering::Relaxed);
        Ok(BrokerSubscription::new(rx))
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        self.unsubscribes.fetch_add(1, Ordering::Relaxed);
        let mut channels = self.channels.lock().await;
        let stale = channels
            .get(channel)
            .map_or(false, |s| s.receiver_count() == 0);
        if stale {
            channels.remove(channel);
        }
        Ok(())
    }
}
