//! Cross-instance broadcast bridge.
//!
//! Wraps the pub/sub broker for the rest of the process:
//!
//! ```text
//! local connection ── publish(doc, update, origin) ──► broker channel "doc"
//!                                                          │
//! remote instance ◄── delivery task ── subscribe("doc") ◄──┘
//!        │
//!        ├── DocumentRegistry::apply_update (remote merge)
//!        └── FanoutTable::fan_out (local sockets bound to "doc")
//! ```
//!
//! Subscriptions are reference-counted per document id: the broker channel is
//! opened when the first local connection binds the document (0→1) and closed
//! when the last one unbinds (→0). The bridge owns exactly one delivery task
//! per document, never one per connection.
//!
//! When a delivery stream ends unexpectedly the task resubscribes with
//! exponential backoff. Local fan-out keeps working while the broker is
//! away; cross-instance convergence resumes after resubscribe and is
//! repaired by snapshot pulls from newly (re)joining peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use uuid::Uuid;

use crate::broker::MessageBroker;
use crate::fanout::{ConnId, FanoutTable};
use crate::protocol::{SyncMessage, UpdateEnvelope};
use crate::registry::DocumentRegistry;

/// First delay after a lost broker subscription.
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(250);
/// Backoff cap.
const RESUBSCRIBE_DELAY_MAX: Duration = Duration::from_secs(30);

/// Bridge statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub active_subscriptions: usize,
}

struct AtomicBridgeStats {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl AtomicBridgeStats {
    fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }
}

/// One reference-counted broker subscription.
struct SubscriptionEntry {
    refcount: usize,
    task: JoinHandle<()>,
}

/// The broadcast bridge.
pub struct BroadcastBridge {
    /// Origin tag for updates published by this process
    process_id: Uuid,
    broker: Arc<dyn MessageBroker>,
    registry: Arc<DocumentRegistry>,
    fanout: Arc<FanoutTable>,
    /// Document id → refcounted subscription; the only caller of broker
    /// subscribe/unsubscribe
    subs: Mutex<HashMap<String, SubscriptionEntry>>,
    stats: Arc<AtomicBridgeStats>,
}

impl BroadcastBridge {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        registry: Arc<DocumentRegistry>,
        fanout: Arc<FanoutTable>,
    ) -> Self {
        Self {
            process_id: Uuid::new_v4(),
            broker,
            registry,
            fanout,
            subs: Mutex::new(HashMap::new()),
            stats: Arc::new(AtomicBridgeStats::new()),
        }
    }

    /// This process's origin tag.
    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    /// Register local interest in `doc`.
    ///
    /// On the 0→1 transition, opens the broker subscription and spawns the
    /// delivery task for the document.
    pub async fn subscribe(&self, doc: &str) {
        let mut subs = self.subs.lock().await;
        if let Some(entry) = subs.get_mut(doc) {
            entry.refcount += 1;
            return;
        }
        let task = self.spawn_delivery(doc.to_string());
        subs.insert(doc.to_string(), SubscriptionEntry { refcount: 1, task });
        log::debug!("Opened broker subscription for {doc:?}");
    }

    /// Drop local interest in `doc`.
    ///
    /// On the last release, stops the delivery task and closes the broker
    /// subscription exactly once.
    pub async fn unsubscribe(&self, doc: &str) {
        let removed = {
            let mut subs = self.subs.lock().await;
            let drained = match subs.get_mut(doc) {
                Some(entry) => {
                    entry.refcount -= 1;
                    entry.refcount == 0
                }
                None => {
                    log::debug!("Unbalanced unsubscribe for {doc:?}");
                    false
                }
            };
            if drained {
                subs.remove(doc)
            } else {
                None
            }
        };

        if let Some(entry) = removed {
            entry.task.abort();
            if let Err(e) = self.broker.unsubscribe(doc).await {
                log::warn!("Broker unsubscribe for {doc:?} failed: {e}");
            }
            log::debug!("Closed broker subscription for {doc:?}");
        }
    }

    /// Fire-and-forget publish of a locally-applied update.
    ///
    /// Failures are logged, never propagated: lost payloads cost convergence
    /// latency, not correctness.
    pub async fn publish(&self, doc: &str, update: &[u8], origin_conn: ConnId) {
        let envelope = UpdateEnvelope::new(self.process_id, origin_conn, update.to_vec());
        let bytes = match envelope.encode() {
            Ok(b) => b,
            Err(e) => {
                log::error!("Failed to encode broker envelope for {doc:?}: {e}");
                return;
            }
        };
        match self.broker.publish(doc, bytes).await {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::warn!("Broker publish for {doc:?} failed: {e}");
            }
        }
    }

    /// Number of open broker subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.subs.lock().await.len()
    }

    /// Current reference count for `doc` (0 when not subscribed).
    pub async fn refcount(&self, doc: &str) -> usize {
        self.subs.lock().await.get(doc).map_or(0, |e| e.refcount)
    }

    /// Bridge statistics (lock-free counters plus subscription count).
    pub async fn stats(&self) -> BridgeStats {
        BridgeStats {
            published: self.stats.published.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            active_subscriptions: self.subs.lock().await.len(),
        }
    }

    /// Spawn the per-document delivery task: subscribe, drain the stream,
    /// resubscribe with exponential backoff when it ends.
    fn spawn_delivery(&self, doc: String) -> JoinHandle<()> {
        let broker = self.broker.clone();
        let registry = self.registry.clone();
        let fanout = self.fanout.clone();
        let stats = self.stats.clone();
        let process_id = self.process_id;

        tokio::spawn(async move {
            let mut delay = RESUBSCRIBE_DELAY;
            loop {
                match broker.subscribe(&doc).await {
                    Ok(mut sub) => {
                        delay = RESUBSCRIBE_DELAY;
                        while let Some(payload) = sub.next().await {
                            Self::deliver(
                                process_id, &registry, &fanout, &stats, &doc, &payload,
                            )
                            .await;
                        }
                        log::warn!("Broker stream for {doc:?} ended, resubscribing");
                    }
                    Err(e) => {
                        log::warn!("Broker subscribe for {doc:?} failed: {e}");
                    }
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RESUBSCRIBE_DELAY_MAX);
            }
        })
    }

    /// Handle one payload delivered by the broker for `doc`.
    async fn deliver(
        process_id: Uuid,
        registry: &DocumentRegistry,
        fanout: &FanoutTable,
        stats: &AtomicBridgeStats,
        doc: &str,
        payload: &[u8],
    ) {
        let envelope = match UpdateEnvelope::decode(payload) {
            Ok(env) => env,
            Err(e) => {
                log::warn!("Dropping undecodable broker payload for {doc:?}: {e}");
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        // Self-echo suppression: updates from this process were already
        // merged and fanned out at publish time.
        if envelope.origin_process == process_id {
            return;
        }

        if !registry.apply_update(doc, &envelope.update).await.is_accepted() {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let frame = match SyncMessage::sync(doc, &envelope.update).encode() {
            Ok(f) => f,
            Err(e) => {
                log::error!("Failed to encode fan-out frame for {doc:?}: {e}");
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        fanout.fan_out(doc, &frame, None).await;
        stats.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use crate::fanout::ConnectionHandle;
    use tokio::sync::{mpsc, Notify};
    use tokio::time::{timeout, Duration};
    use yrs::updates::decoder::Decode;
    use yrs::{GetString, ReadTxn, Text, WriteTxn};

    fn text_update(text: &str) -> Vec<u8> {
        let doc = yrs::Doc::new();
        {
            let mut txn = yrs::Transact::transact_mut(&doc);
            let body = txn.get_or_insert_text("body");
            body.insert(&mut txn, 0, text);
        }
        let txn = yrs::Transact::transact(&doc);
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    }

    fn snapshot_text(snapshot: &[u8]) -> String {
        let doc = yrs::Doc::new();
        {
            let mut txn = yrs::Transact::transact_mut(&doc);
            let update = yrs::Update::decode_v1(snapshot).unwrap();
            txn.apply_update(update).unwrap();
        }
        let txn = yrs::Transact::transact(&doc);
        match txn.get_text("body") {
            Some(body) => body.get_string(&txn),
            None => String::new(),
        }
    }

    struct Instance {
        registry: Arc<DocumentRegistry>,
        fanout: Arc<FanoutTable>,
        bridge: BroadcastBridge,
    }

    fn instance(broker: Arc<LocalBroker>) -> Instance {
        let registry = Arc::new(DocumentRegistry::new());
        let fanout = Arc::new(FanoutTable::new());
        let bridge = BroadcastBridge::new(broker, registry.clone(), fanout.clone());
        Instance {
            registry,
            fanout,
            bridge,
        }
    }

    fn conn_handle() -> (ConnId, ConnectionHandle, mpsc::Receiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(16);
        (id, ConnectionHandle::new(tx, Arc::new(Notify::new())), rx)
    }

    #[tokio::test]
    async fn test_refcounted_subscribe_unsubscribe() {
        let broker = Arc::new(LocalBroker::new());
        let inst = instance(broker.clone());

        // Two local bindings share one broker subscription
        inst.bridge.subscribe("room1").await;
        inst.bridge.subscribe("room1").await;
        assert_eq!(inst.bridge.refcount("room1").await, 2);
        assert_eq!(inst.bridge.subscription_count().await, 1);

        // First release keeps the subscription alive
        inst.bridge.unsubscribe("room1").await;
        assert_eq!(inst.bridge.refcount("room1").await, 1);
        assert_eq!(broker.unsubscribe_count(), 0);

        // Last release closes it exactly once
        inst.bridge.unsubscribe("room1").await;
        assert_eq!(inst.bridge.subscription_count().await, 0);
        assert_eq!(broker.unsubscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_unbalanced_unsubscribe_is_harmless() {
        let broker = Arc::new(LocalBroker::new());
        let inst = instance(broker.clone());

        inst.bridge.unsubscribe("never-bound").await;
        assert_eq!(broker.unsubscribe_count(), 0);
    }

    #[tokio::test]
    async fn test_cross_instance_delivery() {
        let broker = Arc::new(LocalBroker::new());
        let a = instance(broker.clone());
        let b = instance(broker.clone());

        b.bridge.subscribe("room1").await;
        let (conn, handle, mut rx) = conn_handle();
        b.fanout.register("room1", conn, handle).await;
        // Let the delivery task open its broker subscription
        tokio::time::sleep(Duration::from_millis(50)).await;

        let update = text_update("shared");
        a.registry.apply_update("room1", &update).await;
        a.bridge.publish("room1", &update, Uuid::new_v4()).await;

        // B's local socket receives the frame...
        let frame = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame within timeout")
            .unwrap();
        let msg = SyncMessage::decode(&frame).unwrap();
        assert_eq!(msg.doc().unwrap(), "room1");
        assert_eq!(msg.update_bytes().unwrap().unwrap(), update);

        // ...and B's registry merged the update
        assert!(b.registry.contains("room1").await);
        assert_eq!(snapshot_text(&b.registry.snapshot("room1").await), "shared");
    }

    #[tokio::test]
    async fn test_self_echo_suppressed() {
        let broker = Arc::new(LocalBroker::new());
        let a = instance(broker.clone());

        a.bridge.subscribe("room1").await;
        let (conn, handle, mut rx) = conn_handle();
        a.fanout.register("room1", conn, handle).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let update = text_update("mine");
        a.bridge.publish("room1", &update, conn).await;

        // The publishing process never re-delivers its own update
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let broker = Arc::new(LocalBroker::new());
        let a = instance(broker.clone());
        let b = instance(broker.clone());

        b.bridge.subscribe("room1").await;
        let (conn, handle, mut rx) = conn_handle();
        b.fanout.register("room1", conn, handle).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        b.bridge.unsubscribe("room1").await;
        a.bridge.publish("room1", &text_update("late"), Uuid::new_v4()).await;

        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_broker_payload_dropped() {
        let broker = Arc::new(LocalBroker::new());
        let b = instance(broker.clone());

        b.bridge.subscribe("room1").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Raw bytes that are not an UpdateEnvelope
        broker.publish("room1", vec![0xFF, 0xFE]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = b.bridge.stats().await;
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.delivered, 0);
    }
}
