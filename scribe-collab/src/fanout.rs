//! Local fan-out: document id → connections bound to it in this process.
//!
//! Each connection registers a bounded outbound queue per bound document.
//! Fan-out try-sends and never waits: a connection whose queue is full is
//! evicted — removed from every document row and told to shut down — instead
//! of growing its send queue without bound.
//!
//! Stats are tracked via atomics so [`FanoutTable::fan_out`] stays lock-free
//! outside the row lookup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

/// Per-process connection identifier.
pub type ConnId = Uuid;

/// Send-side handle for one connection's outbound queue.
///
/// `shutdown` is the eviction signal: the connection task selects on it and
/// runs its normal close path when notified.
#[derive(Clone)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<String>,
    shutdown: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<String>, shutdown: Arc<Notify>) -> Self {
        Self { sender, shutdown }
    }
}

/// Outcome of one fan-out call.
#[derive(Debug, Default)]
pub struct FanoutReport {
    /// Connections the frame was queued for
    pub delivered: usize,
    /// Connections evicted because their queue was full or closed
    pub evicted: Vec<ConnId>,
}

/// Fan-out statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct FanoutStats {
    pub frames_queued: u64,
    pub evictions: u64,
}

/// Document id → {connection id → outbound handle}.
pub struct FanoutTable {
    docs: RwLock<HashMap<String, HashMap<ConnId, ConnectionHandle>>>,
    frames_queued: AtomicU64,
    evictions: AtomicU64,
}

impl FanoutTable {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            frames_queued: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Register `conn` as bound to `doc`.
    pub async fn register(&self, doc: &str, conn: ConnId, handle: ConnectionHandle) {
        let mut docs = self.docs.write().await;
        docs.entry(doc.to_string()).or_default().insert(conn, handle);
    }

    /// Remove `conn` from `doc`. Empty rows are dropped.
    pub async fn deregister(&self, doc: &str, conn: ConnId) -> bool {
        let mut docs = self.docs.write().await;
        let Some(row) = docs.get_mut(doc) else {
            return false;
        };
        let removed = row.remove(&conn).is_some();
        if row.is_empty() {
            docs.remove(doc);
        }
        removed
    }

    /// Remove `conn` from every document row and signal it to shut down.
    pub async fn evict(&self, conn: ConnId) {
        let mut docs = self.docs.write().await;
        let mut shutdown: Option<Arc<Notify>> = None;
        docs.retain(|_, row| {
            if let Some(handle) = row.remove(&conn) {
                shutdown = Some(handle.shutdown);
            }
            !row.is_empty()
        });
        drop(docs);

        if let Some(notify) = shutdown {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            notify.notify_one();
        }
    }

    /// Queue `frame` for every connection bound to `doc` except `exclude`.
    ///
    /// Connections whose queue is full (or already closed) are evicted.
    pub async fn fan_out(&self, doc: &str, frame: &str, exclude: Option<ConnId>) -> FanoutReport {
        let targets: Vec<(ConnId, ConnectionHandle)> = {
            let docs = self.docs.read().await;
            match docs.get(doc) {
                Some(row) => row
                    .iter()
                    .filter(|(id, _)| Some(**id) != exclude)
                    .map(|(id, h)| (*id, h.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut report = FanoutReport::default();
        for (conn, handle) in targets {
            match handle.sender.try_send(frame.to_string()) {
                Ok(()) => {
                    report.delivered += 1;
                    self.frames_queued.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    log::warn!("Connection {conn} cannot keep up with fan-out, evicting");
                    report.evicted.push(conn);
                }
                Err(TrySendError::Closed(_)) => {
                    log::debug!("Connection {conn} outbound queue closed, evicting");
                    report.evicted.push(conn);
                }
            }
        }

        for conn in &report.evicted {
            self.evict(*conn).await;
        }
        report
    }

    /// Number of connections bound to `doc`.
    pub async fn members(&self, doc: &str) -> usize {
        self.docs.read().await.get(doc).map_or(0, HashMap::len)
    }

    /// Number of documents with at least one bound connection.
    pub async fn doc_count(&self) -> usize {
        self.docs.read().await.len()
    }

    /// Fan-out statistics (lock-free snapshot).
    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            frames_queued: self.frames_queued.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for FanoutTable {
    fn default() -> Self {
        Self::new()
    }
}
