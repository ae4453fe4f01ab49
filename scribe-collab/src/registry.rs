//! In-memory document state registry.
//!
//! One [`DocumentState`] per document id per process, created lazily on the
//! first local bind or the first remote delivery. Every merge for a document
//! goes through that document's own lock, so state transitions are totally
//! ordered per document while different documents never contend.
//!
//! Documents are kept in memory indefinitely; there is no eviction policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use yrs::updates::decoder::Decode;
use yrs::ReadTxn;

/// Result of applying an update to a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Update merged into the document state; carries the delta the merge
    /// actually contributed (empty-ish when the update was already known)
    Accepted { snapshot_delta: Vec<u8> },
    /// Update bytes could not be decoded or merged; state untouched
    Rejected,
}

impl UpdateOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, UpdateOutcome::Accepted { .. })
    }
}

/// Merged state for a single document.
///
/// Wraps the merge engine behind a per-document mutex: [`apply`] and
/// [`snapshot`] are atomic relative to each other on the same document.
///
/// [`apply`]: DocumentState::apply
/// [`snapshot`]: DocumentState::snapshot
pub struct DocumentState {
    doc: Mutex<yrs::Doc>,
}

impl DocumentState {
    fn new() -> Self {
        Self {
            doc: Mutex::new(yrs::Doc::new()),
        }
    }

    /// Merge one incremental update into this document.
    ///
    /// Malformed bytes are rejected without touching the existing state.
    pub async fn apply(&self, update_bytes: &[u8]) -> UpdateOutcome {
        let update = match yrs::Update::decode_v1(update_bytes) {
            Ok(u) => u,
            Err(e) => {
                log::debug!("Rejecting undecodable update ({} bytes): {e}", update_bytes.len());
                return UpdateOutcome::Rejected;
            }
        };

        let doc = self.doc.lock().unwrap();
        let mut txn = yrs::Transact::transact_mut(&*doc);
        let before = txn.state_vector();
        match txn.apply_update(update) {
            Ok(()) => UpdateOutcome::Accepted {
                snapshot_delta: txn.encode_diff_v1(&before),
            },
            Err(e) => {
                log::warn!("Merge engine rejected update: {e}");
                UpdateOutcome::Rejected
            }
        }
    }

    /// Full merged state encoded as a single update.
    ///
    /// Used to fast-forward newly joined or reconnecting peers.
    pub async fn snapshot(&self) -> Vec<u8> {
        let doc = self.doc.lock().unwrap();
        let txn = yrs::Transact::transact(&*doc);
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    }
}

/// Registry of live document states.
///
/// The map itself is guarded by a read/write lock; merges run under the
/// per-document lock only, never under the map lock.
pub struct DocumentRegistry {
    docs: RwLock<HashMap<String, Arc<DocumentState>>>,
    rejected: AtomicU64,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            rejected: AtomicU64::new(0),
        }
    }

    /// Get the state for `doc_id`, creating an empty one on first reference.
    ///
    /// Idempotent under concurrent first access: the write path re-checks the
    /// map before inserting.
    pub async fn get_or_create(&self, doc_id: &str) -> Arc<DocumentState> {
        // Fast path: read lock
        {
            let docs = self.docs.read().await;
            if let Some(state) = docs.get(doc_id) {
                return state.clone();
            }
        }

        // Slow path: write lock to create
        let mut docs = self.docs.write().await;
        // Double-check after acquiring write lock
        if let Some(state) = docs.get(doc_id) {
            return state.clone();
        }

        let state = Arc::new(DocumentState::new());
        docs.insert(doc_id.to_string(), state.clone());
        log::debug!("Created document state for {doc_id:?}");
        state
    }

    /// Merge an update into `doc_id`, creating the document if needed.
    pub async fn apply_update(&self, doc_id: &str, update_bytes: &[u8]) -> UpdateOutcome {
        let state = self.get_or_create(doc_id).await;
        let outcome = state.apply(update_bytes).await;
        if !outcome.is_accepted() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Current merged state of `doc_id`, creating the document if needed.
    pub async fn snapshot(&self, doc_id: &str) -> Vec<u8> {
        self.get_or_create(doc_id).await.snapshot().await
    }

    /// Whether a state exists for `doc_id`.
    pub async fn contains(&self, doc_id: &str) -> bool {
        self.docs.read().await.contains_key(doc_id)
    }

    /// Number of live document states.
    pub async fn doc_count(&self) -> usize {
        self.docs.read().await.len()
    }

    /// Number of updates rejected so far.
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl Default for DocumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    /// Encode a standalone update that inserts `text` into field "body".
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

    /// Read field "body" out of an encoded snapshot.
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

    #[tokio::test]
    async fn test_get_or_create_idempotent() {
        let registry = DocumentRegistry::new();

        let a = registry.get_or_create("room1").await;
        let b = registry.get_or_create("room1").await;

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.doc_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_access_single_instance() {
        let registry = Arc::new(DocumentRegistry::new());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let reg = registry.clone();
            handles.push(tokio::spawn(async move { reg.get_or_create("room1").await }));
        }

        let mut states = Vec::new();
        for h in handles {
            states.push(h.await.unwrap());
        }
        for s in &states {
            assert!(Arc::ptr_eq(s, &states[0]));
        }
        assert_eq!(registry.doc_count().await, 1);
    }

    #[tokio::test]
    async fn test_apply_and_snapshot() {
        let registry = DocumentRegistry::new();

        let outcome = registry.apply_update("room1", &text_update("hello")).await;
        assert!(outcome.is_accepted());

        let snapshot = registry.snapshot("room1").await;
        assert_eq!(snapshot_text(&snapshot), "hello");
    }

    #[tokio::test]
    async fn test_accepted_outcome_carries_applied_delta() {
        let registry = DocumentRegistry::new();

        let outcome = registry.apply_update("room1", &text_update("delta")).await;
        let UpdateOutcome::Accepted { snapshot_delta } = outcome else {
            panic!("expected acceptance");
        };

        // The reported delta is itself a valid update reproducing the change
        assert_eq!(snapshot_text(&snapshot_delta), "delta");
    }

    #[tokio::test]
    async fn test_malformed_update_rejected_state_untouched() {
        let registry = DocumentRegistry::new();
        registry.apply_update("room1", &text_update("keep")).await;

        let outcome = registry.apply_update("room1", &[0xFF, 0x00, 0xAB]).await;
        assert_eq!(outcome, UpdateOutcome::Rejected);
        assert_eq!(registry.rejected_count(), 1);

        // Existing state is intact
        let snapshot = registry.snapshot("room1").await;
        assert_eq!(snapshot_text(&snapshot), "keep");
    }

    #[tokio::test]
    async fn test_idempotent_merge() {
        let registry = DocumentRegistry::new();
        let update = text_update("once");

        registry.apply_update("room1", &update).await;
        let first = registry.snapshot("room1").await;

        registry.apply_update("room1", &update).await;
        let second = registry.snapshot("room1").await;

        assert_eq!(snapshot_text(&first), snapshot_text(&second));
        assert_eq!(snapshot_text(&second), "once");
    }

    #[tokio::test]
    async fn test_convergence_across_replicas() {
        // Two independent registries receiving the same updates in opposite
        // order must converge to the same merged text.
        let u1 = text_update("alpha ");
        let u2 = text_update("beta ");

        let replica1 = DocumentRegistry::new();
        replica1.apply_update("room1", &u1).await;
        replica1.apply_update("room1", &u2).await;

        let replica2 = DocumentRegistry::new();
        replica2.apply_update("room1", &u2).await;
        replica2.apply_update("room1", &u1).await;

        let s1 = snapshot_text(&replica1.snapshot("room1").await);
        let s2 = snapshot_text(&replica2.snapshot("room1").await);
        assert_eq!(s1, s2);
    }

    #[tokio::test]
    async fn test_documents_are_independent() {
        let registry = DocumentRegistry::new();

        registry.apply_update("room1", &text_update("one")).await;
        registry.apply_update("room2", &text_update("two")).await;

        assert_eq!(snapshot_text(&registry.snapshot("room1").await), "one");
        assert_eq!(snapshot_text(&registry.snapshot("room2").await), "two");
        assert_eq!(registry.doc_count().await, 2);
    }

    #[tokio::test]
    async fn test_snapshot_of_fresh_document_is_empty() {
        let registry = DocumentRegistry::new();
        let snapshot = registry.snapshot("room1").await;
        assert_eq!(snapshot_text(&snapshot), "");
        assert!(registry.contains("room1").await);
    }
}
