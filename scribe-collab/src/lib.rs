//! # scribe-collab — Real-time document synchronization core for Scribe
//!
//! Keeps editing clients, possibly attached to different server instances,
//! converged on shared document state using conflict-free merge semantics.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄────────────────► │  SyncServer  │
//! │ (per user)  │     JSON frames    │ (per node)   │
//! └─────────────┘                    └──────┬───────┘
//!                                           │
//!                          ┌────────────────┼──────────────────┐
//!                          ▼                ▼                  ▼
//!                 ┌────────────────┐ ┌─────────────┐ ┌─────────────────┐
//!                 │ DocumentRegistry│ │ FanoutTable │ │ BroadcastBridge │
//!                 │ (Yrs merge)    │ │ (local peers)│ │ (pub/sub broker)│
//!                 └────────────────┘ └─────────────┘ └────────┬────────┘
//!                                                             │
//!                                                   other server instances
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol and the broker envelope
//! - [`registry`] — per-document merged state with per-document locking
//! - [`fanout`] — local fan-out with bounded queues and slow-consumer eviction
//! - [`broker`] — generic pub/sub broker trait + in-process implementation
//! - [`bridge`] — reference-counted cross-instance broadcast bridge
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client with offline queue
//!
//! Convergence rests on the merge engine's CRDT laws: merging any set of
//! updates, in any order, any number of times, reaches the same state. Lost
//! or duplicated frames therefore cost latency, never correctness.

pub mod protocol;
pub mod registry;
pub mod fanout;
pub mod broker;
pub mod bridge;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{MessageKind, ProtocolError, SyncMessage, UpdateEnvelope};
pub use registry::{DocumentRegistry, DocumentState, UpdateOutcome};
pub use fanout::{ConnId, ConnectionHandle, FanoutReport, FanoutStats, FanoutTable};
pub use broker::{BrokerError, BrokerSubscription, LocalBroker, MessageBroker};
pub use bridge::{BridgeStats, BroadcastBridge};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
