//! Wire protocol for document synchronization.
//!
//! Client-facing format (both directions) is a single JSON object:
//! ```text
//! { "type": "sync", "doc": "<document id>", "update": "<base64 bytes>" }
//! ```
//! Unknown fields are ignored; unknown `type` values decode to
//! [`MessageKind::Unknown`] and are dropped by the handler. A snapshot push
//! uses the same shape with `update` set to the full merged state.
//!
//! Broker-facing format is a bincode-encoded [`UpdateEnvelope`] carrying the
//! raw update bytes plus an origin tag for self-echo suppression.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types understood by the sync endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Bind to a document and/or carry an incremental update
    Sync,
    /// Application-level heartbeat request
    Ping,
    /// Application-level heartbeat response
    Pong,
    /// Anything else — ignored, connection stays open
    #[serde(other)]
    Unknown,
}

/// Top-level protocol message.
///
/// `doc` and `update` are optional on the wire; the handler validates their
/// presence per message kind. `update` is base64 so the payload survives
/// JSON transport untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<String>,
}

impl SyncMessage {
    /// Create a sync message carrying an update for `doc`.
    pub fn sync(doc: impl Into<String>, update: &[u8]) -> Self {
        Self {
            kind: MessageKind::Sync,
            doc: Some(doc.into()),
            update: Some(BASE64.encode(update)),
        }
    }

    /// Create a bind-only sync message (no update payload).
    pub fn bind(doc: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Sync,
            doc: Some(doc.into()),
            update: None,
        }
    }

    /// Create a heartbeat request.
    pub fn ping() -> Self {
        Self {
            kind: MessageKind::Ping,
            doc: None,
            update: None,
        }
    }

    /// Create a heartbeat response.
    pub fn pong() -> Self {
        Self {
            kind: MessageKind::Pong,
            doc: None,
            update: None,
        }
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the JSON wire format.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// The document id this message names, or an error if the field is absent.
    pub fn doc(&self) -> Result<&str, ProtocolError> {
        match self.doc.as_deref() {
            Some(d) if !d.is_empty() => Ok(d),
            _ => Err(ProtocolError::MissingDocument),
        }
    }

    /// Decode the base64 `update` field, if present.
    pub fn update_bytes(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        match self.update.as_deref() {
            None => Ok(None),
            Some(b64) => BASE64
                .decode(b64)
                .map(Some)
                .map_err(|e| ProtocolError::InvalidUpdate(e.to_string())),
        }
    }
}

/// Update as it travels through the pub/sub broker.
///
/// The origin tag identifies the process and connection that produced the
/// update so a delivering bridge can suppress the immediate echo. Echo would
/// be harmless under merge idempotence, but it wastes channel bandwidth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateEnvelope {
    /// Process that published this update
    pub origin_process: Uuid,
    /// Connection (within that process) that produced it
    pub origin_conn: Uuid,
    /// Raw update bytes as accepted by the merge engine
    pub update: Vec<u8>,
}

impl UpdateEnvelope {
    pub fn new(origin_process: Uuid, origin_conn: Uuid, update: Vec<u8>) -> Self {
        Self {
            origin_process,
            origin_conn,
            update,
        }
    }

    /// Serialize for broker transport.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from broker transport.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (env, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(env)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// Message is missing the `doc` field (or it is empty)
    MissingDocument,
    /// `update` field is not valid base64
    InvalidUpdate(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::MissingDocument => write!(f, "Message is missing a document id"),
            Self::InvalidUpdate(e) => write!(f, "Invalid update payload: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
