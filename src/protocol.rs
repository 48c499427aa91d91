//! Identifiers, render batches and the logical messages exchanged between
//! a circuit host and its client.
//!
//! Framing is the transport's business; these types only fix what travels.
//!
//! ```text
//! Server                                         Client
//!   │  RenderBatch { renderer_id, batch_id, .. }   │
//!   │─────────────────────────────────────────────>│ (buffer, order, apply)
//!   │  RenderCompleted { renderer_id, batch_id }   │
//!   │<─────────────────────────────────────────────│
//!   │  StartCircuit { location_uri, base_uri }     │
//!   │<─────────────────────────────────────────────│ -> Option<CircuitId>
//!   │  ConnectCircuit { circuit_id }               │
//!   │<─────────────────────────────────────────────│ -> bool
//! ```

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::constants::FIRST_BATCH_ID;

/// Identifier of a render batch within one renderer stream.
///
/// Ids are assigned by the sending queue, start at [`FIRST_BATCH_ID`] and
/// only ever grow. A gap between two received ids means a batch is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub u64);

impl BatchId {
    /// The first id a renderer stream transmits.
    pub const FIRST: BatchId = BatchId(FIRST_BATCH_ID);

    /// The id that follows this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BatchId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Identifier of a renderer (one batch stream) on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RendererId(pub u64);

impl fmt::Display for RendererId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a root component inside a renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(pub u64);

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a circuit (a server-held logical session).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CircuitId(pub String);

impl CircuitId {
    /// Mint a fresh random circuit id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CircuitId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CircuitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for CircuitId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One unit of UI change produced by the server's renderer.
///
/// Immutable once created; retransmissions carry the exact same payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderBatch {
    /// Position of the batch in its renderer stream.
    pub id: BatchId,
    /// Opaque encoded UI diff.
    pub payload: Bytes,
}

impl RenderBatch {
    /// Create a batch.
    pub fn new(id: BatchId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }
}

/// Messages pushed from the circuit host to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A render batch for one renderer stream.
    RenderBatch {
        /// Renderer the batch belongs to.
        renderer_id: RendererId,
        /// Id of the batch within that renderer stream.
        batch_id: BatchId,
        /// Opaque batch payload.
        payload: Bytes,
    },
}

impl ServerMessage {
    /// Wrap a batch for transmission.
    pub fn render_batch(renderer_id: RendererId, batch: &RenderBatch) -> Self {
        Self::RenderBatch {
            renderer_id,
            batch_id: batch.id,
            payload: batch.payload.clone(),
        }
    }
}

/// Messages sent from the client to the circuit host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Acknowledges that a batch was applied, or reports that applying it failed.
    RenderCompleted {
        /// Renderer the batch belongs to.
        renderer_id: RendererId,
        /// Id of the acknowledged batch.
        batch_id: BatchId,
        /// Set when the client failed to apply the batch.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Ask for a fresh circuit for the given page.
    StartCircuit {
        /// Absolute URI of the current page.
        location_uri: String,
        /// Base URI of the application.
        base_uri: String,
    },
    /// Re-associate a known circuit with the connection carrying this message.
    ConnectCircuit {
        /// Circuit to resume.
        circuit_id: CircuitId,
    },
}

/// Reply to a [`ClientMessage`] that expects one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ServerReply {
    /// Result of `StartCircuit`: `None` when there is nothing to render.
    CircuitStarted(Option<CircuitId>),
    /// Result of `ConnectCircuit`.
    CircuitConnected(bool),
    /// The message needs no reply.
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_ids_start_at_two() {
        assert_eq!(BatchId::FIRST, BatchId(2));
        assert_eq!(BatchId::FIRST.next(), BatchId(3));
    }

    #[test]
    fn test_render_batch_message_wire_shape() {
        let batch = RenderBatch::new(BatchId(7), b"diff".to_vec());
        let msg = ServerMessage::render_batch(RendererId(1), &batch);
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "render_batch");
        assert_eq!(json["renderer_id"], 1);
        assert_eq!(json["batch_id"], 7);
    }

    #[test]
    fn test_render_completed_omits_missing_error() {
        let msg = ClientMessage::RenderCompleted {
            renderer_id: RendererId(3),
            batch_id: BatchId(4),
            error: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("error"));

        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"render_completed","renderer_id":3,"batch_id":4}"#)
                .unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_connect_circuit_parses_plain_string_id() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"connect_circuit","circuit_id":"abc"}"#).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::ConnectCircuit {
                circuit_id: CircuitId::from("abc")
            }
        );
    }

    #[test]
    fn test_generated_circuit_ids_are_unique() {
        assert_ne!(CircuitId::generate(), CircuitId::generate());
    }
}
