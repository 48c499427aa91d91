//! Error taxonomy for the delivery and reconnection protocol.
//!
//! Only network-level failures are recovered locally (by retrying). Anything
//! that signals an application failure or a broken protocol invariant is
//! surfaced to the owner of the circuit.

use crate::protocol::{BatchId, CircuitId, RendererId};

/// Errors raised by a physical transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No connection is attached to the proxy.
    #[error("transport is offline")]
    Offline,
    /// The connection the caller was using has been replaced.
    #[error("transport connection was superseded")]
    Superseded,
    /// The connection was closed.
    #[error("connection closed")]
    Closed,
    /// The transport failed to write the message.
    #[error("send failed: {0}")]
    Send(String),
}

/// Errors surfaced on a circuit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitError {
    /// A transient send failure (retried until the ceiling is reached).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A batch was transmitted the maximum number of times without being
    /// acknowledged.
    #[error(
        "render batch {batch_id} for renderer {renderer_id} was not acknowledged after {attempts} attempts"
    )]
    RetryCeilingExceeded {
        /// Renderer stream of the lost batch.
        renderer_id: RendererId,
        /// The lost batch.
        batch_id: BatchId,
        /// Transmissions made.
        attempts: u32,
    },

    /// The client reported that applying a batch failed.
    #[error("client failed to apply render batch {batch_id} for renderer {renderer_id}: {message}")]
    ClientRenderFailed {
        /// Renderer stream of the failed batch.
        renderer_id: RendererId,
        /// The failed batch.
        batch_id: BatchId,
        /// Error text reported by the client.
        message: String,
    },

    /// The circuit was torn down.
    #[error("circuit {0} has been disposed")]
    Disposed(CircuitId),

    /// At least one circuit refused to resume; none were resumed.
    #[error("reconnection rejected for {} circuit(s): {}", .rejected.len(), join_ids(.rejected))]
    PartialReconnect {
        /// Circuits that answered `false` or failed.
        rejected: Vec<CircuitId>,
    },
}

/// Failure of the external batch applier on the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("applying render batch {batch_id} for renderer {renderer_id} failed: {message}")]
pub struct ApplyFailure {
    /// Renderer stream of the batch.
    pub renderer_id: RendererId,
    /// Batch that failed.
    pub batch_id: BatchId,
    /// Error text from the applier.
    pub message: String,
}

fn join_ids(ids: &[CircuitId]) -> String {
    ids.iter()
        .map(CircuitId::as_ref)
        .collect::<Vec<_>>()
        .join(", ")
}
