//! Client side of the protocol.
//!
//! # Architecture
//!
//! ```text
//! ReconnectionCoordinator
//!     ├── Connector ──> Connection { handle, incoming }
//!     ├── RendererRegistry
//!     │       └── InboundRenderQueue (one per renderer)
//!     │               └── BatchApplier (external)
//!     └── AckDispatcher ──> ServerConnection::render_completed
//! ```
//!
//! Inbound queues live as long as the page; connections come and go
//! underneath them.

pub mod acks;
pub mod discovery;
pub mod inbound;
pub mod reconnect;
pub mod renderers;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::protocol::{BatchId, CircuitId, RendererId, ServerMessage};

pub use acks::AckDispatcher;
pub use discovery::{
    discover, AttachTarget, ComponentAttacher, ComponentEntry, Discovery, MalformedMarker, MarkerDefect,
};
pub use inbound::{AckSink, BatchApplier, InboundRenderQueue, OfferStatus};
pub use reconnect::{BootReport, ConnectionHandler, ReconnectionCoordinator};
pub use renderers::RendererRegistry;

/// Client end of one physical connection to the circuit host.
#[async_trait]
pub trait ServerConnection: Send + Sync + fmt::Debug {
    /// Id the server knows this connection by.
    fn connection_id(&self) -> &str;

    /// Acknowledge a batch, or report that applying it failed.
    async fn render_completed(
        &self,
        renderer_id: RendererId,
        batch_id: BatchId,
        error: Option<String>,
    ) -> Result<(), TransportError>;

    /// Ask for a fresh circuit. `None` means there is nothing to render.
    async fn start_circuit(&self, location_uri: &str, base_uri: &str) -> anyhow::Result<Option<CircuitId>>;

    /// Ask the server to move `circuit_id` onto this connection.
    async fn connect_circuit(&self, circuit_id: &CircuitId) -> anyhow::Result<bool>;

    /// Close the connection.
    async fn stop(&self);
}

/// A freshly opened connection.
#[derive(Debug)]
pub struct Connection {
    /// Requests and acknowledgements go here.
    pub handle: Arc<dyn ServerConnection>,
    /// Server pushes arrive here; the channel closes with the connection.
    pub incoming: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Opens connections to the circuit host.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new physical connection.
    async fn connect(&self) -> anyhow::Result<Connection>;
}
