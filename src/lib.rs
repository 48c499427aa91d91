//! Circuit Relay - reliable, resumable delivery of server-rendered UI batches.
//!
//! A server holds logical sessions ("circuits") that push render batches to
//! a client over a long-lived connection that may drop at any time. This
//! crate makes that stream exactly-once and in order on the client, and lets
//! a client claim its circuits again on a brand-new connection.
//!
//! # Architecture
//!
//! ```text
//! producer ─> OutboundRenderQueue ─> TransportProxy ─> (wire) ─┐
//!                  ▲                                           ▼
//!                  │                               InboundRenderQueue ─> BatchApplier
//!                  └──────────── RenderCompleted <─── AckDispatcher
//! ```
//!
//! - **Server**: [`server::CircuitRegistry`] owns [`server::CircuitSession`]s,
//!   each with one [`server::OutboundRenderQueue`] per renderer.
//! - **Client**: [`client::ReconnectionCoordinator`] boots the page, pumps
//!   connections into [`client::RendererRegistry`] and reconnects.
//!
//! # Modules
//!
//! - [`protocol`] - Ids, batches and wire messages
//! - [`transport`] - Transport trait, proxy and loopback links
//! - [`document`] - Document tree and placeholder markers
//! - [`config`] - Configuration loading/saving

pub mod client;
pub mod config;
pub mod constants;
pub mod document;
pub mod error;
pub mod protocol;
pub mod server;
pub mod simulate;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use error::{ApplyFailure, CircuitError, TransportError};
pub use protocol::{BatchId, CircuitId, ClientMessage, ComponentId, RenderBatch, RendererId, ServerMessage, ServerReply};
