//! Circuit host side of the protocol.
//!
//! - [`outbound`]: per-renderer queue that numbers, sends, retries and
//!   replays render batches
//! - [`session`]: one circuit, its renderers and its connection
//! - [`registry`]: all circuits of the process, retention and routing
//! - [`prerender`]: circuit locations and document placeholders

pub mod outbound;
pub mod prerender;
pub mod registry;
pub mod session;

pub use outbound::{AckOutcome, ErrorSink, OutboundRenderQueue};
pub use prerender::CircuitLocation;
pub use registry::{CircuitFactory, CircuitRegistry};
pub use session::{CircuitHandler, CircuitSession};
