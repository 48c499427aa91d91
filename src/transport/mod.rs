//! Physical transport abstraction and the proxy a circuit sends through.
//!
//! # Architecture
//!
//! ```text
//! CircuitSession
//!     └── TransportProxy (one per circuit)
//!             ├── Connected { handle, connection_id, generation }
//!             └── Offline { generation }
//! ```
//!
//! A circuit outlives its connections. When the client comes back on a new
//! physical connection the proxy is [`transfer`](TransportProxy::transfer)red
//! to the new handle and the generation advances. Senders that captured an
//! older generation are refused, so nothing is ever written to a superseded
//! connection.

pub mod loopback;

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::BoxFuture;

use crate::error::TransportError;
use crate::protocol::ServerMessage;

/// Completion of one queued transmission.
pub type SendFuture = BoxFuture<'static, Result<(), TransportError>>;

/// A physical server-to-client connection.
///
/// `send` must fix the message's position in the outgoing stream before it
/// returns; the returned future only reports completion. This is what lets a
/// queue issue several batches in id order without waiting for each one.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Queue `message` for transmission.
    fn send(&self, message: ServerMessage) -> SendFuture;
}

/// Generation counter of a [`TransportProxy`].
pub type Generation = u64;

#[derive(Debug)]
enum ProxyState {
    Connected {
        handle: Arc<dyn Transport>,
        connection_id: String,
        generation: Generation,
    },
    Offline {
        generation: Generation,
    },
}

impl ProxyState {
    fn generation(&self) -> Generation {
        match self {
            Self::Connected { generation, .. } | Self::Offline { generation } => *generation,
        }
    }
}

/// The circuit's view of its current connection.
///
/// Only the owning session mutates the proxy; everything else observes it.
#[derive(Debug)]
pub struct TransportProxy {
    state: RwLock<ProxyState>,
}

impl TransportProxy {
    /// A proxy with no connection, used for prerendered circuits.
    pub fn offline() -> Self {
        Self {
            state: RwLock::new(ProxyState::Offline { generation: 0 }),
        }
    }

    /// A proxy attached to `handle`.
    pub fn connected(handle: Arc<dyn Transport>, connection_id: impl Into<String>) -> Self {
        Self {
            state: RwLock::new(ProxyState::Connected {
                handle,
                connection_id: connection_id.into(),
                generation: 0,
            }),
        }
    }

    /// Atomically replace the underlying connection.
    ///
    /// Returns the new generation. Sends pinned to an older generation fail
    /// with [`TransportError::Superseded`] from now on.
    pub fn transfer(&self, handle: Arc<dyn Transport>, connection_id: impl Into<String>) -> Generation {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let generation = state.generation() + 1;
        let connection_id = connection_id.into();
        log::debug!("Transport transferred to connection {} (generation {})", connection_id, generation);
        *state = ProxyState::Connected {
            handle,
            connection_id,
            generation,
        };
        generation
    }

    /// Mark the connection as gone. Returns `false` if already offline.
    pub fn set_disconnected(&self) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match *state {
            ProxyState::Offline { .. } => false,
            ProxyState::Connected { generation, .. } => {
                *state = ProxyState::Offline {
                    generation: generation + 1,
                };
                true
            }
        }
    }

    /// Whether a connection is attached.
    pub fn is_connected(&self) -> bool {
        matches!(
            *self.state.read().unwrap_or_else(PoisonError::into_inner),
            ProxyState::Connected { .. }
        )
    }

    /// Current generation.
    pub fn generation(&self) -> Generation {
        self.state.read().unwrap_or_else(PoisonError::into_inner).generation()
    }

    /// Whether `generation` is still the current connection.
    pub fn is_current(&self, generation: Generation) -> bool {
        match *self.state.read().unwrap_or_else(PoisonError::into_inner) {
            ProxyState::Connected { generation: g, .. } => g == generation,
            ProxyState::Offline { .. } => false,
        }
    }

    /// Id of the attached connection, if any.
    pub fn connection_id(&self) -> Option<String> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            ProxyState::Connected { connection_id, .. } => Some(connection_id.clone()),
            ProxyState::Offline { .. } => None,
        }
    }

    /// Queue `message` on the current connection.
    ///
    /// With `pinned` set, the send is refused unless that generation is still
    /// current. The read lock is held while the message is queued, so a
    /// concurrent [`transfer`](Self::transfer) either happens entirely before
    /// or entirely after it.
    pub fn send(
        &self,
        message: ServerMessage,
        pinned: Option<Generation>,
    ) -> Result<(Generation, SendFuture), TransportError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            ProxyState::Offline { .. } => Err(TransportError::Offline),
            ProxyState::Connected {
                handle, generation, ..
            } => {
                if pinned.is_some_and(|p| p != *generation) {
                    return Err(TransportError::Superseded);
                }
                Ok((*generation, handle.send(message)))
            }
        }
    }
}
