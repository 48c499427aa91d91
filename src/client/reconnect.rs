//! Client boot and reconnection.
//!
//! # Protocol
//!
//! - Boot discovers prerendered components, attaches them, and claims their
//!   circuits on a fresh connection. With nothing prerendered it asks the
//!   server to start a circuit instead.
//! - `reconnect()` opens a new connection and issues `ConnectCircuit` for
//!   every known circuit concurrently. It is all-or-nothing: one refusal
//!   stops the new connection and leaves every circuit unresumed.
//! - Each connection has a pump task feeding server pushes into the
//!   page-lifetime [`RendererRegistry`]. When the connection closes the pump
//!   fires connection-down handlers.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Context;
use futures_util::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::client::acks::AckDispatcher;
use crate::client::discovery::{discover, ComponentAttacher, Discovery};
use crate::client::renderers::RendererRegistry;
use crate::client::{Connector, ServerConnection};
use crate::config::ReconnectSettings;
use crate::constants::RECONNECT_JITTER_MS;
use crate::document::Document;
use crate::error::{CircuitError, TransportError};
use crate::protocol::{CircuitId, ServerMessage};

/// Observer of the client's connection state.
///
/// Handlers run in registration order; an `Err` is logged and the remaining
/// handlers still run.
pub trait ConnectionHandler: Send + Sync {
    /// A connection is up and every known circuit is bound to it.
    fn on_connection_up(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// The connection went away or a reconnect attempt failed.
    fn on_connection_down(&self, _reason: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Outcome of [`ReconnectionCoordinator::boot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootReport {
    /// What discovery found in the document.
    pub discovery: Discovery,
    /// Circuit started because nothing was prerendered.
    pub started: Option<CircuitId>,
}

struct Active {
    handle: Arc<dyn ServerConnection>,
    pump: JoinHandle<()>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    renderers: Arc<RendererRegistry>,
    acks: AckDispatcher,
    settings: ReconnectSettings,
    reconnecting: Mutex<()>,
    circuits: RwLock<Vec<CircuitId>>,
    resumed: RwLock<Vec<CircuitId>>,
    current: RwLock<Option<Active>>,
    handlers: RwLock<Vec<Arc<dyn ConnectionHandler>>>,
}

impl Inner {
    fn notify_up(&self) {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for handler in handlers {
            if let Err(e) = handler.on_connection_up() {
                log::error!("Connection handler failed in on_connection_up: {:#}", e);
            }
        }
    }

    fn notify_down(&self, reason: &str) {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for handler in handlers {
            if let Err(e) = handler.on_connection_down(reason) {
                log::error!("Connection handler failed in on_connection_down: {:#}", e);
            }
        }
    }

    /// Forget `connection_id` if it is still current. Returns whether it was.
    fn release(&self, connection_id: &str) -> bool {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let is_current = current
            .as_ref()
            .is_some_and(|a| a.handle.connection_id() == connection_id);
        if is_current {
            *current = None;
            self.acks.set_connection(None);
            self.resumed
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
        is_current
    }

    async fn pump(
        self: Arc<Self>,
        handle: Arc<dyn ServerConnection>,
        mut incoming: mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        let connection_id = handle.connection_id().to_string();
        while let Some(message) = incoming.recv().await {
            if let Err(failure) = self.renderers.receive(message, &self.acks) {
                log::error!("Stopping connection {}: {}", connection_id, failure);
                // The error acknowledgement must reach the server before the
                // connection closes underneath it.
                self.acks.flush().await;
                handle.stop().await;
                if self.release(&connection_id) {
                    self.notify_down(&failure.to_string());
                }
                return;
            }
        }
        log::info!("Connection {} closed", connection_id);
        if self.release(&connection_id) {
            self.notify_down("connection closed");
        }
    }

    /// Detach the current connection, if any, without stopping it.
    fn take_current(&self) -> Option<Arc<dyn ServerConnection>> {
        let active = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        active.pump.abort();
        self.acks.set_connection(None);
        self.resumed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Some(active.handle)
    }

    /// Make `handle` the current connection and start pumping it.
    fn install(
        self: &Arc<Self>,
        handle: Arc<dyn ServerConnection>,
        incoming: mpsc::UnboundedReceiver<ServerMessage>,
    ) -> Option<Arc<dyn ServerConnection>> {
        self.acks.set_connection(Some(Arc::clone(&handle)));
        let pump = tokio::spawn(Arc::clone(self).pump(Arc::clone(&handle), incoming));
        let previous = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Active { handle, pump });
        previous.map(|old| {
            old.pump.abort();
            old.handle
        })
    }
}

/// Client-side coordinator of boot, reconnection and connection lifetime.
#[derive(Clone)]
pub struct ReconnectionCoordinator {
    inner: Arc<Inner>,
}

impl fmt::Debug for ReconnectionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectionCoordinator")
            .field("circuits", &self.known_circuits())
            .field("connection", &self.connection_id())
            .finish_non_exhaustive()
    }
}

impl ReconnectionCoordinator {
    /// Coordinator feeding `renderers` from connections opened by `connector`.
    pub fn new(
        connector: Arc<dyn Connector>,
        renderers: Arc<RendererRegistry>,
        acks: AckDispatcher,
        settings: ReconnectSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                renderers,
                acks,
                settings,
                reconnecting: Mutex::new(()),
                circuits: RwLock::new(Vec::new()),
                resumed: RwLock::new(Vec::new()),
                current: RwLock::new(None),
                handlers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Register a connection observer.
    pub fn add_handler(&self, handler: Arc<dyn ConnectionHandler>) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Circuits this page knows about.
    pub fn known_circuits(&self) -> Vec<CircuitId> {
        self.inner
            .circuits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Circuits bound to the current connection.
    pub fn resumed_circuits(&self) -> Vec<CircuitId> {
        self.inner
            .resumed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Id of the current connection.
    pub fn connection_id(&self) -> Option<String> {
        self.inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|a| a.handle.connection_id().to_string())
    }

    /// Whether a connection is current.
    pub fn is_connected(&self) -> bool {
        self.connection_id().is_some()
    }

    /// Start the page: attach prerendered components and claim their
    /// circuits, or start a fresh circuit when none were prerendered.
    pub async fn boot<A>(
        &self,
        document: &Document,
        location_uri: &str,
        base_uri: &str,
        attacher: &mut A,
    ) -> anyhow::Result<BootReport>
    where
        A: ComponentAttacher + ?Sized,
    {
        let discovery = discover(document);
        if !discovery.malformed.is_empty() {
            log::warn!(
                "Skipped {} malformed component markers",
                discovery.malformed.len()
            );
        }

        if !discovery.is_empty() {
            for entry in &discovery.entries {
                self.inner.renderers.attach(entry.renderer_id);
                entry.initialize(attacher)?;
            }
            *self
                .inner
                .circuits
                .write()
                .unwrap_or_else(PoisonError::into_inner) = discovery.circuit_ids();
            log::info!(
                "Discovered {} prerendered components in {} circuits",
                discovery.entries.len(),
                self.known_circuits().len()
            );
            self.reconnect()
                .await
                .context("Prerendered circuits could not be claimed")?;
            return Ok(BootReport {
                discovery,
                started: None,
            });
        }

        let _guard = self.inner.reconnecting.lock().await;
        let connection = self
            .inner
            .connector
            .connect()
            .await
            .context("Failed to open initial connection")?;
        let started = match connection.handle.start_circuit(location_uri, base_uri).await {
            Ok(started) => started,
            Err(e) => {
                connection.handle.stop().await;
                return Err(e.context("StartCircuit failed"));
            }
        };

        match &started {
            Some(id) => {
                log::info!("Started circuit {}", id);
                self.inner
                    .circuits
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(id.clone());
                *self
                    .inner
                    .resumed
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = vec![id.clone()];
                if let Some(old) = self.inner.install(connection.handle, connection.incoming) {
                    old.stop().await;
                }
                self.inner.notify_up();
            }
            None => {
                log::info!("No components to render");
                connection.handle.stop().await;
            }
        }
        Ok(BootReport { discovery, started })
    }

    /// Open a new connection and move every known circuit onto it.
    ///
    /// Succeeds only if every circuit accepts. Otherwise the new connection
    /// is stopped, connection-down handlers fire and
    /// [`CircuitError::PartialReconnect`] lists the circuits that refused.
    pub async fn reconnect(&self) -> Result<(), CircuitError> {
        let _guard = self.inner.reconnecting.lock().await;
        let circuits = self.known_circuits();

        let connection = match self.inner.connector.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                let reason = format!("{:#}", e);
                log::warn!("Reconnect failed to open a connection: {}", reason);
                self.inner.notify_down(&reason);
                return Err(TransportError::Send(reason).into());
            }
        };
        let handle = connection.handle;

        let results = join_all(circuits.iter().map(|id| {
            let handle = Arc::clone(&handle);
            async move { handle.connect_circuit(id).await }
        }))
        .await;

        let rejected: Vec<CircuitId> = circuits
            .iter()
            .zip(results)
            .filter_map(|(id, result)| match result {
                Ok(true) => None,
                Ok(false) => Some(id.clone()),
                Err(e) => {
                    log::warn!("ConnectCircuit for {} failed: {:#}", id, e);
                    Some(id.clone())
                }
            })
            .collect();

        if !rejected.is_empty() {
            let error = CircuitError::PartialReconnect { rejected };
            log::warn!("Reconnect on {} abandoned: {}", handle.connection_id(), error);
            handle.stop().await;
            // Accepted circuits already left the previous connection.
            if let Some(stale) = self.inner.take_current() {
                stale.stop().await;
            }
            self.inner.notify_down(&error.to_string());
            return Err(error);
        }

        log::info!(
            "Reconnected {} circuits on connection {}",
            circuits.len(),
            handle.connection_id()
        );
        *self
            .inner
            .resumed
            .write()
            .unwrap_or_else(PoisonError::into_inner) = circuits;
        if let Some(old) = self.inner.install(handle, connection.incoming) {
            old.stop().await;
        }
        self.inner.notify_up();
        Ok(())
    }

    /// Retry [`reconnect`](Self::reconnect) with exponential backoff and
    /// jitter. Returns the number of attempts used.
    pub async fn reconnect_with_backoff(&self) -> Result<u32, CircuitError> {
        let settings = self.inner.settings;
        let mut backoff = settings.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.reconnect().await {
                Ok(()) => return Ok(attempt),
                Err(e) if attempt >= settings.max_attempts => {
                    log::error!("Giving up after {} reconnect attempts: {}", attempt, e);
                    return Err(e);
                }
                Err(e) => {
                    let jitter = Duration::from_millis(rand::random::<u64>() % (RECONNECT_JITTER_MS + 1));
                    log::info!(
                        "Reconnect attempt {} failed ({}), retrying in {:?}",
                        attempt,
                        e,
                        backoff + jitter
                    );
                    tokio::time::sleep(backoff + jitter).await;
                    backoff = (backoff * 2).min(settings.max_backoff);
                    attempt += 1;
                }
            }
        }
    }

    /// Stop the current connection without reconnecting.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.inner.take_current() {
            handle.stop().await;
            self.inner.notify_down("disconnected by client");
        }
    }
}
