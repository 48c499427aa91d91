//! Circuit registry: owns every live session of the process.
//!
//! Routes client messages to sessions, keeps disconnected sessions alive for
//! a grace period and evicts them when it runs out.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::{Config, DeliverySettings};
use crate::protocol::{BatchId, CircuitId, ClientMessage, RendererId, ServerReply};
use crate::server::outbound::AckOutcome;
use crate::server::prerender::CircuitLocation;
use crate::server::session::{CircuitHandler, CircuitSession};
use crate::transport::{Transport, TransportProxy};

/// Produces the initial render of a new circuit.
#[async_trait]
pub trait CircuitFactory: Send + Sync {
    /// Populate `session` for `location`: open renderers and enqueue the
    /// first batches. `Ok(false)` means there is nothing to render and the
    /// circuit is discarded.
    async fn start(&self, session: Arc<CircuitSession>, location: &CircuitLocation) -> anyhow::Result<bool>;
}

struct RegistryInner {
    circuits: Mutex<HashMap<CircuitId, Arc<CircuitSession>>>,
    evictions: Mutex<HashMap<CircuitId, JoinHandle<()>>>,
    renderer_ids: Arc<AtomicU64>,
    delivery: DeliverySettings,
    retention: Duration,
    factory: Arc<dyn CircuitFactory>,
}

impl RegistryInner {
    fn circuits(&self) -> MutexGuard<'_, HashMap<CircuitId, Arc<CircuitSession>>> {
        self.circuits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evictions(&self) -> MutexGuard<'_, HashMap<CircuitId, JoinHandle<()>>> {
        self.evictions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_eviction(&self, id: &CircuitId) {
        if let Some(task) = self.evictions().remove(id) {
            task.abort();
        }
    }

    fn forget(&self, id: &CircuitId) {
        self.circuits().remove(id);
        self.cancel_eviction(id);
    }

    fn evict(&self, id: &CircuitId) {
        self.evictions().remove(id);
        let session = {
            let mut circuits = self.circuits();
            let disconnected = circuits.get(id).is_some_and(|s| !s.is_connected());
            if disconnected {
                circuits.remove(id)
            } else {
                None
            }
        };
        if let Some(session) = session {
            log::info!("Evicting circuit {} after {:?} without a connection", id, self.retention);
            session.dispose();
        }
    }
}

/// Removes a session from the registry once it is closed.
struct Forget(Weak<RegistryInner>);

impl CircuitHandler for Forget {
    fn on_circuit_closed(&self, circuit: &CircuitId) -> anyhow::Result<()> {
        if let Some(inner) = self.0.upgrade() {
            inner.forget(circuit);
        }
        Ok(())
    }
}

/// Process-wide map of circuit ids to sessions.
#[derive(Clone)]
pub struct CircuitRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for CircuitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitRegistry")
            .field("circuits", &self.len())
            .field("retention", &self.inner.retention)
            .finish_non_exhaustive()
    }
}

impl CircuitRegistry {
    /// Registry using `config` for delivery tuning and retention.
    pub fn new(config: &Config, factory: Arc<dyn CircuitFactory>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                circuits: Mutex::new(HashMap::new()),
                evictions: Mutex::new(HashMap::new()),
                renderer_ids: Arc::new(AtomicU64::new(1)),
                delivery: config.delivery(),
                retention: config.retention(),
                factory,
            }),
        }
    }

    fn register(&self, location: CircuitLocation, transport: TransportProxy) -> Arc<CircuitSession> {
        let session = CircuitSession::new(
            CircuitId::generate(),
            location,
            transport,
            self.inner.delivery,
            Arc::clone(&self.inner.renderer_ids),
        );
        session.add_handler(Arc::new(Forget(Arc::downgrade(&self.inner))));
        self.inner
            .circuits()
            .insert(session.id().clone(), Arc::clone(&session));
        session
    }

    async fn run_factory(&self, session: &Arc<CircuitSession>) -> bool {
        let started = self
            .inner
            .factory
            .start(Arc::clone(session), session.location())
            .await;
        match started {
            Ok(true) => true,
            Ok(false) => {
                log::debug!("Nothing to render for {}", session.location());
                session.dispose();
                false
            }
            Err(e) => {
                log::error!("Failed to start circuit {}: {:#}", session.id(), e);
                session.dispose();
                false
            }
        }
    }

    /// Create an offline circuit whose first render is embedded in the
    /// delivered document. Its batches buffer until a client connects, and
    /// it is evicted if none does within the retention period.
    pub async fn prerender(&self, location: CircuitLocation) -> Option<Arc<CircuitSession>> {
        let session = self.register(location, TransportProxy::offline());
        if !self.run_factory(&session).await {
            return None;
        }
        log::info!("Prerendered circuit {} for {}", session.id(), session.location());
        self.schedule_eviction(session.id());
        Some(session)
    }

    /// Start a fresh circuit bound to `connection`.
    pub async fn start_circuit(
        &self,
        connection: Arc<dyn Transport>,
        connection_id: &str,
        location: CircuitLocation,
    ) -> Option<CircuitId> {
        let session = self.register(location, TransportProxy::connected(connection, connection_id));
        if !self.run_factory(&session).await {
            return None;
        }
        log::info!(
            "Started circuit {} on connection {}",
            session.id(),
            connection_id
        );
        Some(session.id().clone())
    }

    /// Resume a known circuit on `connection`. Returns `false` for unknown,
    /// evicted or disposed circuits.
    pub fn connect_circuit(
        &self,
        connection: Arc<dyn Transport>,
        connection_id: &str,
        circuit_id: &CircuitId,
    ) -> bool {
        let Some(session) = self.get(circuit_id) else {
            log::info!("Connection {} asked for unknown circuit {}", connection_id, circuit_id);
            return false;
        };
        self.inner.cancel_eviction(circuit_id);
        match session.resume(connection, connection_id) {
            Ok(_) => true,
            Err(e) => {
                log::info!("Circuit {} cannot be resumed: {}", circuit_id, e);
                false
            }
        }
    }

    /// Route an acknowledgement from `connection_id`.
    ///
    /// Acknowledgements from a connection that no longer owns the renderer's
    /// circuit are ignored; the batch is replayed on the current one.
    pub fn render_completed(
        &self,
        connection_id: &str,
        renderer_id: RendererId,
        batch_id: BatchId,
        error: Option<String>,
    ) -> AckOutcome {
        let session = self
            .inner
            .circuits()
            .values()
            .find(|s| s.connection_id().as_deref() == Some(connection_id) && s.renderer(renderer_id).is_some())
            .cloned();
        match session {
            Some(session) => session.acknowledge(renderer_id, batch_id, error),
            None => {
                log::debug!(
                    "No circuit on connection {} owns renderer {}, ignoring batch {}",
                    connection_id,
                    renderer_id,
                    batch_id
                );
                AckOutcome::Ignored
            }
        }
    }

    /// The connection `connection_id` closed: retain its circuits and start
    /// their eviction timers.
    pub fn connection_closed(&self, connection_id: &str) {
        let affected: Vec<_> = self
            .inner
            .circuits()
            .values()
            .filter(|s| s.connection_id().as_deref() == Some(connection_id))
            .cloned()
            .collect();
        for session in affected {
            session.set_disconnected();
            self.schedule_eviction(session.id());
        }
    }

    fn schedule_eviction(&self, id: &CircuitId) {
        let inner = Arc::downgrade(&self.inner);
        let retention = self.inner.retention;
        let circuit = id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if let Some(inner) = inner.upgrade() {
                inner.evict(&circuit);
            }
        });
        if let Some(previous) = self.inner.evictions().insert(id.clone(), task) {
            previous.abort();
        }
    }

    /// Handle one client message arriving on `connection`.
    pub async fn dispatch(
        &self,
        connection: Arc<dyn Transport>,
        connection_id: &str,
        message: ClientMessage,
    ) -> ServerReply {
        match message {
            ClientMessage::RenderCompleted {
                renderer_id,
                batch_id,
                error,
            } => {
                self.render_completed(connection_id, renderer_id, batch_id, error);
                ServerReply::None
            }
            ClientMessage::StartCircuit {
                location_uri,
                base_uri,
            } => match CircuitLocation::new(&location_uri, &base_uri) {
                Ok(location) => {
                    ServerReply::CircuitStarted(self.start_circuit(connection, connection_id, location).await)
                }
                Err(e) => {
                    log::warn!(
                        "Rejecting circuit start for {} (base {}): {}",
                        location_uri,
                        base_uri,
                        e
                    );
                    ServerReply::CircuitStarted(None)
                }
            },
            ClientMessage::ConnectCircuit { circuit_id } => {
                ServerReply::CircuitConnected(self.connect_circuit(connection, connection_id, &circuit_id))
            }
        }
    }

    /// Live session by id.
    pub fn get(&self, id: &CircuitId) -> Option<Arc<CircuitSession>> {
        self.inner.circuits().get(id).cloned()
    }

    /// Tear down a circuit. Returns `false` if it was unknown.
    pub fn dispose(&self, id: &CircuitId) -> bool {
        match self.get(id) {
            Some(session) => {
                session.dispose();
                true
            }
            None => false,
        }
    }

    /// Number of live circuits.
    pub fn len(&self) -> usize {
        self.inner.circuits().len()
    }

    /// Whether no circuit is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CircuitError;

    struct OneRenderer;

    #[async_trait]
    impl CircuitFactory for OneRenderer {
        async fn start(&self, session: Arc<CircuitSession>, location: &CircuitLocation) -> anyhow::Result<bool> {
            if location.relative_path().is_empty() {
                return Ok(false);
            }
            let queue = session.add_renderer()?;
            queue.enqueue(b"initial".to_vec())?;
            Ok(true)
        }
    }

    fn registry(retention_secs: u64) -> CircuitRegistry {
        let config = Config {
            disconnected_retention_secs: retention_secs,
            ..Config::default()
        };
        CircuitRegistry::new(&config, Arc::new(OneRenderer))
    }

    fn location(path: &str) -> CircuitLocation {
        CircuitLocation::new(path, "http://localhost/").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_prerendered_circuit_is_evicted_without_connection() {
        let registry = registry(10);
        let session = registry.prerender(location("counter")).await.unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(session.outstanding().values().flatten().count(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(registry.is_empty());
        assert!(session.is_disposed());
    }

    #[tokio::test]
    async fn test_nothing_to_render_discards_circuit() {
        let registry = registry(10);
        assert!(registry.prerender(location("")).await.is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_circuit_cannot_connect() {
        let registry = registry(10);
        let connection: Arc<dyn Transport> = Arc::new(Null);
        assert!(!registry.connect_circuit(connection, "c1", &CircuitId::from("missing")));
    }

    #[tokio::test]
    async fn test_unhandled_error_removes_circuit() {
        let registry = registry(10);
        let session = registry.prerender(location("counter")).await.unwrap();
        session.report_unhandled(CircuitError::Disposed(session.id().clone()));
        assert!(registry.get(session.id()).is_none());
    }

    #[derive(Debug)]
    struct Null;

    impl Transport for Null {
        fn send(&self, _message: crate::protocol::ServerMessage) -> crate::transport::SendFuture {
            Box::pin(async { Ok(()) })
        }
    }
}
