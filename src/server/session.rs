//! Circuit session: one server-held logical session and its renderer streams.
//!
//! A session outlives the connections it is served over. While offline its
//! outbound queues keep buffering; [`CircuitSession::resume`] moves every
//! queue onto a new connection at once.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use crate::config::DeliverySettings;
use crate::error::CircuitError;
use crate::protocol::{BatchId, CircuitId, RendererId};
use crate::server::outbound::{AckOutcome, OutboundRenderQueue};
use crate::server::prerender::CircuitLocation;
use crate::transport::{Generation, Transport, TransportProxy};

/// Observer of circuit lifecycle events.
///
/// Handlers run synchronously in registration order. An `Err` is logged and
/// never keeps later handlers from running.
pub trait CircuitHandler: Send + Sync {
    /// The circuit got a (new) connection.
    fn on_connection_up(&self, _circuit: &CircuitId) -> anyhow::Result<()> {
        Ok(())
    }

    /// The circuit lost its connection and is retained.
    fn on_connection_down(&self, _circuit: &CircuitId) -> anyhow::Result<()> {
        Ok(())
    }

    /// A fatal error is about to tear the circuit down.
    fn on_unhandled_error(&self, _circuit: &CircuitId, _error: &CircuitError) -> anyhow::Result<()> {
        Ok(())
    }

    /// The circuit has been disposed.
    fn on_circuit_closed(&self, _circuit: &CircuitId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A server-held circuit.
pub struct CircuitSession {
    id: CircuitId,
    location: CircuitLocation,
    transport: Arc<TransportProxy>,
    renderers: RwLock<BTreeMap<RendererId, Arc<OutboundRenderQueue>>>,
    handlers: RwLock<Vec<Arc<dyn CircuitHandler>>>,
    faulted: AtomicBool,
    disposed: AtomicBool,
    renderer_ids: Arc<AtomicU64>,
    delivery: DeliverySettings,
    this: Weak<CircuitSession>,
}

impl fmt::Debug for CircuitSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitSession")
            .field("id", &self.id)
            .field("location", &self.location.location_uri())
            .field("connection", &self.transport.connection_id())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl CircuitSession {
    /// Create a session.
    ///
    /// `renderer_ids` is shared by every session of a process so renderer
    /// ids never collide.
    pub fn new(
        id: CircuitId,
        location: CircuitLocation,
        transport: TransportProxy,
        delivery: DeliverySettings,
        renderer_ids: Arc<AtomicU64>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            location,
            transport: Arc::new(transport),
            renderers: RwLock::new(BTreeMap::new()),
            handlers: RwLock::new(Vec::new()),
            faulted: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            renderer_ids,
            delivery,
            this: this.clone(),
        })
    }

    /// Circuit id.
    pub fn id(&self) -> &CircuitId {
        &self.id
    }

    /// Page the circuit renders for.
    pub fn location(&self) -> &CircuitLocation {
        &self.location
    }

    /// Whether a connection is attached.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Id of the attached connection.
    pub fn connection_id(&self) -> Option<String> {
        self.transport.connection_id()
    }

    /// Whether the session has been torn down.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Register a lifecycle observer.
    pub fn add_handler(&self, handler: Arc<dyn CircuitHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Open a new renderer stream with its own outbound queue.
    pub fn add_renderer(&self) -> Result<Arc<OutboundRenderQueue>, CircuitError> {
        let mut renderers = self.renderers.write().unwrap_or_else(PoisonError::into_inner);
        if self.is_disposed() {
            return Err(CircuitError::Disposed(self.id.clone()));
        }

        let renderer_id = RendererId(self.renderer_ids.fetch_add(1, Ordering::Relaxed));
        let session = self.this.clone();
        let queue = OutboundRenderQueue::new(
            renderer_id,
            Arc::clone(&self.transport),
            self.delivery,
            Arc::new(move |error| {
                if let Some(session) = session.upgrade() {
                    session.report_unhandled(error);
                }
            }),
        );
        renderers.insert(renderer_id, Arc::clone(&queue));
        log::debug!("Circuit {} opened renderer {}", self.id, renderer_id);
        Ok(queue)
    }

    /// Outbound queue of `renderer_id`.
    pub fn renderer(&self, renderer_id: RendererId) -> Option<Arc<OutboundRenderQueue>> {
        self.renderers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&renderer_id)
            .cloned()
    }

    /// Renderer ids of this circuit, in increasing order.
    pub fn renderer_ids(&self) -> Vec<RendererId> {
        self.renderers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Outstanding batch ids per renderer.
    pub fn outstanding(&self) -> BTreeMap<RendererId, Vec<BatchId>> {
        self.renderers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, queue)| (*id, queue.outstanding()))
            .collect()
    }

    /// Move the circuit onto a new connection and replay unacknowledged
    /// batches on it.
    ///
    /// Every queue is locked for the duration of the transfer, so no batch
    /// enqueued concurrently can overtake the replay. Taking over from a
    /// connection that is still attached reports it down before the new one
    /// is reported up.
    pub fn resume(
        &self,
        handle: Arc<dyn Transport>,
        connection_id: &str,
    ) -> Result<Generation, CircuitError> {
        if self.is_disposed() {
            return Err(CircuitError::Disposed(self.id.clone()));
        }

        let (generation, replaced) = {
            let renderers = self.renderers.read().unwrap_or_else(PoisonError::into_inner);
            let mut states: Vec<_> = renderers.values().map(|q| q.lock_state()).collect();
            let replaced = self.transport.connection_id();
            let generation = self.transport.transfer(handle, connection_id);
            for (queue, state) in renderers.values().zip(states.iter_mut()) {
                queue.resend_locked(state);
            }
            (generation, replaced)
        };

        if let Some(previous) = replaced {
            log::info!("Circuit {} taken over from connection {}", self.id, previous);
            self.notify("on_connection_down", |h| h.on_connection_down(&self.id));
        }

        log::info!(
            "Circuit {} resumed on connection {} (generation {})",
            self.id,
            connection_id,
            generation
        );
        self.notify("on_connection_up", |h| h.on_connection_up(&self.id));
        Ok(generation)
    }

    /// Mark the connection as gone. Outstanding batches stay buffered.
    pub fn set_disconnected(&self) {
        if self.transport.set_disconnected() {
            log::info!("Circuit {} disconnected", self.id);
            self.notify("on_connection_down", |h| h.on_connection_down(&self.id));
        }
    }

    /// Route an acknowledgement to its renderer stream.
    pub fn acknowledge(
        &self,
        renderer_id: RendererId,
        batch_id: BatchId,
        error: Option<String>,
    ) -> AckOutcome {
        if let Some(queue) = self.renderer(renderer_id) {
            return queue.acknowledge(batch_id, error);
        }
        log::debug!(
            "Circuit {} has no renderer {}, ignoring acknowledgement of batch {}",
            self.id,
            renderer_id,
            batch_id
        );
        if let Some(message) = error {
            self.report_unhandled(CircuitError::ClientRenderFailed {
                renderer_id,
                batch_id,
                message,
            });
        }
        AckOutcome::Ignored
    }

    /// Notify handlers of a fatal error, then dispose the circuit.
    ///
    /// Only the first fatal error is reported.
    pub fn report_unhandled(&self, error: CircuitError) {
        if self.faulted.swap(true, Ordering::AcqRel) || self.is_disposed() {
            log::debug!("Circuit {} already failed, dropping: {}", self.id, error);
            return;
        }
        log::error!("Unhandled error in circuit {}: {}", self.id, error);
        self.notify("on_unhandled_error", |h| h.on_unhandled_error(&self.id, &error));
        self.dispose();
    }

    /// Tear the circuit down: cancel delivery and drop all outstanding work.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let queues: Vec<_> = {
            let renderers = self.renderers.read().unwrap_or_else(PoisonError::into_inner);
            renderers.values().cloned().collect()
        };
        for queue in queues {
            queue.dispose();
        }
        self.transport.set_disconnected();
        log::info!("Circuit {} disposed", self.id);
        self.notify("on_circuit_closed", |h| h.on_circuit_closed(&self.id));
    }

    fn notify(&self, event: &str, call: impl Fn(&dyn CircuitHandler) -> anyhow::Result<()>) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            if let Err(e) = call(handler.as_ref()) {
                log::error!("Circuit {} handler failed in {}: {:#}", self.id, event, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Journal {
        name: &'static str,
        fail: bool,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl CircuitHandler for Journal {
        fn on_unhandled_error(&self, _circuit: &CircuitId, error: &CircuitError) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(format!("{}: {}", self.name, error));
            if self.fail {
                anyhow::bail!("{} refused", self.name);
            }
            Ok(())
        }

        fn on_circuit_closed(&self, _circuit: &CircuitId) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(format!("{}: closed", self.name));
            Ok(())
        }
    }

    fn session() -> Arc<CircuitSession> {
        CircuitSession::new(
            CircuitId::from("c1"),
            CircuitLocation::new("http://localhost/", "http://localhost/").unwrap(),
            TransportProxy::offline(),
            DeliverySettings::default(),
            Arc::new(AtomicU64::new(1)),
        )
    }

    #[tokio::test]
    async fn test_renderer_ids_come_from_shared_counter() {
        let ids = Arc::new(AtomicU64::new(5));
        let location = CircuitLocation::new("http://localhost/", "http://localhost/").unwrap();
        let a = CircuitSession::new(
            CircuitId::from("a"),
            location.clone(),
            TransportProxy::offline(),
            DeliverySettings::default(),
            Arc::clone(&ids),
        );
        let b = CircuitSession::new(
            CircuitId::from("b"),
            location,
            TransportProxy::offline(),
            DeliverySettings::default(),
            ids,
        );
        assert_eq!(a.add_renderer().unwrap().renderer_id(), RendererId(5));
        assert_eq!(b.add_renderer().unwrap().renderer_id(), RendererId(6));
        assert_eq!(a.renderer_ids(), vec![RendererId(5)]);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_later_handlers() {
        let session = session();
        let events = Arc::new(Mutex::new(Vec::new()));
        session.add_handler(Arc::new(Journal {
            name: "first",
            fail: true,
            events: Arc::clone(&events),
        }));
        session.add_handler(Arc::new(Journal {
            name: "second",
            fail: false,
            events: Arc::clone(&events),
        }));

        session.report_unhandled(CircuitError::Disposed(CircuitId::from("x")));
        session.report_unhandled(CircuitError::Disposed(CircuitId::from("y")));

        assert!(session.is_disposed());
        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                "first: circuit x has been disposed",
                "second: circuit x has been disposed",
                "first: closed",
                "second: closed",
            ]
        );
    }

    #[tokio::test]
    async fn test_disposed_session_refuses_renderers_and_resume() {
        let session = session();
        let queue = session.add_renderer().unwrap();
        queue.enqueue(b"a".to_vec()).unwrap();
        session.dispose();

        assert_eq!(queue.outstanding_count(), 0);
        assert!(matches!(session.add_renderer(), Err(CircuitError::Disposed(_))));
    }

    #[tokio::test]
    async fn test_unknown_renderer_error_is_surfaced() {
        let session = session();
        let outcome = session.acknowledge(RendererId(42), BatchId(2), Some("bad".into()));
        assert_eq!(outcome, AckOutcome::Ignored);
        assert!(session.is_disposed());
    }
}
