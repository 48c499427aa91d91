//! Shared helpers for the scenario tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use circuit_relay::client::{AttachTarget, BatchApplier, ComponentAttacher, ConnectionHandler};
use circuit_relay::config::DeliverySettings;
use circuit_relay::server::{CircuitFactory, CircuitHandler, CircuitLocation, CircuitSession};
use circuit_relay::transport::{SendFuture, Transport, TransportProxy};
use circuit_relay::{BatchId, CircuitError, CircuitId, ComponentId, RenderBatch, RendererId, ServerMessage, TransportError};
use tokio::sync::Semaphore;

pub const BASE: &str = "http://localhost/";

pub fn location(path: &str) -> CircuitLocation {
    CircuitLocation::new(path, BASE).unwrap()
}

/// Offline session with the default delivery settings.
pub fn offline_session(id: &str) -> Arc<CircuitSession> {
    CircuitSession::new(
        CircuitId::from(id),
        location("app"),
        TransportProxy::offline(),
        DeliverySettings::default(),
        Arc::new(AtomicU64::new(1)),
    )
}

/// Session attached to `transport`.
pub fn connected_session(id: &str, transport: Arc<ScriptedTransport>) -> Arc<CircuitSession> {
    CircuitSession::new(
        CircuitId::from(id),
        location("app"),
        TransportProxy::connected(transport, "conn-1"),
        DeliverySettings::default(),
        Arc::new(AtomicU64::new(1)),
    )
}

/// Transport that records what reached it and can fail or stall sends.
#[derive(Debug)]
pub struct ScriptedTransport {
    delivered: Mutex<Vec<BatchId>>,
    attempts: AtomicU32,
    failures_left: AtomicU32,
    stalled: Mutex<Option<Arc<Semaphore>>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            attempts: AtomicU32::new(0),
            failures_left: AtomicU32::new(0),
            stalled: Mutex::new(None),
        }
    }
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` sends with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    /// Hold every send until [`ScriptedTransport::release`], then fail it
    /// as if the connection closed underneath.
    pub fn stall(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.stalled.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Batch ids that reached the wire, in order.
    pub fn delivered(&self) -> Vec<BatchId> {
        self.delivered.lock().unwrap().clone()
    }

    /// Every send call, including failed ones.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, message: ServerMessage) -> SendFuture {
        use std::sync::atomic::Ordering;

        let ServerMessage::RenderBatch { batch_id, .. } = message;
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = self.stalled.lock().unwrap().clone() {
            return Box::pin(async move {
                let _permit = gate.acquire().await;
                Err(TransportError::Closed)
            });
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Box::pin(async { Err(TransportError::Send("scripted failure".into())) });
        }

        self.delivered.lock().unwrap().push(batch_id);
        Box::pin(async { Ok(()) })
    }
}

/// Records fatal errors and lifecycle events of a circuit.
#[derive(Debug, Default)]
pub struct CircuitEvents {
    pub errors: Mutex<Vec<CircuitError>>,
    pub ups: AtomicU32,
    pub downs: AtomicU32,
    pub closed: AtomicU32,
}

impl CircuitEvents {
    pub fn attach(session: &CircuitSession) -> Arc<Self> {
        let events = Arc::new(Self::default());
        session.add_handler(Arc::clone(&events) as Arc<dyn CircuitHandler>);
        events
    }

    pub fn errors(&self) -> Vec<CircuitError> {
        self.errors.lock().unwrap().clone()
    }
}

impl CircuitHandler for CircuitEvents {
    fn on_connection_up(&self, _circuit: &CircuitId) -> anyhow::Result<()> {
        self.ups.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn on_connection_down(&self, _circuit: &CircuitId) -> anyhow::Result<()> {
        self.downs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn on_unhandled_error(&self, _circuit: &CircuitId, error: &CircuitError) -> anyhow::Result<()> {
        self.errors.lock().unwrap().push(error.clone());
        Ok(())
    }

    fn on_circuit_closed(&self, _circuit: &CircuitId) -> anyhow::Result<()> {
        self.closed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

/// Factory opening one renderer and enqueueing `initial` batches, keeping
/// every session it started.
#[derive(Debug, Default)]
pub struct ScriptedFactory {
    pub initial: u64,
    pub sessions: Mutex<Vec<Arc<CircuitSession>>>,
}

impl ScriptedFactory {
    pub fn with_initial(initial: u64) -> Arc<Self> {
        Arc::new(Self {
            initial,
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn last(&self) -> Arc<CircuitSession> {
        self.sessions.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl CircuitFactory for ScriptedFactory {
    async fn start(&self, session: Arc<CircuitSession>, _location: &CircuitLocation) -> anyhow::Result<bool> {
        let queue = session.add_renderer()?;
        for i in 0..self.initial {
            queue.enqueue(format!("initial-{i}").into_bytes())?;
        }
        self.sessions.lock().unwrap().push(session);
        Ok(true)
    }
}

/// Applier recording every applied batch.
#[derive(Debug, Default, Clone)]
pub struct AppliedLog(pub Arc<Mutex<Vec<(RendererId, BatchId)>>>);

impl AppliedLog {
    pub fn ids(&self, renderer_id: RendererId) -> Vec<BatchId> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| *r == renderer_id)
            .map(|(_, b)| *b)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl BatchApplier for AppliedLog {
    fn apply(&mut self, renderer_id: RendererId, batch: &RenderBatch) -> anyhow::Result<()> {
        self.0.lock().unwrap().push((renderer_id, batch.id));
        Ok(())
    }
}

/// Applier that refuses one batch and applies the rest.
#[derive(Debug)]
pub struct RejectBatch(pub BatchId);

impl BatchApplier for RejectBatch {
    fn apply(&mut self, _renderer_id: RendererId, batch: &RenderBatch) -> anyhow::Result<()> {
        if batch.id == self.0 {
            anyhow::bail!("cannot apply batch {}", batch.id);
        }
        Ok(())
    }
}

/// Attacher that accepts everything.
#[derive(Debug, Default)]
pub struct AcceptAll(pub Vec<(RendererId, ComponentId)>);

impl ComponentAttacher for AcceptAll {
    fn attach(&mut self, renderer_id: RendererId, component_id: ComponentId, _target: &AttachTarget) -> anyhow::Result<()> {
        self.0.push((renderer_id, component_id));
        Ok(())
    }
}

/// Counts client connection transitions.
#[derive(Debug, Default)]
pub struct ConnectionEvents {
    pub ups: AtomicU32,
    pub downs: Mutex<Vec<String>>,
}

impl ConnectionHandler for ConnectionEvents {
    fn on_connection_up(&self) -> anyhow::Result<()> {
        self.ups.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn on_connection_down(&self, reason: &str) -> anyhow::Result<()> {
        self.downs.lock().unwrap().push(reason.to_string());
        Ok(())
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
