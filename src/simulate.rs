//! End-to-end simulation over the loopback transport.
//!
//! Prerenders one circuit, boots a client against the prerendered document,
//! streams batches over a lossy link, severs the connection midway and
//! reconnects. The report states whether the client applied every batch
//! exactly once and in order.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::client::{
    AckDispatcher, AttachTarget, BatchApplier, ComponentAttacher, ReconnectionCoordinator,
    RendererRegistry,
};
use crate::config::Config;
use crate::document::{Document, Element};
use crate::protocol::{BatchId, ComponentId, RenderBatch, RendererId};
use crate::server::prerender::boundary_placeholder;
use crate::server::{CircuitFactory, CircuitLocation, CircuitRegistry, CircuitSession};
use crate::transport::loopback::LoopbackConnector;

const LOCATION: &str = "http://localhost/counter";
const BASE: &str = "http://localhost/";

/// Knobs of one simulation run.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Batches produced after the first render.
    pub batches: u64,
    /// Probability that a single message is lost.
    pub drop_rate: f64,
    /// Sever the connection after this many batches.
    pub disconnect_after: Option<u64>,
    /// Pause between produced batches.
    pub interval: Duration,
    /// How long to wait for the stream to settle.
    pub settle_timeout: Duration,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            batches: 20,
            drop_rate: 0.1,
            disconnect_after: Some(10),
            interval: Duration::from_millis(5),
            settle_timeout: Duration::from_secs(30),
        }
    }
}

/// What happened during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationReport {
    /// Batches handed to the outbound queue.
    pub enqueued: u64,
    /// Batch ids the client applied, in application order.
    pub applied: Vec<BatchId>,
    /// Batches the server still waits on.
    pub outstanding: usize,
    /// Reconnect attempts used after the severed connection.
    pub reconnect_attempts: u32,
    /// Acknowledgements the client gave up on.
    pub acks_exhausted: u64,
    /// Whether the circuit was torn down by a fatal error.
    pub circuit_failed: bool,
}

impl SimulationReport {
    /// Every batch applied once, in order, starting at the first id.
    pub fn is_exactly_once(&self) -> bool {
        let expected: Vec<BatchId> = (0..self.enqueued).map(|i| BatchId(BatchId::FIRST.0 + i)).collect();
        self.applied == expected
    }
}

/// Opens one renderer per circuit; the prerendered markup is its first render.
struct SingleRenderer;

#[async_trait]
impl CircuitFactory for SingleRenderer {
    async fn start(&self, session: Arc<CircuitSession>, _location: &CircuitLocation) -> Result<bool> {
        session.add_renderer()?;
        Ok(true)
    }
}

struct Recorder(Arc<Mutex<Vec<BatchId>>>);

impl BatchApplier for Recorder {
    fn apply(&mut self, _renderer_id: RendererId, batch: &RenderBatch) -> Result<()> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch.id);
        Ok(())
    }
}

struct Attached(usize);

impl ComponentAttacher for Attached {
    fn attach(&mut self, renderer_id: RendererId, component_id: ComponentId, _target: &AttachTarget) -> Result<()> {
        log::debug!("Attached component {} of renderer {}", component_id, renderer_id);
        self.0 += 1;
        Ok(())
    }
}

/// Run one simulation.
pub async fn run(config: &Config, options: &SimulationOptions) -> Result<SimulationReport> {
    let registry = CircuitRegistry::new(config, Arc::new(SingleRenderer));
    let location = CircuitLocation::new(LOCATION, BASE).context("Invalid simulation location")?;
    let session = registry
        .prerender(location)
        .await
        .context("Prerender produced nothing")?;
    let Some(renderer_id) = session.renderer_ids().first().copied() else {
        bail!("Prerendered circuit has no renderer");
    };
    let queue = session
        .renderer(renderer_id)
        .context("Renderer disappeared")?;

    let document = Document::new(vec![Element::new("body")
        .with_children(boundary_placeholder(
            session.id(),
            renderer_id,
            ComponentId(0),
            vec![Element::new("p").into()],
        )?)
        .into()]);

    let applied = Arc::new(Mutex::new(Vec::new()));
    let renderers = Arc::new(RendererRegistry::new(Box::new(Recorder(Arc::clone(&applied)))));
    let acks = AckDispatcher::new(config.acks());
    let connector = Arc::new(LoopbackConnector::with_drop_rate(registry.clone(), options.drop_rate));
    let coordinator = ReconnectionCoordinator::new(
        Arc::clone(&connector) as Arc<dyn crate::client::Connector>,
        renderers,
        acks.clone(),
        config.reconnect(),
    );

    let mut attacher = Attached(0);
    coordinator
        .boot(&document, LOCATION, BASE, &mut attacher)
        .await
        .context("Client boot failed")?;
    log::info!("Client attached {} components", attacher.0);

    let mut enqueued = 0;
    let mut reconnect_attempts = 0;
    for i in 0..options.batches {
        if options.disconnect_after == Some(i) {
            log::info!("Severing {} connection(s)", connector.sever_all());
        }
        match queue.enqueue(format!("batch-{}", i).into_bytes()) {
            Ok(_) => enqueued += 1,
            Err(e) => {
                log::warn!("Producer stopped: {}", e);
                break;
            }
        }
        tokio::time::sleep(options.interval).await;
    }
    if options.disconnect_after.is_some_and(|n| n < options.batches) {
        reconnect_attempts = coordinator
            .reconnect_with_backoff()
            .await
            .context("Client could not reconnect")?;
    }

    let settled = tokio::time::timeout(options.settle_timeout, async {
        while queue.outstanding_count() > 0 && !session.is_disposed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if settled.is_err() {
        log::warn!("Stream did not settle within {:?}", options.settle_timeout);
    }

    let applied = applied.lock().unwrap_or_else(PoisonError::into_inner).clone();
    Ok(SimulationReport {
        enqueued,
        applied,
        outstanding: queue.outstanding_count(),
        reconnect_attempts,
        acks_exhausted: acks.exhausted(),
        circuit_failed: session.is_disposed(),
    })
}
