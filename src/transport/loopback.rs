//! In-process transport wiring a client straight into a [`CircuitRegistry`].
//!
//! Each [`LoopbackConnector::connect`] creates one link. Server pushes travel
//! over an unbounded channel and may be dropped at a configurable rate, which
//! is enough to exercise retransmission, deduplication and resume without a
//! network.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::client::{Connection, Connector, ServerConnection};
use crate::error::TransportError;
use crate::protocol::{BatchId, CircuitId, ClientMessage, RendererId, ServerMessage, ServerReply};
use crate::server::CircuitRegistry;
use crate::transport::{SendFuture, Transport};

#[derive(Debug)]
struct Link {
    id: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<ServerMessage>>>,
    drop_rate: f64,
    closed: AtomicBool,
}

impl Link {
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lose(&self) -> bool {
        self.drop_rate > 0.0 && rand::random::<f64>() < self.drop_rate
    }
}

/// Server end of a loopback link.
#[derive(Debug)]
pub struct LoopbackTransport {
    link: Arc<Link>,
}

impl Transport for LoopbackTransport {
    fn send(&self, message: ServerMessage) -> SendFuture {
        let result = if self.link.is_closed() {
            Err(TransportError::Closed)
        } else if self.link.lose() {
            log::trace!("Loopback {} lost {:?}", self.link.id, message);
            Ok(())
        } else {
            match self
                .link
                .outbound
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
            {
                Some(tx) => tx.send(message).map_err(|_closed| TransportError::Closed),
                None => Err(TransportError::Closed),
            }
        };
        Box::pin(async move { result })
    }
}

/// Client end of a loopback link.
#[derive(Debug)]
pub struct LoopbackConnection {
    link: Arc<Link>,
    transport: Arc<dyn Transport>,
    registry: CircuitRegistry,
}

impl LoopbackConnection {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.link.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn request(&self, message: ClientMessage) -> anyhow::Result<ServerReply> {
        self.ensure_open()?;
        Ok(self
            .registry
            .dispatch(Arc::clone(&self.transport), &self.link.id, message)
            .await)
    }
}

#[async_trait]
impl ServerConnection for LoopbackConnection {
    fn connection_id(&self) -> &str {
        &self.link.id
    }

    async fn render_completed(
        &self,
        renderer_id: RendererId,
        batch_id: BatchId,
        error: Option<String>,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.link.lose() {
            log::trace!("Loopback {} lost ack for batch {}", self.link.id, batch_id);
            return Ok(());
        }
        self.registry
            .render_completed(&self.link.id, renderer_id, batch_id, error);
        Ok(())
    }

    async fn start_circuit(&self, location_uri: &str, base_uri: &str) -> anyhow::Result<Option<CircuitId>> {
        let reply = self
            .request(ClientMessage::StartCircuit {
                location_uri: location_uri.to_string(),
                base_uri: base_uri.to_string(),
            })
            .await?;
        match reply {
            ServerReply::CircuitStarted(id) => Ok(id),
            other => bail!("unexpected reply to start_circuit: {:?}", other),
        }
    }

    async fn connect_circuit(&self, circuit_id: &CircuitId) -> anyhow::Result<bool> {
        let reply = self
            .request(ClientMessage::ConnectCircuit {
                circuit_id: circuit_id.clone(),
            })
            .await?;
        match reply {
            ServerReply::CircuitConnected(ok) => Ok(ok),
            other => bail!("unexpected reply to connect_circuit: {:?}", other),
        }
    }

    async fn stop(&self) {
        if self.link.close() {
            log::debug!("Loopback {} stopped by client", self.link.id);
            self.registry.connection_closed(&self.link.id);
        }
    }
}

/// Opens loopback links into a registry.
#[derive(Debug)]
pub struct LoopbackConnector {
    registry: CircuitRegistry,
    drop_rate: f64,
    accepting: AtomicBool,
    next_id: AtomicU64,
    links: Mutex<Vec<Weak<Link>>>,
}

impl LoopbackConnector {
    /// Lossless connector.
    pub fn new(registry: CircuitRegistry) -> Self {
        Self::with_drop_rate(registry, 0.0)
    }

    /// Connector whose links lose each message with probability `drop_rate`.
    pub fn with_drop_rate(registry: CircuitRegistry, drop_rate: f64) -> Self {
        Self {
            registry,
            drop_rate: drop_rate.clamp(0.0, 1.0),
            accepting: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            links: Mutex::new(Vec::new()),
        }
    }

    /// Refuse (or accept again) new connections.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Release);
    }

    /// Simulate a network drop: close every open link from the server side.
    ///
    /// Returns the number of links severed.
    pub fn sever_all(&self) -> usize {
        let links: Vec<_> = {
            let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
            links.retain(|l| l.strong_count() > 0);
            links.iter().filter_map(Weak::upgrade).collect()
        };
        let mut severed = 0;
        for link in links {
            if link.close() {
                log::debug!("Loopback {} severed", link.id);
                self.registry.connection_closed(&link.id);
                severed += 1;
            }
        }
        severed
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> anyhow::Result<Connection> {
        if !self.accepting.load(Ordering::Acquire) {
            bail!("loopback connector is not accepting connections");
        }
        let (tx, incoming) = mpsc::unbounded_channel();
        let link = Arc::new(Link {
            id: format!("loopback-{}", self.next_id.fetch_add(1, Ordering::Relaxed)),
            outbound: Mutex::new(Some(tx)),
            drop_rate: self.drop_rate,
            closed: AtomicBool::new(false),
        });
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&link));
        log::debug!("Loopback {} opened", link.id);

        let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport {
            link: Arc::clone(&link),
        });
        Ok(Connection {
            handle: Arc::new(LoopbackConnection {
                link,
                transport,
                registry: self.registry.clone(),
            }),
            incoming,
        })
    }
}
