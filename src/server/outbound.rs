//! Outbound render queue: the sending half of the batch delivery protocol.
//!
//! Assigns batch ids, transmits through the circuit's [`TransportProxy`],
//! and keeps every batch outstanding until the client acknowledges it.
//!
//! ```text
//! enqueue ──> [Pending 2][Pending 3][Pending 4] ──send──> TransportProxy
//!                  ▲                                          │
//!                  └──────────── acknowledge(id) <────────────┘
//! ```
//!
//! Each outstanding batch has at most one delivery task. The task awaits the
//! transport's completion future, then either the acknowledgement or a
//! timeout, and retransmits up to the attempt ceiling. A delivery task whose
//! connection went away parks quietly; [`OutboundRenderQueue::resume`]
//! replaces it with a fresh one on the new connection.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::DeliverySettings;
use crate::error::CircuitError;
use crate::protocol::{BatchId, RenderBatch, RendererId, ServerMessage};
use crate::transport::{Generation, SendFuture, Transport, TransportProxy};

/// Callback receiving errors that are fatal for the circuit.
pub type ErrorSink = Arc<dyn Fn(CircuitError) + Send + Sync>;

/// Result of [`OutboundRenderQueue::acknowledge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The batch was outstanding and is now retired.
    Retired,
    /// Duplicate or stale acknowledgement; nothing changed.
    Ignored,
}

/// A batch the client has not acknowledged yet.
struct PendingSend {
    batch: RenderBatch,
    attempts: u32,
    acked: Arc<Notify>,
    delivery: Option<JoinHandle<()>>,
}

impl PendingSend {
    fn new(batch: RenderBatch) -> Self {
        Self {
            batch,
            attempts: 0,
            acked: Arc::new(Notify::new()),
            delivery: None,
        }
    }

    fn cancel_delivery(&mut self) {
        if let Some(task) = self.delivery.take() {
            task.abort();
        }
    }
}

/// Mutable queue state, guarded by the queue's mutex.
pub(crate) struct QueueState {
    next_batch_id: BatchId,
    pending: BTreeMap<BatchId, PendingSend>,
    disposed: bool,
}

/// What a delivery task should do after a failed or unacknowledged attempt.
enum Retransmit {
    Sent(SendFuture),
    /// Acknowledged or disposed meanwhile.
    Settled,
    /// The connection is gone; wait for resume.
    Parked,
    Exhausted(CircuitError),
}

/// Server-side queue for one renderer stream of a circuit.
pub struct OutboundRenderQueue {
    renderer_id: RendererId,
    transport: Arc<TransportProxy>,
    settings: DeliverySettings,
    state: Mutex<QueueState>,
    on_error: ErrorSink,
}

impl fmt::Debug for OutboundRenderQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundRenderQueue")
            .field("renderer_id", &self.renderer_id)
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

impl OutboundRenderQueue {
    /// Create a queue sending through `transport`.
    ///
    /// `on_error` receives retry exhaustion and client render failures.
    pub fn new(
        renderer_id: RendererId,
        transport: Arc<TransportProxy>,
        settings: DeliverySettings,
        on_error: ErrorSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            renderer_id,
            transport,
            settings,
            state: Mutex::new(QueueState {
                next_batch_id: BatchId::FIRST,
                pending: BTreeMap::new(),
                disposed: false,
            }),
            on_error,
        })
    }

    /// Renderer stream this queue serves.
    pub fn renderer_id(&self) -> RendererId {
        self.renderer_id
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign the next batch id to `payload` and start delivering it.
    ///
    /// Never blocks. While the transport is offline the batch is only
    /// buffered. Fails once the queue has been disposed.
    pub fn enqueue(self: &Arc<Self>, payload: impl Into<Bytes>) -> Result<BatchId, CircuitError> {
        let mut state = self.lock_state();
        if state.disposed {
            return Err(CircuitError::Transport(crate::error::TransportError::Closed));
        }

        let id = state.next_batch_id;
        state.next_batch_id = id.next();

        let mut pending = PendingSend::new(RenderBatch::new(id, payload));
        log::trace!(
            "Renderer {} assigned batch {} ({} bytes)",
            self.renderer_id,
            id,
            pending.batch.payload.len()
        );
        self.start_delivery(&mut pending);
        state.pending.insert(id, pending);
        Ok(id)
    }

    /// Retire the outstanding batch `batch_id`.
    ///
    /// Unknown ids (duplicates, stale acks) are ignored. A reported client
    /// error does not cause a resend; it is surfaced on the circuit.
    pub fn acknowledge(&self, batch_id: BatchId, error: Option<String>) -> AckOutcome {
        let outcome = {
            let mut state = self.lock_state();
            match state.pending.remove(&batch_id) {
                Some(mut pending) => {
                    pending.cancel_delivery();
                    pending.acked.notify_one();
                    log::debug!(
                        "Renderer {} batch {} acknowledged, {} outstanding",
                        self.renderer_id,
                        batch_id,
                        state.pending.len()
                    );
                    AckOutcome::Retired
                }
                None => {
                    log::debug!(
                        "Ignoring stale acknowledgement for renderer {} batch {}",
                        self.renderer_id,
                        batch_id
                    );
                    AckOutcome::Ignored
                }
            }
        };

        if let Some(message) = error {
            let error = CircuitError::ClientRenderFailed {
                renderer_id: self.renderer_id,
                batch_id,
                message,
            };
            log::error!("{}", error);
            (self.on_error)(error);
        }

        outcome
    }

    /// Move the queue onto a new connection and replay everything outstanding.
    ///
    /// Batches are re-sent in id order, on the new connection only.
    pub fn resume(self: &Arc<Self>, handle: Arc<dyn Transport>, connection_id: &str) -> Generation {
        let mut state = self.lock_state();
        let generation = self.transport.transfer(handle, connection_id);
        self.resend_locked(&mut state);
        generation
    }

    /// Replay all outstanding batches on the proxy's current connection.
    ///
    /// The caller holds the state lock, which keeps `enqueue` from slipping a
    /// newer batch onto the wire ahead of the replay.
    pub(crate) fn resend_locked(self: &Arc<Self>, state: &mut QueueState) {
        if state.disposed {
            return;
        }
        if !state.pending.is_empty() {
            log::info!(
                "Renderer {} replaying {} outstanding batches",
                self.renderer_id,
                state.pending.len()
            );
        }
        for pending in state.pending.values_mut() {
            pending.cancel_delivery();
            pending.attempts = 0;
            self.start_delivery(pending);
        }
    }

    /// Drop every outstanding batch and cancel all delivery work.
    pub fn dispose(&self) {
        let mut state = self.lock_state();
        state.disposed = true;
        for pending in state.pending.values_mut() {
            pending.cancel_delivery();
        }
        state.pending.clear();
    }

    /// Ids still awaiting acknowledgement, in increasing order.
    pub fn outstanding(&self) -> Vec<BatchId> {
        self.lock_state().pending.keys().copied().collect()
    }

    /// Number of batches awaiting acknowledgement.
    pub fn outstanding_count(&self) -> usize {
        self.lock_state().pending.len()
    }

    /// Transmissions made for `batch_id` on the current connection.
    pub fn attempts(&self, batch_id: BatchId) -> Option<u32> {
        self.lock_state().pending.get(&batch_id).map(|p| p.attempts)
    }

    /// Id the next enqueued batch will get.
    pub fn next_batch_id(&self) -> BatchId {
        self.lock_state().next_batch_id
    }

    fn message(&self, batch: &RenderBatch) -> ServerMessage {
        ServerMessage::render_batch(self.renderer_id, batch)
    }

    /// Issue the first transmission of `pending` and spawn its delivery task.
    fn start_delivery(self: &Arc<Self>, pending: &mut PendingSend) {
        let (generation, in_flight) = match self.transport.send(self.message(&pending.batch), None) {
            Ok(sent) => sent,
            Err(err) => {
                log::debug!(
                    "Renderer {} buffering batch {} ({})",
                    self.renderer_id,
                    pending.batch.id,
                    err
                );
                return;
            }
        };
        pending.attempts += 1;
        log::debug!(
            "Renderer {} sent batch {} (attempt {})",
            self.renderer_id,
            pending.batch.id,
            pending.attempts
        );

        let queue = Arc::clone(self);
        let batch_id = pending.batch.id;
        let acked = Arc::clone(&pending.acked);
        pending.delivery = Some(tokio::spawn(async move {
            queue.deliver(batch_id, generation, acked, in_flight).await;
        }));
    }

    async fn deliver(
        self: Arc<Self>,
        batch_id: BatchId,
        generation: Generation,
        acked: Arc<Notify>,
        mut in_flight: SendFuture,
    ) {
        loop {
            match in_flight.await {
                Ok(()) => {
                    if tokio::time::timeout(self.settings.ack_timeout, acked.notified())
                        .await
                        .is_ok()
                    {
                        return;
                    }
                    log::warn!(
                        "No acknowledgement for renderer {} batch {} within {:?}",
                        self.renderer_id,
                        batch_id,
                        self.settings.ack_timeout
                    );
                }
                Err(err) => {
                    if !self.transport.is_current(generation) {
                        log::debug!(
                            "Send of renderer {} batch {} failed on a closed connection ({}), awaiting resume",
                            self.renderer_id,
                            batch_id,
                            err
                        );
                        return;
                    }
                    log::warn!(
                        "Transient send failure for renderer {} batch {}: {}",
                        self.renderer_id,
                        batch_id,
                        err
                    );
                    tokio::time::sleep(self.settings.retry_interval).await;
                }
            }

            match self.retransmit(batch_id, generation) {
                Retransmit::Sent(next) => in_flight = next,
                Retransmit::Settled | Retransmit::Parked => return,
                Retransmit::Exhausted(error) => {
                    log::error!("{}", error);
                    (self.on_error)(error);
                    return;
                }
            }
        }
    }

    fn retransmit(&self, batch_id: BatchId, generation: Generation) -> Retransmit {
        let mut state = self.lock_state();
        if state.disposed {
            return Retransmit::Settled;
        }
        let Some(pending) = state.pending.get_mut(&batch_id) else {
            return Retransmit::Settled;
        };
        if !self.transport.is_current(generation) {
            log::debug!(
                "Parking renderer {} batch {} until resume",
                self.renderer_id,
                batch_id
            );
            return Retransmit::Parked;
        }

        if pending.attempts >= self.settings.max_send_attempts {
            let attempts = pending.attempts;
            state.pending.remove(&batch_id);
            return Retransmit::Exhausted(CircuitError::RetryCeilingExceeded {
                renderer_id: self.renderer_id,
                batch_id,
                attempts,
            });
        }

        let message = self.message(&pending.batch);
        match self.transport.send(message, Some(generation)) {
            Ok((_, in_flight)) => {
                pending.attempts += 1;
                log::info!(
                    "Retransmitting renderer {} batch {} (attempt {})",
                    self.renderer_id,
                    batch_id,
                    pending.attempts
                );
                Retransmit::Sent(in_flight)
            }
            Err(err) => {
                log::debug!(
                    "Parking renderer {} batch {} until resume ({})",
                    self.renderer_id,
                    batch_id,
                    err
                );
                Retransmit::Parked
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[derive(Debug, Default)]
    struct Recorder {
        sent: Mutex<Vec<BatchId>>,
    }

    impl Transport for Recorder {
        fn send(&self, message: ServerMessage) -> SendFuture {
            let ServerMessage::RenderBatch { batch_id, .. } = message;
            self.sent.lock().unwrap().push(batch_id);
            Box::pin(async { Ok(()) })
        }
    }

    fn queue(transport: Arc<TransportProxy>) -> (Arc<OutboundRenderQueue>, Arc<Mutex<Vec<CircuitError>>>) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let queue = OutboundRenderQueue::new(
            RendererId(1),
            transport,
            DeliverySettings::default(),
            Arc::new(move |e| sink.lock().unwrap().push(e)),
        );
        (queue, errors)
    }

    #[tokio::test]
    async fn test_ids_are_assigned_from_two() {
        let (queue, _) = queue(Arc::new(TransportProxy::offline()));
        assert_eq!(queue.enqueue(b"a".to_vec()).unwrap(), BatchId(2));
        assert_eq!(queue.enqueue(b"b".to_vec()).unwrap(), BatchId(3));
        assert_eq!(queue.next_batch_id(), BatchId(4));
        assert_eq!(queue.outstanding(), vec![BatchId(2), BatchId(3)]);
        assert_eq!(queue.attempts(BatchId(2)), Some(0));
    }

    #[tokio::test]
    async fn test_acknowledge_twice_is_noop() {
        let recorder = Arc::new(Recorder::default());
        let (queue, errors) = queue(Arc::new(TransportProxy::connected(recorder.clone(), "c1")));
        let id = queue.enqueue(b"a".to_vec()).unwrap();

        assert_eq!(queue.acknowledge(id, None), AckOutcome::Retired);
        assert_eq!(queue.acknowledge(id, None), AckOutcome::Ignored);
        assert_eq!(queue.acknowledge(BatchId(99), None), AckOutcome::Ignored);
        assert_eq!(queue.outstanding_count(), 0);
        assert!(errors.lock().unwrap().is_empty());
        assert_eq!(*recorder.sent.lock().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_acknowledge_with_error_surfaces_and_retires() {
        let (queue, errors) = queue(Arc::new(TransportProxy::offline()));
        let id = queue.enqueue(b"a".to_vec()).unwrap();

        assert_eq!(queue.acknowledge(id, Some("boom".into())), AckOutcome::Retired);
        assert_eq!(queue.outstanding_count(), 0);
        assert_eq!(
            *errors.lock().unwrap(),
            vec![CircuitError::ClientRenderFailed {
                renderer_id: RendererId(1),
                batch_id: id,
                message: "boom".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_enqueue_after_dispose_fails() {
        let (queue, _) = queue(Arc::new(TransportProxy::offline()));
        queue.enqueue(b"a".to_vec()).unwrap();
        queue.dispose();
        assert_eq!(queue.outstanding_count(), 0);
        assert_eq!(
            queue.enqueue(b"b".to_vec()),
            Err(CircuitError::Transport(TransportError::Closed))
        );
    }
}
