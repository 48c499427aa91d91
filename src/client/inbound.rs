//! Inbound render queue: the receiving half of the batch delivery protocol.
//!
//! Batches may arrive out of order, twice, or after they were already
//! applied. The queue buffers them by id and applies them strictly in order,
//! starting at [`BatchId::FIRST`], never applying an id twice.

use std::collections::BTreeMap;

use crate::error::ApplyFailure;
use crate::protocol::{BatchId, RenderBatch, RendererId};

/// Applies batch payloads to the UI.
pub trait BatchApplier: Send {
    /// Apply one batch. Errors fault the renderer stream.
    fn apply(&mut self, renderer_id: RendererId, batch: &RenderBatch) -> anyhow::Result<()>;
}

/// Destination of acknowledgements.
pub trait AckSink: Send + Sync {
    /// Report `batch_id` as applied (`error == None`) or failed.
    fn acknowledge(&self, renderer_id: RendererId, batch_id: BatchId, error: Option<String>);
}

/// Result of [`InboundRenderQueue::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferStatus {
    /// Applied before; the sender missed the acknowledgement.
    AlreadyApplied,
    /// Already waiting in the buffer.
    AlreadyBuffered,
    /// Buffered for application.
    Accepted,
}

/// Client-side reordering buffer for one renderer stream.
#[derive(Debug)]
pub struct InboundRenderQueue {
    renderer_id: RendererId,
    next_expected: BatchId,
    buffered: BTreeMap<BatchId, RenderBatch>,
    faulted: Option<ApplyFailure>,
}

impl InboundRenderQueue {
    /// Queue expecting [`BatchId::FIRST`].
    pub fn new(renderer_id: RendererId) -> Self {
        Self {
            renderer_id,
            next_expected: BatchId::FIRST,
            buffered: BTreeMap::new(),
            faulted: None,
        }
    }

    /// Renderer stream this queue serves.
    pub fn renderer_id(&self) -> RendererId {
        self.renderer_id
    }

    /// Next id to apply.
    pub fn next_expected(&self) -> BatchId {
        self.next_expected
    }

    /// Ids waiting for a gap to close.
    pub fn buffered_ids(&self) -> Vec<BatchId> {
        self.buffered.keys().copied().collect()
    }

    /// The failure that stopped this stream, if any.
    pub fn fault(&self) -> Option<&ApplyFailure> {
        self.faulted.as_ref()
    }

    /// Classify and buffer an arriving batch.
    pub fn offer(&mut self, batch: RenderBatch) -> OfferStatus {
        if batch.id < self.next_expected {
            return OfferStatus::AlreadyApplied;
        }
        if self.buffered.contains_key(&batch.id) {
            return OfferStatus::AlreadyBuffered;
        }
        self.buffered.insert(batch.id, batch);
        OfferStatus::Accepted
    }

    /// Apply every batch that is next in line, acknowledging each.
    ///
    /// Stops at the first gap. Returns how many batches were applied. A
    /// failing batch is reported to the sender with its error text and the
    /// stream stops for good.
    pub fn drain_ready<A, S>(&mut self, applier: &mut A, acks: &S) -> Result<usize, ApplyFailure>
    where
        A: BatchApplier + ?Sized,
        S: AckSink + ?Sized,
    {
        if let Some(failure) = &self.faulted {
            return Err(failure.clone());
        }

        let mut applied = 0;
        while let Some(batch) = self.buffered.remove(&self.next_expected) {
            if let Err(e) = applier.apply(self.renderer_id, &batch) {
                let failure = ApplyFailure {
                    renderer_id: self.renderer_id,
                    batch_id: batch.id,
                    message: format!("{:#}", e),
                };
                log::error!("{}", failure);
                acks.acknowledge(self.renderer_id, batch.id, Some(failure.message.clone()));
                self.buffered.clear();
                self.faulted = Some(failure.clone());
                return Err(failure);
            }
            log::trace!("Renderer {} applied batch {}", self.renderer_id, batch.id);
            acks.acknowledge(self.renderer_id, batch.id, None);
            self.next_expected = self.next_expected.next();
            applied += 1;
        }

        if !self.buffered.is_empty() {
            log::debug!(
                "Renderer {} waiting for batch {} ({} buffered)",
                self.renderer_id,
                self.next_expected,
                self.buffered.len()
            );
        }
        Ok(applied)
    }

    /// Offer `batch`, re-acknowledge it if it was applied before, and drain.
    pub fn receive<A, S>(&mut self, batch: RenderBatch, applier: &mut A, acks: &S) -> Result<OfferStatus, ApplyFailure>
    where
        A: BatchApplier + ?Sized,
        S: AckSink + ?Sized,
    {
        if let Some(failure) = &self.faulted {
            return Err(failure.clone());
        }
        let id = batch.id;
        let status = self.offer(batch);
        match status {
            OfferStatus::AlreadyApplied => {
                log::debug!("Renderer {} re-acknowledging batch {}", self.renderer_id, id);
                acks.acknowledge(self.renderer_id, id, None);
            }
            OfferStatus::AlreadyBuffered => {}
            OfferStatus::Accepted => {
                self.drain_ready(applier, acks)?;
            }
        }
        Ok(status)
    }
}
