//! Page-lifetime set of inbound render queues.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::client::inbound::{AckSink, BatchApplier, InboundRenderQueue, OfferStatus};
use crate::error::ApplyFailure;
use crate::protocol::{BatchId, RenderBatch, ServerMessage, RendererId};

struct State {
    queues: BTreeMap<RendererId, InboundRenderQueue>,
    applier: Box<dyn BatchApplier>,
}

/// All renderer streams the page receives, plus the applier they feed.
///
/// One mutex serializes offers and applications across renderers.
pub struct RendererRegistry {
    state: Mutex<State>,
}

impl fmt::Debug for RendererRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendererRegistry")
            .field("renderers", &self.renderer_ids())
            .finish_non_exhaustive()
    }
}

impl RendererRegistry {
    /// Registry feeding `applier`.
    pub fn new(applier: Box<dyn BatchApplier>) -> Self {
        Self {
            state: Mutex::new(State {
                queues: BTreeMap::new(),
                applier,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make sure a queue exists for `renderer_id`.
    pub fn attach(&self, renderer_id: RendererId) {
        self.lock()
            .queues
            .entry(renderer_id)
            .or_insert_with(|| InboundRenderQueue::new(renderer_id));
    }

    /// Feed a server push into its renderer's queue.
    pub fn receive<S>(&self, message: ServerMessage, acks: &S) -> Result<OfferStatus, ApplyFailure>
    where
        S: AckSink + ?Sized,
    {
        let ServerMessage::RenderBatch {
            renderer_id,
            batch_id,
            payload,
        } = message;

        let mut state = self.lock();
        let State { queues, applier } = &mut *state;
        let queue = queues
            .entry(renderer_id)
            .or_insert_with(|| InboundRenderQueue::new(renderer_id));
        queue.receive(RenderBatch::new(batch_id, payload), applier.as_mut(), acks)
    }

    /// Next id renderer `renderer_id` will apply.
    pub fn next_expected(&self, renderer_id: RendererId) -> Option<BatchId> {
        self.lock().queues.get(&renderer_id).map(InboundRenderQueue::next_expected)
    }

    /// Known renderers.
    pub fn renderer_ids(&self) -> Vec<RendererId> {
        self.lock().queues.keys().copied().collect()
    }

    /// First failure among all renderers, if any stream faulted.
    pub fn fault(&self) -> Option<ApplyFailure> {
        self.lock().queues.values().find_map(|q| q.fault().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct Log(Arc<Mutex<Vec<(RendererId, BatchId)>>>);

    impl BatchApplier for Log {
        fn apply(&mut self, renderer_id: RendererId, batch: &RenderBatch) -> anyhow::Result<()> {
            self.0.lock().unwrap().push((renderer_id, batch.id));
            Ok(())
        }
    }

    struct NoAcks;

    impl AckSink for NoAcks {
        fn acknowledge(&self, _: RendererId, _: BatchId, _: Option<String>) {}
    }

    fn push(renderer: u64, batch: u64) -> ServerMessage {
        ServerMessage::render_batch(RendererId(renderer), &RenderBatch::new(BatchId(batch), vec![]))
    }

    #[test]
    fn test_streams_are_ordered_independently() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let registry = RendererRegistry::new(Box::new(Log(Arc::clone(&applied))));

        registry.receive(push(7, 3), &NoAcks).unwrap();
        registry.receive(push(8, 2), &NoAcks).unwrap();
        registry.receive(push(7, 2), &NoAcks).unwrap();

        assert_eq!(
            *applied.lock().unwrap(),
            vec![
                (RendererId(8), BatchId(2)),
                (RendererId(7), BatchId(2)),
                (RendererId(7), BatchId(3)),
            ]
        );
        assert_eq!(registry.next_expected(RendererId(7)), Some(BatchId(4)));
        assert_eq!(registry.renderer_ids(), vec![RendererId(7), RendererId(8)]);
        assert!(registry.fault().is_none());
    }

    #[test]
    fn test_attach_precreates_queue() {
        let registry = RendererRegistry::new(Box::new(Log::default()));
        registry.attach(RendererId(3));
        assert_eq!(registry.next_expected(RendererId(3)), Some(BatchId::FIRST));
    }
}
