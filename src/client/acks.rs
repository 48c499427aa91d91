//! Fire-and-forget acknowledgement delivery.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::task::JoinHandle;

use crate::client::inbound::AckSink;
use crate::client::ServerConnection;
use crate::config::AckSettings;
use crate::error::TransportError;
use crate::protocol::{BatchId, RendererId};

struct Inner {
    connection: RwLock<Option<Arc<dyn ServerConnection>>>,
    settings: AckSettings,
    exhausted: AtomicU64,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn current(&self) -> Option<Arc<dyn ServerConnection>> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deliver on `bound`, the connection the batch arrived on, or on
    /// whatever connection is current when none was.
    async fn deliver(
        &self,
        bound: Option<Arc<dyn ServerConnection>>,
        renderer_id: RendererId,
        batch_id: BatchId,
        error: Option<String>,
    ) {
        for attempt in 1..=self.settings.max_attempts {
            let result = match bound.clone().or_else(|| self.current()) {
                Some(connection) => {
                    connection
                        .render_completed(renderer_id, batch_id, error.clone())
                        .await
                }
                None => Err(TransportError::Offline),
            };
            match result {
                Ok(()) => return,
                Err(e) if attempt < self.settings.max_attempts => {
                    log::debug!(
                        "Ack for renderer {} batch {} failed (attempt {}): {}",
                        renderer_id,
                        batch_id,
                        attempt,
                        e
                    );
                    tokio::time::sleep(self.settings.retry_interval).await;
                }
                Err(e) => {
                    let total = self.exhausted.fetch_add(1, Ordering::Relaxed) + 1;
                    log::warn!(
                        "Giving up on ack for renderer {} batch {} after {} attempts ({} given up so far): {}",
                        renderer_id,
                        batch_id,
                        attempt,
                        total,
                        e
                    );
                }
            }
        }
    }
}

/// Sends acknowledgements on the current connection, retrying a bounded
/// number of times in the background.
///
/// A lost acknowledgement is harmless: the server retransmits the batch and
/// the inbound queue re-acknowledges it.
#[derive(Clone)]
pub struct AckDispatcher {
    inner: Arc<Inner>,
}

impl fmt::Debug for AckDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckDispatcher")
            .field("settings", &self.inner.settings)
            .field("exhausted", &self.exhausted())
            .finish_non_exhaustive()
    }
}

impl AckDispatcher {
    /// Dispatcher with no connection yet.
    pub fn new(settings: AckSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                connection: RwLock::new(None),
                settings,
                exhausted: AtomicU64::new(0),
                in_flight: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Route future acknowledgements to `connection`.
    pub fn set_connection(&self, connection: Option<Arc<dyn ServerConnection>>) {
        *self
            .inner
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = connection;
    }

    /// Acknowledgements abandoned after exhausting their attempts.
    pub fn exhausted(&self) -> u64 {
        self.inner.exhausted.load(Ordering::Relaxed)
    }

    /// Wait until every acknowledgement issued so far has been delivered or
    /// given up on.
    pub async fn flush(&self) {
        let pending: Vec<_> = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in pending {
            if let Err(e) = task.await {
                log::debug!("Ack task ended abnormally: {}", e);
            }
        }
    }
}

impl AckSink for AckDispatcher {
    fn acknowledge(&self, renderer_id: RendererId, batch_id: BatchId, error: Option<String>) {
        let inner = Arc::clone(&self.inner);
        let bound = inner.current();
        let task = tokio::spawn(async move {
            inner.deliver(bound, renderer_id, batch_id, error).await;
        });
        let mut in_flight = self.inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.retain(|t| !t.is_finished());
        in_flight.push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CircuitId;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Flaky {
        failures_left: Mutex<u32>,
        delivered: Mutex<Vec<BatchId>>,
    }

    #[async_trait]
    impl ServerConnection for Flaky {
        fn connection_id(&self) -> &str {
            "flaky"
        }

        async fn render_completed(
            &self,
            _renderer_id: RendererId,
            batch_id: BatchId,
            _error: Option<String>,
        ) -> Result<(), TransportError> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(TransportError::Send("flaky".into()));
            }
            self.delivered.lock().unwrap().push(batch_id);
            Ok(())
        }

        async fn start_circuit(&self, _: &str, _: &str) -> anyhow::Result<Option<CircuitId>> {
            Ok(None)
        }

        async fn connect_circuit(&self, _: &CircuitId) -> anyhow::Result<bool> {
            Ok(false)
        }

        async fn stop(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_delivered() {
        let flaky = Arc::new(Flaky {
            failures_left: Mutex::new(2),
            ..Flaky::default()
        });
        let acks = AckDispatcher::new(AckSettings::default());
        acks.set_connection(Some(flaky.clone()));

        acks.acknowledge(RendererId(1), BatchId(2), None);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(*flaky.delivered.lock().unwrap(), vec![BatchId(2)]);
        assert_eq!(acks.exhausted(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_counted() {
        let flaky = Arc::new(Flaky {
            failures_left: Mutex::new(10),
            ..Flaky::default()
        });
        let acks = AckDispatcher::new(AckSettings::default());
        acks.set_connection(Some(flaky.clone()));

        acks.acknowledge(RendererId(1), BatchId(2), None);
        acks.acknowledge(RendererId(1), BatchId(3), None);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(flaky.delivered.lock().unwrap().is_empty());
        assert_eq!(acks.exhausted(), 2);
        assert_eq!(*flaky.failures_left.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_ack_stays_on_connection_it_was_issued_for() {
        let first = Arc::new(Flaky::default());
        let acks = AckDispatcher::new(AckSettings::default());
        acks.set_connection(Some(first.clone()));

        acks.acknowledge(RendererId(1), BatchId(2), Some("broken".into()));
        acks.set_connection(None);
        acks.flush().await;

        assert_eq!(*first.delivered.lock().unwrap(), vec![BatchId(2)]);
        assert_eq!(acks.exhausted(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_connection_counts_as_failure() {
        let acks = AckDispatcher::new(AckSettings::default());
        acks.acknowledge(RendererId(1), BatchId(2), None);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(acks.exhausted(), 1);
    }
}
