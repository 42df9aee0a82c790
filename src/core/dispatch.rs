//! Dispatch engine
//!
//! Resolves a target to live connections and hands the envelope to each
//! connection's own delivery worker. One worker per connection keeps delivery
//! FIFO per recipient while recipients progress independently; a shared
//! semaphore bounds how many transport calls are in flight at once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use log::{debug, trace, warn};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::HubConfig;
use crate::core::connection::{
    Connection, ConnectionId, DeliveryOutcome, Outbound, OutboundReceiver,
};
use crate::core::envelope::{Envelope, Target};
use crate::core::registry::ConnectionRegistry;
use crate::core::transport::Transport;
use crate::error::{HubError, Result};

/// Outcome of one `send`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Live connections the target resolved to
    pub resolved: usize,
    pub delivered: usize,
    pub failed: usize,
    pub duration: Duration,
}

impl DispatchReport {
    pub fn success_rate(&self) -> f64 {
        if self.resolved == 0 {
            1.0
        } else {
            self.delivered as f64 / self.resolved as f64
        }
    }
}

/// Fans envelopes out to resolved connections
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    transport: Arc<dyn Transport>,
    delivery_timeout: Duration,
    eviction_threshold: u32,
    permits: Arc<Semaphore>,
    evictions: mpsc::UnboundedSender<ConnectionId>,
}

impl Dispatcher {
    /// Create a dispatcher; connections crossing the failure threshold are
    /// reported on `evictions` for the lifecycle coordinator to tear down.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        transport: Arc<dyn Transport>,
        config: &HubConfig,
        evictions: mpsc::UnboundedSender<ConnectionId>,
    ) -> Self {
        Self {
            registry,
            transport,
            delivery_timeout: config.delivery_timeout,
            eviction_threshold: config.eviction_threshold.max(1),
            permits: Arc::new(Semaphore::new(config.max_concurrent_deliveries.max(1))),
            evictions,
        }
    }

    /// Resolve a target to the live connections it currently names
    pub fn resolve(&self, target: &Target) -> Vec<Arc<Connection>> {
        match target {
            Target::All => self.registry.live_connections(),
            Target::User(user_id) => {
                let connections = self.registry.live_connections_of_user(user_id);
                if connections.is_empty() {
                    debug!("{}", HubError::NoSuchUser(user_id.clone()));
                }
                connections
            }
            Target::Group(group) => self.registry.live_members_of(group),
        }
    }

    /// Deliver an envelope to every connection its target resolves to
    pub async fn send(&self, envelope: Envelope) -> DispatchReport {
        self.send_excluding(envelope, None).await
    }

    /// Like `send`, skipping one connection (used for self-excluding announcements)
    pub async fn send_excluding(
        &self,
        envelope: Envelope,
        exclude: Option<&ConnectionId>,
    ) -> DispatchReport {
        let start = Instant::now();
        let recipients: Vec<Arc<Connection>> = self
            .resolve(&envelope.target)
            .into_iter()
            .filter(|connection| Some(connection.id()) != exclude)
            .collect();

        let mut report = DispatchReport {
            resolved: recipients.len(),
            ..DispatchReport::default()
        };
        if recipients.is_empty() {
            report.duration = start.elapsed();
            return report;
        }

        let envelope = Arc::new(envelope);
        let mut pending = Vec::with_capacity(recipients.len());

        for connection in &recipients {
            let (ack, outcome) = oneshot::channel();
            let item = Outbound {
                envelope: Arc::clone(&envelope),
                ack,
            };
            match connection.try_enqueue(item) {
                Ok(()) => pending.push(outcome),
                Err(e) => {
                    self.record_outcome(connection, Err(e));
                    report.failed += 1;
                }
            }
        }

        // A dropped ack means the worker was cancelled before the attempt finished.
        for outcome in join_all(pending).await {
            match outcome {
                Ok(DeliveryOutcome::Delivered) => report.delivered += 1,
                Ok(DeliveryOutcome::Failed) | Err(_) => report.failed += 1,
            }
        }

        report.duration = start.elapsed();
        debug!(
            "Dispatched {} to {} connections ({} delivered, {} failed)",
            envelope.target, report.resolved, report.delivered, report.failed
        );
        report
    }

    /// Start the delivery worker that drains one connection's queue in order
    pub(crate) fn spawn_worker(
        &self,
        connection: Arc<Connection>,
        mut queue: OutboundReceiver,
    ) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let cancel = connection.cancel_token();
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    item = queue.recv() => match item {
                        Some(item) => item,
                        None => break,
                    },
                };

                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        trace!("Delivery to {} cancelled", connection.id());
                        break;
                    }
                    result = dispatcher.attempt(&connection, &item.envelope) => result,
                };

                let outcome = if dispatcher.record_outcome(&connection, result) {
                    DeliveryOutcome::Delivered
                } else {
                    DeliveryOutcome::Failed
                };
                // The sender may have stopped waiting; the outcome is already recorded.
                let _ = item.ack.send(outcome);
            }
            trace!("Delivery worker for {} stopped", connection.id());
        })
    }

    async fn attempt(&self, connection: &Connection, envelope: &Envelope) -> Result<()> {
        let delivery = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| HubError::ConnectionClosed)?;
            self.transport.deliver(connection.id(), envelope).await
        };

        match timeout(self.delivery_timeout, delivery).await {
            Ok(result) => result,
            Err(_) => Err(HubError::DeliveryTimeout(connection.id().clone())),
        }
    }

    /// Update the connection's health counter; returns true on success.
    fn record_outcome(&self, connection: &Connection, result: Result<()>) -> bool {
        match result {
            Ok(()) => {
                connection.record_success();
                trace!("Delivered to {}", connection.id());
                true
            }
            Err(e) => {
                let failures = connection.record_failure();
                warn!(
                    "Delivery to {} failed ({}/{}): {}",
                    connection.id(),
                    failures,
                    self.eviction_threshold,
                    e
                );
                if failures >= self.eviction_threshold && connection.mark_dead() {
                    warn!(
                        "Connection {} reached {} consecutive failures, evicting",
                        connection.id(),
                        failures
                    );
                    if self.evictions.send(connection.id().clone()).is_err() {
                        debug!("Eviction queue closed, {} left to shutdown", connection.id());
                    }
                }
                false
            }
        }
    }
}
