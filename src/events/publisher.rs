//! Fanout of change events to subscribed connections

use super::registry::{ConnectionId, ConnectionRegistry};
use super::sink::DeliveryError;
use super::{ChangeEvent, ServerMessage};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Default number of deliveries in flight per publish
pub const DEFAULT_MAX_CONCURRENCY: usize = 64;

/// Outcome of a publish that reached at least part of its audience
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    /// Deliveries that succeeded
    pub delivered: usize,
    /// Authenticated connections whose filters excluded the endpoint
    pub skipped: usize,
    /// Deliveries that failed (socket closed mid-fanout, ...)
    pub failed: usize,
}

#[derive(Debug, Error)]
pub enum PublishError {
    /// The connection set could not be read, e.g. the publisher is shut down
    #[error("connection snapshot unavailable: {0}")]
    SnapshotFailure(String),
    #[error("delivery failed for all {failed} eligible connections")]
    AllDeliveriesFailed {
        failed: usize,
        errors: Vec<(ConnectionId, DeliveryError)>,
    },
}

/// Fans ChangeEvents out to authenticated connections.
///
/// Built once per server and shared by handle with every producer.
/// Deliveries are best-effort: no retries, no acknowledgements.
pub struct Publisher {
    registry: Arc<ConnectionRegistry>,
    max_concurrency: usize,
    /// `true` once closed. Publishes hold the read side for their whole
    /// fanout so `close` can wait for them.
    closed: RwLock<bool>,
    last_pong_micros: AtomicU64,
}

impl Publisher {
    pub fn new(registry: Arc<ConnectionRegistry>, max_concurrency: usize) -> Self {
        Self {
            registry,
            max_concurrency: max_concurrency.max(1),
            closed: RwLock::new(false),
            last_pong_micros: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Deliver `event` to every authenticated connection whose filters match.
    ///
    /// Fails only when the snapshot can't be taken or when every eligible
    /// delivery failed. Partial failures are logged and reported as success.
    pub async fn publish(&self, event: &ChangeEvent) -> Result<PublishReport, PublishError> {
        let closed = self.closed.read().await;
        if *closed {
            return Err(PublishError::SnapshotFailure(
                "publisher is shut down".to_string(),
            ));
        }

        let snapshot = self.registry.snapshot_authenticated().await;
        let total = snapshot.len();
        let targets: Vec<_> = snapshot
            .into_iter()
            .filter(|c| c.accepts(event.endpoint()))
            .collect();
        let skipped = total - targets.len();

        let message = ServerMessage::Event(event.clone());
        let results: Vec<(ConnectionId, Result<(), DeliveryError>)> = stream::iter(targets)
            .map(|connection| {
                let message = message.clone();
                async move {
                    let result = connection.sink().deliver(message).await;
                    (connection.id(), result)
                }
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        drop(closed);

        let attempted = results.len();
        let errors: Vec<(ConnectionId, DeliveryError)> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();
        for (id, error) in &errors {
            debug!(connection_id = %id, endpoint = %event.endpoint(), "Delivery failed: {}", error);
        }

        let report = PublishReport {
            delivered: attempted - errors.len(),
            skipped,
            failed: errors.len(),
        };

        if attempted > 0 && report.delivered == 0 {
            warn!(
                method = %event.method(),
                endpoint = %event.endpoint(),
                failed = report.failed,
                "ChangeEvent could not be delivered to any connection"
            );
            return Err(PublishError::AllDeliveriesFailed {
                failed: report.failed,
                errors,
            });
        }

        if report.failed > 0 {
            warn!(
                method = %event.method(),
                endpoint = %event.endpoint(),
                delivered = report.delivered,
                failed = report.failed,
                "ChangeEvent partially delivered"
            );
        } else {
            debug!(
                method = %event.method(),
                endpoint = %event.endpoint(),
                delivered = report.delivered,
                skipped = report.skipped,
                "ChangeEvent published"
            );
        }

        Ok(report)
    }

    /// Stop accepting publishes. Waits for in-flight publishes to finish.
    pub async fn close(&self) {
        let mut closed = self.closed.write().await;
        *closed = true;
    }

    pub async fn is_closed(&self) -> bool {
        *self.closed.read().await
    }

    /// Current Unix time in fractional seconds for liveness probes.
    ///
    /// Never goes backwards across calls, even if the wall clock does.
    pub fn pong_timestamp(&self) -> f64 {
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let previous = self.last_pong_micros.fetch_max(now, Ordering::AcqRel);
        previous.max(now) as f64 / 1_000_000.0
    }
}
