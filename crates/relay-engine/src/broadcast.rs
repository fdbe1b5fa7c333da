use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use relay_core::{ConnectionId, DeliveryReport, Notification, NotificationRecord};
use relay_store::{ConnectionStore, NotificationStore};
use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::context::Invocation;
use crate::delivery::{encode_frame, Deliverer};
use crate::error::{require_correlation_id, RelayError};

/// Result of a publish whose notification was stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Every matched connection received the payload.
    Delivered(DeliveryReport),
    /// Stored, but at least one delivery failed.
    Degraded(DeliveryReport),
}

impl PublishOutcome {
    pub fn report(&self) -> DeliveryReport {
        match self {
            Self::Delivered(report) | Self::Degraded(report) => *report,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }
}

/// Writes the latest notification for an id and fans it out to its subscribers.
pub struct Publisher {
    connections: Arc<dyn ConnectionStore>,
    notifications: Arc<dyn NotificationStore>,
    deliverer: Deliverer,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl Publisher {
    pub fn new(
        connections: Arc<dyn ConnectionStore>,
        notifications: Arc<dyn NotificationStore>,
        deliverer: Deliverer,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            connections,
            notifications,
            deliverer,
            clock,
            ttl,
        }
    }

    /// Store `payload` under `raw_id`, then deliver it to every subscriber
    /// except the invocation's origin.
    ///
    /// The store write happens before any delivery and is never rolled back.
    /// Lookup and delivery are not atomic: a connection that closes in between
    /// shows up as a failed delivery.
    #[instrument(skip(self, inv, payload), fields(correlation_id = raw_id))]
    pub async fn publish(
        &self,
        inv: &Invocation,
        raw_id: &str,
        payload: Notification,
    ) -> Result<PublishOutcome, RelayError> {
        let correlation_id = require_correlation_id(raw_id)?;
        inv.ensure_active()?;

        let payload = payload.normalized(&correlation_id);
        let expires_at = self.expiry_from(self.clock.now());
        let record = NotificationRecord::new(correlation_id.clone(), payload, expires_at);
        self.notifications.put(&record)?;

        let targets: Vec<ConnectionId> = self
            .connections
            .query_by_correlation(&correlation_id)?
            .into_iter()
            .map(|subscriber| subscriber.connection_id)
            .filter(|id| inv.origin.as_ref() != Some(id))
            .collect();

        let frame = encode_frame(&record.payload)?;
        let results = inv
            .run(async {
                Ok(join_all(
                    targets
                        .iter()
                        .map(|id| self.deliverer.post(id, frame.clone())),
                )
                .await)
            })
            .await?;

        let mut report = DeliveryReport::default();
        for (connection_id, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => report.record_success(),
                Err(error) => {
                    warn!(
                        connection_id = %connection_id,
                        error_kind = error.error_kind(),
                        %error,
                        "delivery failed"
                    );
                    report.record_failure();
                }
            }
        }

        debug!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            "publish complete"
        );
        Ok(if report.is_degraded() {
            PublishOutcome::Degraded(report)
        } else {
            PublishOutcome::Delivered(report)
        })
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ttl = TimeDelta::from_std(self.ttl).unwrap_or(TimeDelta::MAX);
        now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ManualClock, MockBehavior, MockTransport};
    use assert_matches::assert_matches;
    use relay_core::{ConnectionRecord, CorrelationId};
    use relay_store::{ConnectionRepo, Database, NotificationRepo};
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        publisher: Publisher,
        connections: Arc<ConnectionRepo>,
        notifications: Arc<NotificationRepo>,
        transport: Arc<MockTransport>,
    }

    fn fixture(timeout: Duration) -> Fixture {
        let db = Database::in_memory().unwrap();
        let connections = Arc::new(ConnectionRepo::new(db.clone()));
        let notifications = Arc::new(NotificationRepo::new(db));
        let transport = Arc::new(MockTransport::new());
        let publisher = Publisher::new(
            connections.clone(),
            notifications.clone(),
            Deliverer::new(transport.clone(), timeout),
            Arc::new(ManualClock::new(Utc::now())),
            Duration::from_secs(3600),
        );
        Fixture {
            publisher,
            connections,
            notifications,
            transport,
        }
    }

    fn subscribe(f: &Fixture, order: &str) -> ConnectionId {
        let id = ConnectionId::new();
        f.connections
            .put(&ConnectionRecord::new(
                id.clone(),
                CorrelationId::parse(order).unwrap(),
            ))
            .unwrap();
        id
    }

    fn payload(status: &str) -> Notification {
        Notification {
            id: "m1".into(),
            status: status.into(),
            date: "2024-01-01T00:00:00Z".into(),
            order_id: "ignored".into(),
        }
    }

    fn detached() -> Invocation {
        Invocation::detached(CancellationToken::new())
    }

    #[tokio::test]
    async fn zero_subscribers_still_stores() {
        let f = fixture(Duration::from_secs(5));
        let outcome = f
            .publisher
            .publish(&detached(), "42", payload("DONE"))
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Delivered(DeliveryReport::default()));
        assert_eq!(f.notifications.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn origin_is_skipped() {
        let f = fixture(Duration::from_secs(5));
        let a = subscribe(&f, "42");
        let b = subscribe(&f, "42");
        let inv = Invocation::from_connection(a.clone(), CancellationToken::new());

        let outcome = f.publisher.publish(&inv, "42", payload("DONE")).await.unwrap();
        assert_eq!(outcome.report().attempted, 1);
        assert!(f.transport.frames_for(&a).is_empty());
        let frames = f.transport.frames_for(&b);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["status"], "DONE");
        assert_eq!(frames[0]["order_id"], "42");
    }

    #[tokio::test]
    async fn other_ids_are_not_targeted() {
        let f = fixture(Duration::from_secs(5));
        let other = subscribe(&f, "7");
        f.publisher
            .publish(&detached(), "42", payload("DONE"))
            .await
            .unwrap();
        assert!(f.transport.frames_for(&other).is_empty());
        assert_eq!(f.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn stale_connection_degrades() {
        let f = fixture(Duration::from_secs(5));
        let live = subscribe(&f, "42");
        let stale = subscribe(&f, "42");
        f.transport.script(&stale, MockBehavior::Gone);

        let outcome = f
            .publisher
            .publish(&detached(), "42", payload("DONE"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PublishOutcome::Degraded(DeliveryReport {
                attempted: 2,
                succeeded: 1,
                failed: 1
            })
        );
        assert_eq!(f.transport.frames_for(&live).len(), 1);
        assert_eq!(f.notifications.count().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_delivery_counts_as_failed() {
        let f = fixture(Duration::from_secs(5));
        let slow = subscribe(&f, "42");
        let fast = subscribe(&f, "42");
        f.transport
            .script(&slow, MockBehavior::Delay(Duration::from_secs(30)));

        let outcome = f
            .publisher
            .publish(&detached(), "42", payload("DONE"))
            .await
            .unwrap();
        assert!(outcome.is_degraded());
        assert_eq!(outcome.report().failed, 1);
        assert_eq!(f.transport.frames_for(&fast).len(), 1);
        assert!(f.transport.frames_for(&slow).is_empty());
    }

    #[tokio::test]
    async fn empty_id_writes_nothing() {
        let f = fixture(Duration::from_secs(5));
        assert_matches!(
            f.publisher.publish(&detached(), "", payload("DONE")).await,
            Err(RelayError::MissingCorrelationId)
        );
        assert_eq!(f.notifications.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn cancelled_before_start_writes_nothing() {
        let f = fixture(Duration::from_secs(5));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_matches!(
            f.publisher
                .publish(&Invocation::detached(cancel), "42", payload("DONE"))
                .await,
            Err(RelayError::Cancelled)
        );
        assert_eq!(f.notifications.count().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_fanout_keeps_stored_record() {
        let f = fixture(Duration::from_secs(60));
        let slow = subscribe(&f, "42");
        f.transport
            .script(&slow, MockBehavior::Delay(Duration::from_secs(30)));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        assert_matches!(
            f.publisher
                .publish(&Invocation::detached(cancel), "42", payload("DONE"))
                .await,
            Err(RelayError::Cancelled)
        );
        assert_eq!(f.notifications.count().unwrap(), 1);
    }

    #[test]
    fn expiry_saturates() {
        let f = fixture(Duration::from_secs(5));
        let publisher = Publisher {
            ttl: Duration::MAX,
            ..f.publisher
        };
        assert_eq!(publisher.expiry_from(Utc::now()), DateTime::<Utc>::MAX_UTC);
    }
}
