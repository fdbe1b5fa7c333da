use std::sync::Arc;
use std::time::Duration;

use relay_core::{ConnectionId, ConnectionRecord, CorrelationId, Notification, Transport};
use relay_store::{ConnectionStore, NotificationStore};
use tracing::{info, instrument};

use crate::broadcast::{PublishOutcome, Publisher};
use crate::clock::{Clock, SystemClock};
use crate::context::Invocation;
use crate::delivery::Deliverer;
use crate::error::RelayError;
use crate::replay::{AckOutcome, ReplayOutcome, ReplayService};
use crate::subscriptions::SubscriptionManager;

/// Tunables for the relay core.
#[derive(Clone, Copy, Debug)]
pub struct RelayConfig {
    /// How long a published notification stays replayable.
    pub notification_ttl: Duration,
    /// Upper bound on a single post-to-connection call.
    pub delivery_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            notification_ttl: Duration::from_secs(3600),
            delivery_timeout: Duration::from_secs(5),
        }
    }
}

/// Collaborator handles, built once at startup.
#[derive(Clone)]
pub struct RelayDeps {
    pub connections: Arc<dyn ConnectionStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
}

impl RelayDeps {
    pub fn new(
        connections: Arc<dyn ConnectionStore>,
        notifications: Arc<dyn NotificationStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            connections,
            notifications,
            transport,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// The notification relay: subscriptions, publish fan-out, replay and ack.
pub struct Relay {
    subscriptions: SubscriptionManager,
    publisher: Publisher,
    replay: ReplayService,
    notifications: Arc<dyn NotificationStore>,
    clock: Arc<dyn Clock>,
}

impl Relay {
    pub fn new(deps: RelayDeps, config: RelayConfig) -> Self {
        let deliverer = Deliverer::new(deps.transport, config.delivery_timeout);
        Self {
            subscriptions: SubscriptionManager::new(deps.connections.clone()),
            publisher: Publisher::new(
                deps.connections,
                deps.notifications.clone(),
                deliverer.clone(),
                deps.clock.clone(),
                config.notification_ttl,
            ),
            replay: ReplayService::new(deps.notifications.clone(), deliverer, deps.clock.clone()),
            notifications: deps.notifications,
            clock: deps.clock,
        }
    }

    pub fn subscribe(
        &self,
        connection_id: &ConnectionId,
        raw_id: &str,
    ) -> Result<ConnectionRecord, RelayError> {
        self.subscriptions.subscribe(connection_id, raw_id)
    }

    pub fn unsubscribe(&self, connection_id: &ConnectionId) -> Result<bool, RelayError> {
        self.subscriptions.unsubscribe(connection_id)
    }

    pub fn subscription_of(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Option<CorrelationId>, RelayError> {
        self.subscriptions.subscription_of(connection_id)
    }

    pub async fn publish(
        &self,
        inv: &Invocation,
        raw_id: &str,
        payload: Notification,
    ) -> Result<PublishOutcome, RelayError> {
        self.publisher.publish(inv, raw_id, payload).await
    }

    pub async fn replay(&self, inv: &Invocation, raw_id: &str) -> Result<ReplayOutcome, RelayError> {
        self.replay.replay(inv, raw_id).await
    }

    pub fn acknowledge(&self, inv: &Invocation, raw_id: &str) -> Result<AckOutcome, RelayError> {
        self.replay.acknowledge(inv, raw_id)
    }

    /// Physically remove expired notifications. Reads already hide them.
    #[instrument(skip(self))]
    pub fn purge_expired(&self) -> Result<usize, RelayError> {
        let purged = self.notifications.purge_expired(self.clock.now())?;
        if purged > 0 {
            info!(purged, "purged expired notifications");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ManualClock, MockBehavior, MockTransport};
    use assert_matches::assert_matches;
    use chrono::{DateTime, Utc};
    use relay_core::{DeliveryReport, NotificationRecord};
    use relay_store::{ConnectionRepo, Database, NotificationRepo, StoreError};
    use tokio_util::sync::CancellationToken;

    struct Harness {
        relay: Relay,
        transport: Arc<MockTransport>,
        clock: Arc<ManualClock>,
        notifications: Arc<NotificationRepo>,
    }

    fn harness() -> Harness {
        let db = Database::in_memory().unwrap();
        let notifications = Arc::new(NotificationRepo::new(db.clone()));
        let transport = Arc::new(MockTransport::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let deps = RelayDeps::new(
            Arc::new(ConnectionRepo::new(db)),
            notifications.clone(),
            transport.clone(),
        )
        .with_clock(clock.clone());
        Harness {
            relay: Relay::new(deps, RelayConfig::default()),
            transport,
            clock,
            notifications,
        }
    }

    fn message(id: &str, status: &str) -> Notification {
        Notification {
            id: id.into(),
            status: status.into(),
            date: "2024-01-01T00:00:00Z".into(),
            order_id: "42".into(),
        }
    }

    fn on(conn: &ConnectionId) -> Invocation {
        Invocation::from_connection(conn.clone(), CancellationToken::new())
    }

    #[tokio::test]
    async fn two_clients_on_one_order() {
        let h = harness();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        h.relay.subscribe(&a, "42").unwrap();
        h.relay.subscribe(&b, "42").unwrap();

        let outcome = h
            .relay
            .publish(&on(&a), "42", message("u1", "PREPARING"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PublishOutcome::Delivered(DeliveryReport {
                attempted: 1,
                succeeded: 1,
                failed: 0
            })
        );
        assert!(h.transport.frames_for(&a).is_empty());
        assert_eq!(h.transport.frames_for(&b)[0]["status"], "PREPARING");

        let replayed = h.relay.replay(&on(&b), "42").await.unwrap();
        assert_matches!(replayed, ReplayOutcome::Found(ref r) if r.payload.id == "u1");

        h.relay.acknowledge(&on(&b), "42").unwrap();
        assert_eq!(
            h.relay.replay(&on(&b), "42").await.unwrap(),
            ReplayOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn last_write_wins() {
        let h = harness();
        let inv = Invocation::detached(CancellationToken::new());
        h.relay.publish(&inv, "42", message("p1", "PLACED")).await.unwrap();
        h.relay.publish(&inv, "42", message("p2", "SHIPPED")).await.unwrap();

        assert_matches!(
            h.relay.replay(&inv, "42").await.unwrap(),
            ReplayOutcome::Found(ref r) if r.payload.id == "p2" && r.payload.status == "SHIPPED"
        );
    }

    #[tokio::test]
    async fn unsubscribed_client_gets_nothing() {
        let h = harness();
        let a = ConnectionId::new();
        h.relay.subscribe(&a, "42").unwrap();
        h.relay.unsubscribe(&a).unwrap();

        let outcome = h
            .relay
            .publish(&Invocation::detached(CancellationToken::new()), "42", message("u1", "DONE"))
            .await
            .unwrap();
        assert_eq!(outcome.report().attempted, 0);
        assert!(h.relay.subscription_of(&a).unwrap().is_none());
    }

    #[tokio::test]
    async fn unavailable_transport_degrades() {
        let h = harness();
        let a = ConnectionId::new();
        h.relay.subscribe(&a, "42").unwrap();
        h.transport
            .script(&a, MockBehavior::Unavailable("queue full".into()));

        let outcome = h
            .relay
            .publish(&Invocation::detached(CancellationToken::new()), "42", message("u1", "DONE"))
            .await
            .unwrap();
        assert!(outcome.is_degraded());
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let h = harness();
        let inv = Invocation::detached(CancellationToken::new());
        h.relay.publish(&inv, "old", message("u1", "DONE")).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(90));
        h.relay.publish(&inv, "new", message("u2", "DONE")).await.unwrap();

        assert_eq!(h.relay.purge_expired().unwrap(), 1);
        assert_eq!(h.notifications.count().unwrap(), 1);
        assert_matches!(h.relay.replay(&inv, "new").await.unwrap(), ReplayOutcome::Found(_));
    }

    struct FailingNotifications;

    impl NotificationStore for FailingNotifications {
        fn put(&self, _record: &NotificationRecord) -> Result<(), StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }

        fn get(
            &self,
            _correlation_id: &CorrelationId,
            _now: DateTime<Utc>,
        ) -> Result<Option<NotificationRecord>, StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }

        fn delete(
            &self,
            _correlation_id: &CorrelationId,
            _now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }

        fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize, StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }
    }

    #[tokio::test]
    async fn store_failure_is_500() {
        let db = Database::in_memory().unwrap();
        let transport = Arc::new(MockTransport::new());
        let relay = Relay::new(
            RelayDeps::new(
                Arc::new(ConnectionRepo::new(db)),
                Arc::new(FailingNotifications),
                transport.clone(),
            ),
            RelayConfig::default(),
        );
        let inv = Invocation::detached(CancellationToken::new());

        let err = relay.publish(&inv, "42", message("u1", "DONE")).await.unwrap_err();
        assert_matches!(err, RelayError::Store(_));
        assert_eq!(err.status_code(), 500);
        assert_eq!(transport.call_count(), 0);

        assert_matches!(relay.replay(&inv, "42").await, Err(RelayError::Store(_)));
        assert_matches!(relay.acknowledge(&inv, "42"), Err(RelayError::Store(_)));
        assert_matches!(relay.purge_expired(), Err(RelayError::Store(_)));
    }
}
