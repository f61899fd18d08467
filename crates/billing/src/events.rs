//! Domain event publisher
//!
//! Fire-and-forget outbound channel decoupling the state machine from
//! notification delivery. Events are published strictly after commit;
//! delivery is at-most-once and failures are logged, never propagated
//! back into the owning transaction. The drain task records every event
//! into `billing_events` for audit.

use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::mpsc;

/// Event names external collaborators subscribe to.
pub mod names {
    pub const PAYMENT_VERIFIED: &str = "payment.verified";
    pub const PAYMENT_FAILED: &str = "payment.failed";
    pub const PAYMENT_REFUNDED: &str = "payment.refunded";
    pub const PAYMENT_EXPIRED: &str = "payment.expired";
    pub const SUBSCRIPTION_ACTIVATED: &str = "subscription.activated";
    pub const BILLING_CYCLE_STARTED: &str = "billing.cycle_started";
    pub const AUTORENEWAL_ATTEMPTED: &str = "subscription.autorenewal.attempted";
}

#[derive(Debug, Clone)]
pub struct DomainEvent {
    pub name: &'static str,
    pub payload: Value,
}

#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<DomainEvent>,
}

impl EventPublisher {
    /// Spawn the drain task against the given pool and return a
    /// clone-able publisher handle.
    pub fn spawn(pool: PgPool) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<DomainEvent>();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                tracing::info!(event = event.name, payload = %event.payload, "Domain event");

                let result = sqlx::query(
                    "INSERT INTO billing_events (event_name, payload) VALUES ($1, $2)",
                )
                .bind(event.name)
                .bind(&event.payload)
                .execute(&pool)
                .await;

                if let Err(e) = result {
                    tracing::warn!(event = event.name, error = %e, "Failed to record domain event");
                }
            }
        });

        Self { tx }
    }

    /// Channel-only publisher for tests; the receiver observes published
    /// events directly.
    pub fn for_tests() -> (Self, mpsc::UnboundedReceiver<DomainEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publish an event. Never blocks and never fails the caller; a
    /// closed channel is logged and dropped.
    pub fn publish(&self, name: &'static str, payload: Value) {
        if self.tx.send(DomainEvent { name, payload }).is_err() {
            tracing::warn!(event = name, "Event channel closed; domain event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn published_events_reach_the_channel() {
        let (publisher, mut rx) = EventPublisher::for_tests();

        publisher.publish(names::PAYMENT_VERIFIED, json!({"request_id": 1}));
        publisher.publish(names::SUBSCRIPTION_ACTIVATED, json!({"user_id": "u"}));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.name, "payment.verified");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.name, "subscription.activated");
    }

    #[test]
    fn publish_into_closed_channel_is_silent() {
        let (publisher, rx) = EventPublisher::for_tests();
        drop(rx);
        publisher.publish(names::PAYMENT_FAILED, json!({}));
    }
}
