//! Auto-renewal worker logic
//!
//! Finds active subscriptions with auto-renew enabled that end in the
//! renewal window and re-initiates a checkout for each. Errors are
//! caught per subscription so one failing user never blocks the rest;
//! every attempt is reported as a domain event regardless of outcome.

use serde_json::json;
use sqlx::PgPool;

use crate::checkout::CheckoutService;
use crate::error::BillingResult;
use crate::events::{names, EventPublisher};
use crate::subscriptions::{RenewableSubscription, SubscriptionService};

/// Renewal checkouts are created for subscriptions ending between two
/// and three days out, giving the user time to complete payment before
/// the current period lapses.
pub const RENEWAL_WINDOW_FROM_DAYS: i64 = 2;
pub const RENEWAL_WINDOW_TO_DAYS: i64 = 3;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RenewalSummary {
    pub candidates: usize,
    pub initiated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Payload of one `subscription.autorenewal.attempted` event. Emitted for
/// every candidate the sweep visits, whether the checkout was created,
/// skipped, or failed, so the nightly pass is fully observable.
fn attempt_event(
    sub: &RenewableSubscription,
    request_id: Option<i64>,
    reason: Option<&str>,
) -> serde_json::Value {
    json!({
        "subscription_id": sub.id,
        "user_id": sub.user_id,
        "plan_id": sub.plan_id,
        "ends_at": sub.ends_at.unix_timestamp(),
        "succeeded": request_id.is_some(),
        "request_id": request_id,
        "reason": reason,
    })
}

#[derive(Clone)]
pub struct AutoRenewalService {
    pool: PgPool,
    subscriptions: SubscriptionService,
    checkout: CheckoutService,
    publisher: EventPublisher,
    provider: String,
}

impl AutoRenewalService {
    pub fn new(
        pool: PgPool,
        subscriptions: SubscriptionService,
        checkout: CheckoutService,
        publisher: EventPublisher,
        provider: String,
    ) -> Self {
        Self {
            pool,
            subscriptions,
            checkout,
            publisher,
            provider,
        }
    }

    pub async fn run(&self) -> BillingResult<RenewalSummary> {
        let candidates = self
            .subscriptions
            .renewable_within(RENEWAL_WINDOW_FROM_DAYS, RENEWAL_WINDOW_TO_DAYS)
            .await?;

        let mut summary = RenewalSummary {
            candidates: candidates.len(),
            ..Default::default()
        };

        for sub in candidates {
            // Skip subscriptions that already have an open renewal
            // checkout from an earlier run of this job.
            let open: Option<(i64,)> = sqlx::query_as(
                r#"
                SELECT request_id FROM payment_intents
                WHERE user_id = $1 AND plan_id = $2 AND status = 'pending'
                LIMIT 1
                "#,
            )
            .bind(sub.user_id)
            .bind(sub.plan_id)
            .fetch_optional(&self.pool)
            .await?;
            if open.is_some() {
                summary.skipped += 1;
                tracing::info!(
                    subscription_id = %sub.id,
                    user_id = %sub.user_id,
                    "Renewal skipped: open checkout already exists"
                );
                self.publisher.publish(
                    names::AUTORENEWAL_ATTEMPTED,
                    attempt_event(&sub, None, Some("open_intent")),
                );
                continue;
            }

            let attempt = self
                .checkout
                .initiate(sub.user_id, sub.plan_id, &self.provider, None, None)
                .await;

            match &attempt {
                Ok(response) => {
                    summary.initiated += 1;
                    tracing::info!(
                        subscription_id = %sub.id,
                        user_id = %sub.user_id,
                        request_id = response.request_id,
                        "Renewal checkout initiated"
                    );
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(
                        subscription_id = %sub.id,
                        user_id = %sub.user_id,
                        error = %e,
                        "Renewal checkout failed"
                    );
                }
            }

            self.publisher.publish(
                names::AUTORENEWAL_ATTEMPTED,
                attempt_event(
                    &sub,
                    attempt.as_ref().ok().map(|r| r.request_id),
                    attempt.as_ref().err().map(|_| "checkout_failed"),
                ),
            );
        }

        if summary.candidates > 0 {
            tracing::info!(
                candidates = summary.candidates,
                initiated = summary.initiated,
                skipped = summary.skipped,
                failed = summary.failed,
                "Auto-renewal pass complete"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use uuid::Uuid;

    fn candidate() -> RenewableSubscription {
        RenewableSubscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            ends_at: datetime!(2026-09-01 12:00 UTC),
        }
    }

    #[test]
    fn skipped_candidate_still_reports_an_attempt() {
        let sub = candidate();
        let event = attempt_event(&sub, None, Some("open_intent"));
        assert_eq!(event["succeeded"], serde_json::json!(false));
        assert_eq!(event["reason"], serde_json::json!("open_intent"));
        assert!(event["request_id"].is_null());
        assert_eq!(event["subscription_id"], serde_json::json!(sub.id));
    }

    #[test]
    fn successful_attempt_carries_the_request_id() {
        let sub = candidate();
        let event = attempt_event(&sub, Some(1_756_000_000_123_456), None);
        assert_eq!(event["succeeded"], serde_json::json!(true));
        assert_eq!(event["request_id"], serde_json::json!(1_756_000_000_123_456_i64));
        assert!(event["reason"].is_null());
    }

    #[test]
    fn failed_attempt_names_the_reason() {
        let event = attempt_event(&candidate(), None, Some("checkout_failed"));
        assert_eq!(event["succeeded"], serde_json::json!(false));
        assert_eq!(event["reason"], serde_json::json!("checkout_failed"));
    }
}
