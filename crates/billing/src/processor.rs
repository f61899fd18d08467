//! Transactional "apply" engine
//!
//! `process_event` drives one admitted webhook event through the billing
//! state machine as a single all-or-nothing transaction. The direct
//! confirmation path (synchronous return-URL flow) shares the same
//! resolution, amount-check, and apply code, guarded by the same
//! terminal-status idempotency check, so whichever of the two arrives
//! first wins and the second is a safe no-op.

use serde_json::json;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use finflow_shared::{IntentStatus, PaymentStatus};

use crate::error::{BillingError, BillingResult};
use crate::events::{names, EventPublisher};
use crate::ledger::WebhookEventRecord;
use crate::provider::{ChargeStatus, ChargeUpdate, ProviderRegistry};
use crate::security::MetadataCipher;
use crate::subscriptions::SubscriptionService;

/// Events stuck in `processing` longer than this are considered abandoned
/// and re-claimable by the drain sweep.
const STUCK_PROCESSING_MINUTES: i32 = 30;

/// Amounts are reconciled to within one minor currency unit. `abs_diff`
/// keeps the check total even for hostile extreme values.
pub fn amount_within_tolerance(expected: i64, got: i64) -> bool {
    expected.abs_diff(got) <= 1
}

/// What one `process_event` invocation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Event id unknown; nothing to do.
    Missing,
    /// Stored payload failed re-verification; terminal, never retried.
    SignatureRejected,
    /// No intent correlates to the event; informational.
    Ignored,
    /// The intent was already in a terminal status; idempotent no-op.
    AlreadyFinalized,
    /// Provider reported a non-terminal status; audit-logged only.
    Acknowledged,
    /// A terminal transition was applied.
    Applied,
}

/// Counters for one drain sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainSummary {
    pub scanned: usize,
    pub applied: usize,
    pub acknowledged: usize,
    pub ignored: usize,
    pub failed: usize,
}

#[derive(Debug, sqlx::FromRow)]
struct IntentRow {
    id: Uuid,
    user_id: Uuid,
    amount: i64,
    currency: String,
    status: String,
    metadata_enc: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    status: String,
}

#[derive(Clone)]
pub struct PaymentProcessor {
    pool: PgPool,
    registry: ProviderRegistry,
    cipher: MetadataCipher,
    subscriptions: SubscriptionService,
    publisher: EventPublisher,
}

impl PaymentProcessor {
    pub fn new(
        pool: PgPool,
        registry: ProviderRegistry,
        cipher: MetadataCipher,
        publisher: EventPublisher,
    ) -> Self {
        let subscriptions = SubscriptionService::new(pool.clone());
        Self {
            pool,
            registry,
            cipher,
            subscriptions,
            publisher,
        }
    }

    /// Apply one admitted webhook event. Safe to re-invoke: every path is
    /// either idempotent or aborts without partial writes.
    pub async fn process_event(&self, event_id: Uuid) -> BillingResult<ProcessOutcome> {
        let event: Option<WebhookEventRecord> =
            sqlx::query_as("SELECT * FROM payment_webhook_events WHERE id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;
        let event = match event {
            Some(e) => e,
            None => return Ok(ProcessOutcome::Missing),
        };

        let adapter = self.registry.get(&event.provider)?;

        // Re-verify the signature against the stored raw payload. Guards
        // against a compromised admission path or stored-payload
        // tampering; failure is terminal and not retried.
        let stored: serde_json::Value = serde_json::from_str(&event.raw_body)
            .unwrap_or_else(|_| event.payload.clone());
        if !adapter.verify_signature(&stored, &event.signature) {
            tracing::error!(
                provider = %event.provider,
                event_id = %event.event_id,
                "Stored webhook payload failed signature re-verification"
            );
            sqlx::query(
                r#"
                UPDATE payment_webhook_events
                SET status = 'failed', error = 'signature',
                    attempts = attempts + 1, last_attempt_at = NOW(), locked_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(event.id)
            .execute(&self.pool)
            .await?;
            return Ok(ProcessOutcome::SignatureRejected);
        }

        // Claim: advance attempt bookkeeping and take the soft lock. The
        // lock avoids wasted work only; correctness comes from the
        // terminal-status check inside the transaction.
        sqlx::query(
            r#"
            UPDATE payment_webhook_events
            SET status = 'processing', attempts = attempts + 1,
                last_attempt_at = NOW(), locked_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(event.id)
        .execute(&self.pool)
        .await?;

        let charge = adapter.interpret(&event.payload);
        let result = self
            .apply_in_transaction(&event, event.request_id, &charge)
            .await;

        match result {
            Ok((outcome, post_commit)) => {
                for (name, payload) in post_commit {
                    self.publisher.publish(name, payload);
                }
                Ok(outcome)
            }
            Err(e) => {
                // Abort already rolled back; record the failure. Amount
                // mismatches keep the lock so the sweep does not retry
                // them blindly; other faults clear it for retry.
                let keep_locked = matches!(e, BillingError::AmountMismatch { .. });
                tracing::error!(
                    provider = %event.provider,
                    event_id = %event.event_id,
                    error = %e,
                    "Webhook event processing aborted"
                );
                sqlx::query(
                    r#"
                    UPDATE payment_webhook_events
                    SET status = 'failed', error = $2,
                        locked_at = CASE WHEN $3 THEN locked_at ELSE NULL END
                    WHERE id = $1
                    "#,
                )
                .bind(event.id)
                .bind(e.to_string())
                .bind(keep_locked)
                .execute(&self.pool)
                .await?;
                Err(e)
            }
        }
    }

    /// Direct-confirmation path: resolve a checkout from the provider's
    /// synchronous return payload without waiting for the webhook.
    ///
    /// The payload is relayed by the user's browser, not delivered by the
    /// provider, so it is verified against the provider signature exactly
    /// like a webhook body before anything is applied.
    pub async fn confirm_direct(
        &self,
        user_id: Uuid,
        request_id: i64,
        provider: &str,
        payload: &serde_json::Value,
        signature: &str,
    ) -> BillingResult<ProcessOutcome> {
        let adapter = self.registry.get(provider)?;

        if !adapter.verify_signature(payload, signature) {
            tracing::warn!(
                provider = %provider,
                request_id,
                "Direct confirmation payload failed signature verification"
            );
            return Ok(ProcessOutcome::SignatureRejected);
        }

        let charge = adapter.interpret(payload);

        let mut txn = self.pool.begin().await?;

        let intent: Option<IntentRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, amount, currency, status, metadata_enc
            FROM payment_intents
            WHERE request_id = $1 AND user_id = $2
            FOR UPDATE
            "#,
        )
        .bind(request_id)
        .bind(user_id)
        .fetch_optional(&mut *txn)
        .await?;

        let intent = intent.ok_or(BillingError::IntentNotFound(request_id))?;
        let intent_status: IntentStatus = intent
            .status
            .parse()
            .map_err(|_| BillingError::Internal(format!("bad intent status {}", intent.status)))?;

        if intent_status.is_terminal() {
            txn.rollback().await?;
            return Ok(ProcessOutcome::AlreadyFinalized);
        }

        let (outcome, post_commit) = self
            .apply_charge(&mut txn, &intent, request_id, &charge, payload)
            .await?;
        txn.commit().await?;

        for (name, payload) in post_commit {
            self.publisher.publish(name, payload);
        }
        Ok(outcome)
    }

    /// Re-invoke `process_event` over events still awaiting work: fresh
    /// `queued` rows, retryable `failed` rows with the lock cleared, and
    /// `processing` rows stuck past the claim timeout.
    pub async fn drain_queue(&self, limit: i64) -> BillingResult<DrainSummary> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM payment_webhook_events
            WHERE status = 'queued'
               OR (status = 'failed' AND locked_at IS NULL)
               OR (status = 'processing'
                   AND locked_at < NOW() - ($2 || ' minutes')::INTERVAL)
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .bind(STUCK_PROCESSING_MINUTES.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut summary = DrainSummary {
            scanned: ids.len(),
            ..DrainSummary::default()
        };

        for (id,) in ids {
            match self.process_event(id).await {
                Ok(ProcessOutcome::Applied) => summary.applied += 1,
                Ok(ProcessOutcome::Acknowledged) => summary.acknowledged += 1,
                Ok(ProcessOutcome::Ignored) | Ok(ProcessOutcome::AlreadyFinalized) => {
                    summary.ignored += 1
                }
                Ok(_) => {}
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(event_id = %id, error = %e, "Drain retry failed");
                }
            }
        }

        Ok(summary)
    }

    /// Steps 4-11 of the apply operation, inside one transaction.
    /// Returns the outcome plus the domain events to publish after commit.
    async fn apply_in_transaction(
        &self,
        event: &WebhookEventRecord,
        request_id: Option<i64>,
        charge: &ChargeUpdate,
    ) -> BillingResult<(ProcessOutcome, Vec<(&'static str, serde_json::Value)>)> {
        let mut txn = self.pool.begin().await?;

        // Resolve the correlated intent.
        let request_id = match request_id {
            Some(id) => id,
            None => {
                self.settle_event(&mut txn, event.id, "ignored", Some("no request id")).await?;
                txn.commit().await?;
                return Ok((ProcessOutcome::Ignored, Vec::new()));
            }
        };

        let intent: Option<IntentRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, amount, currency, status, metadata_enc
            FROM payment_intents
            WHERE request_id = $1
            FOR UPDATE
            "#,
        )
        .bind(request_id)
        .fetch_optional(&mut *txn)
        .await?;

        let intent = match intent {
            Some(i) => i,
            None => {
                // No intent to apply to; informational only.
                self.settle_event(&mut txn, event.id, "ignored", Some("intent not found")).await?;
                txn.commit().await?;
                return Ok((ProcessOutcome::Ignored, Vec::new()));
            }
        };

        let intent_status: IntentStatus = intent
            .status
            .parse()
            .map_err(|_| BillingError::Internal(format!("bad intent status {}", intent.status)))?;
        if intent_status.is_terminal() {
            // Second idempotency layer: a differently-keyed duplicate
            // referencing an already-settled intent is a no-op.
            self.settle_event(&mut txn, event.id, "processed", Some("already finalized")).await?;
            txn.commit().await?;
            return Ok((ProcessOutcome::AlreadyFinalized, Vec::new()));
        }

        let (outcome, post_commit) = self
            .apply_charge(&mut txn, &intent, request_id, charge, &event.payload)
            .await?;

        match outcome {
            ProcessOutcome::Acknowledged => {
                self.settle_event(&mut txn, event.id, "processed", Some("non-terminal status")).await?;
            }
            _ => {
                self.settle_event(&mut txn, event.id, "processed", None).await?;
            }
        }
        txn.commit().await?;
        Ok((outcome, post_commit))
    }

    /// Shared status-resolution + amount-check + apply logic (webhook and
    /// direct-confirmation paths). Runs inside the caller's transaction.
    async fn apply_charge(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        intent: &IntentRow,
        request_id: i64,
        charge: &ChargeUpdate,
        raw_payload: &serde_json::Value,
    ) -> BillingResult<(ProcessOutcome, Vec<(&'static str, serde_json::Value)>)> {
        let payment: Option<PaymentRow> = sqlx::query_as(
            "SELECT id, status FROM payments WHERE intent_id = $1 FOR UPDATE",
        )
        .bind(intent.id)
        .fetch_optional(&mut **txn)
        .await?;

        // An intent without its payment record is a consistency fault;
        // never silently fabricate one.
        let payment = payment.ok_or(BillingError::PaymentMissing(intent.id))?;
        let payment_status: PaymentStatus = payment
            .status
            .parse()
            .map_err(|_| BillingError::Internal(format!("bad payment status {}", payment.status)))?;

        // Non-terminal provider statuses only leave an audit trail; the
        // provider will send a terminal follow-up later.
        if matches!(charge.status, ChargeStatus::Pending | ChargeStatus::Processing) {
            self.append_webhook_log(txn, payment.id, raw_payload).await?;
            return Ok((ProcessOutcome::Acknowledged, Vec::new()));
        }

        // Amount reconciliation. A mismatch beyond one minor unit is a
        // potential fraud signal or data bug; abort with no state change.
        if let Some(stated) = charge.amount {
            if !amount_within_tolerance(intent.amount, stated) {
                return Err(BillingError::AmountMismatch {
                    expected: intent.amount,
                    got: stated,
                });
            }
        }

        let now = OffsetDateTime::now_utc();
        let mut post_commit: Vec<(&'static str, serde_json::Value)> = Vec::new();

        match charge.status {
            ChargeStatus::Completed => {
                if !payment_status.can_transition_to(PaymentStatus::Completed) {
                    return Err(BillingError::Internal(format!(
                        "payment {} cannot move {} -> completed",
                        payment.id, payment.status
                    )));
                }

                self.transition_payment(
                    txn,
                    payment.id,
                    PaymentStatus::Completed,
                    charge.transaction_id.as_deref(),
                    charge.paid_at.or(Some(now)),
                    None,
                )
                .await?;
                self.append_webhook_log(txn, payment.id, raw_payload).await?;
                self.transition_intent(txn, intent.id, IntentStatus::Succeeded, "provider completed")
                    .await?;

                // Recover the target plan from the encrypted metadata and
                // activate the entitlement.
                let plan_id = intent
                    .metadata_enc
                    .as_deref()
                    .and_then(|blob| self.cipher.decrypt(blob))
                    .and_then(|meta| serde_json::from_str::<serde_json::Value>(&meta).ok())
                    .and_then(|meta| {
                        meta.get("plan_id")
                            .and_then(|v| v.as_str())
                            .and_then(|s| Uuid::parse_str(s).ok())
                    });

                let mut subscription_id: Option<Uuid> = None;
                if let Some(plan_id) = plan_id {
                    let plan: Option<finflow_shared::Plan> =
                        sqlx::query_as("SELECT * FROM plans WHERE id = $1")
                            .bind(plan_id)
                            .fetch_optional(&mut **txn)
                            .await?;
                    if let Some(plan) = plan {
                        let sub_id = SubscriptionService::activate_in_txn(
                            txn,
                            intent.user_id,
                            &plan,
                            false,
                            now,
                        )
                        .await?;
                        SubscriptionService::reset_quota_in_txn(txn, intent.user_id, plan.id)
                            .await?;
                        sqlx::query("UPDATE payments SET subscription_id = $2 WHERE id = $1")
                            .bind(payment.id)
                            .bind(sub_id)
                            .execute(&mut **txn)
                            .await?;
                        subscription_id = Some(sub_id);

                        post_commit.push((
                            names::SUBSCRIPTION_ACTIVATED,
                            json!({
                                "user_id": intent.user_id,
                                "subscription_id": sub_id,
                                "plan_id": plan.id,
                            }),
                        ));
                        post_commit.push((
                            names::BILLING_CYCLE_STARTED,
                            json!({
                                "user_id": intent.user_id,
                                "plan_id": plan.id,
                            }),
                        ));
                    } else {
                        tracing::warn!(
                            intent_id = %intent.id,
                            plan_id = %plan_id,
                            "Intent metadata names an unknown plan; payment completed without subscription"
                        );
                    }
                } else {
                    tracing::warn!(
                        intent_id = %intent.id,
                        "Intent metadata unavailable; payment completed without subscription"
                    );
                }

                post_commit.insert(
                    0,
                    (
                        names::PAYMENT_VERIFIED,
                        json!({
                            "user_id": intent.user_id,
                            "request_id": request_id,
                            "amount": intent.amount,
                            "currency": intent.currency,
                            "subscription_id": subscription_id,
                        }),
                    ),
                );
            }
            ChargeStatus::Failed => {
                if payment_status.can_transition_to(PaymentStatus::Failed) {
                    self.transition_payment(
                        txn,
                        payment.id,
                        PaymentStatus::Failed,
                        charge.transaction_id.as_deref(),
                        None,
                        Some("provider reported failure"),
                    )
                    .await?;
                }
                self.append_webhook_log(txn, payment.id, raw_payload).await?;
                self.transition_intent(txn, intent.id, IntentStatus::Failed, "provider failed")
                    .await?;
                post_commit.push((
                    names::PAYMENT_FAILED,
                    json!({
                        "user_id": intent.user_id,
                        "request_id": request_id,
                        "amount": intent.amount,
                    }),
                ));
            }
            ChargeStatus::Refunded => {
                // Refunds only apply to completed payments; anything else
                // is audit-logged and acknowledged.
                if !payment_status.can_transition_to(PaymentStatus::Refunded) {
                    self.append_webhook_log(txn, payment.id, raw_payload).await?;
                    return Ok((ProcessOutcome::Acknowledged, Vec::new()));
                }
                // Refund does not retroactively revoke the subscription;
                // that policy lives outside this core.
                self.transition_payment(
                    txn,
                    payment.id,
                    PaymentStatus::Refunded,
                    charge.transaction_id.as_deref(),
                    None,
                    None,
                )
                .await?;
                self.append_webhook_log(txn, payment.id, raw_payload).await?;
                post_commit.push((
                    names::PAYMENT_REFUNDED,
                    json!({
                        "user_id": intent.user_id,
                        "request_id": request_id,
                        "amount": intent.amount,
                    }),
                ));
            }
            ChargeStatus::Pending | ChargeStatus::Processing => unreachable!(),
        }

        Ok((ProcessOutcome::Applied, post_commit))
    }

    async fn transition_payment(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        payment_id: Uuid,
        status: PaymentStatus,
        transaction_id: Option<&str>,
        paid_at: Option<OffsetDateTime>,
        failure_reason: Option<&str>,
    ) -> BillingResult<()> {
        let history_entry = json!([{
            "status": status.as_str(),
            "at": OffsetDateTime::now_utc().unix_timestamp(),
            "note": failure_reason,
        }]);
        sqlx::query(
            r#"
            UPDATE payments
            SET status = $2,
                provider_transaction_id = COALESCE($3, provider_transaction_id),
                paid_at = COALESCE($4, paid_at),
                failure_reason = COALESCE($5, failure_reason),
                status_history = status_history || $6::jsonb,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .bind(status.as_str())
        .bind(transaction_id)
        .bind(paid_at)
        .bind(failure_reason)
        .bind(history_entry)
        .execute(&mut **txn)
        .await?;
        Ok(())
    }

    async fn transition_intent(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        intent_id: Uuid,
        status: IntentStatus,
        note: &str,
    ) -> BillingResult<()> {
        let history_entry = json!([{
            "status": status.as_str(),
            "at": OffsetDateTime::now_utc().unix_timestamp(),
            "note": note,
        }]);
        sqlx::query(
            r#"
            UPDATE payment_intents
            SET status = $2,
                status_history = status_history || $3::jsonb,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(intent_id)
        .bind(status.as_str())
        .bind(history_entry)
        .execute(&mut **txn)
        .await?;
        Ok(())
    }

    /// Append the raw provider payload to the payment's webhook audit log.
    async fn append_webhook_log(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        payment_id: Uuid,
        payload: &serde_json::Value,
    ) -> BillingResult<()> {
        let entry = json!([{
            "received_at": OffsetDateTime::now_utc().unix_timestamp(),
            "payload": payload,
        }]);
        sqlx::query(
            r#"
            UPDATE payments
            SET webhook_log = webhook_log || $2::jsonb,
                retry_count = retry_count + 1,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .bind(entry)
        .execute(&mut **txn)
        .await?;
        Ok(())
    }

    /// Final event-status stamp inside the transaction.
    async fn settle_event(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        event_id: Uuid,
        status: &str,
        note: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE payment_webhook_events
            SET status = $2, error = $3, processed_at = NOW(), locked_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(status)
        .bind(note)
        .execute(&mut **txn)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_tolerance_is_one_minor_unit() {
        assert!(amount_within_tolerance(100_000, 100_000));
        assert!(amount_within_tolerance(100_000, 100_001));
        assert!(amount_within_tolerance(100_000, 99_999));
        assert!(!amount_within_tolerance(100_000, 100_002));
        assert!(!amount_within_tolerance(100_000, 50_000));
    }

    #[test]
    fn amount_tolerance_handles_extreme_values() {
        assert!(!amount_within_tolerance(100_000, i64::MIN));
        assert!(!amount_within_tolerance(i64::MAX, i64::MIN));
        assert!(amount_within_tolerance(i64::MIN, i64::MIN + 1));
    }
}
