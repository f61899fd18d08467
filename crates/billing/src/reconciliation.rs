//! Reconciliation sweep
//!
//! Resolves abandoned checkouts: pending intents whose TTL elapsed are
//! expired and their pending payments failed, in one transaction per
//! intent so a single bad row cannot stall the sweep. Expiry events are
//! published only after each commit.

use serde_json::json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::events::{names, EventPublisher};

/// Rows swept per invocation; the scheduler invokes often enough that a
/// backlog drains over a few cycles.
pub const SWEEP_BATCH_SIZE: i64 = 100;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub scanned: usize,
    pub expired: usize,
    pub failed: usize,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleIntent {
    id: Uuid,
    user_id: Uuid,
    request_id: i64,
    provider: String,
}

#[derive(Clone)]
pub struct ReconciliationService {
    pool: PgPool,
    publisher: EventPublisher,
}

impl ReconciliationService {
    pub fn new(pool: PgPool, publisher: EventPublisher) -> Self {
        Self { pool, publisher }
    }

    /// Expire pending intents past their deadline.
    pub async fn expire_stale_intents(&self) -> BillingResult<SweepSummary> {
        self.expire_stale_intents_at(OffsetDateTime::now_utc()).await
    }

    pub async fn expire_stale_intents_at(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<SweepSummary> {
        let stale: Vec<StaleIntent> = sqlx::query_as(
            r#"
            SELECT id, user_id, request_id, provider
            FROM payment_intents
            WHERE status = 'pending' AND expires_at < $1
            ORDER BY expires_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(SWEEP_BATCH_SIZE)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = SweepSummary {
            scanned: stale.len(),
            ..Default::default()
        };

        for intent in stale {
            match self.expire_one(&intent).await {
                Ok(true) => {
                    summary.expired += 1;
                    self.publisher.publish(
                        names::PAYMENT_EXPIRED,
                        json!({
                            "request_id": intent.request_id,
                            "user_id": intent.user_id,
                            "provider": intent.provider,
                        }),
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(
                        intent_id = %intent.id,
                        request_id = intent.request_id,
                        error = %e,
                        "Failed to expire stale intent"
                    );
                }
            }
        }

        if summary.scanned > 0 {
            tracing::info!(
                scanned = summary.scanned,
                expired = summary.expired,
                failed = summary.failed,
                "Reconciliation sweep complete"
            );
        }
        Ok(summary)
    }

    /// Returns true if this call performed the expiry. A concurrent
    /// webhook may have finalized the intent between select and lock;
    /// the re-check under FOR UPDATE makes that race safe.
    async fn expire_one(&self, intent: &StaleIntent) -> BillingResult<bool> {
        let mut txn = self.pool.begin().await?;

        let still_pending: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM payment_intents WHERE id = $1 AND status = 'pending' FOR UPDATE",
        )
        .bind(intent.id)
        .fetch_optional(&mut *txn)
        .await?;

        if still_pending.is_none() {
            txn.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE payment_intents
            SET status = 'expired',
                status_history = status_history ||
                    jsonb_build_array(jsonb_build_object('status', 'expired', 'note', 'ttl_elapsed')),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(intent.id)
        .execute(&mut *txn)
        .await?;

        sqlx::query(
            r#"
            UPDATE payments
            SET status = 'failed', failure_reason = 'expired_intent', updated_at = NOW()
            WHERE intent_id = $1 AND status = 'pending'
            "#,
        )
        .bind(intent.id)
        .execute(&mut *txn)
        .await?;

        txn.commit().await?;
        Ok(true)
    }
}
