//! Idempotency ledger
//!
//! Durable, uniquely-keyed record of every admitted webhook event.
//! `(provider, event_id)` is the sole idempotency key: the insert either
//! creates a fresh `queued` record or collides, in which case the existing
//! record is returned untouched and no downstream processing is triggered.
//! Records are never deleted; settled events stay available for audit and
//! replay indefinitely.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use finflow_shared::WebhookEventStatus;

use crate::error::{BillingError, BillingResult};
use crate::provider::ProviderAdapter;

/// One admitted, deduplicated inbound notification.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub provider: String,
    pub event_id: String,
    pub request_id: Option<i64>,
    pub signature: String,
    pub provider_timestamp: Option<OffsetDateTime>,
    pub payload: serde_json::Value,
    pub raw_body: String,
    pub status: String,
    pub attempts: i32,
    pub last_attempt_at: Option<OffsetDateTime>,
    pub locked_at: Option<OffsetDateTime>,
    pub processed_at: Option<OffsetDateTime>,
    pub error: Option<String>,
    pub created_at: OffsetDateTime,
}

impl WebhookEventRecord {
    pub fn parsed_status(&self) -> WebhookEventStatus {
        self.status
            .parse()
            .unwrap_or(WebhookEventStatus::Failed)
    }
}

/// Outcome of registering an inbound notification.
#[derive(Debug)]
pub enum RegisterOutcome {
    /// Freshly queued; processing should be dispatched asynchronously.
    Created(WebhookEventRecord),
    /// Key collision; the existing record is returned and nothing runs.
    Duplicate(WebhookEventRecord),
}

#[derive(Clone)]
pub struct IdempotencyLedger {
    pool: PgPool,
}

impl IdempotencyLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register an admitted event, or detect the duplicate.
    ///
    /// The unique-key insert is atomic: concurrent deliveries of the same
    /// notification race on the constraint, exactly one wins, and the
    /// losers resolve to the winner's record. No existing record is ever
    /// overwritten here.
    pub async fn register_event(
        &self,
        adapter: &dyn ProviderAdapter,
        raw_body: &str,
        parsed: &serde_json::Value,
        signature: &str,
        provider_timestamp: OffsetDateTime,
    ) -> BillingResult<RegisterOutcome> {
        let event_id = adapter
            .extract_event_id(parsed)
            .ok_or(BillingError::EventIdMissing)?;
        let request_id = adapter.extract_request_id(parsed);

        let inserted: Option<WebhookEventRecord> = sqlx::query_as(
            r#"
            INSERT INTO payment_webhook_events
                (provider, event_id, request_id, signature, provider_timestamp,
                 payload, raw_body, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'queued')
            ON CONFLICT (provider, event_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(adapter.name())
        .bind(&event_id)
        .bind(request_id)
        .bind(signature)
        .bind(provider_timestamp)
        .bind(parsed)
        .bind(raw_body)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(record) = inserted {
            tracing::info!(
                provider = adapter.name(),
                event_id = %event_id,
                request_id = ?request_id,
                "Webhook event queued"
            );
            return Ok(RegisterOutcome::Created(record));
        }

        let existing: WebhookEventRecord = sqlx::query_as(
            "SELECT * FROM payment_webhook_events WHERE provider = $1 AND event_id = $2",
        )
        .bind(adapter.name())
        .bind(&event_id)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            provider = adapter.name(),
            event_id = %event_id,
            status = %existing.status,
            "Duplicate webhook event acknowledged"
        );
        Ok(RegisterOutcome::Duplicate(existing))
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Option<WebhookEventRecord>> {
        let record = sqlx::query_as("SELECT * FROM payment_webhook_events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

}
