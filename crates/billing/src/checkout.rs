//! Checkout initiation and cancellation
//!
//! Initiation is risk-gated before any state is created. Intent and
//! payment rows are committed before the outbound provider call so a
//! provider failure leaves an auditable `failed` pair rather than nothing.

use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use sqlx::PgPool;

use finflow_shared::{IntentStatus, Plan};

use crate::error::{BillingError, BillingResult};
use crate::provider::{CheckoutRequest, ProviderRegistry};
use crate::security::{self, MetadataCipher};

/// Abandoned checkouts expire after this many minutes; the reconciliation
/// sweep then resolves them.
pub const INTENT_TTL_MINUTES: i64 = 15;

#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutResponse {
    pub request_id: i64,
    pub payment_url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub expires_in: i64,
    pub provider: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The intent was already terminal; nothing changed.
    AlreadyFinalized,
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    active: bool,
}

#[derive(Clone)]
pub struct CheckoutService {
    pool: PgPool,
    registry: ProviderRegistry,
    cipher: MetadataCipher,
}

impl CheckoutService {
    pub fn new(pool: PgPool, registry: ProviderRegistry, cipher: MetadataCipher) -> Self {
        Self {
            pool,
            registry,
            cipher,
        }
    }

    /// Initiate a hosted checkout for a user and plan.
    pub async fn initiate(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        provider: &str,
        return_url: Option<String>,
        cancel_url: Option<String>,
    ) -> BillingResult<CheckoutResponse> {
        let adapter = self.registry.get(provider)?;

        let user: Option<UserRow> = sqlx::query_as("SELECT active FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        let plan: Option<Plan> = sqlx::query_as("SELECT * FROM plans WHERE id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;

        let user_active = user.map(|u| u.active).unwrap_or(false);
        let (plan_active, amount) = plan
            .as_ref()
            .map(|p| (p.active, p.price_minor))
            .unwrap_or((false, 0));

        // Risk gate: deny before any state exists.
        let risk = security::assess_risk(user_active, plan_active, amount);
        if !risk.allowed {
            tracing::warn!(
                user_id = %user_id,
                plan_id = %plan_id,
                flags = ?risk.flags,
                "Checkout blocked by risk assessment"
            );
            return Err(BillingError::RiskDenied(risk.flags));
        }
        let plan = plan.ok_or(BillingError::PlanNotFound(plan_id))?;

        let order_code = security::generate_order_code();
        let now = OffsetDateTime::now_utc();
        let expires_at = now + time::Duration::minutes(INTENT_TTL_MINUTES);

        let metadata = json!({
            "plan_id": plan.id,
            "user_id": user_id,
        })
        .to_string();
        let metadata_enc = self.cipher.encrypt(&metadata)?;

        // Create the intent/payment pair atomically before calling out.
        let mut txn = self.pool.begin().await?;
        let (intent_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO payment_intents
                (user_id, plan_id, provider, amount, currency, request_id,
                 status, expires_at, metadata_enc, status_history)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8,
                    jsonb_build_array(jsonb_build_object('status', 'pending', 'at', $9::bigint)))
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(plan.id)
        .bind(adapter.name())
        .bind(plan.price_minor)
        .bind(&plan.currency)
        .bind(order_code)
        .bind(expires_at)
        .bind(&metadata_enc)
        .bind(now.unix_timestamp())
        .fetch_one(&mut *txn)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO payments
                (user_id, intent_id, amount, currency, provider, request_id, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending')
            "#,
        )
        .bind(user_id)
        .bind(intent_id)
        .bind(plan.price_minor)
        .bind(&plan.currency)
        .bind(adapter.name())
        .bind(order_code)
        .execute(&mut *txn)
        .await?;
        txn.commit().await?;

        let request = CheckoutRequest {
            order_code,
            amount: plan.price_minor,
            currency: plan.currency.clone(),
            description: format!("{} subscription", plan.name),
            return_url: return_url.unwrap_or_else(|| adapter.default_return_url().to_string()),
            cancel_url: cancel_url.unwrap_or_else(|| adapter.default_cancel_url().to_string()),
        };

        match adapter.create_checkout(&request).await {
            Ok(session) => {
                if let Some(signature) = &session.provider_signature {
                    sqlx::query(
                        "UPDATE payment_intents SET provider_signature = $2, updated_at = NOW()
                         WHERE id = $1",
                    )
                    .bind(intent_id)
                    .bind(signature)
                    .execute(&self.pool)
                    .await?;
                }

                tracing::info!(
                    user_id = %user_id,
                    request_id = order_code,
                    provider = adapter.name(),
                    "Checkout initiated"
                );

                Ok(CheckoutResponse {
                    request_id: order_code,
                    payment_url: session.payment_url,
                    expires_at,
                    expires_in: (expires_at - now).whole_seconds(),
                    provider: adapter.name().to_string(),
                })
            }
            Err(e) => {
                // Transient provider failure: mark the pair failed with
                // the provider's error attached; the user may re-initiate.
                let reason = e.to_string();
                let mut txn = self.pool.begin().await?;
                sqlx::query(
                    r#"
                    UPDATE payment_intents
                    SET status = 'failed',
                        status_history = status_history ||
                            jsonb_build_array(jsonb_build_object('status', 'failed', 'note', $2::text)),
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(intent_id)
                .bind(&reason)
                .execute(&mut *txn)
                .await?;
                sqlx::query(
                    r#"
                    UPDATE payments
                    SET status = 'failed', failure_reason = $2, updated_at = NOW()
                    WHERE intent_id = $1
                    "#,
                )
                .bind(intent_id)
                .bind(&reason)
                .execute(&mut *txn)
                .await?;
                txn.commit().await?;

                tracing::error!(
                    user_id = %user_id,
                    request_id = order_code,
                    error = %reason,
                    "Provider checkout creation failed"
                );
                Err(e)
            }
        }
    }

    /// Cancel a user's non-terminal checkout.
    pub async fn cancel(&self, user_id: Uuid, request_id: i64) -> BillingResult<CancelOutcome> {
        let mut txn = self.pool.begin().await?;

        let row: Option<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, status FROM payment_intents
            WHERE request_id = $1 AND user_id = $2
            FOR UPDATE
            "#,
        )
        .bind(request_id)
        .bind(user_id)
        .fetch_optional(&mut *txn)
        .await?;

        let (intent_id, status) = row.ok_or(BillingError::IntentNotFound(request_id))?;
        let status: IntentStatus = status
            .parse()
            .map_err(|_| BillingError::Internal(format!("bad intent status {status}")))?;

        if status.is_terminal() {
            txn.rollback().await?;
            return Ok(CancelOutcome::AlreadyFinalized);
        }

        sqlx::query(
            r#"
            UPDATE payment_intents
            SET status = 'cancelled',
                status_history = status_history ||
                    jsonb_build_array(jsonb_build_object('status', 'cancelled', 'note', 'user_cancelled')),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(intent_id)
        .execute(&mut *txn)
        .await?;

        sqlx::query(
            r#"
            UPDATE payments
            SET status = 'failed', failure_reason = 'user_cancelled', updated_at = NOW()
            WHERE intent_id = $1 AND status = 'pending'
            "#,
        )
        .bind(intent_id)
        .execute(&mut *txn)
        .await?;

        txn.commit().await?;

        tracing::info!(user_id = %user_id, request_id, "Checkout cancelled");
        Ok(CancelOutcome::Cancelled)
    }
}
