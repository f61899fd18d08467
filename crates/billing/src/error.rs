//! Billing error taxonomy
//!
//! Maps the failure classes the webhook path distinguishes: admission
//! rejections, signature failures (adversarial, terminal), consistency
//! faults (retryable, operator attention), transient provider failures,
//! and expected idempotent no-ops (not errors at the HTTP layer).

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Request rejected before any state was touched.
    #[error("admission rejected ({status}): {reason}")]
    Admission { status: u16, reason: String },

    /// Signature did not verify; treated as potentially adversarial and
    /// never retried.
    #[error("webhook signature invalid")]
    SignatureInvalid,

    /// No event id could be extracted from the payload, so no idempotency
    /// key exists and nothing was written.
    #[error("cannot determine provider event id from payload")]
    EventIdMissing,

    #[error("payment intent not found for request id {0}")]
    IntentNotFound(i64),

    /// Intent exists but its payment record is missing; a consistency
    /// fault that aborts the transaction for manual review.
    #[error("payment record missing for intent {0}")]
    PaymentMissing(uuid::Uuid),

    /// Provider-stated amount disagrees with the intent beyond the
    /// one-minor-unit tolerance; aborts with no state change.
    #[error("amount mismatch: intent recorded {expected}, provider stated {got}")]
    AmountMismatch { expected: i64, got: i64 },

    #[error("plan {0} not found or inactive")]
    PlanNotFound(uuid::Uuid),

    /// Checkout blocked by the risk gate before any state was created.
    #[error("checkout denied by risk assessment: {0:?}")]
    RiskDenied(Vec<String>),

    /// Outbound provider call failed; the caller sees a 502-class error
    /// and may re-initiate.
    #[error("provider error: {0}")]
    Provider(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("encryption error: {0}")]
    Crypto(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// HTTP status the API layer should surface for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            BillingError::Admission { status, .. } => *status,
            BillingError::SignatureInvalid => 401,
            BillingError::EventIdMissing => 400,
            BillingError::IntentNotFound(_) => 404,
            BillingError::PlanNotFound(_) => 404,
            BillingError::UnknownProvider(_) => 404,
            BillingError::AmountMismatch { .. } => 409,
            BillingError::RiskDenied(_) => 403,
            BillingError::Provider(_) => 502,
            BillingError::PaymentMissing(_)
            | BillingError::Crypto(_)
            | BillingError::Database(_)
            | BillingError::Internal(_) => 500,
        }
    }
}
