//! Billing Invariants Module
//!
//! Provides runnable consistency checks for the billing system.
//! These invariants can be run after any mutation or webhook replay to ensure
//! the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write
//! 4. **Complete**: Covers all critical billing consistency requirements

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - system may be charging incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for multiple active subscriptions violation
#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    user_id: Uuid,
    sub_count: i64,
}

/// Row type for succeeded intent without completed payment violation
#[derive(Debug, sqlx::FromRow)]
struct UnpaidSucceededIntentRow {
    intent_id: Uuid,
    user_id: Uuid,
    request_id: i64,
    payment_status: Option<String>,
}

/// Row type for stuck webhook event violation
#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    event_id: String,
    provider: String,
    attempts: i32,
    locked_at: Option<OffsetDateTime>,
}

/// Row type for terminal intent regressing violation
#[derive(Debug, sqlx::FromRow)]
struct RefundedNonSucceededRow {
    payment_id: Uuid,
    user_id: Uuid,
    intent_status: String,
}

/// Row type for amount drift violation
#[derive(Debug, sqlx::FromRow)]
struct AmountDriftRow {
    payment_id: Uuid,
    user_id: Uuid,
    intent_amount: i64,
    payment_amount: i64,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        // Run all checks
        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_succeeded_intent_has_completed_payment().await?);
        violations.extend(self.check_no_stuck_webhook_events().await?);
        violations.extend(self.check_refunds_follow_success().await?);
        violations.extend(self.check_amount_within_tolerance().await?);

        let checks_run = 5;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: At most 1 active subscription per user
    ///
    /// Multiple active subscriptions would cause double-billing and
    /// entitlement confusion. The partial unique index should make this
    /// impossible; a hit here means the index was dropped or bypassed.
    async fn check_single_active_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status = 'active'
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} active subscriptions (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Succeeded intents have a completed or refunded payment
    ///
    /// An intent only succeeds inside the same transaction that completes
    /// its payment, so a succeeded intent whose payment is anything else
    /// signals a broken write path.
    async fn check_succeeded_intent_has_completed_payment(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnpaidSucceededIntentRow> = sqlx::query_as(
            r#"
            SELECT
                i.id as intent_id,
                i.user_id,
                i.request_id,
                p.status as payment_status
            FROM payment_intents i
            LEFT JOIN payments p ON p.intent_id = i.id
            WHERE i.status = 'succeeded'
              AND (p.id IS NULL OR p.status NOT IN ('completed', 'refunded'))
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "succeeded_intent_has_completed_payment".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Intent {} succeeded but its payment is '{}'",
                    row.request_id,
                    row.payment_status.as_deref().unwrap_or("(missing)")
                ),
                context: serde_json::json!({
                    "intent_id": row.intent_id,
                    "request_id": row.request_id,
                    "payment_status": row.payment_status,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: No webhook event stays in 'processing' for long
    ///
    /// A claim holds for the duration of one transaction; an hour-old
    /// claim means a worker died mid-flight and the drain query is not
    /// reclaiming it.
    async fn check_no_stuck_webhook_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT event_id, provider, attempts, locked_at
            FROM payment_webhook_events
            WHERE status = 'processing'
              AND last_attempt_at < NOW() - INTERVAL '1 hour'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_webhook_events".to_string(),
                user_ids: vec![],
                description: format!(
                    "Webhook event '{}' from '{}' stuck in processing after {} attempts",
                    row.event_id, row.provider, row.attempts
                ),
                context: serde_json::json!({
                    "event_id": row.event_id,
                    "provider": row.provider,
                    "attempts": row.attempts,
                    "locked_at": row.locked_at,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: Refunded payments belong to succeeded intents
    ///
    /// A refund never rewinds the intent; a refunded payment whose intent
    /// is not succeeded means something rewrote intent state out of band.
    async fn check_refunds_follow_success(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RefundedNonSucceededRow> = sqlx::query_as(
            r#"
            SELECT
                p.id as payment_id,
                p.user_id,
                i.status as intent_status
            FROM payments p
            JOIN payment_intents i ON i.id = p.intent_id
            WHERE p.status = 'refunded'
              AND i.status != 'succeeded'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "refunds_follow_success".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Refunded payment on an intent in status '{}'",
                    row.intent_status
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "intent_status": row.intent_status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: Payment amount matches its intent within tolerance
    ///
    /// The processor accepts provider rounding of at most one minor unit;
    /// anything larger in the table got there without the tolerance check.
    async fn check_amount_within_tolerance(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<AmountDriftRow> = sqlx::query_as(
            r#"
            SELECT
                p.id as payment_id,
                p.user_id,
                i.amount as intent_amount,
                p.amount as payment_amount
            FROM payments p
            JOIN payment_intents i ON i.id = p.intent_id
            WHERE p.status = 'completed'
              AND ABS(i.amount - p.amount) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "amount_within_tolerance".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Completed payment amount {} drifted from intent amount {}",
                    row.payment_amount, row.intent_amount
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "intent_amount": row.intent_amount,
                    "payment_amount": row.payment_amount,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_subscription" => self.check_single_active_subscription().await,
            "succeeded_intent_has_completed_payment" => {
                self.check_succeeded_intent_has_completed_payment().await
            }
            "no_stuck_webhook_events" => self.check_no_stuck_webhook_events().await,
            "refunds_follow_success" => self.check_refunds_follow_success().await,
            "amount_within_tolerance" => self.check_amount_within_tolerance().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_subscription",
            "succeeded_intent_has_completed_payment",
            "no_stuck_webhook_events",
            "refunds_follow_success",
            "amount_within_tolerance",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"single_active_subscription"));
        assert!(checks.contains(&"amount_within_tolerance"));
    }
}
