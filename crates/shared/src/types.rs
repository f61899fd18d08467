//! Domain status enums and plan types
//!
//! Statuses are stored as TEXT in Postgres and parsed at the edges; the
//! enums own the legal-transition rules so the state machine never has to
//! reason about raw strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Error returned when a stored status string is not a known variant.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown status string: {0}")]
pub struct StatusParseError(pub String);

/// Lifecycle of a payment intent.
///
/// Transitions are monotonic along
/// `initialized -> pending -> requires_action -> terminal`; once terminal
/// (`succeeded`, `failed`, `cancelled`, `expired`) no further transition
/// is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Initialized,
    Pending,
    RequiresAction,
    Succeeded,
    Failed,
    Cancelled,
    Expired,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Initialized => "initialized",
            IntentStatus::Pending => "pending",
            IntentStatus::RequiresAction => "requires_action",
            IntentStatus::Succeeded => "succeeded",
            IntentStatus::Failed => "failed",
            IntentStatus::Cancelled => "cancelled",
            IntentStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentStatus::Succeeded
                | IntentStatus::Failed
                | IntentStatus::Cancelled
                | IntentStatus::Expired
        )
    }

    /// Ordinal position along the monotonic path. Terminal states share
    /// the highest rank so no terminal-to-terminal hop is legal.
    fn rank(&self) -> u8 {
        match self {
            IntentStatus::Initialized => 0,
            IntentStatus::Pending => 1,
            IntentStatus::RequiresAction => 2,
            _ => 3,
        }
    }

    pub fn can_transition_to(&self, next: IntentStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank() || (next.is_terminal() && !self.is_terminal())
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(IntentStatus::Initialized),
            "pending" => Ok(IntentStatus::Pending),
            "requires_action" => Ok(IntentStatus::RequiresAction),
            "succeeded" => Ok(IntentStatus::Succeeded),
            "failed" => Ok(IntentStatus::Failed),
            "cancelled" => Ok(IntentStatus::Cancelled),
            "expired" => Ok(IntentStatus::Expired),
            other => Err(StatusParseError(other.to_string())),
        }
    }
}

/// Lifecycle of the financial record tied 1:1 to an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
    Voided,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Voided => "voided",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        match self {
            PaymentStatus::Pending => next != PaymentStatus::Pending,
            // A completed payment may still be refunded by the provider.
            PaymentStatus::Completed => next == PaymentStatus::Refunded,
            _ => false,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            "voided" => Ok(PaymentStatus::Voided),
            other => Err(StatusParseError(other.to_string())),
        }
    }
}

/// Processing state of one admitted webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Queued,
    Processing,
    Processed,
    Ignored,
    Failed,
}

impl WebhookEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventStatus::Queued => "queued",
            WebhookEventStatus::Processing => "processing",
            WebhookEventStatus::Processed => "processed",
            WebhookEventStatus::Ignored => "ignored",
            WebhookEventStatus::Failed => "failed",
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            WebhookEventStatus::Processed | WebhookEventStatus::Ignored
        )
    }
}

impl fmt::Display for WebhookEventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookEventStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(WebhookEventStatus::Queued),
            "processing" => Ok(WebhookEventStatus::Processing),
            "processed" => Ok(WebhookEventStatus::Processed),
            "ignored" => Ok(WebhookEventStatus::Ignored),
            "failed" => Ok(WebhookEventStatus::Failed),
            other => Err(StatusParseError(other.to_string())),
        }
    }
}

/// Entitlement state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Expired,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SubscriptionStatus::Pending),
            "active" => Ok(SubscriptionStatus::Active),
            "expired" => Ok(SubscriptionStatus::Expired),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            other => Err(StatusParseError(other.to_string())),
        }
    }
}

/// A purchasable plan.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    /// Price in minor currency units (VND has no subunit, so 1:1).
    pub price_minor: i64,
    pub currency: String,
    /// Billing period length in months.
    pub period_months: i32,
    /// Request quota granted per billing period.
    pub quota_requests: i64,
    pub active: bool,
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_status_round_trips() {
        for s in [
            IntentStatus::Initialized,
            IntentStatus::Pending,
            IntentStatus::RequiresAction,
            IntentStatus::Succeeded,
            IntentStatus::Failed,
            IntentStatus::Cancelled,
            IntentStatus::Expired,
        ] {
            assert_eq!(s.as_str().parse::<IntentStatus>().unwrap(), s);
        }
        assert!("bogus".parse::<IntentStatus>().is_err());
    }

    #[test]
    fn terminal_intent_statuses_admit_no_transition() {
        for terminal in [
            IntentStatus::Succeeded,
            IntentStatus::Failed,
            IntentStatus::Cancelled,
            IntentStatus::Expired,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(IntentStatus::Pending));
            assert!(!terminal.can_transition_to(IntentStatus::Succeeded));
        }
    }

    #[test]
    fn intent_status_path_is_monotonic() {
        assert!(IntentStatus::Initialized.can_transition_to(IntentStatus::Pending));
        assert!(IntentStatus::Pending.can_transition_to(IntentStatus::RequiresAction));
        assert!(IntentStatus::Pending.can_transition_to(IntentStatus::Succeeded));
        assert!(IntentStatus::RequiresAction.can_transition_to(IntentStatus::Failed));
        assert!(!IntentStatus::Pending.can_transition_to(IntentStatus::Initialized));
    }

    #[test]
    fn payment_status_transitions() {
        assert!(PaymentStatus::Pending.can_transition_to(PaymentStatus::Completed));
        assert!(PaymentStatus::Pending.can_transition_to(PaymentStatus::Failed));
        assert!(PaymentStatus::Completed.can_transition_to(PaymentStatus::Refunded));
        assert!(!PaymentStatus::Completed.can_transition_to(PaymentStatus::Failed));
        assert!(!PaymentStatus::Failed.can_transition_to(PaymentStatus::Completed));
        assert!(!PaymentStatus::Refunded.can_transition_to(PaymentStatus::Pending));
    }

    #[test]
    fn webhook_event_settled_states() {
        assert!(WebhookEventStatus::Processed.is_settled());
        assert!(WebhookEventStatus::Ignored.is_settled());
        assert!(!WebhookEventStatus::Queued.is_settled());
        assert!(!WebhookEventStatus::Failed.is_settled());
    }
}
