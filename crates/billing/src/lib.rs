// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError variants carry diagnostic payloads
#![allow(clippy::too_many_arguments)] // Some checkout operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Finflow Billing Module
//!
//! Payment-webhook reconciliation and billing core: admits provider
//! notifications, records them in an idempotency ledger, and drives the
//! transactional intent/payment/subscription state machine.
//!
//! ## Features
//!
//! - **Admission Gate**: Rate limit, size, IP, timestamp, and signature checks
//! - **Idempotency Ledger**: Exactly-once registration of provider events
//! - **Payment Processing**: Transactional charge application with monotonic statuses
//! - **Checkout**: Risk-gated hosted checkout initiation and cancellation
//! - **Subscriptions**: Single-active-per-user activation with quota resets
//! - **Reconciliation**: Stale intent expiry sweep
//! - **Auto-Renewal**: Renewal checkout creation for expiring subscriptions
//! - **Invariants**: Runnable consistency checks over the whole data model

pub mod admission;
pub mod checkout;
pub mod error;
pub mod events;
pub mod invariants;
pub mod ledger;
pub mod processor;
pub mod provider;
pub mod rate_limit;
pub mod reconciliation;
pub mod renewal;
pub mod security;
pub mod subscriptions;

#[cfg(test)]
mod edge_case_tests;

// Admission
pub use admission::{
    Admitted, AdmissionGate, AdmissionRejection, AdmissionRequest, MAX_PAYLOAD_BYTES,
    TIMESTAMP_TOLERANCE_SECS,
};

// Checkout
pub use checkout::{CancelOutcome, CheckoutResponse, CheckoutService, INTENT_TTL_MINUTES};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{DomainEvent, EventPublisher};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{IdempotencyLedger, RegisterOutcome, WebhookEventRecord};

// Processor
pub use processor::{DrainSummary, PaymentProcessor, ProcessOutcome};

// Provider
pub use provider::{
    ChargeStatus, ChargeUpdate, CheckoutRequest, CheckoutSession, ProviderAdapter,
    ProviderRegistry,
};
pub use provider::paylink::{PaylinkAdapter, PaylinkConfig};

// Rate Limit
pub use rate_limit::{RateLimitResult, RateLimiter, DEFAULT_EVENTS_PER_SECOND};

// Reconciliation
pub use reconciliation::{ReconciliationService, SweepSummary};

// Renewal
pub use renewal::{AutoRenewalService, RenewalSummary};

// Security
pub use security::{MetadataCipher, RiskAssessment, MAX_SAFE_ORDER_CODE};

// Subscriptions
pub use subscriptions::{RenewableSubscription, SubscriptionRecord, SubscriptionService};

use sqlx::PgPool;
use std::sync::Arc;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub admission: AdmissionGate,
    pub checkout: CheckoutService,
    pub events: EventPublisher,
    pub ledger: IdempotencyLedger,
    pub processor: PaymentProcessor,
    pub reconciliation: ReconciliationService,
    pub registry: ProviderRegistry,
    pub renewal: AutoRenewalService,
    pub subscriptions: SubscriptionService,
}

impl BillingService {
    /// Create a new billing service from environment variables.
    ///
    /// Spawns the event drain task, so a Tokio runtime must be running.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let paylink_config = PaylinkConfig::from_env()?;
        // Metadata encryption is keyed independently of the provider
        // credential; deployments without METADATA_SECRET fall back to
        // the provider secret.
        let metadata_secret = std::env::var("METADATA_SECRET")
            .unwrap_or_else(|_| paylink_config.secret.clone());
        let cipher = MetadataCipher::new(&metadata_secret);
        let registry =
            ProviderRegistry::new().register(Arc::new(PaylinkAdapter::new(paylink_config)?));

        let publisher = EventPublisher::spawn(pool.clone());
        let subscriptions = SubscriptionService::new(pool.clone());
        let checkout = CheckoutService::new(pool.clone(), registry.clone(), cipher.clone());

        Ok(Self {
            admission: AdmissionGate::new(RateLimiter::new_in_memory(DEFAULT_EVENTS_PER_SECOND)),
            processor: PaymentProcessor::new(
                pool.clone(),
                registry.clone(),
                cipher,
                publisher.clone(),
            ),
            ledger: IdempotencyLedger::new(pool.clone()),
            reconciliation: ReconciliationService::new(pool.clone(), publisher.clone()),
            renewal: AutoRenewalService::new(
                pool,
                subscriptions.clone(),
                checkout.clone(),
                publisher.clone(),
                "paylink".to_string(),
            ),
            checkout,
            events: publisher,
            registry,
            subscriptions,
        })
    }
}
