//! Provider adapter seam
//!
//! Translates a specific payment provider's request/response shape into a
//! neutral charge tuple and performs outbound checkout-creation calls.
//! The state machine only ever sees [`ChargeUpdate`]; adding a provider
//! means adding an adapter, not touching the state machine.

pub mod paylink;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

pub use paylink::{PaylinkAdapter, PaylinkConfig};

/// Neutral charge status after provider-specific string mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
}

/// What one provider notification says about a charge.
#[derive(Debug, Clone)]
pub struct ChargeUpdate {
    pub status: ChargeStatus,
    /// Amount the provider states, in minor units, when present.
    pub amount: Option<i64>,
    pub transaction_id: Option<String>,
    pub paid_at: Option<OffsetDateTime>,
}

/// Input for an outbound checkout-creation call.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub order_code: i64,
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub return_url: String,
    pub cancel_url: String,
}

/// Result of a successful checkout-creation call.
#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub payment_url: String,
    /// Signature the provider supplied on creation, retained for audit.
    pub provider_signature: Option<String>,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Verify an inbound payload signature against the shared secret.
    fn verify_signature(&self, payload: &serde_json::Value, signature: &str) -> bool;

    /// Extract the provider-assigned event id used as the idempotency key.
    fn extract_event_id(&self, payload: &serde_json::Value) -> Option<String>;

    /// Best-effort extraction of the correlated order code.
    fn extract_request_id(&self, payload: &serde_json::Value) -> Option<i64>;

    /// Map the provider payload to a neutral charge update.
    fn interpret(&self, payload: &serde_json::Value) -> ChargeUpdate;

    /// Source IPs this provider is allowed to call us from. Empty means
    /// the allow-list check is skipped.
    fn ip_allowlist(&self) -> &[String];

    /// Configured fallback URLs when the caller supplies none.
    fn default_return_url(&self) -> &str;
    fn default_cancel_url(&self) -> &str;

    /// Create a hosted checkout with the provider.
    async fn create_checkout(&self, req: &CheckoutRequest) -> BillingResult<CheckoutSession>;
}

/// Adapter lookup by provider name for the HTTP path and workers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.name(), adapter);
        self
    }

    pub fn get(&self, name: &str) -> BillingResult<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| BillingError::UnknownProvider(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.adapters.keys().copied().collect()
    }
}
