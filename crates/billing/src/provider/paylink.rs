//! Paylink gateway adapter
//!
//! Paylink sends webhook payloads shaped as
//! `{"code": "00", "desc": "...", "data": {...}}` with the signature
//! computed over the canonical form of the `data` object. Checkout
//! creation is a signed POST to `/v2/payment-requests`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::security;

use super::{ChargeStatus, ChargeUpdate, CheckoutRequest, CheckoutSession, ProviderAdapter};

const PROVIDER_NAME: &str = "paylink";
const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(10);

/// Map Paylink's status strings to neutral charge statuses. Unknown
/// strings default to `Pending`; the provider will send a follow-up
/// terminal notification later.
pub fn map_status(raw: &str) -> ChargeStatus {
    match raw {
        "PAID" => ChargeStatus::Completed,
        "PROCESSING" => ChargeStatus::Processing,
        "PENDING" => ChargeStatus::Pending,
        "CANCELLED" | "CANCELED" | "EXPIRED" | "FAILED" => ChargeStatus::Failed,
        "REFUNDED" => ChargeStatus::Refunded,
        _ => ChargeStatus::Pending,
    }
}

#[derive(Debug, Clone)]
pub struct PaylinkConfig {
    pub secret: String,
    pub base_url: String,
    pub ip_allowlist: Vec<String>,
    pub default_return_url: String,
    pub default_cancel_url: String,
}

impl PaylinkConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret = std::env::var("PAYLINK_SECRET")
            .map_err(|_| BillingError::Internal("PAYLINK_SECRET not set".to_string()))?;
        let base_url = std::env::var("PAYLINK_BASE_URL")
            .unwrap_or_else(|_| "https://api.paylink.example".to_string());
        let ip_allowlist = std::env::var("PAYLINK_IP_ALLOWLIST")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let default_return_url =
            std::env::var("PAYLINK_RETURN_URL").unwrap_or_else(|_| String::new());
        let default_cancel_url =
            std::env::var("PAYLINK_CANCEL_URL").unwrap_or_else(|_| String::new());

        Ok(Self {
            secret,
            base_url,
            ip_allowlist,
            default_return_url,
            default_cancel_url,
        })
    }
}

pub struct PaylinkAdapter {
    config: PaylinkConfig,
    http: reqwest::Client,
}

impl PaylinkAdapter {
    pub fn new(config: PaylinkConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(OUTBOUND_TIMEOUT)
            .build()
            .map_err(|e| BillingError::Internal(format!("http client: {e}")))?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &PaylinkConfig {
        &self.config
    }

    /// The signed portion of a webhook payload. Paylink signs `data`;
    /// payloads without a `data` object are signed whole.
    fn signed_payload<'a>(payload: &'a serde_json::Value) -> &'a serde_json::Value {
        payload.get("data").filter(|d| d.is_object()).unwrap_or(payload)
    }
}

#[async_trait]
impl ProviderAdapter for PaylinkAdapter {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn verify_signature(&self, payload: &serde_json::Value, signature: &str) -> bool {
        security::verify_signature(Self::signed_payload(payload), signature, &self.config.secret)
    }

    fn extract_event_id(&self, payload: &serde_json::Value) -> Option<String> {
        let data = payload.get("data")?;
        // Prefer the payment-link / transaction reference; fall back to a
        // provider code + order code composite.
        if let Some(id) = data.get("paymentLinkId").and_then(|v| v.as_str()) {
            return Some(id.to_string());
        }
        if let Some(reference) = data.get("reference").and_then(|v| v.as_str()) {
            return Some(reference.to_string());
        }
        let code = payload.get("code").and_then(|v| v.as_str())?;
        let order_code = data.get("orderCode").and_then(|v| v.as_i64())?;
        Some(format!("{code}-{order_code}"))
    }

    fn extract_request_id(&self, payload: &serde_json::Value) -> Option<i64> {
        payload
            .get("data")
            .and_then(|d| d.get("orderCode"))
            .and_then(|v| v.as_i64())
    }

    fn interpret(&self, payload: &serde_json::Value) -> ChargeUpdate {
        let data = payload.get("data").unwrap_or(payload);

        let status = data
            .get("status")
            .and_then(|v| v.as_str())
            .map(map_status)
            .unwrap_or(ChargeStatus::Pending);

        let amount = data.get("amount").and_then(|v| v.as_i64());

        let transaction_id = data
            .get("reference")
            .or_else(|| data.get("paymentLinkId"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let paid_at = data
            .get("transactionDateTime")
            .and_then(|v| v.as_str())
            .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok());

        ChargeUpdate {
            status,
            amount,
            transaction_id,
            paid_at,
        }
    }

    fn ip_allowlist(&self) -> &[String] {
        &self.config.ip_allowlist
    }

    fn default_return_url(&self) -> &str {
        &self.config.default_return_url
    }

    fn default_cancel_url(&self) -> &str {
        &self.config.default_cancel_url
    }

    async fn create_checkout(&self, req: &CheckoutRequest) -> BillingResult<CheckoutSession> {
        let signature = security::checkout_signature(
            req.amount,
            &req.cancel_url,
            &req.description,
            req.order_code,
            &req.return_url,
            &self.config.secret,
        )?;

        let body = json!({
            "orderCode": req.order_code,
            "amount": req.amount,
            "currency": req.currency,
            "description": req.description,
            "returnUrl": req.return_url,
            "cancelUrl": req.cancel_url,
            "signature": signature,
        });

        let url = format!("{}/v2/payment-requests", self.config.base_url);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::Provider(format!("checkout request failed: {e}")))?;

        let status = response.status();
        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BillingError::Provider(format!("unreadable checkout response: {e}")))?;

        if !status.is_success() {
            return Err(BillingError::Provider(format!(
                "checkout rejected ({status}): {parsed}"
            )));
        }

        let code = parsed.get("code").and_then(|v| v.as_str()).unwrap_or("");
        if code != "00" {
            let desc = parsed
                .get("desc")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown provider error");
            return Err(BillingError::Provider(format!(
                "checkout declined: {code} {desc}"
            )));
        }

        let data = parsed.get("data").cloned().unwrap_or_default();
        let payment_url = data
            .get("checkoutUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                BillingError::Provider("checkout response missing checkoutUrl".to_string())
            })?
            .to_string();
        let provider_signature = data
            .get("signature")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        tracing::info!(
            order_code = req.order_code,
            amount = req.amount,
            "Paylink checkout created"
        );

        Ok(CheckoutSession {
            payment_url,
            provider_signature,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn adapter() -> PaylinkAdapter {
        PaylinkAdapter::new(PaylinkConfig {
            secret: "paylink-test-secret".to_string(),
            base_url: "https://api.paylink.example".to_string(),
            ip_allowlist: Vec::new(),
            default_return_url: String::new(),
            default_cancel_url: String::new(),
        })
        .unwrap()
    }

    #[test]
    fn event_id_prefers_payment_link_id() {
        let payload = json!({
            "code": "00",
            "data": {
                "paymentLinkId": "pl_123",
                "reference": "ref_456",
                "orderCode": 1756000000123456_i64,
            }
        });
        assert_eq!(adapter().extract_event_id(&payload).unwrap(), "pl_123");
    }

    #[test]
    fn event_id_falls_back_to_reference() {
        let payload = json!({
            "code": "00",
            "data": { "reference": "ref_456", "orderCode": 1756000000123456_i64 }
        });
        assert_eq!(adapter().extract_event_id(&payload).unwrap(), "ref_456");
    }

    #[test]
    fn event_id_falls_back_to_code_order_composite() {
        let payload = json!({
            "code": "00",
            "data": { "orderCode": 1756000000123456_i64 }
        });
        assert_eq!(
            adapter().extract_event_id(&payload).unwrap(),
            "00-1756000000123456"
        );
    }

    #[test]
    fn event_id_absent_when_nothing_identifies_the_event() {
        // No data object at all.
        assert_eq!(adapter().extract_event_id(&json!({"code": "00"})), None);
        // Data present but no id fields and no top-level code.
        assert_eq!(
            adapter().extract_event_id(&json!({"data": {"orderCode": 5}})),
            None
        );
        // Composite needs the order code too.
        assert_eq!(
            adapter().extract_event_id(&json!({"code": "00", "data": {"status": "PAID"}})),
            None
        );
    }

    #[test]
    fn request_id_reads_the_order_code() {
        let payload = json!({ "data": { "orderCode": 42_i64 } });
        assert_eq!(adapter().extract_request_id(&payload), Some(42));
        assert_eq!(adapter().extract_request_id(&json!({"data": {}})), None);
    }

    #[test]
    fn status_mapping_table() {
        assert_eq!(map_status("PAID"), ChargeStatus::Completed);
        assert_eq!(map_status("PROCESSING"), ChargeStatus::Processing);
        assert_eq!(map_status("PENDING"), ChargeStatus::Pending);
        assert_eq!(map_status("CANCELLED"), ChargeStatus::Failed);
        assert_eq!(map_status("EXPIRED"), ChargeStatus::Failed);
        assert_eq!(map_status("REFUNDED"), ChargeStatus::Refunded);
        // Unknown strings are deliberately non-terminal.
        assert_eq!(map_status("SOMETHING_NEW"), ChargeStatus::Pending);
    }
}
