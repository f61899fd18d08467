//! Webhook admission gate
//!
//! Per-request validation chain applied before anything durable happens:
//! rate limit, payload size, IP allow-list, timestamp freshness, signature.
//! Checks short-circuit on first failure and touch no storage; rejection
//! has no side effects beyond the rate-limit counter.

use time::OffsetDateTime;

use crate::provider::ProviderAdapter;
use crate::rate_limit::RateLimiter;

/// Raw bodies above this are rejected outright.
pub const MAX_PAYLOAD_BYTES: usize = 1_000_000;

/// Provider timestamps must fall within this many seconds of receipt.
pub const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// The slice of an inbound request the gate inspects.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    pub raw_body: &'a [u8],
    pub parsed: &'a serde_json::Value,
    pub signature: Option<&'a str>,
    /// Provider-supplied freshness timestamp header (unix seconds).
    pub timestamp: Option<&'a str>,
    pub forwarded_for: Option<&'a str>,
    pub remote_addr: Option<&'a str>,
}

/// A request that passed every check.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub signature: String,
    pub timestamp: OffsetDateTime,
}

/// Rejection with an HTTP-style status and a logged reason.
#[derive(Debug, Clone)]
pub struct AdmissionRejection {
    pub status: u16,
    pub reason: String,
}

impl AdmissionRejection {
    fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

/// Resolve the client IP: first entry of a forwarded-for chain, else the
/// socket address.
pub fn resolve_client_ip(forwarded_for: Option<&str>, remote_addr: Option<&str>) -> Option<String> {
    if let Some(chain) = forwarded_for {
        if let Some(first) = chain.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    remote_addr.map(|s| s.to_string())
}

#[derive(Clone)]
pub struct AdmissionGate {
    limiter: RateLimiter,
}

impl AdmissionGate {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }

    pub async fn check(
        &self,
        adapter: &dyn ProviderAdapter,
        request: &AdmissionRequest<'_>,
    ) -> Result<Admitted, AdmissionRejection> {
        self.check_at(adapter, request, OffsetDateTime::now_utc())
            .await
    }

    /// Same as [`check`](Self::check) with an explicit receipt time.
    pub async fn check_at(
        &self,
        adapter: &dyn ProviderAdapter,
        request: &AdmissionRequest<'_>,
        now: OffsetDateTime,
    ) -> Result<Admitted, AdmissionRejection> {
        // 1. Rate limit.
        let rate = self.limiter.check(adapter.name()).await;
        if !rate.allowed {
            tracing::warn!(provider = adapter.name(), "Webhook rate limit exceeded");
            return Err(AdmissionRejection::new(429, "rate limit exceeded"));
        }

        // 2. Payload size.
        if request.raw_body.len() > MAX_PAYLOAD_BYTES {
            return Err(AdmissionRejection::new(
                413,
                format!("payload of {} bytes exceeds ceiling", request.raw_body.len()),
            ));
        }

        // 3. IP allow-list.
        let allowlist = adapter.ip_allowlist();
        if !allowlist.is_empty() {
            let client_ip = resolve_client_ip(request.forwarded_for, request.remote_addr);
            let allowed = client_ip
                .as_deref()
                .map(|ip| allowlist.iter().any(|a| a == ip))
                .unwrap_or(false);
            if !allowed {
                tracing::warn!(
                    provider = adapter.name(),
                    client_ip = ?client_ip,
                    "Webhook from IP outside allow-list"
                );
                return Err(AdmissionRejection::new(403, "source ip not allow-listed"));
            }
        }

        // 4. Timestamp freshness. Bounds replay exposure before the
        // signature is even checked.
        let raw_ts = request
            .timestamp
            .ok_or_else(|| AdmissionRejection::new(400, "missing timestamp header"))?;
        let unix: i64 = raw_ts
            .trim()
            .parse()
            .map_err(|_| AdmissionRejection::new(400, "unparsable timestamp header"))?;
        let timestamp = OffsetDateTime::from_unix_timestamp(unix)
            .map_err(|_| AdmissionRejection::new(400, "timestamp out of range"))?;
        let skew = (now.unix_timestamp() - unix).abs();
        if skew > TIMESTAMP_TOLERANCE_SECS {
            return Err(AdmissionRejection::new(
                408,
                format!("timestamp {skew}s outside freshness window"),
            ));
        }

        // 5. Signature.
        let signature = request
            .signature
            .ok_or_else(|| AdmissionRejection::new(401, "missing signature header"))?;
        if !adapter.verify_signature(request.parsed, signature) {
            tracing::warn!(provider = adapter.name(), "Webhook signature rejected");
            return Err(AdmissionRejection::new(401, "signature verification failed"));
        }

        Ok(Admitted {
            signature: signature.to_string(),
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_prefers_forwarded_for_head() {
        assert_eq!(
            resolve_client_ip(Some("203.0.113.9, 10.0.0.1"), Some("10.0.0.2")),
            Some("203.0.113.9".to_string())
        );
        assert_eq!(
            resolve_client_ip(None, Some("10.0.0.2")),
            Some("10.0.0.2".to_string())
        );
        assert_eq!(resolve_client_ip(None, None), None);
    }
}
