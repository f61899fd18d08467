// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Tests critical boundary conditions in:
//! - Admission gate (BILL-A01 to BILL-A07)
//! - Direct confirmation verification (BILL-D01 to BILL-D02)
//! - Canonical signatures (BILL-SIG01 to BILL-SIG05)
//! - Order codes and amount tolerance (BILL-C01 to BILL-C05)
//! - Status transitions (BILL-ST01 to BILL-ST06)
//! - Period arithmetic (BILL-P01 to BILL-P03)

#[cfg(test)]
mod admission_tests {
    use crate::admission::*;
    use crate::provider::{
        ChargeStatus, ChargeUpdate, CheckoutRequest, CheckoutSession, ProviderAdapter,
    };
    use crate::rate_limit::RateLimiter;
    use crate::security;
    use crate::BillingResult;
    use async_trait::async_trait;
    use serde_json::json;
    use time::OffsetDateTime;

    const SECRET: &str = "gate-test-secret";

    struct GateAdapter {
        allowlist: Vec<String>,
    }

    #[async_trait]
    impl ProviderAdapter for GateAdapter {
        fn name(&self) -> &'static str {
            "gate-test"
        }
        fn verify_signature(&self, payload: &serde_json::Value, signature: &str) -> bool {
            security::verify_signature(payload, signature, SECRET)
        }
        fn extract_event_id(&self, _payload: &serde_json::Value) -> Option<String> {
            None
        }
        fn extract_request_id(&self, _payload: &serde_json::Value) -> Option<i64> {
            None
        }
        fn interpret(&self, _payload: &serde_json::Value) -> ChargeUpdate {
            ChargeUpdate {
                status: ChargeStatus::Pending,
                amount: None,
                transaction_id: None,
                paid_at: None,
            }
        }
        fn ip_allowlist(&self) -> &[String] {
            &self.allowlist
        }
        fn default_return_url(&self) -> &str {
            ""
        }
        fn default_cancel_url(&self) -> &str {
            ""
        }
        async fn create_checkout(&self, _req: &CheckoutRequest) -> BillingResult<CheckoutSession> {
            Ok(CheckoutSession {
                payment_url: "https://example.test/pay".to_string(),
                provider_signature: None,
            })
        }
    }

    fn signed_request(payload: &serde_json::Value, now: OffsetDateTime) -> (String, String) {
        let signature = security::canonical_signature(payload, SECRET).unwrap();
        (signature, now.unix_timestamp().to_string())
    }

    // =========================================================================
    // BILL-A01: Fully valid request passes every check
    // =========================================================================
    #[tokio::test]
    async fn test_valid_request_admitted() {
        let gate = AdmissionGate::new(RateLimiter::new_in_memory(10));
        let adapter = GateAdapter { allowlist: vec![] };
        let payload = json!({"orderCode": 42, "status": "PAID"});
        let now = OffsetDateTime::now_utc();
        let (signature, ts) = signed_request(&payload, now);

        let request = AdmissionRequest {
            raw_body: b"{}",
            parsed: &payload,
            signature: Some(&signature),
            timestamp: Some(&ts),
            forwarded_for: None,
            remote_addr: Some("10.0.0.1"),
        };

        let admitted = gate.check_at(&adapter, &request, now).await;
        assert!(admitted.is_ok());
        assert_eq!(admitted.unwrap().signature, signature);
    }

    // =========================================================================
    // BILL-A02: Oversized payload rejected with 413 before signature check
    // =========================================================================
    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let gate = AdmissionGate::new(RateLimiter::new_in_memory(10));
        let adapter = GateAdapter { allowlist: vec![] };
        let payload = json!({});
        let body = vec![b'x'; MAX_PAYLOAD_BYTES + 1];

        let request = AdmissionRequest {
            raw_body: &body,
            parsed: &payload,
            signature: None,
            timestamp: None,
            forwarded_for: None,
            remote_addr: None,
        };

        let rejection = gate
            .check_at(&adapter, &request, OffsetDateTime::now_utc())
            .await
            .unwrap_err();
        assert_eq!(rejection.status, 413);
    }

    // =========================================================================
    // BILL-A03: Source IP outside the allow-list rejected with 403
    // =========================================================================
    #[tokio::test]
    async fn test_ip_outside_allowlist_rejected() {
        let gate = AdmissionGate::new(RateLimiter::new_in_memory(10));
        let adapter = GateAdapter {
            allowlist: vec!["203.0.113.7".to_string()],
        };
        let payload = json!({});

        let request = AdmissionRequest {
            raw_body: b"{}",
            parsed: &payload,
            signature: None,
            timestamp: None,
            forwarded_for: Some("198.51.100.1, 203.0.113.7"),
            remote_addr: Some("203.0.113.7"),
        };

        // First forwarded-for hop wins, and it is not allow-listed.
        let rejection = gate
            .check_at(&adapter, &request, OffsetDateTime::now_utc())
            .await
            .unwrap_err();
        assert_eq!(rejection.status, 403);
    }

    // =========================================================================
    // BILL-A04: Timestamp at exactly the tolerance boundary is accepted
    // =========================================================================
    #[tokio::test]
    async fn test_timestamp_at_tolerance_boundary_accepted() {
        let gate = AdmissionGate::new(RateLimiter::new_in_memory(10));
        let adapter = GateAdapter { allowlist: vec![] };
        let payload = json!({"orderCode": 7});
        let now = OffsetDateTime::now_utc();
        let stale = now - time::Duration::seconds(TIMESTAMP_TOLERANCE_SECS);
        let signature = crate::security::canonical_signature(&payload, SECRET).unwrap();
        let ts = stale.unix_timestamp().to_string();

        let request = AdmissionRequest {
            raw_body: b"{}",
            parsed: &payload,
            signature: Some(&signature),
            timestamp: Some(&ts),
            forwarded_for: None,
            remote_addr: None,
        };

        assert!(gate.check_at(&adapter, &request, now).await.is_ok());
    }

    // =========================================================================
    // BILL-A05: Timestamp one second past tolerance rejected with 408
    // =========================================================================
    #[tokio::test]
    async fn test_timestamp_past_tolerance_rejected() {
        let gate = AdmissionGate::new(RateLimiter::new_in_memory(10));
        let adapter = GateAdapter { allowlist: vec![] };
        let payload = json!({});
        let now = OffsetDateTime::now_utc();
        let stale = now - time::Duration::seconds(TIMESTAMP_TOLERANCE_SECS + 1);
        let ts = stale.unix_timestamp().to_string();

        let request = AdmissionRequest {
            raw_body: b"{}",
            parsed: &payload,
            signature: Some("irrelevant"),
            timestamp: Some(&ts),
            forwarded_for: None,
            remote_addr: None,
        };

        let rejection = gate.check_at(&adapter, &request, now).await.unwrap_err();
        assert_eq!(rejection.status, 408);
    }

    // =========================================================================
    // BILL-A06: Tampered payload fails signature verification with 401
    // =========================================================================
    #[tokio::test]
    async fn test_tampered_payload_rejected() {
        let gate = AdmissionGate::new(RateLimiter::new_in_memory(10));
        let adapter = GateAdapter { allowlist: vec![] };
        let signed = json!({"amount": 50000});
        let tampered = json!({"amount": 1});
        let now = OffsetDateTime::now_utc();
        let signature = crate::security::canonical_signature(&signed, SECRET).unwrap();
        let ts = now.unix_timestamp().to_string();

        let request = AdmissionRequest {
            raw_body: b"{}",
            parsed: &tampered,
            signature: Some(&signature),
            timestamp: Some(&ts),
            forwarded_for: None,
            remote_addr: None,
        };

        let rejection = gate.check_at(&adapter, &request, now).await.unwrap_err();
        assert_eq!(rejection.status, 401);
    }

    // =========================================================================
    // BILL-A07: Rate limit exhaustion rejected with 429 before anything else
    // =========================================================================
    #[tokio::test]
    async fn test_rate_limit_exhaustion_rejected() {
        let gate = AdmissionGate::new(RateLimiter::new_in_memory(1));
        let adapter = GateAdapter { allowlist: vec![] };
        let payload = json!({"orderCode": 1});
        let now = OffsetDateTime::now_utc();
        let signature = crate::security::canonical_signature(&payload, SECRET).unwrap();
        let ts = now.unix_timestamp().to_string();

        let request = AdmissionRequest {
            raw_body: b"{}",
            parsed: &payload,
            signature: Some(&signature),
            timestamp: Some(&ts),
            forwarded_for: None,
            remote_addr: None,
        };

        assert!(gate.check_at(&adapter, &request, now).await.is_ok());
        let rejection = gate.check_at(&adapter, &request, now).await.unwrap_err();
        assert_eq!(rejection.status, 429);
    }
}

#[cfg(test)]
mod confirmation_tests {
    use crate::provider::paylink::{PaylinkAdapter, PaylinkConfig};
    use crate::provider::{ChargeStatus, ProviderAdapter};
    use crate::security;
    use serde_json::json;

    const SECRET: &str = "confirm-test-secret";

    fn adapter() -> PaylinkAdapter {
        PaylinkAdapter::new(PaylinkConfig {
            secret: SECRET.to_string(),
            base_url: "https://api.paylink.example".to_string(),
            ip_allowlist: Vec::new(),
            default_return_url: String::new(),
            default_cancel_url: String::new(),
        })
        .unwrap()
    }

    // =========================================================================
    // BILL-D01: A client-forged PAID payload fails provider verification.
    // The return-URL confirmation path runs this exact check before any
    // state is touched, so a fabricated payload can never finalize a
    // payment or grant a subscription.
    // =========================================================================
    #[test]
    fn test_forged_confirmation_payload_rejected() {
        let adapter = adapter();
        let payload = json!({
            "code": "00",
            "data": {
                "status": "PAID",
                "amount": 100_000,
                "orderCode": 1756000000123456_i64,
            }
        });

        // The payload alone would drive a terminal completed transition...
        assert_eq!(adapter.interpret(&payload).status, ChargeStatus::Completed);
        // ...but without the provider's signature it never gets that far.
        assert!(!adapter.verify_signature(&payload, ""));
        assert!(!adapter.verify_signature(&payload, "deadbeef"));

        // A signature minted with a different key is rejected too.
        let foreign =
            security::canonical_signature(&payload["data"], "some-other-secret").unwrap();
        assert!(!adapter.verify_signature(&payload, &foreign));
    }

    // =========================================================================
    // BILL-D02: A genuinely provider-signed return payload verifies, and
    // tampering with the verified fields afterwards breaks it.
    // =========================================================================
    #[test]
    fn test_signed_confirmation_payload_verifies() {
        let adapter = adapter();
        let mut payload = json!({
            "code": "00",
            "data": {
                "status": "PAID",
                "amount": 100_000,
                "orderCode": 1756000000123456_i64,
            }
        });
        let signature = security::canonical_signature(&payload["data"], SECRET).unwrap();
        assert!(adapter.verify_signature(&payload, &signature));

        payload["data"]["amount"] = json!(1);
        assert!(!adapter.verify_signature(&payload, &signature));
    }
}

#[cfg(test)]
mod signature_tests {
    use crate::security::*;
    use serde_json::json;

    const SECRET: &str = "sig-test-secret";

    // =========================================================================
    // BILL-SIG01: Key order never changes the signature
    // =========================================================================
    #[test]
    fn test_signature_is_key_order_independent() {
        let a = json!({"amount": 100, "orderCode": 5, "status": "PAID"});
        let b = json!({"status": "PAID", "amount": 100, "orderCode": 5});
        assert_eq!(
            canonical_signature(&a, SECRET).unwrap(),
            canonical_signature(&b, SECRET).unwrap()
        );
    }

    // =========================================================================
    // BILL-SIG02: Null and empty string canonicalize identically
    // =========================================================================
    #[test]
    fn test_null_and_empty_string_equivalent() {
        let with_null = json!({"desc": null, "orderCode": 1});
        let with_empty = json!({"desc": "", "orderCode": 1});
        assert_eq!(canonical_string(&with_null), canonical_string(&with_empty));
    }

    // =========================================================================
    // BILL-SIG03: Nested objects are sorted recursively
    // =========================================================================
    #[test]
    fn test_nested_objects_sorted() {
        let a = json!({"data": {"b": 1, "a": 2}});
        let b = json!({"data": {"a": 2, "b": 1}});
        assert_eq!(
            canonical_signature(&a, SECRET).unwrap(),
            canonical_signature(&b, SECRET).unwrap()
        );
    }

    // =========================================================================
    // BILL-SIG04: Verification fails on wrong secret and wrong length
    // =========================================================================
    #[test]
    fn test_verification_failure_modes() {
        let payload = json!({"orderCode": 9});
        let signature = canonical_signature(&payload, SECRET).unwrap();

        assert!(verify_signature(&payload, &signature, SECRET));
        assert!(!verify_signature(&payload, &signature, "other-secret"));
        assert!(!verify_signature(&payload, "abc", SECRET));
        assert!(!verify_signature(&payload, "", SECRET));
    }

    // =========================================================================
    // BILL-SIG05: Checkout signature covers the fixed five-field string
    // =========================================================================
    #[test]
    fn test_checkout_signature_is_deterministic() {
        let first = checkout_signature(50000, "https://a/c", "Pro plan", 123, "https://a/r", SECRET)
            .unwrap();
        let second =
            checkout_signature(50000, "https://a/c", "Pro plan", 123, "https://a/r", SECRET)
                .unwrap();
        let different =
            checkout_signature(50001, "https://a/c", "Pro plan", 123, "https://a/r", SECRET)
                .unwrap();
        assert_eq!(first, second);
        assert_ne!(first, different);
    }
}

#[cfg(test)]
mod amount_and_order_code_tests {
    use crate::processor::amount_within_tolerance;
    use crate::security::{generate_order_code, MAX_SAFE_ORDER_CODE};

    // =========================================================================
    // BILL-C01: Amounts within one minor unit are accepted
    // =========================================================================
    #[test]
    fn test_tolerance_accepts_one_minor_unit() {
        assert!(amount_within_tolerance(50000, 50000));
        assert!(amount_within_tolerance(50000, 50001));
        assert!(amount_within_tolerance(50000, 49999));
    }

    // =========================================================================
    // BILL-C02: Two minor units of drift is a mismatch
    // =========================================================================
    #[test]
    fn test_tolerance_rejects_two_minor_units() {
        assert!(!amount_within_tolerance(50000, 50002));
        assert!(!amount_within_tolerance(50000, 49998));
        assert!(!amount_within_tolerance(50000, 0));
    }

    // =========================================================================
    // BILL-C03: Tolerance is symmetric around zero
    // =========================================================================
    #[test]
    fn test_tolerance_near_zero() {
        assert!(amount_within_tolerance(0, 1));
        assert!(amount_within_tolerance(1, 0));
        assert!(!amount_within_tolerance(0, 2));
    }

    // =========================================================================
    // BILL-C04: Generated order codes are positive and 53-bit safe
    // =========================================================================
    #[test]
    fn test_order_codes_stay_in_safe_range() {
        for _ in 0..1000 {
            let code = generate_order_code();
            assert!(code > 0);
            assert!(code <= MAX_SAFE_ORDER_CODE);
        }
    }

    // =========================================================================
    // BILL-C05: Consecutive codes are distinct in practice
    // =========================================================================
    #[test]
    fn test_order_codes_rarely_collide() {
        let codes: std::collections::HashSet<i64> =
            (0..50).map(|_| generate_order_code()).collect();
        // Same-millisecond collisions are possible but the random suffix
        // keeps a small batch distinct.
        assert!(codes.len() > 40);
    }
}

#[cfg(test)]
mod status_transition_tests {
    use finflow_shared::{IntentStatus, PaymentStatus};

    // =========================================================================
    // BILL-ST01: Terminal intent statuses accept no transitions
    // =========================================================================
    #[test]
    fn test_terminal_intents_are_immutable() {
        for terminal in [
            IntentStatus::Succeeded,
            IntentStatus::Failed,
            IntentStatus::Cancelled,
            IntentStatus::Expired,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                IntentStatus::Initialized,
                IntentStatus::Pending,
                IntentStatus::Succeeded,
                IntentStatus::Failed,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal} must not move to {next}"
                );
            }
        }
    }

    // =========================================================================
    // BILL-ST02: Intent statuses only move forward
    // =========================================================================
    #[test]
    fn test_intent_statuses_monotonic() {
        assert!(IntentStatus::Initialized.can_transition_to(IntentStatus::Pending));
        assert!(IntentStatus::Pending.can_transition_to(IntentStatus::Succeeded));
        assert!(IntentStatus::Pending.can_transition_to(IntentStatus::Failed));
        assert!(!IntentStatus::Pending.can_transition_to(IntentStatus::Initialized));
    }

    // =========================================================================
    // BILL-ST03: Completed payments may still be refunded
    // =========================================================================
    #[test]
    fn test_completed_payment_refundable() {
        assert!(PaymentStatus::Completed.can_transition_to(PaymentStatus::Refunded));
        assert!(!PaymentStatus::Refunded.can_transition_to(PaymentStatus::Completed));
        assert!(!PaymentStatus::Failed.can_transition_to(PaymentStatus::Completed));
    }

    // =========================================================================
    // BILL-ST04: Status strings round-trip through parse
    // =========================================================================
    #[test]
    fn test_status_round_trips() {
        for status in [
            IntentStatus::Initialized,
            IntentStatus::Pending,
            IntentStatus::RequiresAction,
            IntentStatus::Succeeded,
            IntentStatus::Failed,
            IntentStatus::Cancelled,
            IntentStatus::Expired,
        ] {
            let parsed: IntentStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<IntentStatus>().is_err());
    }

    // =========================================================================
    // BILL-ST05: Refunded charge maps to refunded payment only
    // =========================================================================
    #[test]
    fn test_refund_does_not_rewind_intent() {
        // The processor moves the payment to refunded while the intent
        // permanently keeps succeeded; both directions checked here.
        assert!(IntentStatus::Succeeded.is_terminal());
        assert!(PaymentStatus::Completed.can_transition_to(PaymentStatus::Refunded));
    }

    // =========================================================================
    // BILL-ST06: Unknown provider strings stay non-terminal
    // =========================================================================
    #[test]
    fn test_unknown_provider_status_pending() {
        use crate::provider::paylink::map_status;
        use crate::provider::ChargeStatus;
        assert_eq!(map_status("FUTURE_STATE"), ChargeStatus::Pending);
        assert_eq!(map_status(""), ChargeStatus::Pending);
    }
}

#[cfg(test)]
mod period_tests {
    use crate::subscriptions::add_months;
    use time::macros::datetime;

    // =========================================================================
    // BILL-P01: One month from the 31st clamps to the next month's end
    // =========================================================================
    #[test]
    fn test_month_end_clamping() {
        let start = datetime!(2026-01-31 12:00 UTC);
        assert_eq!(add_months(start, 1), datetime!(2026-02-28 12:00 UTC));
    }

    // =========================================================================
    // BILL-P02: Leap-year February keeps the 29th
    // =========================================================================
    #[test]
    fn test_leap_year_february() {
        let start = datetime!(2028-01-31 00:00 UTC);
        assert_eq!(add_months(start, 1), datetime!(2028-02-29 00:00 UTC));
    }

    // =========================================================================
    // BILL-P03: Twelve months lands on the same calendar day next year
    // =========================================================================
    #[test]
    fn test_full_year() {
        let start = datetime!(2026-03-15 08:30 UTC);
        assert_eq!(add_months(start, 12), datetime!(2027-03-15 08:30 UTC));
    }
}
