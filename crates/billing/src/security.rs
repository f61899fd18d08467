//! Canonical-signature construction, metadata encryption, order-code
//! generation, and risk scoring.
//!
//! The provider signs webhook payloads over a canonical string: object keys
//! recursively sorted, nested arrays/objects rendered as compact JSON, and
//! top-level fields joined as `key=value` pairs with `&`. Outbound checkout
//! requests use a narrower fixed-order field list. Both are HMAC-SHA256
//! with a provider-specific shared secret and compared in constant time.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Largest order code the provider's numeric field can carry without
/// precision loss (53-bit safe integer).
pub const MAX_SAFE_ORDER_CODE: i64 = (1i64 << 53) - 1;

/// Recursively sort all object keys. serde_json's `Map` preserves
/// insertion order, so rebuilding in sorted order fixes serialization.
fn sort_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = serde_json::Map::new();
            for (k, v) in entries {
                sorted.insert(k.clone(), sort_keys(v));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sort_keys).collect())
        }
        other => other.clone(),
    }
}

/// Render one top-level value for the canonical string. Scalars render
/// bare (strings without quotes, null as empty); arrays and objects
/// render as compact JSON with sorted keys.
fn canonical_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        nested => sort_keys(nested).to_string(),
    }
}

/// Build the canonical `key=value&key=value` string for a payload.
pub fn canonical_string(payload: &serde_json::Value) -> String {
    let mut keys: Vec<&String> = match payload.as_object() {
        Some(map) => map.keys().collect(),
        None => return canonical_value(payload),
    };
    keys.sort();
    keys.iter()
        .map(|k| {
            let v = &payload[k.as_str()];
            format!("{}={}", k, canonical_value(v))
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn hmac_hex(secret: &str, message: &str) -> BillingResult<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| BillingError::Crypto(format!("invalid hmac key: {e}")))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Sign a payload over its canonical string.
pub fn canonical_signature(payload: &serde_json::Value, secret: &str) -> BillingResult<String> {
    hmac_hex(secret, &canonical_string(payload))
}

/// Verify a payload signature in constant time. Any construction failure
/// verifies as false rather than erroring.
pub fn verify_signature(payload: &serde_json::Value, signature: &str, secret: &str) -> bool {
    let expected = match canonical_signature(payload, secret) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    constant_time_eq(&expected, signature)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Signature for outbound checkout-request creation. The provider expects
/// exactly these five fields in this order.
pub fn checkout_signature(
    amount: i64,
    cancel_url: &str,
    description: &str,
    order_code: i64,
    return_url: &str,
    secret: &str,
) -> BillingResult<String> {
    let message = format!(
        "amount={amount}&cancelUrl={cancel_url}&description={description}&orderCode={order_code}&returnUrl={return_url}"
    );
    hmac_hex(secret, &message)
}

/// Generate a provider order code: millisecond timestamp with a random
/// 3-digit suffix, clamped to the 53-bit safe-integer ceiling.
pub fn generate_order_code() -> i64 {
    let millis = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
    let suffix = (rand::thread_rng().next_u32() % 900 + 100) as i64;
    let code = millis.saturating_mul(1000).saturating_add(suffix);
    code.min(MAX_SAFE_ORDER_CODE)
}

/// AES-256-GCM cipher for intent metadata blobs. The key is derived from
/// a configured secret via SHA-256, and blobs are stored as a single
/// `iv.tag.ciphertext` hex-delimited string.
#[derive(Clone)]
pub struct MetadataCipher {
    key: [u8; 32],
}

impl MetadataCipher {
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &str) -> BillingResult<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| BillingError::Crypto(format!("cipher init: {e}")))?;

        let mut iv = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut iv);

        let sealed = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| BillingError::Crypto("encryption failed".to_string()))?;

        // aes-gcm appends the 16-byte auth tag to the ciphertext.
        let (body, tag) = sealed.split_at(sealed.len() - 16);
        Ok(format!(
            "{}.{}.{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(body)
        ))
    }

    /// Decrypt a stored blob. A corrupt or foreign blob degrades to
    /// `None` ("metadata unavailable") rather than failing the caller's
    /// transaction.
    pub fn decrypt(&self, blob: &str) -> Option<String> {
        let mut parts = blob.splitn(3, '.');
        let iv = hex::decode(parts.next()?).ok()?;
        let tag = hex::decode(parts.next()?).ok()?;
        let body = hex::decode(parts.next()?).ok()?;
        if iv.len() != 12 || tag.len() != 16 {
            return None;
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key).ok()?;
        let mut sealed = body;
        sealed.extend_from_slice(&tag);

        let plaintext = cipher.decrypt(Nonce::from_slice(&iv), sealed.as_ref()).ok()?;
        String::from_utf8(plaintext).ok()
    }
}

/// Outcome of scoring a checkout-initiation request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RiskAssessment {
    pub allowed: bool,
    pub flags: Vec<String>,
}

/// Pure risk gate applied before any checkout state is created.
pub fn assess_risk(user_active: bool, plan_active: bool, amount: i64) -> RiskAssessment {
    let mut flags = Vec::new();
    if !user_active {
        flags.push("inactive_user".to_string());
    }
    if !plan_active {
        flags.push("inactive_plan".to_string());
    }
    if amount <= 0 {
        flags.push("non_positive_amount".to_string());
    }
    RiskAssessment {
        allowed: flags.is_empty(),
        flags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_string_sorts_top_level_keys() {
        let payload = json!({"b": 2, "a": "one", "c": null});
        assert_eq!(canonical_string(&payload), "a=one&b=2&c=");
    }

    #[test]
    fn canonical_string_sorts_nested_keys() {
        let payload = json!({"data": {"z": 1, "a": [ {"k": "v", "b": 2} ]}});
        assert_eq!(
            canonical_string(&payload),
            r#"data={"a":[{"b":2,"k":"v"}],"z":1}"#
        );
    }

    #[test]
    fn metadata_cipher_round_trip() {
        let cipher = MetadataCipher::new("test-secret");
        let blob = cipher.encrypt("{\"plan_id\":\"abc\"}").unwrap();
        assert_eq!(blob.split('.').count(), 3);
        assert_eq!(cipher.decrypt(&blob).as_deref(), Some("{\"plan_id\":\"abc\"}"));
    }

    #[test]
    fn metadata_cipher_rejects_foreign_blob() {
        let cipher = MetadataCipher::new("secret-a");
        let other = MetadataCipher::new("secret-b");
        let blob = cipher.encrypt("hello").unwrap();
        assert!(other.decrypt(&blob).is_none());
        assert!(cipher.decrypt("not.a.blob").is_none());
        assert!(cipher.decrypt("deadbeef").is_none());
    }

    #[test]
    fn order_code_stays_below_safe_integer_ceiling() {
        for _ in 0..100 {
            let code = generate_order_code();
            assert!(code > 0);
            assert!(code <= MAX_SAFE_ORDER_CODE);
        }
    }
}
