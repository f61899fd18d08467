//! JWT authentication
//!
//! Bearer-token auth for the checkout endpoints. Webhook routes are
//! authenticated by provider signature instead and never pass through
//! this extractor.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: Uuid,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct JwtManager {
    encoding: EncodingKey,
    decoding: DecodingKey,
    expiry_hours: i64,
}

impl JwtManager {
    pub fn new(secret: &str, expiry_hours: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            expiry_hours,
        }
    }

    /// Mint a token for a user. Login and account management live in a
    /// separate service sharing the same secret; within this crate the
    /// minting side is exercised only by tests and local tooling.
    pub fn issue(&self, user_id: Uuid) -> Result<String, ApiError> {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: user_id,
            iat: now.unix_timestamp(),
            exp: (now + time::Duration::hours(self.expiry_hours)).unix_timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| ApiError::Internal(format!("token encoding: {e}")))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| ApiError::Unauthorized(format!("invalid token: {e}")))
    }
}

/// Authenticated user extracted from a `Bearer` token.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: Uuid,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing authorization header".to_string()))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::Unauthorized("malformed authorization header".to_string()))?;

        let claims = state.jwt_manager.verify(token)?;
        Ok(AuthUser {
            user_id: claims.sub,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-at-least-32-bytes-long!!";

    #[test]
    fn issued_tokens_verify() {
        let manager = JwtManager::new(SECRET, 1);
        let user_id = Uuid::new_v4();

        let token = manager.issue(user_id).unwrap();
        let claims = manager.verify(&token).unwrap();
        assert_eq!(claims.sub, user_id);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn foreign_tokens_are_rejected() {
        let manager = JwtManager::new(SECRET, 1);
        let other = JwtManager::new("a-different-secret-also-32-bytes!!!!", 1);

        let token = other.issue(Uuid::new_v4()).unwrap();
        assert!(manager.verify(&token).is_err());
        assert!(manager.verify("garbage").is_err());
    }
}
