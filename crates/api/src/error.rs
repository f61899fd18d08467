//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use finflow_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Billing(e) => {
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to expose to clients. Internal classes collapse to a
    /// generic string; details are logged server-side only.
    fn public_message(&self) -> String {
        match self {
            ApiError::Database(_) | ApiError::Internal(_) => "internal server error".to_string(),
            ApiError::Billing(e) if e.http_status() >= 500 => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "Request rejected");
        }

        let body = Json(json!({
            "error": self.public_message(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_statuses_pass_through() {
        let err = ApiError::Billing(BillingError::SignatureInvalid);
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);

        let err = ApiError::Billing(BillingError::AmountMismatch {
            expected: 100,
            got: 200,
        });
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn internal_details_are_not_exposed() {
        let err = ApiError::Internal("secret detail".to_string());
        assert_eq!(err.public_message(), "internal server error");

        let err = ApiError::BadRequest("missing field".to_string());
        assert!(err.public_message().contains("missing field"));
    }
}
