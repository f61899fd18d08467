//! Payment routes
//!
//! Webhook ingestion plus the authenticated checkout endpoints. The
//! webhook handler acknowledges before processing: once the event is in
//! the ledger, processing runs on a spawned task and delivery failures
//! are retried by the worker's drain job.

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use uuid::Uuid;

use finflow_billing::{
    AdmissionRequest, CancelOutcome, ProcessOutcome, RegisterOutcome,
};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "x-paylink-signature";
const TIMESTAMP_HEADER: &str = "x-paylink-timestamp";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `POST /payments/webhook/{provider}`
///
/// 202 on first admission, 200 for duplicates. Rejections carry the
/// admission gate's status and never touch storage.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let adapter = state.billing.registry.get(&provider)?;

    let parsed: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("payload is not valid json".to_string()))?;

    let remote_addr = remote.ip().to_string();
    let request = AdmissionRequest {
        raw_body: &body,
        parsed: &parsed,
        signature: header_str(&headers, SIGNATURE_HEADER),
        timestamp: header_str(&headers, TIMESTAMP_HEADER),
        forwarded_for: header_str(&headers, "x-forwarded-for"),
        remote_addr: Some(&remote_addr),
    };

    let admitted = match state.billing.admission.check(adapter.as_ref(), &request).await {
        Ok(admitted) => admitted,
        Err(rejection) => {
            let status = StatusCode::from_u16(rejection.status)
                .unwrap_or(StatusCode::BAD_REQUEST);
            return Ok((status, Json(json!({ "error": rejection.reason }))));
        }
    };

    let raw_body = String::from_utf8_lossy(&body);
    let outcome = state
        .billing
        .ledger
        .register_event(
            adapter.as_ref(),
            &raw_body,
            &parsed,
            &admitted.signature,
            admitted.timestamp,
        )
        .await?;

    match outcome {
        RegisterOutcome::Created(event) => {
            // Acknowledge first; the provider's delivery clock should not
            // include our processing time.
            let billing = state.billing.clone();
            let event_id = event.id;
            tokio::spawn(async move {
                if let Err(e) = billing.processor.process_event(event_id).await {
                    tracing::error!(event_id = %event_id, error = %e, "Webhook processing failed");
                }
            });

            Ok((
                StatusCode::ACCEPTED,
                Json(json!({ "status": "accepted", "event_id": event.id })),
            ))
        }
        RegisterOutcome::Duplicate(event) => {
            tracing::info!(
                provider = %provider,
                event_id = %event.event_id,
                "Duplicate webhook delivery acknowledged"
            );
            Ok((
                StatusCode::OK,
                Json(json!({ "status": "duplicate", "event_id": event.id })),
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InitiateCheckoutRequest {
    pub plan_id: Uuid,
    #[serde(default = "default_provider")]
    pub provider: String,
    pub return_url: Option<String>,
    pub cancel_url: Option<String>,
}

fn default_provider() -> String {
    "paylink".to_string()
}

/// `POST /payments/checkout`
pub async fn initiate_checkout(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<InitiateCheckoutRequest>,
) -> ApiResult<(StatusCode, Json<finflow_billing::CheckoutResponse>)> {
    let response = state
        .billing
        .checkout
        .initiate(
            user.user_id,
            req.plan_id,
            &req.provider,
            req.return_url,
            req.cancel_url,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(response)))
}

#[derive(Debug, Deserialize)]
pub struct CancelCheckoutRequest {
    pub request_id: i64,
}

/// `POST /payments/checkout/cancel`
pub async fn cancel_checkout(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CancelCheckoutRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state
        .billing
        .checkout
        .cancel(user.user_id, req.request_id)
        .await?;

    let status = match outcome {
        CancelOutcome::Cancelled => "cancelled",
        CancelOutcome::AlreadyFinalized => "already_finalized",
    };
    Ok(Json(json!({ "status": status, "request_id": req.request_id })))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmCheckoutRequest {
    pub request_id: i64,
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Provider redirect payload forwarded by the client.
    pub payload: serde_json::Value,
    /// Provider signature over the payload, relayed alongside it.
    pub signature: String,
}

/// `POST /payments/checkout/confirm`
///
/// Return-URL confirmation path. The payload and its provider signature
/// are relayed by the client and re-verified server side; it then shares
/// the webhook apply path, so whichever of webhook delivery or
/// confirmation lands first wins and the other is a no-op.
pub async fn confirm_checkout(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<ConfirmCheckoutRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state
        .billing
        .processor
        .confirm_direct(
            user.user_id,
            req.request_id,
            &req.provider,
            &req.payload,
            &req.signature,
        )
        .await?;

    let status = match outcome {
        ProcessOutcome::Applied => "confirmed",
        ProcessOutcome::AlreadyFinalized => "already_finalized",
        ProcessOutcome::Acknowledged => "pending",
        ProcessOutcome::Ignored | ProcessOutcome::Missing => {
            return Err(ApiError::NotFound(format!(
                "no payment found for request {}",
                req.request_id
            )))
        }
        ProcessOutcome::SignatureRejected => {
            return Err(ApiError::Unauthorized("payload rejected".to_string()))
        }
    };
    Ok(Json(json!({ "status": status, "request_id": req.request_id })))
}
