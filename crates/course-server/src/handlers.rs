//! HTTP Handlers

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
};
use serde::{Deserialize, Serialize};

use course_payments::{PaymentError, ResolvedPayment};

use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub stripe_configured: bool,
    pub lock_backend: Option<&'static str>,
    pub webhook_signatures: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub course_id: i64,
    pub user_id: i64,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub url: String,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PaymentStatusQuery {
    pub session_id: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn payments_disabled() -> ApiError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: "Payments not configured".into(),
            code: "PAYMENTS_DISABLED".into(),
        }),
    )
}

fn api_error(e: &PaymentError) -> ApiError {
    let (status, code) = match e {
        PaymentError::CourseNotFound(_) => (StatusCode::NOT_FOUND, "COURSE_NOT_FOUND"),
        PaymentError::InvalidSessionId(_) => (StatusCode::BAD_REQUEST, "INVALID_SESSION"),
        PaymentError::WebhookSignature(_) => (StatusCode::BAD_REQUEST, "INVALID_SIGNATURE"),
        PaymentError::WebhookParse(_) => (StatusCode::BAD_REQUEST, "INVALID_PAYLOAD"),
        PaymentError::Stripe(_) => (StatusCode::BAD_GATEWAY, "STRIPE_ERROR"),
        PaymentError::ResolveTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "STRIPE_TIMEOUT"),
        PaymentError::LockBackend(_) | PaymentError::Storage(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE")
        }
        PaymentError::EnrollmentNotFound(_) | PaymentError::Config(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL")
        }
    };

    (
        status,
        Json(ErrorResponse {
            error: e.user_message().into(),
            code: code.into(),
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        stripe_configured: state.checkout.is_some(),
        lock_backend: state.reconciler.as_ref().map(|r| r.lock_backend()),
        webhook_signatures: state
            .reconciler
            .as_ref()
            .is_some_and(|r| r.verifies_signatures()),
    })
}

/// Create Stripe checkout session for a course
pub async fn create_checkout(
    State(state): State<AppState>,
    Json(payload): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let checkout = state.checkout.as_ref().ok_or_else(payments_disabled)?;

    let session = checkout
        .create_checkout(payload.user_id, payload.course_id)
        .await
        .map_err(|e| {
            tracing::error!("Checkout error: {}", e);
            api_error(&e)
        })?;

    Ok(Json(CheckoutResponse {
        url: session.url,
        session_id: session.id,
    }))
}

/// Whether the session's enrollment is paid
pub async fn check_payment(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<bool>, ApiError> {
    let paid = state.store.is_paid(&session_id).await.map_err(|e| {
        tracing::error!("Payment check error: {}", e);
        api_error(&e)
    })?;

    Ok(Json(paid))
}

/// Live payment info straight from Stripe
pub async fn payment_status(
    State(state): State<AppState>,
    Query(query): Query<PaymentStatusQuery>,
) -> Result<Json<ResolvedPayment>, ApiError> {
    let resolver = state.resolver.as_ref().ok_or_else(payments_disabled)?;

    let resolved = resolver.resolve(&query.session_id).await.map_err(|e| {
        tracing::warn!(session_id = %query.session_id, "Payment status lookup failed: {}", e);
        api_error(&e)
    })?;

    Ok(Json(resolved))
}

/// Stripe webhook handler
///
/// Answers 200 for every outcome except a bad signature (400) or an
/// unavailable lock/storage backend (503), which Stripe will retry.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, &'static str), ApiError> {
    let reconciler = state.reconciler.as_ref().ok_or_else(payments_disabled)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok());

    let outcome = reconciler.handle(&body, signature).await.map_err(|e| {
        match &e {
            PaymentError::WebhookSignature(_) => {
                tracing::warn!("Webhook signature failed: {}", e);
            }
            _ => tracing::error!("Webhook processing error: {}", e),
        }
        api_error(&e)
    })?;

    Ok((StatusCode::OK, outcome.response_body()))
}
