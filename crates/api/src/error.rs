//! API error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use maturamate_billing::BillingError;
use serde::Serialize;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Payment provider failure; details are logged only
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::Provider(_) => (
                StatusCode::BAD_GATEWAY,
                "payment_provider_error",
                "The payment provider could not process the request".to_string(),
            ),
            ApiError::Database(_) | ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal server error".to_string(),
            ),
        };

        (status, Json(ErrorResponse { error, message })).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidPlanChange(e) => ApiError::Validation(e.to_string()),
            BillingError::SubscriptionInactive(_) | BillingError::NotScheduledForCancellation => {
                ApiError::Validation(err.to_string())
            }
            BillingError::WebhookSignatureInvalid | BillingError::WebhookEventNotSupported(_) => {
                ApiError::Validation(err.to_string())
            }
            BillingError::SubscriptionNotFound(_) => {
                ApiError::NotFound("No subscription found".to_string())
            }
            BillingError::NoPendingChange => ApiError::NotFound(err.to_string()),
            BillingError::PendingChangeExists | BillingError::CancellationScheduled => {
                ApiError::Conflict(err.to_string())
            }
            BillingError::StripeApi(msg) => ApiError::Provider(msg),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Config(msg) | BillingError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}
