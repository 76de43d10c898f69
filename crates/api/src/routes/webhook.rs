//! Stripe webhook endpoint

use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// POST /api/stripe/webhook
///
/// Signature failures return 400. Processing failures return 500 so Stripe
/// redelivers the event.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook request without Stripe-Signature header");
            ApiError::Validation("Missing Stripe-Signature header".to_string())
        })?;

    let event = state.billing.webhooks.verify_event(&body, signature)?;
    let event_id = event.id.to_string();

    state.billing.webhooks.handle_event(event).await.map_err(|e| {
        tracing::error!(event_id = %event_id, error = %e, "Webhook processing failed");
        match e {
            // Malformed payload for its type: retrying will not help
            maturamate_billing::BillingError::WebhookEventNotSupported(_) => ApiError::from(e),
            _ => ApiError::Internal(e.to_string()),
        }
    })?;

    Ok(Json(json!({ "received": true })))
}
