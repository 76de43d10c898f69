//! Plan change, undo, cancel and reactivate endpoints

use axum::{body::Bytes, extract::State, Extension, Json};
use maturamate_billing::{
    CancellationResult, ChangeTiming, PendingChangeModification, PlanChangePreview,
    PlanChangeResult,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct PlanChangePreviewRequest {
    pub subject_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct PlanChangeRequest {
    pub subject_ids: Vec<Uuid>,
    #[serde(default)]
    pub timing: ChangeTiming,
}

/// Body of the undo endpoint. Without ids the whole pending change is
/// cancelled; with ids only those scheduled removals are restored.
#[derive(Debug, Default, Deserialize)]
pub struct ModifyPendingChangeRequest {
    #[serde(default)]
    pub subject_id: Option<Uuid>,
    #[serde(default)]
    pub subject_ids: Option<Vec<Uuid>>,
}

impl ModifyPendingChangeRequest {
    fn restore_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.subject_ids.clone().unwrap_or_default();
        if let Some(id) = self.subject_id {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}

/// POST /api/stripe/plan-change-preview
pub async fn preview_plan_change(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<PlanChangePreviewRequest>,
) -> ApiResult<Json<PlanChangePreview>> {
    let preview = state
        .billing
        .subscriptions
        .preview_plan_change(&auth_user.user_id, &req.subject_ids)
        .await
        .map_err(|e| {
            tracing::warn!(user_id = %auth_user.user_id, error = %e, "Plan change preview failed");
            ApiError::from(e)
        })?;

    Ok(Json(preview))
}

/// POST /api/stripe/plan-change
pub async fn execute_plan_change(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<PlanChangeRequest>,
) -> ApiResult<Json<PlanChangeResult>> {
    tracing::info!(
        user_id = %auth_user.user_id,
        subject_count = req.subject_ids.len(),
        timing = ?req.timing,
        "Plan change requested"
    );

    let result = state
        .billing
        .subscriptions
        .execute_plan_change(&auth_user.user_id, &req.subject_ids, req.timing)
        .await
        .map_err(|e| {
            tracing::error!(user_id = %auth_user.user_id, error = %e, "Plan change failed");
            ApiError::from(e)
        })?;

    Ok(Json(result))
}

/// POST /api/stripe/modify-pending-change
pub async fn modify_pending_change(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    body: Bytes,
) -> ApiResult<Json<PendingChangeModification>> {
    // An empty body means "cancel the whole change"
    let req: ModifyPendingChangeRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ModifyPendingChangeRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::Validation(e.to_string()))?
    };

    let result = state
        .billing
        .subscriptions
        .modify_pending_change(&auth_user.user_id, &req.restore_ids())
        .await
        .map_err(|e| {
            tracing::error!(user_id = %auth_user.user_id, error = %e, "Failed to modify pending change");
            ApiError::from(e)
        })?;

    Ok(Json(result))
}

/// POST /api/stripe/cancel-subscription
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<CancellationResult>> {
    let result = state
        .billing
        .subscriptions
        .cancel_subscription(&auth_user.user_id)
        .await
        .map_err(|e| {
            tracing::error!(user_id = %auth_user.user_id, error = %e, "Failed to cancel subscription");
            ApiError::from(e)
        })?;

    Ok(Json(result))
}

/// POST /api/stripe/reactivate-subscription
pub async fn reactivate_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<CancellationResult>> {
    let result = state
        .billing
        .subscriptions
        .reactivate_subscription(&auth_user.user_id)
        .await
        .map_err(|e| {
            tracing::error!(user_id = %auth_user.user_id, error = %e, "Failed to reactivate subscription");
            ApiError::from(e)
        })?;

    Ok(Json(result))
}
