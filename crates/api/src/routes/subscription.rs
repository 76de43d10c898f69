//! Subscription state and entitlement reads

use axum::{extract::State, Extension, Json};
use maturamate_billing::{PendingSubscriptionChange, SubscriptionStatus, UserSubjectAccess};

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

/// GET /api/user/subscription-status
pub async fn get_subscription_status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionStatus>> {
    let status = state
        .billing
        .subscriptions
        .get_status(&auth_user.user_id)
        .await
        .map_err(|e| {
            tracing::error!(user_id = %auth_user.user_id, error = %e, "Failed to load subscription status");
            e
        })?;

    Ok(Json(status))
}

/// GET /api/user/pending-subscription-changes
pub async fn list_pending_changes(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<PendingSubscriptionChange>>> {
    let changes = state
        .billing
        .subscriptions
        .list_pending_changes(&auth_user.user_id)
        .await
        .map_err(|e| {
            tracing::error!(user_id = %auth_user.user_id, error = %e, "Failed to list pending changes");
            e
        })?;

    Ok(Json(changes))
}

/// GET /api/user/subject-access
pub async fn get_subject_access(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<UserSubjectAccess>> {
    let access = state
        .billing
        .entitlements
        .subject_access(&auth_user.user_id)
        .await
        .map_err(|e| {
            tracing::error!(user_id = %auth_user.user_id, error = %e, "Failed to load subject access");
            e
        })?;

    Ok(Json(access))
}
