//! HTTP routes

mod billing;
mod subjects;
mod subscription;
mod webhook;

#[cfg(test)]
mod router_tests;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_auth, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        // Subscription state
        .route(
            "/api/user/subscription-status",
            get(subscription::get_subscription_status),
        )
        .route(
            "/api/user/pending-subscription-changes",
            get(subscription::list_pending_changes),
        )
        .route(
            "/api/user/subject-access",
            get(subscription::get_subject_access),
        )
        // Plan changes
        .route(
            "/api/stripe/plan-change-preview",
            post(billing::preview_plan_change),
        )
        .route("/api/stripe/plan-change", post(billing::execute_plan_change))
        .route(
            "/api/stripe/modify-pending-change",
            post(billing::modify_pending_change),
        )
        .route(
            "/api/stripe/cancel-subscription",
            post(billing::cancel_subscription),
        )
        .route(
            "/api/stripe/reactivate-subscription",
            post(billing::reactivate_subscription),
        )
        // Catalog
        .route("/api/subjects", get(subjects::list_subjects))
        .route_layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/api/stripe/webhook", post(webhook::stripe_webhook))
        .merge(protected)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
