//! Subject catalog

use axum::{
    extract::{Query, State},
    Json,
};
use maturamate_shared::Subject;
use serde::Deserialize;

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct SubjectsQuery {
    /// Only subjects with (or without) a maturita exam
    pub maturita: Option<bool>,
}

/// GET /api/subjects
pub async fn list_subjects(
    State(state): State<AppState>,
    Query(query): Query<SubjectsQuery>,
) -> ApiResult<Json<Vec<Subject>>> {
    let subjects = state
        .billing
        .entitlements
        .list_subjects(query.maturita)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to list subjects");
            e
        })?;
    Ok(Json(subjects))
}
