use axum::{Json, extract::State};
use tracing::instrument;

use crate::{AppState, analytics::AnalyticsSummary, api::models::ApiResponse, auth::CurrentUser, errors::Result};

/// The caller's running statistics.
#[utoipa::path(
    get,
    path = "/analytics",
    tag = "analytics",
    summary = "Get analytics",
    responses(
        (status = 200, description = "Analytics summary", body = ApiResponse<AnalyticsSummary>),
        (status = 401, description = "Missing caller identity"),
    ),
    security(("X-User-Id" = []))
)]
#[instrument(skip_all, fields(user_id = %current_user.id))]
pub async fn get_analytics(State(state): State<AppState>, current_user: CurrentUser) -> Result<Json<ApiResponse<AnalyticsSummary>>> {
    let summary = state.analytics.get(&current_user.id).await?;
    Ok(Json(ApiResponse::ok(summary)))
}

/// Rebuild the caller's statistics from their full history.
#[utoipa::path(
    post,
    path = "/analytics/recalculate",
    tag = "analytics",
    summary = "Recalculate analytics",
    description = "Recompute every statistic from the stored decision records and feedback, replacing the running values.",
    responses(
        (status = 200, description = "Recalculated summary", body = ApiResponse<AnalyticsSummary>),
        (status = 401, description = "Missing caller identity"),
    ),
    security(("X-User-Id" = []))
)]
#[instrument(skip_all, fields(user_id = %current_user.id))]
pub async fn recalculate_analytics(
    State(state): State<AppState>,
    current_user: CurrentUser,
) -> Result<Json<ApiResponse<AnalyticsSummary>>> {
    let row = state.analytics.recalculate(&current_user.id).await?;
    Ok(Json(ApiResponse::with_message(
        "Analytics recalculated successfully",
        AnalyticsSummary::from(&row),
    )))
}
