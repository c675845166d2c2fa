//! HTTP handlers for feedback on decision records.

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use chrono::Utc;
use tracing::{instrument, warn};

use super::analyses::parse_period;
use crate::{
    AppState,
    api::extract::JsonBody,
    api::models::{
        ApiResponse,
        analyses::PeriodQuery,
        feedback::{FeedbackCreate, FeedbackList},
    },
    auth::CurrentUser,
    errors::{Error, Result},
    store::models::Feedback,
    types::abbrev_uuid,
};

/// Rate a decision record.
#[utoipa::path(
    post,
    path = "/feedback",
    tag = "feedback",
    summary = "Submit feedback",
    description = "Rate one of the caller's decision records from 1 to 5. The rating feeds the caller's feedback quality.",
    request_body = FeedbackCreate,
    responses(
        (status = 201, description = "Feedback stored", body = ApiResponse<Feedback>),
        (status = 400, description = "Missing field or rating out of range"),
        (status = 401, description = "Missing caller identity"),
        (status = 404, description = "No such analysis for this caller"),
    ),
    security(("X-User-Id" = []))
)]
#[instrument(skip_all, fields(user_id = %current_user.id))]
pub async fn submit_feedback(
    State(state): State<AppState>,
    current_user: CurrentUser,
    JsonBody(request): JsonBody<FeedbackCreate>,
) -> Result<(StatusCode, Json<ApiResponse<Feedback>>)> {
    let (Some(analysis_id), Some(rating)) = (request.analysis_id, request.rating) else {
        return Err(Error::BadRequest {
            message: "Missing required fields: analysisId, rating".to_string(),
        });
    };
    let rating = u8::try_from(rating)
        .ok()
        .filter(|r| (1..=5).contains(r))
        .ok_or_else(|| Error::BadRequest {
            message: "Rating must be between 1 and 5".to_string(),
        })?;

    if state.store.get_analysis(&current_user.id, analysis_id).await?.is_none() {
        return Err(Error::NotFound {
            resource: "Analysis".to_string(),
            id: analysis_id.to_string(),
        });
    }

    let feedback = Feedback::new(current_user.id.clone(), analysis_id, rating, request.comment);
    let _guard = state.analytics.lock_user(&current_user.id).await;
    state.store.save_feedback(&feedback).await?;

    if let Err(e) = state.analytics.after_feedback(&current_user.id, rating).await {
        warn!(analysis_id = %abbrev_uuid(&analysis_id), error = %e, "Failed to update feedback analytics");
        metrics::counter!("mergegate_side_effect_failures_total", "effect" => "analytics").increment(1);
    }

    Ok((StatusCode::CREATED, Json(ApiResponse::ok(feedback))))
}

/// List the caller's feedback.
#[utoipa::path(
    get,
    path = "/feedback",
    tag = "feedback",
    summary = "List feedback",
    params(PeriodQuery),
    responses(
        (status = 200, description = "Newest first", body = ApiResponse<FeedbackList>),
        (status = 400, description = "Invalid period"),
        (status = 401, description = "Missing caller identity"),
    ),
    security(("X-User-Id" = []))
)]
#[instrument(skip_all, fields(user_id = %current_user.id))]
pub async fn list_feedback(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<ApiResponse<FeedbackList>>> {
    let since = parse_period(&query)?.since(Utc::now());
    let mut feedback = state.store.list_feedback(&current_user.id, Some(since)).await?;
    feedback.reverse();
    Ok(Json(ApiResponse::ok(FeedbackList { feedback })))
}
