//! HTTP handlers for running the pipeline and reading its history.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use chrono::Utc;
use tracing::instrument;

use crate::{
    AppState,
    api::extract::JsonBody,
    api::models::{
        ApiResponse,
        analyses::{HistoryQuery, MetricsHistory, MetricsPoint, Period, PeriodQuery, RepositoryAnalyses},
    },
    auth::CurrentUser,
    errors::{Error, Result},
    pipeline::models::PipelineRequest,
    store::models::AnalysisResult,
    types::AnalysisId,
};

pub(crate) fn parse_period(query: &PeriodQuery) -> Result<Period> {
    match query.period.as_deref() {
        None | Some("") => Ok(Period::default()),
        Some(raw) => Period::parse(raw).ok_or_else(|| Error::BadRequest {
            message: format!("Invalid period '{raw}', expected e.g. 6months or 1year"),
        }),
    }
}

/// Run the merge-decision pipeline.
#[utoipa::path(
    post,
    path = "/analyze-pr",
    tag = "pipeline",
    summary = "Analyze change",
    description = "Run analysis, failure prediction and review on the submitted code and combine them into a merge \
    decision. A failed review degrades to a fallback review that never approves the merge; a failed analysis or \
    prediction fails the request and nothing is stored.",
    request_body = PipelineRequest,
    responses(
        (status = 200, description = "Decision record", body = ApiResponse<AnalysisResult>),
        (status = 400, description = "Empty code"),
        (status = 401, description = "Missing caller identity"),
        (status = 502, description = "Analysis or prediction stage failed"),
    ),
    security(("X-User-Id" = []))
)]
#[instrument(skip_all, fields(user_id = %current_user.id))]
pub async fn analyze_pr(
    State(state): State<AppState>,
    current_user: CurrentUser,
    JsonBody(request): JsonBody<PipelineRequest>,
) -> Result<Json<ApiResponse<AnalysisResult>>> {
    let result = state.orchestrator.run(&current_user.id, request).await?;
    Ok(Json(ApiResponse::ok(result)))
}

/// List the caller's decision records.
#[utoipa::path(
    get,
    path = "/analyses",
    tag = "pipeline",
    summary = "List analyses",
    params(HistoryQuery),
    responses(
        (status = 200, description = "Newest first", body = ApiResponse<Vec<AnalysisResult>>),
        (status = 401, description = "Missing caller identity"),
    ),
    security(("X-User-Id" = []))
)]
#[instrument(skip_all, fields(user_id = %current_user.id))]
pub async fn list_analyses(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ApiResponse<Vec<AnalysisResult>>>> {
    let analyses = state.store.list_analyses(&current_user.id, query.limit()).await?;
    Ok(Json(ApiResponse::ok(analyses)))
}

/// Get one decision record.
#[utoipa::path(
    get,
    path = "/analyses/{id}",
    tag = "pipeline",
    summary = "Get analysis",
    params(
        ("id" = uuid::Uuid, Path, description = "Analysis ID"),
    ),
    responses(
        (status = 200, description = "Decision record", body = ApiResponse<AnalysisResult>),
        (status = 401, description = "Missing caller identity"),
        (status = 404, description = "No such analysis for this caller"),
    ),
    security(("X-User-Id" = []))
)]
#[instrument(skip_all, fields(user_id = %current_user.id, analysis_id = %id))]
pub async fn get_analysis(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(id): Path<AnalysisId>,
) -> Result<Json<ApiResponse<AnalysisResult>>> {
    let analysis = state
        .store
        .get_analysis(&current_user.id, id)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "Analysis".to_string(),
            id: id.to_string(),
        })?;
    Ok(Json(ApiResponse::ok(analysis)))
}

/// List the caller's decision records for one repository.
#[utoipa::path(
    get,
    path = "/repositories/{repository_full_name}/analyses",
    tag = "pipeline",
    summary = "List repository analyses",
    params(
        ("repository_full_name" = String, Path, description = "URL-encoded `owner/name`"),
    ),
    responses(
        (status = 200, description = "Newest first", body = ApiResponse<RepositoryAnalyses>),
        (status = 401, description = "Missing caller identity"),
    ),
    security(("X-User-Id" = []))
)]
#[instrument(skip_all, fields(user_id = %current_user.id, repository = %repository_full_name))]
pub async fn list_repository_analyses(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(repository_full_name): Path<String>,
) -> Result<Json<ApiResponse<RepositoryAnalyses>>> {
    let analyses = state.store.list_by_repository(&current_user.id, &repository_full_name).await?;
    Ok(Json(ApiResponse::ok(RepositoryAnalyses { analyses })))
}

/// Metrics of the caller's decision records over a lookback window.
#[utoipa::path(
    get,
    path = "/metrics-history",
    tag = "pipeline",
    summary = "Metrics history",
    params(PeriodQuery),
    responses(
        (status = 200, description = "Oldest first", body = ApiResponse<MetricsHistory>),
        (status = 400, description = "Invalid period"),
        (status = 401, description = "Missing caller identity"),
    ),
    security(("X-User-Id" = []))
)]
#[instrument(skip_all, fields(user_id = %current_user.id))]
pub async fn metrics_history(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<ApiResponse<MetricsHistory>>> {
    let since = parse_period(&query)?.since(Utc::now());
    let analyses = state.store.list_since(&current_user.id, Some(since)).await?;
    let metrics = analyses.iter().map(MetricsPoint::from).collect();
    Ok(Json(ApiResponse::ok(MetricsHistory { metrics })))
}
