//! OpenAPI documentation, served at `/docs`.

use utoipa::{
    Modify, OpenApi,
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
};

use crate::{
    analytics::AnalyticsSummary,
    api::{
        handlers,
        models::{
            analyses::{MetricsHistory, MetricsPoint, RepositoryAnalyses},
            feedback::{FeedbackCreate, FeedbackList},
            queues::{BulkJobsRequest, DirectBulkItem, JobAcceptedResponse},
        },
    },
    pipeline::models::{CodeQuality, PipelineRequest, Review, ReviewIssue},
    queue::{
        jobs::{CodeAnalysisJob, EmailJob, JobMetadata, PredictionJob, QueueName, ReviewJob},
        publisher::{BulkItemOutcome, PublishOptions},
    },
    store::models::{AnalysisResult, AnalysisSection, ChangeMetrics, Feedback, Overall, Performance, PredictionSection},
};

/// Documents the trusted identity header set by the upstream gateway.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.security_schemes.insert(
                "X-User-Id".to_string(),
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "x-user-id",
                    "Authenticated user id, set by the upstream gateway. The header name is configurable.",
                ))),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::analyses::analyze_pr,
        handlers::analyses::list_analyses,
        handlers::analyses::get_analysis,
        handlers::analyses::list_repository_analyses,
        handlers::analyses::metrics_history,
        handlers::feedback::submit_feedback,
        handlers::feedback::list_feedback,
        handlers::analytics::get_analytics,
        handlers::analytics::recalculate_analytics,
        handlers::queues::submit_job,
        handlers::queues::submit_bulk_jobs,
        handlers::queues::schedule_job,
        handlers::webhooks::receive_delivery,
    ),
    components(schemas(
        PipelineRequest,
        AnalysisResult,
        AnalysisSection,
        ChangeMetrics,
        PredictionSection,
        Overall,
        Performance,
        Review,
        ReviewIssue,
        CodeQuality,
        Feedback,
        FeedbackCreate,
        FeedbackList,
        AnalyticsSummary,
        MetricsHistory,
        MetricsPoint,
        RepositoryAnalyses,
        QueueName,
        JobMetadata,
        CodeAnalysisJob,
        EmailJob,
        ReviewJob,
        PredictionJob,
        PublishOptions,
        BulkJobsRequest,
        BulkItemOutcome,
        DirectBulkItem,
        JobAcceptedResponse,
    )),
    modifiers(&SecurityAddon),
    tags(
        (name = "pipeline", description = "Merge decisions and their history"),
        (name = "feedback", description = "Ratings of merge decisions"),
        (name = "analytics", description = "Per-user running statistics"),
        (name = "queues", description = "Background job submission"),
        (name = "webhooks", description = "Job deliveries from the queue provider"),
    ),
    info(
        title = "mergegate",
        description = "Merge-decision pipeline and background job dispatch.",
    )
)]
pub struct ApiDoc;
