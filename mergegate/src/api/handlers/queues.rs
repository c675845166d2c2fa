//! HTTP handlers for job submission.
//!
//! In provider mode jobs are handed to the queue provider and the caller gets `202` with the job's
//! identity. In direct mode the job is run in-process through the webhook router and the caller
//! gets the worker's outcome.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::{info, instrument};

use crate::{
    AppState,
    api::extract::JsonBody,
    api::models::queues::{
        BulkJobsRequest, BulkJobsResponse, DirectBulkItem, JobAcceptedResponse, SCHEDULE_TIME_KEY, parse_schedule_time,
    },
    config::QueueMode,
    errors::{Error, Result},
    queue::{
        jobs::QueueName,
        publisher::{BulkItemOutcome, OPTIONS_KEY, split_options},
        router::DeliveryOutcome,
    },
};

pub(crate) fn parse_queue_name(name: &str) -> Result<QueueName> {
    name.parse().map_err(|_| Error::InvalidQueue { name: name.to_string() })
}

fn direct_response(job_id: String, outcome: DeliveryOutcome) -> Response {
    let status = outcome.status_code();
    let body = match outcome {
        DeliveryOutcome::Completed(Value::Object(mut body)) | DeliveryOutcome::Failed(Value::Object(mut body)) => {
            body.insert("jobId".to_string(), Value::String(job_id));
            Value::Object(body)
        }
        DeliveryOutcome::Completed(other) | DeliveryOutcome::Failed(other) => other,
    };
    (status, Json(body)).into_response()
}

/// Submit a job.
#[utoipa::path(
    post,
    path = "/queues/{queue_name}/jobs",
    tag = "queues",
    summary = "Submit job",
    description = "Validate the payload against the queue's job schema and publish it. An optional `options` object \
    (`delay` seconds, `retries`, `headers`) is removed from the body before validation.",
    params(
        ("queue_name" = QueueName, Path, description = "Target queue"),
    ),
    request_body(content = Object, description = "Job payload for the queue"),
    responses(
        (status = 202, description = "Job queued", body = JobAcceptedResponse),
        (status = 200, description = "Job run in-process (direct mode)"),
        (status = 400, description = "Unknown queue or invalid payload"),
        (status = 502, description = "Queue provider rejected the job"),
    )
)]
#[instrument(skip_all, fields(queue = %queue_name))]
pub async fn submit_job(
    State(state): State<AppState>,
    Path(queue_name): Path<String>,
    JsonBody(body): JsonBody<Map<String, Value>>,
) -> Result<Response> {
    let queue_name = parse_queue_name(&queue_name)?;
    let (payload, options) = split_options(body)?;

    if state.config.queue.mode == QueueMode::Direct {
        let (metadata, outcome) = state.router.run_direct(queue_name, payload).await?;
        return Ok(direct_response(metadata.job_id, outcome));
    }

    let job = state.publisher.publish(queue_name, payload.clone(), options).await?;
    info!(job_id = %job.job_id, "Job queued");

    let response = JobAcceptedResponse {
        message: "Job queued successfully".to_string(),
        job_id: job.job_id,
        message_id: job.message_id,
        queue_name,
        data: Some(payload),
        scheduled_for: None,
    };
    Ok((StatusCode::ACCEPTED, Json(response)).into_response())
}

/// Submit several jobs to one queue.
#[utoipa::path(
    post,
    path = "/queues/{queue_name}/jobs/bulk",
    tag = "queues",
    summary = "Submit jobs in bulk",
    description = "Publish every job concurrently. Each job succeeds or fails on its own and the response lists one \
    outcome per job in submission order.",
    params(
        ("queue_name" = QueueName, Path, description = "Target queue"),
    ),
    request_body = BulkJobsRequest,
    responses(
        (status = 202, description = "Per-job outcomes", body = BulkJobsResponse<BulkItemOutcome>),
        (status = 400, description = "Unknown queue or empty job list"),
    )
)]
#[instrument(skip_all, fields(queue = %queue_name))]
pub async fn submit_bulk_jobs(
    State(state): State<AppState>,
    Path(queue_name): Path<String>,
    JsonBody(request): JsonBody<BulkJobsRequest>,
) -> Result<Response> {
    let queue_name = parse_queue_name(&queue_name)?;
    if request.jobs.is_empty() {
        return Err(Error::BadRequest {
            message: "Jobs must be a non-empty array".to_string(),
        });
    }

    if state.config.queue.mode == QueueMode::Direct {
        // Publish options mean nothing without a provider
        let runs = request.jobs.into_iter().map(|mut job| {
            job.remove(OPTIONS_KEY);
            state.router.run_direct(queue_name, job)
        });
        let jobs: Vec<DirectBulkItem> = join_all(runs)
            .await
            .into_iter()
            .map(|run| match run {
                Ok((metadata, DeliveryOutcome::Completed(body))) => DirectBulkItem {
                    job_id: Some(metadata.job_id),
                    result: Some(body),
                    error: None,
                },
                Ok((metadata, DeliveryOutcome::Failed(body))) => DirectBulkItem {
                    job_id: Some(metadata.job_id),
                    error: body.get("message").and_then(Value::as_str).map(str::to_string),
                    result: Some(body),
                },
                Err(e) => DirectBulkItem {
                    job_id: None,
                    result: None,
                    error: Some(e.to_string()),
                },
            })
            .collect();

        let response = BulkJobsResponse {
            message: format!("{} jobs processed", jobs.len()),
            jobs,
            queue_name,
        };
        return Ok((StatusCode::ACCEPTED, Json(response)).into_response());
    }

    let jobs = state.publisher.publish_bulk(queue_name, request.jobs).await;
    let published = jobs.iter().filter(|job| job.is_published()).count();
    info!(published, submitted = jobs.len(), "Bulk jobs queued");

    let response = BulkJobsResponse {
        message: format!("{published} jobs queued successfully"),
        jobs,
        queue_name,
    };
    Ok((StatusCode::ACCEPTED, Json(response)).into_response())
}

/// Schedule a job for later delivery.
#[utoipa::path(
    post,
    path = "/queues/{queue_name}/schedule",
    tag = "queues",
    summary = "Schedule job",
    description = "Publish a job with a delivery delay so it runs at `scheduleTime` (RFC 3339 or unix milliseconds). \
    Times in the past are rejected and nothing is published.",
    params(
        ("queue_name" = QueueName, Path, description = "Target queue"),
    ),
    request_body(content = Object, description = "Job payload plus `scheduleTime`"),
    responses(
        (status = 202, description = "Job scheduled", body = JobAcceptedResponse),
        (status = 400, description = "Unknown queue, invalid payload, or missing/past scheduleTime"),
        (status = 501, description = "Scheduling is unavailable in direct mode"),
    )
)]
#[instrument(skip_all, fields(queue = %queue_name))]
pub async fn schedule_job(
    State(state): State<AppState>,
    Path(queue_name): Path<String>,
    JsonBody(mut body): JsonBody<Map<String, Value>>,
) -> Result<Response> {
    let queue_name = parse_queue_name(&queue_name)?;

    if state.config.queue.mode == QueueMode::Direct {
        return Err(Error::NotImplemented {
            message: "Scheduling is not available in direct mode".to_string(),
        });
    }

    let schedule_time = match body.remove(SCHEDULE_TIME_KEY) {
        None | Some(Value::Null) => {
            return Err(Error::BadRequest {
                message: "scheduleTime is required".to_string(),
            });
        }
        Some(value) => parse_schedule_time(&value).ok_or_else(|| Error::BadRequest {
            message: "scheduleTime must be an RFC 3339 timestamp or unix milliseconds".to_string(),
        })?,
    };
    let (payload, _) = split_options(body)?;

    let job = state.publisher.schedule(queue_name, payload, schedule_time).await?;
    info!(job_id = %job.job_id, scheduled_for = %schedule_time, "Job scheduled");

    let response = JobAcceptedResponse {
        message: "Job scheduled successfully".to_string(),
        job_id: job.job_id,
        message_id: job.message_id,
        queue_name,
        data: None,
        scheduled_for: Some(schedule_time),
    };
    Ok((StatusCode::ACCEPTED, Json(response)).into_response())
}
