//! Dispatch of verified webhook deliveries to worker services.
//!
//! Each queue maps to exactly one worker service. A delivery is forwarded once, with that worker's
//! timeout, and the outcome is reported straight back to the provider: a 2xx tells it the job is
//! done, anything else makes it redeliver according to the retry contract. The router itself never
//! retries.
//!
//! Deliveries are at-least-once. Successful outcomes are remembered per `jobId` for a while, so a
//! redelivery of a job that already completed is answered from memory without calling the worker
//! again.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use metrics::counter;
use moka::future::Cache;
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use super::QueueError;
use super::jobs::{Job, JobMetadata, QueueName, stamp, unstamp};
use crate::config::{CompletedJobsConfig, ServiceEndpoint, WorkersConfig};
use crate::http::post_json_lenient;

/// What the webhook endpoint answers for a delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Completed(Value),
    Failed(Value),
}

impl DeliveryOutcome {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DeliveryOutcome::Completed(_) => StatusCode::OK,
            DeliveryOutcome::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> &Value {
        match self {
            DeliveryOutcome::Completed(body) | DeliveryOutcome::Failed(body) => body,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, DeliveryOutcome::Completed(_))
    }
}

impl IntoResponse for DeliveryOutcome {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            DeliveryOutcome::Completed(body) | DeliveryOutcome::Failed(body) => (status, Json(body)).into_response(),
        }
    }
}

/// How a validated job is forwarded and reported.
struct Forward<'a> {
    worker: &'a ServiceEndpoint,
    request: Value,
    id_field: &'static str,
    id_value: Value,
    result_key: &'static str,
    failure: &'static str,
}

#[derive(Clone)]
pub struct WebhookRouter {
    client: reqwest::Client,
    workers: WorkersConfig,
    completed: Cache<String, Value>,
}

impl WebhookRouter {
    pub fn new(client: reqwest::Client, workers: WorkersConfig, completed_jobs: &CompletedJobsConfig) -> Self {
        let completed = Cache::builder()
            .max_capacity(completed_jobs.capacity)
            .time_to_live(completed_jobs.ttl)
            .build();

        Self {
            client,
            workers,
            completed,
        }
    }

    /// Handle one delivery. `attempts` is the provider's redelivery counter, when it sent one.
    #[instrument(skip(self, body), fields(queue = %queue_name, job_id = tracing::field::Empty), err)]
    pub async fn dispatch(
        &self,
        queue_name: QueueName,
        body: Map<String, Value>,
        attempts: Option<u32>,
    ) -> Result<DeliveryOutcome, QueueError> {
        let (payload, metadata) = unstamp(body);
        let metadata = metadata.map(|mut m| {
            if let Some(attempts) = attempts {
                m.attempts = attempts;
            }
            m
        });

        if let Some(metadata) = &metadata {
            tracing::Span::current().record("job_id", metadata.job_id.as_str());
            if metadata.queue_name != queue_name {
                warn!(stamped = %metadata.queue_name, "Job delivered to a different queue than it was published to");
            }
            if let Some(previous) = self.completed.get(&metadata.job_id).await {
                info!(attempts = metadata.attempts, "Redelivery of completed job, replaying outcome");
                counter!("mergegate_webhook_deliveries_total", "queue" => queue_name.as_str(), "outcome" => "replayed")
                    .increment(1);
                return Ok(DeliveryOutcome::Completed(previous));
            }
        }

        let job = Job::parse(queue_name, &payload)?;
        let forward = self.forward_for(job);

        let outcome = match post_json_lenient(&self.client, &forward.worker.url, forward.worker.timeout, &forward.request).await {
            Ok(response) => {
                let mut body = Map::new();
                body.insert("success".to_string(), Value::Bool(true));
                body.insert(forward.id_field.to_string(), forward.id_value);
                body.insert(forward.result_key.to_string(), response);
                body.insert("completedAt".to_string(), json!(Utc::now()));
                DeliveryOutcome::Completed(Value::Object(body))
            }
            Err(e) => {
                warn!(
                    worker = %forward.worker.url,
                    attempts = metadata.as_ref().map(|m| m.attempts),
                    error = %e,
                    "Worker call failed"
                );
                let mut body = Map::new();
                body.insert("error".to_string(), Value::String(forward.failure.to_string()));
                body.insert("message".to_string(), Value::String(e.to_string()));
                body.insert(forward.id_field.to_string(), forward.id_value);
                DeliveryOutcome::Failed(Value::Object(body))
            }
        };

        let label = if outcome.is_completed() { "success" } else { "failure" };
        counter!("mergegate_webhook_deliveries_total", "queue" => queue_name.as_str(), "outcome" => label).increment(1);

        if let (DeliveryOutcome::Completed(body), Some(metadata)) = (&outcome, &metadata) {
            self.completed.insert(metadata.job_id.clone(), body.clone()).await;
        }

        debug!(completed = outcome.is_completed(), "Delivery handled");
        Ok(outcome)
    }

    /// Run a job in-process, skipping the provider. Metadata is stamped exactly as on publish.
    pub async fn run_direct(
        &self,
        queue_name: QueueName,
        payload: Map<String, Value>,
    ) -> Result<(JobMetadata, DeliveryOutcome), QueueError> {
        Job::parse(queue_name, &payload)?;

        let metadata = JobMetadata::direct(queue_name);
        let body = match stamp(payload, &metadata) {
            Value::Object(body) => body,
            _ => Map::new(),
        };

        let outcome = self.dispatch(queue_name, body, None).await?;
        Ok((metadata, outcome))
    }

    fn forward_for(&self, job: Job) -> Forward<'_> {
        match job {
            Job::CodeAnalysis(job) => Forward {
                worker: &self.workers.code_analysis,
                request: json!({
                    "repositoryId": job.repository_id,
                    "branch": job.branch,
                    "commitHash": job.commit_hash,
                    "userId": job.user_id,
                }),
                id_field: "repositoryId",
                id_value: Value::String(job.repository_id),
                result_key: "analysis",
                failure: "Code analysis failed",
            },
            Job::Email(job) => Forward {
                worker: &self.workers.email,
                id_value: Value::String(job.to.clone()),
                request: json!({
                    "to": job.to,
                    "subject": job.subject,
                    "body": job.body,
                    "template": job.template,
                    "data": job.data,
                }),
                id_field: "to",
                result_key: "delivery",
                failure: "Email delivery failed",
            },
            Job::Review(job) => Forward {
                worker: &self.workers.review,
                id_value: Value::String(job.pull_request_id.clone()),
                request: json!({
                    "pullRequestId": job.pull_request_id,
                    "repositoryId": job.repository_id,
                    "userId": job.user_id,
                    "files": job.files,
                }),
                id_field: "pullRequestId",
                result_key: "review",
                failure: "Review generation failed",
            },
            Job::FailurePrediction(job) => Forward {
                worker: &self.workers.failure_prediction,
                id_value: Value::String(job.repository_id.clone()),
                request: json!({
                    "repositoryId": job.repository_id,
                    "modelVersion": job.model_version,
                    "features": job.features,
                    "userId": job.user_id,
                }),
                id_field: "repositoryId",
                result_key: "prediction",
                failure: "Failure prediction failed",
            },
        }
    }
}
