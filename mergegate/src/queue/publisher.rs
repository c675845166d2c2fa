//! Publishing jobs to the push-queue provider.
//!
//! ```text
//! QueuePublisher::publish(queue, payload, options)
//!   ├─ Job::parse()            // schema check, nothing dispatched on failure
//!   ├─ JobMetadata::new()      // jobId generated client-side
//!   ├─ stamp()                 // _metadata merged into the body
//!   └─ QueueProvider::publish  // destination = {public_base_url}/webhooks/{queue}
//! ```
//!
//! The provider owns durability and redelivery. We only tell it how many retries we want (see
//! [`RetryPolicy`]) and, for scheduled jobs, how long to hold the message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use utoipa::ToSchema;

use super::QueueError;
use super::jobs::{Job, JobMetadata, QueueName, stamp};
use super::retry::RetryPolicy;
use crate::config::QueueConfig;

/// A message ready to hand to the provider.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub destination: String,
    pub body: Value,
    pub retries: u32,
    pub delay: Option<Duration>,
    /// Headers the provider should forward to the destination on delivery
    pub forward_headers: HashMap<String, String>,
}

/// Seam between the publisher and the provider that stores and delivers messages.
#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Hand a message to the provider. Returns the provider's message id.
    async fn publish(&self, request: PublishRequest) -> Result<String, QueueError>;
}

/// Upstash QStash over its REST API.
pub struct QstashProvider {
    client: reqwest::Client,
    base_url: String,
    token: String,
    timeout: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QstashPublishResponse {
    message_id: String,
}

impl QstashProvider {
    pub fn new(client: reqwest::Client, config: &QueueConfig) -> Result<Self, QueueError> {
        let token = config
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| QueueError::NotConfigured("queue.token is not set".to_string()))?;

        Ok(Self {
            client,
            base_url: config.provider_url.trim_end_matches('/').to_string(),
            token,
            timeout: config.publish_timeout,
        })
    }
}

#[async_trait]
impl QueueProvider for QstashProvider {
    async fn publish(&self, request: PublishRequest) -> Result<String, QueueError> {
        let url = format!("{}/v2/publish/{}", self.base_url, request.destination);

        let mut builder = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .bearer_auth(&self.token)
            .header("Upstash-Retries", request.retries.to_string())
            .json(&request.body);

        if let Some(delay) = request.delay {
            builder = builder.header("Upstash-Delay", format!("{}s", delay.as_secs()));
        }
        for (name, value) in &request.forward_headers {
            builder = builder.header(format!("Upstash-Forward-{name}"), value);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(QueueError::ProviderRejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: QstashPublishResponse = response.json().await?;
        Ok(body.message_id)
    }
}

/// Reserved key in a job submission body carrying [`PublishOptions`]. It is removed before the
/// payload is validated.
pub const OPTIONS_KEY: &str = "options";

/// Remove the reserved `options` key from a submission body.
pub fn split_options(mut body: Map<String, Value>) -> Result<(Map<String, Value>, PublishOptions), QueueError> {
    let options = match body.remove(OPTIONS_KEY) {
        None | Some(Value::Null) => PublishOptions::default(),
        Some(value) => serde_json::from_value(value).map_err(|e| QueueError::InvalidOptions(e.to_string()))?,
    };
    Ok((body, options))
}

/// Caller-supplied publish options.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct PublishOptions {
    /// Seconds the provider should hold the message before the first delivery
    pub delay: Option<u64>,
    /// Overrides the configured retry count
    pub retries: Option<u32>,
    /// Extra headers forwarded to the webhook on delivery
    pub headers: HashMap<String, String>,
}

/// Identity of a published job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PublishedJob {
    pub job_id: String,
    pub message_id: String,
    pub queue_name: QueueName,
}

/// Per-item result of a bulk publish. Input order is preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum BulkItemOutcome {
    Published {
        #[serde(rename = "jobId")]
        job_id: String,
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Failed { error: String },
}

impl BulkItemOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, BulkItemOutcome::Published { .. })
    }
}

#[derive(Clone)]
pub struct QueuePublisher {
    provider: Arc<dyn QueueProvider>,
    public_base_url: String,
    retry: RetryPolicy,
}

impl QueuePublisher {
    pub fn new(provider: Arc<dyn QueueProvider>, config: &QueueConfig) -> Self {
        Self {
            provider,
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
            retry: config.retry.clone(),
        }
    }

    /// Where the provider should deliver jobs for `queue_name`.
    pub fn webhook_url(&self, queue_name: QueueName) -> String {
        format!("{}/webhooks/{}", self.public_base_url, queue_name)
    }

    #[instrument(skip(self, payload, options), fields(queue = %queue_name), err)]
    pub async fn publish(
        &self,
        queue_name: QueueName,
        payload: Map<String, Value>,
        options: PublishOptions,
    ) -> Result<PublishedJob, QueueError> {
        Job::parse(queue_name, &payload)?;

        let metadata = JobMetadata::new(queue_name);
        let request = PublishRequest {
            destination: self.webhook_url(queue_name),
            body: stamp(payload, &metadata),
            retries: options.retries.unwrap_or_else(|| self.retry.provider_retries()),
            delay: options.delay.map(Duration::from_secs),
            forward_headers: options.headers,
        };

        match self.provider.publish(request).await {
            Ok(message_id) => {
                counter!("mergegate_jobs_published_total", "queue" => queue_name.as_str(), "outcome" => "success").increment(1);
                debug!(job_id = %metadata.job_id, message_id = %message_id, "Job published");
                Ok(PublishedJob {
                    job_id: metadata.job_id,
                    message_id,
                    queue_name,
                })
            }
            Err(e) => {
                counter!("mergegate_jobs_published_total", "queue" => queue_name.as_str(), "outcome" => "failure").increment(1);
                warn!(job_id = %metadata.job_id, error = %e, "Job publish failed");
                Err(e)
            }
        }
    }

    /// Publish every job concurrently. Each item succeeds or fails on its own; there is no
    /// atomicity across the batch. Each item may carry its own `options`.
    pub async fn publish_bulk(&self, queue_name: QueueName, jobs: Vec<Map<String, Value>>) -> Vec<BulkItemOutcome> {
        let attempts = jobs.into_iter().map(|job| async move {
            match split_options(job) {
                Ok((payload, options)) => self.publish(queue_name, payload, options).await,
                Err(e) => Err(e),
            }
        });

        join_all(attempts)
            .await
            .into_iter()
            .map(|result| match result {
                Ok(job) => BulkItemOutcome::Published {
                    job_id: job.job_id,
                    message_id: job.message_id,
                },
                Err(e) => BulkItemOutcome::Failed { error: e.to_string() },
            })
            .collect()
    }

    /// Publish with a delivery delay so the job runs at `schedule_time`.
    pub async fn schedule(
        &self,
        queue_name: QueueName,
        payload: Map<String, Value>,
        schedule_time: DateTime<Utc>,
    ) -> Result<PublishedJob, QueueError> {
        let delay = (schedule_time - Utc::now()).to_std().map_err(|_| QueueError::ScheduleInPast)?;
        if delay.is_zero() {
            return Err(QueueError::ScheduleInPast);
        }

        // Round up so the job never fires early
        let delay_secs = delay.as_secs() + u64::from(delay.subsec_nanos() > 0);

        self.publish(
            queue_name,
            payload,
            PublishOptions {
                delay: Some(delay_secs),
                ..Default::default()
            },
        )
        .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use wiremock::matchers::{header, method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Provider that records every request and answers with sequential message ids.
    #[derive(Default)]
    pub(crate) struct RecordingProvider {
        pub requests: Mutex<Vec<PublishRequest>>,
    }

    #[async_trait]
    impl QueueProvider for RecordingProvider {
        async fn publish(&self, request: PublishRequest) -> Result<String, QueueError> {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request);
            Ok(format!("msg_{}", requests.len()))
        }
    }

    fn publisher(provider: Arc<RecordingProvider>) -> QueuePublisher {
        let config = QueueConfig {
            public_base_url: "https://gate.example.com/".to_string(),
            ..Default::default()
        };
        QueuePublisher::new(provider, &config)
    }

    fn email(to: &str) -> Map<String, Value> {
        json!({"to": to, "subject": "Build finished", "body": "All green"})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_stamps_metadata_and_destination() {
        let provider = Arc::new(RecordingProvider::default());
        let published = publisher(provider.clone())
            .publish(QueueName::Email, email("dev@example.com"), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(published.message_id, "msg_1");
        assert!(published.job_id.starts_with("email-"));

        let requests = provider.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.destination, "https://gate.example.com/webhooks/email");
        assert_eq!(request.retries, 2);
        assert_eq!(request.delay, None);
        assert_eq!(request.body["_metadata"]["jobId"], json!(published.job_id));
        assert_eq!(request.body["_metadata"]["attempts"], json!(0));
        assert_eq!(request.body["to"], json!("dev@example.com"));
    }

    #[tokio::test]
    async fn test_invalid_payload_is_not_dispatched() {
        let provider = Arc::new(RecordingProvider::default());
        let payload = json!({"subject": "no recipient"}).as_object().cloned().unwrap();

        let err = publisher(provider.clone())
            .publish(QueueName::Email, payload, PublishOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::InvalidPayload(_)));
        assert!(provider.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_with_one_invalid_job() {
        let provider = Arc::new(RecordingProvider::default());
        let mut jobs: Vec<_> = (0..5).map(|i| email(&format!("dev{i}@example.com"))).collect();
        jobs[2].remove("to");

        let outcomes = publisher(provider.clone()).publish_bulk(QueueName::Email, jobs).await;

        assert_eq!(outcomes.len(), 5);
        assert_eq!(outcomes.iter().filter(|o| o.is_published()).count(), 4);
        assert!(matches!(outcomes[2], BulkItemOutcome::Failed { .. }));
        assert_eq!(provider.requests.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_bulk_items_carry_their_own_options() {
        let provider = Arc::new(RecordingProvider::default());
        let mut delayed = email("late@example.com");
        delayed.insert(OPTIONS_KEY.to_string(), json!({"delay": 30, "retries": 1}));
        let mut broken = email("broken@example.com");
        broken.insert(OPTIONS_KEY.to_string(), json!({"delay": "soon"}));
        let jobs = vec![email("now@example.com"), delayed, broken];

        let outcomes = publisher(provider.clone()).publish_bulk(QueueName::Email, jobs).await;

        assert!(outcomes[0].is_published());
        assert!(outcomes[1].is_published());
        assert!(matches!(&outcomes[2], BulkItemOutcome::Failed { error } if error.starts_with("Invalid options")));

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.body.get(OPTIONS_KEY).is_none()));
        assert_eq!(requests[0].delay, None);
        assert_eq!(requests[1].delay, Some(Duration::from_secs(30)));
        assert_eq!(requests[1].retries, 1);
    }

    #[test]
    fn test_split_options() {
        let body = json!({"to": "a@b.c", "options": {"delay": 30, "retries": 1}}).as_object().cloned().unwrap();
        let (payload, options) = split_options(body).unwrap();
        assert!(!payload.contains_key("options"));
        assert_eq!(options.delay, Some(30));
        assert_eq!(options.retries, Some(1));

        let body = json!({"options": {"delay": "soon"}}).as_object().cloned().unwrap();
        assert!(matches!(split_options(body), Err(QueueError::InvalidOptions(_))));
    }

    #[tokio::test]
    async fn test_schedule_in_past_dispatches_nothing() {
        let provider = Arc::new(RecordingProvider::default());
        let err = publisher(provider.clone())
            .schedule(QueueName::Email, email("a@b.c"), Utc::now() - chrono::Duration::minutes(1))
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::ScheduleInPast));
        assert!(provider.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_schedule_sets_delay() {
        let provider = Arc::new(RecordingProvider::default());
        publisher(provider.clone())
            .schedule(QueueName::Email, email("a@b.c"), Utc::now() + chrono::Duration::minutes(10))
            .await
            .unwrap();

        let requests = provider.requests.lock().unwrap();
        let delay = requests[0].delay.unwrap();
        assert!(delay >= Duration::from_secs(599) && delay <= Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_qstash_provider_request_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/v2/publish/https:/+gate\.example\.com/webhooks/email$"))
            .and(header("authorization", "Bearer qstash-token"))
            .and(header("upstash-retries", "2"))
            .and(header("upstash-delay", "30s"))
            .and(header("upstash-forward-x-trace", "abc"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"messageId": "msg_qstash"})))
            .expect(1)
            .mount(&server)
            .await;

        let config = QueueConfig {
            provider_url: server.uri(),
            token: Some("qstash-token".to_string()),
            public_base_url: "https://gate.example.com".to_string(),
            ..Default::default()
        };
        let provider = QstashProvider::new(crate::http::build_client().unwrap(), &config).unwrap();
        let publisher = QueuePublisher::new(Arc::new(provider), &config);

        let published = publisher
            .publish(
                QueueName::Email,
                email("a@b.c"),
                PublishOptions {
                    delay: Some(30),
                    headers: HashMap::from([("x-trace".to_string(), "abc".to_string())]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(published.message_id, "msg_qstash");
    }

    #[tokio::test]
    async fn test_qstash_rejection_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid token"))
            .mount(&server)
            .await;

        let config = QueueConfig {
            provider_url: server.uri(),
            token: Some("bad".to_string()),
            ..Default::default()
        };
        let provider = QstashProvider::new(crate::http::build_client().unwrap(), &config).unwrap();
        let err = QueuePublisher::new(Arc::new(provider), &config)
            .publish(QueueName::Email, email("a@b.c"), PublishOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::ProviderRejected { status: 401, .. }));
    }

    #[test]
    fn test_qstash_requires_token() {
        let config = QueueConfig::default();
        assert!(matches!(
            QstashProvider::new(crate::http::build_client().unwrap(), &config),
            Err(QueueError::NotConfigured(_))
        ));
    }
}
