//! Queue names, job schemas and the metadata stamped onto every dispatched job.

use chrono::{DateTime, Utc};
use rand::prelude::RngExt;
use rand::rng;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

use super::QueueError;

/// Key under which [`JobMetadata`] travels inside a job body.
pub const METADATA_KEY: &str = "_metadata";

/// The fixed set of job queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    CodeAnalysis,
    Email,
    Review,
    FailurePrediction,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::CodeAnalysis,
        QueueName::Email,
        QueueName::Review,
        QueueName::FailurePrediction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::CodeAnalysis => "code-analysis",
            QueueName::Email => "email",
            QueueName::Review => "review",
            QueueName::FailurePrediction => "failure-prediction",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownQueue(pub String);

impl FromStr for QueueName {
    type Err = UnknownQueue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| UnknownQueue(s.to_string()))
    }
}

/// Identity and bookkeeping attached to a job at publish time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    pub job_id: String,
    pub queue_name: QueueName,
    pub created_at: DateTime<Utc>,
    /// Redelivery counter. Zero at publish time; the provider reports the real value on delivery.
    #[serde(default)]
    pub attempts: u32,
}

impl JobMetadata {
    pub fn new(queue_name: QueueName) -> Self {
        Self {
            job_id: generate_job_id(queue_name),
            queue_name,
            created_at: Utc::now(),
            attempts: 0,
        }
    }

    /// Metadata for a job that skips the provider and runs in-process.
    pub fn direct(queue_name: QueueName) -> Self {
        Self {
            job_id: format!("test-{}", generate_job_id(queue_name)),
            ..Self::new(queue_name)
        }
    }
}

const JOB_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `{queue}-{unix millis}-{9 random base36 chars}`
pub fn generate_job_id(queue_name: QueueName) -> String {
    let mut rng = rng();
    let suffix: String = (0..9)
        .map(|_| JOB_ID_ALPHABET[rng.random_range(0..JOB_ID_ALPHABET.len())] as char)
        .collect();
    format!("{}-{}-{}", queue_name, Utc::now().timestamp_millis(), suffix)
}

/// Merge metadata into a payload, producing the body that is handed to the provider.
pub fn stamp(mut payload: Map<String, Value>, metadata: &JobMetadata) -> Value {
    payload.insert(
        METADATA_KEY.to_string(),
        serde_json::to_value(metadata).unwrap_or(Value::Null),
    );
    Value::Object(payload)
}

/// Split a delivered body back into payload and metadata. Bodies without (or with unreadable)
/// metadata are still dispatched; the metadata is just absent.
pub fn unstamp(mut payload: Map<String, Value>) -> (Map<String, Value>, Option<JobMetadata>) {
    let metadata = payload
        .remove(METADATA_KEY)
        .and_then(|value| serde_json::from_value::<JobMetadata>(value).ok());
    (payload, metadata)
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CodeAnalysisJob {
    pub repository_id: String,
    pub branch: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmailJob {
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReviewJob {
    pub pull_request_id: String,
    pub repository_id: String,
    pub user_id: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PredictionJob {
    pub repository_id: String,
    pub model_version: String,
    #[schema(value_type = Object)]
    pub features: Map<String, Value>,
    pub user_id: String,
}

/// A payload that has passed its queue's schema.
#[derive(Debug, Clone)]
pub enum Job {
    CodeAnalysis(CodeAnalysisJob),
    Email(EmailJob),
    Review(ReviewJob),
    FailurePrediction(PredictionJob),
}

impl Job {
    /// Validate `payload` against the schema for `queue_name`. Extra fields are allowed.
    pub fn parse(queue_name: QueueName, payload: &Map<String, Value>) -> Result<Job, QueueError> {
        let job = match queue_name {
            QueueName::CodeAnalysis => {
                let job: CodeAnalysisJob = decode(payload)?;
                require_non_empty(&[
                    ("repositoryId", &job.repository_id),
                    ("branch", &job.branch),
                    ("userId", &job.user_id),
                ])?;
                Job::CodeAnalysis(job)
            }
            QueueName::Email => {
                let job: EmailJob = decode(payload)?;
                require_non_empty(&[("to", &job.to), ("subject", &job.subject)])?;
                Job::Email(job)
            }
            QueueName::Review => {
                let job: ReviewJob = decode(payload)?;
                require_non_empty(&[
                    ("pullRequestId", &job.pull_request_id),
                    ("repositoryId", &job.repository_id),
                    ("userId", &job.user_id),
                ])?;
                Job::Review(job)
            }
            QueueName::FailurePrediction => {
                let job: PredictionJob = decode(payload)?;
                require_non_empty(&[
                    ("repositoryId", &job.repository_id),
                    ("modelVersion", &job.model_version),
                    ("userId", &job.user_id),
                ])?;
                Job::FailurePrediction(job)
            }
        };
        Ok(job)
    }
}

fn decode<T: DeserializeOwned>(payload: &Map<String, Value>) -> Result<T, QueueError> {
    serde_json::from_value(Value::Object(payload.clone())).map_err(|e| QueueError::InvalidPayload(e.to_string()))
}

fn require_non_empty(fields: &[(&str, &String)]) -> Result<(), QueueError> {
    match fields.iter().find(|(_, value)| value.trim().is_empty()) {
        Some((name, _)) => Err(QueueError::InvalidPayload(format!("{name} must not be empty"))),
        None => Ok(()),
    }
}
