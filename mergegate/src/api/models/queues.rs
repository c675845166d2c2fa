use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

use crate::queue::jobs::QueueName;

/// Reserved key in a schedule request body.
pub const SCHEDULE_TIME_KEY: &str = "scheduleTime";

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobAcceptedResponse {
    pub message: String,
    pub job_id: String,
    pub message_id: String,
    pub queue_name: QueueName,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub data: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct BulkJobsRequest {
    #[schema(value_type = Vec<Object>)]
    pub jobs: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BulkJobsResponse<T> {
    pub message: String,
    pub jobs: Vec<T>,
    pub queue_name: QueueName,
}

/// Per-job result of a bulk submission handled in-process.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DirectBulkItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `scheduleTime` as either an RFC 3339 string or unix milliseconds.
pub fn parse_schedule_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}
