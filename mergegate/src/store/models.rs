//! Persisted records: decision records, feedback and per-user analytics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::pipeline::models::Review;
use crate::types::{AnalysisId, FeedbackId, UserId};

/// Size and complexity of the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChangeMetrics {
    pub lines_of_code: Option<f64>,
    pub cyclomatic_complexity: f64,
    pub maintainability_index: Option<f64>,
    pub lines_added: u32,
    pub lines_deleted: u32,
    pub files_changed: u32,
}

/// Pass-through sections of the analysis stage output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSection {
    #[schema(value_type = Object)]
    pub metrics: Value,
    #[schema(value_type = Object)]
    pub mern_patterns: Value,
    #[schema(value_type = Object)]
    pub dependencies: Value,
    pub warnings: Vec<String>,
}

/// Field names follow the prediction service's snake_case convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PredictionSection {
    pub predicted_failure: u8,
    pub failure_probability: f64,
    pub will_fail: bool,
    pub confidence: Option<String>,
    pub recommendation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Overall {
    pub can_merge: bool,
    pub requires_review: bool,
    pub critical_issues_count: u32,
}

/// Wall-clock timings in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    pub total_duration: f64,
    pub analysis_duration: f64,
    pub prediction_duration: f64,
    pub review_duration: f64,
    /// Mean of the three stage durations
    pub average_duration: f64,
}

/// One pipeline run. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    #[schema(value_type = String, format = "uuid")]
    pub id: AnalysisId,
    pub user_id: UserId,
    pub file_id: String,
    pub developer: String,
    pub repository_full_name: Option<String>,
    pub pr_id: Option<String>,
    pub pr_url: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub metrics: ChangeMetrics,
    pub analysis: AnalysisSection,
    pub prediction: PredictionSection,
    pub review: Review,
    pub overall: Overall,
    pub performance: Performance,
    pub build_duration: f64,
    pub code_coverage_change: f64,
    pub previous_failure_rate: f64,
}

/// A 1-5 rating of a decision record. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    #[schema(value_type = String, format = "uuid")]
    pub id: FeedbackId,
    pub user_id: UserId,
    #[schema(value_type = String, format = "uuid")]
    pub analysis_id: AnalysisId,
    pub rating: u8,
    pub comment: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Feedback {
    pub fn new(user_id: UserId, analysis_id: AnalysisId, rating: u8, comment: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            analysis_id,
            rating,
            comment,
            timestamp: Utc::now(),
        }
    }
}

/// Running per-user statistics. Always rebuildable from analyses and feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAnalytics {
    pub user_id: UserId,
    /// Running mean of pipeline total duration, seconds. Stored unrounded.
    pub average_ci_latency: f64,
    /// Runs contributing to `average_ci_latency`
    pub total_analysis_steps: u64,
    /// Percent, derived from `correct_predictions / total_predictions`
    pub model_accuracy: f64,
    pub total_predictions: u64,
    /// Sum of per-prediction confidence scores
    pub correct_predictions: f64,
    pub repository_list: Vec<String>,
    pub active_repositories: u64,
    pub total_prs_analyzed: u64,
    pub llm_feedback_quality: f64,
    pub feedback_sum: u64,
    pub total_feedbacks: u64,
    pub last_updated: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl UserAnalytics {
    pub fn empty(user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            average_ci_latency: 0.0,
            total_analysis_steps: 0,
            model_accuracy: 0.0,
            total_predictions: 0,
            correct_predictions: 0.0,
            repository_list: vec![],
            active_repositories: 0,
            total_prs_analyzed: 0,
            llm_feedback_quality: 0.0,
            feedback_sum: 0,
            total_feedbacks: 0,
            last_updated: now,
            created_at: now,
        }
    }
}
