//! Pipeline input and the shapes returned by the three stage services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

/// A code change submitted for a merge decision.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRequest {
    /// Source text of the change. Must not be empty.
    #[serde(default)]
    pub code: String,
    /// Defaults to `file_{unix millis}`
    #[serde(default)]
    pub file_id: Option<String>,
    /// Defaults to the caller, then `unknown`
    #[serde(default)]
    pub developer: Option<String>,
    #[serde(default)]
    pub lines_added: u32,
    #[serde(default)]
    pub lines_deleted: u32,
    #[serde(default = "default_files_changed")]
    pub files_changed: u32,
    #[serde(default)]
    pub code_coverage_change: f64,
    #[serde(default)]
    pub build_duration: f64,
    #[serde(default = "default_previous_failure_rate")]
    pub previous_failure_rate: f64,
    #[serde(default)]
    pub repository_full_name: Option<String>,
    #[serde(default)]
    pub pr_id: Option<String>,
    #[serde(default)]
    pub pr_url: Option<String>,
}

fn default_files_changed() -> u32 {
    1
}

fn default_previous_failure_rate() -> f64 {
    0.1
}

/// Output of the analysis stage. Only `metrics.cyclomaticComplexity` and `predictionFeatures` are
/// interpreted; everything else is passed through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisOutput {
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub metrics: AnalysisMetrics,
    #[serde(default)]
    pub functions: Value,
    #[serde(default)]
    pub mern_patterns: Value,
    #[serde(default)]
    pub dependencies: Value,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub prediction_features: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisMetrics {
    #[serde(default)]
    pub cyclomatic_complexity: f64,
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub other: Map<String, Value>,
}

impl AnalysisMetrics {
    fn number(&self, keys: &[&str]) -> Option<f64> {
        keys.iter().find_map(|key| self.other.get(*key).and_then(Value::as_f64))
    }

    pub fn lines_of_code(&self) -> Option<f64> {
        self.number(&["linesOfCode", "totalLines"])
    }

    pub fn maintainability_index(&self) -> Option<f64> {
        self.number(&["maintainabilityIndex"])
    }
}

/// Output of the prediction stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionOutput {
    #[serde(default, deserialize_with = "flag")]
    pub predicted_failure: u8,
    pub failure_probability: f64,
    #[serde(default)]
    pub will_fail: Option<bool>,
    #[serde(default)]
    pub confidence: Option<String>,
    #[serde(default)]
    pub recommendation: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub failure_points: Option<Value>,
}

impl PredictionOutput {
    pub fn will_fail(&self) -> bool {
        self.will_fail.unwrap_or(self.predicted_failure == 1)
    }
}

/// Accepts `0`/`1` or `false`/`true`.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(u8::from(b)),
        Value::Number(n) => Ok(u8::from(n.as_f64().is_some_and(|f| f >= 0.5))),
        Value::Null => Ok(0),
        other => Err(serde::de::Error::custom(format!("expected 0/1 or boolean, got {other}"))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReviewIssue {
    pub severity: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub location: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ReviewIssue {
    /// `critical` and `high` issues block a merge.
    pub fn is_blocking(&self) -> bool {
        self.severity.eq_ignore_ascii_case("critical") || self.severity.eq_ignore_ascii_case("high")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CodeQuality {
    /// 0-100
    pub score: f64,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
}

impl Default for CodeQuality {
    fn default() -> Self {
        Self {
            score: 50.0,
            strengths: vec![],
            weaknesses: vec![],
        }
    }
}

/// Output of the review stage, or the fallback produced when that stage fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub summary: String,
    /// `low`, `medium`, `high`, `critical`, or `unknown` for a fallback review
    pub risk_level: String,
    pub should_merge: bool,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub code_quality: CodeQuality,
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
    /// True when the review stage failed and this review was synthesised locally
    #[serde(default)]
    pub fallback: bool,
}

impl Review {
    /// The review used when the review stage fails. Never approves a merge.
    pub fn fallback(reason: &str) -> Self {
        Self {
            summary: format!("Automated review unavailable: {reason}"),
            risk_level: "unknown".to_string(),
            should_merge: false,
            issues: vec![],
            recommendations: vec!["Automated review could not be generated. Please review this change manually.".to_string()],
            code_quality: CodeQuality::default(),
            generated_at: Some(Utc::now()),
            fallback: true,
        }
    }
}
