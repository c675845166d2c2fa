use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::store::models::AnalysisResult;
use crate::types::AnalysisId;

pub const DEFAULT_HISTORY_LIMIT: usize = 100;
pub const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HistoryQuery {
    /// Maximum number of records (default 100, max 1000)
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT)
    }
}

/// A lookback window such as `6months` or `1year`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub months: u32,
}

impl Default for Period {
    fn default() -> Self {
        Self { months: 6 }
    }
}

impl Period {
    /// Accepts `{n}months`, `{n}month`, `1year` and `{n}years`. Returns `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        let (count, unit_months) = if let Some(n) = s.strip_suffix("months").or_else(|| s.strip_suffix("month")) {
            (n, 1)
        } else if let Some(n) = s.strip_suffix("years").or_else(|| s.strip_suffix("year")) {
            (n, 12)
        } else {
            return None;
        };
        let count: u32 = count.trim().parse().ok().filter(|n| *n > 0)?;
        Some(Self {
            months: count.checked_mul(unit_months)?,
        })
    }

    pub fn since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_months(Months::new(self.months)).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PeriodQuery {
    /// `6months` (default), `1year`, or `{n}months`
    pub period: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RepositoryAnalyses {
    pub analyses: Vec<AnalysisResult>,
}

/// One point of a user's metrics history.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricsPoint {
    #[schema(value_type = String, format = "uuid")]
    pub analysis_id: AnalysisId,
    pub timestamp: DateTime<Utc>,
    pub repository_full_name: Option<String>,
    pub cyclomatic_complexity: f64,
    pub lines_of_code: Option<f64>,
    pub maintainability_index: Option<f64>,
    pub failure_probability: f64,
    pub code_quality_score: f64,
    pub can_merge: bool,
    pub requires_review: bool,
    pub critical_issues_count: u32,
    /// Seconds
    pub total_duration: f64,
}

impl From<&AnalysisResult> for MetricsPoint {
    fn from(result: &AnalysisResult) -> Self {
        Self {
            analysis_id: result.id,
            timestamp: result.timestamp,
            repository_full_name: result.repository_full_name.clone(),
            cyclomatic_complexity: result.metrics.cyclomatic_complexity,
            lines_of_code: result.metrics.lines_of_code,
            maintainability_index: result.metrics.maintainability_index,
            failure_probability: result.prediction.failure_probability,
            code_quality_score: result.review.code_quality.score,
            can_merge: result.overall.can_merge,
            requires_review: result.overall.requires_review,
            critical_issues_count: result.overall.critical_issues_count,
            total_duration: result.performance.total_duration,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MetricsHistory {
    /// Oldest first
    pub metrics: Vec<MetricsPoint>,
}
