//! Runs one pipeline request end to end and produces the merge decision.
//!
//! ```text
//! Received -> Analyzing -> Predicting -> Reviewing -> Combining -> Stored -> Completed
//!                 |             |
//!                 +-> Failed <--+
//! ```
//!
//! Analysis and prediction failures are fatal: the caller gets the stage error and nothing is
//! stored. A review failure degrades to [`Review::fallback`], which never approves a merge.
//!
//! Persistence and the analytics update happen only after the decision is final, and their
//! failures are logged and counted but never change what the caller receives.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Span, debug, info, instrument, warn};
use uuid::Uuid;

use super::models::{AnalysisOutput, PipelineRequest, PredictionOutput, Review};
use super::stages::StageClients;
use crate::analytics::AnalyticsAggregator;
use crate::errors::{Error, Result};
use crate::store::ResultStore;
use crate::store::models::{AnalysisResult, AnalysisSection, ChangeMetrics, Overall, Performance, PredictionSection};
use crate::types::abbrev_uuid;

/// Probability at or above which a change cannot be merged.
pub const BLOCKING_FAILURE_PROBABILITY: f64 = 0.7;
/// Probability above which a human has to look at the change.
pub const REVIEW_FAILURE_PROBABILITY: f64 = 0.4;
/// Cyclomatic complexity above which a human has to look at the change.
pub const REVIEW_COMPLEXITY: f64 = 15.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Received,
    Analyzing,
    Predicting,
    Reviewing,
    Combining,
    Stored,
    Completed,
    Failed,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Received => "received",
            PipelineStage::Analyzing => "analyzing",
            PipelineStage::Predicting => "predicting",
            PipelineStage::Reviewing => "reviewing",
            PipelineStage::Combining => "combining",
            PipelineStage::Stored => "stored",
            PipelineStage::Completed => "completed",
            PipelineStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Fold the review, prediction and complexity into the merge decision.
pub fn combine(review: &Review, failure_probability: f64, cyclomatic_complexity: f64) -> Overall {
    let critical_issues_count = review.issues.iter().filter(|issue| issue.is_blocking()).count() as u32;

    Overall {
        can_merge: review.should_merge && failure_probability < BLOCKING_FAILURE_PROBABILITY && critical_issues_count == 0,
        requires_review: failure_probability > REVIEW_FAILURE_PROBABILITY
            || critical_issues_count > 0
            || cyclomatic_complexity > REVIEW_COMPLEXITY,
        critical_issues_count,
    }
}

/// Features for the prediction service. The analysis service may supply them; otherwise they are
/// derived from the request.
fn prediction_features(request: &PipelineRequest, analysis: &AnalysisOutput, developer: &str, at: DateTime<Utc>) -> Value {
    if let Some(features) = analysis.prediction_features.as_ref().filter(|f| f.is_object()) {
        return features.clone();
    }
    json!({
        "timestamp": at.to_rfc3339(),
        "developer": developer,
        "lines_added": request.lines_added,
        "lines_deleted": request.lines_deleted,
        "files_changed": request.files_changed,
        "avg_function_complexity": analysis.metrics.cyclomatic_complexity,
        "code_coverage_change": request.code_coverage_change,
        "build_duration": request.build_duration,
        "previous_failure_rate": request.previous_failure_rate,
    })
}

#[derive(Clone)]
pub struct Orchestrator {
    stages: StageClients,
    store: Arc<dyn ResultStore>,
    analytics: AnalyticsAggregator,
}

impl Orchestrator {
    pub fn new(stages: StageClients, store: Arc<dyn ResultStore>, analytics: AnalyticsAggregator) -> Self {
        Self { stages, store, analytics }
    }

    #[instrument(skip(self, request), fields(user_id = %user_id, file_id = tracing::field::Empty, stage = %PipelineStage::Received), err)]
    pub async fn run(&self, user_id: &str, request: PipelineRequest) -> Result<AnalysisResult> {
        if request.code.trim().is_empty() {
            return Err(Error::BadRequest {
                message: "Code is required".to_string(),
            });
        }

        let started_at = Utc::now();
        let started = Instant::now();
        let file_id = request
            .file_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("file_{}", started_at.timestamp_millis()));
        let developer = request
            .developer
            .clone()
            .filter(|d| !d.is_empty())
            .or_else(|| Some(user_id.to_string()).filter(|u| !u.is_empty()))
            .unwrap_or_else(|| "unknown".to_string());
        Span::current().record("file_id", file_id.as_str());

        enter(PipelineStage::Analyzing);
        let stage_started = Instant::now();
        let analysis = self
            .stages
            .analyze(&request, &file_id, &developer)
            .await
            .inspect_err(|_| fail())?;
        let analysis_duration = stage_started.elapsed().as_secs_f64();

        enter(PipelineStage::Predicting);
        let stage_started = Instant::now();
        let features = prediction_features(&request, &analysis, &developer, started_at);
        let prediction = self.stages.predict(&features).await.inspect_err(|_| fail())?;
        let prediction_duration = stage_started.elapsed().as_secs_f64();

        enter(PipelineStage::Reviewing);
        let stage_started = Instant::now();
        let review = match self.stages.review(&file_id, &analysis, &prediction).await {
            Ok(review) => review,
            Err(failure) => {
                warn!(error = %failure, "Review stage failed, using fallback review");
                Review::fallback(&failure.message)
            }
        };
        let review_duration = stage_started.elapsed().as_secs_f64();

        enter(PipelineStage::Combining);
        let overall = combine(&review, prediction.failure_probability, analysis.metrics.cyclomatic_complexity);
        let performance = Performance {
            total_duration: started.elapsed().as_secs_f64(),
            analysis_duration,
            prediction_duration,
            review_duration,
            average_duration: (analysis_duration + prediction_duration + review_duration) / 3.0,
        };
        let result = build_result(user_id, file_id, developer, &request, started_at, analysis, prediction, review, overall, performance);

        let outcome = if result.review.fallback { "completed_with_fallback" } else { "completed" };
        metrics::counter!("mergegate_pipeline_runs_total", "outcome" => outcome).increment(1);
        info!(
            analysis_id = %abbrev_uuid(&result.id),
            can_merge = overall.can_merge,
            requires_review = overall.requires_review,
            critical_issues = overall.critical_issues_count,
            total_secs = performance.total_duration,
            "Pipeline decision made"
        );

        // The decision above is final; nothing below can change it
        self.record(&result).await;
        enter(PipelineStage::Completed);

        Ok(result)
    }

    async fn record(&self, result: &AnalysisResult) {
        let _guard = self.analytics.lock_user(&result.user_id).await;

        match self.store.save_analysis(result).await {
            Ok(()) => enter(PipelineStage::Stored),
            Err(e) => {
                warn!(analysis_id = %abbrev_uuid(&result.id), error = %e, "Failed to persist analysis result");
                metrics::counter!("mergegate_side_effect_failures_total", "effect" => "persist").increment(1);
            }
        }

        if let Err(e) = self.analytics.after_pipeline_completion(result).await {
            warn!(analysis_id = %abbrev_uuid(&result.id), error = %e, "Failed to update analytics");
            metrics::counter!("mergegate_side_effect_failures_total", "effect" => "analytics").increment(1);
        }
    }
}

fn enter(stage: PipelineStage) {
    Span::current().record("stage", tracing::field::display(stage));
    debug!(%stage, "Pipeline stage");
}

fn fail() {
    enter(PipelineStage::Failed);
    metrics::counter!("mergegate_pipeline_runs_total", "outcome" => "failed").increment(1);
}

#[allow(clippy::too_many_arguments)]
fn build_result(
    user_id: &str,
    file_id: String,
    developer: String,
    request: &PipelineRequest,
    timestamp: DateTime<Utc>,
    analysis: AnalysisOutput,
    prediction: PredictionOutput,
    review: Review,
    overall: Overall,
    performance: Performance,
) -> AnalysisResult {
    AnalysisResult {
        id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        file_id,
        developer,
        repository_full_name: request.repository_full_name.clone(),
        pr_id: request.pr_id.clone(),
        pr_url: request.pr_url.clone(),
        timestamp,
        metrics: ChangeMetrics {
            lines_of_code: analysis.metrics.lines_of_code(),
            cyclomatic_complexity: analysis.metrics.cyclomatic_complexity,
            maintainability_index: analysis.metrics.maintainability_index(),
            lines_added: request.lines_added,
            lines_deleted: request.lines_deleted,
            files_changed: request.files_changed,
        },
        analysis: AnalysisSection {
            metrics: json!(analysis.metrics),
            mern_patterns: analysis.mern_patterns,
            dependencies: analysis.dependencies,
            warnings: analysis.warnings,
        },
        prediction: PredictionSection {
            predicted_failure: prediction.predicted_failure,
            failure_probability: prediction.failure_probability,
            will_fail: prediction.will_fail(),
            confidence: prediction.confidence,
            recommendation: prediction.recommendation,
        },
        review,
        overall,
        performance,
        build_duration: request.build_duration,
        code_coverage_change: request.code_coverage_change,
        previous_failure_rate: request.previous_failure_rate,
    }
}
