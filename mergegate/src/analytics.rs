//! Per-user running statistics over pipeline runs and feedback.
//!
//! There are two ways a [`UserAnalytics`] row changes:
//!
//! - **Incrementally**, after every pipeline completion ([`AnalyticsAggregator::after_pipeline_completion`])
//!   and every feedback submission ([`AnalyticsAggregator::after_feedback`]).
//! - **By rebuilding** it from the stored history ([`AnalyticsAggregator::recalculate`]).
//!
//! Both paths are built from the same per-event functions ([`apply_run`], [`apply_feedback`]); a
//! rebuild is a fold of those functions over the history in timestamp order. Replaying the same
//! history therefore lands on the same numbers the incremental path produced, and a rebuild repairs
//! any drift left behind by a lost incremental write.
//!
//! A record and its incremental update must land on the same side of a rebuild, or the rebuild
//! either counts the record twice or drops it. Callers hold [`AnalyticsAggregator::lock_user`]
//! across the save and the incremental update; [`AnalyticsAggregator::recalculate`] takes the same
//! guard.
//!
//! Model accuracy is a confidence heuristic, not ground truth: each prediction contributes the
//! score of its confidence label (`high` 0.90, `medium` 0.85, `low` 0.80). Predictions without a
//! recognised label are not counted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument};
use utoipa::ToSchema;

use crate::store::models::{AnalysisResult, Feedback, UserAnalytics};
use crate::store::{self, ResultStore};

const CONFIDENCE_SCORES: [(&str, f64); 3] = [("high", 0.90), ("medium", 0.85), ("low", 0.80)];

/// Heuristic correctness score for a prediction's confidence label.
pub fn confidence_score(label: Option<&str>) -> Option<f64> {
    let label = label?;
    CONFIDENCE_SCORES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(label))
        .map(|(_, score)| *score)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Fold one completed pipeline run into `row`.
pub fn apply_run(row: &mut UserAnalytics, repository: Option<&str>, total_duration: f64, confidence: Option<&str>, at: DateTime<Utc>) {
    let steps = row.total_analysis_steps as f64;
    row.average_ci_latency = (row.average_ci_latency * steps + total_duration) / (steps + 1.0);
    row.total_analysis_steps += 1;

    if let Some(score) = confidence_score(confidence) {
        row.total_predictions += 1;
        row.correct_predictions += score;
        row.model_accuracy = row.correct_predictions / row.total_predictions as f64 * 100.0;
    }

    if let Some(repository) = repository.filter(|r| !r.is_empty()) {
        if !row.repository_list.iter().any(|known| known == repository) {
            row.repository_list.push(repository.to_string());
        }
    }
    row.active_repositories = row.repository_list.len() as u64;

    row.total_prs_analyzed += 1;
    row.last_updated = at;
}

/// Fold one feedback rating into `row`.
pub fn apply_feedback(row: &mut UserAnalytics, rating: u8, at: DateTime<Utc>) {
    row.feedback_sum += u64::from(rating);
    row.total_feedbacks += 1;
    row.llm_feedback_quality = row.feedback_sum as f64 / row.total_feedbacks as f64;
    row.last_updated = at;
}

/// Rebuild a user's row from scratch. `analyses` and `feedback` may be in any order.
pub fn rebuild(user_id: &str, analyses: &[AnalysisResult], feedback: &[Feedback]) -> UserAnalytics {
    let mut runs: Vec<&AnalysisResult> = analyses.iter().collect();
    runs.sort_by_key(|a| a.timestamp);
    let mut ratings: Vec<&Feedback> = feedback.iter().collect();
    ratings.sort_by_key(|f| f.timestamp);

    let mut row = UserAnalytics::empty(user_id);
    for run in runs {
        apply_run(
            &mut row,
            run.repository_full_name.as_deref(),
            run.performance.total_duration,
            run.prediction.confidence.as_deref(),
            run.timestamp,
        );
    }
    for rating in ratings {
        apply_feedback(&mut row, rating.rating, rating.timestamp);
    }
    row
}

/// What callers see of a user's analytics. Means are rounded to two decimals.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSummary {
    /// Seconds
    pub average_ci_latency: f64,
    /// Percent
    pub model_accuracy: f64,
    pub active_repositories: u64,
    pub total_prs_analyzed: u64,
    /// Mean rating, 1-5
    pub llm_feedback_quality: f64,
    pub total_feedbacks: u64,
    pub repository_list: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl From<&UserAnalytics> for AnalyticsSummary {
    fn from(row: &UserAnalytics) -> Self {
        Self {
            average_ci_latency: round2(row.average_ci_latency),
            model_accuracy: round2(row.model_accuracy),
            active_repositories: row.active_repositories,
            total_prs_analyzed: row.total_prs_analyzed,
            llm_feedback_quality: round2(row.llm_feedback_quality),
            total_feedbacks: row.total_feedbacks,
            repository_list: row.repository_list.clone(),
            last_updated: row.last_updated,
        }
    }
}

#[derive(Clone)]
pub struct AnalyticsAggregator {
    store: Arc<dyn ResultStore>,
    user_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl AnalyticsAggregator {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self {
            store,
            user_locks: Arc::new(DashMap::new()),
        }
    }

    /// Per-user guard ordering saves and their incremental updates against rebuilds.
    pub async fn lock_user(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = self.user_locks.entry(user_id.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    #[instrument(skip_all, fields(user_id = %result.user_id, analysis_id = %result.id), err)]
    pub async fn after_pipeline_completion(&self, result: &AnalysisResult) -> store::Result<UserAnalytics> {
        let repository = result.repository_full_name.as_deref();
        let total_duration = result.performance.total_duration;
        let confidence = result.prediction.confidence.as_deref();
        let at = Utc::now();

        let row = self
            .store
            .update_analytics(&result.user_id, &|row: &mut UserAnalytics| {
                apply_run(row, repository, total_duration, confidence, at)
            })
            .await?;

        debug!(total_prs = row.total_prs_analyzed, average_ci_latency = row.average_ci_latency, "Analytics updated");
        Ok(row)
    }

    #[instrument(skip(self), err)]
    pub async fn after_feedback(&self, user_id: &str, rating: u8) -> store::Result<UserAnalytics> {
        let at = Utc::now();
        self.store
            .update_analytics(user_id, &|row: &mut UserAnalytics| apply_feedback(row, rating, at))
            .await
    }

    /// Rebuild the row from the full history and overwrite the stored one.
    #[instrument(skip(self), err)]
    pub async fn recalculate(&self, user_id: &str) -> store::Result<UserAnalytics> {
        let _guard = self.lock_user(user_id).await;

        let row = self
            .store
            .rebuild_analytics(user_id, &|analyses: &[AnalysisResult], feedback: &[Feedback]| {
                let mut row = rebuild(user_id, analyses, feedback);
                row.last_updated = Utc::now();
                row
            })
            .await?;

        info!(total_prs = row.total_prs_analyzed, feedback = row.total_feedbacks, "Analytics recalculated");
        Ok(row)
    }

    /// Summary for `user_id`. Users without a row get zeroes; nothing is written.
    #[instrument(skip(self), err)]
    pub async fn get(&self, user_id: &str) -> store::Result<AnalyticsSummary> {
        let row = self
            .store
            .get_analytics(user_id)
            .await?
            .unwrap_or_else(|| UserAnalytics::empty(user_id));
        Ok(AnalyticsSummary::from(&row))
    }
}
