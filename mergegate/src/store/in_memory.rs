//! In-memory result store.
//!
//! Suitable for tests and single-process development. Everything is lost on restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::models::{AnalysisResult, Feedback, UserAnalytics};
use super::{AnalyticsRebuild, AnalyticsUpdate, Result, ResultStore};
use crate::types::AnalysisId;

#[derive(Clone, Default)]
pub struct InMemoryStore {
    analyses: Arc<RwLock<Vec<AnalysisResult>>>,
    feedback: Arc<RwLock<Vec<Feedback>>>,
    analytics: Arc<DashMap<String, UserAnalytics>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(mut analyses: Vec<AnalysisResult>) -> Vec<AnalysisResult> {
    analyses.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    analyses
}

#[async_trait]
impl ResultStore for InMemoryStore {
    async fn save_analysis(&self, result: &AnalysisResult) -> Result<()> {
        self.analyses.write().await.push(result.clone());
        Ok(())
    }

    async fn get_analysis(&self, user_id: &str, id: AnalysisId) -> Result<Option<AnalysisResult>> {
        let analyses = self.analyses.read().await;
        Ok(analyses.iter().find(|a| a.id == id && a.user_id == user_id).cloned())
    }

    async fn list_analyses(&self, user_id: &str, limit: usize) -> Result<Vec<AnalysisResult>> {
        let analyses = self.analyses.read().await;
        let mine = analyses.iter().filter(|a| a.user_id == user_id).cloned().collect();
        Ok(newest_first(mine).into_iter().take(limit).collect())
    }

    async fn list_by_repository(&self, user_id: &str, repository_full_name: &str) -> Result<Vec<AnalysisResult>> {
        let analyses = self.analyses.read().await;
        let matching = analyses
            .iter()
            .filter(|a| a.user_id == user_id && a.repository_full_name.as_deref() == Some(repository_full_name))
            .cloned()
            .collect();
        Ok(newest_first(matching))
    }

    async fn list_since(&self, user_id: &str, since: Option<DateTime<Utc>>) -> Result<Vec<AnalysisResult>> {
        let analyses = self.analyses.read().await;
        let mut matching: Vec<_> = analyses
            .iter()
            .filter(|a| a.user_id == user_id && since.is_none_or(|since| a.timestamp >= since))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(matching)
    }

    async fn save_feedback(&self, feedback: &Feedback) -> Result<()> {
        self.feedback.write().await.push(feedback.clone());
        Ok(())
    }

    async fn list_feedback(&self, user_id: &str, since: Option<DateTime<Utc>>) -> Result<Vec<Feedback>> {
        let feedback = self.feedback.read().await;
        let mut matching: Vec<_> = feedback
            .iter()
            .filter(|f| f.user_id == user_id && since.is_none_or(|since| f.timestamp >= since))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(matching)
    }

    async fn get_analytics(&self, user_id: &str) -> Result<Option<UserAnalytics>> {
        Ok(self.analytics.get(user_id).map(|row| row.clone()))
    }

    async fn update_analytics(&self, user_id: &str, update: AnalyticsUpdate<'_>) -> Result<UserAnalytics> {
        // The entry guard holds the shard lock, so updates for one user never interleave
        let mut row = self
            .analytics
            .entry(user_id.to_string())
            .or_insert_with(|| UserAnalytics::empty(user_id));
        update(row.value_mut());
        Ok(row.clone())
    }

    async fn rebuild_analytics(&self, user_id: &str, rebuild: AnalyticsRebuild<'_>) -> Result<UserAnalytics> {
        // Both read guards stay alive until the row is written, so saves wait for the rebuild
        let analyses = self.analyses.read().await;
        let feedback = self.feedback.read().await;

        let mut history: Vec<AnalysisResult> = analyses.iter().filter(|a| a.user_id == user_id).cloned().collect();
        history.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let mut ratings: Vec<Feedback> = feedback.iter().filter(|f| f.user_id == user_id).cloned().collect();
        ratings.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        let mut rebuilt = rebuild(&history, &ratings);
        let mut row = self
            .analytics
            .entry(user_id.to_string())
            .or_insert_with(|| UserAnalytics::empty(user_id));
        rebuilt.created_at = row.created_at;
        *row.value_mut() = rebuilt;
        Ok(row.clone())
    }
}
