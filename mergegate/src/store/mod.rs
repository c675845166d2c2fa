//! Persistence for decision records, feedback and per-user analytics.
//!
//! [`ResultStore`] is the seam; [`in_memory::InMemoryStore`] backs development and tests,
//! [`postgres::PostgresStore`] backs deployments. Analyses and feedback are append-only. The
//! analytics row is the only record that is ever updated, always through
//! [`ResultStore::update_analytics`], which serialises updates per user.

pub mod in_memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::AnalysisId;
use models::{AnalysisResult, Feedback, UserAnalytics};

/// Mutation applied to a user's analytics row inside the per-user critical section.
pub type AnalyticsUpdate<'a> = &'a (dyn Fn(&mut UserAnalytics) + Send + Sync);

/// Builds a fresh analytics row from a user's full history (analyses, then feedback, both oldest
/// first).
pub type AnalyticsRebuild<'a> = &'a (dyn Fn(&[AnalysisResult], &[Feedback]) -> UserAnalytics + Send + Sync);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Entity not found")]
    NotFound,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            other => StoreError::Other(anyhow::Error::new(other)),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Other(anyhow::Error::new(err).context("decoding stored record"))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save_analysis(&self, result: &AnalysisResult) -> Result<()>;

    /// A user's analysis by id. Other users' analyses are invisible.
    async fn get_analysis(&self, user_id: &str, id: AnalysisId) -> Result<Option<AnalysisResult>>;

    /// Newest first.
    async fn list_analyses(&self, user_id: &str, limit: usize) -> Result<Vec<AnalysisResult>>;

    /// Newest first.
    async fn list_by_repository(&self, user_id: &str, repository_full_name: &str) -> Result<Vec<AnalysisResult>>;

    /// Analyses at or after `since`, oldest first. `None` returns the full history.
    async fn list_since(&self, user_id: &str, since: Option<DateTime<Utc>>) -> Result<Vec<AnalysisResult>>;

    async fn save_feedback(&self, feedback: &Feedback) -> Result<()>;

    /// Feedback at or after `since`, oldest first. `None` returns all feedback.
    async fn list_feedback(&self, user_id: &str, since: Option<DateTime<Utc>>) -> Result<Vec<Feedback>>;

    async fn get_analytics(&self, user_id: &str) -> Result<Option<UserAnalytics>>;

    /// Create the row if missing, apply `update`, persist and return the result. Concurrent calls
    /// for the same user are serialised; calls for different users are not.
    async fn update_analytics(&self, user_id: &str, update: AnalyticsUpdate<'_>) -> Result<UserAnalytics>;

    /// Replace the row with `rebuild` of the user's full history. The history is read inside the
    /// same critical section as the write, so no analysis or feedback saved concurrently is lost.
    /// `created_at` of an existing row is kept.
    async fn rebuild_analytics(&self, user_id: &str, rebuild: AnalyticsRebuild<'_>) -> Result<UserAnalytics>;
}
