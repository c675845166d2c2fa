//! PostgreSQL result store.
//!
//! Records are stored as JSONB next to the handful of columns used for filtering and ordering.
//! Analytics updates run in a transaction that locks the user's row with `SELECT ... FOR UPDATE`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::instrument;

use super::models::{AnalysisResult, Feedback, UserAnalytics};
use super::{AnalyticsRebuild, AnalyticsUpdate, Result, ResultStore};
use crate::types::AnalysisId;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

#[derive(FromRow)]
struct FeedbackRow {
    id: uuid::Uuid,
    user_id: String,
    analysis_id: uuid::Uuid,
    rating: i16,
    comment: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<FeedbackRow> for Feedback {
    fn from(row: FeedbackRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            analysis_id: row.analysis_id,
            rating: u8::try_from(row.rating).unwrap_or_default(),
            comment: row.comment,
            timestamp: row.created_at,
        }
    }
}

impl PostgresStore {
    pub async fn connect(url: &str, max_connections: u32) -> std::result::Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new().max_connections(max_connections).connect(url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        crate::migrator().run(&self.pool).await
    }
}

fn unwrap_all<T>(rows: Vec<Json<T>>) -> Vec<T> {
    rows.into_iter().map(|Json(record)| record).collect()
}

#[async_trait]
impl ResultStore for PostgresStore {
    #[instrument(skip(self, result), fields(analysis_id = %result.id), err)]
    async fn save_analysis(&self, result: &AnalysisResult) -> Result<()> {
        sqlx::query(
            "INSERT INTO analysis_results (id, user_id, repository_full_name, created_at, record) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(result.id)
        .bind(&result.user_id)
        .bind(&result.repository_full_name)
        .bind(result.timestamp)
        .bind(Json(result))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_analysis(&self, user_id: &str, id: AnalysisId) -> Result<Option<AnalysisResult>> {
        let record = sqlx::query_scalar::<_, Json<AnalysisResult>>("SELECT record FROM analysis_results WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record.map(|Json(record)| record))
    }

    #[instrument(skip(self), err)]
    async fn list_analyses(&self, user_id: &str, limit: usize) -> Result<Vec<AnalysisResult>> {
        let rows = sqlx::query_scalar::<_, Json<AnalysisResult>>(
            "SELECT record FROM analysis_results WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(unwrap_all(rows))
    }

    #[instrument(skip(self), err)]
    async fn list_by_repository(&self, user_id: &str, repository_full_name: &str) -> Result<Vec<AnalysisResult>> {
        let rows = sqlx::query_scalar::<_, Json<AnalysisResult>>(
            "SELECT record FROM analysis_results WHERE user_id = $1 AND repository_full_name = $2 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .bind(repository_full_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(unwrap_all(rows))
    }

    #[instrument(skip(self), err)]
    async fn list_since(&self, user_id: &str, since: Option<DateTime<Utc>>) -> Result<Vec<AnalysisResult>> {
        let rows = sqlx::query_scalar::<_, Json<AnalysisResult>>(
            "SELECT record FROM analysis_results
             WHERE user_id = $1 AND ($2::timestamptz IS NULL OR created_at >= $2)
             ORDER BY created_at ASC",
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(unwrap_all(rows))
    }

    #[instrument(skip(self, feedback), fields(analysis_id = %feedback.analysis_id), err)]
    async fn save_feedback(&self, feedback: &Feedback) -> Result<()> {
        sqlx::query(
            "INSERT INTO feedback (id, user_id, analysis_id, rating, comment, created_at) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(feedback.id)
        .bind(&feedback.user_id)
        .bind(feedback.analysis_id)
        .bind(i16::from(feedback.rating))
        .bind(&feedback.comment)
        .bind(feedback.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_feedback(&self, user_id: &str, since: Option<DateTime<Utc>>) -> Result<Vec<Feedback>> {
        let rows = sqlx::query_as::<_, FeedbackRow>(
            "SELECT id, user_id, analysis_id, rating, comment, created_at FROM feedback
             WHERE user_id = $1 AND ($2::timestamptz IS NULL OR created_at >= $2)
             ORDER BY created_at ASC",
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Feedback::from).collect())
    }

    #[instrument(skip(self), err)]
    async fn get_analytics(&self, user_id: &str) -> Result<Option<UserAnalytics>> {
        let record = sqlx::query_scalar::<_, Json<UserAnalytics>>("SELECT record FROM user_analytics WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record.map(|Json(record)| record))
    }

    #[instrument(skip(self, update), err)]
    async fn update_analytics(&self, user_id: &str, update: AnalyticsUpdate<'_>) -> Result<UserAnalytics> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO user_analytics (user_id, record) VALUES ($1, $2) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .bind(Json(UserAnalytics::empty(user_id)))
            .execute(&mut *tx)
            .await?;

        let Json(mut row) =
            sqlx::query_scalar::<_, Json<UserAnalytics>>("SELECT record FROM user_analytics WHERE user_id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await?;

        update(&mut row);

        sqlx::query("UPDATE user_analytics SET record = $2, updated_at = now() WHERE user_id = $1")
            .bind(user_id)
            .bind(Json(&row))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(row)
    }

    #[instrument(skip(self, rebuild), err)]
    async fn rebuild_analytics(&self, user_id: &str, rebuild: AnalyticsRebuild<'_>) -> Result<UserAnalytics> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO user_analytics (user_id, record) VALUES ($1, $2) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .bind(Json(UserAnalytics::empty(user_id)))
            .execute(&mut *tx)
            .await?;

        let Json(existing) =
            sqlx::query_scalar::<_, Json<UserAnalytics>>("SELECT record FROM user_analytics WHERE user_id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await?;

        let analyses = sqlx::query_scalar::<_, Json<AnalysisResult>>(
            "SELECT record FROM analysis_results WHERE user_id = $1 ORDER BY created_at ASC",
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;
        let feedback = sqlx::query_as::<_, FeedbackRow>(
            "SELECT id, user_id, analysis_id, rating, comment, created_at FROM feedback
             WHERE user_id = $1 ORDER BY created_at ASC",
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;

        let feedback: Vec<Feedback> = feedback.into_iter().map(Feedback::from).collect();
        let mut row = rebuild(&unwrap_all(analyses), &feedback);
        row.created_at = existing.created_at;

        sqlx::query("UPDATE user_analytics SET record = $2, updated_at = now() WHERE user_id = $1")
            .bind(user_id)
            .bind(Json(&row))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use crate::test_utils::sample_result;
    use chrono::Duration;
    use uuid::Uuid;

    fn at(result: AnalysisResult, days_ago: i64) -> AnalysisResult {
        AnalysisResult {
            timestamp: Utc::now() - Duration::days(days_ago),
            ..result
        }
    }

    fn ids(analyses: &[AnalysisResult]) -> Vec<AnalysisId> {
        analyses.iter().map(|a| a.id).collect()
    }

    #[sqlx::test]
    async fn test_analyses_are_scoped_ordered_and_limited(pool: PgPool) {
        let store = PostgresStore::from_pool(pool);
        let oldest = at(sample_result("alice", Some("acme/api")), 60);
        let middle = at(sample_result("alice", Some("acme/web")), 10);
        let newest = at(sample_result("alice", Some("acme/api")), 1);
        let theirs = at(sample_result("bob", Some("acme/api")), 1);
        for result in [&middle, &theirs, &newest, &oldest] {
            store.save_analysis(result).await.unwrap();
        }

        let listed = store.list_analyses("alice", 2).await.unwrap();
        assert_eq!(ids(&listed), vec![newest.id, middle.id]);

        let all = store.list_since("alice", None).await.unwrap();
        assert_eq!(ids(&all), vec![oldest.id, middle.id, newest.id]);

        let recent = store
            .list_since("alice", Some(Utc::now() - Duration::days(30)))
            .await
            .unwrap();
        assert_eq!(ids(&recent), vec![middle.id, newest.id]);

        let by_repo = store.list_by_repository("alice", "acme/api").await.unwrap();
        assert_eq!(ids(&by_repo), vec![newest.id, oldest.id]);

        let fetched = store.get_analysis("alice", newest.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, newest.id);
        assert_eq!(fetched.repository_full_name.as_deref(), Some("acme/api"));
        assert!(store.get_analysis("alice", theirs.id).await.unwrap().is_none());
    }

    #[sqlx::test]
    async fn test_feedback_requires_an_existing_analysis(pool: PgPool) {
        let store = PostgresStore::from_pool(pool);
        let analysis = sample_result("alice", None);
        store.save_analysis(&analysis).await.unwrap();

        let orphan = Feedback::new("alice".into(), Uuid::new_v4(), 3, None);
        assert!(matches!(store.save_feedback(&orphan).await, Err(StoreError::Other(_))));

        let first = Feedback {
            timestamp: Utc::now() - Duration::minutes(5),
            ..Feedback::new("alice".into(), analysis.id, 5, Some("spot on".into()))
        };
        let second = Feedback::new("alice".into(), analysis.id, 2, None);
        store.save_feedback(&second).await.unwrap();
        store.save_feedback(&first).await.unwrap();

        let listed = store.list_feedback("alice", None).await.unwrap();
        assert_eq!(listed.iter().map(|f| f.id).collect::<Vec<_>>(), vec![first.id, second.id]);
        assert_eq!(listed[0].rating, 5);
        assert_eq!(listed[0].comment.as_deref(), Some("spot on"));
        assert!(store.list_feedback("bob", None).await.unwrap().is_empty());
    }

    #[sqlx::test]
    async fn test_concurrent_analytics_updates_are_serialised(pool: PgPool) {
        let store = PostgresStore::from_pool(pool);

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .update_analytics("alice", &|row: &mut UserAnalytics| row.total_prs_analyzed += 1)
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let row = store.get_analytics("alice").await.unwrap().unwrap();
        assert_eq!(row.total_prs_analyzed, 20);
        assert_eq!(row.user_id, "alice");
    }

    #[sqlx::test]
    async fn test_analytics_rows_are_per_user(pool: PgPool) {
        let store = PostgresStore::from_pool(pool);

        store
            .update_analytics("alice", &|row: &mut UserAnalytics| row.total_feedbacks = 7)
            .await
            .unwrap();
        store
            .update_analytics("bob", &|row: &mut UserAnalytics| row.total_feedbacks = 1)
            .await
            .unwrap();

        assert_eq!(store.get_analytics("alice").await.unwrap().unwrap().total_feedbacks, 7);
        assert_eq!(store.get_analytics("bob").await.unwrap().unwrap().total_feedbacks, 1);
        assert!(store.get_analytics("carol").await.unwrap().is_none());
    }

    #[sqlx::test]
    async fn test_rebuild_reads_history_and_keeps_created_at(pool: PgPool) {
        let store = PostgresStore::from_pool(pool);
        let created = store
            .update_analytics("alice", &|row: &mut UserAnalytics| row.total_prs_analyzed = 99)
            .await
            .unwrap()
            .created_at;
        let older = at(sample_result("alice", Some("acme/api")), 3);
        let newer = at(sample_result("alice", Some("acme/web")), 1);
        store.save_analysis(&newer).await.unwrap();
        store.save_analysis(&older).await.unwrap();
        store.save_analysis(&sample_result("bob", None)).await.unwrap();
        store
            .save_feedback(&Feedback::new("alice".into(), older.id, 4, None))
            .await
            .unwrap();

        let row = store
            .rebuild_analytics("alice", &|analyses: &[AnalysisResult], feedback: &[Feedback]| {
                let mut row = UserAnalytics::empty("alice");
                row.repository_list = analyses.iter().filter_map(|a| a.repository_full_name.clone()).collect();
                row.total_prs_analyzed = analyses.len() as u64;
                row.total_feedbacks = feedback.len() as u64;
                row
            })
            .await
            .unwrap();

        assert_eq!(row.repository_list, vec!["acme/api".to_string(), "acme/web".to_string()]);
        assert_eq!(row.total_prs_analyzed, 2);
        assert_eq!(row.total_feedbacks, 1);
        assert_eq!(row.created_at, created);
        assert_eq!(store.get_analytics("alice").await.unwrap(), Some(row));
    }
}
