//! Idea document storage.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use tracing::instrument;

use crate::models::{Enrichment, Idea, IdeaStatus, UnprocessedCounts};
use crate::stores::IdeaStore;

const FETCH_BY_IDS_QUERY: &str = r#"
    SELECT *
    FROM ideas
    WHERE id = ANY($1)
    ORDER BY submitted_at ASC
"#;

const FETCH_EMBEDDED_QUERY: &str = r#"
    SELECT *
    FROM ideas
    WHERE discussion_id = $1
      AND embedding IS NOT NULL
      AND cardinality(embedding) > 0
    ORDER BY submitted_at ASC
"#;

const MARK_STATUS_QUERY: &str = r#"
    UPDATE ideas
    SET status = $2
    WHERE id = ANY($1)
"#;

const TOUCH_LAST_ATTEMPT_QUERY: &str = r#"
    UPDATE ideas
    SET last_attempt = NOW()
    WHERE id = $1
"#;

const SAVE_EMBEDDING_QUERY: &str = r#"
    UPDATE ideas
    SET embedding = $2,
        status = 'embedded',
        intent = $3,
        keywords = $4,
        sentiment = $5,
        specificity = $6,
        related_topics = $7,
        on_topic = $8
    WHERE id = $1
"#;

const RESET_FOR_RETRY_QUERY: &str = r#"
    UPDATE ideas
    SET status = 'pending',
        topic_id = NULL,
        last_attempt = NULL
    WHERE id = ANY($1)
      AND status IN ('stuck', 'failed')
"#;

const STALE_PROCESSING_QUERY: &str = r#"
    SELECT id
    FROM ideas
    WHERE status = 'processing'
      AND COALESCE(last_attempt, submitted_at) < NOW() - ($1 * INTERVAL '1 second')
"#;

const UNCLUSTERED_COUNT_QUERY: &str = r#"
    SELECT COUNT(*)
    FROM ideas
    WHERE discussion_id = $1
      AND topic_id IS NULL
"#;

const UNPROCESSED_COUNTS_QUERY: &str = r#"
    SELECT
        COUNT(*) FILTER (WHERE embedding IS NULL) AS needs_embedding,
        COUNT(*) FILTER (WHERE embedding IS NOT NULL AND topic_id IS NULL) AS needs_clustering
    FROM ideas
    WHERE discussion_id = $1
"#;

const STATUS_COUNTS_QUERY: &str = r#"
    SELECT status, COUNT(*)
    FROM ideas
    WHERE discussion_id = $1
    GROUP BY status
"#;

#[derive(Clone)]
pub struct PgIdeaStore {
    pool: Pool<Postgres>,
}

impl PgIdeaStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdeaStore for PgIdeaStore {
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn fetch_by_ids(&self, ids: &[String]) -> Result<Vec<Idea>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_as::<_, Idea>(FETCH_BY_IDS_QUERY)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch ideas by id")
    }

    #[instrument(skip(self))]
    async fn fetch_embedded_by_discussion(&self, discussion_id: &str) -> Result<Vec<Idea>> {
        sqlx::query_as::<_, Idea>(FETCH_EMBEDDED_QUERY)
            .bind(discussion_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch embedded ideas")
    }

    #[instrument(skip(self, ids), fields(count = ids.len(), status = status.as_str()))]
    async fn mark_status(&self, ids: &[String], status: IdeaStatus) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(MARK_STATUS_QUERY)
            .bind(ids)
            .bind(status)
            .execute(&self.pool)
            .await
            .context("Failed to update idea status")?;
        Ok(result.rows_affected())
    }

    async fn touch_last_attempt(&self, id: &str) -> Result<()> {
        sqlx::query(TOUCH_LAST_ATTEMPT_QUERY)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to touch last_attempt")?;
        Ok(())
    }

    #[instrument(skip(self, embedding, enrichment), fields(dimensions = embedding.len()))]
    async fn save_embedding(
        &self,
        id: &str,
        embedding: &[f32],
        enrichment: &Enrichment,
    ) -> Result<()> {
        sqlx::query(SAVE_EMBEDDING_QUERY)
            .bind(id)
            .bind(embedding)
            .bind(&enrichment.intent)
            .bind(&enrichment.keywords)
            .bind(&enrichment.sentiment)
            .bind(&enrichment.specificity)
            .bind(&enrichment.related_topics)
            .bind(enrichment.on_topic)
            .execute(&self.pool)
            .await
            .context("Failed to save embedding")?;
        Ok(())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn reset_for_retry(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(RESET_FOR_RETRY_QUERY)
            .bind(ids)
            .execute(&self.pool)
            .await
            .context("Failed to reset ideas for retry")?;
        Ok(result.rows_affected())
    }

    async fn stale_processing(&self, older_than: Duration) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(STALE_PROCESSING_QUERY)
            .bind(older_than.as_secs() as i64)
            .fetch_all(&self.pool)
            .await
            .context("Failed to scan for stale processing ideas")
    }

    async fn unclustered_count(&self, discussion_id: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(UNCLUSTERED_COUNT_QUERY)
            .bind(discussion_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count unclustered ideas")
    }

    async fn unprocessed_counts(&self, discussion_id: &str) -> Result<UnprocessedCounts> {
        let (needs_embedding, needs_clustering) =
            sqlx::query_as::<_, (i64, i64)>(UNPROCESSED_COUNTS_QUERY)
                .bind(discussion_id)
                .fetch_one(&self.pool)
                .await
                .context("Failed to count unprocessed ideas")?;
        Ok(UnprocessedCounts {
            needs_embedding,
            needs_clustering,
        })
    }

    async fn status_counts(&self, discussion_id: &str) -> Result<HashMap<IdeaStatus, i64>> {
        let rows = sqlx::query_as::<_, (IdeaStatus, i64)>(STATUS_COUNTS_QUERY)
            .bind(discussion_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to count ideas by status")?;
        Ok(rows.into_iter().collect())
    }
}
