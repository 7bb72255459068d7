//! Discussion storage. Discussions are created externally; the core reads
//! them for context and keeps their aggregate counts fresh.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use tracing::instrument;

use crate::models::Discussion;
use crate::stores::DiscussionStore;

const GET_QUERY: &str = r#"
    SELECT *
    FROM discussions
    WHERE id = $1
"#;

const REFRESH_COUNTS_QUERY: &str = r#"
    UPDATE discussions
    SET idea_count = (SELECT COUNT(*) FROM ideas WHERE discussion_id = $1),
        topic_count = (SELECT COUNT(*) FROM topics WHERE discussion_id = $1),
        last_activity = NOW()
    WHERE id = $1
"#;

const TOUCH_ACTIVITY_QUERY: &str = r#"
    UPDATE discussions
    SET last_activity = NOW()
    WHERE id = $1
"#;

#[derive(Clone)]
pub struct PgDiscussionStore {
    pool: Pool<Postgres>,
}

impl PgDiscussionStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DiscussionStore for PgDiscussionStore {
    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> Result<Option<Discussion>> {
        sqlx::query_as::<_, Discussion>(GET_QUERY)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch discussion")
    }

    #[instrument(skip(self))]
    async fn refresh_counts(&self, id: &str) -> Result<()> {
        sqlx::query(REFRESH_COUNTS_QUERY)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to refresh discussion counts")?;
        Ok(())
    }

    async fn touch_activity(&self, id: &str) -> Result<()> {
        sqlx::query(TOUCH_ACTIVITY_QUERY)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to touch discussion activity")?;
        Ok(())
    }
}
