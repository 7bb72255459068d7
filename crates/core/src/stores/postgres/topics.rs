//! Topic document storage and the two atomic clustering commits.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use tracing::{info, instrument};

use crate::models::{NewTopic, Topic, TopicAssignment, TopicUpsert};
use crate::stores::TopicStore;

const FETCH_BY_DISCUSSION_QUERY: &str = r#"
    SELECT *
    FROM topics
    WHERE discussion_id = $1
    ORDER BY created_at ASC
"#;

const UPDATE_TOPIC_QUERY: &str = r#"
    UPDATE topics
    SET centroid = $2,
        count = $3,
        updated_at = NOW()
    WHERE id = $1
"#;

const INSERT_TOPIC_QUERY: &str = r#"
    INSERT INTO topics (id, discussion_id, representative_text, count, centroid)
    VALUES ($1, $2, $3, $4, $5)
"#;

const DELETE_TOPICS_QUERY: &str = r#"
    DELETE FROM topics
    WHERE discussion_id = $1
"#;

// Bulk idea assignment driven by parallel id/topic arrays.
const ASSIGN_IDEAS_QUERY: &str = r#"
    UPDATE ideas
    SET topic_id = data.topic_id,
        status = 'completed'
    FROM (
        SELECT UNNEST($1::text[]) AS idea_id,
               UNNEST($2::text[]) AS topic_id
    ) AS data
    WHERE ideas.id = data.idea_id
"#;

#[derive(Clone)]
pub struct PgTopicStore {
    pool: Pool<Postgres>,
}

impl PgTopicStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

async fn assign_ideas(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    assignments: &[TopicAssignment],
) -> Result<()> {
    if assignments.is_empty() {
        return Ok(());
    }
    let idea_ids: Vec<String> = assignments.iter().map(|a| a.idea_id.clone()).collect();
    let topic_ids: Vec<String> = assignments.iter().map(|a| a.topic_id.clone()).collect();
    sqlx::query(ASSIGN_IDEAS_QUERY)
        .bind(&idea_ids)
        .bind(&topic_ids)
        .execute(&mut **tx)
        .await
        .context("Failed to assign ideas to topics")?;
    Ok(())
}

#[async_trait]
impl TopicStore for PgTopicStore {
    #[instrument(skip(self))]
    async fn fetch_by_discussion(&self, discussion_id: &str) -> Result<Vec<Topic>> {
        sqlx::query_as::<_, Topic>(FETCH_BY_DISCUSSION_QUERY)
            .bind(discussion_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch topics")
    }

    #[instrument(
        skip(self, upserts, inserts, assignments),
        fields(upserts = upserts.len(), inserts = inserts.len(), assignments = assignments.len())
    )]
    async fn apply_batch(
        &self,
        discussion_id: &str,
        upserts: &[TopicUpsert],
        inserts: &[NewTopic],
        assignments: &[TopicAssignment],
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin batch transaction")?;

        for upsert in upserts {
            sqlx::query(UPDATE_TOPIC_QUERY)
                .bind(&upsert.id)
                .bind(&upsert.centroid)
                .bind(upsert.count)
                .execute(&mut *tx)
                .await
                .context("Failed to update topic centroid")?;
        }

        for topic in inserts {
            sqlx::query(INSERT_TOPIC_QUERY)
                .bind(&topic.id)
                .bind(&topic.discussion_id)
                .bind(&topic.representative_text)
                .bind(topic.count)
                .bind(&topic.centroid)
                .execute(&mut *tx)
                .await
                .context("Failed to insert topic")?;
        }

        assign_ideas(&mut tx, assignments).await?;

        tx.commit()
            .await
            .context("Failed to commit batch transaction")?;
        Ok(())
    }

    #[instrument(
        skip(self, topics, assignments),
        fields(topics = topics.len(), assignments = assignments.len())
    )]
    async fn replace_for_discussion(
        &self,
        discussion_id: &str,
        topics: &[NewTopic],
        assignments: &[TopicAssignment],
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin replace transaction")?;

        let deleted = sqlx::query(DELETE_TOPICS_QUERY)
            .bind(discussion_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete previous topics")?
            .rows_affected();

        for topic in topics {
            sqlx::query(INSERT_TOPIC_QUERY)
                .bind(&topic.id)
                .bind(&topic.discussion_id)
                .bind(&topic.representative_text)
                .bind(topic.count)
                .bind(&topic.centroid)
                .execute(&mut *tx)
                .await
                .context("Failed to insert rebuilt topic")?;
        }

        assign_ideas(&mut tx, assignments).await?;

        tx.commit()
            .await
            .context("Failed to commit replace transaction")?;

        info!(
            discussion_id,
            deleted,
            inserted = topics.len(),
            "Topic set replaced"
        );
        Ok(())
    }
}
