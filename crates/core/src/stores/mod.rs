//! Storage interfaces for ideas, topics and discussions.
//!
//! The Clustering Coordinator and Dispatcher only ever see these traits;
//! the composition root wires in the Postgres implementations, tests wire
//! in in-memory fakes.

pub mod postgres;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    Discussion, Enrichment, Idea, IdeaStatus, NewTopic, Topic, TopicAssignment, TopicUpsert,
    UnprocessedCounts,
};

#[async_trait]
pub trait IdeaStore: Send + Sync {
    /// Load idea documents by id, in submission order.
    async fn fetch_by_ids(&self, ids: &[String]) -> Result<Vec<Idea>>;

    /// All ideas of a discussion that carry a usable embedding, in
    /// submission order.
    async fn fetch_embedded_by_discussion(&self, discussion_id: &str) -> Result<Vec<Idea>>;

    /// Bulk status transition. Returns the number of ideas updated.
    async fn mark_status(&self, ids: &[String], status: IdeaStatus) -> Result<u64>;

    /// Record that an embedding attempt is starting.
    async fn touch_last_attempt(&self, id: &str) -> Result<()>;

    /// Persist embedding + enrichment + status `embedded` in one update.
    async fn save_embedding(
        &self,
        id: &str,
        embedding: &[f32],
        enrichment: &Enrichment,
    ) -> Result<()>;

    /// Operator retry hook: `stuck`/`failed` ideas go back to `pending`
    /// with topic and attempt state cleared. Returns how many were reset.
    async fn reset_for_retry(&self, ids: &[String]) -> Result<u64>;

    /// Ideas wedged in `processing` longer than `older_than` — candidates
    /// for the stuck watchdog.
    async fn stale_processing(&self, older_than: Duration) -> Result<Vec<String>>;

    /// Ideas of the discussion without a topic assignment.
    async fn unclustered_count(&self, discussion_id: &str) -> Result<i64>;

    /// Split of not-yet-completed ideas into needs-embedding and
    /// needs-clustering.
    async fn unprocessed_counts(&self, discussion_id: &str) -> Result<UnprocessedCounts>;

    /// Per-status idea counts for the operator surface.
    async fn status_counts(&self, discussion_id: &str) -> Result<HashMap<IdeaStatus, i64>>;
}

#[async_trait]
pub trait TopicStore: Send + Sync {
    /// All topics of a discussion with centroids and counts.
    async fn fetch_by_discussion(&self, discussion_id: &str) -> Result<Vec<Topic>>;

    /// Online-engine commit: topic centroid/count updates, new topics and
    /// idea assignments land in one transaction. Assigned ideas become
    /// `completed`.
    async fn apply_batch(
        &self,
        discussion_id: &str,
        upserts: &[TopicUpsert],
        inserts: &[NewTopic],
        assignments: &[TopicAssignment],
    ) -> Result<()>;

    /// Full-reclustering commit: delete every topic of the discussion,
    /// insert the rebuilt set and reassign all ideas in one transaction.
    async fn replace_for_discussion(
        &self,
        discussion_id: &str,
        topics: &[NewTopic],
        assignments: &[TopicAssignment],
    ) -> Result<()>;
}

#[async_trait]
pub trait DiscussionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Discussion>>;

    /// Recompute the discussion's idea/topic counts from the source tables.
    async fn refresh_counts(&self, id: &str) -> Result<()>;

    async fn touch_activity(&self, id: &str) -> Result<()>;
}
