//! Coordinates the online Centroid engine and the offline Full Reclustering
//! engine for a discussion.
//!
//! Owns the reclustering lock protocol, the deferred-queue drain and the
//! atomic commits. While a discussion's lock is held, no online topic
//! mutation happens: the whole batch is parked and replayed after the lock
//! is released.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use idearoom_core::config::ClusteringConfig;
use idearoom_core::events::{Event, EventPublisher};
use idearoom_core::models::{Idea, IdeaStatus, IdeaView};
use idearoom_core::queue::QueueService;
use idearoom_core::stores::{DiscussionStore, IdeaStore, TopicStore};
use idearoom_core::summarizer::Summarizer;
use tracing::{error, info, instrument, warn};

use crate::clustering::centroid::{self, TopicCache};
use crate::clustering::recluster::ReclusterEngine;

/// Result of one online batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Assignments were committed.
    Processed { assigned: usize, new_topics: usize },
    /// A reclustering lock was held; the batch was deferred.
    Queued { count: usize },
    /// Nothing usable in the batch.
    Skipped { skipped: usize },
}

/// Result of a full reclustering request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclusterOutcome {
    /// Another run holds the lock; the caller may retry later.
    Busy,
    Rebuilt { topics: usize },
}

pub struct ClusteringCoordinator {
    ideas: Arc<dyn IdeaStore>,
    topics: Arc<dyn TopicStore>,
    discussions: Arc<dyn DiscussionStore>,
    queue: Arc<dyn QueueService>,
    summarizer: Arc<dyn Summarizer>,
    events: Arc<dyn EventPublisher>,
    cfg: ClusteringConfig,
}

impl ClusteringCoordinator {
    pub fn new(
        ideas: Arc<dyn IdeaStore>,
        topics: Arc<dyn TopicStore>,
        discussions: Arc<dyn DiscussionStore>,
        queue: Arc<dyn QueueService>,
        summarizer: Arc<dyn Summarizer>,
        events: Arc<dyn EventPublisher>,
        cfg: ClusteringConfig,
    ) -> Self {
        Self {
            ideas,
            topics,
            discussions,
            queue,
            summarizer,
            events,
            cfg,
        }
    }

    pub fn lock_ttl(&self) -> std::time::Duration {
        self.cfg.lock_ttl
    }

    /// Run the online engine over one discussion's batch of embedded ideas.
    #[instrument(skip(self, ideas), fields(count = ideas.len()))]
    pub async fn process_centroid_batch(
        &self,
        discussion_id: &str,
        ideas: Vec<Idea>,
    ) -> Result<BatchOutcome> {
        let (valid, invalid): (Vec<Idea>, Vec<Idea>) =
            ideas.into_iter().partition(Idea::has_embedding);

        if !invalid.is_empty() {
            // An "embedded" idea without a vector is an invariant breach;
            // park it for the operator rather than poisoning the batch.
            warn!(
                discussion_id,
                count = invalid.len(),
                "Marking ideas without embeddings as stuck"
            );
            let ids: Vec<String> = invalid.iter().map(|i| i.id.clone()).collect();
            self.ideas.mark_status(&ids, IdeaStatus::Stuck).await?;
        }

        if valid.is_empty() {
            return Ok(BatchOutcome::Skipped {
                skipped: invalid.len(),
            });
        }

        if self.queue.lock_held(discussion_id).await? {
            for idea in &valid {
                self.queue.defer(discussion_id, idea).await?;
            }
            info!(
                discussion_id,
                count = valid.len(),
                "Reclustering in progress, batch deferred"
            );
            return Ok(BatchOutcome::Queued { count: valid.len() });
        }

        let existing = self.topics.fetch_by_discussion(discussion_id).await?;
        let mut cache = TopicCache::from_topics(&existing);
        info!(
            discussion_id,
            topics = cache.len(),
            "Topic centroids cached for batch"
        );

        let classified = centroid::classify(&valid, &mut cache, &self.cfg);
        let outliers = centroid::group_outliers(&valid, &classified.outlier_indices, &self.cfg);
        let (inserts, outlier_assignments) =
            centroid::build_new_topics(discussion_id, &valid, &outliers, self.summarizer.as_ref())
                .await;

        let upserts = cache.upserts();
        let mut assignments = classified.assignments;
        assignments.extend(outlier_assignments);

        self.topics
            .apply_batch(discussion_id, &upserts, &inserts, &assignments)
            .await?;
        self.discussions.refresh_counts(discussion_id).await?;

        info!(
            discussion_id,
            assigned = assignments.len(),
            new_topics = inserts.len(),
            "Centroid batch committed"
        );

        self.emit_batch_processed(discussion_id, &valid, &assignments)
            .await;
        self.emit_unprocessed_counts(discussion_id).await;

        Ok(BatchOutcome::Processed {
            assigned: assignments.len(),
            new_topics: inserts.len(),
        })
    }

    /// Rebuild all topics of a discussion under the reclustering lock.
    ///
    /// The lock is released and the deferred queue drained on every path
    /// out, including errors; a crashed holder is covered by the lock TTL.
    #[instrument(skip(self))]
    pub async fn process_full_reclustering(&self, discussion_id: &str) -> Result<ReclusterOutcome> {
        if !self
            .queue
            .acquire_lock(discussion_id, self.cfg.lock_ttl)
            .await?
        {
            info!(discussion_id, "Reclustering lock already held");
            return Ok(ReclusterOutcome::Busy);
        }

        let result = self.run_reclustering(discussion_id).await;

        if let Err(e) = self.queue.release_lock(discussion_id).await {
            error!(discussion_id, error = %e, "Failed to release reclustering lock");
        }
        if let Err(e) = self.drain_deferred(discussion_id).await {
            error!(discussion_id, error = %e, "Failed to drain deferred ideas");
        }

        result.map(|topics| ReclusterOutcome::Rebuilt { topics })
    }

    async fn run_reclustering(&self, discussion_id: &str) -> Result<usize> {
        let ideas = self
            .ideas
            .fetch_embedded_by_discussion(discussion_id)
            .await?;
        info!(
            discussion_id,
            count = ideas.len(),
            "Starting full reclustering"
        );

        let engine = ReclusterEngine::new(self.cfg.clone(), self.summarizer.clone());
        let plan = engine.rebuild(discussion_id, &ideas).await;

        self.topics
            .replace_for_discussion(discussion_id, &plan.topics, &plan.assignments)
            .await?;
        self.discussions.refresh_counts(discussion_id).await?;

        self.emit_unprocessed_counts(discussion_id).await;

        Ok(plan.topics.len())
    }

    /// Replay ideas parked while a reclustering held the lock. The replay
    /// goes back through the online engine, so a newly acquired lock simply
    /// re-defers them; the protocol is safe under this reentry.
    ///
    /// Deferred ideas the rebuild already absorbed (committed with a topic)
    /// are dropped here, keeping assignment at-most-once and topic counts
    /// equal to their member sets.
    pub async fn drain_deferred(&self, discussion_id: &str) -> Result<()> {
        let deferred = self.queue.drain_deferred(discussion_id).await?;
        if deferred.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = deferred.iter().map(|i| i.id.clone()).collect();
        let current = self.ideas.fetch_by_ids(&ids).await?;
        let absorbed: std::collections::HashSet<&str> = current
            .iter()
            .filter(|i| i.status == IdeaStatus::Completed && i.topic_id.is_some())
            .map(|i| i.id.as_str())
            .collect();

        let replay: Vec<Idea> = deferred
            .into_iter()
            .filter(|i| !absorbed.contains(i.id.as_str()))
            .collect();

        if replay.is_empty() {
            info!(
                discussion_id,
                absorbed = absorbed.len(),
                "Deferred ideas already absorbed by the rebuild"
            );
            return Ok(());
        }

        info!(
            discussion_id,
            count = replay.len(),
            "Replaying deferred ideas through the online engine"
        );
        self.process_centroid_batch(discussion_id, replay).await?;
        Ok(())
    }

    async fn emit_batch_processed(
        &self,
        discussion_id: &str,
        processed: &[Idea],
        assignments: &[idearoom_core::models::TopicAssignment],
    ) {
        let by_idea: HashMap<&str, &str> = assignments
            .iter()
            .map(|a| (a.idea_id.as_str(), a.topic_id.as_str()))
            .collect();

        let views: Vec<IdeaView> = processed
            .iter()
            .map(|idea| {
                let mut view = IdeaView::from(idea);
                if let Some(topic_id) = by_idea.get(idea.id.as_str()) {
                    view.topic_id = Some((*topic_id).to_string());
                    view.status = IdeaStatus::Completed;
                }
                view
            })
            .collect();

        let unclustered_count = match self.ideas.unclustered_count(discussion_id).await {
            Ok(count) => count,
            Err(e) => {
                warn!(discussion_id, error = %e, "Failed to count unclustered ideas");
                0
            }
        };

        let count = views.len();
        self.events
            .publish(
                discussion_id,
                Event::BatchProcessed {
                    discussion_id: discussion_id.to_string(),
                    ideas: views,
                    count,
                    unclustered_count,
                    incremental_update: true,
                },
            )
            .await;
    }

    async fn emit_unprocessed_counts(&self, discussion_id: &str) {
        match self.ideas.unprocessed_counts(discussion_id).await {
            Ok(counts) => {
                self.events
                    .publish(
                        discussion_id,
                        Event::unprocessed_count_updated(discussion_id, counts),
                    )
                    .await;
            }
            Err(e) => {
                warn!(discussion_id, error = %e, "Failed to count unprocessed ideas");
            }
        }
    }
}
