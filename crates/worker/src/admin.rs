//! Operator-facing surface: idea submission, manual reclustering,
//! bulk retries and the stuck watchdog.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use idearoom_core::events::{Event, EventPublisher};
use idearoom_core::models::{Idea, IdeaStatus, IdeaView};
use idearoom_core::queue::QueueService;
use idearoom_core::stores::IdeaStore;
use tracing::{info, instrument, warn};

use crate::coordinator::{ClusteringCoordinator, ReclusterOutcome};

pub struct AdminService {
    ideas: Arc<dyn IdeaStore>,
    queue: Arc<dyn QueueService>,
    events: Arc<dyn EventPublisher>,
    coordinator: Arc<ClusteringCoordinator>,
}

impl AdminService {
    pub fn new(
        ideas: Arc<dyn IdeaStore>,
        queue: Arc<dyn QueueService>,
        events: Arc<dyn EventPublisher>,
        coordinator: Arc<ClusteringCoordinator>,
    ) -> Self {
        Self {
            ideas,
            queue,
            events,
            coordinator,
        }
    }

    /// Submission contract: enqueue the idea-process job and push the
    /// `new_idea` projection to the discussion room.
    #[instrument(skip(self, idea), fields(idea_id = %idea.id, discussion_id = %idea.discussion_id))]
    pub async fn submit_idea(&self, idea: &Idea) -> Result<()> {
        self.queue.enqueue(&idea.id, &idea.discussion_id).await?;
        self.events
            .publish(&idea.discussion_id, Event::NewIdea(IdeaView::from(idea)))
            .await;
        Ok(())
    }

    /// Manual trigger for a full topic rebuild. Fails fast with `Busy`
    /// when a run is already in progress.
    pub async fn trigger_full_reclustering(&self, discussion_id: &str) -> Result<ReclusterOutcome> {
        self.coordinator
            .process_full_reclustering(discussion_id)
            .await
    }

    /// Reset `stuck`/`failed` ideas back to `pending` and re-enqueue them.
    /// Returns the number of ideas actually reset.
    #[instrument(skip(self, idea_ids), fields(count = idea_ids.len()))]
    pub async fn retry_ideas(&self, idea_ids: &[String]) -> Result<u64> {
        let ideas = self.ideas.fetch_by_ids(idea_ids).await?;
        let retryable: Vec<&Idea> = ideas
            .iter()
            .filter(|i| matches!(i.status, IdeaStatus::Stuck | IdeaStatus::Failed))
            .collect();

        if retryable.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = retryable.iter().map(|i| i.id.clone()).collect();
        let reset = self.ideas.reset_for_retry(&ids).await?;

        for idea in &retryable {
            self.queue.enqueue(&idea.id, &idea.discussion_id).await?;
        }

        info!(reset, "Ideas re-enqueued for retry");
        Ok(reset)
    }

    /// Clear a wedged reclustering lock ahead of its TTL.
    pub async fn clear_stuck_lock(&self, discussion_id: &str) -> Result<()> {
        warn!(discussion_id, "Operator cleared reclustering lock");
        self.queue.release_lock(discussion_id).await
    }

    /// Per-status idea counts for the operator dashboard.
    pub async fn status_breakdown(&self, discussion_id: &str) -> Result<HashMap<IdeaStatus, i64>> {
        self.ideas.status_counts(discussion_id).await
    }
}

/// One stuck-watchdog pass: reclassify ideas wedged in `processing` beyond
/// `stuck_after`. Returns how many were reclassified.
pub async fn sweep_stuck(ideas: &Arc<dyn IdeaStore>, stuck_after: Duration) -> Result<u64> {
    let stale = ideas.stale_processing(stuck_after).await?;
    if stale.is_empty() {
        return Ok(0);
    }
    ideas.mark_status(&stale, IdeaStatus::Stuck).await
}

/// Reclassify ideas wedged in `processing` as `stuck` so operators can see
/// and retry them. Runs until shutdown.
pub async fn run_stuck_watchdog(
    ideas: Arc<dyn IdeaStore>,
    stuck_after: Duration,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) {
    let mut tick = tokio::time::interval(interval);
    while !shutdown.load(Ordering::SeqCst) {
        tick.tick().await;

        match sweep_stuck(&ideas, stuck_after).await {
            Ok(0) => {}
            Ok(marked) => info!(marked, "Watchdog reclassified wedged ideas as stuck"),
            Err(e) => warn!(error = %e, "Stuck watchdog pass failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ClusteringCoordinator;
    use crate::fakes::{
        CannedSummarizer, InMemoryBackend, RecordingPublisher, embedded_idea, pending_idea,
        test_clustering_config,
    };
    use chrono::Duration as ChronoDuration;
    use chrono::Utc;

    fn admin(backend: &Arc<InMemoryBackend>) -> (AdminService, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let coordinator = Arc::new(ClusteringCoordinator::new(
            backend.clone(),
            backend.clone(),
            backend.clone(),
            backend.clone(),
            Arc::new(CannedSummarizer),
            publisher.clone(),
            test_clustering_config(),
        ));
        (
            AdminService::new(
                backend.clone(),
                backend.clone(),
                publisher.clone(),
                coordinator,
            ),
            publisher,
        )
    }

    #[tokio::test]
    async fn submit_enqueues_and_announces_the_idea() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_discussion("d-1", "Office", "What should we improve?");
        let (admin, publisher) = admin(&backend);

        let idea = pending_idea("i-1", "d-1", "We need better coffee");
        backend.insert_idea(idea.clone());
        admin.submit_idea(&idea).await.unwrap();

        assert_eq!(backend.work_queue.lock().unwrap().len(), 1);
        assert_eq!(publisher.event_names(), vec!["new_idea"]);
    }

    #[tokio::test]
    async fn retry_resets_and_requeues_only_terminal_ideas() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_discussion("d-1", "Office", "What should we improve?");
        let (admin, _) = admin(&backend);

        let mut stuck = pending_idea("i-1", "d-1", "one");
        stuck.status = IdeaStatus::Stuck;
        let mut failed = pending_idea("i-2", "d-1", "two");
        failed.status = IdeaStatus::Failed;
        let completed = {
            let mut idea = pending_idea("i-3", "d-1", "three");
            idea.status = IdeaStatus::Completed;
            idea
        };
        for idea in [&stuck, &failed, &completed] {
            backend.insert_idea((*idea).clone());
        }

        let reset = admin
            .retry_ideas(&["i-1".into(), "i-2".into(), "i-3".into()])
            .await
            .unwrap();

        assert_eq!(reset, 2);
        assert_eq!(backend.idea("i-1").status, IdeaStatus::Pending);
        assert_eq!(backend.idea("i-2").status, IdeaStatus::Pending);
        assert_eq!(backend.idea("i-3").status, IdeaStatus::Completed);
        assert_eq!(backend.work_queue.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn watchdog_sweep_marks_wedged_ideas_stuck() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_discussion("d-1", "Office", "What should we improve?");

        let mut wedged = pending_idea("i-1", "d-1", "old attempt");
        wedged.status = IdeaStatus::Processing;
        wedged.last_attempt = Some(Utc::now() - ChronoDuration::minutes(30));
        backend.insert_idea(wedged);

        let mut fresh = pending_idea("i-2", "d-1", "fresh attempt");
        fresh.status = IdeaStatus::Processing;
        fresh.last_attempt = Some(Utc::now());
        backend.insert_idea(fresh);

        let ideas: Arc<dyn IdeaStore> = backend.clone();
        let marked = sweep_stuck(&ideas, Duration::from_secs(600)).await.unwrap();

        assert_eq!(marked, 1);
        assert_eq!(backend.idea("i-1").status, IdeaStatus::Stuck);
        assert_eq!(backend.idea("i-2").status, IdeaStatus::Processing);
    }

    #[tokio::test]
    async fn stuck_ideas_flow_back_through_retry_to_completion() {
        // stuck -> retry -> pending; the status breakdown follows along.
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_discussion("d-1", "Office", "What should we improve?");
        let (admin, _) = admin(&backend);

        let mut idea = embedded_idea("i-1", "d-1", "lost one", vec![1.0, 0.0]);
        idea.status = IdeaStatus::Stuck;
        backend.insert_idea(idea);

        let before = admin.status_breakdown("d-1").await.unwrap();
        assert_eq!(before.get(&IdeaStatus::Stuck), Some(&1));

        admin.retry_ideas(&["i-1".into()]).await.unwrap();

        let after = admin.status_breakdown("d-1").await.unwrap();
        assert_eq!(after.get(&IdeaStatus::Pending), Some(&1));
        assert_eq!(after.get(&IdeaStatus::Stuck), None);
    }

    #[tokio::test]
    async fn clear_stuck_lock_releases_it() {
        let backend = Arc::new(InMemoryBackend::new());
        let (admin, _) = admin(&backend);

        backend
            .acquire_lock("d-1", Duration::from_secs(300))
            .await
            .unwrap();
        assert!(backend.lock_held("d-1").await.unwrap());

        admin.clear_stuck_lock("d-1").await.unwrap();
        assert!(!backend.lock_held("d-1").await.unwrap());
    }
}
