//! Long-running loop that pulls mega-batches from the work queue and
//! schedules the embed -> cluster pipeline per discussion.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use idearoom_core::config::DispatcherConfig;
use idearoom_core::models::{Idea, IdeaStatus, WorkItem};
use idearoom_core::queue::QueueService;
use idearoom_core::stores::{DiscussionStore, IdeaStore};
use tracing::{debug, error, info, instrument, warn};

use crate::coordinator::ClusteringCoordinator;
use crate::embedding::ParallelEmbeddingProcessor;

pub struct Dispatcher {
    queue: Arc<dyn QueueService>,
    ideas: Arc<dyn IdeaStore>,
    discussions: Arc<dyn DiscussionStore>,
    processor: Arc<ParallelEmbeddingProcessor>,
    coordinator: Arc<ClusteringCoordinator>,
    cfg: DispatcherConfig,
    group_semaphore: Arc<tokio::sync::Semaphore>,
    shutdown: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn QueueService>,
        ideas: Arc<dyn IdeaStore>,
        discussions: Arc<dyn DiscussionStore>,
        processor: Arc<ParallelEmbeddingProcessor>,
        coordinator: Arc<ClusteringCoordinator>,
        cfg: DispatcherConfig,
    ) -> Self {
        let group_semaphore = Arc::new(tokio::sync::Semaphore::new(
            cfg.max_concurrent_discussions.max(1),
        ));
        Self {
            queue,
            ideas,
            discussions,
            processor,
            coordinator,
            cfg,
            group_semaphore,
            shutdown: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Signal the run loop to stop pulling work.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Main intake loop. Returns when a shutdown is signalled.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            mega_batch_size = self.cfg.mega_batch_size,
            max_concurrent = self.cfg.max_concurrent_discussions,
            "Dispatcher started"
        );

        while !self.shutdown.load(Ordering::SeqCst) {
            let items = match self
                .queue
                .dequeue_batch(self.cfg.mega_batch_size, self.cfg.poll_timeout)
                .await
            {
                Ok(items) => items,
                Err(e) => {
                    error!(error = %e, "Failed to poll work queue");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if items.is_empty() {
                continue;
            }

            self.process_mega_batch(items).await;
        }

        self.await_in_flight(Duration::from_secs(300)).await;
        info!("Dispatcher stopped");
        Ok(())
    }

    /// Wait for spawned discussion groups to finish, up to `timeout`.
    async fn await_in_flight(&self, timeout: Duration) {
        let start = std::time::Instant::now();
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            let remaining = self.in_flight.load(Ordering::SeqCst);
            info!(remaining, "Waiting for in-flight discussion batches");
            if start.elapsed() > timeout {
                warn!(remaining, "Shutdown timeout reached with batches in progress");
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    #[instrument(skip(self, items), fields(count = items.len()))]
    pub(crate) async fn process_mega_batch(self: &Arc<Self>, items: Vec<WorkItem>) {
        let idea_ids: Vec<String> = items.iter().map(|i| i.idea_id.clone()).collect();

        if let Err(e) = self
            .ideas
            .mark_status(&idea_ids, IdeaStatus::Processing)
            .await
        {
            error!(error = %e, "Failed to transition batch to processing");
            return;
        }

        let ideas = match self.ideas.fetch_by_ids(&idea_ids).await {
            Ok(ideas) => ideas,
            Err(e) => {
                error!(error = %e, "Failed to load batch ideas");
                self.mark_failed(&idea_ids).await;
                return;
            }
        };

        if ideas.is_empty() {
            warn!("No idea documents found for dequeued batch");
            return;
        }

        let mut groups: HashMap<String, Vec<Idea>> = HashMap::new();
        for idea in ideas {
            groups.entry(idea.discussion_id.clone()).or_default().push(idea);
        }
        debug!(discussions = groups.len(), "Mega-batch grouped");

        for (discussion_id, group) in groups {
            let permit = match self.group_semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            self.in_flight.fetch_add(1, Ordering::SeqCst);

            let dispatcher = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                let group_ids: Vec<String> = group.iter().map(|i| i.id.clone()).collect();

                if let Err(e) = dispatcher
                    .process_discussion_group(&discussion_id, group)
                    .await
                {
                    error!(
                        discussion_id = %discussion_id,
                        error = %e,
                        "Discussion batch failed, marking ideas failed"
                    );
                    dispatcher.mark_failed(&group_ids).await;
                }

                dispatcher.in_flight.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    async fn process_discussion_group(
        &self,
        discussion_id: &str,
        group: Vec<Idea>,
    ) -> Result<()> {
        let discussion = self
            .discussions
            .get(discussion_id)
            .await?
            .ok_or_else(|| anyhow!("discussion {discussion_id} not found"))?;

        let embedded = self
            .processor
            .process(group, &discussion.context())
            .await;

        if embedded.is_empty() {
            // Every idea failed to embed; they stay behind for the watchdog.
            warn!(discussion_id, "No ideas survived the embedding stage");
            return Ok(());
        }

        self.coordinator
            .process_centroid_batch(discussion_id, embedded)
            .await
            .context("centroid batch failed")?;
        Ok(())
    }

    async fn mark_failed(&self, idea_ids: &[String]) {
        if let Err(e) = self.ideas.mark_status(idea_ids, IdeaStatus::Failed).await {
            error!(error = %e, "Failed to mark ideas as failed");
        }
    }

    /// Hook for coalescing fan-out into throttled pushes. The publisher
    /// currently emits per committed batch, so this only paces.
    pub async fn run_throttle_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        while !self.shutdown.load(Ordering::SeqCst) {
            tick.tick().await;
        }
    }

    /// Periodic maintenance: repair lock keys that lost their TTL and
    /// replay deferred ideas orphaned by a crashed drain.
    pub async fn run_cleanup_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.cfg.cleanup_interval);
        while !self.shutdown.load(Ordering::SeqCst) {
            tick.tick().await;

            match self
                .queue
                .repair_lock_ttls(self.coordinator.lock_ttl())
                .await
            {
                Ok(repaired) if repaired > 0 => {
                    info!(repaired, "Repaired reclustering locks without TTL")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Lock TTL repair failed"),
            }

            match self.queue.orphaned_deferred().await {
                Ok(discussions) => {
                    for discussion_id in discussions {
                        info!(discussion_id = %discussion_id, "Draining orphaned deferred ideas");
                        if let Err(e) = self.coordinator.drain_deferred(&discussion_id).await {
                            warn!(
                                discussion_id = %discussion_id,
                                error = %e,
                                "Orphaned deferred drain failed"
                            );
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Orphaned deferred scan failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ClusteringCoordinator;
    use crate::embedding::ParallelEmbeddingProcessor;
    use crate::fakes::{
        CannedSummarizer, InMemoryBackend, NoopFormatter, RecordingPublisher, StaticEmbedder,
        pending_idea, test_clustering_config,
    };

    fn test_dispatcher_config() -> DispatcherConfig {
        DispatcherConfig {
            mega_batch_size: 2000,
            poll_timeout: Duration::from_millis(10),
            max_concurrent_discussions: 4,
            cleanup_interval: Duration::from_secs(300),
            stuck_after: Duration::from_secs(600),
        }
    }

    fn build_dispatcher(backend: &Arc<InMemoryBackend>, embedder: StaticEmbedder) -> Arc<Dispatcher> {
        let publisher = Arc::new(RecordingPublisher::default());
        let coordinator = Arc::new(ClusteringCoordinator::new(
            backend.clone(),
            backend.clone(),
            backend.clone(),
            backend.clone(),
            Arc::new(CannedSummarizer),
            publisher,
            test_clustering_config(),
        ));
        let processor = Arc::new(ParallelEmbeddingProcessor::new(
            backend.clone(),
            Arc::new(NoopFormatter),
            Arc::new(embedder),
            4,
        ));
        Arc::new(Dispatcher::new(
            backend.clone(),
            backend.clone(),
            backend.clone(),
            processor,
            coordinator,
            test_dispatcher_config(),
        ))
    }

    async fn wait_for_idle(dispatcher: &Arc<Dispatcher>) {
        for _ in 0..500 {
            if dispatcher.in_flight() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("in-flight discussion batches did not drain");
    }

    #[tokio::test]
    async fn mega_batch_flows_from_queue_to_completed_topics() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_discussion("d-1", "Office", "What should we improve?");
        backend.insert_discussion("d-2", "Cafeteria", "Menu wishes?");

        backend.insert_idea(pending_idea("i-1", "d-1", "We need better coffee"));
        backend.insert_idea(pending_idea("i-2", "d-1", "Add decaf options"));
        backend.insert_idea(pending_idea("i-3", "d-1", "Fix the slow elevator"));
        backend.insert_idea(pending_idea("i-4", "d-2", "More vegetarian dishes"));
        for (idea_id, discussion_id) in [
            ("i-1", "d-1"),
            ("i-2", "d-1"),
            ("i-3", "d-1"),
            ("i-4", "d-2"),
        ] {
            backend.enqueue(idea_id, discussion_id).await.unwrap();
        }

        let embedder = StaticEmbedder::default()
            .with("We need better coffee", vec![1.0, 0.0, 0.0])
            .with("Add decaf options", vec![0.98, 0.2, 0.0])
            .with("Fix the slow elevator", vec![0.0, 1.0, 0.0])
            .with("More vegetarian dishes", vec![0.0, 0.0, 1.0]);
        let dispatcher = build_dispatcher(&backend, embedder);

        let items = backend
            .dequeue_batch(2000, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(items.len(), 4);

        dispatcher.process_mega_batch(items).await;
        wait_for_idle(&dispatcher).await;

        for id in ["i-1", "i-2", "i-3", "i-4"] {
            let idea = backend.idea(id);
            assert_eq!(idea.status, IdeaStatus::Completed);
            assert!(idea.topic_id.is_some());
            assert!(idea.has_embedding());
        }
        // The coffee pair shares one topic; the elevator idea and the
        // other discussion's idea each get their own.
        assert_eq!(backend.idea("i-1").topic_id, backend.idea("i-2").topic_id);
        assert_ne!(backend.idea("i-1").topic_id, backend.idea("i-3").topic_id);
        assert_eq!(backend.topics_of("d-1").len(), 2);
        assert_eq!(backend.topics_of("d-2").len(), 1);
    }

    #[tokio::test]
    async fn embedding_failure_leaves_the_idea_behind_for_the_watchdog() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_discussion("d-1", "Office", "What should we improve?");

        backend.insert_idea(pending_idea("i-1", "d-1", "We need better coffee"));
        backend.insert_idea(pending_idea("i-2", "d-1", "unembeddable"));
        backend.enqueue("i-1", "d-1").await.unwrap();
        backend.enqueue("i-2", "d-1").await.unwrap();

        // No canned vector for "unembeddable": a permanent failure.
        let embedder = StaticEmbedder::default().with("We need better coffee", vec![1.0, 0.0]);
        let dispatcher = build_dispatcher(&backend, embedder);

        let items = backend
            .dequeue_batch(2000, Duration::from_millis(10))
            .await
            .unwrap();
        dispatcher.process_mega_batch(items).await;
        wait_for_idle(&dispatcher).await;

        assert_eq!(backend.idea("i-1").status, IdeaStatus::Completed);
        // The failed idea keeps `processing` so the watchdog can find it.
        let leftover = backend.idea("i-2");
        assert_eq!(leftover.status, IdeaStatus::Processing);
        assert!(leftover.last_attempt.is_some());
        assert!(leftover.topic_id.is_none());
    }

    #[tokio::test]
    async fn missing_discussion_marks_the_group_failed() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_idea(pending_idea("i-1", "ghost", "orphan idea"));
        backend.enqueue("i-1", "ghost").await.unwrap();

        let embedder = StaticEmbedder::default().with("orphan idea", vec![1.0, 0.0]);
        let dispatcher = build_dispatcher(&backend, embedder);

        let items = backend
            .dequeue_batch(2000, Duration::from_millis(10))
            .await
            .unwrap();
        dispatcher.process_mega_batch(items).await;
        wait_for_idle(&dispatcher).await;

        assert_eq!(backend.idea("i-1").status, IdeaStatus::Failed);
    }
}
