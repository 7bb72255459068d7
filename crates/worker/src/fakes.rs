//! In-memory substitutes for the stores, queue, AI clients and event
//! publisher, backing the coordinator/dispatcher tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use idearoom_core::embedder::{EmbedError, EmbeddingClient};
use idearoom_core::events::{Event, EventPublisher};
use idearoom_core::formatter::FormattingClient;
use idearoom_core::models::{
    Discussion, Enrichment, Idea, IdeaStatus, NewTopic, Topic, TopicAssignment, TopicUpsert,
    UnprocessedCounts, WorkItem,
};
use idearoom_core::queue::QueueService;
use idearoom_core::stores::{DiscussionStore, IdeaStore, TopicStore};
use idearoom_core::summarizer::Summarizer;

#[derive(Default)]
pub struct InMemoryBackend {
    pub ideas: Mutex<HashMap<String, Idea>>,
    pub topics: Mutex<HashMap<String, Topic>>,
    pub discussions: Mutex<HashMap<String, Discussion>>,
    pub work_queue: Mutex<VecDeque<WorkItem>>,
    pub locks: Mutex<HashMap<String, Instant>>,
    pub deferred: Mutex<HashMap<String, Vec<Idea>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_discussion(&self, id: &str, title: &str, prompt: &str) {
        self.discussions.lock().unwrap().insert(
            id.to_string(),
            Discussion {
                id: id.to_string(),
                title: title.to_string(),
                prompt: prompt.to_string(),
                idea_count: 0,
                topic_count: 0,
                last_activity: None,
                require_verification: false,
            },
        );
    }

    pub fn insert_idea(&self, idea: Idea) {
        self.ideas.lock().unwrap().insert(idea.id.clone(), idea);
    }

    pub fn insert_topic(&self, topic: Topic) {
        self.topics.lock().unwrap().insert(topic.id.clone(), topic);
    }

    pub fn idea(&self, id: &str) -> Idea {
        self.ideas.lock().unwrap().get(id).cloned().expect("idea exists")
    }

    pub fn topics_of(&self, discussion_id: &str) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self
            .topics
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.discussion_id == discussion_id)
            .cloned()
            .collect();
        topics.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        topics
    }

    pub fn deferred_len(&self, discussion_id: &str) -> usize {
        self.deferred
            .lock()
            .unwrap()
            .get(discussion_id)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl IdeaStore for InMemoryBackend {
    async fn fetch_by_ids(&self, ids: &[String]) -> Result<Vec<Idea>> {
        let map = self.ideas.lock().unwrap();
        let mut found: Vec<Idea> = ids.iter().filter_map(|id| map.get(id).cloned()).collect();
        found.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn fetch_embedded_by_discussion(&self, discussion_id: &str) -> Result<Vec<Idea>> {
        let map = self.ideas.lock().unwrap();
        let mut found: Vec<Idea> = map
            .values()
            .filter(|i| i.discussion_id == discussion_id && i.has_embedding())
            .cloned()
            .collect();
        found.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn mark_status(&self, ids: &[String], status: IdeaStatus) -> Result<u64> {
        let mut map = self.ideas.lock().unwrap();
        let mut updated = 0;
        for id in ids {
            if let Some(idea) = map.get_mut(id) {
                idea.status = status;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn touch_last_attempt(&self, id: &str) -> Result<()> {
        if let Some(idea) = self.ideas.lock().unwrap().get_mut(id) {
            idea.last_attempt = Some(Utc::now());
        }
        Ok(())
    }

    async fn save_embedding(
        &self,
        id: &str,
        embedding: &[f32],
        enrichment: &Enrichment,
    ) -> Result<()> {
        let mut map = self.ideas.lock().unwrap();
        let idea = map.get_mut(id).ok_or_else(|| anyhow!("idea {id} missing"))?;
        idea.embedding = Some(embedding.to_vec());
        idea.status = IdeaStatus::Embedded;
        idea.intent = enrichment.intent.clone();
        idea.keywords = enrichment.keywords.clone();
        idea.sentiment = enrichment.sentiment.clone();
        idea.specificity = enrichment.specificity.clone();
        idea.related_topics = enrichment.related_topics.clone();
        idea.on_topic = enrichment.on_topic;
        Ok(())
    }

    async fn reset_for_retry(&self, ids: &[String]) -> Result<u64> {
        let mut map = self.ideas.lock().unwrap();
        let mut reset = 0;
        for id in ids {
            if let Some(idea) = map.get_mut(id) {
                if matches!(idea.status, IdeaStatus::Stuck | IdeaStatus::Failed) {
                    idea.status = IdeaStatus::Pending;
                    idea.topic_id = None;
                    idea.last_attempt = None;
                    reset += 1;
                }
            }
        }
        Ok(reset)
    }

    async fn stale_processing(&self, older_than: Duration) -> Result<Vec<String>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let map = self.ideas.lock().unwrap();
        Ok(map
            .values()
            .filter(|i| {
                i.status == IdeaStatus::Processing
                    && i.last_attempt.unwrap_or(i.submitted_at) < cutoff
            })
            .map(|i| i.id.clone())
            .collect())
    }

    async fn unclustered_count(&self, discussion_id: &str) -> Result<i64> {
        let map = self.ideas.lock().unwrap();
        Ok(map
            .values()
            .filter(|i| i.discussion_id == discussion_id && i.topic_id.is_none())
            .count() as i64)
    }

    async fn unprocessed_counts(&self, discussion_id: &str) -> Result<UnprocessedCounts> {
        let map = self.ideas.lock().unwrap();
        let mut counts = UnprocessedCounts::default();
        for idea in map.values().filter(|i| i.discussion_id == discussion_id) {
            if !idea.has_embedding() {
                counts.needs_embedding += 1;
            } else if idea.topic_id.is_none() {
                counts.needs_clustering += 1;
            }
        }
        Ok(counts)
    }

    async fn status_counts(&self, discussion_id: &str) -> Result<HashMap<IdeaStatus, i64>> {
        let map = self.ideas.lock().unwrap();
        let mut counts = HashMap::new();
        for idea in map.values().filter(|i| i.discussion_id == discussion_id) {
            *counts.entry(idea.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[async_trait]
impl TopicStore for InMemoryBackend {
    async fn fetch_by_discussion(&self, discussion_id: &str) -> Result<Vec<Topic>> {
        Ok(self.topics_of(discussion_id))
    }

    async fn apply_batch(
        &self,
        discussion_id: &str,
        upserts: &[TopicUpsert],
        inserts: &[NewTopic],
        assignments: &[TopicAssignment],
    ) -> Result<()> {
        {
            let mut topics = self.topics.lock().unwrap();
            for upsert in upserts {
                let topic = topics
                    .get_mut(&upsert.id)
                    .ok_or_else(|| anyhow!("topic {} missing", upsert.id))?;
                topic.centroid = Some(upsert.centroid.clone());
                topic.count = upsert.count;
                topic.updated_at = Utc::now();
            }
            for insert in inserts {
                topics.insert(
                    insert.id.clone(),
                    Topic {
                        id: insert.id.clone(),
                        discussion_id: discussion_id.to_string(),
                        representative_text: insert.representative_text.clone(),
                        count: insert.count,
                        centroid: insert.centroid.clone(),
                        created_at: Utc::now(),
                        updated_at: Utc::now(),
                    },
                );
            }
        }
        let mut ideas = self.ideas.lock().unwrap();
        for assignment in assignments {
            if let Some(idea) = ideas.get_mut(&assignment.idea_id) {
                idea.topic_id = Some(assignment.topic_id.clone());
                idea.status = IdeaStatus::Completed;
            }
        }
        Ok(())
    }

    async fn replace_for_discussion(
        &self,
        discussion_id: &str,
        new_topics: &[NewTopic],
        assignments: &[TopicAssignment],
    ) -> Result<()> {
        {
            let mut topics = self.topics.lock().unwrap();
            topics.retain(|_, t| t.discussion_id != discussion_id);
            for topic in new_topics {
                topics.insert(
                    topic.id.clone(),
                    Topic {
                        id: topic.id.clone(),
                        discussion_id: discussion_id.to_string(),
                        representative_text: topic.representative_text.clone(),
                        count: topic.count,
                        centroid: topic.centroid.clone(),
                        created_at: Utc::now(),
                        updated_at: Utc::now(),
                    },
                );
            }
        }
        let mut ideas = self.ideas.lock().unwrap();
        for idea in ideas.values_mut() {
            if idea.discussion_id == discussion_id {
                idea.topic_id = None;
            }
        }
        for assignment in assignments {
            if let Some(idea) = ideas.get_mut(&assignment.idea_id) {
                idea.topic_id = Some(assignment.topic_id.clone());
                idea.status = IdeaStatus::Completed;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DiscussionStore for InMemoryBackend {
    async fn get(&self, id: &str) -> Result<Option<Discussion>> {
        Ok(self.discussions.lock().unwrap().get(id).cloned())
    }

    async fn refresh_counts(&self, id: &str) -> Result<()> {
        let idea_count = {
            let ideas = self.ideas.lock().unwrap();
            ideas.values().filter(|i| i.discussion_id == id).count() as i64
        };
        let topic_count = {
            let topics = self.topics.lock().unwrap();
            topics.values().filter(|t| t.discussion_id == id).count() as i64
        };
        if let Some(discussion) = self.discussions.lock().unwrap().get_mut(id) {
            discussion.idea_count = idea_count;
            discussion.topic_count = topic_count;
            discussion.last_activity = Some(Utc::now());
        }
        Ok(())
    }

    async fn touch_activity(&self, id: &str) -> Result<()> {
        if let Some(discussion) = self.discussions.lock().unwrap().get_mut(id) {
            discussion.last_activity = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait]
impl QueueService for InMemoryBackend {
    async fn enqueue(&self, idea_id: &str, discussion_id: &str) -> Result<()> {
        self.work_queue.lock().unwrap().push_back(WorkItem {
            idea_id: idea_id.to_string(),
            discussion_id: discussion_id.to_string(),
            enqueued_at: Utc::now(),
        });
        Ok(())
    }

    async fn dequeue_batch(&self, max: usize, _poll_timeout: Duration) -> Result<Vec<WorkItem>> {
        let mut queue = self.work_queue.lock().unwrap();
        let take = max.min(queue.len());
        Ok(queue.drain(..take).collect())
    }

    async fn acquire_lock(&self, discussion_id: &str, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks.lock().unwrap();
        let now = Instant::now();
        if locks.get(discussion_id).is_some_and(|expiry| *expiry > now) {
            return Ok(false);
        }
        locks.insert(discussion_id.to_string(), now + ttl);
        Ok(true)
    }

    async fn release_lock(&self, discussion_id: &str) -> Result<()> {
        self.locks.lock().unwrap().remove(discussion_id);
        Ok(())
    }

    async fn lock_held(&self, discussion_id: &str) -> Result<bool> {
        let mut locks = self.locks.lock().unwrap();
        let now = Instant::now();
        match locks.get(discussion_id) {
            Some(expiry) if *expiry > now => Ok(true),
            Some(_) => {
                locks.remove(discussion_id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn defer(&self, discussion_id: &str, idea: &Idea) -> Result<()> {
        self.deferred
            .lock()
            .unwrap()
            .entry(discussion_id.to_string())
            .or_default()
            .push(idea.clone());
        Ok(())
    }

    async fn drain_deferred(&self, discussion_id: &str) -> Result<Vec<Idea>> {
        Ok(self
            .deferred
            .lock()
            .unwrap()
            .remove(discussion_id)
            .unwrap_or_default())
    }

    async fn orphaned_deferred(&self) -> Result<Vec<String>> {
        let deferred = self.deferred.lock().unwrap();
        let locks = self.locks.lock().unwrap();
        let now = Instant::now();
        Ok(deferred
            .iter()
            .filter(|(d, ideas)| {
                !ideas.is_empty() && !locks.get(*d).is_some_and(|expiry| *expiry > now)
            })
            .map(|(d, _)| d.clone())
            .collect())
    }

    async fn repair_lock_ttls(&self, _ttl: Duration) -> Result<usize> {
        Ok(0)
    }
}

/// Embedder mapping idea text -> vector; unknown texts fail permanently.
#[derive(Default)]
pub struct StaticEmbedder {
    pub vectors: HashMap<String, Vec<f32>>,
}

impl StaticEmbedder {
    pub fn with(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }
}

#[async_trait]
impl EmbeddingClient for StaticEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.vectors
            .get(text)
            .cloned()
            .ok_or_else(|| EmbedError::Failed(format!("no canned vector for {text:?}")))
    }
}

pub struct NoopFormatter;

#[async_trait]
impl FormattingClient for NoopFormatter {
    async fn format(&self, _text: &str, _discussion_context: &str) -> Result<Enrichment> {
        Ok(Enrichment::default())
    }
}

pub struct CannedSummarizer;

#[async_trait]
impl Summarizer for CannedSummarizer {
    async fn summarize(&self, member_texts: &[String]) -> Result<String> {
        Ok(format!("summary of {} ideas", member_texts.len()))
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub events: Mutex<Vec<(String, Event)>>,
}

impl RecordingPublisher {
    pub fn event_names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, e)| match e {
                Event::NewIdea(_) => "new_idea",
                Event::BatchProcessed { .. } => "batch_processed",
                Event::UnprocessedCountUpdated { .. } => "unprocessed_count_updated",
            })
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, discussion_id: &str, event: Event) {
        self.events
            .lock()
            .unwrap()
            .push((discussion_id.to_string(), event));
    }
}

pub fn test_clustering_config() -> idearoom_core::config::ClusteringConfig {
    idearoom_core::config::ClusteringConfig {
        maturity_threshold: 5,
        adaptive_threshold_high: 0.70,
        adaptive_threshold_low: 0.60,
        recluster_similarity: 0.70,
        min_group_size: 2,
        chunk_size_small: 2000,
        chunk_size_large: 5000,
        outlier_eps: 0.25,
        outlier_min_samples: 2,
        lock_ttl: Duration::from_secs(300),
    }
}

/// A unit vector on `axis` of `dim` dimensions with a small nudge toward
/// the next axis, for building well-separated synthetic clusters.
pub fn axis_vector(dim: usize, axis: usize, nudge: f32) -> Vec<f32> {
    let mut v = vec![0.0f32; dim];
    v[axis] = 1.0;
    v[(axis + 1) % dim] = nudge;
    v
}

/// A pending idea as the submission handler would create it.
pub fn pending_idea(id: &str, discussion_id: &str, text: &str) -> Idea {
    Idea {
        id: id.to_string(),
        discussion_id: discussion_id.to_string(),
        text: text.to_string(),
        submitter_id: "u-1".to_string(),
        submitted_at: Utc::now(),
        verified: false,
        status: IdeaStatus::Pending,
        embedding: None,
        topic_id: None,
        intent: None,
        keywords: vec![],
        sentiment: None,
        specificity: None,
        related_topics: vec![],
        on_topic: None,
        last_attempt: None,
    }
}

/// An idea that already went through the embedding stage.
pub fn embedded_idea(id: &str, discussion_id: &str, text: &str, embedding: Vec<f32>) -> Idea {
    let mut idea = pending_idea(id, discussion_id, text);
    idea.status = IdeaStatus::Embedded;
    idea.embedding = Some(embedding);
    idea
}
