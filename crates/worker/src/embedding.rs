//! Bounded-concurrency stage that enriches and embeds a discussion's batch.
//!
//! Each idea is formatted (best effort) and embedded under a semaphore; a
//! success persists embedding + enrichment + status `embedded` in a single
//! update. Individual failures never fail the batch: the idea keeps its
//! current status and the stuck watchdog picks it up later.

use std::sync::Arc;

use futures::future::join_all;
use idearoom_core::embedder::EmbeddingClient;
use idearoom_core::formatter::FormattingClient;
use idearoom_core::models::{Enrichment, Idea, IdeaStatus};
use idearoom_core::stores::IdeaStore;
use tokio::sync::Semaphore;
use tracing::{debug, error, instrument, warn};

pub struct ParallelEmbeddingProcessor {
    ideas: Arc<dyn IdeaStore>,
    formatter: Arc<dyn FormattingClient>,
    embedder: Arc<dyn EmbeddingClient>,
    semaphore: Arc<Semaphore>,
}

impl ParallelEmbeddingProcessor {
    pub fn new(
        ideas: Arc<dyn IdeaStore>,
        formatter: Arc<dyn FormattingClient>,
        embedder: Arc<dyn EmbeddingClient>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            ideas,
            formatter,
            embedder,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Process one discussion's ideas concurrently. Returns the sublist
    /// that ended up with an embedding, in input order.
    #[instrument(skip(self, ideas, discussion_context), fields(count = ideas.len()))]
    pub async fn process(&self, ideas: Vec<Idea>, discussion_context: &str) -> Vec<Idea> {
        let tasks = ideas
            .into_iter()
            .map(|idea| self.process_one(idea, discussion_context));
        let results = join_all(tasks).await;

        let embedded: Vec<Idea> = results.into_iter().flatten().collect();
        debug!(embedded = embedded.len(), "Embedding stage complete");
        embedded
    }

    async fn process_one(&self, mut idea: Idea, discussion_context: &str) -> Option<Idea> {
        // Ideas replayed from the deferred queue already carry a vector.
        if idea.has_embedding() {
            return Some(idea);
        }

        let _permit = self.semaphore.acquire().await.ok()?;

        if let Err(e) = self.ideas.touch_last_attempt(&idea.id).await {
            warn!(idea_id = %idea.id, error = %e, "Failed to record embedding attempt");
        }

        let enrichment = match self.formatter.format(&idea.text, discussion_context).await {
            Ok(enrichment) => enrichment,
            Err(e) => {
                warn!(idea_id = %idea.id, error = %e, "Formatting failed, keeping idea bare");
                Enrichment::default()
            }
        };

        match self.embedder.embed(&idea.text).await {
            Ok(vector) => {
                if let Err(e) = self
                    .ideas
                    .save_embedding(&idea.id, &vector, &enrichment)
                    .await
                {
                    error!(idea_id = %idea.id, error = %e, "Failed to persist embedding");
                    return None;
                }
                idea.embedding = Some(vector);
                idea.status = IdeaStatus::Embedded;
                idea.intent = enrichment.intent;
                idea.keywords = enrichment.keywords;
                idea.sentiment = enrichment.sentiment;
                idea.specificity = enrichment.specificity;
                idea.related_topics = enrichment.related_topics;
                idea.on_topic = enrichment.on_topic;
                Some(idea)
            }
            Err(e) => {
                // Status stays as-is so the watchdog can reclassify it.
                error!(idea_id = %idea.id, error = %e, "Embedding failed");
                None
            }
        }
    }
}
