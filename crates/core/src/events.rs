//! Room-scoped event fan-out over NATS.
//!
//! Events are best-effort pushes to currently connected subscribers; the
//! store remains the source of truth. Publish failures are logged and
//! swallowed so they never fail a batch commit.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::models::{IdeaView, UnprocessedCounts};

/// Room subject for a discussion's event stream.
pub fn room_subject(discussion_id: &str) -> String {
    format!("discussions.{discussion_id}.events")
}

/// Events delivered to a discussion room.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    NewIdea(IdeaView),
    BatchProcessed {
        discussion_id: String,
        ideas: Vec<IdeaView>,
        count: usize,
        unclustered_count: i64,
        incremental_update: bool,
    },
    UnprocessedCountUpdated {
        discussion_id: String,
        total_unprocessed: i64,
        needs_embedding: i64,
        needs_clustering: i64,
    },
}

impl Event {
    pub fn unprocessed_count_updated(discussion_id: &str, counts: UnprocessedCounts) -> Self {
        Event::UnprocessedCountUpdated {
            discussion_id: discussion_id.to_string(),
            total_unprocessed: counts.total(),
            needs_embedding: counts.needs_embedding,
            needs_clustering: counts.needs_clustering,
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Emit an event to the discussion's room. Best effort.
    async fn publish(&self, discussion_id: &str, event: Event);
}

pub struct NatsEventPublisher {
    client: async_nats::Client,
}

impl NatsEventPublisher {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventPublisher for NatsEventPublisher {
    async fn publish(&self, discussion_id: &str, event: Event) {
        let subject = room_subject(discussion_id);
        let payload = match serde_json::to_vec(&event) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, subject, "Failed to serialize event");
                return;
            }
        };

        if let Err(e) = self.client.publish(subject.clone(), payload.into()).await {
            warn!(error = %e, subject, "Failed to publish event");
        } else {
            debug!(subject, "Event published");
        }
    }
}

/// Connect to NATS with bounded retries, backing off between attempts.
pub async fn connect_with_retry(url: &str) -> Result<async_nats::Client> {
    const MAX_ATTEMPTS: u32 = 10;

    let mut last_error = None;
    for attempt in 1..=MAX_ATTEMPTS {
        match async_nats::connect(url).await {
            Ok(client) => {
                info!(url, "Connected to NATS");
                return Ok(client);
            }
            Err(e) => {
                let delay = Duration::from_secs(u64::from(attempt).min(5));
                warn!(
                    attempt,
                    max_attempts = MAX_ATTEMPTS,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "NATS connection failed, retrying"
                );
                last_error = Some(e);
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(anyhow::Error::from(last_error.expect("at least one attempt")))
        .with_context(|| format!("Failed to connect to NATS at {url}"))
}
