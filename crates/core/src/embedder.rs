//! Rate-limited, retrying client for the external text -> vector service.
//!
//! The client enforces a global call rate across all concurrent callers and
//! retries rate-limited responses with bounded exponential backoff. Every
//! other failure is surfaced immediately; the processor decides what to do
//! with the idea.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;

#[derive(Debug, Error)]
pub enum EmbedError {
    /// The service shed load (429/503). Retryable with backoff.
    #[error("embedding service rate limited: {0}")]
    RateLimited(String),
    /// Anything else: bad input, malformed response, transport failure.
    #[error("embedding request failed: {0}")]
    Failed(String),
}

impl EmbedError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmbedError::RateLimited(_))
    }
}

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed a single non-empty text into a fixed-dimension vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

/// Backoff before retry `attempt` (1-indexed): 1s, 2s, 4s... with jitter.
fn backoff_delay(attempt: u32, jitter_factor: f64) -> Duration {
    let base_ms = 1000u64 << (attempt.saturating_sub(1)).min(4);
    let jitter = if jitter_factor > 0.0 {
        let range = base_ms as f64 * jitter_factor;
        (rand::random::<f64>() - 0.5) * 2.0 * range
    } else {
        0.0
    };
    Duration::from_millis((base_ms as f64 + jitter).max(0.0) as u64)
}

pub struct HttpEmbeddingClient {
    http: reqwest::Client,
    config: EmbeddingConfig,
    /// Earliest instant the next call may be issued. Serializes call starts
    /// so the global rate holds across concurrent callers.
    next_slot: Mutex<Instant>,
    min_interval: Duration,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl HttpEmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        let min_interval = Duration::from_secs_f64(1.0 / config.rate_per_sec.max(1) as f64);
        Self {
            http,
            config,
            next_slot: Mutex::new(Instant::now()),
            min_interval,
        }
    }

    /// Claim the next call slot and wait until it arrives.
    async fn pace(&self) {
        let wake = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let at = (*next).max(now);
            *next = at + self.min_interval;
            at
        };
        tokio::time::sleep_until(wake).await;
    }

    async fn request(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let url = format!(
            "{}/api/embed/batch",
            self.config.url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "texts": [text],
            "model": self.config.model,
        });

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbedError::Failed(format!("request to {url} failed: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::SERVICE_UNAVAILABLE
        {
            let text = resp.text().await.unwrap_or_default();
            return Err(EmbedError::RateLimited(format!("{status}: {text}")));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(EmbedError::Failed(format!("{status}: {text}")));
        }

        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| EmbedError::Failed(format!("malformed embedding response: {e}")))?;

        parsed
            .embeddings
            .into_iter()
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| EmbedError::Failed("empty embedding in response".to_string()))
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        if text.trim().is_empty() {
            return Err(EmbedError::Failed("input text is empty".to_string()));
        }

        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = backoff_delay(attempt, 0.1);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying embedding request after rate limit"
                );
                tokio::time::sleep(delay).await;
            }

            self.pace().await;

            match self.request(text).await {
                Ok(vector) => {
                    debug!(dimensions = vector.len(), "Embedding generated");
                    return Ok(vector);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| EmbedError::Failed("embedding retries exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(1, 0.0), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, 0.0), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, 0.0), Duration::from_secs(4));
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_delay(20, 0.0), Duration::from_secs(16));
    }

    #[test]
    fn rate_limit_errors_are_retryable() {
        assert!(EmbedError::RateLimited("429".into()).is_retryable());
        assert!(!EmbedError::Failed("bad input".into()).is_retryable());
    }
}
