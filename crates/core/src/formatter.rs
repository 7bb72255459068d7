//! Enrichment wrapper around the LLM inference API.
//!
//! Produces intent/keywords/sentiment/specificity/related-topics/on-topic
//! for a submitted idea. Failures here are non-fatal; callers keep the idea
//! with empty enrichment.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::config::EnrichmentConfig;
use crate::models::Enrichment;

#[async_trait]
pub trait FormattingClient: Send + Sync {
    async fn format(&self, text: &str, discussion_context: &str) -> Result<Enrichment>;
}

pub struct HttpFormattingClient {
    http: reqwest::Client,
    config: EnrichmentConfig,
}

#[derive(Deserialize)]
struct GenerateResponse {
    text: String,
}

/// Wire shape of the model's structured output.
#[derive(Deserialize)]
struct FormattedIdea {
    intent: Option<String>,
    #[serde(default)]
    keywords: Vec<String>,
    sentiment: Option<String>,
    specificity: Option<String>,
    #[serde(default)]
    related_topics: Vec<String>,
    on_topic: Option<f32>,
}

impl HttpFormattingClient {
    pub fn new(config: EnrichmentConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { http, config }
    }

    fn create_prompt(text: &str, discussion_context: &str) -> String {
        format!(
            "Analyze the following idea submitted to a discussion.\n\
             Discussion: {discussion_context}\n\
             Idea: {text}\n\n\
             Respond with a JSON object with keys: intent (string), keywords \
             (array of strings), sentiment (string), specificity (string), \
             related_topics (array of strings), on_topic (number between 0 and \
             1 for how relevant the idea is to the discussion). Respond with \
             ONLY the JSON object."
        )
    }
}

#[async_trait]
impl FormattingClient for HttpFormattingClient {
    async fn format(&self, text: &str, discussion_context: &str) -> Result<Enrichment> {
        let url = format!("{}/api/generate", self.config.url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "prompt": Self::create_prompt(text, discussion_context),
            "temperature": 0.4,
            "max_tokens": 256,
            "format": "json",
        });

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("formatting request to {url} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("formatting API error {status}: {text}"));
        }

        let generated: GenerateResponse = resp
            .json()
            .await
            .context("malformed formatting response")?;

        let formatted: FormattedIdea = serde_json::from_str(generated.text.trim())
            .context("formatting output was not valid JSON")?;

        debug!(keywords = formatted.keywords.len(), "Idea formatted");

        Ok(Enrichment {
            intent: formatted.intent,
            keywords: formatted.keywords,
            sentiment: formatted.sentiment,
            specificity: formatted.specificity,
            related_topics: formatted.related_topics,
            on_topic: formatted.on_topic.map(|v| v.clamp(0.0, 1.0)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_output_parses_into_enrichment_fields() {
        let raw = r#"{
            "intent": "suggestion",
            "keywords": ["coffee", "decaf"],
            "sentiment": "positive",
            "specificity": "specific",
            "related_topics": ["break room"],
            "on_topic": 1.4
        }"#;
        let formatted: FormattedIdea = serde_json::from_str(raw).unwrap();
        assert_eq!(formatted.keywords, vec!["coffee", "decaf"]);
        // Out-of-range scores are clamped by the client
        assert_eq!(formatted.on_topic.unwrap().clamp(0.0, 1.0), 1.0);
    }

    #[test]
    fn missing_arrays_default_to_empty() {
        let formatted: FormattedIdea =
            serde_json::from_str(r#"{"intent": null, "on_topic": 0.5}"#).unwrap();
        assert!(formatted.keywords.is_empty());
        assert!(formatted.related_topics.is_empty());
    }
}
