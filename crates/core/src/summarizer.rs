//! Topic naming via the LLM inference API, with a deterministic fallback.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;

use crate::config::EnrichmentConfig;

/// How many member texts are sampled into the naming prompt.
const PROMPT_SAMPLE_SIZE: usize = 10;
/// Long member texts are truncated to this many characters in the prompt.
const PROMPT_TEXT_LIMIT: usize = 200;
/// Fallback labels truncate the first member's text to this many characters.
const FALLBACK_LABEL_LIMIT: usize = 50;

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Produce a short representative phrase for a group of member texts.
    async fn summarize(&self, member_texts: &[String]) -> Result<String>;
}

/// Best-effort label when summarization fails or a topic has one member:
/// the text truncated to ~50 characters.
pub fn fallback_label(text: &str) -> String {
    let truncated: String = text.chars().take(FALLBACK_LABEL_LIMIT).collect();
    if truncated.chars().count() < text.chars().count() {
        format!("{truncated}...")
    } else {
        truncated
    }
}

pub struct LlmSummarizer {
    http: reqwest::Client,
    config: EnrichmentConfig,
}

#[derive(Deserialize)]
struct GenerateResponse {
    text: String,
}

impl LlmSummarizer {
    pub fn new(config: EnrichmentConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { http, config }
    }

    fn create_prompt(member_texts: &[String]) -> String {
        let samples = member_texts
            .iter()
            .take(PROMPT_SAMPLE_SIZE)
            .map(|text| {
                let sample: String = text.chars().take(PROMPT_TEXT_LIMIT).collect();
                format!("- {sample}")
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "You are an expert idea generalization engine. What is the general \
             main idea for this group of ideas?\n{samples}\n\nRespond with one \
             simple concise sentence, nothing else."
        )
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, member_texts: &[String]) -> Result<String> {
        if member_texts.is_empty() {
            return Err(anyhow!("cannot summarize an empty group"));
        }

        let url = format!("{}/api/generate", self.config.url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "prompt": Self::create_prompt(member_texts),
            "temperature": 0.3,
            "max_tokens": 40,
        });

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("summarization request to {url} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("summarization API error {status}: {text}"));
        }

        let generated: GenerateResponse = resp
            .json()
            .await
            .context("malformed summarization response")?;

        let phrase = generated.text.trim().to_string();
        if phrase.is_empty() {
            return Err(anyhow!("summarizer returned an empty phrase"));
        }
        Ok(phrase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_kept_as_is() {
        assert_eq!(fallback_label("Fix the slow elevator"), "Fix the slow elevator");
    }

    #[test]
    fn long_text_is_truncated_with_ellipsis() {
        let text = "a".repeat(80);
        let label = fallback_label(&text);
        assert_eq!(label, format!("{}...", "a".repeat(50)));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(60);
        let label = fallback_label(&text);
        assert!(label.ends_with("..."));
        assert_eq!(label.chars().count(), 53);
    }

    #[test]
    fn prompt_samples_at_most_ten_texts() {
        let texts: Vec<String> = (0..25).map(|i| format!("idea number {i}")).collect();
        let prompt = LlmSummarizer::create_prompt(&texts);
        assert!(prompt.contains("idea number 9"));
        assert!(!prompt.contains("idea number 10"));
    }
}
