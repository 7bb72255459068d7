//! Value types shared across the pipeline: ideas, topics, discussions,
//! work items and the client-facing event payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Processing status of an idea.
///
/// Advances pending -> processing -> embedded -> completed; `failed` and
/// `stuck` are terminal until an operator resets them to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "idea_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum IdeaStatus {
    Pending,
    Processing,
    Embedded,
    Completed,
    Failed,
    Stuck,
}

impl IdeaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdeaStatus::Pending => "pending",
            IdeaStatus::Processing => "processing",
            IdeaStatus::Embedded => "embedded",
            IdeaStatus::Completed => "completed",
            IdeaStatus::Failed => "failed",
            IdeaStatus::Stuck => "stuck",
        }
    }
}

/// AI-derived enrichment for a single idea.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Enrichment {
    pub intent: Option<String>,
    pub keywords: Vec<String>,
    pub sentiment: Option<String>,
    pub specificity: Option<String>,
    pub related_topics: Vec<String>,
    pub on_topic: Option<f32>,
}

/// A short user-submitted text to be assigned to one topic.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Idea {
    pub id: String,
    pub discussion_id: String,
    pub text: String,
    pub submitter_id: String,
    pub submitted_at: DateTime<Utc>,
    pub verified: bool,
    pub status: IdeaStatus,
    pub embedding: Option<Vec<f32>>,
    pub topic_id: Option<String>,
    pub intent: Option<String>,
    pub keywords: Vec<String>,
    pub sentiment: Option<String>,
    pub specificity: Option<String>,
    pub related_topics: Vec<String>,
    pub on_topic: Option<f32>,
    pub last_attempt: Option<DateTime<Utc>>,
}

impl Idea {
    /// An embedding is usable for clustering only if present and non-empty.
    pub fn has_embedding(&self) -> bool {
        self.embedding.as_ref().is_some_and(|e| !e.is_empty())
    }
}

/// A cluster of ideas with a representative text and centroid.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Topic {
    pub id: String,
    pub discussion_id: String,
    pub representative_text: String,
    pub count: i64,
    /// Mean of the member embeddings; absent when no member has one.
    pub centroid: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A named container of ideas and topics. Created externally; the core
/// reads it for context and refreshes its aggregate counts.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Discussion {
    pub id: String,
    pub title: String,
    pub prompt: String,
    pub idea_count: i64,
    pub topic_count: i64,
    pub last_activity: Option<DateTime<Utc>>,
    pub require_verification: bool,
}

impl Discussion {
    /// Context string handed to the formatting collaborator.
    pub fn context(&self) -> String {
        format!("Title:{} - Description: {}", self.title, self.prompt)
    }
}

/// One entry in the persistent work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub idea_id: String,
    pub discussion_id: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Assignment of an idea to a topic, committed in bulk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicAssignment {
    pub idea_id: String,
    pub topic_id: String,
}

/// A freshly created topic, not yet persisted.
#[derive(Debug, Clone)]
pub struct NewTopic {
    pub id: String,
    pub discussion_id: String,
    pub representative_text: String,
    pub count: i64,
    pub centroid: Option<Vec<f32>>,
}

/// Centroid/count update for an existing topic after online assignments.
#[derive(Debug, Clone)]
pub struct TopicUpsert {
    pub id: String,
    pub centroid: Vec<f32>,
    pub count: i64,
}

/// Client-safe projection of an idea. Never carries the embedding vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdeaView {
    pub id: String,
    pub text: String,
    pub submitter_id: String,
    pub verified: bool,
    pub timestamp: DateTime<Utc>,
    pub status: IdeaStatus,
    pub topic_id: Option<String>,
    pub intent: Option<String>,
    pub keywords: Vec<String>,
    pub sentiment: Option<String>,
    pub specificity: Option<String>,
    pub related_topics: Vec<String>,
    pub on_topic: Option<f32>,
}

impl From<&Idea> for IdeaView {
    fn from(idea: &Idea) -> Self {
        Self {
            id: idea.id.clone(),
            text: idea.text.clone(),
            submitter_id: idea.submitter_id.clone(),
            verified: idea.verified,
            timestamp: idea.submitted_at,
            status: idea.status,
            topic_id: idea.topic_id.clone(),
            intent: idea.intent.clone(),
            keywords: idea.keywords.clone(),
            sentiment: idea.sentiment.clone(),
            specificity: idea.specificity.clone(),
            related_topics: idea.related_topics.clone(),
            on_topic: idea.on_topic,
        }
    }
}

/// Split of not-yet-completed ideas, for operator dashboards and fan-out.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UnprocessedCounts {
    pub needs_embedding: i64,
    pub needs_clustering: i64,
}

impl UnprocessedCounts {
    pub fn total(&self) -> i64 {
        self.needs_embedding + self.needs_clustering
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idea(embedding: Option<Vec<f32>>) -> Idea {
        Idea {
            id: "i-1".into(),
            discussion_id: "d-1".into(),
            text: "add decaf options".into(),
            submitter_id: "u-1".into(),
            submitted_at: Utc::now(),
            verified: false,
            status: IdeaStatus::Pending,
            embedding,
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

    #[test]
    fn empty_embedding_is_not_usable() {
        assert!(!idea(None).has_embedding());
        assert!(!idea(Some(vec![])).has_embedding());
        assert!(idea(Some(vec![0.1, 0.2])).has_embedding());
    }

    #[test]
    fn view_never_carries_the_embedding() {
        let view = IdeaView::from(&idea(Some(vec![0.5; 512])));
        let json = serde_json::to_value(&view).unwrap();
        assert!(json.get("embedding").is_none());
        assert_eq!(json["id"], "i-1");
    }
}
