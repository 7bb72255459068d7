//! Online assignment of embedded ideas to topics.
//!
//! Classification runs against a per-batch cache of topic centroids: the
//! highest-similarity topic that meets its adaptive threshold wins, the
//! cache centroid is updated incrementally, and everything that matched
//! nothing goes through a density mini-pass to seed new topics.

use idearoom_core::config::ClusteringConfig;
use idearoom_core::models::{Idea, NewTopic, Topic, TopicAssignment, TopicUpsert};
use idearoom_core::similarity::{cosine_similarity, incremental_mean, mean};
use idearoom_core::summarizer::{Summarizer, fallback_label};
use tracing::{debug, warn};
use uuid::Uuid;

use super::dbscan::cosine_dbscan;

/// Below this many outliers the density pass is skipped and each outlier
/// seeds its own topic.
const MIN_OUTLIERS_FOR_DBSCAN: usize = 3;

/// One topic in the per-batch cache.
pub struct CachedTopic {
    pub id: String,
    pub centroid: Vec<f32>,
    pub count: i64,
    dirty: bool,
}

/// Private, per-invocation snapshot of a discussion's topics. Reconciled
/// implicitly at commit time; never shared across batches.
pub struct TopicCache {
    topics: Vec<CachedTopic>,
}

impl TopicCache {
    /// Topics without a centroid are ineligible for matching and are left
    /// out of the cache entirely; the next full recluster re-derives them.
    pub fn from_topics(topics: &[Topic]) -> Self {
        let cached = topics
            .iter()
            .filter_map(|t| {
                let centroid = t.centroid.clone().filter(|c| !c.is_empty())?;
                Some(CachedTopic {
                    id: t.id.clone(),
                    centroid,
                    count: t.count,
                    dirty: false,
                })
            })
            .collect();
        Self { topics: cached }
    }

    /// Centroid/count updates for topics that received assignments.
    pub fn upserts(&self) -> Vec<TopicUpsert> {
        self.topics
            .iter()
            .filter(|t| t.dirty)
            .map(|t| TopicUpsert {
                id: t.id.clone(),
                centroid: t.centroid.clone(),
                count: t.count,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }
}

/// Threshold for a candidate topic: mature topics accept with the lower
/// cutoff, young topics demand the higher one.
pub fn adaptive_threshold(topic_count: i64, cfg: &ClusteringConfig) -> f32 {
    if topic_count >= cfg.maturity_threshold {
        cfg.adaptive_threshold_low
    } else {
        cfg.adaptive_threshold_high
    }
}

pub struct Classified {
    pub assignments: Vec<TopicAssignment>,
    /// Indices (into the input batch) of ideas that matched no topic.
    pub outlier_indices: Vec<usize>,
}

/// Assign each idea to the best qualifying cached topic, updating the cache
/// as assignments land. Ideas are processed in load order; ties on
/// similarity keep the earlier topic.
///
/// Callers must pass only ideas with usable embeddings.
pub fn classify(ideas: &[Idea], cache: &mut TopicCache, cfg: &ClusteringConfig) -> Classified {
    let mut assignments = Vec::new();
    let mut outlier_indices = Vec::new();

    for (idx, idea) in ideas.iter().enumerate() {
        let embedding = match idea.embedding.as_deref() {
            Some(e) if !e.is_empty() => e,
            _ => {
                warn!(idea_id = %idea.id, "Idea without embedding reached classification");
                outlier_indices.push(idx);
                continue;
            }
        };

        let mut best: Option<(f32, usize)> = None;
        for (ti, topic) in cache.topics.iter().enumerate() {
            let similarity = cosine_similarity(embedding, &topic.centroid);
            if similarity > adaptive_threshold(topic.count, cfg)
                && best.is_none_or(|(bs, _)| similarity > bs)
            {
                best = Some((similarity, ti));
            }
        }

        match best {
            Some((similarity, ti)) => {
                let topic = &mut cache.topics[ti];
                topic.centroid = incremental_mean(&topic.centroid, topic.count, embedding);
                topic.count += 1;
                topic.dirty = true;
                debug!(
                    idea_id = %idea.id,
                    topic_id = %topic.id,
                    similarity,
                    "Idea assigned to existing topic"
                );
                assignments.push(TopicAssignment {
                    idea_id: idea.id.clone(),
                    topic_id: topic.id.clone(),
                });
            }
            None => outlier_indices.push(idx),
        }
    }

    Classified {
        assignments,
        outlier_indices,
    }
}

/// Outliers partitioned by the density mini-pass.
pub struct OutlierGroups {
    /// Dense groups; each becomes one new topic.
    pub groups: Vec<Vec<usize>>,
    /// Unclustered outliers; each becomes a single-member topic.
    pub singletons: Vec<usize>,
}

/// Run the density mini-pass over the batch's outliers. All indices are
/// into the original batch.
pub fn group_outliers(
    ideas: &[Idea],
    outlier_indices: &[usize],
    cfg: &ClusteringConfig,
) -> OutlierGroups {
    if outlier_indices.len() < MIN_OUTLIERS_FOR_DBSCAN {
        return OutlierGroups {
            groups: Vec::new(),
            singletons: outlier_indices.to_vec(),
        };
    }

    let embeddings: Vec<&[f32]> = outlier_indices
        .iter()
        .map(|&i| ideas[i].embedding.as_deref().unwrap_or(&[]))
        .collect();
    let labels = cosine_dbscan(&embeddings, cfg.outlier_eps, cfg.outlier_min_samples);

    let cluster_count = labels.iter().flatten().max().map_or(0, |&m| m + 1);
    let mut groups: Vec<Vec<usize>> = vec![Vec::new(); cluster_count];
    let mut singletons = Vec::new();
    for (pos, label) in labels.iter().enumerate() {
        match label {
            Some(cluster) => groups[*cluster].push(outlier_indices[pos]),
            None => singletons.push(outlier_indices[pos]),
        }
    }

    OutlierGroups { groups, singletons }
}

/// Name the outlier groups and build the topic inserts plus their idea
/// assignments. Summarization is best-effort; the fallback is the first
/// member's truncated text.
pub async fn build_new_topics(
    discussion_id: &str,
    ideas: &[Idea],
    outliers: &OutlierGroups,
    summarizer: &dyn Summarizer,
) -> (Vec<NewTopic>, Vec<TopicAssignment>) {
    let mut inserts = Vec::new();
    let mut assignments = Vec::new();

    for group in &outliers.groups {
        let members: Vec<&Idea> = group.iter().map(|&i| &ideas[i]).collect();
        let texts: Vec<String> = members.iter().map(|m| m.text.clone()).collect();

        let representative_text = match summarizer.summarize(&texts).await {
            Ok(phrase) => phrase,
            Err(e) => {
                warn!(error = %e, "Topic naming failed, falling back to member text");
                fallback_label(&members[0].text)
            }
        };

        let embeddings: Vec<&[f32]> = members
            .iter()
            .filter_map(|m| m.embedding.as_deref())
            .collect();
        let topic_id = Uuid::new_v4().to_string();
        inserts.push(NewTopic {
            id: topic_id.clone(),
            discussion_id: discussion_id.to_string(),
            representative_text,
            count: members.len() as i64,
            centroid: mean(&embeddings),
        });
        for member in &members {
            assignments.push(TopicAssignment {
                idea_id: member.id.clone(),
                topic_id: topic_id.clone(),
            });
        }
    }

    for &idx in &outliers.singletons {
        let idea = &ideas[idx];
        let topic_id = Uuid::new_v4().to_string();
        inserts.push(NewTopic {
            id: topic_id.clone(),
            discussion_id: discussion_id.to_string(),
            representative_text: fallback_label(&idea.text),
            count: 1,
            centroid: idea.embedding.clone(),
        });
        assignments.push(TopicAssignment {
            idea_id: idea.id.clone(),
            topic_id,
        });
    }

    (inserts, assignments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use idearoom_core::models::IdeaStatus;

    fn test_config() -> ClusteringConfig {
        ClusteringConfig {
            maturity_threshold: 5,
            adaptive_threshold_high: 0.70,
            adaptive_threshold_low: 0.60,
            recluster_similarity: 0.70,
            min_group_size: 2,
            chunk_size_small: 2000,
            chunk_size_large: 5000,
            outlier_eps: 0.25,
            outlier_min_samples: 2,
            lock_ttl: std::time::Duration::from_secs(300),
        }
    }

    fn idea(id: &str, embedding: Vec<f32>) -> Idea {
        Idea {
            id: id.to_string(),
            discussion_id: "d-1".to_string(),
            text: format!("idea {id}"),
            submitter_id: "u-1".to_string(),
            submitted_at: Utc::now(),
            verified: false,
            status: IdeaStatus::Embedded,
            embedding: Some(embedding),
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

    fn topic(id: &str, centroid: Option<Vec<f32>>, count: i64) -> Topic {
        Topic {
            id: id.to_string(),
            discussion_id: "d-1".to_string(),
            representative_text: format!("topic {id}"),
            count,
            centroid,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn mature_topics_use_the_lower_threshold() {
        let cfg = test_config();
        assert_eq!(adaptive_threshold(4, &cfg), 0.70);
        assert_eq!(adaptive_threshold(5, &cfg), 0.60);
        assert_eq!(adaptive_threshold(50, &cfg), 0.60);
    }

    #[test]
    fn topics_without_centroid_are_ineligible() {
        let topics = vec![
            topic("t-1", None, 3),
            topic("t-2", Some(vec![]), 3),
            topic("t-3", Some(vec![1.0, 0.0]), 3),
        ];
        let cache = TopicCache::from_topics(&topics);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn mature_topic_accepts_a_borderline_idea_and_updates_centroid() {
        let cfg = test_config();
        // Centroid [1, 0], count 8 (mature). Incoming idea at similarity 0.63.
        let topics = vec![topic("t-1", Some(vec![1.0, 0.0]), 8)];
        let mut cache = TopicCache::from_topics(&topics);
        let e = vec![0.63, 0.7766];
        let ideas = vec![idea("i-1", e.clone())];

        let classified = classify(&ideas, &mut cache, &cfg);

        assert_eq!(classified.assignments.len(), 1);
        assert_eq!(classified.assignments[0].topic_id, "t-1");
        assert!(classified.outlier_indices.is_empty());

        let upserts = cache.upserts();
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].count, 9);
        // C' = (C * 8 + e) / 9
        assert!((upserts[0].centroid[0] - (8.0 + 0.63) / 9.0).abs() < 1e-6);
        assert!((upserts[0].centroid[1] - 0.7766 / 9.0).abs() < 1e-6);
    }

    #[test]
    fn young_topic_rejects_below_the_high_threshold() {
        let cfg = test_config();
        // Same similarity 0.63, but the topic is young (count 2): rejected.
        let topics = vec![topic("t-1", Some(vec![1.0, 0.0]), 2)];
        let mut cache = TopicCache::from_topics(&topics);
        let ideas = vec![idea("i-1", vec![0.63, 0.7766])];

        let classified = classify(&ideas, &mut cache, &cfg);

        assert!(classified.assignments.is_empty());
        assert_eq!(classified.outlier_indices, vec![0]);
        assert!(cache.upserts().is_empty());
    }

    #[test]
    fn highest_similarity_wins_among_qualifying_topics() {
        let cfg = test_config();
        // Mature topic at similarity 0.65 (passes 0.60); young topic at
        // similarity ~0.72 (passes 0.70). The young topic wins on similarity.
        let sim_a = 0.65f32;
        let sim_b = 0.72f32;
        let topics = vec![
            topic(
                "t-mature",
                Some(vec![sim_a, (1.0 - sim_a * sim_a).sqrt()]),
                8,
            ),
            topic("t-young", Some(vec![sim_b, (1.0 - sim_b * sim_b).sqrt()]), 2),
        ];
        let mut cache = TopicCache::from_topics(&topics);
        let ideas = vec![idea("i-1", vec![1.0, 0.0])];

        let classified = classify(&ideas, &mut cache, &cfg);

        assert_eq!(classified.assignments.len(), 1);
        assert_eq!(classified.assignments[0].topic_id, "t-young");
    }

    #[test]
    fn zero_norm_embedding_matches_nothing() {
        let cfg = test_config();
        let topics = vec![topic("t-1", Some(vec![1.0, 0.0]), 10)];
        let mut cache = TopicCache::from_topics(&topics);
        let ideas = vec![idea("i-1", vec![0.0, 0.0])];

        let classified = classify(&ideas, &mut cache, &cfg);
        assert_eq!(classified.outlier_indices, vec![0]);
    }

    #[test]
    fn few_outliers_become_singletons_without_dbscan() {
        let cfg = test_config();
        let ideas = vec![
            idea("i-1", vec![1.0, 0.0]),
            idea("i-2", vec![0.99, 0.1]),
        ];
        let groups = group_outliers(&ideas, &[0, 1], &cfg);
        assert!(groups.groups.is_empty());
        assert_eq!(groups.singletons, vec![0, 1]);
    }

    #[test]
    fn dense_outliers_group_and_loners_stay_single() {
        let cfg = test_config();
        let ideas = vec![
            idea("i-1", vec![1.0, 0.0, 0.0]),
            idea("i-2", vec![0.99, 0.05, 0.0]),
            idea("i-3", vec![0.0, 0.0, 1.0]),
        ];
        let groups = group_outliers(&ideas, &[0, 1, 2], &cfg);
        assert_eq!(groups.groups.len(), 1);
        assert_eq!(groups.groups[0], vec![0, 1]);
        assert_eq!(groups.singletons, vec![2]);
    }
}
