//! Offline rebuild of a discussion's whole topic set.
//!
//! Two-stage "agglomerative with outliers": a threshold pass finds the
//! natural groups, then leftovers either become individual topics or go
//! through a secondary fixed-count pass when the projected topic count
//! balloons. Large discussions are chunked deterministically and the chunk
//! groups merged by clustering their centroids, so a rerun on unchanged
//! input rebuilds the same partition.

use std::sync::Arc;

use idearoom_core::config::ClusteringConfig;
use idearoom_core::models::{Idea, NewTopic, TopicAssignment};
use idearoom_core::similarity::mean;
use idearoom_core::summarizer::{Summarizer, fallback_label};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::agglomerative::{cluster_by_threshold, cluster_fixed};

/// A threshold pass must yield at least this many groups before it is
/// preferred over the fixed-count fallback.
const MIN_NATURAL_GROUPS: usize = 5;

/// The rebuilt topic set and every idea's new assignment.
pub struct ReclusterPlan {
    pub topics: Vec<NewTopic>,
    pub assignments: Vec<TopicAssignment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Group,
    Individual,
}

/// A planned topic as member indices into the input batch.
struct PlannedGroup {
    member_indices: Vec<usize>,
    stage: Stage,
}

pub struct ReclusterEngine {
    cfg: ClusteringConfig,
    summarizer: Arc<dyn Summarizer>,
}

impl ReclusterEngine {
    pub fn new(cfg: ClusteringConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        Self { cfg, summarizer }
    }

    /// Target topic count for a discussion of `n` embedded ideas.
    pub fn target_topics(n: usize) -> usize {
        (n / 10).clamp(10, 50)
    }

    /// Rebuild the topic set for `ideas`, all of which must carry usable
    /// embeddings.
    pub async fn rebuild(&self, discussion_id: &str, ideas: &[Idea]) -> ReclusterPlan {
        if ideas.is_empty() {
            return ReclusterPlan {
                topics: Vec::new(),
                assignments: Vec::new(),
            };
        }

        let groups = if ideas.len() < self.cfg.chunk_size_small {
            self.plan_groups(ideas)
        } else {
            self.plan_groups_chunked(ideas)
        };

        info!(
            discussion_id,
            ideas = ideas.len(),
            topics = groups.len(),
            "Full recluster planned"
        );

        self.finalize(discussion_id, ideas, groups).await
    }

    /// Threshold pass -> leftovers policy -> fixed-count fallback, for a
    /// dataset that fits in one pass.
    fn plan_groups(&self, ideas: &[Idea]) -> Vec<PlannedGroup> {
        let embeddings: Vec<&[f32]> = ideas
            .iter()
            .map(|i| i.embedding.as_deref().unwrap_or(&[]))
            .collect();
        let n = embeddings.len();

        if n == 1 {
            return vec![PlannedGroup {
                member_indices: vec![0],
                stage: Stage::Individual,
            }];
        }

        let target = Self::target_topics(n);
        let distance_threshold = 1.0 - self.cfg.recluster_similarity;
        let labels = cluster_by_threshold(&embeddings, distance_threshold);
        let clusters = collect_clusters(&labels);

        let (mut groups, leftovers): (Vec<Vec<usize>>, Vec<Vec<usize>>) = clusters
            .into_iter()
            .partition(|c| c.len() >= self.cfg.min_group_size);

        if groups.len() < MIN_NATURAL_GROUPS {
            // Too few natural groups; re-run with a fixed cluster count.
            debug!(
                groups = groups.len(),
                "Threshold pass too coarse, using fixed-count clustering"
            );
            let k = target.min(n);
            let labels = cluster_fixed(&embeddings, k);
            return collect_clusters(&labels)
                .into_iter()
                .map(|members| PlannedGroup {
                    stage: stage_for(&members),
                    member_indices: members,
                })
                .collect();
        }

        let leftover_indices: Vec<usize> = leftovers.into_iter().flatten().collect();
        let mut planned: Vec<PlannedGroup> = groups
            .drain(..)
            .map(|members| PlannedGroup {
                member_indices: members,
                stage: Stage::Group,
            })
            .collect();

        let projected = planned.len() + leftover_indices.len();
        if projected > 2 * target && !leftover_indices.is_empty() {
            // Promoting every leftover would balloon the topic count;
            // cluster them down to roughly a third.
            debug!(
                projected,
                leftovers = leftover_indices.len(),
                "Secondary clustering pass over leftovers"
            );
            let k = (leftover_indices.len() / 3).max(1);
            let leftover_embeddings: Vec<&[f32]> =
                leftover_indices.iter().map(|&i| embeddings[i]).collect();
            let labels = cluster_fixed(&leftover_embeddings, k);
            for members in collect_clusters(&labels) {
                let member_indices: Vec<usize> =
                    members.into_iter().map(|m| leftover_indices[m]).collect();
                planned.push(PlannedGroup {
                    stage: stage_for(&member_indices),
                    member_indices,
                });
            }
        } else {
            for idx in leftover_indices {
                planned.push(PlannedGroup {
                    member_indices: vec![idx],
                    stage: Stage::Individual,
                });
            }
        }

        planned
    }

    /// Chunk-then-merge for large discussions: fixed chunks in load order,
    /// a threshold pass per chunk, then the chunk groups merged by
    /// clustering their centroids with the same threshold.
    fn plan_groups_chunked(&self, ideas: &[Idea]) -> Vec<PlannedGroup> {
        let chunk_len = if ideas.len() >= self.cfg.chunk_size_large {
            self.cfg.chunk_size_large
        } else {
            self.cfg.chunk_size_small
        };
        let distance_threshold = 1.0 - self.cfg.recluster_similarity;

        // Per-chunk threshold pass; indices rebased into the full batch.
        let mut chunk_groups: Vec<Vec<usize>> = Vec::new();
        for (chunk_no, chunk) in ideas.chunks(chunk_len).enumerate() {
            let base = chunk_no * chunk_len;
            let embeddings: Vec<&[f32]> = chunk
                .iter()
                .map(|i| i.embedding.as_deref().unwrap_or(&[]))
                .collect();
            let labels = cluster_by_threshold(&embeddings, distance_threshold);
            for members in collect_clusters(&labels) {
                chunk_groups.push(members.into_iter().map(|m| base + m).collect());
            }
        }

        // Merge pass over the chunk-group centroids.
        let centroids: Vec<Vec<f32>> = chunk_groups
            .iter()
            .map(|members| {
                let vectors: Vec<&[f32]> = members
                    .iter()
                    .filter_map(|&i| ideas[i].embedding.as_deref())
                    .collect();
                mean(&vectors).unwrap_or_default()
            })
            .collect();
        let centroid_refs: Vec<&[f32]> = centroids.iter().map(|c| c.as_slice()).collect();
        let merge_labels = cluster_by_threshold(&centroid_refs, distance_threshold);

        let mut merged: Vec<Vec<usize>> = Vec::new();
        for members in collect_clusters(&merge_labels) {
            let mut union: Vec<usize> = members
                .into_iter()
                .flat_map(|g| chunk_groups[g].iter().copied())
                .collect();
            union.sort_unstable();
            merged.push(union);
        }

        merged
            .into_iter()
            .map(|member_indices| PlannedGroup {
                stage: stage_for(&member_indices),
                member_indices,
            })
            .collect()
    }

    /// Compute centroids, name each topic and build the assignment list.
    async fn finalize(
        &self,
        discussion_id: &str,
        ideas: &[Idea],
        groups: Vec<PlannedGroup>,
    ) -> ReclusterPlan {
        let mut topics = Vec::with_capacity(groups.len());
        let mut assignments = Vec::new();

        for group in &groups {
            let members: Vec<&Idea> = group.member_indices.iter().map(|&i| &ideas[i]).collect();

            let representative_text = if group.stage == Stage::Group && members.len() > 1 {
                let texts: Vec<String> = members.iter().map(|m| m.text.clone()).collect();
                match self.summarizer.summarize(&texts).await {
                    Ok(phrase) => phrase,
                    Err(e) => {
                        warn!(error = %e, "Topic naming failed, falling back to member text");
                        fallback_label(&members[0].text)
                    }
                }
            } else {
                fallback_label(&members[0].text)
            };

            let embeddings: Vec<&[f32]> = members
                .iter()
                .filter_map(|m| m.embedding.as_deref())
                .collect();
            let topic_id = Uuid::new_v4().to_string();
            topics.push(NewTopic {
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

        ReclusterPlan {
            topics,
            assignments,
        }
    }
}

fn stage_for(members: &[usize]) -> Stage {
    if members.len() > 1 {
        Stage::Group
    } else {
        Stage::Individual
    }
}

/// Group item indices by label, ordered by each cluster's first member.
fn collect_clusters(labels: &[usize]) -> Vec<Vec<usize>> {
    let cluster_count = labels.iter().max().map_or(0, |&m| m + 1);
    let mut clusters: Vec<Vec<usize>> = vec![Vec::new(); cluster_count];
    for (idx, &label) in labels.iter().enumerate() {
        clusters[label].push(idx);
    }
    clusters.retain(|c| !c.is_empty());
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;
    use idearoom_core::models::IdeaStatus;
    use std::collections::{HashMap, HashSet};

    struct CannedSummarizer;

    #[async_trait]
    impl Summarizer for CannedSummarizer {
        async fn summarize(&self, member_texts: &[String]) -> Result<String> {
            Ok(format!("summary of {} ideas", member_texts.len()))
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _member_texts: &[String]) -> Result<String> {
            anyhow::bail!("summarizer down")
        }
    }

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

    fn idea(id: usize, embedding: Vec<f32>) -> Idea {
        Idea {
            id: format!("i-{id}"),
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

    /// A unit vector on axis `axis` of `dim` dimensions, nudged slightly
    /// toward the next axis so cluster members are close but not identical.
    fn axis_vector(dim: usize, axis: usize, nudge: f32) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[axis] = 1.0;
        v[(axis + 1) % dim] = nudge;
        v
    }

    fn partition_of(plan: &ReclusterPlan) -> HashSet<Vec<String>> {
        let mut by_topic: HashMap<&str, Vec<String>> = HashMap::new();
        for a in &plan.assignments {
            by_topic
                .entry(a.topic_id.as_str())
                .or_default()
                .push(a.idea_id.clone());
        }
        by_topic
            .into_values()
            .map(|mut members| {
                members.sort();
                members
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_discussion_plans_nothing() {
        let engine = ReclusterEngine::new(test_config(), Arc::new(CannedSummarizer));
        let plan = engine.rebuild("d-1", &[]).await;
        assert!(plan.topics.is_empty());
        assert!(plan.assignments.is_empty());
    }

    #[tokio::test]
    async fn single_idea_becomes_one_topic_with_its_own_centroid() {
        let engine = ReclusterEngine::new(test_config(), Arc::new(CannedSummarizer));
        let ideas = vec![idea(0, vec![0.6, 0.8])];
        let plan = engine.rebuild("d-1", &ideas).await;

        assert_eq!(plan.topics.len(), 1);
        assert_eq!(plan.topics[0].count, 1);
        assert_eq!(plan.topics[0].centroid, Some(vec![0.6, 0.8]));
        assert_eq!(plan.assignments.len(), 1);
        assert_eq!(plan.assignments[0].idea_id, "i-0");
    }

    #[tokio::test]
    async fn natural_groups_survive_with_mean_centroids() {
        // Six tight clusters of three ideas each: the threshold pass finds
        // all of them, no fallback, no secondary pass.
        let engine = ReclusterEngine::new(test_config(), Arc::new(CannedSummarizer));
        let dim = 12;
        let mut ideas = Vec::new();
        for cluster in 0..6 {
            for member in 0..3 {
                let nudge = 0.02 * (member as f32);
                ideas.push(idea(cluster * 3 + member, axis_vector(dim, cluster, nudge)));
            }
        }

        let plan = engine.rebuild("d-1", &ideas).await;

        assert_eq!(plan.topics.len(), 6);
        assert_eq!(plan.assignments.len(), 18);
        for topic in &plan.topics {
            assert_eq!(topic.count, 3);
            assert_eq!(topic.representative_text, "summary of 3 ideas");
            let centroid = topic.centroid.as_ref().unwrap();
            // The dominant axis of the centroid carries most of the mass.
            let max = centroid.iter().cloned().fold(f32::MIN, f32::max);
            assert!((max - 1.0).abs() < 0.05);
        }
    }

    #[tokio::test]
    async fn rerunning_on_unchanged_input_rebuilds_the_same_partition() {
        let engine = ReclusterEngine::new(test_config(), Arc::new(CannedSummarizer));
        let dim = 12;
        let mut ideas = Vec::new();
        for cluster in 0..6 {
            for member in 0..3 {
                let nudge = 0.02 * (member as f32);
                ideas.push(idea(cluster * 3 + member, axis_vector(dim, cluster, nudge)));
            }
        }

        let first = engine.rebuild("d-1", &ideas).await;
        let second = engine.rebuild("d-1", &ideas).await;
        assert_eq!(partition_of(&first), partition_of(&second));
    }

    #[tokio::test]
    async fn too_few_groups_falls_back_to_fixed_count() {
        // Two tight clusters of ten: the threshold pass yields 2 groups,
        // under the natural-group minimum, so the fixed-count pass with
        // k = min(target, n) = 10 takes over.
        let engine = ReclusterEngine::new(test_config(), Arc::new(CannedSummarizer));
        let dim = 4;
        let mut ideas = Vec::new();
        for cluster in 0..2 {
            for member in 0..10 {
                let nudge = 0.01 * (member as f32);
                ideas.push(idea(cluster * 10 + member, axis_vector(dim, cluster, nudge)));
            }
        }

        let plan = engine.rebuild("d-1", &ideas).await;
        assert_eq!(plan.topics.len(), 10);
        assert_eq!(plan.assignments.len(), 20);
    }

    #[tokio::test]
    async fn ballooning_leftovers_trigger_the_secondary_pass() {
        // Five tight pairs plus thirty mutually distant singletons:
        // projected topics 5 + 30 = 35 > 2 * target(=10), so the leftovers
        // get clustered down to |leftovers| / 3 = 10 topics.
        let engine = ReclusterEngine::new(test_config(), Arc::new(CannedSummarizer));
        let dim = 40;
        let mut ideas = Vec::new();
        let mut id = 0;
        for cluster in 0..5 {
            for member in 0..2 {
                let nudge = 0.02 * (member as f32);
                ideas.push(idea(id, axis_vector(dim, cluster, nudge)));
                id += 1;
            }
        }
        for single in 0..30 {
            ideas.push(idea(id, axis_vector(dim, 5 + single, 0.0)));
            id += 1;
        }

        let plan = engine.rebuild("d-1", &ideas).await;

        let target = ReclusterEngine::target_topics(ideas.len());
        assert_eq!(target, 10);
        assert_eq!(plan.topics.len(), 15);
        assert!(plan.topics.len() <= 2 * target);
        assert!(plan.topics.len() >= target);
        assert_eq!(plan.assignments.len(), ideas.len());
    }

    #[tokio::test]
    async fn naming_failure_falls_back_to_truncated_member_text() {
        let engine = ReclusterEngine::new(test_config(), Arc::new(FailingSummarizer));
        let dim = 12;
        let mut ideas = Vec::new();
        for cluster in 0..6 {
            for member in 0..3 {
                let nudge = 0.02 * (member as f32);
                ideas.push(idea(cluster * 3 + member, axis_vector(dim, cluster, nudge)));
            }
        }

        let plan = engine.rebuild("d-1", &ideas).await;
        for topic in &plan.topics {
            assert!(topic.representative_text.starts_with("idea "));
        }
    }

    #[test]
    fn target_topic_count_is_clamped() {
        assert_eq!(ReclusterEngine::target_topics(30), 10);
        assert_eq!(ReclusterEngine::target_topics(355), 35);
        assert_eq!(ReclusterEngine::target_topics(10_000), 50);
    }
}
