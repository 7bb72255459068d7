//! Hierarchical agglomerative clustering with cosine distance and average
//! linkage, driving the full-recluster rebuild.
//!
//! Two stopping modes: cut the merge sequence at a distance threshold, or
//! merge down to a fixed cluster count. Cluster-to-cluster distances are
//! maintained with the Lance-Williams average-linkage update, so each merge
//! costs O(n) after the O(n^2) matrix build.

use idearoom_core::similarity::cosine_distance;

enum Stop {
    /// Stop merging once the closest pair is farther than this distance.
    Threshold(f32),
    /// Merge until this many clusters remain.
    Fixed(usize),
}

/// Cluster until the closest pair exceeds `distance_threshold`. Returns one
/// label per input, numbered by each cluster's first member in load order.
pub fn cluster_by_threshold(embeddings: &[&[f32]], distance_threshold: f32) -> Vec<usize> {
    agglomerate(embeddings, Stop::Threshold(distance_threshold))
}

/// Cluster into exactly `min(n_clusters, len)` clusters.
pub fn cluster_fixed(embeddings: &[&[f32]], n_clusters: usize) -> Vec<usize> {
    agglomerate(embeddings, Stop::Fixed(n_clusters.max(1)))
}

fn agglomerate(embeddings: &[&[f32]], stop: Stop) -> Vec<usize> {
    let n = embeddings.len();
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![0];
    }

    // Full pairwise distance matrix, flattened.
    let mut dist = vec![0.0f32; n * n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d = cosine_distance(embeddings[i], embeddings[j]);
            dist[i * n + j] = d;
            dist[j * n + i] = d;
        }
    }

    let mut active: Vec<bool> = vec![true; n];
    let mut size: Vec<usize> = vec![1; n];
    let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    let mut active_count = n;

    loop {
        if active_count <= 1 {
            break;
        }
        if let Stop::Fixed(k) = stop {
            if active_count <= k {
                break;
            }
        }

        // Closest active pair. Ties resolve to the lowest indices, which
        // keeps the merge sequence deterministic.
        let mut best: Option<(usize, usize, f32)> = None;
        for i in 0..n {
            if !active[i] {
                continue;
            }
            for j in (i + 1)..n {
                if !active[j] {
                    continue;
                }
                let d = dist[i * n + j];
                if best.map_or(true, |(_, _, bd)| d < bd) {
                    best = Some((i, j, d));
                }
            }
        }

        let (a, b, d) = match best {
            Some(pair) => pair,
            None => break,
        };

        if let Stop::Threshold(threshold) = stop {
            if d > threshold {
                break;
            }
        }

        // Merge b into a; average-linkage update for every other cluster.
        let (sa, sb) = (size[a] as f32, size[b] as f32);
        for k in 0..n {
            if !active[k] || k == a || k == b {
                continue;
            }
            let merged = (sa * dist[a * n + k] + sb * dist[b * n + k]) / (sa + sb);
            dist[a * n + k] = merged;
            dist[k * n + a] = merged;
        }
        size[a] += size[b];
        let moved = std::mem::take(&mut members[b]);
        members[a].extend(moved);
        active[b] = false;
        active_count -= 1;
    }

    // Deterministic labels: clusters ordered by their smallest member index.
    let mut clusters: Vec<Vec<usize>> = members
        .into_iter()
        .enumerate()
        .filter(|(i, _)| active[*i])
        .map(|(_, mut m)| {
            m.sort_unstable();
            m
        })
        .collect();
    clusters.sort_by_key(|m| m[0]);

    let mut labels = vec![0usize; n];
    for (label, cluster) in clusters.iter().enumerate() {
        for &member in cluster {
            labels[member] = label;
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(points: &[Vec<f32>]) -> Vec<&[f32]> {
        points.iter().map(|p| p.as_slice()).collect()
    }

    #[test]
    fn threshold_cut_separates_distant_groups() {
        let points = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.98, 0.1, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.1, 0.98, 0.0],
        ];
        let labels = cluster_by_threshold(&refs(&points), 0.30);
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[2], labels[3]);
        assert_ne!(labels[0], labels[2]);
    }

    #[test]
    fn tight_threshold_keeps_everything_separate() {
        let points = vec![
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![0.7, 0.7],
        ];
        let labels = cluster_by_threshold(&refs(&points), 0.01);
        assert_eq!(labels, vec![0, 1, 2]);
    }

    #[test]
    fn loose_threshold_merges_everything() {
        let points = vec![
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![0.7, 0.7],
        ];
        let labels = cluster_by_threshold(&refs(&points), 1.0);
        assert!(labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn fixed_count_is_honored() {
        let points = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.98, 0.1, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.1, 0.98, 0.0],
            vec![0.0, 0.0, 1.0],
        ];
        let labels = cluster_fixed(&refs(&points), 3);
        let distinct: std::collections::HashSet<_> = labels.iter().collect();
        assert_eq!(distinct.len(), 3);
        // The two tight pairs survive as pairs.
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[2], labels[3]);
    }

    #[test]
    fn fixed_count_larger_than_input_means_singletons() {
        let points = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let labels = cluster_fixed(&refs(&points), 10);
        assert_eq!(labels, vec![0, 1]);
    }

    #[test]
    fn labels_follow_load_order() {
        let points = vec![
            vec![0.0, 1.0, 0.0],
            vec![1.0, 0.0, 0.0],
            vec![0.05, 0.99, 0.0],
        ];
        // First cluster (label 0) contains the first point in load order.
        let labels = cluster_by_threshold(&refs(&points), 0.30);
        assert_eq!(labels[0], 0);
        assert_eq!(labels[2], 0);
        assert_eq!(labels[1], 1);
    }
}
