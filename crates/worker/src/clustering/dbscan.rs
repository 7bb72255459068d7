//! Density-based clustering over cosine distance, used as the mini-pass
//! that groups outlier ideas into new topics.

use std::collections::VecDeque;

use idearoom_core::similarity::cosine_distance;

/// Cluster points by density. Returns one label per point: `Some(cluster)`
/// for members of a dense group, `None` for noise.
///
/// `min_samples` counts the point itself, matching the usual convention.
pub fn cosine_dbscan(points: &[&[f32]], eps: f32, min_samples: usize) -> Vec<Option<usize>> {
    let n = points.len();
    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut visited = vec![false; n];
    let mut next_cluster = 0usize;

    for i in 0..n {
        if visited[i] {
            continue;
        }
        visited[i] = true;

        let neighbors = region_query(points, i, eps);
        if neighbors.len() < min_samples {
            // Noise for now; a later expansion may still claim it as a
            // border point.
            continue;
        }

        let cluster = next_cluster;
        next_cluster += 1;
        labels[i] = Some(cluster);

        let mut seeds: VecDeque<usize> = neighbors.into_iter().collect();
        while let Some(j) = seeds.pop_front() {
            if labels[j].is_none() {
                labels[j] = Some(cluster);
            }
            if !visited[j] {
                visited[j] = true;
                let expansion = region_query(points, j, eps);
                if expansion.len() >= min_samples {
                    seeds.extend(expansion);
                }
            }
        }
    }

    labels
}

fn region_query(points: &[&[f32]], center: usize, eps: f32) -> Vec<usize> {
    (0..points.len())
        .filter(|&j| cosine_distance(points[center], points[j]) <= eps)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(points: &[Vec<f32>]) -> Vec<&[f32]> {
        points.iter().map(|p| p.as_slice()).collect()
    }

    #[test]
    fn dense_pairs_cluster_and_distant_point_is_noise() {
        let points = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.99, 0.05, 0.0], // near the first
            vec![0.0, 1.0, 0.0],
            vec![0.05, 0.99, 0.0], // near the third
            vec![0.0, 0.0, 1.0],   // alone
        ];
        let labels = cosine_dbscan(&refs(&points), 0.25, 2);

        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[2], labels[3]);
        assert_ne!(labels[0], labels[2]);
        assert!(labels[0].is_some());
        assert_eq!(labels[4], None);
    }

    #[test]
    fn all_distant_points_are_noise() {
        let points = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0],
        ];
        let labels = cosine_dbscan(&refs(&points), 0.25, 2);
        assert!(labels.iter().all(|l| l.is_none()));
    }

    #[test]
    fn chain_of_close_points_forms_one_cluster() {
        // Consecutive points are within eps; the ends are not, but density
        // reachability joins them through the middle.
        let points = vec![
            vec![1.0, 0.0],
            vec![0.95, 0.31], // ~18 degrees
            vec![0.81, 0.59], // ~36 degrees
        ];
        let labels = cosine_dbscan(&refs(&points), 0.06, 2);
        assert_eq!(labels[0], Some(0));
        assert_eq!(labels[1], Some(0));
        assert_eq!(labels[2], Some(0));
    }

    #[test]
    fn empty_input_yields_no_labels() {
        let labels = cosine_dbscan(&[], 0.25, 2);
        assert!(labels.is_empty());
    }
}
