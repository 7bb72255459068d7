//! Vector math for centroid maintenance and assignment.
//!
//! Everything here is pure; the engines call into it from their hot loops.

/// Cosine similarity between two vectors.
///
/// Zero-norm or mismatched-length inputs yield 0.0, which makes them
/// ineligible against any threshold rather than an error.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

/// Cosine distance, `1 - similarity`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Arithmetic mean of a set of vectors. Returns `None` for an empty set
/// or when the vectors disagree on dimension.
pub fn mean(vectors: &[&[f32]]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let dim = first.len();
    if vectors.iter().any(|v| v.len() != dim) {
        return None;
    }

    let mut sum = vec![0.0f64; dim];
    for v in vectors {
        for (s, x) in sum.iter_mut().zip(v.iter()) {
            *s += f64::from(*x);
        }
    }
    let n = vectors.len() as f64;
    Some(sum.into_iter().map(|s| (s / n) as f32).collect())
}

/// Incremental centroid update: `C' = (C * n + e) / (n + 1)`.
pub fn incremental_mean(centroid: &[f32], count: i64, new: &[f32]) -> Vec<f32> {
    let n = count.max(0) as f64;
    centroid
        .iter()
        .zip(new.iter())
        .map(|(c, e)| ((f64::from(*c) * n + f64::from(*e)) / (n + 1.0)) as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_have_similarity_one() {
        let v = [0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_have_similarity_zero() {
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn zero_norm_vector_is_non_matching() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn mismatched_lengths_are_non_matching() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn mean_of_two_vectors() {
        let m = mean(&[&[1.0, 0.0][..], &[0.0, 1.0][..]]).unwrap();
        assert_eq!(m, vec![0.5, 0.5]);
    }

    #[test]
    fn mean_of_nothing_is_none() {
        assert!(mean(&[]).is_none());
    }

    #[test]
    fn incremental_mean_matches_recomputed_mean() {
        // Centroid of 8 copies of c, then one new member e: (c*8 + e) / 9
        let c = [0.6, 0.2];
        let e = [0.0, 0.9];
        let updated = incremental_mean(&c, 8, &e);
        assert!((updated[0] - (0.6 * 8.0 / 9.0)).abs() < 1e-6);
        assert!((updated[1] - ((0.2 * 8.0 + 0.9) / 9.0)).abs() < 1e-6);
    }

    #[test]
    fn incremental_mean_from_single_member() {
        let updated = incremental_mean(&[1.0, 0.0], 1, &[0.0, 1.0]);
        assert_eq!(updated, vec![0.5, 0.5]);
    }
}
