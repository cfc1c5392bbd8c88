//! Shared vector arithmetic: cosine similarity and unit-normalization.
//! Used by the embedder, the clusterer, and the learning store's retrieval.

use crate::types::Vector;

/// Cosine similarity between two vectors of equal length. Returns 0.0 for
/// degenerate (zero-norm) inputs rather than dividing by zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Unit-normalize a vector in place. Leaves zero vectors untouched.
pub fn normalize_in_place(v: &mut Vector) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Unit-normalized copy of a vector.
pub fn normalized(v: &[f32]) -> Vector {
    let mut out = v.to_vec();
    normalize_in_place(&mut out);
    out
}

/// The running mean of `n` existing contributions (summarized as `centroid`,
/// already the mean of those `n`) and one new contribution `v`, re-normalized
/// to unit length (spec §4.3: `normalize((centroid*n + v)/(n+1))`).
pub fn rolling_mean(centroid: &[f32], n: u32, v: &[f32]) -> Vector {
    debug_assert_eq!(centroid.len(), v.len());
    let n = n as f32;
    let mut out: Vector = centroid
        .iter()
        .zip(v)
        .map(|(c, x)| (c * n + x) / (n + 1.0))
        .collect();
    normalize_in_place(&mut out);
    out
}
