//! Deterministic local embedder: a hashing-trick bag-of-words vectorizer.
//!
//! No network calls and no model weights, so it's exactly reproducible across
//! runs and machines — used as the default in tests and as an offline
//! fallback provider (`EMBEDDING_PROVIDER=hashing`). Grounded on the
//! hashing-backend fallback pattern seen alongside remote embedding providers
//! in the wider pack: a fixed-dimension signed hash of each token, summed and
//! renormalized.

use async_trait::async_trait;
use darwin_core::{normalize, normalized, Result, Vector};
use sha2::{Digest, Sha256};

use crate::Embedder;

pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn embed_one(&self, text: &str) -> Vector {
        let mut v = vec![0f32; self.dim];
        let normalized_text = normalize(text);
        for token in normalized_text.split_whitespace() {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = (u64::from_be_bytes(digest[0..8].try_into().unwrap()) as usize) % self.dim;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        normalized(&v)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vector> {
        Ok(self.embed_one(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vector>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_text_always_embeds_identically() {
        let e = HashEmbedder::new(64);
        let a = e.embed("sync fails on startup").await.unwrap();
        let b = e.embed("sync fails on startup").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn output_is_unit_length() {
        let e = HashEmbedder::new(64);
        let v = e.embed("the app crashes when offline").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4 || norm == 0.0);
    }

    #[tokio::test]
    async fn dissimilar_text_is_less_similar_than_identical_text() {
        let e = HashEmbedder::new(256);
        let a = e.embed("sync fails on startup").await.unwrap();
        let b = e.embed("sync fails on startup").await.unwrap();
        let c = e.embed("please add a dark mode toggle").await.unwrap();
        let sim_ab = darwin_core::cosine_similarity(&a, &b);
        let sim_ac = darwin_core::cosine_similarity(&a, &c);
        assert!(sim_ab > sim_ac);
    }
}
