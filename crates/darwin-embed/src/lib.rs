//! Embedding providers for Darwin. The pipeline depends on [`Embedder`] only —
//! which backend is live is a deployment choice (spec §6.5's `EMBEDDING_PROVIDER`).

pub mod hashing;
pub mod remote;

pub use hashing::HashEmbedder;
pub use remote::RemoteEmbedder;

use async_trait::async_trait;
use darwin_core::{Result, Vector};

/// Dyn-compatible embedding trait (wraps whatever provider-specific client is
/// in play — mirrors the teacher's `TextEmbedder` / `EmbedAgent` split).
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vector>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vector>>;

    fn dimension(&self) -> usize;
}
