//! HTTP embedding provider speaking the OpenAI-compatible `/embeddings` wire
//! format (also served by Voyage AI and most other embedding vendors).
//! Grounded on `ai-client`'s `OpenAiClient::embed`/`embed_batch`.

use async_trait::async_trait;
use darwin_core::{normalized, DarwinError, Result, Vector};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Embedder;

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: serde_json::Value,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

pub struct RemoteEmbedder {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dim: usize,
}

impl RemoteEmbedder {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>, dim: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            dim,
        }
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|e| DarwinError::Embedding(e.to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn call(&self, input: serde_json::Value) -> Result<Vec<Vector>> {
        let url = format!("{}/embeddings", self.base_url);
        debug!(model = %self.model, "embedding request");

        let request = EmbeddingRequest {
            model: self.model.clone(),
            input,
        };

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await
            .map_err(|e| DarwinError::Embedding(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DarwinError::Embedding(format!("embedding provider error ({status}): {body}")));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| DarwinError::Embedding(e.to_string()))?;

        Ok(parsed.data.into_iter().map(|d| normalized(&d.embedding)).collect())
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed(&self, text: &str) -> Result<Vector> {
        let mut out = self.call(serde_json::Value::String(text.to_string())).await?;
        out.pop().ok_or_else(|| DarwinError::Embedding("no embedding in response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vector>> {
        let input = serde_json::Value::Array(texts.iter().cloned().map(serde_json::Value::String).collect());
        self.call(input).await
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}
