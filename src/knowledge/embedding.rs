//! Embedding provider port and its two implementations.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::core::errors::EngineError;

use super::index::l2_normalize;

const DEFAULT_EMBED_TIMEOUT_SECS: u64 = 30;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// embed a single text into a fixed-dimension vector
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError>;

    /// output dimension of this provider
    fn dimension(&self) -> usize;

    /// model identifier for diagnostics
    fn model(&self) -> &str;
}

/// OpenAI-compatible `/embeddings` endpoint client.
pub struct HttpEmbeddingProvider {
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
    timeout_secs: u64,
    client: Client,
}

impl HttpEmbeddingProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        dimension: usize,
    ) -> Result<Self, EngineError> {
        Self::with_timeout(base_url, api_key, model, dimension, DEFAULT_EMBED_TIMEOUT_SECS)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        dimension: usize,
        timeout_secs: u64,
    ) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(EngineError::internal)?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            dimension,
            timeout_secs,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = json!({
            "model": self.model,
            "input": text,
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let res = request.send().await.map_err(|err| {
            if err.is_timeout() {
                EngineError::Timeout(self.timeout_secs)
            } else {
                EngineError::internal(err)
            }
        })?;
        if !res.status().is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(EngineError::Internal(format!(
                "embeddings error: {}",
                text
            )));
        }

        let payload: Value = res.json().await.map_err(EngineError::internal)?;
        let vector: Vec<f32> = payload["data"][0]["embedding"]
            .as_array()
            .map(|vals| {
                vals.iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect()
            })
            .unwrap_or_default();

        if vector.is_empty() {
            return Err(EngineError::Internal(
                "embeddings response had no vector".to_string(),
            ));
        }

        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Deterministic offline embedder.
///
/// Buckets lowercased whitespace tokens into a fixed-dimension vector by
/// stable hash and normalizes the result, so identical texts always embed
/// identically and token overlap shows up as cosine similarity. Used by
/// tests and by deployments without a real embedding model that still
/// want the vector path exercised.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn bucket(&self, token: &str) -> usize {
        let digest = Sha256::digest(token.as_bytes());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(raw) as usize) % self.dimension
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text.to_lowercase().split_whitespace() {
            vector[self.bucket(token)] += 1.0;
        }
        Ok(l2_normalize(vector))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model(&self) -> &str {
        "hash-bucket-v1"
    }
}
