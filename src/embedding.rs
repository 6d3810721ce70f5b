//! Embedding capability.
//!
//! One trait, two adapters: an OpenAI-compatible HTTP client for
//! production (any server exposing `/v1/embeddings` works, which covers
//! local inference servers too) and a deterministic fake for tests.
//!
//! Retry policy lives here, not in callers: the worker constructs the
//! adapter with the configured retry budget, the query path constructs it
//! with zero so a slow provider fails the request fast instead of
//! stalling it.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::EmbeddingConfig;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding provider rate limited the request")]
    RateLimited,
    #[error("embedding request timed out")]
    Timeout,
    #[error("embedding service error: {0}")]
    Service(String),
    #[error("embedding input rejected: {0}")]
    InvalidInput(String),
    #[error("embedding auth error: {0}")]
    Auth(String),
}

impl EmbedError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EmbedError::RateLimited | EmbedError::Timeout | EmbedError::Service(_)
        )
    }
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts; the output is index-aligned with the input.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    /// Width of the vectors this embedder produces.
    fn dims(&self) -> usize;

    /// Connectivity probe for health reporting.
    async fn ping(&self) -> bool;
}

// ============ OpenAI-compatible adapter ============

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

pub struct OpenAiEmbedder {
    config: EmbeddingConfig,
    dims: usize,
    retries: u32,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    /// `dims` is the width the vector index was created with; a model
    /// returning anything else is a configuration mistake, not a glitch.
    /// `retries` is the number of extra attempts after the first.
    pub fn new(config: &EmbeddingConfig, dims: usize, retries: u32) -> Result<Self, EmbedError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| EmbedError::Auth("OPENAI_API_KEY environment variable not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EmbedError::Service(e.to_string()))?;
        Ok(Self {
            config: config.clone(),
            dims,
            retries,
            api_key,
            client,
        })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1")
            .trim_end_matches('/')
    }

    async fn request_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url()))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.config.model,
                "input": batch,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EmbedError::Timeout
                } else {
                    EmbedError::Service(e.to_string())
                }
            })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(EmbedError::RateLimited);
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(EmbedError::Auth(format!("provider returned HTTP {}", status)));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = format!(
                "HTTP {}: {}",
                status,
                body.chars().take(300).collect::<String>()
            );
            return if status.is_server_error() {
                Err(EmbedError::Service(message))
            } else {
                Err(EmbedError::InvalidInput(message))
            };
        }

        let parsed: EmbeddingsResponse = resp
            .json()
            .await
            .map_err(|e| EmbedError::Service(format!("malformed response: {}", e)))?;
        if parsed.data.len() != batch.len() {
            return Err(EmbedError::Service(format!(
                "expected {} embeddings, got {}",
                batch.len(),
                parsed.data.len()
            )));
        }

        let mut out = vec![Vec::new(); batch.len()];
        for item in parsed.data {
            if item.index >= out.len() {
                return Err(EmbedError::Service(format!(
                    "embedding index {} out of range",
                    item.index
                )));
            }
            if item.embedding.len() != self.dims {
                return Err(EmbedError::InvalidInput(format!(
                    "model returned {} dims, index expects {}",
                    item.embedding.len(),
                    self.dims
                )));
            }
            out[item.index] = item.embedding;
        }
        Ok(out)
    }

    async fn batch_with_retry(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.request_batch(batch).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_retryable() && attempt <= self.retries => {
                    let delay = 1u64 << (attempt - 1).min(5);
                    tracing::warn!(
                        attempt,
                        delay_secs = delay,
                        error = %e,
                        "embedding attempt failed, backing off"
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(blank) = texts.iter().position(|t| t.trim().is_empty()) {
            return Err(EmbedError::InvalidInput(format!(
                "text at position {} is empty",
                blank
            )));
        }

        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size) {
            out.extend(self.batch_with_retry(batch).await?);
        }
        Ok(out)
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn ping(&self) -> bool {
        let resp = self
            .client
            .get(format!("{}/models", self.base_url()))
            .bearer_auth(&self.api_key)
            .send()
            .await;
        matches!(resp, Ok(r) if r.status().is_success())
    }
}

// ============ Fake adapter ============

/// Deterministic bag-of-words embedder for tests: each word hashes to one
/// dimension, counts accumulate, and the vector is L2-normalised. Texts
/// sharing words land close under cosine similarity, which is all the
/// retrieval tests need.
pub struct FakeEmbedder {
    dims: usize,
}

impl FakeEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        use std::hash::{Hash, Hasher};

        let mut vector = vec![0.0_f32; self.dims];
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            word.hash(&mut hasher);
            let slot = (hasher.finish() as usize) % self.dims;
            vector[slot] += 1.0;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if let Some(blank) = texts.iter().position(|t| t.trim().is_empty()) {
            return Err(EmbedError::InvalidInput(format!(
                "text at position {} is empty",
                blank
            )));
        }
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn ping(&self) -> bool {
        true
    }
}
