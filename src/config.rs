use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Immutable application configuration, constructed once at process start
/// and passed by reference into each component's constructor.
///
/// Secrets (API keys, AWS credentials) are deliberately absent: they are
/// read from the environment by the adapters that need them.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub vector: VectorConfig,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Upload size cap in bytes. Uploads beyond this get HTTP 413.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Full queue URL, e.g. `https://sqs.us-east-1.amazonaws.com/123/ingest`.
    pub queue_url: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Long-poll wait per receive call.
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
    /// How long a received message stays invisible before redelivery.
    #[serde(default = "default_visibility_secs")]
    pub visibility_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    /// Qdrant base URL, e.g. `http://localhost:6333`.
    pub url: String,
    pub collection: String,
    /// Embedding dimensionality; must match the embedding model.
    pub dims: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Backoff-bounded retry count for the ingestion path. The query path
    /// always runs with zero provider retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Hits scoring below this floor are discarded before ranking.
    #[serde(default = "default_score_floor")]
    pub score_floor: f32,
    /// At most this many chunks of one document may appear in a result.
    #[serde(default = "default_max_chunks_per_doc")]
    pub max_chunks_per_doc: usize,
    /// Raw candidates fetched from the index before filtering/dedup.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    /// Character budget for the assembled grounding context.
    #[serde(default = "default_context_budget_chars")]
    pub context_budget_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            score_floor: default_score_floor(),
            max_chunks_per_doc: default_max_chunks_per_doc(),
            candidate_k: default_candidate_k(),
            context_budget_chars: default_context_budget_chars(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Deliveries after which a still-failing task is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Idle sleep between empty polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Base of the redelivery backoff: a task nacked after its n-th
    /// delivery becomes visible again after `base * 2^(n-1)` seconds.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            poll_interval_secs: default_poll_interval_secs(),
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

fn default_max_upload_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_key_prefix() -> String {
    "uploads".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_wait_secs() -> u64 {
    20
}
fn default_visibility_secs() -> u64 {
    300
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_generation_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_max_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.1
}
fn default_generation_timeout_secs() -> u64 {
    60
}
fn default_max_chars() -> usize {
    2000
}
fn default_overlap_chars() -> usize {
    200
}
fn default_score_floor() -> f32 {
    0.25
}
fn default_max_chunks_per_doc() -> usize {
    3
}
fn default_candidate_k() -> usize {
    40
}
fn default_context_budget_chars() -> usize {
    8000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_retry_backoff_secs() -> u64 {
    2
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chars {
        anyhow::bail!("chunking.overlap_chars must be < chunking.max_chars");
    }
    if config.vector.dims == 0 {
        anyhow::bail!("vector.dims must be > 0");
    }
    if !(0.0..=1.0).contains(&config.retrieval.score_floor) {
        anyhow::bail!("retrieval.score_floor must be in [0.0, 1.0]");
    }
    if config.retrieval.max_chunks_per_doc == 0 {
        anyhow::bail!("retrieval.max_chunks_per_doc must be >= 1");
    }
    if config.retrieval.candidate_k == 0 {
        anyhow::bail!("retrieval.candidate_k must be >= 1");
    }
    if config.worker.max_attempts == 0 {
        anyhow::bail!("worker.max_attempts must be >= 1");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> String {
        r#"
[server]
bind = "127.0.0.1:8080"

[storage]
bucket = "docs"

[queue]
queue_url = "http://localhost:4566/000000000000/ingest"

[vector]
url = "http://localhost:6333"
collection = "documents"
dims = 384

[embedding]

[generation]
"#
        .to_string()
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str(&minimal_toml()).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.server.max_upload_bytes, 10 * 1024 * 1024);
        assert_eq!(config.chunking.max_chars, 2000);
        assert_eq!(config.chunking.overlap_chars, 200);
        assert!((config.retrieval.score_floor - 0.25).abs() < f32::EPSILON);
        assert_eq!(config.worker.max_attempts, 5);
    }

    #[test]
    fn load_config_reads_and_validates_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragpipe.toml");
        std::fs::write(&path, minimal_toml()).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.storage.bucket, "docs");
        assert_eq!(config.storage.key_prefix, "uploads");
    }

    #[test]
    fn overlap_must_be_smaller_than_max() {
        let toml_str = minimal_toml() + "\n[chunking]\nmax_chars = 100\noverlap_chars = 100\n";
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn score_floor_out_of_range_rejected() {
        let toml_str = minimal_toml() + "\n[retrieval]\nscore_floor = 1.5\n";
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(validate(&config).is_err());
    }
}
