//! Core data models used throughout ragpipe.
//!
//! These types represent the documents, ingestion tasks, chunks, and
//! query results that flow through the ingestion and retrieval pipelines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An uploaded document. Created by the upload path, immutable thereafter;
/// the pipelines only ever reference it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub filename: String,
    /// Declared media type (from the upload's file extension).
    pub media_type: String,
    pub size_bytes: u64,
    /// Location of the raw bytes in blob storage.
    pub storage_key: String,
}

/// A queued unit of ingestion work: one document awaiting processing.
///
/// Serialized as the queue message body. Delivery is at-least-once; the
/// delivery attempt count travels as queue metadata (see
/// [`Delivery`](crate::queue::Delivery)), not in the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionTask {
    pub document: Document,
    pub enqueued_at: DateTime<Utc>,
}

impl IngestionTask {
    pub fn new(document: Document) -> Self {
        Self {
            document,
            enqueued_at: Utc::now(),
        }
    }
}

/// A bounded span of document text produced by the chunker.
///
/// `start` and `end` are byte offsets of the chunk's core (non-overlapping)
/// span in the original text; `text` additionally carries the verbatim
/// overlap from the preceding chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub document_id: Uuid,
    pub ordinal: u32,
    pub text: String,
    pub start: usize,
    pub end: usize,
    /// SHA-256 of (document id, normalized core text), hex-encoded.
    pub fingerprint: String,
    /// Stable external id derived from the fingerprint. Re-ingesting
    /// identical content always maps to the same id, so an upsert
    /// overwrites instead of duplicating.
    pub record_id: Uuid,
}

/// Payload stored alongside each vector in the external index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordPayload {
    pub filename: String,
    pub document_id: Uuid,
    pub chunk_index: u32,
    pub text: String,
    /// Blob-storage key of the parent document; used by the out-of-band
    /// orphan cleanup to check whether the source still exists.
    pub storage_key: String,
}

/// A vector record as written to (or scrolled out of) the index.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: RecordPayload,
}

/// One search hit: a stored record plus its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredHit {
    pub id: Uuid,
    pub score: f32,
    pub payload: RecordPayload,
}

/// The ranked, deduplicated outcome of the retrieval engine.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    /// Hits in strictly non-increasing score order, at most `k` entries,
    /// at most `max_chunks_per_doc` per source document.
    pub hits: Vec<ScoredHit>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// An incoming question.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_include_sources")]
    pub include_sources: bool,
}

fn default_max_results() -> usize {
    5
}

fn default_include_sources() -> bool {
    true
}

/// A source attribution attached to an answer.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceRef {
    pub filename: String,
    /// Similarity score, rounded to three decimals.
    pub score: f32,
    /// First 200 characters of the supporting chunk.
    pub content_preview: String,
}

/// A generated answer with its supporting sources.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub query: String,
    pub answer: String,
    pub sources: Vec<SourceRef>,
    /// Elapsed wall-clock seconds for the whole query pipeline.
    pub processing_time: f64,
}

impl SourceRef {
    /// Build a source attribution from a retrieval hit.
    pub fn from_hit(hit: &ScoredHit) -> Self {
        let preview = if hit.payload.text.chars().count() > 200 {
            let cut: String = hit.payload.text.chars().take(200).collect();
            format!("{}...", cut)
        } else {
            hit.payload.text.clone()
        };
        Self {
            filename: hit.payload.filename.clone(),
            score: (hit.score * 1000.0).round() / 1000.0,
            content_preview: preview,
        }
    }
}
