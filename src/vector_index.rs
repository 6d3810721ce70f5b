//! Vector index capability.
//!
//! The index stores one point per chunk, keyed by the chunk's stable
//! [`record_id`](crate::models::Chunk::record_id), so re-ingesting the
//! same document overwrites rather than duplicates. The production
//! adapter talks to Qdrant's REST API; the in-memory adapter does exact
//! cosine search over a map and backs the test suite.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::config::VectorConfig;
use crate::models::{RecordPayload, ScoredHit, VectorRecord};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector index request timed out")]
    Timeout,
    #[error("vector index unavailable: {0}")]
    Unavailable(String),
    #[error("vector index error: {0}")]
    Service(String),
    #[error("vector index rejected request: {0}")]
    BadRequest(String),
}

impl IndexError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, IndexError::Timeout | IndexError::Unavailable(_))
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the backing collection if it does not exist yet. Called once
    /// at startup by both the server and the worker.
    async fn ensure_ready(&self) -> Result<(), IndexError>;

    /// Insert-or-overwrite by record id. Durable when it returns `Ok`.
    async fn upsert(&self, records: &[VectorRecord]) -> Result<(), IndexError>;

    /// Nearest neighbours by cosine similarity, best first.
    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<ScoredHit>, IndexError>;

    /// Which of `ids` are already present. Drives ingestion dedup.
    async fn existing(&self, ids: &[Uuid]) -> Result<HashSet<Uuid>, IndexError>;

    async fn delete(&self, ids: &[Uuid]) -> Result<(), IndexError>;

    /// Page through every stored point. `offset` of `None` starts from the
    /// beginning; the returned offset of `None` means the end was reached.
    async fn scroll(
        &self,
        offset: Option<String>,
        limit: usize,
    ) -> Result<(Vec<(Uuid, RecordPayload)>, Option<String>), IndexError>;

    /// Connectivity probe for health reporting.
    async fn ping(&self) -> bool;
}

// ============ In-memory adapter ============

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Exact-search in-memory index for tests.
#[derive(Default)]
pub struct MemoryIndex {
    points: RwLock<HashMap<Uuid, VectorRecord>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn ensure_ready(&self) -> Result<(), IndexError> {
        Ok(())
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<(), IndexError> {
        let mut points = self.points.write().unwrap();
        for record in records {
            points.insert(record.id, record.clone());
        }
        Ok(())
    }

    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<ScoredHit>, IndexError> {
        let points = self.points.read().unwrap();
        let mut hits: Vec<ScoredHit> = points
            .values()
            .map(|r| ScoredHit {
                id: r.id,
                score: cosine(vector, &r.vector),
                payload: r.payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn existing(&self, ids: &[Uuid]) -> Result<HashSet<Uuid>, IndexError> {
        let points = self.points.read().unwrap();
        Ok(ids.iter().copied().filter(|id| points.contains_key(id)).collect())
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<(), IndexError> {
        let mut points = self.points.write().unwrap();
        for id in ids {
            points.remove(id);
        }
        Ok(())
    }

    async fn scroll(
        &self,
        offset: Option<String>,
        limit: usize,
    ) -> Result<(Vec<(Uuid, RecordPayload)>, Option<String>), IndexError> {
        // Stable order so paging never skips or repeats a point.
        let points = self.points.read().unwrap();
        let mut ids: Vec<Uuid> = points.keys().copied().collect();
        ids.sort();

        let start = match offset {
            Some(ref s) => {
                let after: Uuid = s
                    .parse()
                    .map_err(|_| IndexError::BadRequest(format!("bad scroll offset: {}", s)))?;
                ids.partition_point(|id| *id <= after)
            }
            None => 0,
        };

        let page: Vec<(Uuid, RecordPayload)> = ids[start..]
            .iter()
            .take(limit)
            .map(|id| (*id, points[id].payload.clone()))
            .collect();

        let next = if start + page.len() < ids.len() {
            page.last().map(|(id, _)| id.to_string())
        } else {
            None
        };
        Ok((page, next))
    }

    async fn ping(&self) -> bool {
        true
    }
}

// ============ Qdrant adapter ============

#[derive(Deserialize)]
struct QdrantEnvelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct QdrantHit {
    id: String,
    score: f32,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct QdrantPoint {
    id: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct QdrantScrollResult {
    points: Vec<QdrantPoint>,
    #[serde(default)]
    next_page_offset: Option<serde_json::Value>,
}

/// Production index adapter: Qdrant over REST.
pub struct QdrantIndex {
    config: VectorConfig,
    client: reqwest::Client,
}

impl QdrantIndex {
    pub fn new(config: &VectorConfig) -> Result<Self, IndexError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IndexError::Service(e.to_string()))?;
        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/collections/{}{}",
            self.config.url.trim_end_matches('/'),
            self.config.collection,
            path
        )
    }

    fn map_err(e: reqwest::Error) -> IndexError {
        if e.is_timeout() {
            IndexError::Timeout
        } else if e.is_connect() {
            IndexError::Unavailable(e.to_string())
        } else {
            IndexError::Service(e.to_string())
        }
    }

    async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response, IndexError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let message = format!(
            "{} failed (HTTP {}): {}",
            what,
            status,
            body.chars().take(300).collect::<String>()
        );
        if status.as_u16() == 429 || status.is_server_error() {
            Err(IndexError::Unavailable(message))
        } else {
            Err(IndexError::BadRequest(message))
        }
    }

    fn parse_payload(id: &str, payload: Option<serde_json::Value>) -> Option<RecordPayload> {
        let value = payload?;
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!(point = id, error = %e, "skipping point with malformed payload");
                None
            }
        }
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_ready(&self) -> Result<(), IndexError> {
        let resp = self
            .client
            .get(self.url(""))
            .send()
            .await
            .map_err(Self::map_err)?;
        if resp.status().is_success() {
            return Ok(());
        }
        if resp.status().as_u16() != 404 {
            Self::check(resp, "get collection").await?;
            return Ok(());
        }

        let body = json!({
            "vectors": { "size": self.config.dims, "distance": "Cosine" }
        });
        let resp = self
            .client
            .put(self.url(""))
            .json(&body)
            .send()
            .await
            .map_err(Self::map_err)?;
        Self::check(resp, "create collection").await?;
        tracing::info!(collection = %self.config.collection, dims = self.config.dims, "created collection");
        Ok(())
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<(), IndexError> {
        if records.is_empty() {
            return Ok(());
        }
        let points: Vec<serde_json::Value> = records
            .iter()
            .map(|r| {
                json!({
                    "id": r.id.to_string(),
                    "vector": r.vector,
                    "payload": r.payload,
                })
            })
            .collect();

        // wait=true: only report success once the write is durable, so an
        // acked ingestion task is really done.
        let resp = self
            .client
            .put(self.url("/points?wait=true"))
            .json(&json!({ "points": points }))
            .send()
            .await
            .map_err(Self::map_err)?;
        Self::check(resp, "upsert points").await?;
        Ok(())
    }

    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<ScoredHit>, IndexError> {
        let resp = self
            .client
            .post(self.url("/points/search"))
            .json(&json!({
                "vector": vector,
                "limit": limit,
                "with_payload": true,
            }))
            .send()
            .await
            .map_err(Self::map_err)?;
        let resp = Self::check(resp, "search").await?;
        let envelope: QdrantEnvelope<Vec<QdrantHit>> =
            resp.json().await.map_err(Self::map_err)?;

        let mut hits = Vec::with_capacity(envelope.result.len());
        for hit in envelope.result {
            let Ok(id) = hit.id.parse::<Uuid>() else {
                continue;
            };
            if let Some(payload) = Self::parse_payload(&hit.id, hit.payload) {
                hits.push(ScoredHit {
                    id,
                    score: hit.score,
                    payload,
                });
            }
        }
        Ok(hits)
    }

    async fn existing(&self, ids: &[Uuid]) -> Result<HashSet<Uuid>, IndexError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let resp = self
            .client
            .post(self.url("/points"))
            .json(&json!({
                "ids": ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
                "with_payload": false,
                "with_vector": false,
            }))
            .send()
            .await
            .map_err(Self::map_err)?;
        let resp = Self::check(resp, "retrieve points").await?;
        let envelope: QdrantEnvelope<Vec<QdrantPoint>> =
            resp.json().await.map_err(Self::map_err)?;
        Ok(envelope
            .result
            .iter()
            .filter_map(|p| p.id.parse().ok())
            .collect())
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<(), IndexError> {
        if ids.is_empty() {
            return Ok(());
        }
        let resp = self
            .client
            .post(self.url("/points/delete?wait=true"))
            .json(&json!({
                "points": ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
            }))
            .send()
            .await
            .map_err(Self::map_err)?;
        Self::check(resp, "delete points").await?;
        Ok(())
    }

    async fn scroll(
        &self,
        offset: Option<String>,
        limit: usize,
    ) -> Result<(Vec<(Uuid, RecordPayload)>, Option<String>), IndexError> {
        let mut body = json!({
            "limit": limit,
            "with_payload": true,
            "with_vector": false,
        });
        if let Some(ref o) = offset {
            body["offset"] = json!(o);
        }

        let resp = self
            .client
            .post(self.url("/points/scroll"))
            .json(&body)
            .send()
            .await
            .map_err(Self::map_err)?;
        let resp = Self::check(resp, "scroll").await?;
        let envelope: QdrantEnvelope<QdrantScrollResult> =
            resp.json().await.map_err(Self::map_err)?;

        let mut page = Vec::with_capacity(envelope.result.points.len());
        for point in envelope.result.points {
            let Ok(id) = point.id.parse::<Uuid>() else {
                continue;
            };
            if let Some(payload) = Self::parse_payload(&point.id, point.payload) {
                page.push((id, payload));
            }
        }

        let next = envelope.result.next_page_offset.and_then(|v| match v {
            serde_json::Value::String(s) => Some(s),
            other => Some(other.to_string()),
        });
        Ok((page, next))
    }

    async fn ping(&self) -> bool {
        let url = format!("{}/collections", self.config.url.trim_end_matches('/'));
        match self.client.get(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: Uuid, vector: Vec<f32>, text: &str) -> VectorRecord {
        VectorRecord {
            id,
            vector,
            payload: RecordPayload {
                filename: "a.txt".to_string(),
                document_id: Uuid::nil(),
                chunk_index: 0,
                text: text.to_string(),
                storage_key: "uploads/a.txt".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn search_orders_by_similarity() {
        let index = MemoryIndex::new();
        let close = Uuid::new_v4();
        let far = Uuid::new_v4();
        index
            .upsert(&[
                record(close, vec![1.0, 0.0], "close"),
                record(far, vec![0.0, 1.0], "far"),
            ])
            .await
            .unwrap();

        let hits = index.search(&[1.0, 0.1], 2).await.unwrap();
        assert_eq!(hits[0].id, close);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn upsert_by_same_id_overwrites() {
        let index = MemoryIndex::new();
        let id = Uuid::new_v4();
        index
            .upsert(&[record(id, vec![1.0, 0.0], "first")])
            .await
            .unwrap();
        index
            .upsert(&[record(id, vec![1.0, 0.0], "second")])
            .await
            .unwrap();

        assert_eq!(index.len(), 1);
        let hits = index.search(&[1.0, 0.0], 1).await.unwrap();
        assert_eq!(hits[0].payload.text, "second");
    }

    #[tokio::test]
    async fn existing_reports_only_known_ids() {
        let index = MemoryIndex::new();
        let known = Uuid::new_v4();
        let unknown = Uuid::new_v4();
        index
            .upsert(&[record(known, vec![1.0], "x")])
            .await
            .unwrap();

        let present = index.existing(&[known, unknown]).await.unwrap();
        assert!(present.contains(&known));
        assert!(!present.contains(&unknown));
    }

    #[tokio::test]
    async fn scroll_pages_through_everything_without_repeats() {
        let index = MemoryIndex::new();
        let records: Vec<VectorRecord> = (0..7)
            .map(|i| record(Uuid::new_v4(), vec![i as f32], "p"))
            .collect();
        index.upsert(&records).await.unwrap();

        let mut seen = HashSet::new();
        let mut offset = None;
        loop {
            let (page, next) = index.scroll(offset, 3).await.unwrap();
            for (id, _) in page {
                assert!(seen.insert(id));
            }
            match next {
                Some(n) => offset = Some(n),
                None => break,
            }
        }
        assert_eq!(seen.len(), 7);
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = [0.3_f32, 0.4, 0.5];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }
}
