//! Ingestion worker: the long-lived consumer behind the upload path.
//!
//! Each task moves through extract, chunk, embed, index, and is only
//! acked once every fresh chunk is durably upserted. Failures split two
//! ways: transient ones nack the task so the queue redelivers it (with
//! exponential backoff via the visibility timeout), permanent ones ack it
//! as poison so it cannot wedge the queue. After `max_attempts`
//! deliveries a still-failing task is dead-lettered the same way.
//!
//! Record ids are fingerprint-derived and upserts overwrite, so redoing a
//! partially-indexed task is safe; several workers can drain one queue.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{ChunkingConfig, WorkerConfig};
use crate::chunk;
use crate::dedup::DedupIndex;
use crate::embedding::Embedder;
use crate::error::PipelineError;
use crate::extract;
use crate::models::{IngestionTask, RecordPayload, VectorRecord};
use crate::queue::{Delivery, TaskQueue};
use crate::storage::Storage;
use crate::vector_index::VectorIndex;

/// What processing one task amounted to. Purely informational; the
/// settlement decision is made by [`Worker::settle`].
#[derive(Debug, PartialEq, Eq)]
pub struct TaskOutcome {
    pub chunks: usize,
    pub indexed: usize,
    pub skipped: usize,
}

pub struct Worker {
    storage: Arc<dyn Storage>,
    queue: Arc<dyn TaskQueue>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    dedup: DedupIndex,
    worker_config: WorkerConfig,
    chunking: ChunkingConfig,
}

impl Worker {
    pub fn new(
        storage: Arc<dyn Storage>,
        queue: Arc<dyn TaskQueue>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        worker_config: WorkerConfig,
        chunking: ChunkingConfig,
    ) -> Self {
        let dedup = DedupIndex::new(index.clone());
        Self {
            storage,
            queue,
            embedder,
            index,
            dedup,
            worker_config,
            chunking,
        }
    }

    /// Consume forever. Individual task failures are settled and logged;
    /// only queue-receive errors pause the loop, and only briefly.
    pub async fn run(&self) -> ! {
        tracing::info!("worker started");
        loop {
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::time::sleep(Duration::from_secs(self.worker_config.poll_interval_secs))
                        .await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "queue receive failed, backing off");
                    tokio::time::sleep(Duration::from_secs(self.worker_config.poll_interval_secs))
                        .await;
                }
            }
        }
    }

    /// One poll: receive at most one task and settle it. Returns whether
    /// a task was handled.
    pub async fn run_once(&self) -> Result<bool, crate::queue::QueueError> {
        let Some(delivery) = self.queue.receive().await? else {
            return Ok(false);
        };
        self.settle(delivery).await;
        Ok(true)
    }

    async fn settle(&self, delivery: Delivery) {
        let document_id = delivery.task.document.id;
        let filename = delivery.task.document.filename.clone();

        match self.process(&delivery.task).await {
            Ok(outcome) => {
                tracing::info!(
                    %document_id,
                    filename = %filename,
                    chunks = outcome.chunks,
                    indexed = outcome.indexed,
                    skipped = outcome.skipped,
                    "document ingested"
                );
                if let Err(e) = self.queue.ack(&delivery.handle).await {
                    // The work is done and idempotent; redelivery will be
                    // absorbed by dedup.
                    tracing::warn!(%document_id, error = %e, "ack failed after success");
                }
            }
            Err(e) if e.is_retryable() && delivery.receive_count < self.worker_config.max_attempts => {
                let delay = self.backoff_secs(delivery.receive_count);
                tracing::warn!(
                    %document_id,
                    attempt = delivery.receive_count,
                    delay_secs = delay,
                    error = %e,
                    "ingestion failed, scheduling redelivery"
                );
                if let Err(e) = self.queue.nack(&delivery.handle, delay).await {
                    tracing::warn!(%document_id, error = %e, "nack failed; visibility timeout will redeliver");
                }
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        %document_id,
                        filename = %filename,
                        attempts = delivery.receive_count,
                        error = %e,
                        "ingestion exhausted its attempts, dead-lettering"
                    );
                } else {
                    tracing::error!(
                        %document_id,
                        filename = %filename,
                        error = %e,
                        "ingestion failed permanently, dropping task"
                    );
                }
                if let Err(e) = self.queue.ack(&delivery.handle).await {
                    tracing::warn!(%document_id, error = %e, "ack failed while dropping task");
                }
            }
        }
    }

    fn backoff_secs(&self, receive_count: u32) -> u64 {
        let exp = receive_count.saturating_sub(1).min(6);
        self.worker_config.retry_backoff_secs.saturating_mul(1 << exp)
    }

    /// Run one task through the pipeline. Pure with respect to the queue;
    /// settlement is the caller's job.
    pub async fn process(&self, task: &IngestionTask) -> Result<TaskOutcome, PipelineError> {
        let document = &task.document;
        tracing::debug!(document_id = %document.id, "fetching document");
        let bytes = self.storage.get(&document.storage_key).await?;

        tracing::debug!(document_id = %document.id, media_type = %document.media_type, "extracting text");
        let text = extract::extract_text(&bytes, &document.media_type)
            .map_err(|e| PipelineError::permanent("extract", e.to_string()))?;

        let chunks = chunk::chunk_text(
            document.id,
            &text,
            self.chunking.max_chars,
            self.chunking.overlap_chars,
        );
        if chunks.is_empty() {
            tracing::info!(document_id = %document.id, "document contains no extractable text");
            return Ok(TaskOutcome {
                chunks: 0,
                indexed: 0,
                skipped: 0,
            });
        }

        let record_ids: Vec<_> = chunks.iter().map(|c| c.record_id).collect();
        let fresh_mask = self.dedup.should_index(&record_ids).await?;
        let fresh: Vec<_> = chunks
            .iter()
            .zip(&fresh_mask)
            .filter(|(_, keep)| **keep)
            .map(|(c, _)| c)
            .collect();
        let skipped = chunks.len() - fresh.len();

        if fresh.is_empty() {
            return Ok(TaskOutcome {
                chunks: chunks.len(),
                indexed: 0,
                skipped,
            });
        }

        tracing::debug!(document_id = %document.id, count = fresh.len(), "embedding chunks");
        let texts: Vec<String> = fresh.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        if vectors.len() != fresh.len() {
            return Err(PipelineError::transient(
                "embedder",
                format!("expected {} vectors, got {}", fresh.len(), vectors.len()),
            ));
        }

        let records: Vec<VectorRecord> = fresh
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorRecord {
                id: chunk.record_id,
                vector,
                payload: RecordPayload {
                    filename: document.filename.clone(),
                    document_id: document.id,
                    chunk_index: chunk.ordinal,
                    text: chunk.text.clone(),
                    storage_key: document.storage_key.clone(),
                },
            })
            .collect();

        tracing::debug!(document_id = %document.id, count = records.len(), "upserting records");
        self.index.upsert(&records).await?;
        self.dedup
            .mark_indexed(&records.iter().map(|r| r.id).collect::<Vec<_>>());

        Ok(TaskOutcome {
            chunks: chunks.len(),
            indexed: records.len(),
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, WorkerConfig};
    use crate::embedding::{EmbedError, FakeEmbedder};
    use crate::models::Document;
    use crate::queue::MemoryQueue;
    use crate::storage::MemoryStorage;
    use crate::vector_index::MemoryIndex;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Times out for the first `failures` calls, then delegates.
    struct FlakyEmbedder {
        inner: FakeEmbedder,
        failures_left: Mutex<u32>,
    }

    impl FlakyEmbedder {
        fn new(dims: usize, failures: u32) -> Self {
            Self {
                inner: FakeEmbedder::new(dims),
                failures_left: Mutex::new(failures),
            }
        }
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            {
                let mut left = self.failures_left.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(EmbedError::Timeout);
                }
            }
            self.inner.embed(texts).await
        }

        fn dims(&self) -> usize {
            self.inner.dims()
        }

        async fn ping(&self) -> bool {
            true
        }
    }

    struct Fixture {
        storage: Arc<MemoryStorage>,
        queue: Arc<MemoryQueue>,
        index: Arc<MemoryIndex>,
        worker: Worker,
    }

    fn fixture() -> Fixture {
        fixture_with_embedder(Arc::new(FakeEmbedder::new(32)))
    }

    fn fixture_with_embedder(embedder: Arc<dyn Embedder>) -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let queue = Arc::new(MemoryQueue::with_visibility(Duration::ZERO));
        let index = Arc::new(MemoryIndex::new());
        let worker = Worker::new(
            storage.clone(),
            queue.clone(),
            embedder,
            index.clone(),
            WorkerConfig {
                max_attempts: 3,
                poll_interval_secs: 0,
                retry_backoff_secs: 0,
            },
            ChunkingConfig {
                max_chars: 100,
                overlap_chars: 10,
            },
        );
        Fixture {
            storage,
            queue,
            index,
            worker,
        }
    }

    async fn enqueue_text(f: &Fixture, text: &str) -> Document {
        let id = Uuid::new_v4();
        let key = format!("uploads/{}/note.txt", id);
        f.storage
            .put(&key, text.as_bytes().to_vec(), "text/plain")
            .await
            .unwrap();
        let document = Document {
            id,
            filename: "note.txt".to_string(),
            media_type: "text/plain".to_string(),
            size_bytes: text.len() as u64,
            storage_key: key,
        };
        f.queue
            .enqueue(&IngestionTask::new(document.clone()))
            .await
            .unwrap();
        document
    }

    #[tokio::test]
    async fn successful_task_is_indexed_and_acked() {
        let f = fixture();
        enqueue_text(&f, "Paris is the capital of France.").await;

        assert!(f.worker.run_once().await.unwrap());
        assert_eq!(f.queue.depth(), 0);
        assert_eq!(f.index.len(), 1);
    }

    #[tokio::test]
    async fn empty_document_acks_without_indexing() {
        let f = fixture();
        enqueue_text(&f, "   \n\n  ").await;

        assert!(f.worker.run_once().await.unwrap());
        assert_eq!(f.queue.depth(), 0);
        assert!(f.index.is_empty());
    }

    #[tokio::test]
    async fn document_with_leading_blank_lines_is_indexed() {
        let f = fixture();
        enqueue_text(&f, &format!("\n\n{}", "x".repeat(99))).await;

        assert!(f.worker.run_once().await.unwrap());
        assert_eq!(f.queue.depth(), 0);
        assert_eq!(f.index.len(), 1);
    }

    #[tokio::test]
    async fn transient_embed_failure_is_redelivered_then_indexed() {
        let f = fixture_with_embedder(Arc::new(FlakyEmbedder::new(32, 1)));
        enqueue_text(&f, "Paris is the capital of France.").await;

        // First delivery times out and is nacked back to the queue.
        assert!(f.worker.run_once().await.unwrap());
        assert_eq!(f.queue.depth(), 1);
        assert!(f.index.is_empty());

        // The redelivery succeeds and settles the task.
        assert!(f.worker.run_once().await.unwrap());
        assert_eq!(f.queue.depth(), 0);
        assert_eq!(f.index.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_the_task() {
        let f = fixture_with_embedder(Arc::new(FlakyEmbedder::new(32, u32::MAX)));
        enqueue_text(&f, "Paris is the capital of France.").await;

        // max_attempts is 3: two nacks, then the third delivery is acked
        // as dead-lettered.
        for _ in 0..3 {
            assert!(f.worker.run_once().await.unwrap());
        }
        assert_eq!(f.queue.depth(), 0);
        assert!(f.index.is_empty());
    }

    #[tokio::test]
    async fn missing_blob_is_poison_not_retried() {
        let f = fixture();
        let document = enqueue_text(&f, "some text").await;
        f.storage.remove(&document.storage_key);

        assert!(f.worker.run_once().await.unwrap());
        // Acked despite the failure: a vanished blob can never be fetched.
        assert_eq!(f.queue.depth(), 0);
        assert!(f.index.is_empty());
    }

    #[tokio::test]
    async fn corrupt_content_is_poison() {
        let f = fixture();
        let id = Uuid::new_v4();
        let key = format!("uploads/{}/broken.docx", id);
        f.storage
            .put(&key, b"this is not a zip archive".to_vec(), "application/x")
            .await
            .unwrap();
        f.queue
            .enqueue(&IngestionTask::new(Document {
                id,
                filename: "broken.docx".to_string(),
                media_type:
                    "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
                        .to_string(),
                size_bytes: 25,
                storage_key: key,
            }))
            .await
            .unwrap();

        assert!(f.worker.run_once().await.unwrap());
        assert_eq!(f.queue.depth(), 0);
        assert!(f.index.is_empty());
    }

    #[tokio::test]
    async fn reprocessing_is_idempotent() {
        let f = fixture();
        let document = enqueue_text(&f, "Paris is the capital of France.").await;
        assert!(f.worker.run_once().await.unwrap());
        let after_first = f.index.len();

        // Same document delivered again, as after a crash-and-redeliver.
        f.queue
            .enqueue(&IngestionTask::new(document))
            .await
            .unwrap();
        assert!(f.worker.run_once().await.unwrap());

        assert_eq!(f.index.len(), after_first);
        assert_eq!(f.queue.depth(), 0);
    }

    #[tokio::test]
    async fn outcome_reports_skipped_chunks() {
        let f = fixture();
        let document = enqueue_text(&f, "Paris is the capital of France.").await;
        let delivery = f.queue.receive().await.unwrap().unwrap();
        let first = f.worker.process(&delivery.task).await.unwrap();
        assert_eq!(first.indexed, first.chunks);
        f.queue.ack(&delivery.handle).await.unwrap();

        let second = f
            .worker
            .process(&IngestionTask::new(document))
            .await
            .unwrap();
        assert_eq!(second.indexed, 0);
        assert_eq!(second.skipped, second.chunks);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut w = fixture().worker;
        w.worker_config.retry_backoff_secs = 2;
        assert_eq!(w.backoff_secs(1), 2);
        assert_eq!(w.backoff_secs(2), 4);
        assert_eq!(w.backoff_secs(4), 16);
        assert_eq!(w.backoff_secs(100), 128);
    }
}
