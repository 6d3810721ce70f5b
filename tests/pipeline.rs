//! End-to-end pipeline tests over the in-memory adapters: upload-shaped
//! ingestion through the worker, then retrieval-augmented queries.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use ragpipe::cleanup::run_cleanup;
use ragpipe::config::{ChunkingConfig, RetrievalConfig, WorkerConfig};
use ragpipe::embedding::FakeEmbedder;
use ragpipe::generate::{FakeGenerator, INSUFFICIENT_CONTEXT_ANSWER};
use ragpipe::models::{Document, IngestionTask, QueryRequest};
use ragpipe::queue::{MemoryQueue, TaskQueue};
use ragpipe::retrieve::QueryService;
use ragpipe::storage::{storage_key, MemoryStorage, Storage};
use ragpipe::vector_index::MemoryIndex;
use ragpipe::worker::Worker;

struct Rig {
    storage: Arc<MemoryStorage>,
    queue: Arc<MemoryQueue>,
    index: Arc<MemoryIndex>,
    generator: Arc<FakeGenerator>,
    worker: Worker,
    query: QueryService,
}

fn rig_with_generator(generator: FakeGenerator) -> Rig {
    let storage = Arc::new(MemoryStorage::new());
    let queue = Arc::new(MemoryQueue::with_visibility(Duration::ZERO));
    let index = Arc::new(MemoryIndex::new());
    let embedder = Arc::new(FakeEmbedder::new(64));
    let generator = Arc::new(generator);

    let worker = Worker::new(
        storage.clone(),
        queue.clone(),
        embedder.clone(),
        index.clone(),
        WorkerConfig {
            max_attempts: 3,
            poll_interval_secs: 0,
            retry_backoff_secs: 0,
        },
        ChunkingConfig {
            max_chars: 200,
            overlap_chars: 20,
        },
    );
    let query = QueryService::new(
        embedder,
        index.clone(),
        generator.clone(),
        RetrievalConfig::default(),
    );

    Rig {
        storage,
        queue,
        index,
        generator,
        worker,
        query,
    }
}

fn rig() -> Rig {
    rig_with_generator(FakeGenerator::with_reply(
        "Paris is the capital of France, per the provided documents.",
    ))
}

/// Upload-shaped ingestion: store the bytes, then enqueue the task, the
/// same side-effect order the HTTP upload path uses.
async fn upload(rig: &Rig, filename: &str, text: &str) -> Document {
    let id = Uuid::new_v4();
    let key = storage_key("uploads", id, filename);
    rig.storage
        .put(&key, text.as_bytes().to_vec(), "text/plain")
        .await
        .unwrap();
    let document = Document {
        id,
        filename: filename.to_string(),
        media_type: "text/plain".to_string(),
        size_bytes: text.len() as u64,
        storage_key: key,
    };
    rig.queue
        .enqueue(&IngestionTask::new(document.clone()))
        .await
        .unwrap();
    document
}

async fn drain(rig: &Rig) {
    while rig.worker.run_once().await.unwrap() {}
}

fn question(query: &str) -> QueryRequest {
    QueryRequest {
        query: query.to_string(),
        max_results: 5,
        include_sources: true,
    }
}

#[tokio::test]
async fn ingested_document_answers_a_related_question_with_sources() {
    let rig = rig();
    upload(
        &rig,
        "geography.txt",
        "Paris is the capital of France. It sits on the Seine river.",
    )
    .await;
    drain(&rig).await;

    let answer = rig
        .query
        .answer(&question("What is the capital of France?"))
        .await
        .unwrap();

    assert!(answer.answer.contains("Paris"));
    assert!(!answer.sources.is_empty());
    assert_eq!(answer.sources[0].filename, "geography.txt");
    assert!(answer.sources[0].score > 0.25);
    assert!(answer.processing_time >= 0.0);

    // The supporting chunk text reached the model.
    let prompt = rig.generator.last_prompt().unwrap();
    assert!(prompt.contains("capital of France"));
}

#[tokio::test]
async fn query_before_any_ingestion_says_context_is_insufficient() {
    let rig = rig_with_generator(FakeGenerator::failing());
    let answer = rig
        .query
        .answer(&question("What is the capital of France?"))
        .await
        .unwrap();

    assert_eq!(answer.answer, INSUFFICIENT_CONTEXT_ANSWER);
    assert!(answer.sources.is_empty());
    // The scripted-to-fail generator was never invoked.
    assert!(rig.generator.last_prompt().is_none());
}

#[tokio::test]
async fn reingesting_the_same_document_does_not_duplicate_records() {
    let rig = rig();
    let document = upload(&rig, "notes.txt", "Same content every time.").await;
    drain(&rig).await;
    let after_first = rig.index.len();
    assert!(after_first > 0);

    rig.queue
        .enqueue(&IngestionTask::new(document))
        .await
        .unwrap();
    drain(&rig).await;

    assert_eq!(rig.index.len(), after_first);
}

#[tokio::test]
async fn identical_text_in_different_documents_stays_distinct() {
    let rig = rig();
    let text = "Shared boilerplate paragraph used by many documents.";
    upload(&rig, "one.txt", text).await;
    upload(&rig, "two.txt", text).await;
    drain(&rig).await;

    // Record identity is scoped by document id, so the collision across
    // documents must not merge them.
    assert_eq!(rig.index.len(), 2);

    let result = rig.query.retrieve(text, 5).await.unwrap();
    let mut files: Vec<&str> = result
        .hits
        .iter()
        .map(|h| h.payload.filename.as_str())
        .collect();
    files.sort();
    assert_eq!(files, vec!["one.txt", "two.txt"]);
}

#[tokio::test]
async fn task_lost_mid_processing_is_redelivered_and_completed() {
    let rig = rig();
    upload(&rig, "crashy.txt", "Content that survives a worker crash.").await;

    // Simulate a crash: the delivery is received and then dropped without
    // ever being acked or nacked.
    let lost = rig.queue.receive().await.unwrap().unwrap();
    drop(lost);

    drain(&rig).await;
    assert_eq!(rig.index.len(), 1);
    assert_eq!(rig.queue.depth(), 0);
}

#[tokio::test]
async fn include_sources_false_still_answers() {
    let rig = rig();
    upload(&rig, "geo.txt", "Paris is the capital of France.").await;
    drain(&rig).await;

    let mut request = question("capital of France?");
    request.include_sources = false;
    let answer = rig.query.answer(&request).await.unwrap();

    assert!(answer.answer.contains("Paris"));
    assert!(answer.sources.is_empty());
}

#[tokio::test]
async fn cleanup_removes_records_of_deleted_blobs() {
    let rig = rig();
    let keep = upload(&rig, "keep.txt", "This document stays available.").await;
    let gone = upload(&rig, "gone.txt", "This document will be deleted.").await;
    drain(&rig).await;
    assert_eq!(rig.index.len(), 2);

    rig.storage.remove(&gone.storage_key);
    let report = run_cleanup(rig.storage.as_ref(), rig.index.as_ref())
        .await
        .unwrap();

    assert_eq!(report.orphaned_documents, 1);
    assert_eq!(report.deleted_records, 1);
    assert_eq!(rig.index.len(), 1);

    let result = rig
        .query
        .retrieve("document stays available", 5)
        .await
        .unwrap();
    assert!(result
        .hits
        .iter()
        .all(|h| h.payload.document_id == keep.id));
}

#[tokio::test]
async fn whitespace_only_document_completes_without_index_writes() {
    let rig = rig();
    upload(&rig, "blank.txt", "  \n\n \t ").await;
    drain(&rig).await;

    assert_eq!(rig.queue.depth(), 0);
    assert!(rig.index.is_empty());
}
