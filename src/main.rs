//! # ragpipe CLI
//!
//! The `ragpipe` binary runs the service processes and offers one-shot
//! commands for operators.
//!
//! ## Usage
//!
//! ```bash
//! ragpipe --config ./config/ragpipe.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragpipe serve` | Start the HTTP front end (upload + query + health) |
//! | `ragpipe worker` | Run the long-lived ingestion consumer loop |
//! | `ragpipe ingest <file>` | Upload a local file into the ingestion pipeline |
//! | `ragpipe query "<question>"` | One-shot retrieval-augmented query |
//! | `ragpipe cleanup` | Delete vector records whose source blob is gone |
//!
//! Credentials come from the environment: `AWS_ACCESS_KEY_ID`,
//! `AWS_SECRET_ACCESS_KEY` (and optionally `AWS_SESSION_TOKEN`) for
//! storage and queue, `OPENAI_API_KEY` for embeddings and generation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use ragpipe::cleanup::run_cleanup;
use ragpipe::config::{self, Config};
use ragpipe::embedding::{Embedder, OpenAiEmbedder};
use ragpipe::extract;
use ragpipe::generate::{Generator, OpenAiGenerator};
use ragpipe::models::{Document, IngestionTask, QueryRequest};
use ragpipe::queue::{SqsQueue, TaskQueue};
use ragpipe::retrieve::QueryService;
use ragpipe::server::{self, AppState};
use ragpipe::storage::{self, S3Storage, Storage};
use ragpipe::vector_index::{QdrantIndex, VectorIndex};
use ragpipe::worker::Worker;

/// ragpipe — a retrieval-augmented document service.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ragpipe.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ragpipe",
    about = "Retrieval-augmented document service: async ingestion and grounded question answering",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragpipe.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP front end.
    ///
    /// Binds to `[server].bind` and serves `POST /ingest`, `POST /query`,
    /// `GET /health`, and `GET /health/detailed`. Uploads are accepted and
    /// enqueued; run `ragpipe worker` alongside to process them.
    Serve,

    /// Run the ingestion worker.
    ///
    /// Polls the task queue forever: fetches uploaded documents from blob
    /// storage, extracts text, chunks, embeds, and upserts into the vector
    /// index. Safe to run in multiple instances.
    Worker,

    /// Upload a local file into the ingestion pipeline.
    ///
    /// Writes the file to blob storage and enqueues an ingestion task, the
    /// same path an HTTP upload takes. The document becomes searchable
    /// once a worker has processed it.
    Ingest {
        /// File to upload (.pdf, .txt, .md, .docx, .doc).
        file: PathBuf,
    },

    /// Ask a question against the indexed documents.
    ///
    /// Embeds the question, retrieves the best-matching chunks, and prints
    /// a generated answer with its sources.
    Query {
        /// The question to answer.
        query: String,

        /// Maximum number of supporting chunks to retrieve (1–20).
        #[arg(long, default_value_t = 5)]
        max_results: usize,

        /// Omit the source list from the output.
        #[arg(long)]
        no_sources: bool,
    },

    /// Delete vector records whose source document no longer exists.
    ///
    /// Scans the whole index, checks each referenced blob, and removes the
    /// records of blobs that are gone. Run after deleting documents from
    /// storage out of band.
    Cleanup,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ragpipe=info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            let state = build_app_state(&cfg)?;
            state
                .index
                .ensure_ready()
                .await
                .context("preparing vector collection")?;
            server::serve(state).await?;
        }
        Commands::Worker => {
            let storage: Arc<dyn Storage> = Arc::new(S3Storage::new(&cfg.storage)?);
            let queue: Arc<dyn TaskQueue> = Arc::new(SqsQueue::new(&cfg.queue)?);
            let index: Arc<dyn VectorIndex> = Arc::new(QdrantIndex::new(&cfg.vector)?);
            let embedder: Arc<dyn Embedder> = Arc::new(OpenAiEmbedder::new(
                &cfg.embedding,
                cfg.vector.dims,
                cfg.embedding.max_retries,
            )?);
            index
                .ensure_ready()
                .await
                .context("preparing vector collection")?;
            Worker::new(
                storage,
                queue,
                embedder,
                index,
                cfg.worker.clone(),
                cfg.chunking.clone(),
            )
            .run()
            .await
        }
        Commands::Ingest { file } => {
            ingest_file(&cfg, &file).await?;
        }
        Commands::Query {
            query,
            max_results,
            no_sources,
        } => {
            run_query(&cfg, query, max_results, !no_sources).await?;
        }
        Commands::Cleanup => {
            let storage = S3Storage::new(&cfg.storage)?;
            let index = QdrantIndex::new(&cfg.vector)?;
            let report = run_cleanup(&storage, &index).await?;
            println!(
                "Scanned {} records across {} documents: removed {} orphaned records ({} documents).",
                report.scanned_records,
                report.checked_documents,
                report.deleted_records,
                report.orphaned_documents
            );
        }
    }

    Ok(())
}

/// Wire production adapters into the HTTP server's shared state. The
/// query-path embedder and generator carry no retry budget; the worker
/// process builds its own retrying embedder.
fn build_app_state(cfg: &Config) -> anyhow::Result<Arc<AppState>> {
    let config = Arc::new(cfg.clone());
    let storage: Arc<dyn Storage> = Arc::new(S3Storage::new(&cfg.storage)?);
    let queue: Arc<dyn TaskQueue> = Arc::new(SqsQueue::new(&cfg.queue)?);
    let index: Arc<dyn VectorIndex> = Arc::new(QdrantIndex::new(&cfg.vector)?);
    let embedder: Arc<dyn Embedder> =
        Arc::new(OpenAiEmbedder::new(&cfg.embedding, cfg.vector.dims, 0)?);
    let generator: Arc<dyn Generator> = Arc::new(OpenAiGenerator::new(&cfg.generation)?);

    let query = QueryService::new(
        embedder.clone(),
        index.clone(),
        generator.clone(),
        cfg.retrieval.clone(),
    );

    Ok(Arc::new(AppState {
        config,
        storage,
        queue,
        index,
        embedder,
        generator,
        query,
    }))
}

/// The CLI upload path: same validation and side-effect order as
/// `POST /ingest`.
async fn ingest_file(cfg: &Config, file: &Path) -> anyhow::Result<()> {
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .context("file path has no usable filename")?
        .to_string();
    let extension = filename.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    let Some(media_type) = extract::media_type_for_extension(extension) else {
        bail!(
            "unsupported file type '{}'; accepted: .pdf .txt .md .docx .doc",
            filename
        );
    };

    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    if bytes.len() as u64 > cfg.server.max_upload_bytes {
        bail!(
            "file is {} bytes, limit is {}",
            bytes.len(),
            cfg.server.max_upload_bytes
        );
    }

    let storage = S3Storage::new(&cfg.storage)?;
    let queue = SqsQueue::new(&cfg.queue)?;

    let document_id = Uuid::new_v4();
    let key = storage::storage_key(&cfg.storage.key_prefix, document_id, &filename);
    let size_bytes = bytes.len() as u64;
    let storage_key = storage.put(&key, bytes, media_type).await?;

    queue
        .enqueue(&IngestionTask::new(Document {
            id: document_id,
            filename: filename.clone(),
            media_type: media_type.to_string(),
            size_bytes,
            storage_key,
        }))
        .await?;

    println!("Enqueued {} ({} bytes) as document {}.", filename, size_bytes, document_id);
    Ok(())
}

async fn run_query(
    cfg: &Config,
    query: String,
    max_results: usize,
    include_sources: bool,
) -> anyhow::Result<()> {
    let index: Arc<dyn VectorIndex> = Arc::new(QdrantIndex::new(&cfg.vector)?);
    let embedder: Arc<dyn Embedder> =
        Arc::new(OpenAiEmbedder::new(&cfg.embedding, cfg.vector.dims, 0)?);
    let generator: Arc<dyn Generator> = Arc::new(OpenAiGenerator::new(&cfg.generation)?);
    let service = QueryService::new(embedder, index, generator, cfg.retrieval.clone());

    let answer = service
        .answer(&QueryRequest {
            query,
            max_results,
            include_sources,
        })
        .await?;

    println!("{}", answer.answer);
    if !answer.sources.is_empty() {
        println!();
        println!("Sources:");
        for (i, source) in answer.sources.iter().enumerate() {
            println!("  {}. {} (score {:.3})", i + 1, source.filename, source.score);
        }
    }
    println!();
    println!("({:.2}s)", answer.processing_time);
    Ok(())
}
