//! # ragpipe
//!
//! A retrieval-augmented document service: upload documents to an
//! asynchronous ingestion pipeline, then ask questions answered from the
//! indexed content with source attribution.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────────┐
//! │  Upload  │──▶│ Blob storage │   │  Task queue   │
//! │ (HTTP)   │   │    (S3)      │──▶│    (SQS)      │
//! └──────────┘   └──────────────┘   └──────┬────────┘
//!                                          │
//!                                          ▼
//!                  ┌──────────────────────────────────┐
//!                  │ Worker: extract → chunk → embed  │
//!                  │        → dedup → upsert          │
//!                  └──────────────┬───────────────────┘
//!                                 ▼
//! ┌──────────┐   ┌──────────────────────┐   ┌───────────┐
//! │  Query   │──▶│ Vector index (Qdrant)│──▶│ Generator │
//! │ (HTTP)   │   │  embed + search      │   │  (LLM)    │
//! └──────────┘   └──────────────────────┘   └───────────┘
//! ```
//!
//! Ingestion is asynchronous and at-least-once: the upload endpoint only
//! validates, stores, and enqueues; the worker does everything heavy and
//! can be redelivered the same task safely because record identity is a
//! fingerprint of (document id, chunk text). The query path is synchronous
//! and fails fast.
//!
//! ## Quick Start
//!
//! ```bash
//! ragpipe serve                       # HTTP front end (upload + query)
//! ragpipe worker                      # ingestion consumer
//! ragpipe ingest ./notes/handbook.pdf # upload from the CLI
//! ragpipe query "What is our refund policy?"
//! ragpipe cleanup                     # delete orphaned vector records
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`chunk`] | Offset-preserving text chunking and fingerprints |
//! | [`extract`] | PDF / plain text / OOXML text extraction |
//! | [`storage`] | Blob storage (S3 + in-memory) |
//! | [`queue`] | Task queue (SQS + in-memory) |
//! | [`vector_index`] | Vector index (Qdrant + in-memory) |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`generate`] | Answer generation |
//! | [`dedup`] | Fingerprint-based ingestion dedup |
//! | [`worker`] | Ingestion consumer loop |
//! | [`retrieve`] | Retrieval engine and query pipeline |
//! | [`server`] | HTTP API |
//! | [`cleanup`] | Orphaned-record reconciliation |
//! | [`aws`] | SigV4 request signing |
//! | [`error`] | Pipeline error taxonomy |

pub mod aws;
pub mod chunk;
pub mod cleanup;
pub mod config;
pub mod dedup;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generate;
pub mod models;
pub mod queue;
pub mod retrieve;
pub mod server;
pub mod storage;
pub mod vector_index;
pub mod worker;
