//! Retrieval engine and query pipeline.
//!
//! `retrieve` turns a question into a ranked, per-document-capped set of
//! chunks; `answer` runs the whole query pipeline (embed, search, rank,
//! assemble context, generate) and produces an [`Answer`].
//!
//! The query path fails fast: the embedder and generator it is built with
//! carry no retry budget, and the only retry anywhere is a single
//! immediate re-issue of the idempotent vector search on a retryable
//! index error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::error::PipelineError;
use crate::generate::{self, Generator};
use crate::models::{Answer, QueryRequest, RetrievalResult, ScoredHit, SourceRef};
use crate::vector_index::VectorIndex;

pub const MAX_RESULTS_LIMIT: usize = 20;

pub struct QueryService {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    generator: Arc<dyn Generator>,
    config: RetrievalConfig,
}

impl QueryService {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        generator: Arc<dyn Generator>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            generator,
            config,
        }
    }

    /// Embed the query and return the top `k` chunks after score-floor
    /// filtering and per-document capping.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<RetrievalResult, PipelineError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(PipelineError::Validation("query must not be empty".into()));
        }

        let vectors = self.embedder.embed(&[query.to_string()]).await?;
        let vector = vectors
            .first()
            .ok_or_else(|| PipelineError::transient("embedder", "no vector returned"))?;

        let candidate_k = self.config.candidate_k.max(k);
        let hits = match self.index.search(vector, candidate_k).await {
            Ok(hits) => hits,
            // The search is read-only and idempotent; one immediate retry
            // covers a blip without stalling the request.
            Err(e) if e.is_retryable() => {
                tracing::debug!(error = %e, "vector search failed once, retrying");
                self.index.search(vector, candidate_k).await?
            }
            Err(e) => return Err(e.into()),
        };

        Ok(RetrievalResult {
            hits: rank(hits, self.config.score_floor, self.config.max_chunks_per_doc, k),
        })
    }

    /// Run the full query pipeline for one request.
    pub async fn answer(&self, request: &QueryRequest) -> Result<Answer, PipelineError> {
        if request.max_results < 1 || request.max_results > MAX_RESULTS_LIMIT {
            return Err(PipelineError::Validation(format!(
                "max_results must be between 1 and {}",
                MAX_RESULTS_LIMIT
            )));
        }

        let started = Instant::now();
        let query = request.query.trim().to_string();
        let retrieval = self.retrieve(&query, request.max_results).await?;

        let answer_text = if retrieval.is_empty() {
            generate::answer_question(self.generator.as_ref(), &query, None).await?
        } else {
            let context = assemble_context(&retrieval, self.config.context_budget_chars);
            generate::answer_question(self.generator.as_ref(), &query, Some(&context)).await?
        };

        let sources = if request.include_sources {
            retrieval.hits.iter().map(SourceRef::from_hit).collect()
        } else {
            Vec::new()
        };

        Ok(Answer {
            query,
            answer: answer_text,
            sources,
            processing_time: started.elapsed().as_secs_f64(),
        })
    }
}

/// Rank raw search hits: drop those under the score floor, order by score
/// descending with deterministic tie-breaks (chunk ordinal, then document
/// id), cap hits per source document, and keep the top `k`.
fn rank(
    hits: Vec<ScoredHit>,
    score_floor: f32,
    max_chunks_per_doc: usize,
    k: usize,
) -> Vec<ScoredHit> {
    let mut hits: Vec<ScoredHit> = hits.into_iter().filter(|h| h.score >= score_floor).collect();
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.payload.chunk_index.cmp(&b.payload.chunk_index))
            .then_with(|| a.payload.document_id.cmp(&b.payload.document_id))
    });

    let mut per_doc: HashMap<Uuid, usize> = HashMap::new();
    hits.retain(|h| {
        let count = per_doc.entry(h.payload.document_id).or_insert(0);
        *count += 1;
        *count <= max_chunks_per_doc
    });

    hits.truncate(k);
    hits
}

/// Concatenate chunk texts in ranked order, separated by blank lines, up
/// to `budget_chars` characters. The chunk that crosses the budget is
/// truncated at a character boundary rather than dropped.
pub fn assemble_context(retrieval: &RetrievalResult, budget_chars: usize) -> String {
    let mut out = String::new();
    let mut remaining = budget_chars;

    for hit in &retrieval.hits {
        if !out.is_empty() {
            if remaining < 2 {
                break;
            }
            out.push_str("\n\n");
            remaining -= 2;
        }
        if remaining == 0 {
            break;
        }

        let text = &hit.payload.text;
        let len = text.chars().count();
        if len <= remaining {
            out.push_str(text);
            remaining -= len;
        } else {
            out.extend(text.chars().take(remaining));
            break;
        }
    }
    out
}
