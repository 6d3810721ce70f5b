//! Ingestion dedup.
//!
//! Record ids are a deterministic function of (document id, normalized
//! chunk text), so "is this chunk already indexed" is a membership
//! question. The dedup index answers it with one batched probe against
//! the vector index, backed by an in-process seen-set so a worker never
//! asks about the same id twice in its lifetime.
//!
//! Policy on a fingerprint match is overwrite, never version: a chunk
//! whose id is unseen gets (re)upserted, and the upsert replaces any
//! point already stored under that id.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::vector_index::{IndexError, VectorIndex};

pub struct DedupIndex {
    index: Arc<dyn VectorIndex>,
    seen: Mutex<HashSet<Uuid>>,
}

impl DedupIndex {
    pub fn new(index: Arc<dyn VectorIndex>) -> Self {
        Self {
            index,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Partition `ids` into those that still need indexing. The result is
    /// index-aligned with the input: `true` means "index this one".
    pub async fn should_index(&self, ids: &[Uuid]) -> Result<Vec<bool>, IndexError> {
        let unknown: Vec<Uuid> = {
            let seen = self.seen.lock().unwrap();
            ids.iter().copied().filter(|id| !seen.contains(id)).collect()
        };

        let present = if unknown.is_empty() {
            HashSet::new()
        } else {
            self.index.existing(&unknown).await?
        };

        let mut seen = self.seen.lock().unwrap();
        seen.extend(present.iter().copied());

        Ok(ids.iter().map(|id| !seen.contains(id)).collect())
    }

    /// Record that `ids` were just upserted, so later tasks in this
    /// worker's lifetime skip them without a probe.
    pub fn mark_indexed(&self, ids: &[Uuid]) {
        self.seen.lock().unwrap().extend(ids.iter().copied());
    }
}
