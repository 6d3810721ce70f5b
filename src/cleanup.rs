//! Orphan cleanup: remove vector records whose source blob is gone.
//!
//! Upload writes the blob before the task, and the worker only ever
//! indexes what it fetched, so in normal operation every record's
//! `storage_key` resolves. Records go stale when an operator deletes
//! blobs out of band; this pass reconciles the index back to storage.
//! Operator-invoked (`ragpipe cleanup`), never scheduled.

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::PipelineError;
use crate::storage::Storage;
use crate::vector_index::VectorIndex;

const SCROLL_PAGE: usize = 256;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub scanned_records: usize,
    pub checked_documents: usize,
    pub orphaned_documents: usize,
    pub deleted_records: usize,
}

/// Scan every indexed record, group by source blob, and delete the
/// records of blobs that no longer exist. Storage errors abort the pass;
/// a blob we cannot check is not a blob we may treat as gone.
pub async fn run_cleanup(
    storage: &dyn Storage,
    index: &dyn VectorIndex,
) -> Result<CleanupReport, PipelineError> {
    let mut by_key: HashMap<String, Vec<Uuid>> = HashMap::new();
    let mut scanned = 0usize;
    let mut offset = None;

    loop {
        let (page, next) = index.scroll(offset, SCROLL_PAGE).await?;
        scanned += page.len();
        for (id, payload) in page {
            by_key.entry(payload.storage_key).or_default().push(id);
        }
        match next {
            Some(n) => offset = Some(n),
            None => break,
        }
    }

    let mut report = CleanupReport {
        scanned_records: scanned,
        checked_documents: by_key.len(),
        ..CleanupReport::default()
    };

    for (key, ids) in by_key {
        if storage.exists(&key).await? {
            continue;
        }
        tracing::info!(storage_key = %key, records = ids.len(), "deleting orphaned records");
        index.delete(&ids).await?;
        report.orphaned_documents += 1;
        report.deleted_records += ids.len();
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RecordPayload, VectorRecord};
    use crate::storage::MemoryStorage;
    use crate::vector_index::MemoryIndex;

    async fn seed(index: &MemoryIndex, key: &str, count: usize) -> Vec<Uuid> {
        let doc = Uuid::new_v4();
        let mut ids = Vec::new();
        for i in 0..count {
            let id = Uuid::new_v4();
            ids.push(id);
            index
                .upsert(&[VectorRecord {
                    id,
                    vector: vec![1.0],
                    payload: RecordPayload {
                        filename: "f.txt".to_string(),
                        document_id: doc,
                        chunk_index: i as u32,
                        text: "t".to_string(),
                        storage_key: key.to_string(),
                    },
                }])
                .await
                .unwrap();
        }
        ids
    }

    #[tokio::test]
    async fn deletes_only_records_of_missing_blobs() {
        let storage = MemoryStorage::new();
        let index = MemoryIndex::new();

        storage
            .put("uploads/kept.txt", b"x".to_vec(), "text/plain")
            .await
            .unwrap();
        seed(&index, "uploads/kept.txt", 2).await;
        seed(&index, "uploads/gone.txt", 3).await;

        let report = run_cleanup(&storage, &index).await.unwrap();
        assert_eq!(report.scanned_records, 5);
        assert_eq!(report.checked_documents, 2);
        assert_eq!(report.orphaned_documents, 1);
        assert_eq!(report.deleted_records, 3);
        assert_eq!(index.len(), 2);
    }

    #[tokio::test]
    async fn clean_index_reports_nothing_to_do() {
        let storage = MemoryStorage::new();
        let index = MemoryIndex::new();
        storage
            .put("uploads/a.txt", b"x".to_vec(), "text/plain")
            .await
            .unwrap();
        seed(&index, "uploads/a.txt", 1).await;

        let report = run_cleanup(&storage, &index).await.unwrap();
        assert_eq!(report.orphaned_documents, 0);
        assert_eq!(report.deleted_records, 0);
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn empty_index_is_a_noop() {
        let storage = MemoryStorage::new();
        let index = MemoryIndex::new();
        let report = run_cleanup(&storage, &index).await.unwrap();
        assert_eq!(report, CleanupReport::default());
    }
}
