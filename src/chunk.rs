//! Paragraph-boundary text chunker with verbatim overlap.
//!
//! Splits document text into [`Chunk`]s that respect a configurable
//! character limit. Splitting occurs on paragraph boundaries (`\n\n`) to
//! preserve semantic coherence; a paragraph that alone exceeds the limit
//! is hard-cut at whitespace where possible.
//!
//! The chunker is offset-preserving: each chunk records the byte range of
//! its core span in the original text, core spans tile the input with no
//! gaps, and the configured overlap is prepended verbatim from the
//! previous chunk's tail. Identical input and parameters always produce
//! the identical sequence, which keeps fingerprints stable across
//! re-ingestion.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Split `text` into chunks of at most `max_chars` core characters,
/// prepending `overlap_chars` characters of trailing context from the
/// previous chunk. Empty or whitespace-only input yields no chunks.
///
/// Callers must guarantee `overlap_chars < max_chars` (enforced by config
/// validation).
pub fn chunk_text(
    document_id: Uuid,
    text: &str,
    max_chars: usize,
    overlap_chars: usize,
) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let segments = pack_segments(text, max_chars);

    let mut chunks = Vec::with_capacity(segments.len());
    for (ordinal, &(start, end)) in segments.iter().enumerate() {
        let overlap_start = if ordinal == 0 || overlap_chars == 0 {
            start
        } else {
            let back: usize = text[..start]
                .chars()
                .rev()
                .take(overlap_chars)
                .map(|c| c.len_utf8())
                .sum();
            start - back
        };

        let fingerprint = fingerprint(document_id, &text[start..end]);
        let record_id = record_id_from_fingerprint(&fingerprint);

        chunks.push(Chunk {
            document_id,
            ordinal: ordinal as u32,
            text: text[overlap_start..end].to_string(),
            start,
            end,
            fingerprint,
            record_id,
        });
    }

    chunks
}

/// Deterministic content fingerprint: SHA-256 over the document id and the
/// whitespace-normalized chunk text. The document id is part of the hash so
/// identical text in two documents yields two distinct records.
pub fn fingerprint(document_id: Uuid, text: &str) -> String {
    let normalized = normalize(text);
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// The stable external record id: the first 16 fingerprint bytes as a UUID
/// (the external index requires UUID point ids).
pub fn record_id_from_fingerprint(fingerprint: &str) -> Uuid {
    let bytes = hex::decode(fingerprint).unwrap_or_default();
    let mut id = [0u8; 16];
    let n = bytes.len().min(16);
    id[..n].copy_from_slice(&bytes[..n]);
    Uuid::from_bytes(id)
}

/// Trim and collapse whitespace runs so formatting-only differences do not
/// change a chunk's identity.
fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Tile the whole text with contiguous core segments of at most
/// `max_chars` characters, cutting on paragraph boundaries first.
fn pack_segments(text: &str, max_chars: usize) -> Vec<(usize, usize)> {
    let units = paragraph_units(text);
    let mut segments: Vec<(usize, usize)> = Vec::new();

    let mut seg_start: Option<usize> = None;
    let mut seg_end = 0usize;
    let mut seg_chars = 0usize;

    for &(ustart, uend) in &units {
        let unit_chars = text[ustart..uend].chars().count();

        if unit_chars > max_chars {
            if let Some(s) = seg_start.take() {
                segments.push((s, seg_end));
            }
            hard_split(text, ustart, uend, max_chars, &mut segments);
            seg_chars = 0;
            continue;
        }

        match seg_start {
            None => {
                seg_start = Some(ustart);
                seg_end = uend;
                seg_chars = unit_chars;
            }
            Some(s) => {
                if seg_chars + unit_chars > max_chars {
                    segments.push((s, seg_end));
                    seg_start = Some(ustart);
                    seg_end = uend;
                    seg_chars = unit_chars;
                } else {
                    seg_end = uend;
                    seg_chars += unit_chars;
                }
            }
        }
    }

    if let Some(s) = seg_start {
        segments.push((s, seg_end));
    }

    merge_blank_segments(text, segments)
}

/// Fold whitespace-only spans into the following segment (or the previous
/// one at the end of input) so every chunk carries content while the
/// segments still tile the input exactly.
fn merge_blank_segments(text: &str, raw: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
    let mut segments: Vec<(usize, usize)> = Vec::new();
    let mut carry: Option<usize> = None;

    for (start, end) in raw {
        if text[start..end].trim().is_empty() {
            carry.get_or_insert(start);
            continue;
        }
        let start = carry.take().unwrap_or(start);
        segments.push((start, end));
    }

    if carry.is_some() {
        if let Some(last) = segments.last_mut() {
            last.1 = text.len();
        }
    }

    segments
}

/// Split text into paragraph units. Each unit spans a paragraph plus its
/// trailing blank-line separator, so units tile the input exactly.
fn paragraph_units(text: &str) -> Vec<(usize, usize)> {
    let mut units = Vec::new();
    let mut start = 0usize;

    while start < text.len() {
        match text[start..].find("\n\n") {
            Some(pos) => {
                let mut end = start + pos + 2;
                while text[end..].starts_with('\n') {
                    end += 1;
                }
                units.push((start, end));
                start = end;
            }
            None => {
                units.push((start, text.len()));
                break;
            }
        }
    }

    units
}

/// Hard-cut an oversized span into windows of at most `max_chars`
/// characters, preferring to cut just after a space or newline.
fn hard_split(
    text: &str,
    start: usize,
    end: usize,
    max_chars: usize,
    segments: &mut Vec<(usize, usize)>,
) {
    let mut cursor = start;
    while cursor < end {
        let window: usize = text[cursor..end]
            .chars()
            .take(max_chars)
            .map(|c| c.len_utf8())
            .sum();
        let mut cut = cursor + window;

        if cut < end {
            // Try to land the cut after a whitespace boundary.
            if let Some(pos) = text[cursor..cut].rfind(['\n', ' ']) {
                if pos > 0 {
                    cut = cursor + pos + 1;
                }
            }
        }

        segments.push((cursor, cut));
        cursor = cut;
    }
}
