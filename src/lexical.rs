//! Lexical Index: a serializable inverted index with BM25-style scoring,
//! read-only mmap open, and copy-on-write staged mutation.
//!
//! Tokenization uses an `xxh3`-keyed postings map. The serialized layout and
//! mmap-backed read-only open are modeled on `memvid`'s
//! `search-api.rs::search_lex` snippet extraction and on `tantivy`'s
//! segment-local postings shape, simplified to a single self-contained blob
//! since this store has no multi-segment merge.

use std::collections::HashMap;
use std::sync::Arc;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{FrameId, RetrievalError, Result};

pub const LEXICAL_BLOB_MAGIC: u32 = 0x5732_4C58; // "XL2W"
pub const LEXICAL_BLOB_VERSION: u16 = 1;

/// Average-document-length-normalized term frequency scoring constants.
const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect()
}

/// `xxh3`-keyed postings map: the token itself is never stored, only its
/// 64-bit digest, avoiding a string allocation per distinct term in the
/// persisted blob.
fn token_key(token: &str) -> u64 {
    xxh3_64(token.as_bytes())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Posting {
    frame_id: FrameId,
    term_frequency: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DocStats {
    length: u32,
    tombstoned: bool,
}

/// Serializable snapshot of the inverted index. This is what `serialize`
/// produces and `deserialize`/`deserialize_read_only` consume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexSnapshot {
    postings: HashMap<u64, Vec<Posting>>,
    doc_stats: HashMap<FrameId, DocStats>,
    total_doc_length: u64,
}

impl IndexSnapshot {
    fn avg_doc_length(&self) -> f32 {
        let live = self.doc_stats.values().filter(|d| !d.tombstoned).count();
        if live == 0 { 0.0 } else { self.total_doc_length as f32 / live as f32 }
    }

    fn doc_count(&self) -> usize {
        self.doc_stats.values().filter(|d| !d.tombstoned).count()
    }

    fn index_text(&mut self, frame_id: FrameId, text: &str) {
        let tokens = tokenize(text);
        let mut counts: HashMap<u64, u32> = HashMap::new();
        for t in &tokens {
            *counts.entry(token_key(t)).or_insert(0) += 1;
        }
        for (key, tf) in counts {
            let list = self.postings.entry(key).or_default();
            list.retain(|p| p.frame_id != frame_id);
            list.push(Posting { frame_id, term_frequency: tf });
        }
        self.doc_stats.insert(frame_id, DocStats { length: tokens.len() as u32, tombstoned: false });
        self.total_doc_length += tokens.len() as u64;
    }

    fn remove(&mut self, frame_id: FrameId) {
        if let Some(stats) = self.doc_stats.get_mut(&frame_id) {
            stats.tombstoned = true;
        }
        for list in self.postings.values_mut() {
            list.retain(|p| p.frame_id != frame_id);
        }
    }

    fn search(&self, query: &str, top_k: usize) -> Vec<(FrameId, f32, Option<String>)> {
        let terms = tokenize(query);
        let n = self.doc_count().max(1) as f32;
        let avg_len = self.avg_doc_length().max(1.0);
        let mut scores: HashMap<FrameId, f32> = HashMap::new();
        for term in &terms {
            let Some(postings) = self.postings.get(&token_key(term)) else { continue };
            let live_postings: Vec<&Posting> = postings
                .iter()
                .filter(|p| !self.doc_stats.get(&p.frame_id).map(|d| d.tombstoned).unwrap_or(true))
                .collect();
            if live_postings.is_empty() {
                continue;
            }
            let df = live_postings.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            for posting in live_postings {
                let doc_len = self
                    .doc_stats
                    .get(&posting.frame_id)
                    .map(|d| d.length as f32)
                    .unwrap_or(avg_len);
                let tf = posting.term_frequency as f32;
                let denom = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * doc_len / avg_len);
                let score = idf * (tf * (BM25_K1 + 1.0)) / denom.max(f32::EPSILON);
                *scores.entry(posting.frame_id).or_insert(0.0) += score;
            }
        }
        let mut hits: Vec<(FrameId, f32)> = scores.into_iter().collect();
        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(top_k);
        hits.into_iter().map(|(id, score)| (id, score, None)).collect()
    }
}

enum Backing {
    Owned(IndexSnapshot),
    /// Read-only mmap-backed open: writes return an error.
    Mapped { snapshot: IndexSnapshot, _mmap: Arc<Mmap> },
}

/// A single search hit: `(frame_id, score, matched_snippet_hint)`.
pub type LexicalHit = (FrameId, f32, Option<String>);

pub struct LexicalIndex {
    backing: Backing,
}

impl LexicalIndex {
    pub fn new() -> Self {
        Self { backing: Backing::Owned(IndexSnapshot::default()) }
    }

    fn snapshot(&self) -> &IndexSnapshot {
        match &self.backing {
            Backing::Owned(s) => s,
            Backing::Mapped { snapshot, .. } => snapshot,
        }
    }

    fn snapshot_mut(&mut self) -> Result<&mut IndexSnapshot> {
        match &mut self.backing {
            Backing::Owned(s) => Ok(s),
            Backing::Mapped { .. } => {
                Err(RetrievalError::encoding("lexical index is mmap-backed read-only; writes are rejected"))
            }
        }
    }

    pub fn index(&mut self, frame_id: FrameId, text: &str) -> Result<()> {
        self.snapshot_mut()?.index_text(frame_id, text);
        Ok(())
    }

    pub fn remove(&mut self, frame_id: FrameId) -> Result<()> {
        self.snapshot_mut()?.remove(frame_id);
        Ok(())
    }

    pub fn search(&self, query: &str, top_k: usize) -> Vec<LexicalHit> {
        self.snapshot().search(query, top_k)
    }

    pub fn doc_count(&self) -> usize {
        self.snapshot().doc_count()
    }

    /// Full snapshot serialization: `magic | version | bincode-ish json body`.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(self.snapshot())
            .map_err(|e| RetrievalError::encoding(format!("lexical serialize: {e}")))?;
        let mut out = Vec::with_capacity(body.len() + 6);
        out.extend_from_slice(&LEXICAL_BLOB_MAGIC.to_le_bytes());
        out.extend_from_slice(&LEXICAL_BLOB_VERSION.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decode_body(bytes: &[u8]) -> Result<IndexSnapshot> {
        if bytes.len() < 6 {
            return Err(RetrievalError::encoding("lexical blob truncated"));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != LEXICAL_BLOB_MAGIC {
            return Err(RetrievalError::encoding("lexical blob magic mismatch"));
        }
        let version = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        if version != LEXICAL_BLOB_VERSION {
            return Err(RetrievalError::encoding("unsupported lexical blob version"));
        }
        serde_json::from_slice(&bytes[6..]).map_err(|e| RetrievalError::encoding(format!("lexical deserialize: {e}")))
    }

    /// Mutable copy: fully deserializes into owned state for further staged mutation.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let snapshot = Self::decode_body(bytes)?;
        Ok(Self { backing: Backing::Owned(snapshot) })
    }

    /// Read-only mmap-backed open: the memory region becomes authoritative
    /// backing; all writes return an error. Avoids a full copy on the
    /// reader-only hot path.
    pub fn deserialize_read_only(mmap: Arc<Mmap>) -> Result<Self> {
        let snapshot = Self::decode_body(&mmap)?;
        Ok(Self { backing: Backing::Mapped { snapshot, _mmap: mmap } })
    }
}

impl Default for LexicalIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_search_finds_indexed_frame() {
        let mut idx = LexicalIndex::new();
        idx.index(FrameId(1), "hello world").unwrap();
        let hits = idx.search("hello", 5);
        assert_eq!(hits[0].0, FrameId(1));
    }

    #[test]
    fn removed_frame_is_not_returned() {
        let mut idx = LexicalIndex::new();
        idx.index(FrameId(1), "hello world").unwrap();
        idx.index(FrameId(2), "hello again").unwrap();
        idx.remove(FrameId(1)).unwrap();
        let hits = idx.search("hello", 5);
        assert!(hits.iter().all(|(id, _, _)| *id != FrameId(1)));
    }

    #[test]
    fn mmap_backed_open_matches_mutable_open_for_same_bytes() {
        let mut idx = LexicalIndex::new();
        idx.index(FrameId(1), "alpha beta gamma").unwrap();
        idx.index(FrameId(2), "beta delta").unwrap();
        let bytes = idx.serialize().unwrap();

        let mutable = LexicalIndex::deserialize(&bytes).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lex.blob");
        std::fs::write(&path, &bytes).unwrap();
        let file = std::fs::File::open(&path).unwrap();
        let mmap = unsafe { Mmap::map(&file).unwrap() };
        let mapped = LexicalIndex::deserialize_read_only(Arc::new(mmap)).unwrap();

        assert_eq!(mutable.search("beta", 5), mapped.search("beta", 5));
    }

    #[test]
    fn mapped_index_rejects_writes() {
        let mut idx = LexicalIndex::new();
        idx.index(FrameId(1), "alpha").unwrap();
        let bytes = idx.serialize().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lex.blob");
        std::fs::write(&path, &bytes).unwrap();
        let file = std::fs::File::open(&path).unwrap();
        let mmap = unsafe { Mmap::map(&file).unwrap() };
        let mut mapped = LexicalIndex::deserialize_read_only(Arc::new(mmap)).unwrap();
        assert!(mapped.index(FrameId(2), "beta").is_err());
    }
}
