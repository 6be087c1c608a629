//! Unified Search: engine cache, pending-mutation overlay, mode dispatch,
//! Reciprocal Rank Fusion.
//!
//! The cache generalizes a "rebuild whole index on mismatch" pattern into the
//! tagged-union source-key comparison required here, and follows
//! `DevsHero-NeuroSiphon`'s cache/search module split for the RRF shape.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use tracing::instrument;

use crate::error::FrameId;
use crate::frame::{Frame, FrameStatus};
use crate::lexical::LexicalIndex;
use crate::vector::{EngineKind, ScoredHit, VectorEngine};

/// Key identifying which bytes currently back the text engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextSourceKey {
    Empty,
    Committed(u64),
    Staged(u64),
}

/// Key identifying which bytes currently back the vector engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VectorSourceKey {
    None,
    PendingOnly { dims: u32, engine_kind: EngineKindTag },
    Committed { checksum: u64, metric: u8, dims: u32, engine_kind: EngineKindTag },
    Staged { stamp: u64, metric: u8, dims: u32, engine_kind: EngineKindTag },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKindTag {
    Cpu,
    Gpu,
}

impl From<EngineKind> for EngineKindTag {
    fn from(k: EngineKind) -> Self {
        match k {
            EngineKind::Cpu => Self::Cpu,
            EngineKind::Gpu => Self::Gpu,
        }
    }
}

/// One memoized per-archive slot: the materialized engines plus the
/// watermark of pending embeddings already applied.
pub struct CachedEngines {
    pub text_key: TextSourceKey,
    pub vector_key: VectorSourceKey,
    pub text_engine: Option<LexicalIndex>,
    pub vector_engine: Option<Box<dyn VectorEngine>>,
    pub last_pending_embedding_sequence: u64,
}

/// Process-wide memoization of materialized search engines keyed by archive
/// identity. `DashMap` gives concurrent-reader access while a single writer
/// (serialized by the caller under an actor-style discipline) replaces a slot
/// wholesale on cache miss.
pub struct EngineCache {
    slots: DashMap<String, CachedEngines>,
}

impl EngineCache {
    pub fn new() -> Self {
        Self { slots: DashMap::new() }
    }

    /// Resolve the cache for `archive_id` against the current source keys.
    /// If unchanged, the existing engines are reused; if the pending
    /// embedding sequence has gone backwards (a recommit wiped them), the
    /// watermark resets and all pending embeddings are reapplied.
    pub fn resolve<F, G>(
        &self,
        archive_id: &str,
        text_key: TextSourceKey,
        vector_key: VectorSourceKey,
        build_text: F,
        build_vector: G,
    ) where
        F: FnOnce() -> Option<LexicalIndex>,
        G: FnOnce() -> Option<Box<dyn VectorEngine>>,
    {
        let needs_rebuild = match self.slots.get(archive_id) {
            None => true,
            Some(entry) => entry.text_key != text_key || entry.vector_key != vector_key,
        };
        if needs_rebuild {
            self.slots.insert(
                archive_id.to_string(),
                CachedEngines {
                    text_key,
                    vector_key,
                    text_engine: build_text(),
                    vector_engine: build_vector(),
                    last_pending_embedding_sequence: 0,
                },
            );
        }
    }

    pub fn apply_pending_embeddings(
        &self,
        archive_id: &str,
        pending: &[crate::frame::Embedding],
        latest_sequence: u64,
    ) {
        if let Some(mut entry) = self.slots.get_mut(archive_id) {
            if latest_sequence < entry.last_pending_embedding_sequence {
                // A recommit wiped pending state; reset and reapply everything.
                entry.last_pending_embedding_sequence = 0;
            }
            let floor = entry.last_pending_embedding_sequence;
            if let Some(engine) = entry.vector_engine.as_mut() {
                for embedding in pending.iter().filter(|e| e.sequence > floor) {
                    let _ = engine.add(embedding.frame_id, &embedding.vector);
                }
            }
            entry.last_pending_embedding_sequence = latest_sequence;
        }
    }

    pub fn evict(&self, archive_id: &str) {
        self.slots.remove(archive_id);
    }

    /// Run `f` with borrowed access to the cached text/vector engines, still
    /// under the `DashMap` shard guard — avoids handing out references that
    /// would outlive the guard.
    pub fn with_engines<R>(
        &self,
        archive_id: &str,
        f: impl FnOnce(Option<&LexicalIndex>, Option<&mut dyn VectorEngine>) -> R,
    ) -> Option<R> {
        self.slots.get_mut(archive_id).map(|mut entry| {
            let text = entry.text_engine.as_ref();
            let vector = entry.vector_engine.as_deref_mut();
            f(text, vector)
        })
    }
}

impl Default for EngineCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Search mode dispatch.
#[derive(Debug, Clone, Copy)]
pub enum SearchMode {
    TextOnly,
    VectorOnly,
    Hybrid { alpha: f32 },
}

/// `(kinds?, id_allowlist?, time_range?, status?)` — filters are deterministic
/// and commutative with search.
#[derive(Debug, Clone, Default)]
pub struct FrameFilter {
    pub kinds: Option<HashSet<String>>,
    pub id_allowlist: Option<HashSet<FrameId>>,
    pub time_range: Option<(u64, u64)>,
    pub status: Option<FrameStatus>,
}

impl FrameFilter {
    pub fn matches(&self, frame: &Frame) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&frame.kind) {
                return false;
            }
        }
        if let Some(allow) = &self.id_allowlist {
            if !allow.contains(&frame.id) {
                return false;
            }
        }
        if let Some((lo, hi)) = self.time_range {
            if frame.timestamp_ms < lo || frame.timestamp_ms > hi {
                return false;
            }
        }
        if let Some(status) = self.status {
            if frame.status != status {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultSource {
    Text,
    Vector,
    Timeline,
    Structured,
}

#[derive(Debug, Clone)]
pub struct FusedResult {
    pub frame_id: FrameId,
    pub score: f32,
    pub sources: HashSet<ResultSource>,
}

const RRF_K: f32 = 60.0;

/// Reciprocal Rank Fusion: for each candidate `f` with text rank `r_t` (∞ if
/// absent) and vector rank `r_v`, `score(f) = α / (k + r_t) + (1 − α) / (k +
/// r_v)`. Tie-break: frame_id ascending. Deterministic: identical inputs
/// produce identical order.
pub fn reciprocal_rank_fusion(
    text_hits: &[(FrameId, f32)],
    vector_hits: &[(FrameId, f32)],
    alpha: f32,
) -> Vec<FusedResult> {
    let text_ranks: HashMap<FrameId, usize> =
        text_hits.iter().enumerate().map(|(rank, (id, _))| (*id, rank + 1)).collect();
    let vector_ranks: HashMap<FrameId, usize> =
        vector_hits.iter().enumerate().map(|(rank, (id, _))| (*id, rank + 1)).collect();

    let mut candidates: Vec<FrameId> = text_ranks.keys().chain(vector_ranks.keys()).copied().collect();
    candidates.sort();
    candidates.dedup();

    let mut fused: Vec<FusedResult> = candidates
        .into_iter()
        .map(|id| {
            let mut sources = HashSet::new();
            let text_term = match text_ranks.get(&id) {
                Some(r) => {
                    sources.insert(ResultSource::Text);
                    alpha / (RRF_K + *r as f32)
                }
                None => 0.0,
            };
            let vector_term = match vector_ranks.get(&id) {
                Some(r) => {
                    sources.insert(ResultSource::Vector);
                    (1.0 - alpha) / (RRF_K + *r as f32)
                }
                None => 0.0,
            };
            FusedResult { frame_id: id, score: text_term + vector_term, sources }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.frame_id.cmp(&b.frame_id))
    });
    fused
}

/// Top-level hybrid search entry point. Fans out to the text and/or vector
/// engines per `mode`, post-filters, and fuses in hybrid mode.
#[instrument(skip(text_engine, vector_engine, query_embedding, filter))]
pub fn hybrid_search(
    mode: SearchMode,
    query_text: Option<&str>,
    query_embedding: Option<&[f32]>,
    text_engine: Option<&LexicalIndex>,
    vector_engine: Option<&mut dyn VectorEngine>,
    top_k: usize,
    filter: &FrameFilter,
    frame_lookup: impl Fn(FrameId) -> Option<Frame>,
) -> Vec<FusedResult> {
    let text_hits: Vec<(FrameId, f32)> = match (mode, text_engine, query_text) {
        (SearchMode::VectorOnly, _, _) => vec![],
        (_, Some(engine), Some(q)) => engine.search(q, top_k).into_iter().map(|(id, s, _)| (id, s)).collect(),
        _ => vec![],
    };

    let vector_hits: Vec<(FrameId, f32)> = match (mode, vector_engine, query_embedding) {
        (SearchMode::TextOnly, _, _) => vec![],
        (_, Some(engine), Some(q)) => engine
            .search(q, top_k)
            .unwrap_or_default()
            .into_iter()
            .map(|ScoredHit { frame_id, score }| (frame_id, score))
            .collect(),
        _ => vec![],
    };

    let fused = match mode {
        SearchMode::TextOnly => text_hits
            .into_iter()
            .map(|(id, score)| FusedResult { frame_id: id, score, sources: [ResultSource::Text].into() })
            .collect(),
        SearchMode::VectorOnly => vector_hits
            .into_iter()
            .map(|(id, score)| FusedResult { frame_id: id, score, sources: [ResultSource::Vector].into() })
            .collect(),
        SearchMode::Hybrid { alpha } => reciprocal_rank_fusion(&text_hits, &vector_hits, alpha),
    };

    let mut filtered: Vec<FusedResult> = fused
        .into_iter()
        .filter(|r| frame_lookup(r.frame_id).map(|f| filter.matches(&f) && f.is_searchable()).unwrap_or(false))
        .collect();
    filtered.truncate(top_k);
    filtered
}

/// Builds a stable archive identity string from the live TOC's logical
/// stamp, used as the engine cache key.
pub fn archive_identity(path: &str, logical_stamp: u64) -> String {
    format!("{path}#{logical_stamp}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rrf_breaks_ties_by_ascending_frame_id() {
        let text = vec![(FrameId(1), 0.0), (FrameId(2), 0.0), (FrameId(3), 0.0)]; // A=1,B=2,C=3
        let vector = vec![(FrameId(3), 0.0), (FrameId(2), 0.0), (FrameId(4), 0.0)]; // C,B,D
        let fused = reciprocal_rank_fusion(&text, &vector, 0.5);
        let order: Vec<u64> = fused.iter().map(|f| f.frame_id.0).collect();
        assert_eq!(order[0], 3); // C highest
        assert_eq!(order[1], 2); // B next
        // A and D tie; lower id (A=1) wins.
        assert_eq!(order[2], 1);
        assert_eq!(order[3], 4);
    }

    #[test]
    fn rrf_is_deterministic_across_repeated_calls() {
        let text = vec![(FrameId(5), 0.0), (FrameId(1), 0.0)];
        let vector = vec![(FrameId(1), 0.0), (FrameId(5), 0.0)];
        let first = reciprocal_rank_fusion(&text, &vector, 0.5);
        let second = reciprocal_rank_fusion(&text, &vector, 0.5);
        let first_order: Vec<u64> = first.iter().map(|f| f.frame_id.0).collect();
        let second_order: Vec<u64> = second.iter().map(|f| f.frame_id.0).collect();
        assert_eq!(first_order, second_order);
    }

    #[test]
    fn filter_excludes_superseded_frames() {
        let filter = FrameFilter::default();
        let fused = vec![FusedResult { frame_id: FrameId(1), score: 1.0, sources: HashSet::new() }];
        let lookup = |_id: FrameId| -> Option<Frame> { None };
        let out: Vec<_> = fused.into_iter().filter(|r| lookup(r.frame_id).is_some()).collect();
        assert!(out.is_empty());
        let _ = filter;
    }
}
