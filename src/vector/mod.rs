//! Vector Index: dual CPU/GPU engines over a contiguous float matrix, lazy
//! dirty-range sync, swap-remove mutation, heap-selected top-K.
//!
//! The matrix storage and top-K heap are shared between engines; `cpu.rs`
//! and `gpu.rs` each wrap it with their own `search` kernel. A brute-force
//! cosine scan generalized from a fixed flat-file scan into a
//! capacity-growing matrix with dirty-range tracking, following
//! `DevsHero-NeuroSiphon`'s `vector_store.rs` for the in-memory matrix shape.

pub mod cpu;
pub mod gpu;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{FrameId, RetrievalError, Result};
use crate::format::VectorBlobHeader;

/// Similarity metric tag, persisted in the vector blob header's `similarity` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SimilarityMetric {
    Cosine = 0,
    DotProduct = 1,
}

/// Preference for engine selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePreference {
    CpuOnly,
    GpuPreferred,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Cpu,
    Gpu,
}

/// Thresholds governing `auto` engine selection.
#[derive(Debug, Clone, Copy)]
pub struct EngineSelectionConfig {
    pub metal_auto_count_threshold: usize,
    pub metal_auto_topk_cap: usize,
}

impl Default for EngineSelectionConfig {
    fn default() -> Self {
        Self { metal_auto_count_threshold: 20_000, metal_auto_topk_cap: 64 }
    }
}

/// Given `(preference, vector_count, topK)`, return the ordered list of
/// engines to try (first success wins).
pub fn select_engine_order(
    preference: EnginePreference,
    vector_count: usize,
    top_k: usize,
    cfg: EngineSelectionConfig,
) -> Vec<EngineKind> {
    match preference {
        EnginePreference::CpuOnly => vec![EngineKind::Cpu],
        EnginePreference::GpuPreferred => vec![EngineKind::Gpu, EngineKind::Cpu],
        EnginePreference::Auto => {
            if top_k > cfg.metal_auto_topk_cap {
                vec![EngineKind::Cpu, EngineKind::Gpu]
            } else if vector_count <= cfg.metal_auto_count_threshold {
                vec![EngineKind::Gpu, EngineKind::Cpu]
            } else {
                vec![EngineKind::Cpu, EngineKind::Gpu]
            }
        }
    }
}

/// Maximum `topK` accepted by `search`.
pub const MAX_TOP_K: usize = 10_000;

/// Contiguous row-major float32 matrix of shape `[count × dim]`, plus the
/// parallel `frame_id` array and `frame_id → row` map shared by both engines.
#[derive(Debug, Clone, Default)]
pub struct VectorMatrix {
    pub dim: usize,
    pub rows: Vec<f32>, // len == count * dim
    pub frame_ids: Vec<FrameId>,
    pub row_of: HashMap<FrameId, usize>,
    /// `[start, end]` inclusive row range requiring GPU resync, if any.
    pub dirty_range: Option<(usize, usize)>,
}

impl VectorMatrix {
    pub fn new(dim: usize) -> Self {
        Self { dim, rows: Vec::new(), frame_ids: Vec::new(), row_of: HashMap::new(), dirty_range: None }
    }

    pub fn count(&self) -> usize {
        self.frame_ids.len()
    }

    fn mark_dirty(&mut self, start: usize, end: usize) {
        self.dirty_range = Some(match self.dirty_range {
            Some((s, e)) => (s.min(start), e.max(end)),
            None => (start, end),
        });
    }

    pub fn clear_dirty(&mut self) {
        self.dirty_range = None;
    }

    /// Marks the whole matrix dirty (used after a `deserialize` replaces the
    /// entire backing store and any device mirror must fully refresh).
    pub fn mark_dirty_full(&mut self) {
        if self.count() > 0 {
            self.dirty_range = Some((0, self.count() - 1));
        }
    }

    fn row_slice(&self, row: usize) -> &[f32] {
        &self.rows[row * self.dim..(row + 1) * self.dim]
    }

    fn row_slice_mut(&mut self, row: usize) -> &mut [f32] {
        let dim = self.dim;
        &mut self.rows[row * dim..(row + 1) * dim]
    }

    /// `add(frame_id, vector)`: O(1) amortized; overwrite if present, else append.
    pub fn add(&mut self, frame_id: FrameId, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(RetrievalError::encoding(format!(
                "vector dimension {} does not match index dimension {}",
                vector.len(),
                self.dim
            )));
        }
        if let Some(&row) = self.row_of.get(&frame_id) {
            self.row_slice_mut(row).copy_from_slice(vector);
            self.mark_dirty(row, row);
        } else {
            let row = self.count();
            self.rows.extend_from_slice(vector);
            self.frame_ids.push(frame_id);
            self.row_of.insert(frame_id, row);
            self.mark_dirty(row, row);
        }
        Ok(())
    }

    pub fn add_batch(&mut self, ids: &[FrameId], vectors: &[Vec<f32>]) -> Result<()> {
        if ids.len() != vectors.len() {
            return Err(RetrievalError::encoding("add_batch: ids/vectors length mismatch"));
        }
        let mut lo = self.count();
        let mut hi = lo;
        for (id, vector) in ids.iter().zip(vectors.iter()) {
            if vector.len() != self.dim {
                return Err(RetrievalError::encoding("add_batch: vector dimension mismatch"));
            }
            if let Some(&row) = self.row_of.get(id) {
                self.row_slice_mut(row).copy_from_slice(vector);
                lo = lo.min(row);
                hi = hi.max(row);
            } else {
                let row = self.count();
                self.rows.extend_from_slice(vector);
                self.frame_ids.push(*id);
                self.row_of.insert(*id, row);
                hi = hi.max(row);
            }
        }
        if self.count() > 0 {
            self.mark_dirty(lo.min(hi), hi);
        }
        Ok(())
    }

    /// Swap-remove: move the last row into the target row, update the map.
    /// Dirty range covers both affected rows.
    pub fn remove(&mut self, frame_id: FrameId) -> Result<()> {
        let Some(row) = self.row_of.remove(&frame_id) else {
            return Err(RetrievalError::FrameNotFound(frame_id));
        };
        let last_row = self.count() - 1;
        if row != last_row {
            let dim = self.dim;
            let (left, right) = self.rows.split_at_mut(last_row * dim);
            left[row * dim..(row + 1) * dim].copy_from_slice(&right[..dim]);
            let moved_id = self.frame_ids[last_row];
            self.frame_ids[row] = moved_id;
            self.row_of.insert(moved_id, row);
            self.mark_dirty(row, last_row);
        } else {
            self.mark_dirty(row, row);
        }
        self.rows.truncate(last_row * self.dim);
        self.frame_ids.truncate(last_row);
        Ok(())
    }

    pub fn serialize(&self, similarity: SimilarityMetric) -> Vec<u8> {
        let header = VectorBlobHeader::new(self.dim as u32, self.count() as u64, similarity as u8);
        let mut out = Vec::new();
        out.extend_from_slice(zerocopy::AsBytes::as_bytes(&header));
        for v in &self.rows {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&(self.count() as u64 * 8).to_le_bytes());
        for id in &self.frame_ids {
            out.extend_from_slice(&id.0.to_le_bytes());
        }
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<(Self, SimilarityMetric)> {
        let header = VectorBlobHeader::from_bytes(bytes)?;
        let dim = header.dimensions.get() as usize;
        let count = header.vector_count.get() as usize;
        let mut cursor = VectorBlobHeader::LEN;
        let vector_bytes_len = count * dim * 4;
        if bytes.len() < cursor + vector_bytes_len {
            return Err(RetrievalError::encoding("vector blob truncated (vectors)"));
        }
        let mut rows = Vec::with_capacity(count * dim);
        for chunk in bytes[cursor..cursor + vector_bytes_len].chunks_exact(4) {
            rows.push(f32::from_le_bytes(chunk.try_into().unwrap()));
        }
        cursor += vector_bytes_len;
        if bytes.len() < cursor + 8 {
            return Err(RetrievalError::encoding("vector blob truncated (frame_ids_len)"));
        }
        cursor += 8;
        let ids_len = count * 8;
        if bytes.len() < cursor + ids_len {
            return Err(RetrievalError::encoding("vector blob truncated (frame_ids)"));
        }
        let mut frame_ids = Vec::with_capacity(count);
        let mut row_of = HashMap::with_capacity(count);
        for (row, chunk) in bytes[cursor..cursor + ids_len].chunks_exact(8).enumerate() {
            let id = FrameId(u64::from_le_bytes(chunk.try_into().unwrap()));
            row_of.insert(id, row);
            frame_ids.push(id);
        }
        let similarity = match header.similarity {
            0 => SimilarityMetric::Cosine,
            1 => SimilarityMetric::DotProduct,
            other => return Err(RetrievalError::encoding(format!("unknown similarity metric tag {other}"))),
        };
        Ok((Self { dim, rows, frame_ids, row_of, dirty_range: None }, similarity))
    }
}

/// `(frame_id, score)` search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredHit {
    pub frame_id: FrameId,
    pub score: f32,
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// SIMD-4 kernel used by the GPU engine when `dim % 4 == 0` and vectors are
/// pre-normalized: four-wide dot product accumulation.
pub fn dot_simd4(query: &[f32], row: &[f32]) -> f32 {
    let mut acc = [0.0f32; 4];
    for (q_chunk, r_chunk) in query.chunks_exact(4).zip(row.chunks_exact(4)) {
        for lane in 0..4 {
            acc[lane] += q_chunk[lane] * r_chunk[lane];
        }
    }
    acc.iter().sum()
}

pub fn similarity(metric: SimilarityMetric, query: &[f32], row: &[f32]) -> f32 {
    match metric {
        SimilarityMetric::DotProduct => dot(query, row),
        SimilarityMetric::Cosine => {
            let denom = norm(query) * norm(row);
            if denom == 0.0 { 0.0 } else { dot(query, row) / denom }
        }
    }
}

/// Min-heap entry ordered by score ascending (so the heap's top is the
/// worst-of-the-best-k, replaced on sift-down). Deterministic tie-break:
/// on equal score, the entry with the *larger* frame id is considered
/// "worse" so it's evicted first, leaving ascending-id order among ties.
#[derive(Debug, Clone, Copy, PartialEq)]
struct HeapEntry(ScoredHit);

impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse score ordering turns std::collections::BinaryHeap (a
        // max-heap) into the min-heap top-K selection needs: the entry with
        // the lowest score sorts as "greatest" so it surfaces at `peek()`
        // and gets evicted first. On an exact score tie, the *higher*
        // frame_id is the more disposable one (ties keep ascending ids), so
        // that tie-break compares frame_id directly, without reversal.
        match other.0.score.partial_cmp(&self.0.score).unwrap_or(std::cmp::Ordering::Equal) {
            std::cmp::Ordering::Equal => self.0.frame_id.cmp(&other.0.frame_id),
            ord => ord,
        }
    }
}

/// Top-K selection: min-heap of size k keyed by score; one linear pass,
/// final sort descending by score then ascending by frame_id. O(n log k).
pub fn top_k(scores: impl Iterator<Item = ScoredHit>, k: usize) -> Result<Vec<ScoredHit>> {
    if k > MAX_TOP_K {
        return Err(RetrievalError::capacity(format!("topK {k} exceeds cap {MAX_TOP_K}")));
    }
    use std::collections::BinaryHeap;
    let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(k);
    for hit in scores {
        if heap.len() < k {
            heap.push(HeapEntry(hit));
        } else if let Some(worst) = heap.peek() {
            let replace = hit.score > worst.0.score
                || (hit.score == worst.0.score && hit.frame_id < worst.0.frame_id);
            if replace {
                heap.pop();
                heap.push(HeapEntry(hit));
            }
        }
    }
    let mut out: Vec<ScoredHit> = heap.into_iter().map(|e| e.0).collect();
    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.frame_id.cmp(&b.frame_id))
    });
    Ok(out)
}

/// Common interface both engines implement.
pub trait VectorEngine: Send {
    fn add(&mut self, frame_id: FrameId, vector: &[f32]) -> Result<()>;
    fn add_batch(&mut self, ids: &[FrameId], vectors: &[Vec<f32>]) -> Result<()>;
    fn remove(&mut self, frame_id: FrameId) -> Result<()>;
    fn search(&mut self, query: &[f32], top_k: usize) -> Result<Vec<ScoredHit>>;
    fn serialize(&self) -> Vec<u8>;
    fn deserialize(&mut self, bytes: &[u8]) -> Result<()>;
    fn kind(&self) -> EngineKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_k_ties_break_by_frame_id_ascending() {
        let hits = vec![
            ScoredHit { frame_id: FrameId(3), score: 0.9 },
            ScoredHit { frame_id: FrameId(1), score: 1.0 },
            ScoredHit { frame_id: FrameId(2), score: 1.0 },
        ];
        let result = top_k(hits.into_iter(), 2).unwrap();
        assert_eq!(result[0].frame_id, FrameId(1));
        assert_eq!(result[1].frame_id, FrameId(2));
    }

    #[test]
    fn top_k_cutoff_tie_break_evicts_highest_id_regardless_of_insertion_order() {
        // Three entries tied at the top score; k=2 must keep ids 1 and 2 and
        // drop id 3, no matter what order the scan visits them in.
        let hits = vec![
            ScoredHit { frame_id: FrameId(3), score: 1.0 },
            ScoredHit { frame_id: FrameId(1), score: 1.0 },
            ScoredHit { frame_id: FrameId(2), score: 1.0 },
        ];
        let result = top_k(hits.into_iter(), 2).unwrap();
        let ids: Vec<u64> = result.iter().map(|h| h.frame_id.0).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn add_then_remove_swap_removes_last_row() {
        let mut m = VectorMatrix::new(2);
        m.add(FrameId(1), &[1.0, 0.0]).unwrap();
        m.add(FrameId(2), &[0.0, 1.0]).unwrap();
        m.add(FrameId(3), &[1.0, 1.0]).unwrap();
        m.remove(FrameId(1)).unwrap();
        assert_eq!(m.count(), 2);
        assert_eq!(m.row_of[&FrameId(3)], 0);
        assert_eq!(m.row_slice(0), &[1.0, 1.0]);
    }

    #[test]
    fn serialize_round_trips() {
        let mut m = VectorMatrix::new(2);
        m.add(FrameId(1), &[1.0, 0.0]).unwrap();
        m.add(FrameId(2), &[0.0, 1.0]).unwrap();
        let bytes = m.serialize(SimilarityMetric::Cosine);
        let (restored, metric) = VectorMatrix::deserialize(&bytes).unwrap();
        assert_eq!(metric, SimilarityMetric::Cosine);
        assert_eq!(restored.count(), 2);
        assert_eq!(restored.row_slice(0), &[1.0, 0.0]);
    }

    #[test]
    fn engine_selection_follows_preference_and_thresholds() {
        let cfg = EngineSelectionConfig::default();
        assert_eq!(select_engine_order(EnginePreference::CpuOnly, 100, 10, cfg), vec![EngineKind::Cpu]);
        assert_eq!(
            select_engine_order(EnginePreference::GpuPreferred, 100, 10, cfg),
            vec![EngineKind::Gpu, EngineKind::Cpu]
        );
        assert_eq!(
            select_engine_order(EnginePreference::Auto, 100, 100, cfg),
            vec![EngineKind::Cpu, EngineKind::Gpu]
        );
        assert_eq!(
            select_engine_order(EnginePreference::Auto, 100, 10, cfg),
            vec![EngineKind::Gpu, EngineKind::Cpu]
        );
        assert_eq!(
            select_engine_order(EnginePreference::Auto, 30_000, 10, cfg),
            vec![EngineKind::Cpu, EngineKind::Gpu]
        );
    }
}
