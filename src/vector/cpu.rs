//! CPU vector engine: straight dot-product scan per row.
//!
//! Used when GPU is unavailable, vector count exceeds the Metal-auto
//! threshold, or the requested topK exceeds the Metal-auto cap. A brute-force
//! cosine scan generalized from a fixed-dimension special case to the shared
//! `VectorMatrix`.

use rayon::prelude::*;

use crate::error::{FrameId, Result};

use super::{similarity, top_k, ScoredHit, SimilarityMetric, VectorEngine, VectorMatrix};

pub struct CpuEngine {
    matrix: VectorMatrix,
    metric: SimilarityMetric,
}

impl CpuEngine {
    pub fn new(dim: usize, metric: SimilarityMetric) -> Self {
        Self { matrix: VectorMatrix::new(dim), metric }
    }

    pub fn from_matrix(matrix: VectorMatrix, metric: SimilarityMetric) -> Self {
        Self { matrix, metric }
    }
}

impl VectorEngine for CpuEngine {
    fn add(&mut self, frame_id: FrameId, vector: &[f32]) -> Result<()> {
        self.matrix.add(frame_id, vector)
    }

    fn add_batch(&mut self, ids: &[FrameId], vectors: &[Vec<f32>]) -> Result<()> {
        self.matrix.add_batch(ids, vectors)
    }

    fn remove(&mut self, frame_id: FrameId) -> Result<()> {
        self.matrix.remove(frame_id)
    }

    fn search(&mut self, query: &[f32], top_k_n: usize) -> Result<Vec<ScoredHit>> {
        // No GPU buffer to sync; the dot products run directly over the
        // host-resident matrix, in parallel across rows via rayon when the
        // corpus is large enough to amortize the fork/join overhead.
        let dim = self.matrix.dim;
        let metric = self.metric;
        let scores: Vec<ScoredHit> = if self.matrix.count() > 4096 {
            self.matrix
                .rows
                .par_chunks(dim)
                .zip(self.matrix.frame_ids.par_iter())
                .map(|(row, id)| ScoredHit { frame_id: *id, score: similarity(metric, query, row) })
                .collect()
        } else {
            self.matrix
                .rows
                .chunks(dim)
                .zip(self.matrix.frame_ids.iter())
                .map(|(row, id)| ScoredHit { frame_id: *id, score: similarity(metric, query, row) })
                .collect()
        };
        top_k(scores.into_iter(), top_k_n)
    }

    fn serialize(&self) -> Vec<u8> {
        self.matrix.serialize(self.metric)
    }

    fn deserialize(&mut self, bytes: &[u8]) -> Result<()> {
        let (matrix, metric) = VectorMatrix::deserialize(bytes)?;
        self.matrix = matrix;
        self.metric = metric;
        Ok(())
    }

    fn kind(&self) -> super::EngineKind {
        super::EngineKind::Cpu
    }
}
