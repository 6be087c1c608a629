//! GPU vector engine: lazy dirty-range synchronization onto a device-resident
//! buffer, one distance per logical thread.
//!
//! Real GPU bindings (Metal/wgpu compute pipelines) are platform-specific and
//! out of scope for this crate; `DeviceBuffer` here stands in for the native
//! buffer, so the engine still exercises the actual optimization under test:
//! read-heavy workloads copy zero bytes per search. A real backend would swap
//! `DeviceBuffer`'s copy calls for a Metal/wgpu upload.

use crate::error::{FrameId, Result};

use super::{dot_simd4, similarity, top_k, EngineKind, ScoredHit, SimilarityMetric, VectorEngine, VectorMatrix};

const INITIAL_CAPACITY_ROWS: usize = 64;

/// Device-resident mirror of the host matrix. Only the dirty row range is
/// copied on `sync`.
struct DeviceBuffer {
    dim: usize,
    capacity_rows: usize,
    data: Vec<f32>,
    pub sync_count: u64,
    pub bytes_copied_last_sync: u64,
}

impl DeviceBuffer {
    fn new(dim: usize) -> Self {
        Self {
            dim,
            capacity_rows: INITIAL_CAPACITY_ROWS,
            data: vec![0.0; INITIAL_CAPACITY_ROWS * dim],
            sync_count: 0,
            bytes_copied_last_sync: 0,
        }
    }

    fn ensure_capacity(&mut self, rows_needed: usize) {
        if rows_needed <= self.capacity_rows {
            return;
        }
        let mut new_capacity = self.capacity_rows.max(1);
        while new_capacity < rows_needed {
            new_capacity *= 2;
        }
        let mut new_data = vec![0.0; new_capacity * self.dim];
        new_data[..self.data.len()].copy_from_slice(&self.data);
        self.data = new_data;
        self.capacity_rows = new_capacity;
    }

    /// Copy only `[start, end]` rows from `host` into the device buffer.
    fn sync(&mut self, host: &VectorMatrix, range: (usize, usize)) {
        self.ensure_capacity(host.count());
        let (start, end) = range;
        let lo = start * self.dim;
        let hi = ((end + 1) * self.dim).min(host.rows.len());
        if hi > lo {
            self.data[lo..hi].copy_from_slice(&host.rows[lo..hi]);
            self.bytes_copied_last_sync = (hi - lo) as u64 * 4;
        } else {
            self.bytes_copied_last_sync = 0;
        }
        self.sync_count += 1;
    }

    fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.dim..(row + 1) * self.dim]
    }
}

pub struct GpuEngine {
    matrix: VectorMatrix,
    device: DeviceBuffer,
    metric: SimilarityMetric,
}

impl GpuEngine {
    pub fn new(dim: usize, metric: SimilarityMetric) -> Self {
        Self { matrix: VectorMatrix::new(dim), device: DeviceBuffer::new(dim), metric }
    }

    /// Wrap a matrix already materialized from a committed vector blob. The
    /// device mirror starts empty, so the whole matrix is marked dirty and
    /// the first search pays a full sync.
    pub fn from_matrix(mut matrix: VectorMatrix, metric: SimilarityMetric) -> Self {
        let device = DeviceBuffer::new(matrix.dim);
        matrix.mark_dirty_full();
        Self { matrix, device, metric }
    }

    /// Exposed for tests asserting the lazy-sync optimization.
    pub fn gpu_sync_count(&self) -> u64 {
        self.device.sync_count
    }

    pub fn bytes_copied_last_sync(&self) -> u64 {
        self.device.bytes_copied_last_sync
    }

    fn ensure_synced(&mut self) {
        if let Some(range) = self.matrix.dirty_range.take() {
            self.device.sync(&self.matrix, range);
        }
    }
}

impl VectorEngine for GpuEngine {
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
        self.ensure_synced();
        let dim = self.matrix.dim;
        let use_simd4 = dim % 4 == 0 && self.metric == SimilarityMetric::DotProduct;
        let metric = self.metric;
        let scores: Vec<ScoredHit> = self
            .matrix
            .frame_ids
            .iter()
            .enumerate()
            .map(|(row, id)| {
                let device_row = self.device.row(row);
                let score = if use_simd4 {
                    dot_simd4(query, device_row)
                } else {
                    similarity(metric, query, device_row)
                };
                ScoredHit { frame_id: *id, score }
            })
            .collect();
        top_k(scores.into_iter(), top_k_n)
    }

    fn serialize(&self) -> Vec<u8> {
        self.matrix.serialize(self.metric)
    }

    fn deserialize(&mut self, bytes: &[u8]) -> Result<()> {
        let (matrix, metric) = VectorMatrix::deserialize(bytes)?;
        self.device = DeviceBuffer::new(matrix.dim);
        self.matrix = matrix;
        self.metric = metric;
        self.matrix.mark_dirty_full();
        Ok(())
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Gpu
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::SimilarityMetric;

    #[test]
    fn search_is_zero_copy_when_not_dirty() {
        let mut engine = GpuEngine::new(4, SimilarityMetric::DotProduct);
        for i in 0..1000u64 {
            engine.add(FrameId(i + 1), &[1.0, 0.0, 0.0, 0.0]).unwrap();
        }
        engine.search(&[1.0, 0.0, 0.0, 0.0], 10).unwrap();
        let after_first = engine.gpu_sync_count();
        engine.search(&[0.0, 1.0, 0.0, 0.0], 10).unwrap();
        assert_eq!(engine.gpu_sync_count(), after_first, "second search must not resync");
    }

    #[test]
    fn adding_one_row_only_copies_that_row() {
        let mut engine = GpuEngine::new(4, SimilarityMetric::DotProduct);
        for i in 0..1000u64 {
            engine.add(FrameId(i + 1), &[1.0, 0.0, 0.0, 0.0]).unwrap();
        }
        engine.search(&[1.0, 0.0, 0.0, 0.0], 10).unwrap();
        engine.add(FrameId(1001), &[0.0, 0.0, 1.0, 0.0]).unwrap();
        let before = engine.gpu_sync_count();
        engine.search(&[0.0, 0.0, 1.0, 0.0], 10).unwrap();
        assert_eq!(engine.gpu_sync_count(), before + 1);
        assert_eq!(engine.bytes_copied_last_sync(), 4 * 4);
    }
}
