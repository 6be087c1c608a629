//! Frame data model and the Frame Store.
//!
//! The store holds two logical views: *committed* (persisted via the TOC)
//! and *pending* (in-memory, populated by WAL replay of uncommitted
//! records). Search sees the union by default; `committed_only` reads are
//! explicit.

use std::collections::HashMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{FrameId, RetrievalError, Result};

/// `deleted` hides a frame from search but retains its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameStatus {
    Active,
    Deleted,
}

/// Determines search eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameRole {
    Chunk,
    Document,
    System,
    Blob,
}

/// Payload compression tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanonicalEncoding {
    Plain,
    CompressedZstd,
    CompressedLz4,
}

/// Offset and length into the archive's data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRef {
    pub offset: u64,
    pub length: u64,
}

/// The atomic unit stored in the archive.
///
/// Mutable only via `supersede` (logical replacement) or `delete` (status
/// flip) — payload bytes are never rewritten except by full-archive
/// compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: FrameId,
    /// Capture time of the underlying event, not ingest time.
    pub timestamp_ms: u64,
    pub status: FrameStatus,
    /// Short, dot-namespaced string, e.g. `photo.root`, `surrogate`.
    pub kind: String,
    pub role: FrameRole,
    pub parent_id: Option<FrameId>,
    pub supersedes: Option<FrameId>,
    pub superseded_by: Option<FrameId>,
    pub search_text: Option<String>,
    pub canonical_encoding: CanonicalEncoding,
    pub payload_ref: PayloadRef,
    pub metadata: HashMap<String, String>,
    /// crc32 of the payload, verified on read.
    pub checksum: u32,
}

impl Frame {
    /// A frame with a non-nil `superseded_by` never appears in search results.
    pub fn is_searchable(&self) -> bool {
        self.status == FrameStatus::Active && self.superseded_by.is_none()
    }
}

/// Options accepted by `FrameStore::put`.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub timestamp_ms: Option<u64>,
    pub kind: String,
    pub role: FrameRole,
    pub parent_id: Option<FrameId>,
    pub search_text: Option<String>,
    pub canonical_encoding: CanonicalEncoding,
    pub metadata: HashMap<String, String>,
}

impl Default for FrameRole {
    fn default() -> Self {
        FrameRole::Chunk
    }
}

impl Default for CanonicalEncoding {
    fn default() -> Self {
        CanonicalEncoding::Plain
    }
}

/// A single float32 embedding staged or committed for a frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub frame_id: FrameId,
    pub dimension: u32,
    pub vector: Vec<f32>,
    pub normalized: bool,
    /// Strictly increases across a session's lifetime.
    pub sequence: u64,
}

const NORMALIZATION_EPSILON: f32 = 1e-4;

impl Embedding {
    /// If `normalized`, the L2 norm must be within `[1-ε, 1+ε]`.
    pub fn validate(&self) -> Result<()> {
        if self.vector.len() != self.dimension as usize {
            return Err(RetrievalError::encoding(format!(
                "embedding for frame {} declares dimension {} but carries {} components",
                self.frame_id,
                self.dimension,
                self.vector.len()
            )));
        }
        if self.normalized {
            let norm: f32 = self.vector.iter().map(|v| v * v).sum::<f32>().sqrt();
            if (norm - 1.0).abs() > NORMALIZATION_EPSILON {
                return Err(RetrievalError::encoding(format!(
                    "embedding for frame {} claims normalized but has L2 norm {}",
                    self.frame_id, norm
                )));
            }
        }
        Ok(())
    }
}

/// A staged mutation, in WAL replay order. The frame store applies these in
/// order to reconstruct the pending view after an open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PendingMutation {
    Put { payload: Vec<u8>, meta: Box<Frame> },
    Supersede { old_id: FrameId, new_id: FrameId },
    Delete { id: FrameId },
    StageEmbedding(Embedding),
}

#[derive(Debug, Clone)]
pub struct FramePreview {
    pub id: FrameId,
    pub kind: String,
    pub snippet: String,
}

/// Maximum supersede-chain depth walked when validating against cycles.
/// Protects against malformed input introducing an unbounded or cyclic chain.
const MAX_SUPERSEDE_DEPTH: usize = 10_000;

/// Holds committed frame metadata/payload plus the pending overlay accumulated
/// from WAL replay. Does not itself perform I/O; `payload_bytes` is supplied
/// by the caller (the commit coordinator owns the data region).
pub struct FrameStore {
    next_id: u64,
    committed: HashMap<FrameId, Frame>,
    committed_payloads: HashMap<FrameId, Vec<u8>>,
    pending: Vec<PendingMutation>,
    pending_index: HashMap<FrameId, Frame>,
    pending_payloads: HashMap<FrameId, Vec<u8>>,
    pending_embeddings: Vec<Embedding>,
    next_embedding_sequence: u64,
    /// How many times each frame has been returned by a search, for the
    /// `importance` surrogate-tier policy's "access frequency" term. An
    /// in-memory heat counter, not replayed from the WAL or carried across
    /// `rewrite_live_set` — it's a ranking heuristic, not archive state.
    access_counts: DashMap<FrameId, u64>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            committed: HashMap::new(),
            committed_payloads: HashMap::new(),
            pending: Vec::new(),
            pending_index: HashMap::new(),
            pending_payloads: HashMap::new(),
            pending_embeddings: Vec::new(),
            next_embedding_sequence: 1,
            access_counts: DashMap::new(),
        }
    }

    /// Reconstruct committed state after opening the archive (populated by
    /// the commit coordinator from the TOC's frame-log manifest).
    pub fn load_committed(&mut self, frames: Vec<(Frame, Vec<u8>)>, next_id: u64) {
        self.committed.clear();
        self.committed_payloads.clear();
        for (frame, payload) in frames {
            self.committed_payloads.insert(frame.id, payload);
            self.committed.insert(frame.id, frame);
        }
        self.next_id = next_id;
    }

    /// Ids returned by `put` are strictly increasing.
    pub fn put(&mut self, payload: Vec<u8>, options: PutOptions) -> Result<FrameId> {
        if let Some(parent) = options.parent_id {
            if !self.frame_is_active(parent) {
                return Err(RetrievalError::encoding(format!(
                    "parent_id {parent} does not refer to an active frame"
                )));
            }
        }
        let id = FrameId(self.next_id);
        self.next_id += 1;
        let checksum = crc32fast::hash(&payload);
        let frame = Frame {
            id,
            timestamp_ms: options.timestamp_ms.unwrap_or(0),
            status: FrameStatus::Active,
            kind: options.kind,
            role: options.role,
            parent_id: options.parent_id,
            supersedes: None,
            superseded_by: None,
            search_text: options.search_text,
            canonical_encoding: options.canonical_encoding,
            payload_ref: PayloadRef { offset: 0, length: payload.len() as u64 },
            metadata: options.metadata,
            checksum,
        };
        self.pending_payloads.insert(id, payload.clone());
        self.pending_index.insert(id, frame.clone());
        self.pending.push(PendingMutation::Put { payload, meta: Box::new(frame) });
        Ok(id)
    }

    /// Both frames become mutually linked; only the newer is searchable.
    pub fn supersede(&mut self, old_id: FrameId, new_id: FrameId) -> Result<()> {
        self.assert_no_cycle(old_id, new_id)?;
        if let Some(old) = self.frame_mut(old_id) {
            old.superseded_by = Some(new_id);
        } else {
            return Err(RetrievalError::FrameNotFound(old_id));
        }
        if let Some(new) = self.frame_mut(new_id) {
            new.supersedes = Some(old_id);
        } else {
            return Err(RetrievalError::FrameNotFound(new_id));
        }
        self.pending.push(PendingMutation::Supersede { old_id, new_id });
        Ok(())
    }

    pub fn delete(&mut self, id: FrameId) -> Result<()> {
        if let Some(frame) = self.frame_mut(id) {
            frame.status = FrameStatus::Deleted;
        } else {
            return Err(RetrievalError::FrameNotFound(id));
        }
        self.pending.push(PendingMutation::Delete { id });
        Ok(())
    }

    /// `sequence` strictly increases across a session's lifetime.
    pub fn stage_embedding(&mut self, frame_id: FrameId, vector: Vec<f32>, dimension: u32, normalized: bool) -> Result<u64> {
        if !self.committed.contains_key(&frame_id) && !self.pending_index.contains_key(&frame_id) {
            return Err(RetrievalError::FrameNotFound(frame_id));
        }
        let sequence = self.next_embedding_sequence;
        self.next_embedding_sequence += 1;
        let embedding = Embedding { frame_id, dimension, vector, normalized, sequence };
        embedding.validate()?;
        self.pending_embeddings.push(embedding.clone());
        self.pending.push(PendingMutation::StageEmbedding(embedding));
        Ok(sequence)
    }

    /// Returns the diff of pending embeddings since `since` (exclusive), plus
    /// the latest sequence observed, for engine-cache incremental refresh.
    pub fn pending_embedding_mutations(&self, since: Option<u64>) -> (Vec<Embedding>, u64) {
        let floor = since.unwrap_or(0);
        let diff: Vec<Embedding> = self
            .pending_embeddings
            .iter()
            .filter(|e| e.sequence > floor)
            .cloned()
            .collect();
        let latest = self
            .pending_embeddings
            .last()
            .map(|e| e.sequence)
            .unwrap_or(floor);
        (diff, latest)
    }

    pub fn frame_metas(&self, committed_only: bool) -> Vec<Frame> {
        let mut out: Vec<Frame> = self.committed.values().cloned().collect();
        if !committed_only {
            // Pending overlays committed: a pending mutation of an id already
            // committed (e.g. a delete/supersede) takes precedence.
            for (id, frame) in &self.pending_index {
                out.retain(|f| f.id != *id);
                out.push(frame.clone());
            }
        }
        out
    }

    pub fn frame_meta(&self, id: FrameId, committed_only: bool) -> Option<Frame> {
        if !committed_only {
            if let Some(f) = self.pending_index.get(&id) {
                return Some(f.clone());
            }
        }
        self.committed.get(&id).cloned()
    }

    pub fn frame_content(&self, id: FrameId, committed_only: bool) -> Result<Vec<u8>> {
        if !committed_only {
            if let Some(bytes) = self.pending_payloads.get(&id) {
                return Ok(bytes.clone());
            }
        }
        self.committed_payloads
            .get(&id)
            .cloned()
            .ok_or(RetrievalError::FrameNotFound(id))
    }

    pub fn frame_previews(&self, ids: &[FrameId], committed_only: bool) -> Vec<FramePreview> {
        ids.iter()
            .filter_map(|id| {
                let frame = self.frame_meta(*id, committed_only)?;
                let bytes = self.frame_content(*id, committed_only).ok()?;
                let snippet = String::from_utf8_lossy(&bytes).into_owned();
                Some(FramePreview { id: *id, kind: frame.kind, snippet })
            })
            .collect()
    }

    pub fn pending_mutations(&self) -> &[PendingMutation] {
        &self.pending
    }

    /// Records a retrieval hit against `id`. Takes `&self`: callers only hold
    /// a read lock on the store while searching.
    pub fn note_access(&self, id: FrameId) {
        *self.access_counts.entry(id).or_insert(0) += 1;
    }

    pub fn access_count(&self, id: FrameId) -> u64 {
        self.access_counts.get(&id).map(|c| *c).unwrap_or(0)
    }

    pub fn next_id_hint(&self) -> u64 {
        self.next_id
    }

    /// Called by the commit coordinator after Phase 2 completes: folds the
    /// pending overlay into the committed view and clears the WAL-backed
    /// pending record list.
    pub fn mark_committed(&mut self) {
        for mutation in std::mem::take(&mut self.pending) {
            match mutation {
                PendingMutation::Put { payload, meta } => {
                    self.committed_payloads.insert(meta.id, payload);
                    self.committed.insert(meta.id, *meta);
                }
                PendingMutation::Supersede { old_id, new_id } => {
                    if let Some(f) = self.committed.get_mut(&old_id) {
                        f.superseded_by = Some(new_id);
                    }
                    if let Some(f) = self.committed.get_mut(&new_id) {
                        f.supersedes = Some(old_id);
                    }
                }
                PendingMutation::Delete { id } => {
                    if let Some(f) = self.committed.get_mut(&id) {
                        f.status = FrameStatus::Deleted;
                    }
                }
                PendingMutation::StageEmbedding(_) => {
                    // Embeddings commit through the vector index, not the frame store.
                }
            }
        }
        self.pending_index.clear();
        self.pending_payloads.clear();
        self.pending_embeddings.clear();
    }

    /// Re-applies a `put` observed during WAL replay: the id and frame
    /// metadata are already assigned (they came from the log), so this
    /// skips `put`'s id-allocation and re-validates nothing — replay trusts
    /// a record that was itself staged under validation.
    pub fn replay_put(&mut self, frame: Frame, payload: Vec<u8>) {
        self.next_id = self.next_id.max(frame.id.0 + 1);
        self.pending_payloads.insert(frame.id, payload.clone());
        self.pending_index.insert(frame.id, frame.clone());
        self.pending.push(PendingMutation::Put { payload, meta: Box::new(frame) });
    }

    pub fn replay_supersede(&mut self, old_id: FrameId, new_id: FrameId) {
        if let Some(old) = self.frame_mut(old_id) {
            old.superseded_by = Some(new_id);
        }
        if let Some(new) = self.frame_mut(new_id) {
            new.supersedes = Some(old_id);
        }
        self.pending.push(PendingMutation::Supersede { old_id, new_id });
    }

    pub fn replay_delete(&mut self, id: FrameId) {
        if let Some(frame) = self.frame_mut(id) {
            frame.status = FrameStatus::Deleted;
        }
        self.pending.push(PendingMutation::Delete { id });
    }

    pub fn replay_embedding(&mut self, embedding: Embedding) {
        self.next_embedding_sequence = self.next_embedding_sequence.max(embedding.sequence + 1);
        self.pending_embeddings.push(embedding.clone());
        self.pending.push(PendingMutation::StageEmbedding(embedding));
    }

    fn frame_is_active(&self, id: FrameId) -> bool {
        self.frame_meta(id, false).map(|f| f.status == FrameStatus::Active).unwrap_or(false)
    }

    fn frame_mut(&mut self, id: FrameId) -> Option<&mut Frame> {
        if let Some(f) = self.pending_index.get_mut(&id) {
            return Some(f);
        }
        self.committed.get_mut(&id)
    }

    fn assert_no_cycle(&self, old_id: FrameId, new_id: FrameId) -> Result<()> {
        let mut cursor = Some(new_id);
        let mut depth = 0;
        while let Some(id) = cursor {
            if id == old_id {
                return Err(RetrievalError::encoding("supersede would introduce a cycle"));
            }
            depth += 1;
            if depth > MAX_SUPERSEDE_DEPTH {
                return Err(RetrievalError::encoding("supersede chain exceeds maximum depth"));
            }
            cursor = self.frame_meta(id, false).and_then(|f| f.supersedes);
        }
        Ok(())
    }
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(text: &str) -> PutOptions {
        PutOptions {
            kind: "chunk.text".to_string(),
            search_text: Some(text.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn put_ids_are_strictly_monotone() {
        let mut store = FrameStore::new();
        let a = store.put(b"a".to_vec(), opts("a")).unwrap();
        let b = store.put(b"b".to_vec(), opts("b")).unwrap();
        let c = store.put(b"c".to_vec(), opts("c")).unwrap();
        assert!(a.0 < b.0 && b.0 < c.0);
    }

    #[test]
    fn supersede_hides_old_frame() {
        let mut store = FrameStore::new();
        let old = store.put(b"v1".to_vec(), opts("v1")).unwrap();
        let new = store.put(b"v2".to_vec(), opts("v2")).unwrap();
        store.supersede(old, new).unwrap();
        let old_meta = store.frame_meta(old, false).unwrap();
        assert!(!old_meta.is_searchable());
        let new_meta = store.frame_meta(new, false).unwrap();
        assert!(new_meta.is_searchable());
    }

    #[test]
    fn supersede_cycle_is_rejected() {
        let mut store = FrameStore::new();
        let a = store.put(b"a".to_vec(), opts("a")).unwrap();
        let b = store.put(b"b".to_vec(), opts("b")).unwrap();
        store.supersede(a, b).unwrap();
        assert!(store.supersede(b, a).is_err());
    }

    #[test]
    fn delete_flips_status_but_keeps_bytes() {
        let mut store = FrameStore::new();
        let id = store.put(b"payload".to_vec(), opts("payload")).unwrap();
        store.delete(id).unwrap();
        assert_eq!(store.frame_meta(id, false).unwrap().status, FrameStatus::Deleted);
        assert_eq!(store.frame_content(id, false).unwrap(), b"payload");
    }

    #[test]
    fn pending_embedding_sequences_are_monotone() {
        let mut store = FrameStore::new();
        let id = store.put(b"a".to_vec(), opts("a")).unwrap();
        let s1 = store.stage_embedding(id, vec![1.0, 0.0], 2, true).unwrap();
        let s2 = store.stage_embedding(id, vec![0.0, 1.0], 2, true).unwrap();
        assert!(s1 < s2);
        let (diff, latest) = store.pending_embedding_mutations(Some(s1));
        assert_eq!(diff.len(), 1);
        assert_eq!(latest, s2);
    }

    #[test]
    fn parent_must_be_active_at_stage_time() {
        let mut store = FrameStore::new();
        let parent = store.put(b"parent".to_vec(), opts("parent")).unwrap();
        store.delete(parent).unwrap();
        let mut child_opts = opts("child");
        child_opts.parent_id = Some(parent);
        assert!(store.put(b"child".to_vec(), child_opts).is_err());
    }
}
