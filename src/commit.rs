//! Commit Coordinator: two-phase commit across frame log + lex index + vec
//! index, replay on reopen, and offline compaction.
//!
//! Grounded on `libsql-wal`'s `shared_wal.rs`/`transaction.rs` (writer lease,
//! staged-then-committed two-phase shape) and `SpacetimeDB commitlog`'s
//! segment header/checksum discipline, adapted onto this crate's single-file
//! `SuperHeader`/`TocSlot` layout instead of libsql's page-oriented frames.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use crate::error::{FrameId, RetrievalError, Result};
use crate::format::{Manifest, SuperHeader, TocSlot};
use crate::frame::{Frame, FrameStore, PendingMutation};
use crate::wal::WalRingWriter;

/// A staged artifact awaiting the next commit.
#[derive(Default)]
pub struct StagedArtifacts {
    pub lex_blob: Option<(Vec<u8>, u64, u64)>, // (bytes, doc_count, version_stamp)
    pub vec_blob: Option<(Vec<u8>, u64, u32, u8)>, // (bytes, vector_count, dimension, similarity)
}

/// Snapshot handed to callers for the data region write, kept separate from
/// the in-memory `FrameStore` so the coordinator owns exactly the bytes that
/// must be durable.
pub struct DataRegionWrite {
    pub frame_log_bytes: Vec<u8>,
    pub frame_log_checksum: u64,
}

struct CoordinatorState {
    header: SuperHeader,
    logical_stamp: u64,
    writer_held: bool,
}

/// Owns the super-header and drives the two-phase commit. Does not perform
/// actual disk I/O itself (that's the archive's job, via `DataRegionWrite`);
/// this type is the linearization point and checksum/TOC bookkeeping.
pub struct CommitCoordinator {
    state: Mutex<CoordinatorState>,
}

impl CommitCoordinator {
    pub fn new(header: SuperHeader) -> Self {
        let logical_stamp = header.live_slot().logical_stamp.get();
        Self { state: Mutex::new(CoordinatorState { header, logical_stamp, writer_held: false }) }
    }

    /// Acquire the single-writer lease — one writer lease per archive.
    pub fn acquire_writer_lease(&self) -> Result<WriterLeaseGuard<'_>> {
        let mut guard = self.state.lock();
        if guard.writer_held {
            return Err(RetrievalError::WriterContention("archive already has an active writer session".into()));
        }
        guard.writer_held = true;
        drop(guard);
        Ok(WriterLeaseGuard { coordinator: self })
    }

    fn release_writer_lease(&self) {
        self.state.lock().writer_held = false;
    }

    pub fn live_toc(&self) -> TocSlot {
        *self.state.lock().header.live_slot()
    }

    /// Full 4 KiB super-header, padded, ready to write at file offset 0.
    pub fn header_bytes(&self) -> Vec<u8> {
        self.state.lock().header.to_padded_bytes()
    }

    /// Phase 1 (stage) + Phase 2 (publish). Returns the new `TocSlot` once
    /// durable. Idempotent: a commit with nothing staged and an empty WAL
    /// tail is a no-op — callers should check that before calling this (the
    /// coordinator itself always performs the flip/fsync sequence when
    /// invoked, since "nothing changed" is a frame-store/WAL-level judgment,
    /// not this type's).
    #[instrument(skip(self, frame_log_write, staged, wal))]
    pub fn commit(
        &self,
        frame_log_write: DataRegionWrite,
        staged: &StagedArtifacts,
        wal: &WalRingWriter,
        frame_log_offset: u64,
    ) -> Result<TocSlot> {
        let mut guard = self.state.lock();

        // Phase 1: compute manifests for whatever's new. Offsets into the
        // data region are supplied by the caller, who actually wrote the
        // bytes; this type only assembles/checksums the TOC.
        let frame_log_manifest = Manifest::new(
            frame_log_offset,
            frame_log_write.frame_log_bytes.len() as u64,
            frame_log_write.frame_log_checksum,
            0,
        );

        let previous = *guard.header.live_slot();

        let lex_manifest = if let Some((bytes, doc_count, _version)) = &staged.lex_blob {
            Manifest::new(
                frame_log_offset + frame_log_write.frame_log_bytes.len() as u64,
                bytes.len() as u64,
                crc32fast::hash(bytes) as u64,
                *doc_count,
            )
        } else {
            previous.lex_manifest
        };

        let vec_manifest = if let Some((bytes, vector_count, dimension, _similarity)) = &staged.vec_blob {
            let base = frame_log_offset
                + frame_log_write.frame_log_bytes.len() as u64
                + staged.lex_blob.as_ref().map(|(b, _, _)| b.len() as u64).unwrap_or(0);
            Manifest::new(base, bytes.len() as u64, crc32fast::hash(bytes) as u64, (*vector_count << 32) | *dimension as u64)
        } else {
            previous.vec_manifest
        };

        guard.logical_stamp += 1;
        let logical_stamp = guard.logical_stamp;

        let mut new_slot = TocSlot {
            logical_stamp: zerocopy::byteorder::little_endian::U64::new(logical_stamp),
            frame_log_manifest,
            lex_manifest,
            vec_manifest,
            wal_region_offset: previous.wal_region_offset,
            wal_region_size: previous.wal_region_size,
            checksum: zerocopy::byteorder::little_endian::U64::ZERO,
        };
        new_slot.finalize_checksum();

        // Phase 2 step 1-2: write the inactive slot, compute its checksum
        // (already done above via finalize_checksum).
        *guard.header.inactive_slot_mut() = new_slot;

        // Phase 2 step 3: flip the live pointer. This is the linearization
        // point and the point past which commit is not cancellable.
        guard.header.flip_live();

        // Phase 2 step 5: checkpoint the WAL, marking all prior records durably applied.
        wal.record_checkpoint()?;

        info!(logical_stamp, "commit published");
        Ok(new_slot)
    }

    /// Replay on open: select the live TOC, then the caller replays the WAL
    /// forward from its checkpoint via `WalRingWriter::replay` and re-applies
    /// records into `FrameStore`.
    pub fn replay_into(&self, store: &mut FrameStore, wal: &WalRingWriter) -> Result<()> {
        let records = wal.replay()?;
        for record in records {
            apply_wal_record(store, &record)?;
        }
        Ok(())
    }
}

pub struct WriterLeaseGuard<'a> {
    coordinator: &'a CommitCoordinator,
}

impl<'a> Drop for WriterLeaseGuard<'a> {
    fn drop(&mut self) {
        self.coordinator.release_writer_lease();
    }
}

fn apply_wal_record(store: &mut FrameStore, record: &crate::wal::WalRecord) -> Result<()> {
    let mutation: PendingMutation = serde_json::from_slice(&record.payload)
        .map_err(|e| RetrievalError::encoding(format!("wal record payload decode failed: {e}")))?;
    match mutation {
        PendingMutation::Put { payload, meta } => {
            store.replay_put(*meta, payload);
        }
        PendingMutation::Supersede { old_id, new_id } => {
            store.replay_supersede(old_id, new_id);
        }
        PendingMutation::Delete { id } => {
            store.replay_delete(id);
        }
        PendingMutation::StageEmbedding(embedding) => {
            store.replay_embedding(embedding);
        }
    }
    Ok(())
}

/// Offline compaction: copy live payloads into a fresh set of committed
/// frames, optionally zeroing deleted/superseded payloads while preserving
/// their metadata and ids. The destination's WAL is left empty with
/// `committed_seq` initialized to the source's final sequence — no WAL
/// replay is carried across.
pub struct CompactionPlan {
    pub frames: Vec<(Frame, Vec<u8>)>,
    pub next_id: u64,
    pub carried_lex_blob: Option<Vec<u8>>,
    pub carried_vec_blob: Option<Vec<u8>>,
    pub source_final_sequence: u64,
}

pub fn plan_compaction(
    frames: &HashMap<FrameId, Frame>,
    payloads: &HashMap<FrameId, Vec<u8>>,
    next_id: u64,
    zero_dead_payloads: bool,
    carried_lex_blob: Option<Vec<u8>>,
    carried_vec_blob: Option<Vec<u8>>,
    source_final_sequence: u64,
) -> CompactionPlan {
    let mut out = Vec::with_capacity(frames.len());
    for (id, frame) in frames {
        let is_dead = frame.status == crate::frame::FrameStatus::Deleted || frame.superseded_by.is_some();
        let payload = payloads.get(id).cloned().unwrap_or_default();
        let payload = if is_dead && zero_dead_payloads { vec![0u8; payload.len()] } else { payload };
        out.push((frame.clone(), payload));
    }
    out.sort_by_key(|(f, _)| f.id);
    if out.is_empty() {
        warn!("compaction plan has no frames; destination archive will be empty");
    }
    CompactionPlan {
        frames: out,
        next_id,
        carried_lex_blob,
        carried_vec_blob,
        source_final_sequence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_advances_logical_stamp_and_flips_live_toc() {
        let header = SuperHeader::new(0, 256);
        let coordinator = CommitCoordinator::new(header);
        let before = coordinator.live_toc();

        let write = DataRegionWrite {
            frame_log_bytes: b"frame-log-bytes".to_vec(),
            frame_log_checksum: crc32fast::hash(b"frame-log-bytes") as u64,
        };
        let wal = WalRingWriter::new(4096, crate::wal::FsyncPolicy::OnCommit, crate::wal::AutoCommitPolicy::default());
        let staged = StagedArtifacts::default();
        let new_slot = coordinator.commit(write, &staged, &wal, 4096).unwrap();

        assert!(new_slot.logical_stamp.get() > before.logical_stamp.get());
        assert!(new_slot.verify().is_ok());
    }

    #[test]
    fn writer_lease_is_exclusive() {
        let header = SuperHeader::new(0, 256);
        let coordinator = CommitCoordinator::new(header);
        let _guard = coordinator.acquire_writer_lease().unwrap();
        assert!(coordinator.acquire_writer_lease().is_err());
    }

    #[test]
    fn lease_released_on_drop() {
        let header = SuperHeader::new(0, 256);
        let coordinator = CommitCoordinator::new(header);
        {
            let _guard = coordinator.acquire_writer_lease().unwrap();
        }
        assert!(coordinator.acquire_writer_lease().is_ok());
    }
}
