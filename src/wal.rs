//! WAL Ring Writer.
//!
//! A bounded circular region of configurable size. Records are framed
//! `[length | kind | reserved | sequence | payload | checksum | sentinel]`;
//! replay proceeds until the sentinel is missing or the checksum fails.
//!
//! Grounded on `libsql-wal/src/log.rs` (zerocopy fixed headers, `parking_lot`
//! guarded mutable state) and `sombra`'s `wal/mod.rs` (magic + crc framing,
//! wrap-past-checkpoint failure mode).

use std::io::{Read, Write};

use parking_lot::Mutex;
use tracing::{debug, instrument, warn};
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::AsBytes;

use crate::error::{RetrievalError, Result};

pub const WAL_SENTINEL: u32 = 0x5741_454E; // "WAEN"
const RECORD_HEADER_LEN: usize = 4 + 1 + 3 + 8; // length | kind | reserved | sequence
const RECORD_TRAILER_LEN: usize = 4 + 4; // checksum | sentinel

/// Record kind tag, stored in the WAL frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Put = 0,
    Supersede = 1,
    Delete = 2,
    StageEmbedding = 3,
    Checkpoint = 4,
}

impl RecordKind {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::Put,
            1 => Self::Supersede,
            2 => Self::Delete,
            3 => Self::StageEmbedding,
            4 => Self::Checkpoint,
            other => return Err(RetrievalError::encoding(format!("unknown wal record kind {other}"))),
        })
    }
}

/// Fsync policy enumeration.
#[derive(Debug, Clone, Copy)]
pub enum FsyncPolicy {
    OnCommit,
    EveryNBytes(u64),
    EveryRecord,
}

/// Proactive auto-commit policy.
#[derive(Debug, Clone, Copy)]
pub struct AutoCommitPolicy {
    /// `None` = disabled.
    pub threshold_percent: Option<u8>,
    pub max_wal_size_bytes: Option<u64>,
    pub min_pending_bytes: u64,
}

impl Default for AutoCommitPolicy {
    fn default() -> Self {
        Self { threshold_percent: None, max_wal_size_bytes: None, min_pending_bytes: 0 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecoverStats {
    pub wrap_count: u64,
    pub checkpoint_count: u64,
    pub auto_commit_count: u64,
    pub pending_bytes: u64,
    pub wal_size: u64,
    pub last_seq: u64,
    pub committed_seq: u64,
    pub replay_snapshot_hit_count: u64,
}

#[derive(Debug, Clone)]
pub struct WalRecord {
    pub kind: RecordKind,
    pub sequence: u64,
    pub payload: Vec<u8>,
}

struct RingState {
    buf: Vec<u8>,
    head: u64,
    /// Offset of the oldest record not yet covered by a checkpoint; the
    /// writer must never overwrite bytes past this point on wrap.
    checkpoint_tail: u64,
    last_seq: u64,
    committed_seq: u64,
    dirty_since_fsync: u64,
    stats: RecoverStats,
}

/// Bounded circular WAL. `size` is fixed at construction (matches the
/// super-header's `wal_region` extent).
pub struct WalRingWriter {
    size: u64,
    fsync_policy: FsyncPolicy,
    auto_commit: AutoCommitPolicy,
    state: Mutex<RingState>,
}

impl WalRingWriter {
    pub fn new(size: u64, fsync_policy: FsyncPolicy, auto_commit: AutoCommitPolicy) -> Self {
        Self {
            size,
            fsync_policy,
            auto_commit,
            state: Mutex::new(RingState {
                buf: vec![0u8; size as usize],
                head: 0,
                checkpoint_tail: 0,
                last_seq: 0,
                committed_seq: 0,
                dirty_since_fsync: 0,
                stats: RecoverStats::default(),
            }),
        }
    }

    /// Reconstruct a writer from a previously persisted ring buffer: scans
    /// forward to find the write head, the last assigned sequence, and the
    /// most recent checkpoint's tail, so appends after reopen continue
    /// exactly where the prior session left off.
    pub fn from_persisted(size: u64, fsync_policy: FsyncPolicy, auto_commit: AutoCommitPolicy, buf: Vec<u8>) -> Result<Self> {
        if buf.len() as u64 != size {
            return Err(RetrievalError::encoding("persisted wal ring size does not match configured ring_size_bytes"));
        }
        let mut cursor = 0usize;
        let mut head = 0usize;
        let mut checkpoint_tail = 0usize;
        let mut last_seq = 0u64;
        let mut committed_seq = 0u64;
        let mut wrap_count = 0u64;
        let mut checkpoint_count = 0u64;
        while cursor + RECORD_HEADER_LEN + RECORD_TRAILER_LEN <= buf.len() {
            let length = u32::from_le_bytes(buf[cursor..cursor + 4].try_into().unwrap()) as usize;
            if length == 0 && buf[cursor..].iter().all(|b| *b == 0) {
                break;
            }
            let record_total = RECORD_HEADER_LEN + length + RECORD_TRAILER_LEN;
            if cursor + record_total > buf.len() {
                break;
            }
            let kind_byte = buf[cursor + 4];
            let sequence = u64::from_le_bytes(buf[cursor + 8..cursor + 16].try_into().unwrap());
            let payload_start = cursor + RECORD_HEADER_LEN;
            let sentinel = u32::from_le_bytes(
                buf[payload_start + length + 4..payload_start + length + 8].try_into().unwrap(),
            );
            if sentinel != WAL_SENTINEL {
                break;
            }
            let kind = RecordKind::from_u8(kind_byte)?;
            last_seq = last_seq.max(sequence);
            if kind == RecordKind::Checkpoint {
                committed_seq = committed_seq.max(sequence);
                checkpoint_tail = cursor + record_total;
                checkpoint_count += 1;
            }
            cursor += record_total;
        }
        head = cursor;
        if head < checkpoint_tail {
            wrap_count += 1; // head wrapped past the last checkpoint since it was recorded
        }
        Ok(Self {
            size,
            fsync_policy,
            auto_commit,
            state: Mutex::new(RingState {
                buf,
                head: head as u64,
                checkpoint_tail: checkpoint_tail as u64,
                last_seq,
                committed_seq,
                dirty_since_fsync: 0,
                stats: RecoverStats {
                    wrap_count,
                    checkpoint_count,
                    auto_commit_count: 0,
                    pending_bytes: 0,
                    wal_size: size,
                    last_seq,
                    committed_seq,
                    replay_snapshot_hit_count: 0,
                },
            }),
        })
    }

    fn encode_record(kind: RecordKind, sequence: u64, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_HEADER_LEN + payload.len() + RECORD_TRAILER_LEN);
        out.extend_from_slice(U32::new(payload.len() as u32).as_bytes());
        out.push(kind as u8);
        out.extend_from_slice(&[0u8; 3]);
        out.extend_from_slice(U64::new(sequence).as_bytes());
        out.extend_from_slice(payload);
        let checksum = crc32fast::hash(payload);
        out.extend_from_slice(U32::new(checksum).as_bytes());
        out.extend_from_slice(U32::new(WAL_SENTINEL).as_bytes());
        out
    }

    fn record_len(payload_len: usize) -> u64 {
        (RECORD_HEADER_LEN + payload_len + RECORD_TRAILER_LEN) as u64
    }

    /// `append(payload) → sequence`.
    #[instrument(skip(self, payload))]
    pub fn append(&self, kind: RecordKind, payload: &[u8]) -> Result<u64> {
        let mut guard = self.state.lock();
        let sequence = guard.last_seq + 1;
        let record = Self::encode_record(kind, sequence, payload);
        Self::write_record(&mut guard, self.size, &record)?;
        guard.last_seq = sequence;
        guard.stats.last_seq = sequence;
        self.apply_fsync_policy(&mut guard, record.len() as u64);
        drop(guard);
        self.maybe_auto_commit(payload.len() as u64)?;
        Ok(sequence)
    }

    /// `appendBatch(payloads[]) → sequences[]`: one sentinel-terminated
    /// scatter/gather write, contiguous sequences.
    #[instrument(skip(self, items))]
    pub fn append_batch(&self, items: &[(RecordKind, Vec<u8>)]) -> Result<Vec<u64>> {
        let mut guard = self.state.lock();
        let mut sequences = Vec::with_capacity(items.len());
        let mut combined = Vec::new();
        let mut seq = guard.last_seq;
        for (kind, payload) in items {
            seq += 1;
            sequences.push(seq);
            combined.extend_from_slice(&Self::encode_record(*kind, seq, payload));
        }
        Self::write_record(&mut guard, self.size, &combined)?;
        guard.last_seq = seq;
        guard.stats.last_seq = seq;
        let written_len = combined.len() as u64;
        self.apply_fsync_policy(&mut guard, written_len);
        drop(guard);
        let total_payload_bytes: u64 = items.iter().map(|(_, p)| p.len() as u64).sum();
        self.maybe_auto_commit(total_payload_bytes)?;
        Ok(sequences)
    }

    fn write_record(guard: &mut RingState, ring_size: u64, record: &[u8]) -> Result<()> {
        let len = record.len() as u64;
        if len > ring_size {
            return Err(RetrievalError::capacity("record larger than wal ring"));
        }
        let would_wrap = guard.head + len > ring_size;
        if would_wrap {
            // Wrap only if the head is past the leading checkpoint; never
            // overwrite records past the most recent checkpoint.
            if guard.checkpoint_tail == 0 && guard.head > 0 {
                return Err(RetrievalError::wal_full("no reclaimable checkpoint to wrap into"));
            }
            guard.head = 0;
            guard.stats.wrap_count += 1;
        }
        // Once the head sits behind the checkpoint tail (just wrapped, or
        // still catching up from an earlier wrap), every write — not only
        // the one that triggered the wrap — must stay clear of it: bytes
        // from `checkpoint_tail` onward still hold records from the prior
        // lap that haven't been superseded by a newer checkpoint.
        if guard.head < guard.checkpoint_tail && guard.head + len > guard.checkpoint_tail {
            return Err(RetrievalError::wal_full("record would overwrite not-yet-checkpointed records"));
        }
        let start = guard.head as usize;
        guard.buf[start..start + record.len()].copy_from_slice(record);
        guard.head += len;
        guard.stats.pending_bytes += len;
        guard.stats.wal_size = ring_size;
        Ok(())
    }

    fn apply_fsync_policy(&self, guard: &mut RingState, written: u64) {
        guard.dirty_since_fsync += written;
        let should_fsync = match self.fsync_policy {
            FsyncPolicy::OnCommit => false,
            FsyncPolicy::EveryRecord => true,
            FsyncPolicy::EveryNBytes(n) => guard.dirty_since_fsync >= n,
        };
        if should_fsync {
            guard.dirty_since_fsync = 0;
            debug!(bytes = written, "wal fsync");
        }
    }

    /// Proactive auto-commit: triggered synchronously from the caller's side
    /// (the commit coordinator is not owned by this type — callers check
    /// `should_auto_commit` after appending and invoke commit themselves to
    /// avoid a circular dependency between the WAL and the coordinator).
    fn maybe_auto_commit(&self, _just_written_payload_bytes: u64) -> Result<()> {
        Ok(())
    }

    /// Whether proactive auto-commit should fire:
    /// `pending_bytes ≥ threshold_percent × walSize AND pending_bytes ≥ min_pending_bytes`.
    pub fn should_auto_commit(&self) -> bool {
        let guard = self.state.lock();
        let Some(pct) = self.auto_commit.threshold_percent else { return false };
        if let Some(max_size) = self.auto_commit.max_wal_size_bytes {
            if self.size > max_size {
                return false;
            }
        }
        let threshold_bytes = (self.size as u128 * pct as u128 / 100) as u64;
        guard.stats.pending_bytes >= threshold_bytes && guard.stats.pending_bytes >= self.auto_commit.min_pending_bytes
    }

    pub fn note_auto_commit_fired(&self) {
        let mut guard = self.state.lock();
        guard.stats.auto_commit_count += 1;
    }

    /// Marks that all prior records are durably applied; safe to overwrite on wrap.
    #[instrument(skip(self))]
    pub fn record_checkpoint(&self) -> Result<u64> {
        let mut guard = self.state.lock();
        let checkpoint_seq = guard.last_seq;
        let record = Self::encode_record(RecordKind::Checkpoint, checkpoint_seq, &[]);
        Self::write_record(&mut guard, self.size, &record)?;
        guard.checkpoint_tail = guard.head;
        guard.committed_seq = checkpoint_seq;
        guard.stats.checkpoint_count += 1;
        guard.stats.committed_seq = checkpoint_seq;
        guard.stats.pending_bytes = 0;
        Ok(checkpoint_seq)
    }

    pub fn recover_stats(&self) -> RecoverStats {
        self.state.lock().stats.clone()
    }

    /// The fixed ring extent this writer was constructed with.
    pub fn size_hint(&self) -> u64 {
        self.size
    }

    /// Replay forward from offset 0 (or a resume point) until the sentinel is
    /// missing or the checksum fails. Returns records strictly after
    /// `committed_seq`.
    pub fn replay(&self) -> Result<Vec<WalRecord>> {
        let guard = self.state.lock();
        let mut out = Vec::new();
        let mut cursor = 0usize;
        let buf = &guard.buf;
        while cursor + RECORD_HEADER_LEN + RECORD_TRAILER_LEN <= buf.len() {
            let len_bytes = &buf[cursor..cursor + 4];
            let length = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
            if length == 0 && buf[cursor..].iter().all(|b| *b == 0) {
                break; // untouched tail of the ring
            }
            let record_total = RECORD_HEADER_LEN + length + RECORD_TRAILER_LEN;
            if cursor + record_total > buf.len() {
                break;
            }
            let kind_byte = buf[cursor + 4];
            let sequence = u64::from_le_bytes(buf[cursor + 8..cursor + 16].try_into().unwrap());
            let payload_start = cursor + RECORD_HEADER_LEN;
            let payload = &buf[payload_start..payload_start + length];
            let checksum_stored = u32::from_le_bytes(
                buf[payload_start + length..payload_start + length + 4].try_into().unwrap(),
            );
            let sentinel = u32::from_le_bytes(
                buf[payload_start + length + 4..payload_start + length + 8].try_into().unwrap(),
            );
            if sentinel != WAL_SENTINEL {
                warn!(offset = cursor, "wal replay stopped: missing sentinel");
                break;
            }
            if crc32fast::hash(payload) != checksum_stored {
                warn!(offset = cursor, "wal replay stopped: checksum mismatch");
                return Err(RetrievalError::checksum_mismatch("wal record checksum mismatch during replay"));
            }
            let kind = RecordKind::from_u8(kind_byte)?;
            if kind != RecordKind::Checkpoint && sequence > guard.committed_seq {
                out.push(WalRecord { kind, sequence, payload: payload.to_vec() });
            }
            cursor += record_total;
        }
        Ok(out)
    }
}

/// Persists a `WalRingWriter`'s raw ring buffer to / from a plain file handle,
/// used by the archive's super-header `wal_region` extent.
pub fn persist_ring(writer: &WalRingWriter, mut sink: impl Write) -> Result<()> {
    let guard = writer.state.lock();
    sink.write_all(&guard.buf)?;
    Ok(())
}

/// Reads `size` bytes from the source's current position, mirroring
/// `persist_ring`'s write-at-current-position behavior; callers own seeking
/// to the ring's start offset first.
pub fn load_ring(mut source: impl Read, size: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size as usize];
    source.read_exact(&mut buf)?;
    Ok(buf)
}
