//! Archive/Session API: the façade composing the super-header, WAL, frame
//! store, commit coordinator, lexical/vector engines, search, and context
//! builder into the single entry point host applications use.
//!
//! The open-or-create protocol generalizes a single flat-file index lifecycle
//! into the super-header + WAL + data-region layout this crate defines.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use parking_lot::RwLock;
use tracing::{info, instrument, warn};

use crate::collaborators::{Embedder, ExecutionMode, TokenCounter, WhitespaceTokenCounter};
use crate::commit::{plan_compaction, CommitCoordinator, DataRegionWrite, StagedArtifacts};
use crate::config::RetrievalConfig;
use crate::context::{build_context, ContextDocument, ContextRequest};
use crate::error::{FrameId, RetrievalError, Result};
use crate::format::{SuperHeader, SUPER_HEADER_LEN};
use crate::frame::{Frame, FrameStore, PutOptions};
use crate::lexical::LexicalIndex;
use crate::search::{
    archive_identity, hybrid_search, EngineCache, EngineKindTag, FrameFilter, FusedResult, SearchMode,
    TextSourceKey, VectorSourceKey,
};
use crate::vector::cpu::CpuEngine;
use crate::vector::gpu::GpuEngine;
use crate::vector::{select_engine_order, EngineKind, SimilarityMetric, VectorEngine, VectorMatrix};
use crate::wal::{load_ring, persist_ring, FsyncPolicy, RecordKind, WalRingWriter};

/// What an open call for an embedder-bearing session must agree on before
/// any embeddings can be staged: dimension and normalization are enforced at
/// open rather than at every `stage_embedding`.
pub struct ArchiveOpenOptions<'a> {
    pub config: RetrievalConfig,
    pub embedder: Option<&'a dyn Embedder>,
    pub token_counter: Option<Box<dyn TokenCounter>>,
}

struct EngineState {
    similarity: SimilarityMetric,
    dimension: u32,
    lex_blob: Vec<u8>,
    vec_blob: Vec<u8>,
}

/// An open archive: owns the super-header, WAL, frame store, and the data
/// needed to rematerialize lexical/vector engines on demand via the shared
/// `EngineCache`.
pub struct Archive {
    path: PathBuf,
    coordinator: CommitCoordinator,
    wal: WalRingWriter,
    store: RwLock<FrameStore>,
    engines: RwLock<EngineState>,
    cache: EngineCache,
    config: RetrievalConfig,
    token_counter: Box<dyn TokenCounter>,
    archive_id: String,
}

const DATA_REGION_START: u64 = SUPER_HEADER_LEN as u64;

/// Process-wide registry of archive paths currently held open for writing.
/// `CommitCoordinator`'s own lease is per-instance and can't see a second,
/// independent `Archive::open` against the same file, so contention between
/// two open archives on one path is detected here instead.
fn writer_leases() -> &'static parking_lot::Mutex<HashSet<PathBuf>> {
    static LEASES: OnceLock<parking_lot::Mutex<HashSet<PathBuf>>> = OnceLock::new();
    LEASES.get_or_init(|| parking_lot::Mutex::new(HashSet::new()))
}

fn acquire_path_lease(path: &Path) -> Result<()> {
    let mut leases = writer_leases().lock();
    if !leases.insert(path.to_path_buf()) {
        return Err(RetrievalError::WriterContention(format!(
            "archive at {} already has an open writer",
            path.display()
        )));
    }
    Ok(())
}

fn release_path_lease(path: &Path) {
    writer_leases().lock().remove(path);
}

/// Rejects an `Embedder` that may reach the network when the caller asked
/// for on-device-only execution, before any I/O against `path` happens.
fn check_embedder_policy(opts: &ArchiveOpenOptions) -> Result<()> {
    if !opts.config.embedder_policy.require_on_device {
        return Ok(());
    }
    if let Some(mode) = opts.embedder.map(|e| e.execution_mode()) {
        if mode == ExecutionMode::MayUseNetwork {
            return Err(RetrievalError::ProviderRejected(
                "embedder execution_mode=may_use_network conflicts with require_on_device=true".to_string(),
            ));
        }
    }
    Ok(())
}

impl Archive {
    /// Open an existing archive, or create one at `path` if absent: selects
    /// the live TOC, verifies manifest checksums, then replays the WAL
    /// forward from the committed checkpoint.
    #[instrument(skip(opts))]
    pub fn open(path: impl AsRef<Path>, opts: ArchiveOpenOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        acquire_path_lease(&path)?;
        if let Err(e) = check_embedder_policy(&opts) {
            release_path_lease(&path);
            return Err(e);
        }
        let opened = if path.exists() { Self::open_existing(path.clone(), opts) } else { Self::create_new(path.clone(), opts) };
        if opened.is_err() {
            // Construction failed before an `Archive` exists to release the lease on drop.
            release_path_lease(&path);
        }
        opened
    }

    fn create_new(path: PathBuf, opts: ArchiveOpenOptions) -> Result<Self> {
        let dimension = opts.embedder.map(|e| e.dimension()).unwrap_or(0);
        let header = SuperHeader::new(0, dimension);
        let wal = WalRingWriter::new(
            opts.config.wal.ring_size_bytes,
            wal_fsync_policy(&opts.config),
            wal_auto_commit_policy(&opts.config),
        );
        let mut file = OpenOptions::new().create(true).read(true).write(true).truncate(true).open(&path)?;
        file.write_all(&header.to_padded_bytes())?;
        let mut wal_bytes = vec![0u8; opts.config.wal.ring_size_bytes as usize];
        wal_bytes.resize(opts.config.wal.ring_size_bytes as usize, 0);
        file.write_all(&wal_bytes)?;
        file.sync_all()?;

        let archive_id = archive_identity(&path.to_string_lossy(), 0);
        Ok(Self {
            path,
            coordinator: CommitCoordinator::new(header),
            wal,
            store: RwLock::new(FrameStore::new()),
            engines: RwLock::new(EngineState { similarity: SimilarityMetric::Cosine, dimension, lex_blob: Vec::new(), vec_blob: Vec::new() }),
            cache: EngineCache::new(),
            token_counter: opts.token_counter.unwrap_or_else(|| Box::new(WhitespaceTokenCounter)),
            config: opts.config,
            archive_id,
        })
    }

    fn open_existing(path: PathBuf, opts: ArchiveOpenOptions) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut header_bytes = vec![0u8; SUPER_HEADER_LEN];
        file.read_exact(&mut header_bytes)?;
        let header = SuperHeader::from_bytes(&header_bytes)?;
        let live = header.select_valid_toc()?;

        let wal_size = opts.config.wal.ring_size_bytes;
        file.seek(SeekFrom::Start(DATA_REGION_START))?;
        let wal_bytes = load_ring(&mut file, wal_size)?;
        let wal = WalRingWriter::from_persisted(
            wal_size,
            wal_fsync_policy(&opts.config),
            wal_auto_commit_policy(&opts.config),
            wal_bytes,
        )?;

        let mut frame_log_bytes = vec![0u8; live.frame_log_manifest.length.get() as usize];
        if !frame_log_bytes.is_empty() {
            file.seek(SeekFrom::Start(live.frame_log_manifest.offset.get()))?;
            file.read_exact(&mut frame_log_bytes)?;
            if crc32fast::hash(&frame_log_bytes) as u64 != live.frame_log_manifest.checksum.get() {
                return Err(RetrievalError::checksum_mismatch("frame log checksum mismatch at open"));
            }
        }
        let committed_frames: Vec<(Frame, Vec<u8>)> = if frame_log_bytes.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(&frame_log_bytes)
                .map_err(|e| RetrievalError::encoding(format!("frame log decode failed: {e}")))?
        };
        let next_id = committed_frames.iter().map(|(f, _)| f.id.0 + 1).max().unwrap_or(1);

        let mut store = FrameStore::new();
        store.load_committed(committed_frames, next_id);

        let mut lex_blob = Vec::new();
        if live.lex_manifest.length.get() > 0 {
            lex_blob = vec![0u8; live.lex_manifest.length.get() as usize];
            file.seek(SeekFrom::Start(live.lex_manifest.offset.get()))?;
            file.read_exact(&mut lex_blob)?;
        }
        let mut vec_blob = Vec::new();
        let mut similarity = SimilarityMetric::Cosine;
        if live.vec_manifest.length.get() > 0 {
            vec_blob = vec![0u8; live.vec_manifest.length.get() as usize];
            file.seek(SeekFrom::Start(live.vec_manifest.offset.get()))?;
            file.read_exact(&mut vec_blob)?;
            if let Ok((_, metric)) = VectorMatrix::deserialize(&vec_blob) {
                similarity = metric;
            }
        }

        let coordinator = CommitCoordinator::new(header);
        coordinator.replay_into(&mut store, &wal)?;

        let dimension = header.dimension_hint.get();
        let archive_id = archive_identity(&path.to_string_lossy(), live.logical_stamp.get());

        info!(logical_stamp = live.logical_stamp.get(), frames = store.frame_metas(true).len(), "archive opened");

        Ok(Self {
            path,
            coordinator,
            wal,
            store: RwLock::new(store),
            engines: RwLock::new(EngineState { similarity, dimension, lex_blob, vec_blob }),
            cache: EngineCache::new(),
            token_counter: opts.token_counter.unwrap_or_else(|| Box::new(WhitespaceTokenCounter)),
            config: opts.config,
            archive_id,
        })
    }

    /// Appends a staged mutation's WAL record. On `wal_full`, the mutation is
    /// already reflected in the in-memory pending overlay (the caller staged
    /// it into `FrameStore` before calling this), so forcing a commit makes it
    /// durable via the frame log directly — no retried append is needed
    /// afterward. This is the implicit `wal_full` retry named in the error
    /// taxonomy; every other error kind propagates as-is.
    fn append_or_commit_through(&self, kind: RecordKind, bytes: &[u8]) -> Result<()> {
        match self.wal.append(kind, bytes) {
            Ok(_) => Ok(()),
            Err(e) if e.is_retryable_wal_full() => {
                warn!("wal full: forcing a commit to reclaim ring space");
                self.commit()?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Returns a strictly increasing id; records a WAL `Put` record.
    pub fn put(&self, payload: Vec<u8>, options: PutOptions) -> Result<FrameId> {
        let mut store = self.store.write();
        let id = store.put(payload, options)?;
        let meta = store.frame_meta(id, false).expect("just-put frame is present in the pending overlay");
        let payload = store.frame_content(id, false).expect("just-put frame's payload is present");
        let bytes = serde_json::to_vec(&crate::frame::PendingMutation::Put { payload, meta: Box::new(meta) })
            .map_err(|e| RetrievalError::encoding(e.to_string()))?;
        drop(store); // `commit`'s retry path below takes its own write lock
        self.append_or_commit_through(RecordKind::Put, &bytes)?;
        Ok(id)
    }

    pub fn supersede(&self, old_id: FrameId, new_id: FrameId) -> Result<()> {
        let mut store = self.store.write();
        store.supersede(old_id, new_id)?;
        let bytes = serde_json::to_vec(&crate::frame::PendingMutation::Supersede { old_id, new_id })
            .map_err(|e| RetrievalError::encoding(e.to_string()))?;
        drop(store);
        self.append_or_commit_through(RecordKind::Supersede, &bytes)?;
        Ok(())
    }

    pub fn delete(&self, id: FrameId) -> Result<()> {
        let mut store = self.store.write();
        store.delete(id)?;
        let bytes = serde_json::to_vec(&crate::frame::PendingMutation::Delete { id })
            .map_err(|e| RetrievalError::encoding(e.to_string()))?;
        drop(store);
        self.append_or_commit_through(RecordKind::Delete, &bytes)?;
        Ok(())
    }

    pub fn stage_embedding(&self, frame_id: FrameId, vector: Vec<f32>, dimension: u32, normalized: bool) -> Result<u64> {
        let mut store = self.store.write();
        let sequence = store.stage_embedding(frame_id, vector.clone(), dimension, normalized)?;
        let embedding = crate::frame::Embedding { frame_id, dimension, vector, normalized, sequence };
        let bytes = serde_json::to_vec(&crate::frame::PendingMutation::StageEmbedding(embedding))
            .map_err(|e| RetrievalError::encoding(e.to_string()))?;
        drop(store); // `commit` below (direct or via the retry path) takes its own write lock
        self.append_or_commit_through(RecordKind::StageEmbedding, &bytes)?;
        if self.wal.should_auto_commit() {
            self.wal.note_auto_commit_fired();
            self.commit()?;
        }
        Ok(sequence)
    }

    /// Two-phase commit: rebuild the lex/vector blobs from the merged
    /// committed+pending view, write frame log + blobs past the data region,
    /// then hand the coordinator the manifests to flip.
    #[instrument(skip(self))]
    pub fn commit(&self) -> Result<u64> {
        let mut store = self.store.write();
        let mut engines = self.engines.write();

        if store.pending_mutations().is_empty() {
            // Nothing staged since the last commit: no new checkpoint, no TOC
            // flip. Matches `WalRingWriter::record_checkpoint`'s no-op when
            // there is nothing new to mark durable.
            return Ok(self.coordinator.live_toc().logical_stamp.get());
        }

        let merged_frames = store.frame_metas(false);
        let committed_frames: Vec<(Frame, Vec<u8>)> = merged_frames
            .iter()
            .map(|f| {
                let bytes = store.frame_content(f.id, false).unwrap_or_default();
                (f.clone(), bytes)
            })
            .collect();
        let frame_log_bytes = serde_json::to_vec(&committed_frames)
            .map_err(|e| RetrievalError::encoding(format!("frame log encode failed: {e}")))?;
        let frame_log_checksum = crc32fast::hash(&frame_log_bytes) as u64;

        // Rebuild the lexical index over every searchable frame's text.
        let mut lex_index = LexicalIndex::new();
        for frame in merged_frames.iter().filter(|f| f.is_searchable()) {
            if let Some(text) = &frame.search_text {
                lex_index.index(frame.id, text)?;
            }
        }
        let new_lex_blob = if lex_index.doc_count() == 0 { Vec::new() } else { lex_index.serialize()? };

        // Merge previously committed vectors with whatever's been staged since.
        // `dimension` is fixed per store (I6): once a blob exists its own
        // dimension wins; otherwise the first staged embedding establishes it
        // (the embedder's open-time hint is just that — a hint, not binding).
        let (pending_embeddings, _) = store.pending_embedding_mutations(None);
        let mut matrix = if engines.vec_blob.is_empty() {
            let dim = pending_embeddings.first().map(|e| e.dimension).unwrap_or(engines.dimension).max(1);
            VectorMatrix::new(dim as usize)
        } else {
            VectorMatrix::deserialize(&engines.vec_blob)?.0
        };
        for embedding in &pending_embeddings {
            matrix.add(embedding.frame_id, &embedding.vector)?;
        }
        let new_vec_blob = if matrix.count() == 0 { Vec::new() } else { matrix.serialize(engines.similarity) };
        let matrix_dimension = matrix.dim as u32;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let frame_log_offset = file.seek(SeekFrom::End(0))?.max(DATA_REGION_START + self.wal.size_hint());
        file.seek(SeekFrom::Start(frame_log_offset))?;
        file.write_all(&frame_log_bytes)?;
        file.write_all(&new_lex_blob)?;
        file.write_all(&new_vec_blob)?;
        file.sync_all()?;

        let staged = StagedArtifacts {
            lex_blob: if new_lex_blob.is_empty() { None } else { Some((new_lex_blob.clone(), lex_index.doc_count() as u64, 0)) },
            vec_blob: if new_vec_blob.is_empty() {
                None
            } else {
                Some((new_vec_blob.clone(), matrix.count() as u64, matrix_dimension, engines.similarity as u8))
            },
        };
        let write = DataRegionWrite { frame_log_bytes, frame_log_checksum };
        let new_slot = self.coordinator.commit(write, &staged, &self.wal, frame_log_offset)?;

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.coordinator.header_bytes())?;
        persist_ring(&self.wal, &mut file)?;
        file.sync_all()?;

        engines.lex_blob = new_lex_blob;
        engines.vec_blob = new_vec_blob;
        if matrix.count() > 0 {
            engines.dimension = matrix_dimension;
        }
        store.mark_committed();
        self.cache.evict(&self.archive_id);

        info!(logical_stamp = new_slot.logical_stamp.get(), "archive commit complete");
        Ok(new_slot.logical_stamp.get())
    }

    /// Unified hybrid search, resolving the engine cache against the current
    /// committed/pending state before fanning out.
    #[instrument(skip(self, query_text, query_embedding, filter))]
    pub fn search(
        &self,
        mode: SearchMode,
        query_text: Option<&str>,
        query_embedding: Option<&[f32]>,
        top_k: usize,
        filter: &FrameFilter,
    ) -> Result<Vec<FusedResult>> {
        let store = self.store.read();
        let engines = self.engines.read();

        let text_key = if engines.lex_blob.is_empty() {
            TextSourceKey::Empty
        } else {
            TextSourceKey::Committed(crc32fast::hash(&engines.lex_blob) as u64)
        };
        // When no vector blob has been committed yet, pending embeddings may
        // still exist (staged via `stage_embedding` ahead of the first
        // `commit`). In that case the cache key is `PendingOnly` rather than
        // `None`, so the cache materializes a fresh, empty engine that
        // `apply_pending_embeddings` below can populate — otherwise staged
        // embeddings would be invisible to `vector_only`/`hybrid` search
        // until the next commit, contradicting the pending-overlay design.
        let (pending_embeddings, latest_sequence) = store.pending_embedding_mutations(None);
        let pending_dimension = pending_embeddings.first().map(|e| e.dimension);
        let vector_key = if !engines.vec_blob.is_empty() {
            VectorSourceKey::Committed {
                checksum: crc32fast::hash(&engines.vec_blob) as u64,
                metric: engines.similarity as u8,
                dims: engines.dimension,
                engine_kind: EngineKindTag::Cpu,
            }
        } else if let Some(dims) = pending_dimension {
            VectorSourceKey::PendingOnly { dims, engine_kind: EngineKindTag::Cpu }
        } else {
            VectorSourceKey::None
        };

        let lex_blob = engines.lex_blob.clone();
        let vec_blob = engines.vec_blob.clone();
        let similarity = engines.similarity;
        let fallback_dimension = pending_dimension.unwrap_or(engines.dimension);
        let preference = self.config.vector_index.engine_preference.into();
        let selection_cfg = self.config.vector_index.selection_config();

        self.cache.resolve(
            &self.archive_id,
            text_key,
            vector_key,
            move || if lex_blob.is_empty() { None } else { LexicalIndex::deserialize(&lex_blob).ok() },
            move || {
                let matrix = if vec_blob.is_empty() {
                    if fallback_dimension == 0 {
                        return None;
                    }
                    VectorMatrix::new(fallback_dimension as usize)
                } else {
                    VectorMatrix::deserialize(&vec_blob).ok()?.0
                };
                let order = select_engine_order(preference, matrix.count(), top_k, selection_cfg);
                let kind = order.first().copied().unwrap_or(EngineKind::Cpu);
                let engine: Box<dyn VectorEngine> = match kind {
                    EngineKind::Cpu => Box::new(CpuEngine::from_matrix(matrix, similarity)),
                    EngineKind::Gpu => Box::new(GpuEngine::from_matrix(matrix, similarity)),
                };
                Some(engine)
            },
        );

        self.cache.apply_pending_embeddings(&self.archive_id, &pending_embeddings, latest_sequence);

        let results = self
            .cache
            .with_engines(&self.archive_id, |text_engine, vector_engine| {
                hybrid_search(
                    mode,
                    query_text,
                    query_embedding,
                    text_engine,
                    vector_engine,
                    top_k,
                    filter,
                    |id| store.frame_meta(id, false),
                )
            })
            .unwrap_or_default();
        for result in &results {
            store.note_access(result.frame_id);
        }
        Ok(results)
    }

    /// Assemble a token-budgeted context document from already-ranked
    /// search results.
    pub fn build_context(&self, request: &ContextRequest, ranked: &[FusedResult]) -> ContextDocument {
        let store = self.store.read();
        build_context(
            request,
            ranked,
            |id| store.frame_meta(id, false),
            |id| store.frame_content(id, false).ok(),
            |id| store.access_count(id),
            self.token_counter.as_ref(),
        )
    }

    /// Offline compaction: write a fresh archive file containing only live
    /// frames, at `dest`, with the TOC's live slot (stamp 1) pointing at the
    /// newly written frame log and any carried lex/vector blobs — the
    /// destination is immediately openable, not just a frame-log dump. The
    /// destination's WAL region is left zeroed with no WAL replay carried
    /// across; `committed_seq` starts at the source's final sequence.
    pub fn rewrite_live_set(&self, dest: impl AsRef<Path>, zero_dead_payloads: bool) -> Result<()> {
        let store = self.store.read();
        let engines = self.engines.read();
        let frames: HashMap<FrameId, Frame> = store.frame_metas(true).into_iter().map(|f| (f.id, f)).collect();
        let payloads: HashMap<FrameId, Vec<u8>> = frames
            .keys()
            .filter_map(|id| store.frame_content(*id, true).ok().map(|c| (*id, c)))
            .collect();
        let carried_lex_blob = if engines.lex_blob.is_empty() { None } else { Some(engines.lex_blob.clone()) };
        let carried_vec_blob = if engines.vec_blob.is_empty() { None } else { Some(engines.vec_blob.clone()) };
        let plan = plan_compaction(
            &frames,
            &payloads,
            store.next_id_hint(),
            zero_dead_payloads,
            carried_lex_blob,
            carried_vec_blob,
            self.wal.recover_stats().committed_seq,
        );

        let wal_size = self.config.wal.ring_size_bytes;
        let frame_log_bytes =
            serde_json::to_vec(&plan.frames).map_err(|e| RetrievalError::encoding(e.to_string()))?;
        let frame_log_checksum = crc32fast::hash(&frame_log_bytes) as u64;
        let frame_log_offset = DATA_REGION_START + wal_size;

        let lex_offset = frame_log_offset + frame_log_bytes.len() as u64;
        let lex_manifest = match &plan.carried_lex_blob {
            Some(bytes) => crate::format::Manifest::new(lex_offset, bytes.len() as u64, crc32fast::hash(bytes) as u64, 0),
            None => crate::format::Manifest::empty(),
        };
        let vec_offset = lex_offset + plan.carried_lex_blob.as_ref().map(|b| b.len() as u64).unwrap_or(0);
        let vec_manifest = match &plan.carried_vec_blob {
            Some(bytes) => crate::format::Manifest::new(vec_offset, bytes.len() as u64, crc32fast::hash(bytes) as u64, engines.dimension as u64),
            None => crate::format::Manifest::empty(),
        };

        let mut header = SuperHeader::new(0, engines.dimension);
        header.toc_slot_a.logical_stamp = zerocopy::byteorder::little_endian::U64::new(1);
        header.toc_slot_a.frame_log_manifest =
            crate::format::Manifest::new(frame_log_offset, frame_log_bytes.len() as u64, frame_log_checksum, 0);
        header.toc_slot_a.lex_manifest = lex_manifest;
        header.toc_slot_a.vec_manifest = vec_manifest;
        header.toc_slot_a.wal_region_offset = zerocopy::byteorder::little_endian::U64::new(DATA_REGION_START);
        header.toc_slot_a.wal_region_size = zerocopy::byteorder::little_endian::U64::new(wal_size);
        header.toc_slot_a.finalize_checksum();

        let mut file = File::create(dest.as_ref())?;
        file.write_all(&header.to_padded_bytes())?;
        file.write_all(&vec![0u8; wal_size as usize])?;
        file.write_all(&frame_log_bytes)?;
        if let Some(bytes) = &plan.carried_lex_blob {
            file.write_all(bytes)?;
        }
        if let Some(bytes) = &plan.carried_vec_blob {
            file.write_all(bytes)?;
        }
        file.sync_all()?;
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        Ok(())
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        self.cache.evict(&self.archive_id);
        release_path_lease(&self.path);
    }
}

fn wal_fsync_policy(cfg: &RetrievalConfig) -> FsyncPolicy {
    match cfg.wal.fsync_policy {
        crate::config::WalFsyncPolicyConfig::OnCommit => FsyncPolicy::OnCommit,
        crate::config::WalFsyncPolicyConfig::EveryNBytes { bytes } => FsyncPolicy::EveryNBytes(bytes),
        crate::config::WalFsyncPolicyConfig::EveryRecord => FsyncPolicy::EveryRecord,
    }
}

fn wal_auto_commit_policy(cfg: &RetrievalConfig) -> crate::wal::AutoCommitPolicy {
    crate::wal::AutoCommitPolicy {
        threshold_percent: cfg.wal.proactive_commit_threshold_percent,
        max_wal_size_bytes: cfg.wal.proactive_commit_max_wal_size_bytes,
        min_pending_bytes: cfg.wal.proactive_commit_min_pending_bytes,
    }
}
