//! Error taxonomy for the retrieval core.
//!
//! One variant per error kind named in the design (not per call site): callers
//! match on kind to decide whether a fallback path exists (TOC A→B on open,
//! engine A→B on cache materialization) rather than on a message string.

use std::fmt;

pub type Result<T> = std::result::Result<T, RetrievalError>;

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    /// Disk/filesystem failure at the syscall boundary. Often recoverable by retry.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// TOC checksum or version mismatch; caller should fall back to the alternate slot.
    #[error("invalid toc: {0}")]
    InvalidToc(String),

    /// Serialization constraint violated: dimension mismatch, bad magic, wrong version.
    #[error("encoding error: {0}")]
    EncodingError(String),

    /// Beyond a configured limit (dimension, vector count, top-k cap).
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// No reclaimable checkpoint to wrap into; retried once after an auto-commit.
    #[error("wal full: {0}")]
    WalFull(String),

    /// Reference to a frame id that does not exist.
    #[error("frame not found: {0}")]
    FrameNotFound(FrameId),

    /// Failed to acquire the single-writer lease; caller retries with backoff.
    #[error("writer contention: {0}")]
    WriterContention(String),

    /// Payload integrity violated at read time.
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// An embedder violated the on-device execution policy.
    #[error("provider rejected: {0}")]
    ProviderRejected(String),

    /// Cancellation observed at a suspension point. Never silently converted to success.
    #[error("canceled")]
    Canceled,
}

impl RetrievalError {
    pub fn invalid_toc(msg: impl Into<String>) -> Self {
        Self::InvalidToc(msg.into())
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::EncodingError(msg.into())
    }

    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::CapacityExceeded(msg.into())
    }

    pub fn wal_full(msg: impl Into<String>) -> Self {
        Self::WalFull(msg.into())
    }

    pub fn checksum_mismatch(msg: impl Into<String>) -> Self {
        Self::ChecksumMismatch(msg.into())
    }

    /// `wal_full` is the only kind this engine retries implicitly (after auto-commit).
    pub fn is_retryable_wal_full(&self) -> bool {
        matches!(self, Self::WalFull(_))
    }
}

/// Monotone 64-bit frame identifier. Never reused within a store's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct FrameId(pub u64);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
