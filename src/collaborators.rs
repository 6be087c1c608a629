//! Collaborator interfaces: the core consumes these; concrete implementations
//! (an on-device embedding model, OCR/caption/transcript providers, media
//! decoders) are out of scope and supplied by the host application.

use async_trait::async_trait;

use crate::error::Result;

/// Identity of an embedding provider, used to validate store-wide
/// `dimension`/`normalized` invariants at session open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedderIdentity {
    pub provider: String,
    pub model: String,
    pub dims: u32,
    pub normalized: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    OnDeviceOnly,
    MayUseNetwork,
}

/// Cheap & pure-ish; may be async. A producer may be rejected if
/// `require_on_device=true` and `execution_mode=may_use_network`
/// (`RetrievalError::ProviderRejected`, surfaced at session open).
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn dimension(&self) -> u32;
    fn normalize(&self) -> bool;
    fn identity(&self) -> EmbedderIdentity;
    fn execution_mode(&self) -> ExecutionMode;
}

/// Deterministic: same input always produces the same output. Backs the
/// context builder's token budget accounting.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
    fn truncate(&self, text: &str, max_tokens: usize) -> String;
}

/// Produces `(text, metadata, capture_time_ms)` tuples from a source URL.
/// Called by ingest orchestrators; out of scope for this crate beyond the
/// trait shape it must satisfy to feed `FrameStore::put`.
pub trait Extractor: Send + Sync {
    fn extract(&self, source_url: &str) -> Result<Vec<ExtractedChunk>>;
}

pub struct ExtractedChunk {
    pub text: String,
    pub metadata: std::collections::HashMap<String, String>,
    pub capture_time_ms: u64,
}

/// A whitespace/word-boundary token counter, used as the default when the
/// host application doesn't supply a model-specific tokenizer. Deterministic
/// by construction: the same string always yields the same count.
pub struct WhitespaceTokenCounter;

impl TokenCounter for WhitespaceTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }

    fn truncate(&self, text: &str, max_tokens: usize) -> String {
        text.split_whitespace().take(max_tokens).collect::<Vec<_>>().join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_counter_is_deterministic() {
        let counter = WhitespaceTokenCounter;
        let text = "the quick brown fox jumps";
        assert_eq!(counter.count(text), counter.count(text));
        assert_eq!(counter.truncate(text, 2), "the quick");
    }
}
