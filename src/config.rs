//! Configuration surface consumed at archive open, plus the engine-selection
//! and context-builder knobs that make the surface complete for a standalone
//! crate.
//!
//! One `#[serde(default)]` struct per concern, a top-level struct composing
//! them, and a best-effort TOML loader that falls back to defaults on any
//! parse failure.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::vector::{EngineSelectionConfig, EnginePreference};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalFsyncPolicyConfig {
    OnCommit,
    EveryNBytes { bytes: u64 },
    EveryRecord,
}

impl Default for WalFsyncPolicyConfig {
    fn default() -> Self {
        Self::OnCommit
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    pub fsync_policy: WalFsyncPolicyConfig,
    pub ring_size_bytes: u64,
    pub proactive_commit_threshold_percent: Option<u8>,
    pub proactive_commit_max_wal_size_bytes: Option<u64>,
    pub proactive_commit_min_pending_bytes: u64,
    pub replay_state_snapshot_enabled: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            fsync_policy: WalFsyncPolicyConfig::default(),
            ring_size_bytes: 16 * 1024 * 1024,
            proactive_commit_threshold_percent: Some(80),
            proactive_commit_max_wal_size_bytes: None,
            proactive_commit_min_pending_bytes: 64 * 1024,
            replay_state_snapshot_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePreferenceConfig {
    CpuOnly,
    GpuPreferred,
    Auto,
}

impl From<EnginePreferenceConfig> for EnginePreference {
    fn from(v: EnginePreferenceConfig) -> Self {
        match v {
            EnginePreferenceConfig::CpuOnly => EnginePreference::CpuOnly,
            EnginePreferenceConfig::GpuPreferred => EnginePreference::GpuPreferred,
            EnginePreferenceConfig::Auto => EnginePreference::Auto,
        }
    }
}

impl Default for EnginePreferenceConfig {
    fn default() -> Self {
        Self::Auto
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorIndexConfig {
    pub engine_preference: EnginePreferenceConfig,
    pub metal_auto_count_threshold: usize,
    pub metal_auto_topk_cap: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        let defaults = EngineSelectionConfig::default();
        Self {
            engine_preference: EnginePreferenceConfig::default(),
            metal_auto_count_threshold: defaults.metal_auto_count_threshold,
            metal_auto_topk_cap: defaults.metal_auto_topk_cap,
        }
    }
}

impl VectorIndexConfig {
    pub fn selection_config(&self) -> EngineSelectionConfig {
        EngineSelectionConfig {
            metal_auto_count_threshold: self.metal_auto_count_threshold,
            metal_auto_topk_cap: self.metal_auto_topk_cap,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoQueueQos {
    UserInteractive,
    UserInitiated,
    Utility,
    Background,
}

impl Default for IoQueueQos {
    fn default() -> Self {
        Self::UserInitiated
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextBuilderConfig {
    pub max_context_tokens: usize,
    pub expansion_max_tokens: usize,
    pub snippet_max_tokens: usize,
    pub max_snippets: usize,
    pub max_surrogates: usize,
    pub surrogate_max_tokens: usize,
    pub search_top_k: usize,
    /// `age_only` policy: below this age, a surrogate stays at the `full` tier.
    pub surrogate_recent_days: u64,
    /// `age_only` policy: at or beyond this age, a surrogate drops to `micro`;
    /// between `recent` and `old` it's `gist`.
    pub surrogate_old_days: u64,
    /// `importance` policy: surrogates scoring at or above this (on a 0..1
    /// weighted-recency-plus-frequency scale) stay at `full`.
    pub surrogate_importance_full_threshold: f64,
    /// `importance` policy: surrogates scoring at or above this, but below
    /// `surrogate_importance_full_threshold`, get `gist`; below it, `micro`.
    pub surrogate_importance_gist_threshold: f64,
}

impl Default for ContextBuilderConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 4_000,
            expansion_max_tokens: 512,
            snippet_max_tokens: 256,
            max_snippets: 20,
            max_surrogates: 4,
            surrogate_max_tokens: 128,
            search_top_k: 50,
            surrogate_recent_days: 7,
            surrogate_old_days: 30,
            surrogate_importance_full_threshold: 0.66,
            surrogate_importance_gist_threshold: 0.33,
        }
    }
}

/// Advisory dispatch hints; neither affects correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IoQueueConfig {
    pub label: String,
    pub qos: IoQueueQos,
}

impl Default for IoQueueConfig {
    fn default() -> Self {
        Self { label: "retrieval-core.io".to_string(), qos: IoQueueQos::default() }
    }
}

/// Policy governing which embedding collaborators a session will accept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderPolicyConfig {
    /// Reject an `Embedder` whose `execution_mode()` is `may_use_network`
    /// instead of opening the session with it.
    pub require_on_device: bool,
}

impl Default for EmbedderPolicyConfig {
    fn default() -> Self {
        Self { require_on_device: false }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub wal: WalConfig,
    pub vector_index: VectorIndexConfig,
    pub context_builder: ContextBuilderConfig,
    pub io_queue: IoQueueConfig,
    pub embedder_policy: EmbedderPolicyConfig,
}

/// Best-effort TOML loader: a missing or unparsable file falls back to
/// `RetrievalConfig::default()` rather than failing archive open.
pub fn load_config(path: &Path) -> RetrievalConfig {
    let Ok(text) = std::fs::read_to_string(path) else { return RetrievalConfig::default() };
    toml::from_str(&text).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "retrieval config malformed, falling back to defaults");
        RetrievalConfig::default()
    })
}
