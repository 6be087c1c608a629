//! Context Builder: deterministic, token-budgeted assembly of search results
//! into a single context document.
//!
//! Greedy fill-to-budget over ranked hits, with surrogate-tiered substitution
//! for frames whose own content would blow the budget.

use std::collections::HashSet;

use crate::collaborators::TokenCounter;
use crate::config::ContextBuilderConfig;
use crate::error::FrameId;
use crate::frame::{Frame, FrameRole, FrameStatus};
use crate::search::FusedResult;

/// Controls whether full payload bytes or only frame metadata back each
/// included snippet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    /// Re-read payload bytes for every candidate frame.
    Fast,
    /// Reuse whatever's already materialized in the frame store / cache.
    DenseCached,
}

/// Which surrogate tier to substitute when a frame's own content would
/// blow the budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SurrogatePolicy {
    Disabled,
    /// `recent_days`/`old_days` bound the `full`/`gist`/`micro` thresholds.
    AgeOnly { recent_days_ms: u64, old_days_ms: u64 },
    /// `full_threshold`/`gist_threshold` bound a 0..1 weighted
    /// recency-plus-access-frequency score.
    Importance { full_threshold: f64, gist_threshold: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SurrogateTier {
    Full,
    Gist,
    Micro,
}

#[derive(Debug, Clone)]
pub struct ContextRequest {
    pub mode: ContextMode,
    pub surrogate_policy: SurrogatePolicy,
    pub max_context_tokens: usize,
    pub snippet_max_tokens: usize,
    pub max_snippets: usize,
    pub max_surrogates: usize,
    pub surrogate_max_tokens: usize,
    /// Frozen wall-clock for age-based surrogate selection; tests and replay
    /// pass this explicitly instead of reading the real clock, keeping the
    /// builder pure.
    pub deterministic_now_ms: Option<u64>,
}

const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

impl ContextRequest {
    pub fn from_config(cfg: &ContextBuilderConfig) -> Self {
        Self {
            mode: ContextMode::DenseCached,
            surrogate_policy: SurrogatePolicy::AgeOnly {
                recent_days_ms: cfg.surrogate_recent_days * MS_PER_DAY,
                old_days_ms: cfg.surrogate_old_days * MS_PER_DAY,
            },
            max_context_tokens: cfg.max_context_tokens,
            snippet_max_tokens: cfg.snippet_max_tokens,
            max_snippets: cfg.max_snippets,
            max_surrogates: cfg.max_surrogates,
            surrogate_max_tokens: cfg.surrogate_max_tokens,
            deterministic_now_ms: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextSnippet {
    pub frame_id: FrameId,
    pub kind: String,
    pub text: String,
    pub tokens: usize,
    pub tier: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct ContextDocument {
    pub snippets: Vec<ContextSnippet>,
    pub total_tokens: usize,
    /// Candidates that were ranked but dropped once the budget ran out.
    pub omitted_frame_ids: Vec<FrameId>,
}

impl ContextDocument {
    /// Final plain-text render: one snippet per line, ranked order preserved.
    pub fn render(&self) -> String {
        self.snippets.iter().map(|s| s.text.as_str()).collect::<Vec<_>>().join("\n\n")
    }
}

const SEVEN_DAYS_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Recency half-life used to fold a frame's age into the `importance`
/// policy's 0..1 score: a frame this old contributes half the recency
/// weight of a brand-new one.
const IMPORTANCE_RECENCY_HALF_LIFE_MS: f64 = 14.0 * 24.0 * 60.0 * 60.0 * 1000.0;
/// Access count treated as "saturating" the frequency term (diminishing
/// returns past this many hits via a log curve).
const IMPORTANCE_FREQUENCY_SATURATION: f64 = 20.0;
const IMPORTANCE_RECENCY_WEIGHT: f64 = 0.6;
const IMPORTANCE_FREQUENCY_WEIGHT: f64 = 0.4;

/// `score = weighted recency + access frequency`, both folded onto 0..1:
/// recency decays exponentially with age, frequency grows logarithmically
/// with access count and saturates past `IMPORTANCE_FREQUENCY_SATURATION`.
fn importance_score(frame: &Frame, access_count: u64, now_ms: u64) -> f64 {
    let age_ms = now_ms.saturating_sub(frame.timestamp_ms) as f64;
    let recency = 0.5f64.powf(age_ms / IMPORTANCE_RECENCY_HALF_LIFE_MS);
    let frequency = (1.0 + access_count as f64).ln() / (1.0 + IMPORTANCE_FREQUENCY_SATURATION).ln();
    IMPORTANCE_RECENCY_WEIGHT * recency + IMPORTANCE_FREQUENCY_WEIGHT * frequency.min(1.0)
}

fn choose_tier(policy: SurrogatePolicy, frame: &Frame, access_count: u64, now_ms: u64) -> SurrogateTier {
    match policy {
        SurrogatePolicy::Disabled => SurrogateTier::Full,
        SurrogatePolicy::AgeOnly { recent_days_ms, old_days_ms } => {
            let age = now_ms.saturating_sub(frame.timestamp_ms);
            if age < recent_days_ms {
                SurrogateTier::Full
            } else if age < old_days_ms {
                SurrogateTier::Gist
            } else {
                SurrogateTier::Micro
            }
        }
        SurrogatePolicy::Importance { full_threshold, gist_threshold } => {
            let score = importance_score(frame, access_count, now_ms);
            if score >= full_threshold {
                SurrogateTier::Full
            } else if score >= gist_threshold {
                SurrogateTier::Gist
            } else {
                SurrogateTier::Micro
            }
        }
    }
}

/// Greedy, deterministic context assembly: walk fused search results in rank
/// order, fetch each candidate's own content at the `full` tier, then (in
/// `dense_cached` mode) attempt to fold in a tiered surrogate of its parent
/// document, truncating everything to fit. Stops the moment a candidate
/// would push cumulative tokens past `max_context_tokens` — items already
/// emitted are never re-sorted or evicted to make room for a later one.
/// Identical inputs always produce an identical `ContextDocument`.
pub fn build_context(
    request: &ContextRequest,
    ranked: &[FusedResult],
    frame_lookup: impl Fn(FrameId) -> Option<Frame>,
    content_lookup: impl Fn(FrameId) -> Option<Vec<u8>>,
    access_count_lookup: impl Fn(FrameId) -> u64,
    token_counter: &dyn TokenCounter,
) -> ContextDocument {
    let now_ms = request.deterministic_now_ms.unwrap_or(0);
    let mut snippets = Vec::new();
    let mut omitted = Vec::new();
    let mut budget_used = 0usize;
    let mut surrogate_count = 0usize;
    let mut seen: HashSet<FrameId> = HashSet::new();
    let mut surrogated_parents: HashSet<FrameId> = HashSet::new();

    for result in ranked {
        if snippets.len() >= request.max_snippets {
            omitted.push(result.frame_id);
            continue;
        }
        if !seen.insert(result.frame_id) {
            continue;
        }
        let Some(frame) = frame_lookup(result.frame_id) else {
            omitted.push(result.frame_id);
            continue;
        };
        if frame.status != FrameStatus::Active || frame.superseded_by.is_some() {
            omitted.push(result.frame_id);
            continue;
        }
        let Some(bytes) = content_lookup(result.frame_id) else {
            omitted.push(result.frame_id);
            continue;
        };
        let text = String::from_utf8_lossy(&bytes).into_owned();

        let remaining_budget = request.max_context_tokens.saturating_sub(budget_used);
        if remaining_budget == 0 {
            omitted.push(result.frame_id);
            break;
        }
        let cap = request.snippet_max_tokens.min(remaining_budget);
        let truncated = token_counter.truncate(&text, cap);
        let tokens = token_counter.count(&truncated);
        if tokens == 0 {
            omitted.push(result.frame_id);
            continue;
        }
        if budget_used + tokens > request.max_context_tokens {
            omitted.push(result.frame_id);
            break;
        }
        budget_used += tokens;
        let frame_id = frame.id;
        let frame_role = frame.role;
        let parent_id = frame.parent_id;
        snippets.push(ContextSnippet { frame_id, kind: frame.kind, text: truncated, tokens, tier: "full" });

        if request.mode != ContextMode::DenseCached || frame_role != FrameRole::Chunk {
            continue;
        }
        let Some(parent_id) = parent_id else { continue };
        if surrogated_parents.contains(&parent_id) || surrogate_count >= request.max_surrogates {
            continue;
        }
        let Some(parent_frame) = frame_lookup(parent_id) else { continue };
        let Some(parent_bytes) = content_lookup(parent_id) else { continue };
        let parent_text = String::from_utf8_lossy(&parent_bytes).into_owned();

        let parent_access_count = access_count_lookup(parent_id);
        let tier = choose_tier(request.surrogate_policy, &parent_frame, parent_access_count, now_ms);
        let (tier_name, tier_cap) = match tier {
            SurrogateTier::Full => ("full", request.surrogate_max_tokens),
            SurrogateTier::Gist => ("gist", request.surrogate_max_tokens),
            SurrogateTier::Micro => ("micro", (request.surrogate_max_tokens / 4).max(1)),
        };
        let remaining_for_surrogate = request.max_context_tokens.saturating_sub(budget_used);
        if remaining_for_surrogate == 0 {
            continue;
        }
        let cap = tier_cap.min(remaining_for_surrogate);
        let truncated_parent = token_counter.truncate(&parent_text, cap);
        let parent_tokens = token_counter.count(&truncated_parent);
        if parent_tokens == 0 || budget_used + parent_tokens > request.max_context_tokens {
            continue;
        }
        budget_used += parent_tokens;
        surrogate_count += 1;
        surrogated_parents.insert(parent_id);
        snippets.push(ContextSnippet {
            frame_id: parent_frame.id,
            kind: parent_frame.kind,
            text: truncated_parent,
            tokens: parent_tokens,
            tier: tier_name,
        });
    }

    ContextDocument { snippets, total_tokens: budget_used, omitted_frame_ids: omitted }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::WhitespaceTokenCounter;
    use crate::frame::{CanonicalEncoding, PayloadRef};
    use crate::search::ResultSource;
    use std::collections::HashMap as Map;

    fn frame(id: u64, age_ms: u64, role: FrameRole) -> Frame {
        Frame {
            id: FrameId(id),
            timestamp_ms: age_ms,
            status: FrameStatus::Active,
            kind: "chunk.text".to_string(),
            role,
            parent_id: None,
            supersedes: None,
            superseded_by: None,
            search_text: None,
            canonical_encoding: CanonicalEncoding::Plain,
            payload_ref: PayloadRef { offset: 0, length: 0 },
            metadata: Map::new(),
            checksum: 0,
        }
    }

    #[test]
    fn greedy_assembly_respects_token_budget() {
        let counter = WhitespaceTokenCounter;
        let request = ContextRequest {
            mode: ContextMode::Fast,
            surrogate_policy: SurrogatePolicy::Disabled,
            max_context_tokens: 4,
            snippet_max_tokens: 10,
            max_snippets: 10,
            max_surrogates: 10,
            surrogate_max_tokens: 10,
            deterministic_now_ms: Some(0),
        };
        let ranked = vec![
            FusedResult { frame_id: FrameId(1), score: 1.0, sources: [ResultSource::Text].into() },
            FusedResult { frame_id: FrameId(2), score: 0.9, sources: [ResultSource::Text].into() },
        ];
        let frames = vec![frame(1, 0, FrameRole::Chunk), frame(2, 0, FrameRole::Chunk)];
        let lookup = move |id: FrameId| frames.iter().find(|f| f.id == id).cloned();
        let content = |id: FrameId| -> Option<Vec<u8>> {
            match id.0 {
                1 => Some(b"one two three".to_vec()),
                2 => Some(b"four five six".to_vec()),
                _ => None,
            }
        };
        let doc = build_context(&request, &ranked, lookup, content, |_id| 0, &counter);
        assert!(doc.total_tokens <= 4);
        assert!(!doc.snippets.is_empty());
    }

    #[test]
    fn superseded_frames_are_omitted() {
        let counter = WhitespaceTokenCounter;
        let request = ContextRequest::from_config(&ContextBuilderConfig::default());
        let ranked = vec![FusedResult { frame_id: FrameId(1), score: 1.0, sources: [ResultSource::Text].into() }];
        let mut f = frame(1, 0, FrameRole::Chunk);
        f.superseded_by = Some(FrameId(2));
        let lookup = move |id: FrameId| if id == f.id { Some(f.clone()) } else { None };
        let content = |_id: FrameId| Some(b"irrelevant".to_vec());
        let doc = build_context(&request, &ranked, lookup, content, |_id| 0, &counter);
        assert!(doc.snippets.is_empty());
        assert_eq!(doc.omitted_frame_ids, vec![FrameId(1)]);
    }

    #[test]
    fn dense_cached_mode_expands_a_chunk_into_its_parent_surrogate() {
        let counter = WhitespaceTokenCounter;
        let mut request = ContextRequest::from_config(&ContextBuilderConfig::default());
        request.mode = ContextMode::DenseCached;
        request.surrogate_policy = SurrogatePolicy::Disabled;
        request.deterministic_now_ms = Some(0);
        let ranked = vec![FusedResult { frame_id: FrameId(2), score: 1.0, sources: [ResultSource::Text].into() }];
        let parent = frame(1, 0, FrameRole::Document);
        let mut chunk = frame(2, 0, FrameRole::Chunk);
        chunk.parent_id = Some(FrameId(1));
        let lookup = move |id: FrameId| {
            if id == chunk.id {
                Some(chunk.clone())
            } else if id == parent.id {
                Some(parent.clone())
            } else {
                None
            }
        };
        let content = |id: FrameId| -> Option<Vec<u8>> {
            match id.0 {
                1 => Some(b"the parent document body".to_vec()),
                2 => Some(b"a child chunk".to_vec()),
                _ => None,
            }
        };
        let doc = build_context(&request, &ranked, lookup, content, |_id| 0, &counter);
        assert_eq!(doc.snippets.len(), 2, "expected the chunk plus its parent surrogate");
        assert_eq!(doc.snippets[0].frame_id, FrameId(2));
        assert_eq!(doc.snippets[0].tier, "full");
        assert_eq!(doc.snippets[1].frame_id, FrameId(1));
        assert_eq!(doc.snippets[1].tier, "full"); // policy disabled -> surrogate pinned to full
    }

    #[test]
    fn age_policy_demotes_an_old_parent_surrogate_to_micro() {
        let counter = WhitespaceTokenCounter;
        let mut request = ContextRequest::from_config(&ContextBuilderConfig::default());
        request.mode = ContextMode::DenseCached;
        request.surrogate_policy = SurrogatePolicy::AgeOnly { recent_days_ms: SEVEN_DAYS_MS, old_days_ms: 30 * SEVEN_DAYS_MS };
        request.deterministic_now_ms = Some(100 * SEVEN_DAYS_MS);
        let ranked = vec![FusedResult { frame_id: FrameId(2), score: 1.0, sources: [ResultSource::Text].into() }];
        let old_parent = frame(1, 0, FrameRole::Document);
        let mut chunk = frame(2, 100 * SEVEN_DAYS_MS, FrameRole::Chunk);
        chunk.parent_id = Some(FrameId(1));
        let lookup = move |id: FrameId| {
            if id == chunk.id {
                Some(chunk.clone())
            } else if id == old_parent.id {
                Some(old_parent.clone())
            } else {
                None
            }
        };
        let content = |id: FrameId| -> Option<Vec<u8>> {
            match id.0 {
                1 => Some(b"a fairly long historical parent document body".to_vec()),
                2 => Some(b"a child chunk".to_vec()),
                _ => None,
            }
        };
        let doc = build_context(&request, &ranked, lookup, content, |_id| 0, &counter);
        let surrogate = doc.snippets.iter().find(|s| s.frame_id == FrameId(1)).expect("parent surrogate included");
        assert_eq!(surrogate.tier, "micro");
    }

    #[test]
    fn importance_policy_favors_frequently_accessed_over_stale_unread_parents() {
        let counter = WhitespaceTokenCounter;
        let mut request = ContextRequest::from_config(&ContextBuilderConfig::default());
        request.mode = ContextMode::DenseCached;
        request.surrogate_policy = SurrogatePolicy::Importance { full_threshold: 0.35, gist_threshold: 0.1 };
        request.deterministic_now_ms = Some(100 * SEVEN_DAYS_MS);
        let ranked = vec![FusedResult { frame_id: FrameId(2), score: 1.0, sources: [ResultSource::Text].into() }];
        let stale_parent = frame(1, 0, FrameRole::Document);
        let mut chunk = frame(2, 100 * SEVEN_DAYS_MS, FrameRole::Chunk);
        chunk.parent_id = Some(FrameId(1));
        let lookup = move |id: FrameId| {
            if id == chunk.id {
                Some(chunk.clone())
            } else if id == stale_parent.id {
                Some(stale_parent.clone())
            } else {
                None
            }
        };
        let content = |id: FrameId| -> Option<Vec<u8>> {
            match id.0 {
                1 => Some(b"an old but heavily revisited parent document body".to_vec()),
                2 => Some(b"a child chunk".to_vec()),
                _ => None,
            }
        };
        // Old (age ~100 weeks) but accessed often: frequency carries the score past `full_threshold`.
        let heavily_accessed = build_context(&request, &ranked, lookup.clone(), content, |_id| 50, &counter);
        let hot = heavily_accessed.snippets.iter().find(|s| s.frame_id == FrameId(1)).expect("parent included");
        assert_eq!(hot.tier, "full");

        // Same age, never accessed: recency alone can't clear `gist_threshold`.
        let never_accessed = build_context(&request, &ranked, lookup, content, |_id| 0, &counter);
        let cold = never_accessed.snippets.iter().find(|s| s.frame_id == FrameId(1)).expect("parent included");
        assert_eq!(cold.tier, "micro");
    }

    #[test]
    fn fast_mode_never_expands_parents() {
        let counter = WhitespaceTokenCounter;
        let mut request = ContextRequest::from_config(&ContextBuilderConfig::default());
        request.mode = ContextMode::Fast;
        let ranked = vec![FusedResult { frame_id: FrameId(2), score: 1.0, sources: [ResultSource::Text].into() }];
        let mut chunk = frame(2, 0, FrameRole::Chunk);
        chunk.parent_id = Some(FrameId(1));
        let lookup = move |id: FrameId| if id == chunk.id { Some(chunk.clone()) } else { None };
        let content = |_id: FrameId| Some(b"a child chunk".to_vec());
        let doc = build_context(&request, &ranked, lookup, content, |_id| 0, &counter);
        assert_eq!(doc.snippets.len(), 1);
    }

    #[test]
    fn identical_inputs_produce_identical_documents() {
        let counter = WhitespaceTokenCounter;
        let request = ContextRequest::from_config(&ContextBuilderConfig::default());
        let ranked = vec![FusedResult { frame_id: FrameId(1), score: 1.0, sources: [ResultSource::Text].into() }];
        let f = frame(1, 0, FrameRole::Chunk);
        let content = |_id: FrameId| Some(b"stable content".to_vec());
        let doc_a = build_context(&request, &ranked, |id| if id == f.id { Some(f.clone()) } else { None }, content, |_id| 0, &counter);
        let doc_b = build_context(&request, &ranked, |id| if id == f.id { Some(f.clone()) } else { None }, content, |_id| 0, &counter);
        assert_eq!(doc_a.render(), doc_b.render());
    }
}
