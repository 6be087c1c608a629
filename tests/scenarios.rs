//! Black-box end-to-end tests against the public `Archive` facade, covering
//! the numbered put/commit/reopen/search/supersede/compaction scenarios.

use retrieval_core::archive::ArchiveOpenOptions;
use retrieval_core::collaborators::{Embedder, EmbedderIdentity, ExecutionMode};
use retrieval_core::config::RetrievalConfig;
use retrieval_core::context::{ContextMode, ContextRequest, SurrogatePolicy};
use retrieval_core::frame::{FrameRole, PutOptions};
use retrieval_core::search::{FrameFilter, SearchMode};
use retrieval_core::Archive;

struct NetworkEmbedder;

#[async_trait::async_trait]
impl Embedder for NetworkEmbedder {
    async fn embed(&self, _text: &str) -> retrieval_core::Result<Vec<f32>> {
        Ok(vec![0.0; 8])
    }

    async fn embed_batch(&self, texts: &[String]) -> retrieval_core::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![0.0; 8]).collect())
    }

    fn dimension(&self) -> u32 {
        8
    }

    fn normalize(&self) -> bool {
        true
    }

    fn identity(&self) -> EmbedderIdentity {
        EmbedderIdentity { provider: "test".into(), model: "network-mock".into(), dims: 8, normalized: true }
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::MayUseNetwork
    }
}

fn open(path: &std::path::Path) -> Archive {
    Archive::open(path, ArchiveOpenOptions { config: RetrievalConfig::default(), embedder: None, token_counter: None })
        .expect("archive open")
}

#[test]
fn put_commit_reopen_finds_the_frame_by_text() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("archive.bin");

    {
        let archive = open(&path);
        let opts = PutOptions { search_text: Some("hello world".into()), ..Default::default() };
        let id = archive.put(b"hello world".to_vec(), opts).unwrap();
        assert_eq!(id.0, 1);
        archive.commit().unwrap();
    }

    let archive = open(&path);
    let results =
        archive.search(SearchMode::TextOnly, Some("hello"), None, 5, &FrameFilter::default()).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].frame_id.0, 1);
}

#[test]
fn supersede_hides_the_old_frame_from_search() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("archive.bin");
    let archive = open(&path);

    let v1 = archive.put(b"v1".to_vec(), PutOptions { search_text: Some("v1 draft".into()), ..Default::default() }).unwrap();
    let v2 = archive.put(b"v2".to_vec(), PutOptions { search_text: Some("v2 final".into()), ..Default::default() }).unwrap();
    archive.supersede(v1, v2).unwrap();
    archive.commit().unwrap();

    let results = archive.search(SearchMode::TextOnly, Some("v"), None, 5, &FrameFilter::default()).unwrap();
    let ids: Vec<u64> = results.iter().map(|r| r.frame_id.0).collect();
    assert_eq!(ids, vec![v2.0]);
}

#[test]
fn staged_frames_are_visible_before_commit_but_vanish_on_reopen_without_commit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("archive.bin");

    {
        let archive = open(&path);
        archive.put(b"seed".to_vec(), PutOptions { search_text: Some("seed text".into()), ..Default::default() }).unwrap();
        archive.commit().unwrap();

        archive
            .put(b"staged".to_vec(), PutOptions { search_text: Some("staged text".into()), ..Default::default() })
            .unwrap();
        // Pending-but-uncommitted frame is visible in the default-view search.
        let pending_view = archive.search(SearchMode::TextOnly, Some("staged"), None, 5, &FrameFilter::default()).unwrap();
        assert_eq!(pending_view.len(), 1);
        // No commit() call here — the process "crashes" before it durably applies.
    }

    let reopened = open(&path);
    let after_crash = reopened.search(SearchMode::TextOnly, Some("staged"), None, 5, &FrameFilter::default()).unwrap();
    assert!(after_crash.is_empty(), "uncommitted frame must not survive a reopen");
    let seed_still_present =
        reopened.search(SearchMode::TextOnly, Some("seed"), None, 5, &FrameFilter::default()).unwrap();
    assert_eq!(seed_still_present.len(), 1);
}

#[test]
fn vector_search_breaks_exact_ties_by_ascending_frame_id() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("archive.bin");
    let archive = open(&path);

    let a = archive.put(b"a".to_vec(), PutOptions::default()).unwrap();
    let b = archive.put(b"b".to_vec(), PutOptions::default()).unwrap();
    let c = archive.put(b"c".to_vec(), PutOptions::default()).unwrap();
    archive.stage_embedding(a, vec![1.0, 0.0], 2, true).unwrap();
    archive.stage_embedding(b, vec![1.0, 0.0], 2, true).unwrap();
    archive.stage_embedding(c, vec![0.0, 1.0], 2, true).unwrap();
    archive.commit().unwrap();

    let results = archive.search(SearchMode::VectorOnly, None, Some(&[1.0, 0.0]), 2, &FrameFilter::default()).unwrap();
    let ids: Vec<u64> = results.iter().map(|r| r.frame_id.0).collect();
    assert_eq!(ids, vec![a.0, b.0]);
}

#[test]
fn commit_with_nothing_staged_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("archive.bin");
    let archive = open(&path);

    archive.put(b"only".to_vec(), PutOptions { search_text: Some("only frame".into()), ..Default::default() }).unwrap();
    let first_stamp = archive.commit().unwrap();
    let second_stamp = archive.commit().unwrap();
    assert_eq!(first_stamp, second_stamp);
}

#[test]
fn context_builder_never_exceeds_the_token_budget() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("archive.bin");
    let archive = open(&path);

    for i in 0..20 {
        let text = format!("frame number {i} carries a reasonably long chunk of search text to chew through");
        archive
            .put(text.clone().into_bytes(), PutOptions { search_text: Some(text), role: FrameRole::Chunk, ..Default::default() })
            .unwrap();
    }
    archive.commit().unwrap();

    let ranked = archive.search(SearchMode::TextOnly, Some("frame"), None, 20, &FrameFilter::default()).unwrap();
    assert!(!ranked.is_empty());

    let request = ContextRequest {
        mode: ContextMode::Fast,
        surrogate_policy: SurrogatePolicy::Disabled,
        max_context_tokens: 30,
        snippet_max_tokens: 10,
        max_snippets: 20,
        max_surrogates: 0,
        surrogate_max_tokens: 0,
        deterministic_now_ms: Some(0),
    };
    let doc = archive.build_context(&request, &ranked);
    let rendered = doc.render();
    let token_count = rendered.split_whitespace().count();
    assert!(token_count <= 30, "rendered context has {token_count} tokens, budget was 30");
}

#[test]
fn opening_an_already_open_archive_is_rejected_as_writer_contention() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("archive.bin");
    let _held = open(&path);

    let err = Archive::open(&path, ArchiveOpenOptions { config: RetrievalConfig::default(), embedder: None, token_counter: None })
        .expect_err("second open of the same archive path must fail");
    assert!(matches!(err, retrieval_core::RetrievalError::WriterContention(_)));
}

#[test]
fn on_device_only_policy_rejects_a_network_capable_embedder() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("archive.bin");

    let mut config = RetrievalConfig::default();
    config.embedder_policy.require_on_device = true;
    let embedder = NetworkEmbedder;
    let err = Archive::open(&path, ArchiveOpenOptions { config, embedder: Some(&embedder), token_counter: None })
        .expect_err("require_on_device=true must reject a may_use_network embedder");
    assert!(matches!(err, retrieval_core::RetrievalError::ProviderRejected(_)));

    // Rejection happens before the writer lease is taken for keeps: a later
    // open against the same path must not see stale contention.
    let archive = open(&path);
    drop(archive);
}

#[test]
fn closing_an_archive_releases_its_writer_lease_for_a_later_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("archive.bin");

    {
        let archive = open(&path);
        archive.put(b"x".to_vec(), PutOptions::default()).unwrap();
        archive.commit().unwrap();
    }

    // The first archive was dropped at the end of the block above, releasing its lease.
    let reopened = open(&path);
    drop(reopened);
}

#[test]
fn rewrite_live_set_drops_superseded_payload_bytes_but_keeps_ids_searchable() {
    let dir = tempfile::tempdir().unwrap();
    let src_path = dir.path().join("src.bin");
    let dest_path = dir.path().join("dest.bin");
    let archive = open(&src_path);

    let old = archive.put(b"old payload".to_vec(), PutOptions { search_text: Some("old payload".into()), ..Default::default() }).unwrap();
    let new = archive.put(b"new payload".to_vec(), PutOptions { search_text: Some("new payload".into()), ..Default::default() }).unwrap();
    archive.supersede(old, new).unwrap();
    archive.commit().unwrap();

    archive.rewrite_live_set(&dest_path, true).unwrap();
    assert!(dest_path.exists());

    let compacted = open(&dest_path);
    let results = compacted.search(SearchMode::TextOnly, Some("payload"), None, 5, &FrameFilter::default()).unwrap();
    let ids: Vec<u64> = results.iter().map(|r| r.frame_id.0).collect();
    assert_eq!(ids, vec![new.0]);
}
