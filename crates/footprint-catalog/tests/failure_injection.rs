//! Failure injection tests for the merge run.
//!
//! A run that fails before commit must leave the snapshot and the pending
//! prefix exactly as they were. A run that fails after commit (deletion) must
//! leave a snapshot that the next run can re-merge into without change.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use bytes::Bytes;

use footprint_catalog::{
    CatalogEntry, CatalogError, CompactionStatus, FailureKind, FragmentFailurePolicy, MergeConfig,
};
use footprint_test_utils::{
    OpKind, StorageOp, TestContext, assert_no_deletes, assert_untouched, footprint,
    snapshot_bytes, square,
};

#[tokio::test]
async fn corrupt_snapshot_aborts_without_commit() {
    let ctx = TestContext::new();
    let snapshot_key = ctx.config.snapshot_key.clone();
    ctx.put_raw(&snapshot_key, Bytes::from_static(b"PAR1 definitely not parquet PAR1"))
        .await;
    let a = ctx.put_fragment("u1", &[CatalogEntry::new("a")]).await;
    let b = ctx.put_fragment("u2", &[CatalogEntry::new("b")]).await;
    ctx.storage.clear_operations();

    let result = ctx.engine().run().await;
    let err = result.as_ref().expect_err("corrupt snapshot");
    assert!(matches!(err, CatalogError::CorruptSnapshot { .. }), "{err:?}");

    assert_untouched(&ctx.storage, &snapshot_key);
    assert_no_deletes(&ctx.storage);
    assert!(
        !ctx
            .storage
            .operations()
            .iter()
            .any(|op| matches!(op, StorageOp::Put { .. })),
        "nothing may be staged"
    );
    assert_eq!(ctx.pending_keys(), vec![a, b]);

    let status = CompactionStatus::from_result(&result);
    assert!(status.is_failure());
    assert!(matches!(
        status,
        CompactionStatus::Failed {
            kind: FailureKind::CorruptSnapshot,
            retryable: false,
            ..
        }
    ));
}

#[tokio::test]
async fn concurrent_snapshot_write_is_a_conflict() {
    let ctx = TestContext::new();
    let snapshot_key = ctx.config.snapshot_key.clone();
    ctx.put_snapshot(&[CatalogEntry::new("base")]).await;
    let fragment = ctx.put_fragment("u1", &[CatalogEntry::new("new")]).await;

    let rival = snapshot_bytes(&[CatalogEntry::new("rival")]);
    ctx.storage
        .race_after_read(snapshot_key.clone(), snapshot_key, rival.clone());

    let err = ctx.engine().run().await.expect_err("conflict");
    assert!(matches!(err, CatalogError::Conflict { .. }), "{err:?}");
    assert!(err.kind().is_retryable());

    assert_eq!(ctx.snapshot_raw(), Some(rival));
    assert_eq!(ctx.pending_keys(), vec![fragment]);
    assert!(ctx.storage.delete_batches().is_empty());
    assert!(ctx.staging_keys().is_empty());

    // The retry merges against the rival snapshot.
    let outcome = ctx.engine().run().await.expect("retry");
    assert_eq!(outcome.merged_fragments, 1);
    let mut ids = ctx.snapshot_ids();
    ids.sort();
    assert_eq!(ids, vec!["new", "rival"]);
}

#[tokio::test]
async fn failed_promotion_keeps_old_snapshot_and_fragments() {
    let ctx = TestContext::new();
    let snapshot_key = ctx.config.snapshot_key.clone();
    ctx.put_snapshot(&[CatalogEntry::new("base")]).await;
    let before = ctx.snapshot_raw();
    let fragment = ctx.put_fragment("u1", &[CatalogEntry::new("new")]).await;
    ctx.storage.inject_op_failure(OpKind::Rename, snapshot_key);

    let err = ctx.engine().run().await.expect_err("rename fails");
    assert_eq!(err.kind(), FailureKind::TransientStorage);

    assert_eq!(ctx.snapshot_raw(), before);
    assert_eq!(ctx.pending_keys(), vec![fragment]);
    assert!(ctx.staging_keys().is_empty(), "staged object is discarded");
}

#[tokio::test]
async fn listing_failure_is_transient() {
    let ctx = TestContext::new();
    ctx.put_fragment("u1", &[CatalogEntry::new("a")]).await;
    ctx.storage
        .inject_op_failure(OpKind::List, ctx.config.pending_prefix.clone());

    let err = ctx.engine().run().await.expect_err("list fails");
    assert_eq!(err.kind(), FailureKind::TransientStorage);
    assert!(ctx.snapshot_raw().is_none());
}

#[tokio::test]
async fn failed_delete_chunk_is_reported_and_remerged_harmlessly() {
    let ctx = TestContext::with_config(MergeConfig {
        delete_batch_size: 2,
        ..MergeConfig::default()
    });
    let mut keys = Vec::new();
    for (upload, id, lon) in [("u0", "a", 0.0), ("u1", "b", 1.0), ("u2", "c", 2.0), ("u3", "d", 3.0)] {
        let entry = footprint(id, square(lon, 0.0, 0.5), "2024-01-01");
        keys.push(ctx.put_fragment(upload, &[entry]).await);
    }
    ctx.storage.inject_op_failure(OpKind::DeleteBatch, keys[2].clone());

    let outcome = ctx.engine().run().await.expect("commit succeeds");
    assert_eq!(outcome.merged_fragments, 4);
    assert_eq!(outcome.deleted.deleted, 2);
    assert_eq!(outcome.deleted.failed_chunks.len(), 1);
    assert_eq!(outcome.deleted.failed_chunks[0].keys, vec![keys[2].clone(), keys[3].clone()]);
    assert_eq!(ctx.pending_keys(), vec![keys[2].clone(), keys[3].clone()]);

    let committed = ctx.snapshot_raw().expect("snapshot");
    ctx.storage.clear_failures();

    let retry = ctx.engine().run().await.expect("retry");
    assert_eq!(retry.merged_fragments, 2);
    assert_eq!(retry.superseded, 2);
    assert!(retry.deleted.is_complete());
    assert!(ctx.pending_keys().is_empty());
    assert_eq!(ctx.snapshot_raw().expect("snapshot"), committed);
}

#[tokio::test]
async fn unreadable_fragment_aborts_by_default() {
    let ctx = TestContext::new();
    let good = ctx.put_fragment("good", &[CatalogEntry::new("a")]).await;
    let bad = ctx.fragment_key("bad");
    ctx.put_raw(&bad, Bytes::from_static(b"not parquet")).await;

    let err = ctx.engine().run().await.expect_err("abort");
    match err {
        CatalogError::MalformedFragment { ref key, .. } => assert_eq!(key, &bad),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(ctx.snapshot_raw().is_none());
    assert_eq!(ctx.pending_keys(), vec![bad, good]);
}

#[tokio::test]
async fn skip_policy_leaves_bad_fragment_pending() {
    let ctx = TestContext::with_config(MergeConfig {
        fragment_failure_policy: FragmentFailurePolicy::Skip,
        ..MergeConfig::default()
    });
    ctx.put_fragment("good", &[CatalogEntry::new("a")]).await;
    let bad = ctx.fragment_key("bad");
    ctx.put_raw(&bad, Bytes::from_static(b"not parquet")).await;

    let outcome = ctx.engine().run().await.expect("merge");
    assert_eq!(outcome.merged_fragments, 1);
    assert_eq!(outcome.skipped.len(), 1);
    assert_eq!(outcome.skipped[0].key, bad);
    assert_eq!(ctx.snapshot_ids(), vec!["a"]);
    assert_eq!(ctx.pending_keys(), vec![bad]);
}

#[tokio::test]
async fn vanished_fragment_is_skipped_and_reported() {
    let ctx = TestContext::new();
    let kept = ctx.put_fragment("u1", &[CatalogEntry::new("a")]).await;
    let gone = ctx.put_fragment("u2", &[CatalogEntry::new("b")]).await;
    ctx.storage.vanish_after_list(gone.clone());

    let outcome = ctx.engine().run().await.expect("merge");
    assert_eq!(outcome.merged_fragments, 1);
    assert_eq!(outcome.vanished, vec![gone]);
    assert_eq!(ctx.snapshot_ids(), vec!["a"]);
    assert!(!ctx.pending_keys().contains(&kept));
}

#[tokio::test]
async fn staging_sweep_failure_does_not_block_the_merge() {
    let ctx = TestContext::new();
    ctx.put_fragment("u1", &[CatalogEntry::new("a")]).await;
    ctx.storage
        .inject_op_failure(OpKind::List, ctx.config.staging_prefix.clone());

    let outcome = ctx.engine().run().await.expect("merge");
    assert_eq!(outcome.merged_fragments, 1);
    assert_eq!(outcome.staging_swept, 0);
}
