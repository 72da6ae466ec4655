//! End-to-end scenarios against a `FakeRemoteStore`, covering the parts of the pipeline that
//! don't require a real `gpg`/`tar` toolchain on the test host.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bur_offsite_core::context::RunContext;
use bur_offsite_core::download::DownloadEngine;
use bur_offsite_core::error::BurError;
use bur_offsite_core::model::Customer;
use bur_offsite_core::remote::fake::FakeRemoteStore;
use bur_offsite_core::remote::{RemoteStore, SharedStore};
use bur_offsite_core::retention::RetentionEngine;

fn test_ctx() -> Arc<RunContext> {
    Arc::new(RunContext {
        gpg_home: PathBuf::from("/tmp/gpg"),
        gpg_recipient: "offsite@example.com".into(),
        tmp_root: PathBuf::from("/tmp/bur"),
        host_address: "bkp@archive.example.com".into(),
        rsync_ssh: true,
        process_pool_size: 5,
        thread_pool_size: 5,
        transfer_pool_size: 8,
        ssh_timeout: Duration::from_secs(120),
        max_delay: None,
    })
}

fn test_codec(ctx: &RunContext) -> bur_offsite_core::crypto::CryptoCodec {
    bur_offsite_core::crypto::CryptoCodec::new(
        ctx.gpg_home.clone(),
        "Offsite Test",
        "offsite@example.com",
        ctx.ssh_timeout,
    )
}

/// Scenario 4: download is denied when `BACKUP_OK` is absent remotely (exit code 4,
/// `MissingSuccessFlag`).
#[tokio::test]
async fn download_denied_when_success_flag_absent() {
    let ctx = test_ctx();
    let codec = test_codec(&ctx);
    let store: SharedStore = Arc::new(FakeRemoteStore::new());

    store.mkdir_p("/archive/bur/ACME/2018-12-04").await.unwrap();
    store
        .mkdir_p("/archive/bur/ACME/2018-12-04/bur_volume_list_descriptor.dat")
        .await
        .unwrap();

    let engine = DownloadEngine::new(ctx, codec);
    let customer = Customer::new("ACME", "/data/acme");
    let dest = tempfile::tempdir().unwrap();

    let err = engine
        .download_backup(&store, &customer, "/archive/bur", "2018-12-04", dest.path())
        .await
        .unwrap_err();

    assert!(matches!(err, BurError::MissingSuccessFlag(_)));
    assert_eq!(err.exit_code(), 4);
}

/// Download against a tag that was never uploaded fails with `UnknownBackupTag` (exit 4).
#[tokio::test]
async fn download_fails_for_unknown_backup_tag() {
    let ctx = test_ctx();
    let codec = test_codec(&ctx);
    let store: SharedStore = Arc::new(FakeRemoteStore::new());
    let engine = DownloadEngine::new(ctx, codec);
    let customer = Customer::new("ACME", "/data/acme");
    let dest = tempfile::tempdir().unwrap();

    let err = engine
        .download_backup(&store, &customer, "/archive/bur", "2099-01-01", dest.path())
        .await
        .unwrap_err();

    assert!(matches!(err, BurError::UnknownBackupTag(_)));
    assert_eq!(err.exit_code(), 4);
}

/// Scenario 5: retention of 7 backups with `retention_count=4`, 2 of which are empty
/// directories — the empties are not counted; the oldest 3 non-empty are deleted; 4 remain.
#[tokio::test]
async fn retention_skips_empty_dirs_and_keeps_newest_n() {
    let store = FakeRemoteStore::new();
    let customer_root = "/archive/bur/ACME";
    store.mkdir_p(customer_root).await.unwrap();

    // 7 non-empty backups, oldest to newest, each holding one file so count_content sees them
    // as non-empty.
    for tag in ["t1", "t2", "t3", "t4", "t5", "t6", "t7"] {
        let backup_path = format!("{customer_root}/{tag}");
        store.mkdir_p(&backup_path).await.unwrap();
        let local = tempfile::NamedTempFile::new().unwrap();
        store.put(local.path(), &format!("{backup_path}/volume_1.tar")).await.unwrap();
    }
    // 2 empty directories interleaved in, registered after the non-empty ones so mtime-based
    // ordering can't accidentally make them look like the oldest survivors.
    for tag in ["empty1", "empty2"] {
        store.mkdir_p(&format!("{customer_root}/{tag}")).await.unwrap();
    }

    let engine = RetentionEngine::new();
    let removed = engine.apply(&store, customer_root, 4).await.unwrap();

    assert_eq!(removed.len(), 3, "only the oldest 3 non-empty backups should be removed");
    for tag in ["t1", "t2", "t3"] {
        assert!(removed.iter().any(|p| p.ends_with(tag)), "expected {tag} among removed: {removed:?}");
    }
    for tag in ["t4", "t5", "t6", "t7"] {
        let path = format!("{customer_root}/{tag}");
        assert!(store.path_exists(&path).await.unwrap(), "{tag} should still exist");
    }
    for tag in ["empty1", "empty2"] {
        let path = format!("{customer_root}/{tag}");
        assert!(store.path_exists(&path).await.unwrap(), "empty dirs are never removed by count-based retention");
    }
}

/// `RetentionEngine::apply` is a no-op once the surviving backup count is within budget.
#[tokio::test]
async fn retention_is_a_no_op_within_budget() {
    let store = FakeRemoteStore::new();
    let customer_root = "/archive/bur/ACME";

    let local = tempfile::NamedTempFile::new().unwrap();
    store.put(local.path(), customer_root).await.unwrap();

    let engine = RetentionEngine::new();
    let removed = engine.apply(&store, customer_root, 4).await.unwrap();
    assert!(removed.is_empty());
}
