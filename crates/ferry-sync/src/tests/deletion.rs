//! Deletion workers, retries and cancellation.

use std::time::Duration;

use ferry_node::{Op, RemoteError};
use ferry_types::FullFileId;

use super::helpers::{Harness, MIB, SPACE, wait_until};
use crate::FileState;

#[tokio::test]
async fn test_uploaded_file_is_deleted() {
    let h = Harness::new(1024 * MIB);
    let dag = h.import(200 * 1024).await;
    h.add("obj-1", &dag).await;
    h.sync.start().await.unwrap();
    h.wait_for_state("obj-1", FileState::Done).await;

    h.sync.delete_file("obj-1", FullFileId::new(SPACE, dag.root)).await.unwrap();
    h.wait_for_state("obj-1", FileState::Deleted).await;
    h.sync.close().await;

    assert!(!h.node.has_file(SPACE, &dag.root));
    assert_eq!(h.node.total_usage(), 0);
}

#[tokio::test]
async fn test_failed_deletion_is_rescheduled() {
    let h = Harness::new(1024 * MIB);
    let dag = h.import(10 * 1024).await;
    h.flaky.fail_next(Op::DeleteFiles, RemoteError::Unavailable);

    h.sync.delete_file("obj-1", FullFileId::new(SPACE, dag.root)).await.unwrap();
    h.sync.start().await.unwrap();

    wait_until("first attempt to fail", || h.flaky.calls(Op::DeleteFiles) >= 1).await;
    h.wait_for_state("obj-1", FileState::Deleted).await;
    h.sync.close().await;

    assert_eq!(h.flaky.calls(Op::DeleteFiles), 2);
    let it = h.item("obj-1").unwrap();
    assert!(it.handled_at > 0);
}

#[tokio::test]
async fn test_repeated_delete_is_noop() {
    let h = Harness::new(1024 * MIB);
    let dag = h.import(10 * 1024).await;
    let file = FullFileId::new(SPACE, dag.root);

    h.sync.delete_file("obj-1", file.clone()).await.unwrap();
    let first = h.item("obj-1").unwrap();
    h.sync.delete_file("obj-1", file.clone()).await.unwrap();
    assert_eq!(h.item("obj-1").unwrap(), first);

    h.sync.start().await.unwrap();
    h.wait_for_state("obj-1", FileState::Deleted).await;
    h.sync.delete_file("obj-1", file).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.sync.close().await;

    assert_eq!(h.state("obj-1"), Some(FileState::Deleted));
    assert_eq!(h.flaky.calls(Op::DeleteFiles), 1);
}

#[tokio::test]
async fn test_cancel_deletion_restores_file() {
    let h = Harness::new(1024 * MIB);
    let dag = h.import(10 * 1024).await;
    let file = FullFileId::new(SPACE, dag.root);

    h.sync.delete_file("obj-1", file.clone()).await.unwrap();
    h.sync.cancel_deletion("obj-1", file.clone()).await.unwrap();
    assert_eq!(h.state("obj-1"), Some(FileState::Done));

    // Nothing pending: a second cancel changes nothing.
    h.sync.cancel_deletion("obj-1", file).await.unwrap();
    assert_eq!(h.state("obj-1"), Some(FileState::Done));

    h.sync.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.sync.close().await;
    assert_eq!(h.flaky.calls(Op::DeleteFiles), 0);
}

#[tokio::test]
async fn test_cancel_deletion_of_other_file_is_ignored() {
    let h = Harness::new(1024 * MIB);
    let a = h.import(10).await;
    let b = h.import(20).await;

    h.sync.delete_file("obj-1", FullFileId::new(SPACE, a.root)).await.unwrap();
    h.sync.cancel_deletion("obj-1", FullFileId::new(SPACE, b.root)).await.unwrap();
    assert_eq!(h.state("obj-1"), Some(FileState::PendingDeletion));
}

#[tokio::test]
async fn test_delete_file_synchronously() {
    let h = Harness::new(1024 * MIB);
    let dag = h.import(100 * 1024).await;
    h.sync.upload_synchronously(SPACE, dag.root).await.unwrap();
    assert!(h.node.has_file(SPACE, &dag.root));

    h.sync
        .delete_file_synchronously(&FullFileId::new(SPACE, dag.root))
        .await
        .unwrap();
    assert!(!h.node.has_file(SPACE, &dag.root));
    assert!(h.sync.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_file_synchronously_surfaces_errors() {
    let h = Harness::new(MIB);
    let dag = h.import(10).await;
    h.flaky.set_down(true);
    let err = h
        .sync
        .delete_file_synchronously(&FullFileId::new(SPACE, dag.root))
        .await
        .unwrap_err();
    assert!(matches!(err, crate::SyncError::Remote(RemoteError::Unavailable)));
}
