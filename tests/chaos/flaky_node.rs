//! Remote outages and injected failures.

use std::sync::Arc;
use std::time::Duration;

use ferry_node::{MemoryNode, Op, RemoteError};
use ferry_sync::FileState;
use ferry_tests::{Device, MIB, random_data, wait_until};
use ferry_types::FullFileId;

#[tokio::test]
async fn test_outage_delays_but_does_not_lose_uploads() {
    let node = Arc::new(MemoryNode::new(1024 * MIB));
    let device = Device::start(node.clone()).await;
    device.flaky.set_down(true);

    let mut dags = Vec::new();
    for i in 0..6 {
        dags.push(device.add(&format!("obj-{i}"), "space", &random_data(150 * 1024)).await);
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(device.count_in(FileState::Done), 0);
    assert_eq!(node.stats().blocks_added, 0);

    device.flaky.set_down(false);
    wait_until("uploads after recovery", || device.count_in(FileState::Done) == dags.len()).await;
    for dag in &dags {
        assert!(node.has_file("space", &dag.root));
    }
    device.shutdown().await;
}

#[tokio::test]
async fn test_intermittent_push_failures() {
    let node = Arc::new(MemoryNode::new(1024 * MIB));
    let device = Device::start(node.clone()).await;
    device.flaky.fail_times(Op::BlockPushMany, 3, RemoteError::Rpc("connection reset".into()));
    device.flaky.fail_times(Op::CheckAvailability, 2, RemoteError::Unavailable);

    for i in 0..4 {
        device.add(&format!("obj-{i}"), "space", &random_data(300 * 1024)).await;
    }
    wait_until("uploads despite failures", || device.count_in(FileState::Done) == 4).await;
    device.shutdown().await;
}

#[tokio::test]
async fn test_deletion_retried_through_outage() {
    let node = Arc::new(MemoryNode::new(1024 * MIB));
    let device = Device::start(node.clone()).await;
    let dag = device.add("obj", "space", &random_data(100 * 1024)).await;
    device.wait_for_state("obj", FileState::Done).await;

    device.flaky.set_down(true);
    device.sync.delete_file("obj", FullFileId::new("space", dag.root)).await.unwrap();
    wait_until("a failed attempt", || device.flaky.calls(Op::DeleteFiles) >= 2).await;
    assert_eq!(device.state("obj"), Some(FileState::PendingDeletion));

    device.flaky.set_down(false);
    device.wait_for_state("obj", FileState::Deleted).await;
    assert!(!node.has_file("space", &dag.root));
    device.shutdown().await;
}
