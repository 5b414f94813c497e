//! Account quota: concurrent reservations and limited files.

use std::sync::Arc;
use std::time::Duration;

use ferry_node::MemoryNode;
use ferry_sync::FileState;
use ferry_tests::{Device, MIB, random_data, wait_until};
use ferry_types::events::FileLimitReached;

#[tokio::test]
async fn test_quota_admits_only_what_fits() {
    let node = Arc::new(MemoryNode::new(5 * MIB / 2));
    let device = Device::start(node.clone()).await;
    let mut reached = device.events.subscribe::<FileLimitReached>();

    for i in 0..5 {
        device.add(&format!("obj-{i}"), "space", &random_data(MIB as usize)).await;
    }
    let settled = || device.count_in(FileState::Done) == 2 && device.count_in(FileState::Limited) == 3;
    wait_until("two uploads and three limited files", settled).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(settled(), "no further file was admitted");
    assert!(node.total_usage() <= node.limit());
    assert_eq!(reached.recv().await.unwrap().space_id, "space");

    node.set_limit(100 * MIB);
    device.sync.update_node_usage().await.unwrap();
    wait_until("limited files to upload", || device.count_in(FileState::Done) == 5).await;
    device.shutdown().await;
}

#[tokio::test]
async fn test_deletion_makes_room_for_limited_files() {
    let node = Arc::new(MemoryNode::new(3 * MIB / 2));
    let device = Device::start(node.clone()).await;

    let first = device.add("first", "space", &random_data(MIB as usize)).await;
    device.wait_for_state("first", FileState::Done).await;
    device.add("second", "space", &random_data(MIB as usize)).await;
    device.wait_for_state("second", FileState::Limited).await;

    device
        .sync
        .delete_file("first", ferry_types::FullFileId::new("space", first.root))
        .await
        .unwrap();
    device.wait_for_state("first", FileState::Deleted).await;
    device.sync.update_node_usage().await.unwrap();
    device.wait_for_state("second", FileState::Done).await;
    device.shutdown().await;
}
