//! Many files, several spaces, two devices sharing one account.

use std::collections::HashMap;
use std::sync::Arc;

use ferry_node::MemoryNode;
use ferry_sync::FileState;
use ferry_tests::{Device, MIB, random_data, wait_until};
use ferry_types::FullFileId;

#[tokio::test]
async fn test_many_files_across_spaces() {
    let node = Arc::new(MemoryNode::new(1024 * MIB));
    let device = Device::start(node.clone()).await;

    let mut expected: HashMap<&str, u64> = HashMap::new();
    let mut dags = Vec::new();
    for i in 0..20 {
        let space = if i % 2 == 0 { "photos" } else { "docs" };
        let len = 1 + (i * 37 * 1024) % (700 * 1024);
        let dag = device.add(&format!("obj-{i}"), space, &random_data(len)).await;
        *expected.entry(space).or_default() += dag.total_size();
        dags.push((space, dag));
    }

    wait_until("every file to upload", || device.count_in(FileState::Done) == 20).await;

    for (space, dag) in &dags {
        assert!(node.has_file(space, &dag.root));
    }
    let usage = device.sync.update_node_usage().await.unwrap();
    for (space, bytes) in expected {
        assert_eq!(usage.space_usage(space).space_bytes_usage, bytes, "usage of {space}");
    }
    assert_eq!(usage.total_bytes_usage, node.total_usage());
    device.shutdown().await;
}

#[tokio::test]
async fn test_second_device_binds_existing_blocks() {
    let node = Arc::new(MemoryNode::new(1024 * MIB));
    let data = random_data(3 * MIB as usize);

    let a = Device::start(node.clone()).await;
    let dag = a.add("photo", "space-a", &data).await;
    a.wait_for_state("photo", FileState::Done).await;
    a.shutdown().await;
    let uploaded = node.stats().blocks_added;

    let b = Device::start(node.clone()).await;
    b.add("photo-copy", "space-b", &data).await;
    b.wait_for_state("photo-copy", FileState::Done).await;
    b.shutdown().await;

    assert!(node.has_file("space-b", &dag.root));
    assert_eq!(node.stats().blocks_added, uploaded, "second device pushed nothing");
    assert_eq!(node.total_usage(), dag.total_size(), "shared blocks counted once");
}

#[tokio::test]
async fn test_upload_then_delete_everything() {
    let node = Arc::new(MemoryNode::new(1024 * MIB));
    let device = Device::start(node.clone()).await;

    let mut files = Vec::new();
    for i in 0..8 {
        let id = format!("obj-{i}");
        let dag = device.add(&id, "space", &random_data(200 * 1024)).await;
        files.push((id, dag));
    }
    wait_until("uploads", || device.count_in(FileState::Done) == files.len()).await;

    for (id, dag) in &files {
        device.sync.delete_file(id, FullFileId::new("space", dag.root)).await.unwrap();
    }
    wait_until("deletions", || device.count_in(FileState::Deleted) == files.len()).await;

    assert_eq!(node.total_usage(), 0);
    assert_eq!(node.stats().files_deleted, files.len() as u64);
    let snapshot = device.sync.limits().existing("space").unwrap().snapshot();
    assert_eq!(snapshot.allocated_usage, 0);
    device.shutdown().await;
}
