use super::utils::{test_client, wait_for, TestNode};
use crate::config::{ProviderConfig, ServiceConfig, DEFAULT_EAGER_LIMIT};
use crate::error::ErrorKind;
use crate::ident::TargetId;
use crate::testing::{FailpointAction, FailpointRegistry};
use crate::transfer::BulkAccess;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_end_to_end_region_lifecycle() {
    let node = TestNode::start(1).await;
    let target = node.add_target("lifecycle.pool", 1024);
    let client = test_client(DEFAULT_EAGER_LIMIT).await;
    let handle = node.handle(&client);

    let region = handle.create(target, 32).await.unwrap();
    handle.write(target, &region, 0, &[b'A'; 16]).await.unwrap();
    handle.write(target, &region, 16, &[b'B'; 16]).await.unwrap();
    handle.persist(target, &region, 0, 32).await.unwrap();

    let data = handle.read(target, &region, 8, 16).await.unwrap();
    let mut expected = vec![b'A'; 8];
    expected.extend_from_slice(&[b'B'; 8]);
    assert_eq!(data, expected);
    assert_eq!(handle.get_size(target, &region).await.unwrap(), 32);

    handle.remove(target, &region).await.unwrap();
    let err = handle.read(target, &region, 0, 8).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = handle.remove(target, &region).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    node.service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_probe_pages_through_all_targets() {
    let node = TestNode::start(1).await;
    let client = test_client(DEFAULT_EAGER_LIMIT).await;
    let handle = node.handle(&client);

    let mut created = HashSet::new();
    for k in [0usize, 1, 31, 32, 33, 65] {
        while created.len() < k {
            let name = format!("probe-{}.pool", created.len());
            created.insert(node.add_target(&name, 256));
        }

        let all = handle.probe(None).await.unwrap();
        assert_eq!(all.len(), k, "probe(None) with {k} targets");
        assert_eq!(all.iter().copied().collect::<HashSet<TargetId>>(), created);

        let some = handle.probe(Some(5)).await.unwrap();
        assert_eq!(some.len(), k.min(5));
        assert!(handle.probe(Some(0)).await.unwrap().is_empty());
    }

    node.service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_eager_and_bulk_paths_are_equivalent() {
    let node = TestNode::start(1).await;
    let target = node.add_target("paths.pool", 64 * 1024);
    let client = test_client(64).await;
    let handle = node.handle(&client);
    assert_eq!(handle.eager_limit(), 64);

    for size in [63u64, 64, 65, 4000] {
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let before = node.provider.metrics();

        let region = handle.create_write_persist(target, size, &data).await.unwrap();
        let read = handle.read(target, &region, 0, size).await.unwrap();
        assert_eq!(read, data, "round trip of {size} bytes");

        let after = node.provider.metrics();
        if size <= 64 {
            assert_eq!(after.eager_bytes - before.eager_bytes, 2 * size);
            assert_eq!(after.bulk_bytes, before.bulk_bytes);
        } else {
            assert_eq!(after.bulk_bytes - before.bulk_bytes, 2 * size);
            assert_eq!(after.eager_bytes, before.eager_bytes);
        }
        assert_eq!(client.exposed_count(), 0);
    }

    // Lowering the limit sends the same small write over the bulk path.
    let region = handle.create(target, 16).await.unwrap();
    handle.set_eager_limit(0);
    let before = node.provider.metrics().bulk_bytes;
    handle.write(target, &region, 0, b"sixteen bytes!!!").await.unwrap();
    handle.persist(target, &region, 0, 16).await.unwrap();
    assert_eq!(node.provider.metrics().bulk_bytes - before, 16);
    assert_eq!(
        handle.read(target, &region, 0, 16).await.unwrap(),
        b"sixteen bytes!!!".to_vec()
    );

    node.service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_payload_larger_than_a_frame_goes_bulk() {
    let node = TestNode::start(1).await;
    let size: u64 = 17 * 1024 * 1024;
    let target = node.add_target("large.pool", size + 64 * 1024);
    let client = test_client(DEFAULT_EAGER_LIMIT).await;
    let handle = node.handle(&client);
    handle.set_eager_limit(u64::MAX);

    let data: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
    let region = handle.create(target, size).await.unwrap();
    let before = node.provider.metrics();
    handle.write(target, &region, 0, &data).await.unwrap();
    handle.persist(target, &region, 0, size).await.unwrap();
    let read = handle.read(target, &region, 0, size).await.unwrap();
    assert!(read == data, "17 MiB round trip differs");

    let after = node.provider.metrics();
    assert_eq!(after.bulk_bytes - before.bulk_bytes, 2 * size);
    assert_eq!(after.eager_bytes, before.eager_bytes);
    assert_eq!(client.exposed_count(), 0);

    // Small payloads still travel inline.
    handle.write(target, &region, 0, b"tiny").await.unwrap();
    assert_eq!(node.provider.metrics().eager_bytes - after.eager_bytes, 4);

    node.service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_huge_read_is_out_of_bounds() {
    let node = TestNode::start(1).await;
    let target = node.add_target("huge.pool", 1024);
    let client = test_client(DEFAULT_EAGER_LIMIT).await;
    let handle = node.handle(&client);

    let region = handle
        .create_write_persist(target, 32, &[3u8; 32])
        .await
        .unwrap();
    for (offset, size) in [(0, u64::MAX), (1, u64::MAX), (0, 1 << 40), (16, 4096)] {
        let err = handle.read(target, &region, offset, size).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBounds, "read of {size} at {offset}");
    }
    assert_eq!(client.exposed_count(), 0);
    assert_eq!(handle.read(target, &region, 0, 32).await.unwrap(), vec![3u8; 32]);

    node.service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_persist_and_read_to_end() {
    let node = TestNode::start(1).await;
    let target = node.add_target("to-end.pool", 8192);
    let client = test_client(DEFAULT_EAGER_LIMIT).await;
    let handle = node.handle(&client);

    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 199) as u8).collect();
    let region = handle.create_write_persist(target, 4096, &payload).await.unwrap();
    handle.write(target, &region, 0, b"head").await.unwrap();
    handle.persist_to_end(target, &region, 0).await.unwrap();
    assert_eq!(handle.get_size(target, &region).await.unwrap(), 3000);

    let all = handle.read_to_end(target, &region, 0).await.unwrap();
    assert_eq!(&all[..4], b"head");
    assert_eq!(&all[4..], &payload[4..]);
    assert_eq!(handle.read_to_end(target, &region, 2990).await.unwrap(), payload[2990..].to_vec());
    assert!(handle.read_to_end(target, &region, 3000).await.unwrap().is_empty());

    let err = handle.read_to_end(target, &region, 3001).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfBounds);

    node.service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_to_end_needs_size_tracking() {
    let node = TestNode::start_with(
        ServiceConfig::default(),
        1,
        ProviderConfig::default().with_size_tracking(false),
    )
    .await;
    let target = node.add_target("untracked.pool", 1024);
    let client = test_client(DEFAULT_EAGER_LIMIT).await;
    let handle = node.handle(&client);

    let region = handle.create_write_persist(target, 16, b"untracked").await.unwrap();
    let err = handle.persist_to_end(target, &region, 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    let err = handle.read_to_end(target, &region, 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    // Explicit sizes keep working.
    assert_eq!(handle.read(target, &region, 0, 9).await.unwrap(), b"untracked".to_vec());

    node.service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bounds_and_space_errors_cross_the_wire() {
    let node = TestNode::start(1).await;
    let target = node.add_target("bounds.pool", 1024);
    let client = test_client(DEFAULT_EAGER_LIMIT).await;
    let handle = node.handle(&client);

    let region = handle.create(target, 16).await.unwrap();
    let err = handle.write(target, &region, 15, &[0u8; 2]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfBounds);

    let err = handle.persist(target, &region, 8, 16).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfBounds);

    // Nothing persisted yet, so reads are refused.
    let err = handle.read(target, &region, 0, 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfBounds);

    let err = handle
        .create_write_persist(target, 4, &[1u8; 5])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfBounds);

    let err = handle.create(target, 4096).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfSpace);

    let err = handle.create(TargetId::generate(), 8).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    node.service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_create_write_persist_rolls_back_on_failure() {
    let failpoints = Arc::new(FailpointRegistry::new());
    let node = TestNode::start_with(
        ServiceConfig::default(),
        1,
        ProviderConfig::default().with_failpoints(failpoints.clone()),
    )
    .await;
    let target = node.add_target("rollback.pool", 1024);
    let free_before = node.provider.target_info(&target).unwrap().free_bytes;

    let client = test_client(DEFAULT_EAGER_LIMIT).await;
    let handle = node.handle(&client);

    failpoints.enable("region_store::persist", FailpointAction::Error);
    let err = handle
        .create_write_persist(target, 64, &[7u8; 64])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoFailure);
    assert!(failpoints.triggered_count("region_store::persist") >= 1);

    assert!(node.provider.list_regions(&target).unwrap().is_empty());
    assert_eq!(
        node.provider.target_info(&target).unwrap().free_bytes,
        free_before
    );

    failpoints.disable("region_store::persist");
    let region = handle
        .create_write_persist(target, 64, &[7u8; 64])
        .await
        .unwrap();
    assert_eq!(handle.read(target, &region, 0, 64).await.unwrap(), vec![7u8; 64]);
    assert_eq!(node.provider.list_regions(&target).unwrap().len(), 1);

    node.service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_proxy_operations_use_caller_buffers() {
    let node = TestNode::start(1).await;
    let target = node.add_target("proxy.pool", 4096);
    let client = test_client(DEFAULT_EAGER_LIMIT).await;
    let handle = node.handle(&client);

    let source = client.expose(b"proxied payload".to_vec(), BulkAccess::ReadOnly);
    let region = handle
        .proxy_create_write_persist(target, &source.bulk_ref())
        .await
        .unwrap();
    assert_eq!(handle.get_size(target, &region).await.unwrap(), source.len());

    let overwrite = client.expose(b"PROXIED".to_vec(), BulkAccess::ReadOnly);
    handle
        .proxy_write(target, &region, 0, &overwrite.bulk_ref())
        .await
        .unwrap();
    handle.persist(target, &region, 0, 7).await.unwrap();

    let sink = client.expose(vec![0u8; 15], BulkAccess::WriteOnly);
    let n = handle
        .proxy_read(target, &region, 0, &sink.bulk_ref())
        .await
        .unwrap();
    assert_eq!(n, 15);
    assert_eq!(sink.to_vec(), b"PROXIED payload".to_vec());

    // A read-only buffer cannot receive read results.
    let err = handle
        .proxy_read(target, &region, 0, &source.bulk_ref())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    drop(source);
    drop(overwrite);
    drop(sink);
    assert_eq!(client.exposed_count(), 0);

    node.service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_provider() {
    let node = TestNode::start(1).await;
    let client = test_client(DEFAULT_EAGER_LIMIT).await;

    let handle = client.provider_handle(node.service.endpoint(), 42);
    let err = handle.probe(None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    node.service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_shutdown_disabled() {
    let node = TestNode::start(1).await;
    let client = test_client(DEFAULT_EAGER_LIMIT).await;

    let err = client
        .shutdown_service(node.service.endpoint())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    // Still serving.
    assert!(node.handle(&client).probe(None).await.unwrap().is_empty());

    node.service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_shutdown_enabled() {
    let node = TestNode::start_with(
        ServiceConfig::default().with_remote_shutdown(true),
        1,
        ProviderConfig::default(),
    )
    .await;
    node.add_target("shutdown.pool", 1024);
    let client = test_client(DEFAULT_EAGER_LIMIT).await;

    client.shutdown_service(node.service.endpoint()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), node.service.wait())
        .await
        .unwrap()
        .unwrap();

    // Stopping detaches every target.
    assert_eq!(node.provider.count_targets(), 0);
}

#[tokio::test]
async fn test_detach_and_reattach_keeps_regions() {
    let node = TestNode::start(1).await;
    let path = node.pool_path("reattach.pool");
    let target = node.provider.create_target(&path, 2048).unwrap();
    let client = test_client(DEFAULT_EAGER_LIMIT).await;
    let handle = node.handle(&client);

    let region = handle
        .create_write_persist(target, 100, b"survives a detach")
        .await
        .unwrap();

    node.provider.detach_all_targets().unwrap();
    assert!(handle.probe(None).await.unwrap().is_empty());
    let err = handle.read(target, &region, 0, 4).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert_eq!(node.provider.attach_target(&path).unwrap(), target);
    assert!(wait_for(|| node.provider.count_targets() == 1, Duration::from_secs(1)).await);
    assert_eq!(
        handle.read(target, &region, 0, 17).await.unwrap(),
        b"survives a detach".to_vec()
    );

    node.service.shutdown().await.unwrap();
}
