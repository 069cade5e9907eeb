use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cluster_core::{ClusterConfig, ClusterError};
use cluster_domain::{Cluster, ClusterMessage, NodeStatus};
use cluster_infrastructure::{BackendCluster, FaultInjectingBackend, MemoryBackend};
use tokio::sync::{mpsc, Barrier};

/// 创建共享同一后端的多个节点
fn create_nodes(count: usize, backend: &Arc<MemoryBackend>) -> Vec<Arc<BackendCluster<MemoryBackend>>> {
    (0..count)
        .map(|i| {
            Arc::new(BackendCluster::new(
                format!("node-{i}"),
                Arc::clone(backend),
                &ClusterConfig::default(),
            ))
        })
        .collect()
}

#[tokio::test]
async fn test_lock_mutual_exclusion_across_nodes() {
    let backend = Arc::new(MemoryBackend::new());
    let nodes = create_nodes(8, &backend);
    let barrier = Arc::new(Barrier::new(nodes.len()));

    let mut handles = Vec::new();
    for node in &nodes {
        let node = Arc::clone(node);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            node.acquire_lock("report", Duration::from_secs(5)).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_critical_section_never_overlaps() {
    let backend = Arc::new(MemoryBackend::new());
    let nodes = create_nodes(4, &backend);
    let inside = Arc::new(AtomicUsize::new(0));
    let entered = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for node in &nodes {
        let node = Arc::clone(node);
        let inside = Arc::clone(&inside);
        let entered = Arc::clone(&entered);
        handles.push(tokio::spawn(async move {
            for _ in 0..20 {
                if node.acquire_lock("section", Duration::from_secs(5)).await.unwrap() {
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    entered.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    node.release_lock("section").await.unwrap();
                }
                tokio::task::yield_now().await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert!(entered.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn test_list_nodes_follows_heartbeats() {
    let backend = Arc::new(MemoryBackend::new());
    let nodes = create_nodes(3, &backend);
    for node in &nodes {
        node.register_node(node.node_id(), Duration::from_millis(100))
            .await
            .unwrap();
    }

    let listed = nodes[0].list_nodes().await.unwrap();
    let ids: Vec<&str> = listed.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["node-0", "node-1", "node-2"]);
    assert!(listed.iter().all(|n| n.status == NodeStatus::Online));

    // 只有 node-0 持续心跳
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        nodes[0]
            .heartbeat("node-0", Duration::from_millis(100))
            .await
            .unwrap();
    }
    let listed = nodes[1].list_nodes().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "node-0");
}

#[tokio::test]
async fn test_broadcast_reaches_every_subscriber() {
    let backend = Arc::new(MemoryBackend::new());
    let nodes = create_nodes(3, &backend);
    let (tx, mut rx) = mpsc::channel(16);

    for node in &nodes {
        let tx = tx.clone();
        let receiver = node.node_id().to_string();
        node.subscribe(Arc::new(move |msg: ClusterMessage| {
            let tx = tx.clone();
            let receiver = receiver.clone();
            async move {
                let _ = tx.send((receiver, msg.message_type)).await;
            }
        }))
        .await
        .unwrap();
    }

    nodes[0]
        .broadcast(ClusterMessage::new("cache.invalidate", "node-0", Vec::new()))
        .await
        .unwrap();

    let mut receivers = HashSet::new();
    for _ in 0..3 {
        let (receiver, kind) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kind, "cache.invalidate");
        receivers.insert(receiver);
    }
    assert_eq!(receivers.len(), 3);
}

#[tokio::test]
async fn test_partition_surfaces_backend_unavailable() {
    let shared = Arc::new(MemoryBackend::new());
    let faulty = Arc::new(FaultInjectingBackend::new(Arc::clone(&shared)));
    let mut config = ClusterConfig::default();
    config.max_retry_attempts = 2;
    config.retry_base_delay_ms = 1;
    let isolated = BackendCluster::new("isolated", Arc::clone(&faulty), &config);
    let healthy = BackendCluster::new("healthy", Arc::clone(&shared), &config);

    assert!(isolated.acquire_lock("leader", Duration::from_millis(100)).await.unwrap());

    faulty.partition();
    let err = isolated
        .renew_lock("leader", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::BackendUnavailable(_)));

    // 分区期间锁过期，其他节点可以接管
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(healthy.acquire_lock("leader", Duration::from_secs(5)).await.unwrap());

    faulty.heal();
    assert!(!isolated.acquire_lock("leader", Duration::from_secs(5)).await.unwrap());
    assert_eq!(
        isolated.lock_holder("leader").await.unwrap().as_deref(),
        Some("healthy")
    );
}

#[tokio::test]
async fn test_failed_release_can_be_retried() {
    let shared = Arc::new(MemoryBackend::new());
    let faulty = Arc::new(FaultInjectingBackend::new(Arc::clone(&shared)));
    let mut config = ClusterConfig::default();
    config.max_retry_attempts = 2;
    config.retry_base_delay_ms = 1;
    let owner = BackendCluster::new("owner", Arc::clone(&faulty), &config);
    let other = BackendCluster::new("other", Arc::clone(&shared), &config);

    assert!(owner.acquire_lock("report", Duration::from_secs(30)).await.unwrap());
    let token = owner.lock_token("report").await;
    assert!(token.is_some());

    faulty.partition();
    let err = owner.release_lock("report").await.unwrap_err();
    assert!(matches!(err, ClusterError::BackendUnavailable(_)));
    // 释放失败时仍然持有令牌
    assert_eq!(owner.lock_token("report").await, token);
    assert!(!other.acquire_lock("report", Duration::from_secs(30)).await.unwrap());

    faulty.heal();
    owner.release_lock("report").await.unwrap();
    assert_eq!(owner.lock_token("report").await, None);
    // 锁的TTL还很长，能立即获取说明后端的键已被删除
    assert!(other.acquire_lock("report", Duration::from_secs(30)).await.unwrap());
}
