use std::sync::Arc;
use std::time::Duration;

use cluster_core::ClusterConfig;
use cluster_coordinator::{Coordinator, DistributedConfig};
use cluster_domain::{Cluster, NodeRole};
use cluster_infrastructure::{BackendCluster, FaultInjectingBackend, MemoryBackend};

const HEARTBEAT: Duration = Duration::from_millis(20);
const LOCK_TIMEOUT: Duration = Duration::from_millis(100);
const ELECTION_TIMEOUT: Duration = Duration::from_millis(60);

struct TestNode {
    link: Arc<FaultInjectingBackend<MemoryBackend>>,
    coordinator: Coordinator,
}

/// 每个节点通过独立的故障注入包装访问同一个内存后端
fn create_cluster(size: usize) -> Vec<TestNode> {
    let shared = Arc::new(MemoryBackend::new());
    let mut cluster_config = ClusterConfig::default();
    cluster_config.max_retry_attempts = 1;

    (0..size)
        .map(|i| {
            let link = Arc::new(FaultInjectingBackend::new(Arc::clone(&shared)));
            let cluster: Arc<dyn Cluster> = Arc::new(BackendCluster::new(
                format!("node-{i}"),
                Arc::clone(&link),
                &cluster_config,
            ));
            let config = DistributedConfig::new(cluster)
                .with_timings(HEARTBEAT, LOCK_TIMEOUT, ELECTION_TIMEOUT)
                .with_node_ttl(Duration::from_millis(200));
            TestNode {
                link,
                coordinator: Coordinator::new(config),
            }
        })
        .collect()
}

async fn tick_all(nodes: &[TestNode]) {
    for node in nodes {
        node.coordinator.tick().await;
    }
}

async fn leaders(nodes: &[TestNode]) -> Vec<String> {
    let mut ids = Vec::new();
    for node in nodes {
        if node.coordinator.is_leader().await {
            ids.push(node.coordinator.node_id().to_string());
        }
    }
    ids
}

/// 按心跳节奏驱动所有节点，每轮结束时Leader不超过一个
async fn run_rounds(nodes: &[TestNode], rounds: usize) {
    for _ in 0..rounds {
        tick_all(nodes).await;
        let current = leaders(nodes).await;
        assert!(current.len() <= 1, "同时存在多个Leader: {current:?}");
        tokio::time::sleep(HEARTBEAT).await;
    }
}

#[tokio::test]
async fn test_single_leader_elected() {
    let nodes = create_cluster(5);
    run_rounds(&nodes, 10).await;

    let current = leaders(&nodes).await;
    assert_eq!(current.len(), 1);

    // 所有Follower观察到同一个Leader
    for node in &nodes {
        assert_eq!(node.coordinator.leader_id().await.as_deref(), Some(current[0].as_str()));
    }
}

#[tokio::test]
async fn test_leader_uniqueness_under_partitions() {
    let nodes = create_cluster(5);
    run_rounds(&nodes, 10).await;
    let first = leaders(&nodes).await;
    assert_eq!(first.len(), 1);

    // 隔离当前Leader
    let isolated = nodes
        .iter()
        .position(|n| n.coordinator.node_id() == first[0])
        .unwrap();
    nodes[isolated].link.partition();

    run_rounds(&nodes, 15).await;
    let second = leaders(&nodes).await;
    assert_eq!(second.len(), 1);
    assert_ne!(second[0], first[0]);
    assert!(nodes[isolated].coordinator.is_degraded().await);
    assert_eq!(nodes[isolated].coordinator.role().await, NodeRole::Follower);

    // 恢复后旧Leader作为Follower重新加入
    nodes[isolated].link.heal();
    run_rounds(&nodes, 5).await;
    let third = leaders(&nodes).await;
    assert_eq!(third, second);
    assert!(!nodes[isolated].coordinator.is_degraded().await);
    assert_eq!(
        nodes[isolated].coordinator.leader_id().await.as_deref(),
        Some(second[0].as_str())
    );
}

#[tokio::test]
async fn test_stop_hands_over_leadership() {
    let nodes = create_cluster(3);
    run_rounds(&nodes, 10).await;
    let first = leaders(&nodes).await;
    assert_eq!(first.len(), 1);

    let leader = nodes
        .iter()
        .find(|n| n.coordinator.node_id() == first[0])
        .unwrap();
    leader.coordinator.stop().await.unwrap();
    assert!(!leader.coordinator.is_leader().await);

    let remaining: Vec<&TestNode> = nodes
        .iter()
        .filter(|n| n.coordinator.node_id() != first[0])
        .collect();
    for _ in 0..10 {
        for node in &remaining {
            node.coordinator.tick().await;
        }
        tokio::time::sleep(HEARTBEAT).await;
    }

    let mut new_leaders = Vec::new();
    for node in &remaining {
        if node.coordinator.is_leader().await {
            new_leaders.push(node.coordinator.node_id().to_string());
        }
    }
    assert_eq!(new_leaders.len(), 1);
}

#[tokio::test]
async fn test_background_loop_and_leadership_watch() {
    let nodes = create_cluster(1);
    let coordinator = Arc::new(
        Coordinator::new(
            DistributedConfig::new(Arc::new(BackendCluster::new(
                "solo",
                Arc::clone(&nodes[0].link),
                &ClusterConfig::default(),
            )))
            .with_timings(HEARTBEAT, LOCK_TIMEOUT, ELECTION_TIMEOUT),
        ),
    );
    let mut leadership = coordinator.subscribe_leadership();

    coordinator.start().await.unwrap();
    let leader = coordinator
        .wait_for_leader(Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(leader, "solo");

    tokio::time::timeout(Duration::from_secs(1), leadership.wait_for(|is_leader| *is_leader))
        .await
        .unwrap()
        .unwrap();

    let stats = coordinator.stats().await;
    assert!(stats.is_leader);
    assert_eq!(stats.online_nodes, 1);

    coordinator.stop().await.unwrap();
    assert!(!*coordinator.subscribe_leadership().borrow());
}
