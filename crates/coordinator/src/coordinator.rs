use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cluster_core::{ClusterError, ClusterResult};
use cluster_domain::{
    message_types, Cluster, ClusterMessage, DistributedStats, Node, NodeRole, NodeStatus,
};
use metrics::gauge;
use rand::Rng;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DistributedConfig;
use crate::failure_detector::{FailureDetector, FailureDetectorConfig};

#[derive(Debug)]
struct ElectionState {
    role: NodeRole,
    leader_id: Option<String>,
    degraded: bool,
    /// 最近一次观察到Leader的时间
    last_leader_seen: Instant,
    /// 本轮候选前的随机等待
    jitter: Duration,
    registered: bool,
}

struct Shared {
    node_id: String,
    state: RwLock<ElectionState>,
    leader_tx: watch::Sender<Option<String>>,
    leadership_tx: watch::Sender<bool>,
}

impl Shared {
    fn publish(&self, state: &ElectionState) {
        let leader = state.leader_id.clone();
        self.leader_tx.send_if_modified(|current| {
            if *current != leader {
                *current = leader;
                true
            } else {
                false
            }
        });
        let is_leader = state.role == NodeRole::Leader;
        self.leadership_tx.send_if_modified(|current| {
            if *current != is_leader {
                *current = is_leader;
                true
            } else {
                false
            }
        });
        gauge!("cluster_leader").set(if is_leader { 1.0 } else { 0.0 });
    }

    /// 处理其他节点广播的Leader变更
    async fn on_message(&self, message: ClusterMessage) {
        if message.is_from(&self.node_id) {
            return;
        }
        let mut state = self.state.write().await;
        match message.message_type.as_str() {
            message_types::LEADER_ELECTED => {
                debug!("收到Leader选举消息: {}", message.node_id);
                if state.role != NodeRole::Leader {
                    state.leader_id = Some(message.node_id);
                    state.last_leader_seen = Instant::now();
                }
            }
            message_types::LEADER_DEPOSED => {
                if state.leader_id.as_deref() == Some(message.node_id.as_str()) {
                    debug!("Leader {} 已卸任", message.node_id);
                    state.leader_id = None;
                }
            }
            _ => return,
        }
        self.publish(&state);
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

/// 集群协调器
///
/// 状态机 `Follower -> Candidate -> Leader`：
/// - 超过选举超时（加随机抖动）未观察到Leader锁时成为候选者
/// - 候选者获取Leader锁成功即成为Leader并广播 `leader.elected`
/// - Leader 续期失败或后端不可用时立即降级为 Follower
///
/// 每个心跳周期续期Leader锁、刷新本节点存活键并更新节点花名册。
/// 后端不可用时进入降级状态（不是Leader、与集群隔离），不会中断运行。
pub struct Coordinator {
    config: DistributedConfig,
    shared: Arc<Shared>,
    detector: Mutex<FailureDetector>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Coordinator {
    pub fn new(config: DistributedConfig) -> Self {
        let detector = FailureDetector::new(FailureDetectorConfig {
            suspect_after: config.suspect_after(),
            offline_after: config.offline_after(),
            cleanup_after: config.node_cleanup_after,
        });
        let (leader_tx, _) = watch::channel(None);
        let (leadership_tx, _) = watch::channel(false);
        let state = ElectionState {
            role: NodeRole::Follower,
            leader_id: None,
            degraded: false,
            last_leader_seen: Instant::now(),
            jitter: random_jitter(config.heartbeat_interval),
            registered: false,
        };

        Self {
            shared: Arc::new(Shared {
                node_id: config.node_id.clone(),
                state: RwLock::new(state),
                leader_tx,
                leadership_tx,
            }),
            config,
            detector: Mutex::new(detector),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.config.cluster
    }

    pub fn config(&self) -> &DistributedConfig {
        &self.config
    }

    /// 订阅Leader消息并启动心跳循环，重复调用无效果
    pub async fn start(self: &Arc<Self>) -> ClusterResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.config.validate()?;

        let shared = Arc::clone(&self.shared);
        if let Err(e) = self
            .config
            .cluster
            .subscribe(Arc::new(move |message: ClusterMessage| {
                let shared = Arc::clone(&shared);
                async move { shared.on_message(message).await }
            }))
            .await
        {
            warn!("订阅集群消息失败，仅依赖轮询观察Leader: {}", e);
        }

        // 先执行一次，尽早注册节点
        self.tick().await;

        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(coordinator.config.heartbeat_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = coordinator.cancel.cancelled() => break,
                    _ = interval.tick() => coordinator.tick().await,
                }
            }
            debug!("协调循环已退出");
        });
        *self.handle.lock().await = Some(handle);

        info!(
            "协调器已启动: node={} backend={} standalone={}",
            self.config.node_id,
            self.config.cluster.backend_name(),
            self.config.cluster.is_standalone()
        );
        Ok(())
    }

    /// 停止心跳循环；是Leader时释放Leader锁并广播卸任
    pub async fn stop(&self) -> ClusterResult<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!("协调循环异常退出: {}", e);
            }
        }

        let was_leader = {
            let mut state = self.shared.state.write().await;
            let was_leader = state.role == NodeRole::Leader;
            state.role = NodeRole::Follower;
            if was_leader {
                state.leader_id = None;
            }
            self.shared.publish(&state);
            was_leader
        };

        if was_leader && !self.config.cluster.is_standalone() {
            self.step_down_remote().await;
        }
        info!("协调器已停止: {}", self.config.node_id);
        Ok(())
    }

    async fn step_down_remote(&self) {
        if let Err(e) = self.config.cluster.release_lock(&self.config.leader_key).await {
            warn!("释放Leader锁失败，等待其过期: {}", e);
        }
        let message = ClusterMessage::new(
            message_types::LEADER_DEPOSED,
            self.config.node_id.clone(),
            Vec::new(),
        );
        if let Err(e) = self.config.cluster.broadcast(message).await {
            debug!("广播卸任消息失败: {}", e);
        }
    }

    /// 执行一次心跳周期
    pub async fn tick(&self) {
        let mut degraded = false;

        if let Err(e) = self.heartbeat().await {
            warn!("节点心跳失败: {}", e);
            degraded = true;
        }

        if self.config.cluster.is_standalone() {
            let mut state = self.shared.state.write().await;
            state.role = NodeRole::Leader;
            state.leader_id = Some(self.config.node_id.clone());
            state.degraded = degraded;
            self.shared.publish(&state);
        } else if self.config.enable_leader_election {
            if let Err(e) = self.run_election().await {
                warn!("Leader选举周期失败，节点进入隔离状态: {}", e);
                degraded = true;
            }
        }

        if let Err(e) = self.refresh_roster().await {
            debug!("刷新节点花名册失败: {}", e);
            degraded = true;
        }

        let mut state = self.shared.state.write().await;
        if state.degraded != degraded {
            if degraded {
                warn!("节点 {} 与集群后端失去联系，进入降级模式", self.config.node_id);
            } else {
                info!("节点 {} 已恢复与集群后端的连接", self.config.node_id);
            }
            state.degraded = degraded;
        }
    }

    async fn heartbeat(&self) -> ClusterResult<()> {
        let registered = self.shared.state.read().await.registered;
        let cluster = &self.config.cluster;
        if registered {
            cluster
                .heartbeat(&self.config.node_id, self.config.node_ttl)
                .await
        } else {
            cluster
                .register_node(&self.config.node_id, self.config.node_ttl)
                .await?;
            self.shared.state.write().await.registered = true;
            let message = ClusterMessage::new(
                message_types::NODE_JOINED,
                self.config.node_id.clone(),
                Vec::new(),
            );
            if let Err(e) = cluster.broadcast(message).await {
                debug!("广播节点加入消息失败: {}", e);
            }
            Ok(())
        }
    }

    async fn run_election(&self) -> ClusterResult<()> {
        let role = self.shared.state.read().await.role;
        match role {
            NodeRole::Leader => self.renew_leadership().await,
            NodeRole::Follower | NodeRole::Candidate => self.observe_or_campaign().await,
        }
    }

    async fn renew_leadership(&self) -> ClusterResult<()> {
        let key = &self.config.leader_key;
        let result = self
            .config
            .cluster
            .acquire_lock(key, self.config.lock_timeout)
            .await;

        match result {
            Ok(true) => {
                self.shared.state.write().await.last_leader_seen = Instant::now();
                Ok(())
            }
            Ok(false) => {
                warn!("节点 {} 续期Leader锁失败，降级为Follower", self.config.node_id);
                self.demote().await;
                self.broadcast_deposed().await;
                Ok(())
            }
            Err(e) => {
                warn!("节点 {} 无法续期Leader锁，降级为Follower: {}", self.config.node_id, e);
                self.demote().await;
                Err(e)
            }
        }
    }

    async fn observe_or_campaign(&self) -> ClusterResult<()> {
        let key = &self.config.leader_key;
        let holder = match self.config.cluster.lock_holder(key).await {
            Ok(holder) => holder,
            Err(e) => {
                self.demote().await;
                return Err(e);
            }
        };

        if let Some(holder) = holder {
            let mut state = self.shared.state.write().await;
            if state.leader_id.as_deref() != Some(holder.as_str()) {
                info!("观察到Leader: {}", holder);
            }
            state.role = NodeRole::Follower;
            state.leader_id = Some(holder);
            state.last_leader_seen = Instant::now();
            self.shared.publish(&state);
            return Ok(());
        }

        {
            let mut state = self.shared.state.write().await;
            if state.leader_id.take().is_some() {
                info!("Leader锁已失效，等待选举");
            }
            let waited = state.last_leader_seen.elapsed();
            if waited < self.config.election_timeout + state.jitter {
                self.shared.publish(&state);
                return Ok(());
            }
            state.role = NodeRole::Candidate;
            self.shared.publish(&state);
        }

        debug!("节点 {} 成为候选者", self.config.node_id);
        let acquired = match self
            .config
            .cluster
            .acquire_lock(key, self.config.lock_timeout)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                self.demote().await;
                return Err(e);
            }
        };

        if acquired {
            {
                let mut state = self.shared.state.write().await;
                state.role = NodeRole::Leader;
                state.leader_id = Some(self.config.node_id.clone());
                state.last_leader_seen = Instant::now();
                self.shared.publish(&state);
            }
            info!("节点 {} 当选为Leader", self.config.node_id);
            let message = ClusterMessage::new(
                message_types::LEADER_ELECTED,
                self.config.node_id.clone(),
                Vec::new(),
            );
            if let Err(e) = self.config.cluster.broadcast(message).await {
                debug!("广播当选消息失败: {}", e);
            }
        } else {
            // 竞选失败，下个周期观察新的Leader
            self.demote().await;
        }
        Ok(())
    }

    async fn demote(&self) {
        let mut state = self.shared.state.write().await;
        if state.role == NodeRole::Leader {
            info!("节点 {} 不再是Leader", self.config.node_id);
        }
        state.role = NodeRole::Follower;
        state.leader_id = None;
        state.jitter = random_jitter(self.config.heartbeat_interval);
        self.shared.publish(&state);
    }

    async fn broadcast_deposed(&self) {
        let message = ClusterMessage::new(
            message_types::LEADER_DEPOSED,
            self.config.node_id.clone(),
            Vec::new(),
        );
        if let Err(e) = self.config.cluster.broadcast(message).await {
            debug!("广播卸任消息失败: {}", e);
        }
    }

    async fn refresh_roster(&self) -> ClusterResult<()> {
        let live = self.config.cluster.list_nodes().await?;
        let newly_offline = self.detector.lock().await.observe(live, Utc::now());

        if newly_offline.is_empty() || !self.is_leader().await {
            return Ok(());
        }
        for node in newly_offline {
            match ClusterMessage::json(message_types::NODE_OFFLINE, self.config.node_id.clone(), &node) {
                Ok(message) => {
                    if let Err(e) = self.config.cluster.broadcast(message).await {
                        debug!("广播节点离线消息失败: {}", e);
                    }
                }
                Err(e) => error!("编码节点离线消息失败: {}", e),
            }
        }
        Ok(())
    }

    pub async fn role(&self) -> NodeRole {
        self.shared.state.read().await.role
    }

    pub async fn is_leader(&self) -> bool {
        self.role().await == NodeRole::Leader
    }

    pub async fn leader_id(&self) -> Option<String> {
        self.shared.state.read().await.leader_id.clone()
    }

    pub async fn is_degraded(&self) -> bool {
        self.shared.state.read().await.degraded
    }

    /// 本节点是否应派发工作
    ///
    /// 未启用分发或选举时每个节点都派发；存在已知Leader时只有Leader派发；
    /// 没有Leader时本地派发。
    pub async fn should_dispatch(&self, distribution_enabled: bool) -> bool {
        if !distribution_enabled || !self.config.enable_leader_election {
            return true;
        }
        let state = self.shared.state.read().await;
        state.role == NodeRole::Leader || state.leader_id.is_none()
    }

    /// 等待集群中出现Leader，返回其节点ID
    pub async fn wait_for_leader(&self, timeout: Duration) -> ClusterResult<String> {
        let mut rx = self.shared.leader_tx.subscribe();
        let wait = async {
            rx.wait_for(Option::is_some)
                .await
                .map(|leader| leader.clone().unwrap_or_default())
                .map_err(|_| ClusterError::ElectionTimeout)
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::ElectionTimeout),
        }
    }

    /// 本节点是否为Leader的变化通知
    pub fn subscribe_leadership(&self) -> watch::Receiver<bool> {
        self.shared.leadership_tx.subscribe()
    }

    /// 当前花名册
    pub async fn nodes(&self) -> Vec<Node> {
        self.detector.lock().await.nodes()
    }

    /// 分布式状态快照，引擎在此基础上填充自身统计
    pub async fn stats(&self) -> DistributedStats {
        let (role, leader_id, degraded) = {
            let state = self.shared.state.read().await;
            (state.role, state.leader_id.clone(), state.degraded)
        };
        let mut nodes = self.nodes().await;
        if nodes.is_empty() {
            nodes.push(Node::new(self.config.node_id.clone()));
        }
        let online_nodes = nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Online)
            .count();

        DistributedStats {
            node_id: self.config.node_id.clone(),
            is_leader: role == NodeRole::Leader,
            role,
            total_nodes: nodes.len(),
            online_nodes,
            leader_id,
            degraded,
            nodes,
            scheduler: None,
            queue: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_infrastructure::LocalCluster;

    #[tokio::test]
    async fn test_standalone_is_leader() {
        let cluster: Arc<dyn Cluster> = Arc::new(LocalCluster::local("solo"));
        let coordinator = Coordinator::new(DistributedConfig::new(cluster));

        coordinator.tick().await;
        assert!(coordinator.is_leader().await);
        assert!(coordinator.should_dispatch(true).await);

        let stats = coordinator.stats().await;
        assert_eq!(stats.total_nodes, 1);
        assert_eq!(stats.leader_id.as_deref(), Some("solo"));
        assert!(!stats.degraded);
    }

    #[tokio::test]
    async fn test_wait_for_leader_times_out() {
        let cluster: Arc<dyn Cluster> = Arc::new(LocalCluster::local("solo"));
        let coordinator = Coordinator::new(DistributedConfig::new(cluster));

        let err = coordinator
            .wait_for_leader(Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::ElectionTimeout));

        coordinator.tick().await;
        assert_eq!(
            coordinator.wait_for_leader(Duration::from_millis(30)).await.unwrap(),
            "solo"
        );
    }

    #[test]
    fn test_jitter_is_bounded() {
        for _ in 0..50 {
            assert!(random_jitter(Duration::from_millis(20)) <= Duration::from_millis(20));
        }
        assert_eq!(random_jitter(Duration::ZERO), Duration::ZERO);
    }
}
