use std::sync::Arc;
use std::time::Duration;

use cluster_core::{validate_timings, ClusterConfig, ClusterResult, CoordinationConfig};
use cluster_domain::Cluster;

/// 调度引擎和队列引擎共享的分布式配置
///
/// 持有集群句柄本身，两个引擎使用同一个实例即共享同一个节点身份。
#[derive(Clone)]
pub struct DistributedConfig {
    pub node_id: String,
    pub cluster: Arc<dyn Cluster>,
    pub election_timeout: Duration,
    pub lock_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// 节点存活键的TTL
    pub node_ttl: Duration,
    pub enable_leader_election: bool,
    pub enable_task_distribution: bool,
    pub enable_job_distribution: bool,
    pub worker_count: usize,
    pub max_concurrency: usize,
    pub shutdown_timeout: Duration,
    pub suspect_after_missed: u32,
    pub offline_after_missed: u32,
    pub node_cleanup_after: Duration,
    pub leader_key: String,
}

impl std::fmt::Debug for DistributedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedConfig")
            .field("node_id", &self.node_id)
            .field("backend", &self.cluster.backend_name())
            .field("election_timeout", &self.election_timeout)
            .field("lock_timeout", &self.lock_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("enable_leader_election", &self.enable_leader_election)
            .field("worker_count", &self.worker_count)
            .finish_non_exhaustive()
    }
}

impl DistributedConfig {
    /// 使用默认调优参数
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self::from_settings(cluster, &ClusterConfig::default(), &CoordinationConfig::default())
    }

    pub fn from_settings(
        cluster: Arc<dyn Cluster>,
        cluster_config: &ClusterConfig,
        coordination: &CoordinationConfig,
    ) -> Self {
        Self {
            node_id: cluster.node_id().to_string(),
            cluster,
            election_timeout: coordination.election_timeout(),
            lock_timeout: coordination.lock_timeout(),
            heartbeat_interval: coordination.heartbeat_interval(),
            node_ttl: cluster_config.ttl(),
            enable_leader_election: coordination.enable_leader_election,
            enable_task_distribution: coordination.enable_task_distribution,
            enable_job_distribution: coordination.enable_job_distribution,
            worker_count: coordination.worker_count,
            max_concurrency: coordination.max_concurrency,
            shutdown_timeout: coordination.shutdown_timeout(),
            suspect_after_missed: coordination.suspect_after_missed,
            offline_after_missed: coordination.offline_after_missed,
            node_cleanup_after: coordination.node_cleanup_after(),
            leader_key: coordination.leader_key.clone(),
        }
    }

    pub fn with_timings(
        mut self,
        heartbeat_interval: Duration,
        lock_timeout: Duration,
        election_timeout: Duration,
    ) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self.lock_timeout = lock_timeout;
        self.election_timeout = election_timeout;
        self
    }

    pub fn with_node_ttl(mut self, ttl: Duration) -> Self {
        self.node_ttl = ttl;
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_leader_election(mut self, enabled: bool) -> Self {
        self.enable_leader_election = enabled;
        self
    }

    pub fn with_task_distribution(mut self, enabled: bool) -> Self {
        self.enable_task_distribution = enabled;
        self
    }

    pub fn with_job_distribution(mut self, enabled: bool) -> Self {
        self.enable_job_distribution = enabled;
        self
    }

    /// 节点超过该时长无心跳标记为 suspect
    pub fn suspect_after(&self) -> Duration {
        self.heartbeat_interval * self.suspect_after_missed
    }

    /// 节点超过该时长无心跳标记为 offline
    pub fn offline_after(&self) -> Duration {
        self.heartbeat_interval * self.offline_after_missed
    }

    pub fn validate(&self) -> ClusterResult<()> {
        validate_timings(
            self.heartbeat_interval,
            self.lock_timeout,
            self.election_timeout,
        )?;
        if self.worker_count == 0 {
            return Err(cluster_core::ClusterError::config_error(
                "worker_count 必须大于0",
            ));
        }
        Ok(())
    }
}
