use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::node::{Node, NodeRole};

/// 工作池状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    #[default]
    Starting,
    Running,
    Draining,
    Stopped,
}

impl PoolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolStatus::Starting => "starting",
            PoolStatus::Running => "running",
            PoolStatus::Draining => "draining",
            PoolStatus::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_workers: usize,
    pub active_workers: usize,
    pub idle_workers: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    /// 失败后被重新安排执行的次数
    pub total_retried: u64,
    pub status: PoolStatus,
}

/// 单个队列中各状态的作业数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub delayed: u64,
    pub reserved: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueCounts {
    /// 尚未结束的作业数量
    pub fn size(&self) -> u64 {
        self.pending + self.delayed + self.reserved
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub distributed: bool,
    pub total_pushed: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_requeued: u64,
    pub queues: BTreeMap<String, QueueCounts>,
    pub pools: BTreeMap<String, PoolStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub total_tasks: usize,
    pub enabled_tasks: usize,
    pub total_runs: u64,
    pub total_failures: u64,
    /// 因非Leader而跳过的到期触发次数
    pub skipped_dispatches: u64,
    pub pool: PoolStats,
}

/// 面向监控的分布式状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedStats {
    pub node_id: String,
    pub is_leader: bool,
    pub role: NodeRole,
    pub total_nodes: usize,
    pub online_nodes: usize,
    pub leader_id: Option<String>,
    /// 集群后端不可用，节点以隔离模式运行
    pub degraded: bool,
    pub nodes: Vec<Node>,
    pub scheduler: Option<SchedulerStats>,
    pub queue: Option<QueueStats>,
}
