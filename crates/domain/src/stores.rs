//! 任务与作业存储抽象

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cluster_core::ClusterResult;

use crate::models::{Job, QueueCounts, Reservation, Task};

/// 任务定义及运行时状态存储
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 插入或替换任务
    async fn upsert(&self, task: Task) -> ClusterResult<()>;
    async fn get(&self, id: &str) -> ClusterResult<Option<Task>>;
    async fn remove(&self, id: &str) -> ClusterResult<Option<Task>>;
    async fn list(&self) -> ClusterResult<Vec<Task>>;
    /// 已启用且 `next_run <= now` 的任务
    async fn due(&self, now: DateTime<Utc>) -> ClusterResult<Vec<Task>>;
    /// 推进调度时间，返回是否找到任务
    async fn advance(
        &self,
        id: &str,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> ClusterResult<bool>;
    /// 记录一次计划执行的最终结果
    async fn record_outcome(&self, id: &str, success: bool) -> ClusterResult<()>;
    async fn set_enabled(
        &self,
        id: &str,
        enabled: bool,
        next_run: Option<DateTime<Utc>>,
    ) -> ClusterResult<()>;
}

/// 回收超时预留作业的结果
#[derive(Debug, Default)]
pub struct ReapOutcome {
    /// 重新变为可见的作业ID
    pub requeued: Vec<String>,
    /// 尝试次数已耗尽而被标记为失败的作业
    pub failed: Vec<Job>,
}

/// 作业队列存储
///
/// 同一队列内按（可见时间、优先级降序、入队顺序升序）出队。
#[async_trait]
pub trait JobStore: Send + Sync {
    /// 入队，返回分配了序号和可见时间的作业
    async fn push(&self, job: Job) -> ClusterResult<Job>;
    /// 批量入队，对并发读者要么全部可见要么全部不可见
    async fn push_batch(&self, jobs: Vec<Job>) -> ClusterResult<Vec<Job>>;
    /// 取出一个可执行的作业并标记为预留，尝试次数加一
    async fn reserve(&self, queue: &str, worker: &str, now: DateTime<Utc>)
        -> ClusterResult<Option<Job>>;
    /// 预留 -> 完成；重复调用或预留已失效时返回 `false`
    ///
    /// `fence` 为 `Some` 时只有仍处于该次预留的作业会被修改，过期的预留者
    /// （例如已被回收后又被其他工作者取走）的调用被忽略。
    async fn complete(&self, job_id: &str, fence: Option<&Reservation>) -> ClusterResult<bool>;
    /// 将预留作业放回队列，`delay` 后重新可见；返回是否放回
    async fn release(
        &self,
        job_id: &str,
        fence: Option<&Reservation>,
        delay: Duration,
        error: Option<String>,
    ) -> ClusterResult<bool>;
    /// 标记为终态失败，返回是否由本次调用标记
    ///
    /// `fence` 为 `None` 时任何未结束的作业都会被标记。
    async fn fail(&self, job_id: &str, fence: Option<&Reservation>, error: &str)
        -> ClusterResult<bool>;
    /// 预留超时的作业重新入队，尝试次数耗尽的标记为失败
    async fn requeue_expired(&self, now: DateTime<Utc>) -> ClusterResult<ReapOutcome>;
    async fn get(&self, job_id: &str) -> ClusterResult<Option<Job>>;
    async fn counts(&self, queue: &str) -> ClusterResult<QueueCounts>;
    async fn queues(&self) -> ClusterResult<Vec<String>>;
    /// 删除队列中所有作业，返回删除数量
    async fn purge(&self, queue: &str) -> ClusterResult<u64>;
    /// 删除在 `before` 之前结束的作业
    async fn prune_finished(&self, before: DateTime<Utc>) -> ClusterResult<u64>;

    /// 是否为集群共享存储
    fn is_shared(&self) -> bool {
        false
    }
}
