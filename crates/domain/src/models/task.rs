//! 定时任务定义
//!
//! 任务由外部代码通过 [`Task::new`] 创建，再用链式方法设置超时、重试和标签：
//!
//! ```rust
//! use std::time::Duration;
//! use cluster_domain::{Task, TaskContext};
//!
//! let task = Task::new("report", "每5分钟生成报表", "0 */5 * * * *", |ctx: TaskContext| async move {
//!     println!("运行任务 {} (第{}次尝试)", ctx.task_id, ctx.attempt);
//!     Ok(())
//! })
//! .with_timeout(Duration::from_secs(30))
//! .with_max_retries(2)
//! .with_tag("team", "billing");
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cluster_core::ClusterResult;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::serde_helpers::duration_ms;

/// 单次任务执行的上下文
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    /// 本次执行是第几次尝试，从1开始
    pub attempt: u32,
    /// 触发本次执行的计划时间
    pub scheduled_at: DateTime<Utc>,
    pub node_id: String,
    /// 超时或停机时被取消
    pub cancel: CancellationToken,
}

/// 定时任务处理函数
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> ClusterResult<()>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = ClusterResult<()>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> ClusterResult<()> {
        (self)(ctx).await
    }
}

/// 由调度循环维护的运行时字段
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRuntime {
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub fail_count: u64,
}

#[derive(Clone)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub cron_expression: String,
    pub handler: Arc<dyn TaskHandler>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub tags: HashMap<String, String>,
    pub enabled: bool,
    pub runtime: TaskRuntime,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("cron_expression", &self.cron_expression)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("enabled", &self.enabled)
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

impl Task {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        cron_expression: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ClusterResult<()>> + Send + 'static,
    {
        Self::with_handler(name, description, cron_expression, Arc::new(handler))
    }

    /// 使用实现了 [`TaskHandler`] 的类型创建任务
    pub fn with_handler(
        name: impl Into<String>,
        description: impl Into<String>,
        cron_expression: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        Self {
            id: name.into(),
            description: description.into(),
            cron_expression: cron_expression.into(),
            handler,
            timeout: Duration::from_secs(60),
            max_retries: 0,
            retry_delay: Duration::from_secs(1),
            tags: HashMap::new(),
            enabled: true,
            runtime: TaskRuntime::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// 一次计划执行最多尝试的次数
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.runtime.next_run.is_some_and(|next| next <= now)
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id.clone(),
            description: self.description.clone(),
            cron_expression: self.cron_expression.clone(),
            timeout: self.timeout,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            tags: self.tags.clone(),
            enabled: self.enabled,
            runtime: self.runtime.clone(),
        }
    }
}

/// 不含处理函数的任务快照，用于查询和监控
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub description: String,
    pub cron_expression: String,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    pub tags: HashMap<String, String>,
    pub enabled: bool,
    #[serde(flatten)]
    pub runtime: TaskRuntime,
}
