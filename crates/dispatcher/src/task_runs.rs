use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cluster_core::{ClusterError, ClusterResult, RetryPolicy};
use cluster_domain::{Task, TaskContext, TaskStore, WorkUnit};
use cluster_worker::WorkSource;
use futures::future::BoxFuture;
use futures::FutureExt;
use metrics::counter;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 一次计划执行（含重试）
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub task: Task,
    /// 当前是第几次尝试，从1开始
    pub attempt: u32,
    pub scheduled_at: DateTime<Utc>,
    /// 通过 `trigger_now` 手动触发
    pub manual: bool,
}

impl TaskRun {
    pub fn new(task: Task, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            task,
            attempt: 1,
            scheduled_at,
            manual: false,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task.id
    }
}

impl WorkUnit for TaskRun {
    fn id(&self) -> &str {
        &self.task.id
    }

    fn attempts(&self) -> u32 {
        self.attempt
    }

    fn max_attempts(&self) -> u32 {
        self.task.max_attempts()
    }

    fn timeout(&self) -> Duration {
        self.task.timeout
    }
}

pub type TaskCompletedHook = Arc<dyn Fn(&TaskRun) + Send + Sync>;
pub type TaskFailedHook = Arc<dyn Fn(&TaskRun, &ClusterError) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    completed: Vec<TaskCompletedHook>,
    failed: Vec<TaskFailedHook>,
}

/// 本节点待执行的任务队列，供调度引擎的工作池消费
pub struct TaskRunSource {
    node_id: String,
    store: Arc<dyn TaskStore>,
    retry_policy: RetryPolicy,
    tx: mpsc::UnboundedSender<TaskRun>,
    rx: Mutex<mpsc::UnboundedReceiver<TaskRun>>,
    hooks: RwLock<Hooks>,
    /// 停机后不再安排延迟重试
    closed: CancellationToken,
    total_runs: AtomicU64,
    total_failures: AtomicU64,
}

impl TaskRunSource {
    pub fn new(node_id: impl Into<String>, store: Arc<dyn TaskStore>, retry_policy: RetryPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            node_id: node_id.into(),
            store,
            retry_policy,
            tx,
            rx: Mutex::new(rx),
            hooks: RwLock::new(Hooks::default()),
            closed: CancellationToken::new(),
            total_runs: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    pub fn submit(&self, run: TaskRun) -> ClusterResult<()> {
        self.tx
            .send(run)
            .map_err(|_| ClusterError::internal("任务执行队列已关闭"))
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn on_completed(&self, hook: TaskCompletedHook) {
        if let Ok(mut hooks) = self.hooks.write() {
            hooks.completed.push(hook);
        }
    }

    pub fn on_failed(&self, hook: TaskFailedHook) {
        if let Ok(mut hooks) = self.hooks.write() {
            hooks.failed.push(hook);
        }
    }

    /// 已结束的计划执行次数
    pub fn total_runs(&self) -> u64 {
        self.total_runs.load(Ordering::SeqCst)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkSource for TaskRunSource {
    type Unit = TaskRun;

    async fn fetch(&self, cancel: &CancellationToken) -> ClusterResult<Option<TaskRun>> {
        let mut rx = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            run = rx.recv() => Ok(run),
        }
    }

    fn execute(
        &self,
        run: &TaskRun,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ClusterResult<()>> {
        let handler = Arc::clone(&run.task.handler);
        let ctx = TaskContext {
            task_id: run.task.id.clone(),
            attempt: run.attempt,
            scheduled_at: run.scheduled_at,
            node_id: self.node_id.clone(),
            cancel,
        };
        info!(
            task_id = %ctx.task_id,
            attempt = ctx.attempt,
            "执行任务"
        );
        async move { handler.run(ctx).await }.boxed()
    }

    async fn complete(&self, run: TaskRun) -> ClusterResult<()> {
        self.total_runs.fetch_add(1, Ordering::SeqCst);
        counter!("scheduler_task_runs_total", "outcome" => "success").increment(1);
        info!(task_id = %run.task.id, attempt = run.attempt, "任务执行成功");

        let result = self.store.record_outcome(&run.task.id, true).await;
        let hooks = self
            .hooks
            .read()
            .map(|h| h.completed.clone())
            .unwrap_or_default();
        for hook in hooks {
            hook(&run);
        }
        result
    }

    fn retry_delay(&self, run: &TaskRun, retry_count: u32) -> Duration {
        self.retry_policy
            .with_base_delay(run.task.retry_delay)
            .delay_for(retry_count)
    }

    async fn retry(&self, mut run: TaskRun, delay: Duration, cause: &ClusterError) -> ClusterResult<()> {
        debug!(task_id = %run.task.id, "任务第 {} 次尝试失败: {}", run.attempt, cause);
        run.attempt += 1;
        let tx = self.tx.clone();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => {
                    warn!("停机，放弃任务 {} 的重试", run.task.id);
                }
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(run);
                }
            }
        });
        Ok(())
    }

    async fn fail(&self, run: TaskRun, error: ClusterError, cause: ClusterError) -> ClusterResult<()> {
        self.total_runs.fetch_add(1, Ordering::SeqCst);
        self.total_failures.fetch_add(1, Ordering::SeqCst);
        counter!("scheduler_task_runs_total", "outcome" => "failed").increment(1);
        error!(task_id = %run.task.id, "任务执行失败: {} ({})", error, cause);

        let result = self.store.record_outcome(&run.task.id, false).await;
        let hooks = self
            .hooks
            .read()
            .map(|h| h.failed.clone())
            .unwrap_or_default();
        for hook in hooks {
            hook(&run, &error);
        }
        result
    }
}
