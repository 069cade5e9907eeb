use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cluster_core::{ClusterError, ClusterResult, RetryPolicy};
use cluster_domain::{Job, JobContext, JobHandler, JobStore};
use cluster_worker::WorkSource;
use futures::future::BoxFuture;
use futures::FutureExt;
use metrics::counter;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type JobCompletedHook = Arc<dyn Fn(&Job) + Send + Sync>;
pub type JobFailedHook = Arc<dyn Fn(&Job, &ClusterError) + Send + Sync>;

/// 作业完成/失败回调
#[derive(Default)]
pub(crate) struct JobHooks {
    completed: RwLock<Vec<JobCompletedHook>>,
    failed: RwLock<Vec<JobFailedHook>>,
}

impl JobHooks {
    pub(crate) fn add_completed(&self, hook: JobCompletedHook) {
        if let Ok(mut hooks) = self.completed.write() {
            hooks.push(hook);
        }
    }

    pub(crate) fn add_failed(&self, hook: JobFailedHook) {
        if let Ok(mut hooks) = self.failed.write() {
            hooks.push(hook);
        }
    }

    pub(crate) fn completed(&self, job: &Job) {
        let hooks = self.completed.read().map(|h| h.clone()).unwrap_or_default();
        for hook in hooks {
            hook(job);
        }
    }

    pub(crate) fn failed(&self, job: &Job, error: &ClusterError) {
        let hooks = self.failed.read().map(|h| h.clone()).unwrap_or_default();
        for hook in hooks {
            hook(job, error);
        }
    }
}

#[derive(Default)]
pub(crate) struct QueueCounters {
    pub pushed: AtomicU64,
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub requeued: AtomicU64,
}

/// 尝试预留一个作业；没有可执行作业时最多等待 `max_wait`
///
/// 等待期间本节点的入队会立即唤醒；共享存储上其他节点的入队和延迟作业到期靠 `max_wait` 轮询发现。
pub(crate) async fn reserve_or_wait(
    store: &dyn JobStore,
    notify: &Notify,
    queue: &str,
    worker: &str,
    cancel: &CancellationToken,
    max_wait: Duration,
) -> ClusterResult<Option<Job>> {
    let notified = notify.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();

    if cancel.is_cancelled() {
        return Err(ClusterError::Cancelled);
    }
    if let Some(job) = store.reserve(queue, worker, Utc::now()).await? {
        return Ok(Some(job));
    }
    if max_wait.is_zero() {
        return Ok(None);
    }

    tokio::select! {
        _ = cancel.cancelled() => Err(ClusterError::Cancelled),
        _ = &mut notified => Ok(None),
        _ = tokio::time::sleep(max_wait) => Ok(None),
    }
}

/// 单个队列的工作来源，供该队列的工作池消费
pub struct QueueJobSource {
    queue: String,
    node_id: String,
    store: Arc<dyn JobStore>,
    notify: Arc<Notify>,
    poll_interval: Duration,
    handler: Arc<dyn JobHandler>,
    retry_policy: RetryPolicy,
    hooks: Arc<JobHooks>,
    counters: Arc<QueueCounters>,
}

impl QueueJobSource {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        queue: impl Into<String>,
        node_id: impl Into<String>,
        store: Arc<dyn JobStore>,
        notify: Arc<Notify>,
        poll_interval: Duration,
        handler: Arc<dyn JobHandler>,
        retry_policy: RetryPolicy,
        hooks: Arc<JobHooks>,
        counters: Arc<QueueCounters>,
    ) -> Self {
        Self {
            queue: queue.into(),
            node_id: node_id.into(),
            store,
            notify,
            poll_interval,
            handler,
            retry_policy,
            hooks,
            counters,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

#[async_trait]
impl WorkSource for QueueJobSource {
    type Unit = Job;

    async fn fetch(&self, cancel: &CancellationToken) -> ClusterResult<Option<Job>> {
        reserve_or_wait(
            self.store.as_ref(),
            &self.notify,
            &self.queue,
            &self.node_id,
            cancel,
            self.poll_interval,
        )
        .await
    }

    fn execute(&self, job: &Job, cancel: CancellationToken) -> BoxFuture<'static, ClusterResult<()>> {
        let handler = Arc::clone(&self.handler);
        let ctx = JobContext {
            job: job.clone(),
            node_id: self.node_id.clone(),
            cancel,
        };
        debug!(job_id = %job.id, queue = %job.queue, attempt = job.attempts, "处理作业");
        async move { handler.handle(ctx).await }.boxed()
    }

    async fn complete(&self, mut job: Job) -> ClusterResult<()> {
        if !self.store.complete(&job.id, job.reservation().as_ref()).await? {
            // 预留已被回收，作业会由新的预留者再执行一次
            debug!(job_id = %job.id, attempt = job.attempts, "预留已失效，忽略完成确认");
            return Ok(());
        }
        self.counters.processed.fetch_add(1, Ordering::SeqCst);
        counter!("queue_jobs_processed_total", "queue" => self.queue.clone()).increment(1);
        job.mark_completed(Utc::now());
        self.hooks.completed(&job);
        Ok(())
    }

    fn retry_delay(&self, _job: &Job, retry_count: u32) -> Duration {
        self.retry_policy.delay_for(retry_count)
    }

    async fn retry(&self, job: Job, delay: Duration, cause: &ClusterError) -> ClusterResult<()> {
        let released = self
            .store
            .release(&job.id, job.reservation().as_ref(), delay, Some(cause.to_string()))
            .await?;
        if !released {
            debug!(job_id = %job.id, attempt = job.attempts, "预留已失效，不再重试");
            return Ok(());
        }
        self.counters.requeued.fetch_add(1, Ordering::SeqCst);
        counter!("queue_jobs_retried_total", "queue" => self.queue.clone()).increment(1);
        if delay.is_zero() {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn fail(&self, mut job: Job, error: ClusterError, cause: ClusterError) -> ClusterResult<()> {
        let message = cause.to_string();
        if !self
            .store
            .fail(&job.id, job.reservation().as_ref(), &message)
            .await?
        {
            debug!(job_id = %job.id, attempt = job.attempts, "预留已失效，忽略失败标记");
            return Ok(());
        }
        self.counters.failed.fetch_add(1, Ordering::SeqCst);
        counter!("queue_jobs_failed_total", "queue" => self.queue.clone()).increment(1);
        job.mark_failed(message, Utc::now());
        self.hooks.failed(&job, &error);
        Ok(())
    }

    async fn abandon(&self, job: Job) -> ClusterResult<()> {
        info!(job_id = %job.id, "停机中断，作业放回队列");
        match self
            .store
            .release(
                &job.id,
                job.reservation().as_ref(),
                Duration::ZERO,
                Some("节点停机".to_string()),
            )
            .await
        {
            Ok(released) => {
                if released {
                    self.notify.notify_waiters();
                }
                Ok(())
            }
            Err(e) => {
                warn!(job_id = %job.id, "放回作业失败，将由超时回收: {}", e);
                Err(e)
            }
        }
    }
}
