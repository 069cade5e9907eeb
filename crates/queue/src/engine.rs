use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cluster_coordinator::Coordinator;
use cluster_core::{ClusterConfig, ClusterError, ClusterResult, QueueConfig};
use cluster_domain::{Job, JobContext, JobHandler, JobStore, QueueCounts, QueueStats, ReapOutcome};
use cluster_infrastructure::{ClusterFactory, InMemoryJobStore};
use cluster_worker::{WorkerPool, WorkerPoolConfig};
use metrics::counter;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::job_source::{
    reserve_or_wait, JobCompletedHook, JobFailedHook, JobHooks, QueueCounters, QueueJobSource,
};

/// 作业队列引擎
///
/// 每个注册了处理函数的队列拥有独立的工作池；也可以不注册处理函数，
/// 直接用 [`QueueEngine::pop`] / [`QueueEngine::delete`] 手动消费。
pub struct QueueEngine {
    config: QueueConfig,
    coordinator: Arc<Coordinator>,
    store: Arc<dyn JobStore>,
    notify: Arc<Notify>,
    pools: RwLock<BTreeMap<String, Arc<WorkerPool<QueueJobSource>>>>,
    hooks: Arc<JobHooks>,
    counters: Arc<QueueCounters>,
    running: RwLock<bool>,
    cancel: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl QueueEngine {
    pub fn new(coordinator: Arc<Coordinator>, config: QueueConfig, store: Arc<dyn JobStore>) -> Self {
        Self {
            config,
            coordinator,
            store,
            notify: Arc::new(Notify::new()),
            pools: RwLock::new(BTreeMap::new()),
            hooks: Arc::new(JobHooks::default()),
            counters: Arc::new(QueueCounters::default()),
            running: RwLock::new(false),
            cancel: CancellationToken::new(),
            reaper: Mutex::new(None),
        }
    }

    /// 使用进程内存储
    pub fn local(coordinator: Arc<Coordinator>, config: QueueConfig) -> Self {
        Self::new(coordinator, config, Arc::new(InMemoryJobStore::new()))
    }

    /// 按集群配置选择作业存储
    pub async fn connect(
        coordinator: Arc<Coordinator>,
        config: QueueConfig,
        cluster_config: &ClusterConfig,
    ) -> Self {
        let distributed = coordinator.config().enable_job_distribution;
        let store =
            ClusterFactory::create_job_store(cluster_config, coordinator.cluster(), distributed)
                .await;
        Self::new(coordinator, config, store)
    }

    pub fn is_distributed(&self) -> bool {
        self.store.is_shared()
    }

    /// 使用配置中的默认超时和尝试次数创建作业
    pub fn job(&self, payload: impl Into<Vec<u8>>, queue: impl Into<String>) -> Job {
        Job::new(payload, queue)
            .with_timeout(self.config.default_timeout())
            .with_max_attempts(self.config.default_max_attempts)
    }

    /// 为队列注册处理函数，引擎已启动时立即启动该队列的工作池
    pub async fn register_handler<F, Fut>(&self, queue: &str, handler: F) -> ClusterResult<()>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ClusterResult<()>> + Send + 'static,
    {
        self.register_job_handler(queue, Arc::new(handler)).await
    }

    /// 使用实现了 [`JobHandler`] 的类型注册处理函数
    pub async fn register_job_handler(
        &self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
    ) -> ClusterResult<()> {
        let running = self.running.read().await;
        let mut pools = self.pools.write().await;
        if pools.contains_key(queue) {
            return Err(ClusterError::config_error(format!(
                "队列 {queue} 已注册处理函数"
            )));
        }

        let distributed = self.coordinator.config();
        let source = Arc::new(QueueJobSource::new(
            queue,
            distributed.node_id.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.notify),
            self.config.poll_interval(),
            handler,
            self.config.retry.clone(),
            Arc::clone(&self.hooks),
            Arc::clone(&self.counters),
        ));
        let pool = Arc::new(WorkerPool::new(
            WorkerPoolConfig::new(format!("queue:{queue}"), distributed.worker_count)
                .with_max_concurrency(distributed.max_concurrency)
                .with_shutdown_timeout(distributed.shutdown_timeout),
            source,
        ));

        if *running {
            pool.start().await?;
        }
        pools.insert(queue.to_string(), pool);
        info!(queue = %queue, "注册队列处理函数");
        Ok(())
    }

    pub fn on_completed<F>(&self, hook: F)
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        let hook: JobCompletedHook = Arc::new(hook);
        self.hooks.add_completed(hook);
    }

    pub fn on_failed<F>(&self, hook: F)
    where
        F: Fn(&Job, &ClusterError) + Send + Sync + 'static,
    {
        let hook: JobFailedHook = Arc::new(hook);
        self.hooks.add_failed(hook);
    }

    /// 入队，返回作业ID
    pub async fn push(&self, job: Job) -> ClusterResult<String> {
        let job = self.store.push(job).await?;
        self.counters.pushed.fetch_add(1, Ordering::SeqCst);
        counter!("queue_jobs_pushed_total", "queue" => job.queue.clone()).increment(1);
        debug!(
            job_id = %job.id,
            queue = %job.queue,
            "作业入队, 优先级 {}, 可见时间 {}",
            job.priority,
            job.available_at
        );
        self.notify.notify_waiters();
        Ok(job.id)
    }

    /// 批量入队，对并发读者原子可见
    pub async fn push_batch(&self, jobs: Vec<Job>) -> ClusterResult<Vec<String>> {
        let jobs = self.store.push_batch(jobs).await?;
        self.counters
            .pushed
            .fetch_add(jobs.len() as u64, Ordering::SeqCst);
        for job in &jobs {
            counter!("queue_jobs_pushed_total", "queue" => job.queue.clone()).increment(1);
        }
        self.notify.notify_waiters();
        Ok(jobs.into_iter().map(|job| job.id).collect())
    }

    /// 取出一个作业并预留
    ///
    /// `timeout` 内没有可执行作业时返回 `Ok(None)`，`cancel` 触发时返回
    /// [`ClusterError::Cancelled`]。
    pub async fn pop(
        &self,
        queue: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> ClusterResult<Option<Job>> {
        let deadline = Instant::now() + timeout;
        let node_id = self.coordinator.node_id();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = remaining.min(self.config.poll_interval());
            if let Some(job) = reserve_or_wait(
                self.store.as_ref(),
                &self.notify,
                queue,
                node_id,
                cancel,
                wait,
            )
            .await?
            {
                return Ok(Some(job));
            }
            if remaining.is_zero() {
                return Ok(None);
            }
        }
    }

    /// 确认作业完成，重复确认无副作用
    pub async fn delete(&self, job_id: &str) -> ClusterResult<()> {
        if self.store.complete(job_id, None).await? {
            self.counters.processed.fetch_add(1, Ordering::SeqCst);
            debug!(job_id = %job_id, "作业已确认");
        } else {
            debug!(job_id = %job_id, "作业已确认过或不处于预留状态");
        }
        Ok(())
    }

    /// 手动放回预留中的作业
    pub async fn release(&self, job_id: &str, delay: Duration) -> ClusterResult<()> {
        if self.store.release(job_id, None, delay, None).await? {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> ClusterResult<Job> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| ClusterError::job_not_found(job_id))
    }

    /// 尚未结束的作业数量
    pub async fn size(&self, queue: &str) -> ClusterResult<u64> {
        Ok(self.store.counts(queue).await?.size())
    }

    pub async fn queue_stats(&self, queue: &str) -> ClusterResult<QueueCounts> {
        self.store.counts(queue).await
    }

    /// 清空队列，返回删除的作业数量
    pub async fn purge(&self, queue: &str) -> ClusterResult<u64> {
        let removed = self.store.purge(queue).await?;
        info!(queue = %queue, "清空队列, 删除 {} 个作业", removed);
        Ok(removed)
    }

    /// 回收预留超时的作业
    pub async fn requeue_expired(&self) -> ClusterResult<ReapOutcome> {
        let outcome = self.store.requeue_expired(Utc::now()).await?;

        if !outcome.requeued.is_empty() {
            warn!("{} 个作业预留超时，重新入队", outcome.requeued.len());
            self.counters
                .requeued
                .fetch_add(outcome.requeued.len() as u64, Ordering::SeqCst);
            counter!("queue_jobs_requeued_total").increment(outcome.requeued.len() as u64);
            self.notify.notify_waiters();
        }
        for job in &outcome.failed {
            self.counters.failed.fetch_add(1, Ordering::SeqCst);
            counter!("queue_jobs_failed_total", "queue" => job.queue.clone()).increment(1);
            let error = ClusterError::JobExhausted {
                job_id: job.id.clone(),
                attempts: job.attempts,
            };
            error!(job_id = %job.id, "{}", error);
            self.hooks.failed(job, &error);
        }
        Ok(outcome)
    }

    /// 一轮回收：超时作业重新入队，过期的终态作业被清理
    async fn reap(&self) -> ClusterResult<()> {
        // 共享存储只由Leader回收
        if !self.coordinator.should_dispatch(self.store.is_shared()).await {
            return Ok(());
        }
        self.requeue_expired().await?;

        let retention = chrono::Duration::from_std(self.config.finished_retention())
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let pruned = self.store.prune_finished(Utc::now() - retention).await?;
        if pruned > 0 {
            debug!("清理 {} 个已结束的作业", pruned);
        }
        Ok(())
    }

    pub async fn start(self: &Arc<Self>) -> ClusterResult<()> {
        self.config.validate()?;
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(ClusterError::internal("队列引擎已启动"));
            }
            for pool in self.pools.read().await.values() {
                pool.start().await?;
            }
            *running = true;
        }

        let engine = Arc::clone(self);
        let cancel = self.cancel.clone();
        let reaper_interval = self.config.reaper_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reaper_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = engine.reap().await {
                            warn!("回收超时作业失败: {}", e);
                        }
                    }
                }
            }
            debug!("作业回收循环已退出");
        });
        *self.reaper.lock().await = Some(handle);

        info!(
            "队列引擎已启动: 节点 {}, 共享存储 {}",
            self.coordinator.node_id(),
            self.store.is_shared()
        );
        Ok(())
    }

    /// 停止回收循环并排空所有工作池
    pub async fn stop(&self) -> ClusterResult<()> {
        self.cancel.cancel();
        if let Some(handle) = self.reaper.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("作业回收循环异常退出: {}", e);
            }
        }

        let pools: Vec<Arc<WorkerPool<QueueJobSource>>> =
            self.pools.read().await.values().cloned().collect();
        for pool in pools {
            if let Err(e) = pool.stop().await {
                error!("停止工作池 {} 失败: {}", pool.name(), e);
            }
        }
        *self.running.write().await = false;
        info!("队列引擎已停止");
        Ok(())
    }

    pub async fn stats(&self) -> ClusterResult<QueueStats> {
        let mut names: Vec<String> = self.store.queues().await?;
        let pools: HashMap<String, Arc<WorkerPool<QueueJobSource>>> = self
            .pools
            .read()
            .await
            .iter()
            .map(|(name, pool)| (name.clone(), Arc::clone(pool)))
            .collect();
        names.extend(pools.keys().cloned());
        names.sort();
        names.dedup();

        let mut queues = BTreeMap::new();
        for name in names {
            let counts = self.store.counts(&name).await?;
            queues.insert(name, counts);
        }
        let mut pool_stats = BTreeMap::new();
        for (name, pool) in pools {
            pool_stats.insert(name, pool.stats().await);
        }

        Ok(QueueStats {
            distributed: self.store.is_shared(),
            total_pushed: self.counters.pushed.load(Ordering::SeqCst),
            total_processed: self.counters.processed.load(Ordering::SeqCst),
            total_failed: self.counters.failed.load(Ordering::SeqCst),
            total_requeued: self.counters.requeued.load(Ordering::SeqCst),
            queues,
            pools: pool_stats,
        })
    }
}
