use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cluster_coordinator::Coordinator;
use cluster_core::{ClusterError, ClusterResult, SchedulerConfig};
use cluster_domain::{SchedulerStats, Task, TaskInfo, TaskStore};
use cluster_infrastructure::InMemoryTaskStore;
use cluster_worker::{WorkerPool, WorkerPoolConfig};
use metrics::counter;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cron_utils::CronScheduler;
use crate::task_runs::{TaskCompletedHook, TaskFailedHook, TaskRun, TaskRunSource};

/// 定时任务调度引擎
///
/// 每个节点注册同一组任务并各自推进 `next_run`；启用任务分发时只有Leader
/// （或没有已知Leader时的本节点）真正派发执行。错过的触发点不补跑。
pub struct SchedulerEngine {
    config: SchedulerConfig,
    coordinator: Arc<Coordinator>,
    store: Arc<dyn TaskStore>,
    schedules: RwLock<HashMap<String, CronScheduler>>,
    source: Arc<TaskRunSource>,
    pool: WorkerPool<TaskRunSource>,
    skipped_dispatches: AtomicU64,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerEngine {
    pub fn new(coordinator: Arc<Coordinator>, config: SchedulerConfig) -> Self {
        Self::with_store(coordinator, config, Arc::new(InMemoryTaskStore::new()))
    }

    pub fn with_store(
        coordinator: Arc<Coordinator>,
        config: SchedulerConfig,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        let distributed = coordinator.config();
        let source = Arc::new(TaskRunSource::new(
            distributed.node_id.clone(),
            Arc::clone(&store),
            config.retry_policy(),
        ));
        let pool = WorkerPool::new(
            WorkerPoolConfig::new("scheduler", distributed.worker_count)
                .with_max_concurrency(distributed.max_concurrency)
                .with_shutdown_timeout(distributed.shutdown_timeout),
            Arc::clone(&source),
        );

        Self {
            config,
            coordinator,
            store,
            schedules: RwLock::new(HashMap::new()),
            source,
            pool,
            skipped_dispatches: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// 注册任务，同名任务被替换
    pub async fn register(&self, mut task: Task) -> ClusterResult<()> {
        let cron = CronScheduler::new(&task.cron_expression)?;
        task.cron_expression = cron.expression().to_string();
        task.runtime.next_run = if task.enabled {
            cron.next_execution_time(Utc::now())
        } else {
            None
        };

        info!(
            task_id = %task.id,
            "注册任务: {} ({}), 下次执行 {:?}",
            task.cron_expression,
            cron.get_frequency_description(),
            task.runtime.next_run
        );
        self.schedules.write().await.insert(task.id.clone(), cron);
        self.store.upsert(task).await
    }

    pub async fn unregister(&self, task_id: &str) -> ClusterResult<()> {
        self.schedules.write().await.remove(task_id);
        match self.store.remove(task_id).await? {
            Some(_) => {
                info!(task_id = %task_id, "注销任务");
                Ok(())
            }
            None => Err(ClusterError::task_not_found(task_id)),
        }
    }

    pub async fn enable(&self, task_id: &str) -> ClusterResult<()> {
        let next_run = {
            let schedules = self.schedules.read().await;
            let cron = schedules
                .get(task_id)
                .ok_or_else(|| ClusterError::task_not_found(task_id))?;
            cron.next_execution_time(Utc::now())
        };
        self.store.set_enabled(task_id, true, next_run).await?;
        info!(task_id = %task_id, "启用任务, 下次执行 {:?}", next_run);
        Ok(())
    }

    pub async fn disable(&self, task_id: &str) -> ClusterResult<()> {
        self.store.set_enabled(task_id, false, None).await?;
        info!(task_id = %task_id, "禁用任务");
        Ok(())
    }

    /// 立即在本节点执行一次，不影响计划时间
    pub async fn trigger_now(&self, task_id: &str) -> ClusterResult<()> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| ClusterError::task_not_found(task_id))?;
        let mut run = TaskRun::new(task, Utc::now());
        run.manual = true;
        info!(task_id = %task_id, "手动触发任务");
        self.source.submit(run)
    }

    pub async fn next_run_time(&self, task_id: &str) -> ClusterResult<Option<DateTime<Utc>>> {
        self.store
            .get(task_id)
            .await?
            .map(|t| t.runtime.next_run)
            .ok_or_else(|| ClusterError::task_not_found(task_id))
    }

    pub async fn tasks(&self) -> ClusterResult<Vec<TaskInfo>> {
        Ok(self.store.list().await?.iter().map(Task::info).collect())
    }

    pub fn on_completed<F>(&self, hook: F)
    where
        F: Fn(&TaskRun) + Send + Sync + 'static,
    {
        let hook: TaskCompletedHook = Arc::new(hook);
        self.source.on_completed(hook);
    }

    pub fn on_failed<F>(&self, hook: F)
    where
        F: Fn(&TaskRun, &ClusterError) + Send + Sync + 'static,
    {
        let hook: TaskFailedHook = Arc::new(hook);
        self.source.on_failed(hook);
    }

    /// 扫描到期任务并派发，返回本节点派发的数量
    pub async fn tick(&self) -> ClusterResult<usize> {
        let now = Utc::now();
        let due = self.store.due(now).await?;
        if due.is_empty() {
            return Ok(0);
        }

        let dispatch_here = self
            .coordinator
            .should_dispatch(self.coordinator.config().enable_task_distribution)
            .await;
        let mut dispatched = 0;

        for task in due {
            let scheduled_at = task.runtime.next_run.unwrap_or(now);
            let next_run = {
                let schedules = self.schedules.read().await;
                match schedules.get(&task.id) {
                    Some(cron) => {
                        let missed = cron.missed_between(scheduled_at, now);
                        if missed > 0 {
                            warn!(task_id = %task.id, "跳过 {} 次错过的触发", missed);
                        }
                        cron.next_execution_time(now)
                    }
                    None => None,
                }
            };
            // 扫描期间被注销
            if !self.store.advance(&task.id, now, next_run).await? {
                continue;
            }

            if dispatch_here {
                debug!(task_id = %task.id, "派发任务, 计划时间 {}", scheduled_at);
                counter!("scheduler_dispatches_total").increment(1);
                self.source.submit(TaskRun::new(task, scheduled_at))?;
                dispatched += 1;
            } else {
                debug!(task_id = %task.id, "非Leader节点，跳过派发");
                self.skipped_dispatches.fetch_add(1, Ordering::SeqCst);
                counter!("scheduler_skipped_dispatches_total").increment(1);
            }
        }
        Ok(dispatched)
    }

    pub async fn start(self: &Arc<Self>) -> ClusterResult<()> {
        self.config.validate()?;
        self.pool.start().await?;

        let engine = Arc::clone(self);
        let cancel = self.cancel.clone();
        let tick_interval = self.config.tick_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = engine.tick().await {
                            error!("调度扫描失败: {}", e);
                        }
                    }
                }
            }
            debug!("调度循环已退出");
        });
        *self.handle.lock().await = Some(handle);

        info!(
            "调度引擎已启动: 节点 {}, 扫描间隔 {:?}",
            self.coordinator.node_id(),
            tick_interval
        );
        Ok(())
    }

    /// 停止派发并排空工作池
    pub async fn stop(&self) -> ClusterResult<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("调度循环异常退出: {}", e);
            }
        }
        self.source.close();
        self.pool.stop().await?;
        info!("调度引擎已停止");
        Ok(())
    }

    pub async fn stats(&self) -> ClusterResult<SchedulerStats> {
        let tasks = self.store.list().await?;
        Ok(SchedulerStats {
            total_tasks: tasks.len(),
            enabled_tasks: tasks.iter().filter(|t| t.enabled).count(),
            total_runs: self.source.total_runs(),
            total_failures: self.source.total_failures(),
            skipped_dispatches: self.skipped_dispatches.load(Ordering::SeqCst),
            pool: self.pool.stats().await,
        })
    }
}
