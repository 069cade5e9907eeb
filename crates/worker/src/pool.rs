use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cluster_core::{ClusterError, ClusterResult};
use cluster_domain::{PoolStats, PoolStatus, WorkUnit};
use metrics::{counter, gauge};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::execution::{execute_guarded, ExecutionOutcome};
use crate::source::WorkSource;

/// 工作池配置
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// 用于日志和指标标签
    pub name: String,
    pub worker_count: usize,
    /// 同时执行的处理函数上限，0 表示只受槽位数限制
    pub max_concurrency: usize,
    /// 停机时等待在途执行的最长时间
    pub shutdown_timeout: Duration,
    /// 取工作出错后的等待时间
    pub error_backoff: Duration,
}

impl WorkerPoolConfig {
    pub fn new(name: impl Into<String>, worker_count: usize) -> Self {
        Self {
            name: name.into(),
            worker_count,
            max_concurrency: 0,
            shutdown_timeout: Duration::from_secs(30),
            error_backoff: Duration::from_millis(500),
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

struct PoolInner<S: WorkSource> {
    config: WorkerPoolConfig,
    source: Arc<S>,
    counters: Counters,
    status: RwLock<PoolStatus>,
    semaphore: Option<Arc<Semaphore>>,
    /// 停止取新工作
    draining: CancellationToken,
    /// 强制中断在途执行
    shutdown: CancellationToken,
}

/// 固定槽位的工作池
///
/// 每个槽位是一个独立任务，循环执行：取工作 → 带超时执行 → 成功确认或退避重试。
/// 处理函数的错误和 panic 只影响当前工作单元。
pub struct WorkerPool<S: WorkSource> {
    inner: Arc<PoolInner<S>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: WorkSource> WorkerPool<S> {
    pub fn new(config: WorkerPoolConfig, source: Arc<S>) -> Self {
        let semaphore = (config.max_concurrency > 0)
            .then(|| Arc::new(Semaphore::new(config.max_concurrency)));
        Self {
            inner: Arc::new(PoolInner {
                config,
                source,
                counters: Counters::default(),
                status: RwLock::new(PoolStatus::Starting),
                semaphore,
                draining: CancellationToken::new(),
                shutdown: CancellationToken::new(),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn source(&self) -> &Arc<S> {
        &self.inner.source
    }

    pub async fn start(&self) -> ClusterResult<()> {
        {
            let mut status = self.inner.status.write().await;
            if *status != PoolStatus::Starting {
                return Err(ClusterError::internal(format!(
                    "工作池 {} 已启动过",
                    self.inner.config.name
                )));
            }
            *status = PoolStatus::Running;
        }

        let worker_count = self.inner.config.worker_count.max(1);
        let mut handles = self.handles.lock().await;
        for slot in 0..worker_count {
            let inner = Arc::clone(&self.inner);
            handles.push(tokio::spawn(async move {
                inner.run_slot(slot).await;
            }));
        }

        info!(
            "工作池 {} 已启动: {} 个槽位, 并发上限 {}",
            self.inner.config.name, worker_count, self.inner.config.max_concurrency
        );
        Ok(())
    }

    /// 停止取新工作，等待在途执行结束；超过停机期限后强制中断
    pub async fn stop(&self) -> ClusterResult<()> {
        {
            let mut status = self.inner.status.write().await;
            if *status == PoolStatus::Stopped {
                return Ok(());
            }
            *status = PoolStatus::Draining;
        }
        info!("工作池 {} 开始排空", self.inner.config.name);
        self.inner.draining.cancel();

        let mut handles = std::mem::take(&mut *self.handles.lock().await);
        let deadline = self.inner.config.shutdown_timeout;
        let drained = tokio::time::timeout(deadline, join_all(&mut handles)).await;

        if drained.is_err() {
            warn!(
                "工作池 {} 在 {:?} 内未排空，中断在途执行",
                self.inner.config.name, deadline
            );
            self.inner.shutdown.cancel();
            if tokio::time::timeout(Duration::from_secs(5), join_all(&mut handles))
                .await
                .is_err()
            {
                error!("工作池 {} 的槽位未能退出，强制终止", self.inner.config.name);
                for handle in &handles {
                    handle.abort();
                }
            }
        }

        *self.inner.status.write().await = PoolStatus::Stopped;
        gauge!("worker_pool_active", "pool" => self.inner.config.name.clone()).set(0.0);
        info!("工作池 {} 已停止", self.inner.config.name);
        Ok(())
    }

    pub async fn status(&self) -> PoolStatus {
        *self.inner.status.read().await
    }

    pub async fn stats(&self) -> PoolStats {
        let counters = &self.inner.counters;
        let total_workers = self.inner.config.worker_count.max(1);
        let active_workers = counters.active.load(Ordering::SeqCst).min(total_workers);
        PoolStats {
            total_workers,
            active_workers,
            idle_workers: total_workers - active_workers,
            total_processed: counters.processed.load(Ordering::SeqCst),
            total_failed: counters.failed.load(Ordering::SeqCst),
            total_retried: counters.retried.load(Ordering::SeqCst),
            status: self.status().await,
        }
    }
}

/// 逐个等待，已结束的句柄从列表中移除
async fn join_all(handles: &mut Vec<JoinHandle<()>>) {
    while let Some(handle) = handles.last_mut() {
        if let Err(e) = handle.await {
            if e.is_panic() {
                error!("工作池槽位异常退出: {}", e);
            }
        }
        handles.pop();
    }
}

impl<S: WorkSource> PoolInner<S> {
    async fn run_slot(self: Arc<Self>, slot: usize) {
        debug!("工作池 {} 槽位 {} 开始运行", self.config.name, slot);
        loop {
            if self.draining.is_cancelled() {
                break;
            }

            let _permit = match &self.semaphore {
                Some(semaphore) => {
                    tokio::select! {
                        _ = self.draining.cancelled() => break,
                        permit = Arc::clone(semaphore).acquire_owned() => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => break,
                        },
                    }
                }
                None => None,
            };

            let fetched = tokio::select! {
                _ = self.draining.cancelled() => break,
                fetched = self.source.fetch(&self.draining) => fetched,
            };

            match fetched {
                Ok(Some(unit)) => self.process(unit).await,
                Ok(None) => {}
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    warn!("工作池 {} 获取工作失败: {}", self.config.name, e);
                    tokio::select! {
                        _ = self.draining.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }
        debug!("工作池 {} 槽位 {} 已退出", self.config.name, slot);
    }

    async fn process(&self, unit: S::Unit) {
        let pool = self.config.name.clone();
        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("worker_pool_active", "pool" => pool.clone()).set(active as f64);

        let run_cancel = self.shutdown.child_token();
        let execution = self.source.execute(&unit, run_cancel.clone());
        debug!(
            "执行 {} (第 {}/{} 次尝试)",
            unit.id(),
            unit.attempts(),
            unit.max_attempts()
        );
        let outcome = execute_guarded(execution, unit.timeout(), run_cancel, &self.shutdown).await;

        let active = self.counters.active.fetch_sub(1, Ordering::SeqCst) - 1;
        gauge!("worker_pool_active", "pool" => pool.clone()).set(active as f64);

        match outcome {
            ExecutionOutcome::Completed => {
                self.counters.processed.fetch_add(1, Ordering::SeqCst);
                counter!("worker_pool_units_total", "pool" => pool, "outcome" => "completed")
                    .increment(1);
                let id = unit.id().to_string();
                if let Err(e) = self.source.complete(unit).await {
                    error!("确认 {} 完成失败: {}", id, e);
                }
            }
            ExecutionOutcome::Failed(cause) if unit.has_attempts_left() => {
                self.counters.retried.fetch_add(1, Ordering::SeqCst);
                counter!("worker_pool_units_total", "pool" => pool, "outcome" => "retried")
                    .increment(1);
                let delay = self.source.retry_delay(&unit, unit.attempts());
                warn!(
                    "{} 第 {}/{} 次执行失败: {}，{:?} 后重试",
                    unit.id(),
                    unit.attempts(),
                    unit.max_attempts(),
                    cause,
                    delay
                );
                let id = unit.id().to_string();
                if let Err(e) = self.source.retry(unit, delay, &cause).await {
                    error!("安排 {} 重试失败: {}", id, e);
                }
            }
            ExecutionOutcome::Failed(cause) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                counter!("worker_pool_units_total", "pool" => pool, "outcome" => "failed")
                    .increment(1);
                let id = unit.id().to_string();
                let exhausted = ClusterError::JobExhausted {
                    job_id: id.clone(),
                    attempts: unit.attempts(),
                };
                error!("{}: 最后一次错误 {}", exhausted, cause);
                if let Err(e) = self.source.fail(unit, exhausted, cause).await {
                    error!("记录 {} 失败状态出错: {}", id, e);
                }
            }
            ExecutionOutcome::Abandoned => {
                counter!("worker_pool_units_total", "pool" => pool, "outcome" => "abandoned")
                    .increment(1);
                let id = unit.id().to_string();
                warn!("停机中断 {}", id);
                if let Err(e) = self.source.abandon(unit).await {
                    error!("归还 {} 失败: {}", id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::collections::VecDeque;

    #[derive(Debug, Clone)]
    struct Unit {
        id: String,
        attempts: u32,
        max_attempts: u32,
        fail_times: u32,
    }

    impl WorkUnit for Unit {
        fn id(&self) -> &str {
            &self.id
        }
        fn attempts(&self) -> u32 {
            self.attempts
        }
        fn max_attempts(&self) -> u32 {
            self.max_attempts
        }
        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
    }

    #[derive(Default)]
    struct QueueSource {
        queue: std::sync::Mutex<VecDeque<Unit>>,
        completed: std::sync::Mutex<Vec<String>>,
        failed: std::sync::Mutex<Vec<String>>,
    }

    impl QueueSource {
        fn push(&self, id: &str, max_attempts: u32, fail_times: u32) {
            self.queue.lock().unwrap().push_back(Unit {
                id: id.to_string(),
                attempts: 0,
                max_attempts,
                fail_times,
            });
        }
    }

    #[async_trait]
    impl WorkSource for QueueSource {
        type Unit = Unit;

        async fn fetch(&self, _cancel: &CancellationToken) -> ClusterResult<Option<Unit>> {
            let next = self.queue.lock().unwrap().pop_front();
            match next {
                Some(mut unit) => {
                    unit.attempts += 1;
                    Ok(Some(unit))
                }
                None => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(None)
                }
            }
        }

        fn execute(
            &self,
            unit: &Unit,
            _cancel: CancellationToken,
        ) -> BoxFuture<'static, ClusterResult<()>> {
            let fail = unit.attempts <= unit.fail_times;
            async move {
                if fail {
                    Err(ClusterError::handler("injected"))
                } else {
                    Ok(())
                }
            }
            .boxed()
        }

        async fn complete(&self, unit: Unit) -> ClusterResult<()> {
            self.completed.lock().unwrap().push(unit.id);
            Ok(())
        }

        fn retry_delay(&self, _unit: &Unit, _retry_count: u32) -> Duration {
            Duration::ZERO
        }

        async fn retry(&self, unit: Unit, _delay: Duration, _cause: &ClusterError) -> ClusterResult<()> {
            self.queue.lock().unwrap().push_back(unit);
            Ok(())
        }

        async fn fail(&self, unit: Unit, error: ClusterError, _cause: ClusterError) -> ClusterResult<()> {
            assert!(matches!(error, ClusterError::JobExhausted { .. }));
            self.failed.lock().unwrap().push(unit.id);
            Ok(())
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_retry_then_complete() {
        let source = Arc::new(QueueSource::default());
        source.push("ok", 3, 0);
        source.push("flaky", 3, 2);
        source.push("broken", 2, 5);

        let pool = WorkerPool::new(WorkerPoolConfig::new("test", 2), Arc::clone(&source));
        pool.start().await.unwrap();
        wait_until(|| {
            source.completed.lock().unwrap().len() == 2 && source.failed.lock().unwrap().len() == 1
        })
        .await;

        let stats = pool.stats().await;
        assert_eq!(stats.total_processed, 2);
        assert_eq!(stats.total_failed, 1);
        // flaky 重试2次，broken 重试1次
        assert_eq!(stats.total_retried, 3);
        assert_eq!(*source.failed.lock().unwrap(), vec!["broken".to_string()]);

        pool.stop().await.unwrap();
        assert_eq!(pool.status().await, PoolStatus::Stopped);
    }

    /// 每个单元执行固定时长，记录执行时收到的取消令牌和被归还的单元
    struct SlowSource {
        run_for: Duration,
        queue: std::sync::Mutex<VecDeque<Unit>>,
        started: std::sync::Mutex<Vec<CancellationToken>>,
        completed: std::sync::Mutex<Vec<String>>,
        abandoned: std::sync::Mutex<Vec<String>>,
    }

    impl SlowSource {
        fn new(run_for: Duration, ids: &[&str]) -> Self {
            let queue = ids
                .iter()
                .map(|id| Unit {
                    id: id.to_string(),
                    attempts: 0,
                    max_attempts: 1,
                    fail_times: 0,
                })
                .collect();
            Self {
                run_for,
                queue: std::sync::Mutex::new(queue),
                started: std::sync::Mutex::new(Vec::new()),
                completed: std::sync::Mutex::new(Vec::new()),
                abandoned: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WorkSource for SlowSource {
        type Unit = Unit;

        async fn fetch(&self, _cancel: &CancellationToken) -> ClusterResult<Option<Unit>> {
            let next = self.queue.lock().unwrap().pop_front();
            if next.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(next.map(|mut unit| {
                unit.attempts += 1;
                unit
            }))
        }

        fn execute(
            &self,
            _unit: &Unit,
            cancel: CancellationToken,
        ) -> BoxFuture<'static, ClusterResult<()>> {
            self.started.lock().unwrap().push(cancel);
            let run_for = self.run_for;
            async move {
                tokio::time::sleep(run_for).await;
                Ok(())
            }
            .boxed()
        }

        async fn complete(&self, unit: Unit) -> ClusterResult<()> {
            self.completed.lock().unwrap().push(unit.id);
            Ok(())
        }

        fn retry_delay(&self, _unit: &Unit, _retry_count: u32) -> Duration {
            Duration::ZERO
        }

        async fn retry(&self, unit: Unit, _delay: Duration, _cause: &ClusterError) -> ClusterResult<()> {
            self.queue.lock().unwrap().push_back(unit);
            Ok(())
        }

        async fn fail(&self, _unit: Unit, _error: ClusterError, _cause: ClusterError) -> ClusterResult<()> {
            Ok(())
        }

        async fn abandon(&self, unit: Unit) -> ClusterResult<()> {
            self.abandoned.lock().unwrap().push(unit.id.clone());
            self.queue.lock().unwrap().push_back(unit);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_work() {
        let source = Arc::new(SlowSource::new(Duration::from_millis(300), &["report"]));
        let pool = Arc::new(WorkerPool::new(
            WorkerPoolConfig::new("drain", 1).with_shutdown_timeout(Duration::from_secs(3)),
            Arc::clone(&source),
        ));
        pool.start().await.unwrap();
        wait_until(|| source.started.lock().unwrap().len() == 1).await;

        let stopping = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.stop().await })
        };
        for _ in 0..50 {
            if pool.status().await == PoolStatus::Draining {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.status().await, PoolStatus::Draining);

        stopping.await.unwrap().unwrap();
        assert_eq!(pool.status().await, PoolStatus::Stopped);
        assert_eq!(*source.completed.lock().unwrap(), vec!["report".to_string()]);
        assert!(source.abandoned.lock().unwrap().is_empty());
        assert!(!source.started.lock().unwrap()[0].is_cancelled());
        assert_eq!(pool.stats().await.total_processed, 1);
    }

    #[tokio::test]
    async fn test_stop_deadline_cancels_and_abandons() {
        let source = Arc::new(SlowSource::new(Duration::from_secs(10), &["stuck"]));
        let pool = WorkerPool::new(
            WorkerPoolConfig::new("deadline", 1).with_shutdown_timeout(Duration::from_millis(100)),
            Arc::clone(&source),
        );
        pool.start().await.unwrap();
        wait_until(|| source.started.lock().unwrap().len() == 1).await;

        let started = tokio::time::Instant::now();
        pool.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        assert_eq!(pool.status().await, PoolStatus::Stopped);
        assert!(source.started.lock().unwrap()[0].is_cancelled());
        assert_eq!(*source.abandoned.lock().unwrap(), vec!["stuck".to_string()]);
        assert!(source.completed.lock().unwrap().is_empty());
        // 被中断的单元已回到队列
        assert_eq!(source.queue.lock().unwrap().len(), 1);
        let stats = pool.stats().await;
        assert_eq!(stats.total_processed, 0);
        assert_eq!(stats.active_workers, 0);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let pool = WorkerPool::new(
            WorkerPoolConfig::new("twice", 1),
            Arc::new(QueueSource::default()),
        );
        assert_eq!(pool.stats().await.status, PoolStatus::Starting);
        pool.start().await.unwrap();
        assert!(pool.start().await.is_err());
        pool.stop().await.unwrap();
        // 重复停止无副作用
        pool.stop().await.unwrap();
    }
}
