use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cluster_coordinator::{Coordinator, DistributedConfig};
use cluster_core::AppConfig;
use cluster_dispatcher::SchedulerEngine;
use cluster_domain::DistributedStats;
use cluster_infrastructure::ClusterFactory;
use cluster_queue::QueueEngine;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行定时任务调度
    Scheduler,
    /// 仅运行作业队列
    Queue,
    /// 运行所有组件
    All,
}

impl AppMode {
    pub fn runs_scheduler(&self) -> bool {
        matches!(self, AppMode::Scheduler | AppMode::All)
    }

    pub fn runs_queue(&self) -> bool {
        matches!(self, AppMode::Queue | AppMode::All)
    }
}

impl std::str::FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduler" => Ok(AppMode::Scheduler),
            "queue" => Ok(AppMode::Queue),
            "all" => Ok(AppMode::All),
            other => Err(anyhow::anyhow!("不支持的运行模式: {other}")),
        }
    }
}

/// 一个集群节点：协调器加上按模式启用的调度引擎和作业队列
///
/// 嵌入方在 `start` 之前通过 [`Application::scheduler`] 注册定时任务、
/// 通过 [`Application::queue`] 注册作业处理器。
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    coordinator: Arc<Coordinator>,
    scheduler: Option<Arc<SchedulerEngine>>,
    queue: Option<Arc<QueueEngine>>,
}

impl Application {
    /// 连接集群后端并创建各组件；后端不可达时以单节点模式运行
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);
        config.validate().context("配置校验失败")?;

        let cluster = ClusterFactory::create(&config.cluster).await;
        let coordinator = Arc::new(Coordinator::new(DistributedConfig::from_settings(
            cluster,
            &config.cluster,
            &config.coordination,
        )));

        let scheduler = if mode.runs_scheduler() && config.scheduler.enabled {
            Some(Arc::new(SchedulerEngine::new(
                Arc::clone(&coordinator),
                config.scheduler.clone(),
            )))
        } else {
            None
        };

        let queue = if mode.runs_queue() && config.queue.enabled {
            let engine =
                QueueEngine::connect(Arc::clone(&coordinator), config.queue.clone(), &config.cluster)
                    .await;
            Some(Arc::new(engine))
        } else {
            None
        };

        if scheduler.is_none() && queue.is_none() {
            warn!("调度引擎和作业队列均未启用，节点只参与协调");
        }

        Ok(Self {
            config,
            mode,
            coordinator,
            scheduler,
            queue,
        })
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn scheduler(&self) -> Option<&Arc<SchedulerEngine>> {
        self.scheduler.as_ref()
    }

    pub fn queue(&self) -> Option<&Arc<QueueEngine>> {
        self.queue.as_ref()
    }

    /// 启动协调器和已启用的引擎
    pub async fn start(&self) -> Result<()> {
        self.coordinator.start().await.context("启动协调器失败")?;
        if let Some(scheduler) = &self.scheduler {
            scheduler.start().await.context("启动调度引擎失败")?;
        }
        if let Some(queue) = &self.queue {
            queue.start().await.context("启动作业队列失败")?;
        }
        info!("节点 {} 已启动", self.coordinator.node_id());
        Ok(())
    }

    /// 启动后周期性输出状态，直到收到关闭信号再停止
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.start().await?;

        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => {
                    let stats = self.stats().await;
                    info!(
                        node_id = %stats.node_id,
                        role = ?stats.role,
                        leader = ?stats.leader_id,
                        online_nodes = stats.online_nodes,
                        degraded = stats.degraded,
                        "节点状态"
                    );
                }
            }
        }

        info!("收到关闭信号，开始停止组件");
        self.stop().await
    }

    /// 先停止引擎（排空在途工作），最后停止协调器释放Leader身份
    pub async fn stop(&self) -> Result<()> {
        let drain = async {
            if let Some(scheduler) = &self.scheduler {
                if let Err(e) = scheduler.stop().await {
                    error!("停止调度引擎失败: {}", e);
                }
            }
            if let Some(queue) = &self.queue {
                if let Err(e) = queue.stop().await {
                    error!("停止作业队列失败: {}", e);
                }
            }
        };
        // 工作池自身按 shutdown_timeout 中断；这里再留出同样的余量
        let limit = self.config.coordination.shutdown_timeout() * 2;
        if tokio::time::timeout(limit, drain).await.is_err() {
            warn!("组件停止超时 ({:?})，继续关闭", limit);
        }

        self.coordinator.stop().await.context("停止协调器失败")?;
        Ok(())
    }

    /// 汇总协调器和各引擎的状态
    pub async fn stats(&self) -> DistributedStats {
        let mut stats = self.coordinator.stats().await;
        if let Some(scheduler) = &self.scheduler {
            match scheduler.stats().await {
                Ok(s) => stats.scheduler = Some(s),
                Err(e) => warn!("获取调度统计失败: {}", e),
            }
        }
        if let Some(queue) = &self.queue {
            match queue.stats().await {
                Ok(s) => stats.queue = Some(s),
                Err(e) => warn!("获取队列统计失败: {}", e),
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_domain::{JobContext, Task, TaskContext};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.cluster.node_id = Some("app-test".to_string());
        config.coordination.shutdown_timeout_ms = 1000;
        config.scheduler.tick_interval_ms = 100;
        config.queue.poll_interval_ms = 20;
        config
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!("all".parse::<AppMode>().unwrap(), AppMode::All);
        assert_eq!("queue".parse::<AppMode>().unwrap(), AppMode::Queue);
        assert!("api".parse::<AppMode>().is_err());
        assert!(AppMode::Scheduler.runs_scheduler());
        assert!(!AppMode::Scheduler.runs_queue());
    }

    #[tokio::test]
    async fn test_mode_selects_components() {
        let app = Application::new(test_config(), AppMode::Queue).await.unwrap();
        assert!(app.scheduler().is_none());
        assert!(app.queue().is_some());
        assert!(!app.queue().unwrap().is_distributed());
    }

    #[tokio::test]
    async fn test_local_node_runs_tasks_and_jobs() {
        let app = Application::new(test_config(), AppMode::All).await.unwrap();

        let runs = Arc::new(AtomicU32::new(0));
        let task_runs = Arc::clone(&runs);
        app.scheduler()
            .unwrap()
            .register(Task::new(
                "manual",
                "手动触发",
                "0 0 0 1 1 *",
                move |_ctx: TaskContext| {
                    let task_runs = Arc::clone(&task_runs);
                    async move {
                        task_runs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
            ))
            .await
            .unwrap();

        let jobs = Arc::new(AtomicU32::new(0));
        let handled = Arc::clone(&jobs);
        let queue = app.queue().unwrap();
        queue
            .register_handler("default", move |_ctx: JobContext| {
                let handled = Arc::clone(&handled);
                async move {
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        app.start().await.unwrap();
        assert_eq!(
            app.coordinator()
                .wait_for_leader(Duration::from_secs(2))
                .await
                .unwrap(),
            "app-test"
        );

        app.scheduler().unwrap().trigger_now("manual").await.unwrap();
        queue.push(queue.job(b"hello".to_vec(), "default")).await.unwrap();

        // 处理函数返回后，结果确认在工作池中异步完成
        let mut stats = app.stats().await;
        for _ in 0..100 {
            let scheduler_done = stats.scheduler.as_ref().is_some_and(|s| s.total_runs == 1);
            let queue_done = stats.queue.as_ref().is_some_and(|q| q.total_processed == 1);
            if scheduler_done && queue_done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            stats = app.stats().await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(jobs.load(Ordering::SeqCst), 1);

        assert_eq!(stats.node_id, "app-test");
        assert!(stats.is_leader);
        assert_eq!(stats.scheduler.as_ref().unwrap().total_runs, 1);
        assert_eq!(stats.queue.as_ref().unwrap().total_processed, 1);

        app.stop().await.unwrap();
        assert!(!app.coordinator().is_leader().await);
    }
}
