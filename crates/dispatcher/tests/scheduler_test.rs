#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use cluster_coordinator::{Coordinator, DistributedConfig};
    use cluster_core::{ClusterConfig, ClusterError, SchedulerConfig};
    use cluster_dispatcher::SchedulerEngine;
    use cluster_domain::{Cluster, Task, TaskContext};
    use cluster_infrastructure::{BackendCluster, LocalCluster, MemoryBackend};
    use tokio::sync::mpsc;

    fn standalone_coordinator() -> Arc<Coordinator> {
        let cluster: Arc<dyn Cluster> = Arc::new(LocalCluster::local("solo"));
        Arc::new(Coordinator::new(
            DistributedConfig::new(cluster)
                .with_worker_count(2)
                .with_shutdown_timeout(Duration::from_secs(2)),
        ))
    }

    fn create_engine(coordinator: Arc<Coordinator>) -> Arc<SchedulerEngine> {
        let config = SchedulerConfig {
            tick_interval_ms: 200,
            ..SchedulerConfig::default()
        };
        Arc::new(SchedulerEngine::new(coordinator, config))
    }

    fn counting_task(name: &str, cron: &str, runs: &Arc<AtomicU32>) -> Task {
        let runs = Arc::clone(runs);
        Task::new(name, "计数任务", cron, move |_ctx: TaskContext| {
            let runs = Arc::clone(&runs);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_every_five_seconds_over_eleven_seconds() {
        let engine = create_engine(standalone_coordinator());
        let runs = Arc::new(AtomicU32::new(0));
        engine
            .register(counting_task("every-5s", "*/5 * * * * *", &runs))
            .await
            .unwrap();

        engine.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        engine.stop().await.unwrap();

        let count = runs.load(Ordering::SeqCst);
        assert!((2..=3).contains(&count), "unexpected run count {count}");
        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.total_runs, u64::from(count));
        assert_eq!(stats.total_failures, 0);
    }

    #[tokio::test]
    async fn test_five_field_expression_is_normalized() {
        let engine = create_engine(standalone_coordinator());
        let runs = Arc::new(AtomicU32::new(0));
        engine
            .register(counting_task("five", "*/5 * * * *", &runs))
            .await
            .unwrap();

        let tasks = engine.tasks().await.unwrap();
        assert_eq!(tasks[0].cron_expression, "0 */5 * * * *");
        assert!(engine.next_run_time("five").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_cron_is_rejected() {
        let engine = create_engine(standalone_coordinator());
        let runs = Arc::new(AtomicU32::new(0));
        let err = engine
            .register(counting_task("bad", "every minute", &runs))
            .await
            .unwrap_err();

        assert!(matches!(err, ClusterError::InvalidCron { .. }));
        assert!(engine.tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let engine = create_engine(standalone_coordinator());
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        let task = Task::new("flaky", "前两次失败", "0 0 0 1 1 *", move |ctx: TaskContext| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                if ctx.attempt < 3 {
                    Err(ClusterError::handler("not yet"))
                } else {
                    Ok(())
                }
            }
        })
        .with_max_retries(3)
        .with_retry_delay(Duration::from_millis(50));
        engine.register(task).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.on_completed(move |run| {
            let _ = tx.send(run.attempt);
        });
        engine.start().await.unwrap();
        engine.trigger_now("flaky").await.unwrap();

        let attempt = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attempt, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.total_runs, 1);
        assert_eq!(stats.total_failures, 0);
        assert_eq!(stats.pool.total_retried, 2);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure_without_disabling() {
        let engine = create_engine(standalone_coordinator());
        let cancelled = Arc::new(AtomicU32::new(0));
        let observed = Arc::clone(&cancelled);
        let task = Task::new("slow", "总是超时", "0 0 0 1 1 *", move |ctx: TaskContext| {
            let observed = Arc::clone(&observed);
            async move {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        observed.fetch_add(1, Ordering::SeqCst);
                        Err(ClusterError::Cancelled)
                    }
                    _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(()),
                }
            }
        })
        .with_timeout(Duration::from_millis(100));
        engine.register(task).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.on_failed(move |run, error| {
            let exhausted = matches!(error, ClusterError::JobExhausted { .. });
            let _ = tx.send((run.task.id.clone(), exhausted));
        });
        engine.start().await.unwrap();
        engine.trigger_now("slow").await.unwrap();

        let (task_id, exhausted) = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task_id, "slow");
        assert!(exhausted);

        let info = engine.tasks().await.unwrap().remove(0);
        assert_eq!(info.runtime.fail_count, 1);
        assert_eq!(info.runtime.run_count, 1);
        assert!(info.enabled);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_panic_does_not_kill_the_pool() {
        let engine = create_engine(standalone_coordinator());
        let panicking = Task::new("panics", "", "0 0 0 1 1 *", |_ctx: TaskContext| async move {
            if true {
                panic!("handler bug");
            }
            Ok(())
        });
        let runs = Arc::new(AtomicU32::new(0));
        engine.register(panicking).await.unwrap();
        engine
            .register(counting_task("healthy", "0 0 0 1 1 *", &runs))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.on_failed(move |_run, _error| {
            let _ = tx.send(());
        });
        engine.start().await.unwrap();
        engine.trigger_now("panics").await.unwrap();
        tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();

        engine.trigger_now("healthy").await.unwrap();
        for _ in 0..100 {
            if runs.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_disable_enable_and_unregister() {
        let engine = create_engine(standalone_coordinator());
        let runs = Arc::new(AtomicU32::new(0));
        engine
            .register(counting_task("report", "0 */5 * * * *", &runs))
            .await
            .unwrap();

        engine.disable("report").await.unwrap();
        assert_eq!(engine.next_run_time("report").await.unwrap(), None);
        assert_eq!(engine.stats().await.unwrap().enabled_tasks, 0);

        engine.enable("report").await.unwrap();
        assert!(engine.next_run_time("report").await.unwrap().is_some());

        engine.unregister("report").await.unwrap();
        assert!(matches!(
            engine.next_run_time("report").await,
            Err(ClusterError::TaskNotFound { .. })
        ));
        assert!(engine.unregister("report").await.is_err());
        assert!(engine.enable("report").await.is_err());
    }

    #[tokio::test]
    async fn test_only_leader_dispatches() {
        let backend = Arc::new(MemoryBackend::new());
        let coordinators: Vec<Arc<Coordinator>> = (0..2)
            .map(|i| {
                let cluster: Arc<dyn Cluster> = Arc::new(BackendCluster::new(
                    format!("node-{i}"),
                    Arc::clone(&backend),
                    &ClusterConfig::default(),
                ));
                Arc::new(Coordinator::new(DistributedConfig::new(cluster).with_timings(
                    Duration::from_millis(20),
                    Duration::from_millis(100),
                    Duration::from_millis(60),
                )))
            })
            .collect();
        for coordinator in &coordinators {
            coordinator.start().await.unwrap();
        }
        for coordinator in &coordinators {
            coordinator
                .wait_for_leader(Duration::from_secs(2))
                .await
                .unwrap();
        }

        let runs = Arc::new(AtomicU32::new(0));
        let mut engines = Vec::new();
        for coordinator in &coordinators {
            let engine = create_engine(Arc::clone(coordinator));
            engine
                .register(counting_task("every-second", "* * * * * *", &runs))
                .await
                .unwrap();
            engines.push(engine);
        }

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let mut dispatched = Vec::new();
        for engine in &engines {
            dispatched.push(engine.tick().await.unwrap());
        }

        let leader_index = if coordinators[0].is_leader().await { 0 } else { 1 };
        let follower_index = 1 - leader_index;
        assert_eq!(dispatched[leader_index], 1);
        assert_eq!(dispatched[follower_index], 0);
        assert_eq!(
            engines[follower_index].stats().await.unwrap().skipped_dispatches,
            1
        );

        for coordinator in &coordinators {
            coordinator.stop().await.unwrap();
        }
    }
}
