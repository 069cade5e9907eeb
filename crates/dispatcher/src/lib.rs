//! 定时任务调度引擎
//!
//! 按CRON表达式推进任务的计划时间，结合协调器的Leader状态决定是否派发，
//! 执行交给 `cluster-worker` 的工作池。

pub mod cron_utils;
pub mod scheduler;
pub mod task_runs;

pub use cron_utils::{normalize_cron_expression, CronScheduler};
pub use scheduler::SchedulerEngine;
pub use task_runs::{TaskCompletedHook, TaskFailedHook, TaskRun, TaskRunSource};
