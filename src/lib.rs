//! 分布式协调核心的节点程序：按配置连接集群后端，运行定时任务调度和作业队列

pub mod app;
pub mod shutdown;

pub use app::{AppMode, Application};
pub use shutdown::{wait_for_shutdown_signal, ShutdownManager};
