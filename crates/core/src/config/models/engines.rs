use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ClusterError, ClusterResult};
use crate::retry::{BackoffStrategy, RetryPolicy};

/// 定时任务调度引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_interval_ms: u64,
    /// 任务重试的间隔策略，基础间隔取自任务的 retry_delay
    pub retry_strategy: BackoffStrategy,
    pub max_retry_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: 1000,
            retry_strategy: BackoffStrategy::Exponential,
            max_retry_delay_ms: 300_000,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// 引擎级重试策略，任务注册时再用 retry_delay 替换基础间隔
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            strategy: self.retry_strategy,
            base_delay_ms: 1000,
            max_delay_ms: self.max_retry_delay_ms,
            ..RetryPolicy::default()
        }
    }

    pub fn validate(&self) -> ClusterResult<()> {
        if self.tick_interval_ms == 0 {
            return Err(ClusterError::config_error(
                "scheduler.tick_interval_ms 必须大于0",
            ));
        }
        Ok(())
    }
}

/// 作业队列引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub enabled: bool,
    pub queues: Vec<String>,
    /// 共享存储没有本地唤醒通知时的轮询间隔
    pub poll_interval_ms: u64,
    pub reaper_interval_ms: u64,
    pub default_timeout_ms: u64,
    pub default_max_attempts: u32,
    /// 已完成/已失败作业在存储中的保留时间
    pub finished_retention_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queues: vec!["default".to_string()],
            poll_interval_ms: 200,
            reaper_interval_ms: 1000,
            default_timeout_ms: 60_000,
            default_max_attempts: 3,
            finished_retention_ms: 3_600_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn finished_retention(&self) -> Duration {
        Duration::from_millis(self.finished_retention_ms)
    }

    pub fn validate(&self) -> ClusterResult<()> {
        if self.queues.iter().any(|q| q.trim().is_empty()) {
            return Err(ClusterError::config_error("queue.queues 包含空队列名"));
        }
        if self.poll_interval_ms == 0 || self.reaper_interval_ms == 0 {
            return Err(ClusterError::config_error("队列轮询和回收间隔必须大于0"));
        }
        if self.default_max_attempts == 0 {
            return Err(ClusterError::config_error(
                "queue.default_max_attempts 必须大于0",
            ));
        }
        self.retry.validate()
    }
}

/// Prometheus 指标导出配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: "0.0.0.0:9090".to_string(),
        }
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> ClusterResult<()> {
        if self.enabled && self.listen_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ClusterError::config_error(format!(
                "无效的指标监听地址: {}",
                self.listen_address
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_retry_policy_follows_strategy() {
        let config = SchedulerConfig {
            retry_strategy: BackoffStrategy::Fixed,
            ..SchedulerConfig::default()
        };
        let policy = config.retry_policy().with_base_delay(Duration::from_millis(500));
        assert_eq!(policy.strategy, BackoffStrategy::Fixed);
        assert_eq!(policy.without_jitter().delay_for(3), Duration::from_millis(500));
    }

    #[test]
    fn test_queue_validation() {
        assert!(QueueConfig::default().validate().is_ok());
        let config = QueueConfig {
            queues: vec!["emails".into(), " ".into()],
            ..QueueConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_metrics_listen_address() {
        let config = MetricsConfig {
            enabled: true,
            listen_address: "not-an-address".into(),
        };
        assert!(config.validate().is_err());
        assert!(MetricsConfig::default().validate().is_ok());
    }
}
