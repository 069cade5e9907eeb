use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{ClusterError, ClusterResult};

/// 选举、心跳和工作池的调优参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub heartbeat_interval_ms: u64,
    pub lock_timeout_ms: u64,
    pub election_timeout_ms: u64,
    pub enable_leader_election: bool,
    pub enable_task_distribution: bool,
    pub enable_job_distribution: bool,
    pub worker_count: usize,
    /// 0 表示不额外限制并发
    pub max_concurrency: usize,
    pub shutdown_timeout_ms: u64,
    /// 连续错过多少个心跳周期后标记为 suspect
    pub suspect_after_missed: u32,
    /// 连续错过多少个心跳周期后标记为 offline
    pub offline_after_missed: u32,
    /// offline 节点从花名册中清除前的保留时间
    pub node_cleanup_after_ms: u64,
    pub leader_key: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            lock_timeout_ms: 5000,
            election_timeout_ms: 3000,
            enable_leader_election: true,
            enable_task_distribution: true,
            enable_job_distribution: true,
            worker_count: 4,
            max_concurrency: 0,
            shutdown_timeout_ms: 30_000,
            suspect_after_missed: 2,
            offline_after_missed: 5,
            node_cleanup_after_ms: 300_000,
            leader_key: "leader".to_string(),
        }
    }
}

impl CoordinationConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn node_cleanup_after(&self) -> Duration {
        Duration::from_millis(self.node_cleanup_after_ms)
    }

    pub fn validate(&self) -> ClusterResult<()> {
        validate_timings(
            self.heartbeat_interval(),
            self.lock_timeout(),
            self.election_timeout(),
        )?;
        if self.worker_count == 0 {
            return Err(ClusterError::config_error(
                "coordination.worker_count 必须大于0",
            ));
        }
        if self.suspect_after_missed == 0 || self.offline_after_missed <= self.suspect_after_missed
        {
            return Err(ClusterError::config_error(
                "coordination.offline_after_missed 必须大于 suspect_after_missed 且后者大于0",
            ));
        }
        if self.leader_key.trim().is_empty() {
            return Err(ClusterError::config_error("coordination.leader_key 不能为空"));
        }
        Ok(())
    }
}

/// 锁超时必须大于心跳间隔；小于3倍心跳间隔时仅告警
pub fn validate_timings(
    heartbeat_interval: Duration,
    lock_timeout: Duration,
    election_timeout: Duration,
) -> ClusterResult<()> {
    if heartbeat_interval.is_zero() {
        return Err(ClusterError::config_error("心跳间隔必须大于0"));
    }
    if election_timeout.is_zero() {
        return Err(ClusterError::config_error("选举超时必须大于0"));
    }
    if lock_timeout <= heartbeat_interval {
        return Err(ClusterError::config_error(format!(
            "锁超时 {lock_timeout:?} 必须大于心跳间隔 {heartbeat_interval:?}"
        )));
    }
    if lock_timeout < heartbeat_interval * 3 {
        warn!(
            "锁超时 {:?} 小于3倍心跳间隔 {:?}，网络抖动时可能频繁丢失Leader",
            lock_timeout, heartbeat_interval
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = CoordinationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.leader_key, "leader");
    }

    #[test]
    fn test_lock_timeout_must_exceed_heartbeat() {
        let config = CoordinationConfig {
            heartbeat_interval_ms: 1000,
            lock_timeout_ms: 1000,
            ..CoordinationConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ClusterError::Configuration(_))
        ));

        // 小于3倍只告警
        let config = CoordinationConfig {
            heartbeat_interval_ms: 1000,
            lock_timeout_ms: 2000,
            ..CoordinationConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_failure_thresholds() {
        let config = CoordinationConfig {
            suspect_after_missed: 3,
            offline_after_missed: 3,
            ..CoordinationConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
