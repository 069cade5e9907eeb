use thiserror::Error;

/// 协调核心的统一错误类型
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("集群后端不可用: {0}")]
    BackendUnavailable(String),

    #[error("未持有锁: {key}")]
    LockNotHeld { key: String },

    #[error("选举超时，未观察到Leader")]
    ElectionTimeout,

    #[error("作业重试次数已耗尽: {job_id} (已尝试 {attempts} 次)")]
    JobExhausted { job_id: String, attempts: u32 },

    #[error("处理函数发生panic: {0}")]
    HandlerPanic(String),

    #[error("处理函数执行失败: {0}")]
    HandlerFailed(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("操作已取消")]
    Cancelled,

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("作业未找到: {id}")]
    JobNotFound { id: String },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

pub type ClusterResult<T> = Result<T, ClusterError>;

impl ClusterError {
    pub fn backend<S: Into<String>>(msg: S) -> Self {
        Self::BackendUnavailable(msg.into())
    }
    pub fn lock_not_held<S: Into<String>>(key: S) -> Self {
        Self::LockNotHeld { key: key.into() }
    }
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn job_not_found<S: Into<String>>(id: S) -> Self {
        Self::JobNotFound { id: id.into() }
    }
    pub fn handler<S: Into<String>>(msg: S) -> Self {
        Self::HandlerFailed(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// 瞬时错误，可以在集群适配层内退避重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::BackendUnavailable(_) | ClusterError::Timeout(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::Configuration(_) | ClusterError::Internal(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClusterError::Cancelled)
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for ClusterError {
    fn from(err: anyhow::Error) -> Self {
        ClusterError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ClusterError::backend("redis down").is_retryable());
        assert!(ClusterError::Timeout("acquire".into()).is_retryable());
        assert!(!ClusterError::lock_not_held("leader").is_retryable());
        assert!(!ClusterError::ElectionTimeout.is_retryable());
        assert!(!ClusterError::HandlerPanic("boom".into()).is_retryable());
    }

    #[test]
    fn test_cancelled_is_distinct() {
        assert!(ClusterError::Cancelled.is_cancelled());
        assert!(!ClusterError::Timeout("pop".into()).is_cancelled());
    }

    #[test]
    fn test_error_messages() {
        let err = ClusterError::JobExhausted {
            job_id: "job-1".to_string(),
            attempts: 3,
        };
        assert!(err.to_string().contains("job-1"));
        assert!(err.to_string().contains('3'));
    }
}
