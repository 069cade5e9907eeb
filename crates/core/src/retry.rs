use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{ClusterError, ClusterResult};

/// 重试间隔策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// 固定间隔
    Fixed,
    /// 指数退避
    #[default]
    Exponential,
}

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    /// 基础重试间隔（毫秒）
    pub base_delay_ms: u64,
    /// 最大重试间隔（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避倍数
    pub multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay_ms: delay.as_millis() as u64,
            max_delay_ms: delay.as_millis() as u64,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            ..Self::default()
        }
    }

    /// 以指定基础间隔替换当前策略的基础间隔（任务自带 retry_delay 时使用）
    pub fn with_base_delay(&self, base: Duration) -> Self {
        let base_ms = base.as_millis() as u64;
        Self {
            base_delay_ms: base_ms,
            max_delay_ms: self.max_delay_ms.max(base_ms),
            ..self.clone()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// 计算第 `retry_count` 次重试前的等待时间（从1开始计数）
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let base = self.base_delay_ms as f64;
        let max = self.max_delay_ms.max(self.base_delay_ms) as f64;

        let interval = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => {
                let exponent = retry_count.saturating_sub(1).min(32) as i32;
                (base * self.multiplier.powi(exponent)).min(max)
            }
        };

        // 添加随机抖动以避免雷群效应
        let jitter = if self.jitter_factor > 0.0 {
            interval * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0
        } else {
            0.0
        };
        let final_interval = (interval + jitter).max(0.0).min(max);

        Duration::from_millis(final_interval as u64)
    }

    pub fn validate(&self) -> ClusterResult<()> {
        if self.multiplier < 1.0 {
            return Err(ClusterError::config_error("退避倍数不能小于1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ClusterError::config_error("抖动系数必须在0.0到1.0之间"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ClusterError::config_error("最大重试间隔不能小于基础间隔"));
        }
        Ok(())
    }
}

/// 对可重试的错误按退避策略执行重试，直到成功、遇到不可重试错误或次数耗尽
pub async fn retry_with_backoff<T, F, Fut>(
    operation_name: &str,
    max_attempts: u32,
    policy: &RetryPolicy,
    mut operation: F,
) -> ClusterResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClusterResult<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} 在第 {} 次尝试后成功", operation_name, attempt);
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} 失败 (尝试 {}/{}): {}，{:?} 后重试",
                    operation_name, attempt, max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
