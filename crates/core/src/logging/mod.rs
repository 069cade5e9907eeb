pub mod log_config;
pub mod log_level;

pub use log_config::{LogConfig, OutputFormat};
pub use log_level::LogLevel;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::errors::{ClusterError, ClusterResult};

/// 初始化日志系统
///
/// `RUST_LOG` 存在时优先于配置中的日志级别。重复初始化会返回配置错误。
pub fn init_logging(config: &LogConfig) -> ClusterResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_filter()));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format {
        OutputFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.include_target),
            )
            .try_init(),
        OutputFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_target(config.include_target),
            )
            .try_init(),
        OutputFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(config.include_target),
            )
            .try_init(),
    };

    result.map_err(|e| ClusterError::Configuration(format!("初始化日志系统失败: {e}")))
}
