use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    cluster::ClusterConfig,
    coordination::CoordinationConfig,
    engines::{MetricsConfig, QueueConfig, SchedulerConfig},
};
use crate::errors::ClusterResult;
use crate::logging::LogConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub cluster: ClusterConfig,
    pub coordination: CoordinationConfig,
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
    pub logging: LogConfig,
    pub metrics: MetricsConfig,
}

impl AppConfig {
    /// 从TOML文件和 `CLUSTER_` 前缀的环境变量加载配置
    ///
    /// 环境变量使用双下划线分隔层级，例如 `CLUSTER_CLUSTER__BACKEND=redis`、
    /// `CLUSTER_COORDINATION__LOCK_TIMEOUT_MS=8000`。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/cluster.toml",
                "cluster.toml",
                "/etc/cluster-scheduler/config.toml",
            ];

            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("CLUSTER")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("cluster.endpoints")
                .with_list_parse_key("queue.queues")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> ClusterResult<()> {
        self.cluster.validate()?;
        self.coordination.validate()?;
        self.scheduler.validate()?;
        self.queue.validate()?;
        self.logging.validate()?;
        self.metrics.validate()?;
        Ok(())
    }
}
