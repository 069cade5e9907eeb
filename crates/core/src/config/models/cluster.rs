use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ClusterError, ClusterResult};
use crate::retry::RetryPolicy;

/// 集群后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// 单节点本地模式，不依赖任何外部服务
    #[default]
    #[serde(alias = "memory", alias = "none")]
    Local,
    Redis,
    Etcd,
    Consul,
    #[serde(alias = "zk")]
    Zookeeper,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Redis => "redis",
            BackendKind::Etcd => "etcd",
            BackendKind::Consul => "consul",
            BackendKind::Zookeeper => "zookeeper",
        }
    }

    /// 未配置endpoints时使用的默认地址
    pub fn default_endpoints(&self) -> Vec<String> {
        let endpoint = match self {
            BackendKind::Local => return Vec::new(),
            BackendKind::Redis => "redis://127.0.0.1:6379",
            BackendKind::Etcd => "http://127.0.0.1:2379",
            BackendKind::Consul => "http://127.0.0.1:8500",
            BackendKind::Zookeeper => "127.0.0.1:2181",
        };
        vec![endpoint.to_string()]
    }
}

impl FromStr for BackendKind {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "memory" | "none" => Ok(BackendKind::Local),
            "redis" => Ok(BackendKind::Redis),
            "etcd" => Ok(BackendKind::Etcd),
            "consul" => Ok(BackendKind::Consul),
            "zookeeper" | "zk" => Ok(BackendKind::Zookeeper),
            other => Err(ClusterError::config_error(format!(
                "不支持的集群后端: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 集群后端连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub backend: BackendKind,
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// etcd / Consul 的访问令牌
    pub token: Option<String>,
    /// 为空时根据主机名自动生成
    pub node_id: Option<String>,
    /// 节点存活键的TTL（秒）
    pub ttl_seconds: u64,
    /// 所有后端键的公共前缀
    pub key_prefix: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            endpoints: Vec::new(),
            username: None,
            password: None,
            token: None,
            node_id: None,
            ttl_seconds: 10,
            key_prefix: "cluster".to_string(),
            connect_timeout_ms: 3000,
            request_timeout_ms: 5000,
            max_retry_attempts: 3,
            retry_base_delay_ms: 100,
        }
    }
}

impl ClusterConfig {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    pub fn with_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn effective_endpoints(&self) -> Vec<String> {
        if self.endpoints.is_empty() {
            self.backend.default_endpoints()
        } else {
            self.endpoints.clone()
        }
    }

    /// 配置的节点ID，未配置时生成 `<hostname>-<uuid前8位>`
    pub fn resolve_node_id(&self) -> String {
        match self.node_id.as_deref() {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => generate_node_id(),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// 后端调用的退避策略
    pub fn retry_policy(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.retry_base_delay_ms);
        RetryPolicy::exponential(base, base * 16)
    }

    pub fn validate(&self) -> ClusterResult<()> {
        if self.ttl_seconds == 0 {
            return Err(ClusterError::config_error("cluster.ttl_seconds 必须大于0"));
        }
        if self.key_prefix.trim().is_empty() {
            return Err(ClusterError::config_error("cluster.key_prefix 不能为空"));
        }
        if self.max_retry_attempts == 0 {
            return Err(ClusterError::config_error(
                "cluster.max_retry_attempts 必须大于0",
            ));
        }
        if self.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(ClusterError::config_error("cluster.endpoints 包含空地址"));
        }
        Ok(())
    }
}

pub fn generate_node_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "node".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("Redis".parse::<BackendKind>().unwrap(), BackendKind::Redis);
        assert_eq!("zk".parse::<BackendKind>().unwrap(), BackendKind::Zookeeper);
        assert_eq!("memory".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert!("mysql".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_default_endpoints() {
        let config = ClusterConfig::new(BackendKind::Consul);
        assert_eq!(config.effective_endpoints(), vec!["http://127.0.0.1:8500"]);

        let config = config.with_endpoints(["http://consul-1:8500", "http://consul-2:8500"]);
        assert_eq!(config.effective_endpoints().len(), 2);
        assert!(ClusterConfig::default().effective_endpoints().is_empty());
    }

    #[test]
    fn test_resolve_node_id() {
        let config = ClusterConfig::default().with_node_id(" node-a ");
        assert_eq!(config.resolve_node_id(), "node-a");

        let generated = ClusterConfig::default().resolve_node_id();
        assert!(!generated.is_empty());
        assert_ne!(generated, ClusterConfig::default().resolve_node_id());
    }

    #[test]
    fn test_validation() {
        assert!(ClusterConfig::default().validate().is_ok());

        let config = ClusterConfig {
            ttl_seconds: 0,
            ..ClusterConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ClusterConfig {
            max_retry_attempts: 0,
            ..ClusterConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
