use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cluster_core::{ClusterConfig, ClusterError, ClusterResult};
use cluster_domain::{ClusterBackend, MessageStream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zookeeper_client as zk;

/// 事件节点名前缀
const EVENT_NODE: &str = "evt-";
/// 每个频道保留的事件节点数
const EVENT_RETENTION: usize = 256;
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// ZooKeeper 后端
///
/// 键对应临时节点，数据为带过期时间的JSON；过期时间由读取方判定，
/// 会话断开时 ZooKeeper 自动删除临时节点。广播写入持久顺序节点，订阅方轮询子节点。
pub struct ZookeeperBackend {
    client: zk::Client,
    request_timeout: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredValue {
    value: String,
    expires_at_ms: i64,
}

impl StoredValue {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at_ms: Utc::now().timestamp_millis() + ttl.as_millis() as i64,
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at_ms > Utc::now().timestamp_millis()
    }

    fn encode(&self) -> ClusterResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

fn map_zk_error(context: &str, err: zk::Error) -> ClusterError {
    match err {
        zk::Error::ConnectionLoss | zk::Error::SessionExpired | zk::Error::ClientClosed => {
            ClusterError::backend(format!("ZooKeeper {context}: {err}"))
        }
        other => ClusterError::internal(format!("ZooKeeper {context}: {other}")),
    }
}

/// 集群键映射为绝对路径
fn node_path(key: &str) -> String {
    format!("/{}", key.trim_start_matches('/').trim_end_matches('/'))
}

fn parent_path(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

impl ZookeeperBackend {
    pub async fn connect(config: &ClusterConfig) -> ClusterResult<Self> {
        let endpoints = config.effective_endpoints().join(",");
        let client = tokio::time::timeout(config.connect_timeout(), zk::Client::connect(&endpoints))
            .await
            .map_err(|_| ClusterError::backend("连接ZooKeeper超时"))?
            .map_err(|e| map_zk_error("连接失败", e))?;

        info!("已连接ZooKeeper集群后端: {}", endpoints);
        Ok(Self {
            client,
            request_timeout: config.request_timeout(),
        })
    }

    async fn run<T, Fut>(&self, context: &str, fut: Fut) -> ClusterResult<T>
    where
        Fut: std::future::Future<Output = Result<T, zk::Error>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result.map_err(|e| map_zk_error(context, e)),
            Err(_) => Err(ClusterError::Timeout(format!("ZooKeeper {context}"))),
        }
    }

    /// 逐级创建持久父节点
    async fn ensure_parents(&self, path: &str) -> ClusterResult<()> {
        let mut missing = Vec::new();
        let mut current = parent_path(path);
        while let Some(parent) = current {
            missing.push(parent.to_string());
            current = parent_path(parent);
        }

        let options = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
        for parent in missing.iter().rev() {
            match self.client.create(parent, &[], &options).await {
                Ok(_) | Err(zk::Error::NodeExists) => {}
                Err(e) => return Err(map_zk_error("创建父节点", e)),
            }
        }
        Ok(())
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> ClusterResult<bool> {
        let options = zk::CreateMode::Ephemeral.with_acls(zk::Acls::anyone_all());
        match self.run("创建节点", self.client.create(path, data, &options)).await {
            Ok(_) => Ok(true),
            Err(e) => {
                if self.exists(path).await? {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn exists(&self, path: &str) -> ClusterResult<bool> {
        match self.client.get_data(path).await {
            Ok(_) => Ok(true),
            Err(zk::Error::NoNode) => Ok(false),
            Err(e) => Err(map_zk_error("读取节点", e)),
        }
    }

    /// 读取节点，过期的值按版本删除后视为不存在
    async fn read(&self, path: &str) -> ClusterResult<Option<(StoredValue, i32)>> {
        let (data, stat) = match self.client.get_data(path).await {
            Ok(found) => found,
            Err(zk::Error::NoNode) => return Ok(None),
            Err(e) => return Err(map_zk_error("读取节点", e)),
        };
        let stored: StoredValue = match serde_json::from_slice(&data) {
            Ok(stored) => stored,
            Err(e) => {
                debug!("忽略无法解析的ZooKeeper节点 {}: {}", path, e);
                return Ok(None);
            }
        };
        if stored.is_live() {
            return Ok(Some((stored, stat.version)));
        }
        match self.client.delete(path, Some(stat.version)).await {
            Ok(()) | Err(zk::Error::NoNode) | Err(zk::Error::BadVersion { .. }) => {}
            Err(e) => return Err(map_zk_error("清理过期节点", e)),
        }
        Ok(None)
    }

    async fn prune_events(&self, channel_path: &str) -> ClusterResult<()> {
        let mut children = self
            .run("列出事件", self.client.list_children(channel_path))
            .await?;
        if children.len() <= EVENT_RETENTION {
            return Ok(());
        }
        children.sort();
        let excess = children.len() - EVENT_RETENTION;
        for child in children.into_iter().take(excess) {
            let path = format!("{channel_path}/{child}");
            if let Err(e) = self.client.delete(&path, None).await {
                debug!("清理事件节点 {} 失败: {}", path, e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterBackend for ZookeeperBackend {
    fn name(&self) -> &'static str {
        "zookeeper"
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> ClusterResult<bool> {
        let path = node_path(key);
        // 顺带清理过期的旧值
        if self.read(&path).await?.is_some() {
            return Ok(false);
        }
        self.ensure_parents(&path).await?;
        let data = StoredValue::new(value, ttl).encode()?;
        self.create_ephemeral(&path, &data).await
    }

    async fn compare_and_refresh(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> ClusterResult<bool> {
        let path = node_path(key);
        let Some((stored, version)) = self.read(&path).await? else {
            return Ok(false);
        };
        if stored.value != expected {
            return Ok(false);
        }
        let data = StoredValue::new(expected, ttl).encode()?;
        match self.client.set_data(&path, &data, Some(version)).await {
            Ok(_) => Ok(true),
            Err(zk::Error::NoNode) | Err(zk::Error::BadVersion { .. }) => Ok(false),
            Err(e) => Err(map_zk_error("刷新节点", e)),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> ClusterResult<bool> {
        let path = node_path(key);
        let Some((stored, version)) = self.read(&path).await? else {
            return Ok(false);
        };
        if stored.value != expected {
            return Ok(false);
        }
        match self.client.delete(&path, Some(version)).await {
            Ok(()) => Ok(true),
            Err(zk::Error::NoNode) | Err(zk::Error::BadVersion { .. }) => Ok(false),
            Err(e) => Err(map_zk_error("删除节点", e)),
        }
    }

    async fn get(&self, key: &str) -> ClusterResult<Option<String>> {
        Ok(self.read(&node_path(key)).await?.map(|(s, _)| s.value))
    }

    async fn put_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> ClusterResult<()> {
        let path = node_path(key);
        let data = StoredValue::new(value, ttl).encode()?;
        match self.client.set_data(&path, &data, None).await {
            Ok(_) => Ok(()),
            Err(zk::Error::NoNode) => {
                self.ensure_parents(&path).await?;
                if self.create_ephemeral(&path, &data).await? {
                    Ok(())
                } else {
                    self.run("写入节点", self.client.set_data(&path, &data, None))
                        .await
                        .map(|_| ())
                }
            }
            Err(e) => Err(map_zk_error("写入节点", e)),
        }
    }

    async fn delete(&self, key: &str) -> ClusterResult<()> {
        match self.client.delete(&node_path(key), None).await {
            Ok(()) | Err(zk::Error::NoNode) => Ok(()),
            Err(e) => Err(map_zk_error("删除节点", e)),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> ClusterResult<Vec<(String, String)>> {
        // 前缀按目录处理，例如 "cluster/nodes/"
        let dir = node_path(prefix);
        let children = match self.client.list_children(&dir).await {
            Ok(children) => children,
            Err(zk::Error::NoNode) => return Ok(Vec::new()),
            Err(e) => return Err(map_zk_error("列出子节点", e)),
        };

        let base = prefix.trim_start_matches('/').trim_end_matches('/');
        let mut items = Vec::with_capacity(children.len());
        for child in children {
            if let Some((stored, _)) = self.read(&format!("{dir}/{child}")).await? {
                items.push((format!("{base}/{child}"), stored.value));
            }
        }
        items.sort();
        Ok(items)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> ClusterResult<()> {
        let channel_path = node_path(channel);
        let prefix = format!("{channel_path}/{EVENT_NODE}");
        self.ensure_parents(&prefix).await?;

        let options = zk::CreateMode::PersistentSequential.with_acls(zk::Acls::anyone_all());
        self.run("发布事件", self.client.create(&prefix, &payload, &options))
            .await?;

        if let Err(e) = self.prune_events(&channel_path).await {
            debug!("清理频道 {} 的事件失败: {}", channel, e);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> ClusterResult<MessageStream> {
        let channel_path = node_path(channel);
        self.ensure_parents(&format!("{channel_path}/{EVENT_NODE}"))
            .await?;

        // 订阅前的事件不投递
        let mut last_seen = self
            .run("列出事件", self.client.list_children(&channel_path))
            .await
            .unwrap_or_default()
            .into_iter()
            .max()
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel(1024);
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            loop {
                interval.tick().await;
                if tx.is_closed() {
                    break;
                }
                let mut children = match client.list_children(&channel_path).await {
                    Ok(children) => children,
                    Err(zk::Error::NoNode) => continue,
                    Err(e) => {
                        debug!("拉取ZooKeeper事件失败: {}", e);
                        continue;
                    }
                };
                children.retain(|c| c.as_str() > last_seen.as_str());
                children.sort();

                for child in children {
                    match client.get_data(&format!("{channel_path}/{child}")).await {
                        Ok((data, _)) => {
                            if tx.send(data).await.is_err() {
                                return;
                            }
                        }
                        Err(zk::Error::NoNode) => {}
                        Err(e) => warn!("读取事件节点 {} 失败: {}", child, e),
                    }
                    last_seen = child;
                }
            }
        });

        Ok(rx)
    }
}
