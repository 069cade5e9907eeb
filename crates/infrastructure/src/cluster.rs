//! 基于任意 [`ClusterBackend`] 的 [`Cluster`] 适配器

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cluster_core::{retry_with_backoff, ClusterConfig, ClusterError, ClusterResult, RetryPolicy};
use cluster_domain::{
    new_lock_token, token_holder, Cluster, ClusterBackend, ClusterMessage, MessageHandler,
    MessageStream, Node,
};
use metrics::counter;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backends::MemoryBackend;

/// 订阅流中断后重新订阅的间隔
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// 通用集群适配器
///
/// 键布局：
/// - 锁：`{prefix}/locks/{key}`，值为 `{node_id}:{uuid}` 形式的token
/// - 节点：`{prefix}/nodes/{node_id}`，值为 [`Node`] 的JSON，TTL为心跳TTL
/// - 广播频道：`{prefix}/events`
///
/// 后端调用遇到可重试错误时按配置的退避策略重试。
pub struct BackendCluster<B: ClusterBackend> {
    node_id: String,
    backend: Arc<B>,
    key_prefix: String,
    retry_policy: RetryPolicy,
    max_attempts: u32,
    standalone: bool,
    /// 本实例持有的锁：业务键 -> token
    held_locks: RwLock<HashMap<String, String>>,
    deliveries: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl BackendCluster<MemoryBackend> {
    /// 单节点模式，锁和消息只在本进程内生效
    pub fn local(node_id: impl Into<String>) -> Self {
        let mut cluster = Self::new(
            node_id,
            Arc::new(MemoryBackend::new()),
            &ClusterConfig::default(),
        );
        cluster.standalone = true;
        cluster
    }
}

impl<B: ClusterBackend> BackendCluster<B> {
    pub fn new(node_id: impl Into<String>, backend: Arc<B>, config: &ClusterConfig) -> Self {
        Self {
            node_id: node_id.into(),
            backend,
            key_prefix: config.key_prefix.trim_end_matches('/').to_string(),
            retry_policy: config.retry_policy(),
            max_attempts: config.max_retry_attempts.max(1),
            standalone: false,
            held_locks: RwLock::new(HashMap::new()),
            deliveries: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}/locks/{}", self.key_prefix, key)
    }

    fn node_key(&self, node_id: &str) -> String {
        format!("{}/nodes/{}", self.key_prefix, node_id)
    }

    fn nodes_prefix(&self) -> String {
        format!("{}/nodes/", self.key_prefix)
    }

    fn channel(&self) -> String {
        format!("{}/events", self.key_prefix)
    }

    fn ensure_open(&self) -> ClusterResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ClusterError::backend("集群连接已关闭"))
        } else {
            Ok(())
        }
    }

    async fn call<T, F, Fut>(&self, operation: &str, f: F) -> ClusterResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClusterResult<T>>,
    {
        let result = retry_with_backoff(operation, self.max_attempts, &self.retry_policy, f).await;
        if let Err(e) = &result {
            if e.is_retryable() {
                counter!("cluster_backend_errors_total", "backend" => self.backend.name())
                    .increment(1);
            }
        }
        result
    }

    async fn write_node(&self, node_id: &str, ttl: Duration) -> ClusterResult<()> {
        let key = self.node_key(node_id);
        let value = serde_json::to_string(&Node::new(node_id))?;
        let backend = self.backend.as_ref();
        self.call("写入节点存活键", || backend.put_with_ttl(&key, &value, ttl))
            .await
    }
}

/// 订阅流中断后持续重试，直到成功或被取消
async fn resubscribe<B: ClusterBackend>(
    backend: &B,
    channel: &str,
    cancel: &CancellationToken,
) -> Option<MessageStream> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
        }
        match backend.subscribe(channel).await {
            Ok(stream) => {
                info!("已重新订阅频道 {}", channel);
                return Some(stream);
            }
            Err(e) => debug!("重新订阅频道 {} 失败: {}", channel, e),
        }
    }
}

#[async_trait]
impl<B: ClusterBackend> Cluster for BackendCluster<B> {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn is_standalone(&self) -> bool {
        self.standalone
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> ClusterResult<bool> {
        self.ensure_open()?;
        let full_key = self.lock_key(key);
        let backend = self.backend.as_ref();

        let held = self.held_locks.read().await.get(key).cloned();
        if let Some(token) = held {
            let refreshed = self
                .call("刷新锁", || backend.compare_and_refresh(&full_key, &token, ttl))
                .await?;
            if refreshed {
                return Ok(true);
            }
            // 锁已过期或被其他节点取得
            self.held_locks.write().await.remove(key);
            debug!("锁 {} 已失效，重新竞争", key);
        }

        let token = new_lock_token(&self.node_id);
        let mut acquired = self
            .call("获取锁", || backend.set_if_absent(&full_key, &token, ttl))
            .await?;
        if !acquired {
            // 重试前的写入可能已经成功，只是响应丢失
            acquired = backend.get(&full_key).await.ok().flatten().as_deref() == Some(token.as_str());
        }

        if acquired {
            self.held_locks
                .write()
                .await
                .insert(key.to_string(), token);
            counter!("cluster_lock_acquired_total", "backend" => backend.name()).increment(1);
            debug!("节点 {} 获取锁 {}", self.node_id, key);
        }
        Ok(acquired)
    }

    async fn release_lock(&self, key: &str) -> ClusterResult<()> {
        let Some(token) = self.held_locks.read().await.get(key).cloned() else {
            return Ok(());
        };
        let full_key = self.lock_key(key);
        let backend = self.backend.as_ref();
        // 后端不可用时保留令牌，之后的 release_lock 或 close 还能再次释放
        let deleted = self
            .call("释放锁", || backend.compare_and_delete(&full_key, &token))
            .await?;
        {
            let mut held = self.held_locks.write().await;
            if held.get(key) == Some(&token) {
                held.remove(key);
            }
        }
        if deleted {
            counter!("cluster_lock_released_total", "backend" => backend.name()).increment(1);
        } else {
            debug!("锁 {} 释放时已过期或被他人持有", key);
        }
        Ok(())
    }

    async fn renew_lock(&self, key: &str, ttl: Duration) -> ClusterResult<()> {
        self.ensure_open()?;
        let Some(token) = self.held_locks.read().await.get(key).cloned() else {
            return Err(ClusterError::lock_not_held(key));
        };
        let full_key = self.lock_key(key);
        let backend = self.backend.as_ref();
        let refreshed = self
            .call("续期锁", || backend.compare_and_refresh(&full_key, &token, ttl))
            .await?;
        if refreshed {
            Ok(())
        } else {
            self.held_locks.write().await.remove(key);
            Err(ClusterError::lock_not_held(key))
        }
    }

    async fn lock_holder(&self, key: &str) -> ClusterResult<Option<String>> {
        self.ensure_open()?;
        let full_key = self.lock_key(key);
        let backend = self.backend.as_ref();
        let token = self.call("查询锁", || backend.get(&full_key)).await?;
        Ok(token.map(|t| token_holder(&t).to_string()))
    }

    async fn lock_token(&self, key: &str) -> Option<String> {
        self.held_locks.read().await.get(key).cloned()
    }

    async fn broadcast(&self, message: ClusterMessage) -> ClusterResult<()> {
        self.ensure_open()?;
        let channel = self.channel();
        let payload = message.to_bytes()?;
        let backend = self.backend.as_ref();
        self.call("广播消息", || backend.publish(&channel, payload.clone()))
            .await?;
        counter!("cluster_messages_published_total").increment(1);
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> ClusterResult<()> {
        self.ensure_open()?;
        let channel = self.channel();
        let backend = self.backend.as_ref();
        let mut stream = self.call("订阅频道", || backend.subscribe(&channel)).await?;

        let backend = Arc::clone(&self.backend);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    payload = stream.recv() => match payload {
                        Some(bytes) => match ClusterMessage::from_bytes(&bytes) {
                            Ok(message) => {
                                counter!("cluster_messages_received_total").increment(1);
                                let handler = Arc::clone(&handler);
                                // 处理函数panic只影响这一条消息
                                tokio::spawn(async move { handler.handle(message).await });
                            }
                            Err(e) => {
                                warn!("丢弃无法解析的集群消息: {}", e);
                                counter!("cluster_malformed_messages_total").increment(1);
                            }
                        },
                        None => {
                            warn!("频道 {} 的订阅流已断开，尝试重新订阅", channel);
                            match resubscribe(backend.as_ref(), &channel, &cancel).await {
                                Some(next) => stream = next,
                                None => break,
                            }
                        }
                    }
                }
            }
        });

        self.deliveries.lock().await.push(handle);
        Ok(())
    }

    async fn register_node(&self, node_id: &str, ttl: Duration) -> ClusterResult<()> {
        self.ensure_open()?;
        self.write_node(node_id, ttl).await?;
        info!("节点 {} 已注册到 {} 后端", node_id, self.backend.name());
        Ok(())
    }

    async fn heartbeat(&self, node_id: &str, ttl: Duration) -> ClusterResult<()> {
        self.ensure_open()?;
        self.write_node(node_id, ttl).await
    }

    async fn list_nodes(&self) -> ClusterResult<Vec<Node>> {
        self.ensure_open()?;
        let prefix = self.nodes_prefix();
        let backend = self.backend.as_ref();
        let entries = self.call("列出节点", || backend.list_prefix(&prefix)).await?;

        let mut nodes: Vec<Node> = entries
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_str::<Node>(&value) {
                Ok(node) => Some(node),
                Err(e) => {
                    warn!("忽略无法解析的节点记录 {}: {}", key, e);
                    None
                }
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    async fn close(&self) -> ClusterResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let held: Vec<(String, String)> = self.held_locks.write().await.drain().collect();
        for (key, token) in held {
            if let Err(e) = self
                .backend
                .compare_and_delete(&self.lock_key(&key), &token)
                .await
            {
                warn!("关闭时释放锁 {} 失败，等待其过期: {}", key, e);
            }
        }
        if let Err(e) = self.backend.delete(&self.node_key(&self.node_id)).await {
            debug!("删除节点存活键失败: {}", e);
        }

        self.cancel.cancel();
        for handle in self.deliveries.lock().await.drain(..) {
            handle.abort();
        }

        self.backend.close().await?;
        info!("节点 {} 已关闭集群连接", self.node_id);
        Ok(())
    }
}
