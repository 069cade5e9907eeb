//! 集群抽象
//!
//! [`ClusterBackend`] 是各后端驱动（Redis / etcd / Consul / ZooKeeper / 内存）需要实现的
//! 原子原语；[`Cluster`] 是引擎和协调器唯一依赖的接口，由基础设施层的通用适配器
//! 在任意后端之上实现。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cluster_core::ClusterResult;
use tokio::sync::mpsc;

use crate::models::{ClusterMessage, Node};

/// 后端订阅返回的原始消息通道，接收端被丢弃后后端停止投递
pub type MessageStream = mpsc::Receiver<Vec<u8>>;

/// 后端驱动原语
///
/// 所有操作都可能返回 `BackendUnavailable`，由上层适配器负责重试。
#[async_trait]
pub trait ClusterBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// 键不存在时写入并设置TTL，返回是否写入成功
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> ClusterResult<bool>;

    /// 当前值等于 `expected` 时刷新TTL
    async fn compare_and_refresh(&self, key: &str, expected: &str, ttl: Duration)
        -> ClusterResult<bool>;

    /// 当前值等于 `expected` 时删除
    async fn compare_and_delete(&self, key: &str, expected: &str) -> ClusterResult<bool>;

    async fn get(&self, key: &str) -> ClusterResult<Option<String>>;

    async fn put_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> ClusterResult<()>;

    async fn delete(&self, key: &str) -> ClusterResult<()>;

    /// 列出前缀下所有未过期的键值对
    async fn list_prefix(&self, prefix: &str) -> ClusterResult<Vec<(String, String)>>;

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> ClusterResult<()>;

    async fn subscribe(&self, channel: &str) -> ClusterResult<MessageStream>;

    async fn close(&self) -> ClusterResult<()> {
        Ok(())
    }
}

/// 集群消息处理函数，每条消息在独立的任务中调用
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ClusterMessage);
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(ClusterMessage) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: ClusterMessage) {
        (self)(message).await
    }
}

/// 分布式协调能力接口
#[async_trait]
pub trait Cluster: Send + Sync {
    fn node_id(&self) -> &str;

    fn backend_name(&self) -> &'static str;

    /// 单节点模式（无外部后端）
    fn is_standalone(&self) -> bool {
        false
    }

    /// 非阻塞地尝试获取锁；本实例已持有时刷新TTL
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> ClusterResult<bool>;

    /// 释放本实例持有的锁；未持有或已过期时直接成功
    async fn release_lock(&self, key: &str) -> ClusterResult<()>;

    /// 显式续期，token不匹配时返回 `LockNotHeld`
    async fn renew_lock(&self, key: &str, ttl: Duration) -> ClusterResult<()>;

    /// 当前锁持有者的节点ID
    async fn lock_holder(&self, key: &str) -> ClusterResult<Option<String>>;

    /// 本实例持有的锁的fencing token
    async fn lock_token(&self, key: &str) -> Option<String>;

    async fn broadcast(&self, message: ClusterMessage) -> ClusterResult<()>;

    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> ClusterResult<()>;

    async fn register_node(&self, node_id: &str, ttl: Duration) -> ClusterResult<()>;

    async fn heartbeat(&self, node_id: &str, ttl: Duration) -> ClusterResult<()>;

    async fn list_nodes(&self) -> ClusterResult<Vec<Node>>;

    /// 释放所有锁、删除本节点存活键并停止投递任务
    async fn close(&self) -> ClusterResult<()>;
}
