use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cluster_core::{ClusterError, ClusterResult};
use cluster_domain::{ClusterBackend, MessageStream};
use tokio::sync::mpsc;

/// 可注入网络分区的后端包装
///
/// 分区期间所有调用返回 `BackendUnavailable`，订阅消息被丢弃；
/// 用于在同一进程中模拟节点与后端之间的网络故障。
pub struct FaultInjectingBackend<B: ClusterBackend> {
    inner: Arc<B>,
    partitioned: Arc<AtomicBool>,
}

impl<B: ClusterBackend> FaultInjectingBackend<B> {
    pub fn new(inner: Arc<B>) -> Self {
        Self {
            inner,
            partitioned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn partition(&self) {
        self.partitioned.store(true, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.partitioned.store(false, Ordering::SeqCst);
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioned.load(Ordering::SeqCst)
    }

    fn check(&self) -> ClusterResult<()> {
        if self.is_partitioned() {
            Err(ClusterError::backend("模拟网络分区"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<B: ClusterBackend> ClusterBackend for FaultInjectingBackend<B> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> ClusterResult<bool> {
        self.check()?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn compare_and_refresh(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> ClusterResult<bool> {
        self.check()?;
        self.inner.compare_and_refresh(key, expected, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> ClusterResult<bool> {
        self.check()?;
        self.inner.compare_and_delete(key, expected).await
    }

    async fn get(&self, key: &str) -> ClusterResult<Option<String>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn put_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> ClusterResult<()> {
        self.check()?;
        self.inner.put_with_ttl(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> ClusterResult<()> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn list_prefix(&self, prefix: &str) -> ClusterResult<Vec<(String, String)>> {
        self.check()?;
        self.inner.list_prefix(prefix).await
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> ClusterResult<()> {
        self.check()?;
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> ClusterResult<MessageStream> {
        self.check()?;
        let mut upstream = self.inner.subscribe(channel).await?;
        let partitioned = Arc::clone(&self.partitioned);
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            while let Some(payload) = upstream.recv().await {
                if partitioned.load(Ordering::SeqCst) {
                    continue;
                }
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn close(&self) -> ClusterResult<()> {
        Ok(())
    }
}
