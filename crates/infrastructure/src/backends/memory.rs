use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use cluster_core::ClusterResult;
use cluster_domain::{ClusterBackend, MessageStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// 进程内后端
///
/// 多个 [`BackendCluster`](crate::BackendCluster) 共享同一个实例即可模拟多节点集群；
/// 单节点模式下作为本地锁和消息总线使用。
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

fn deadline(ttl: Duration) -> Option<Instant> {
    Some(Instant::now() + ttl)
}

#[async_trait]
impl ClusterBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> ClusterResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: deadline(ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_refresh(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> ClusterResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) && entry.value == expected => {
                entry.expires_at = deadline(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> ClusterResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) && entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> ClusterResult<Option<String>> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn put_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> ClusterResult<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: deadline(ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> ClusterResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> ClusterResult<Vec<(String, String)>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, e| e.is_live(now));
        let mut items: Vec<(String, String)> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        items.sort();
        Ok(items)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> ClusterResult<()> {
        // 没有订阅者时发送失败是正常情况
        let _ = self.sender(channel).await.send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> ClusterResult<MessageStream> {
        let mut receiver = self.sender(channel).await.subscribe();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let channel = channel.to_string();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("频道 {} 的订阅者落后，丢弃了 {} 条消息", channel, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_if_absent_respects_ttl() {
        let backend = MemoryBackend::new();
        assert!(backend
            .set_if_absent("k", "a", Duration::from_millis(50))
            .await
            .unwrap());
        assert!(!backend
            .set_if_absent("k", "b", Duration::from_millis(50))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(backend
            .set_if_absent("k", "b", Duration::from_secs(1))
            .await
            .unwrap());
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_compare_operations() {
        let backend = MemoryBackend::new();
        backend
            .set_if_absent("lock", "token-1", Duration::from_secs(1))
            .await
            .unwrap();

        assert!(!backend
            .compare_and_refresh("lock", "token-2", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(backend
            .compare_and_refresh("lock", "token-1", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(!backend.compare_and_delete("lock", "token-2").await.unwrap());
        assert!(backend.compare_and_delete("lock", "token-1").await.unwrap());
        assert!(!backend.compare_and_delete("lock", "token-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_prefix_skips_expired() {
        let backend = MemoryBackend::new();
        backend
            .put_with_ttl("nodes/a", "1", Duration::from_secs(5))
            .await
            .unwrap();
        backend
            .put_with_ttl("nodes/b", "2", Duration::from_millis(10))
            .await
            .unwrap();
        backend
            .put_with_ttl("locks/x", "3", Duration::from_secs(5))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let items = backend.list_prefix("nodes/").await.unwrap();
        assert_eq!(items, vec![("nodes/a".to_string(), "1".to_string())]);
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let backend = MemoryBackend::new();
        let mut first = backend.subscribe("events").await.unwrap();
        let mut second = backend.subscribe("events").await.unwrap();

        backend.publish("events", b"hello".to_vec()).await.unwrap();

        assert_eq!(first.recv().await.unwrap(), b"hello".to_vec());
        assert_eq!(second.recv().await.unwrap(), b"hello".to_vec());
    }
}
