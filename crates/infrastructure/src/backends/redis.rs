use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use cluster_core::{ClusterConfig, ClusterError, ClusterResult};
use cluster_domain::{ClusterBackend, MessageStream};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{IntoConnectionInfo, RedisError, Script};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const REFRESH_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Redis 集群后端
///
/// 锁使用 `SET NX PX`，比较后刷新/删除通过 Lua 脚本保证原子性，
/// 广播走 Redis Pub/Sub。
pub struct RedisBackend {
    client: redis::Client,
    conn: ConnectionManager,
    request_timeout: Duration,
    refresh_script: Script,
    delete_script: Script,
}

/// 将 redis 错误映射为集群错误，连接类错误视为可重试
pub(crate) fn map_redis_error(context: &str, err: RedisError) -> ClusterError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        ClusterError::backend(format!("{context}: {err}"))
    } else {
        ClusterError::internal(format!("{context}: {err}"))
    }
}

/// 根据集群配置构造 redis 客户端，配置中的用户名密码覆盖URL中的值
pub(crate) fn build_client(config: &ClusterConfig) -> ClusterResult<redis::Client> {
    let endpoint = config
        .effective_endpoints()
        .into_iter()
        .next()
        .ok_or_else(|| ClusterError::config_error("Redis 后端缺少 endpoints"))?;

    let mut info = endpoint
        .as_str()
        .into_connection_info()
        .map_err(|e| ClusterError::config_error(format!("无效的Redis地址 {endpoint}: {e}")))?;
    if let Some(username) = &config.username {
        info.redis.username = Some(username.clone());
    }
    if let Some(password) = &config.password {
        info.redis.password = Some(password.clone());
    }

    redis::Client::open(info).map_err(|e| map_redis_error("创建Redis客户端失败", e))
}

/// 建立连接管理器并执行PING
pub(crate) async fn connect_manager(
    client: &redis::Client,
    connect_timeout: Duration,
) -> ClusterResult<ConnectionManager> {
    let mut conn = tokio::time::timeout(connect_timeout, client.get_connection_manager())
        .await
        .map_err(|_| ClusterError::backend("连接Redis超时"))?
        .map_err(|e| map_redis_error("连接Redis失败", e))?;

    let _: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(|e| map_redis_error("Redis PING失败", e))?;

    Ok(conn)
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// SCAN MATCH 使用glob语法，前缀中的通配字符需要转义
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('*');
    escaped
}

impl RedisBackend {
    pub async fn connect(config: &ClusterConfig) -> ClusterResult<Self> {
        let client = build_client(config)?;
        let conn = connect_manager(&client, config.connect_timeout()).await?;

        info!("已连接Redis集群后端");

        Ok(Self {
            client,
            conn,
            request_timeout: config.request_timeout(),
            refresh_script: Script::new(REFRESH_SCRIPT),
            delete_script: Script::new(DELETE_SCRIPT),
        })
    }

    async fn run<T, Fut>(&self, context: &str, fut: Fut) -> ClusterResult<T>
    where
        Fut: Future<Output = Result<T, RedisError>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result.map_err(|e| map_redis_error(context, e)),
            Err(_) => Err(ClusterError::Timeout(format!("Redis {context}"))),
        }
    }
}

#[async_trait]
impl ClusterBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> ClusterResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = self
            .run(
                "SET NX",
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_refresh(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> ClusterResult<bool> {
        let mut conn = self.conn.clone();
        let refreshed: i64 = self
            .run(
                "刷新锁",
                self.refresh_script
                    .key(key)
                    .arg(expected)
                    .arg(ttl_millis(ttl))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(refreshed == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> ClusterResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .run(
                "释放锁",
                self.delete_script
                    .key(key)
                    .arg(expected)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(deleted == 1)
    }

    async fn get(&self, key: &str) -> ClusterResult<Option<String>> {
        let mut conn = self.conn.clone();
        self.run("GET", redis::cmd("GET").arg(key).query_async(&mut conn))
            .await
    }

    async fn put_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> ClusterResult<()> {
        let mut conn = self.conn.clone();
        let _: () = self
            .run(
                "SET PX",
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> ClusterResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .run("DEL", redis::cmd("DEL").arg(key).query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> ClusterResult<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        let pattern = escape_glob(prefix);
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next_cursor, batch): (u64, Vec<String>) = self
                .run(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(200)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(batch);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }

        if keys.is_empty() {
            return Ok(Vec::new());
        }
        keys.sort();
        keys.dedup();

        let mut items = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(100) {
            let values: Vec<Option<String>> = self
                .run("MGET", redis::cmd("MGET").arg(chunk).query_async(&mut conn))
                .await?;
            // SCAN 与 MGET 之间过期的键会返回 nil
            items.extend(
                chunk
                    .iter()
                    .zip(values)
                    .filter_map(|(k, v)| v.map(|v| (k.clone(), v))),
            );
        }
        Ok(items)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> ClusterResult<()> {
        let mut conn = self.conn.clone();
        let receivers: i64 = self
            .run(
                "PUBLISH",
                redis::cmd("PUBLISH")
                    .arg(channel)
                    .arg(payload)
                    .query_async(&mut conn),
            )
            .await?;
        debug!("消息已发布到 {}，接收者 {} 个", channel, receivers);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> ClusterResult<MessageStream> {
        let mut pubsub = tokio::time::timeout(self.request_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| ClusterError::Timeout("Redis 订阅连接".to_string()))?
            .map_err(|e| map_redis_error("建立Redis订阅连接失败", e))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| map_redis_error("SUBSCRIBE", e))?;

        let (tx, rx) = mpsc::channel(1024);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                if tx.send(msg.get_payload_bytes().to_vec()).await.is_err() {
                    break;
                }
            }
            warn!("Redis 频道 {} 的订阅已结束", channel);
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("cluster/nodes/"), "cluster/nodes/*");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]*");
    }

    #[test]
    fn test_build_client_rejects_bad_url() {
        let config = ClusterConfig::new(cluster_core::BackendKind::Redis)
            .with_endpoints(["not a url"]);
        assert!(build_client(&config).is_err());
    }

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }
}
