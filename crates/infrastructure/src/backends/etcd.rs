use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cluster_core::{ClusterConfig, ClusterError, ClusterResult};
use cluster_domain::{ClusterBackend, MessageStream};
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// 事件键的保留时间
const EVENT_TTL: Duration = Duration::from_secs(60);
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// etcd v3 后端，通过 gRPC-gateway 的 JSON 接口访问
///
/// 锁和存活键绑定租约；续期使用租约 keepalive，因此续期后的TTL等于获取时的TTL。
/// etcd 没有原生的发布订阅，广播写入带租约的事件键，订阅方按 mod_revision 轮询。
pub struct EtcdBackend {
    inner: Arc<EtcdClient>,
}

struct EtcdClient {
    http: reqwest::Client,
    endpoints: Vec<String>,
    current: AtomicUsize,
    token: RwLock<Option<String>>,
    username: Option<String>,
    password: Option<String>,
}

fn b64(data: impl AsRef<[u8]>) -> String {
    STANDARD.encode(data)
}

fn decode_b64(value: &Value) -> ClusterResult<Vec<u8>> {
    match value.as_str() {
        Some(s) => STANDARD
            .decode(s)
            .map_err(|e| ClusterError::Serialization(format!("etcd base64解码失败: {e}"))),
        None => Ok(Vec::new()),
    }
}

fn decode_string(value: &Value) -> ClusterResult<String> {
    String::from_utf8(decode_b64(value)?)
        .map_err(|e| ClusterError::Serialization(format!("etcd 值不是UTF-8: {e}")))
}

/// gateway 将 int64 编码为字符串
fn parse_i64(value: &Value) -> i64 {
    match value {
        Value::String(s) => s.parse().unwrap_or(0),
        Value::Number(n) => n.as_i64().unwrap_or(0),
        _ => 0,
    }
}

/// 前缀查询的 range_end：最后一个非0xff字节加一
fn prefix_range_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}

impl EtcdClient {
    fn endpoint(&self) -> &str {
        let idx = self.current.load(Ordering::Relaxed) % self.endpoints.len();
        &self.endpoints[idx]
    }

    fn rotate(&self) {
        if self.endpoints.len() > 1 {
            self.current.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn authenticate(&self) -> ClusterResult<()> {
        let (Some(name), Some(password)) = (&self.username, &self.password) else {
            return Ok(());
        };
        let url = format!("{}/v3/auth/authenticate", self.endpoint());
        let response = self
            .http
            .post(&url)
            .json(&json!({ "name": name, "password": password }))
            .send()
            .await
            .map_err(|e| ClusterError::backend(format!("etcd 认证请求失败: {e}")))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ClusterError::backend(format!("etcd 认证响应无效: {e}")))?;
        let token = body["token"]
            .as_str()
            .ok_or_else(|| ClusterError::config_error("etcd 认证失败：响应中没有token"))?;
        *self.token.write().await = Some(token.to_string());
        Ok(())
    }

    async fn post(&self, path: &str, body: Value) -> ClusterResult<Value> {
        let url = format!("{}{}", self.endpoint(), path);
        let mut request = self.http.post(&url).json(&body);
        if let Some(token) = self.token.read().await.as_ref() {
            request = request.header("Authorization", token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.rotate();
                return Err(if e.is_timeout() {
                    ClusterError::Timeout(format!("etcd {path}"))
                } else {
                    ClusterError::backend(format!("etcd 请求失败 {url}: {e}"))
                });
            }
        };

        let status = response.status();
        if status.is_server_error() {
            self.rotate();
            return Err(ClusterError::backend(format!("etcd 返回 {status}: {path}")));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED && self.username.is_some() {
            // token 过期，重新认证后交给上层重试
            self.authenticate().await?;
            return Err(ClusterError::backend("etcd token 已过期，已重新认证"));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ClusterError::internal(format!(
                "etcd 请求 {path} 失败 ({status}): {text}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ClusterError::backend(format!("etcd 响应解析失败: {e}")))
    }

    async fn grant_lease(&self, ttl: Duration) -> ClusterResult<i64> {
        let ttl_secs = ttl.as_secs().max(1);
        let body = self
            .post("/v3/lease/grant", json!({ "TTL": ttl_secs.to_string() }))
            .await?;
        let id = parse_i64(&body["ID"]);
        if id == 0 {
            return Err(ClusterError::internal("etcd 租约创建失败"));
        }
        Ok(id)
    }

    async fn revoke_lease(&self, lease: i64) {
        if let Err(e) = self
            .post("/v3/lease/revoke", json!({ "ID": lease.to_string() }))
            .await
        {
            debug!("撤销etcd租约 {} 失败: {}", lease, e);
        }
    }

    async fn range(&self, body: Value) -> ClusterResult<(i64, Vec<Value>)> {
        let response = self.post("/v3/kv/range", body).await?;
        let revision = parse_i64(&response["header"]["revision"]);
        let kvs = response["kvs"].as_array().cloned().unwrap_or_default();
        Ok((revision, kvs))
    }

    async fn range_key(&self, key: &str) -> ClusterResult<Option<Value>> {
        let (_, kvs) = self.range(json!({ "key": b64(key) })).await?;
        Ok(kvs.into_iter().next())
    }

    async fn put(&self, key: &str, value: &[u8], lease: i64) -> ClusterResult<()> {
        self.post(
            "/v3/kv/put",
            json!({ "key": b64(key), "value": b64(value), "lease": lease.to_string() }),
        )
        .await?;
        Ok(())
    }

    async fn txn(&self, body: Value) -> ClusterResult<bool> {
        let response = self.post("/v3/kv/txn", body).await?;
        Ok(response["succeeded"].as_bool().unwrap_or(false))
    }
}

impl EtcdBackend {
    pub async fn connect(config: &ClusterConfig) -> ClusterResult<Self> {
        let endpoints: Vec<String> = config
            .effective_endpoints()
            .into_iter()
            .map(|e| e.trim_end_matches('/').to_string())
            .collect();
        if endpoints.is_empty() {
            return Err(ClusterError::config_error("etcd 后端缺少 endpoints"));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ClusterError::internal(format!("创建HTTP客户端失败: {e}")))?;

        let client = EtcdClient {
            http,
            endpoints,
            current: AtomicUsize::new(0),
            token: RwLock::new(config.token.clone()),
            username: config.username.clone(),
            password: config.password.clone(),
        };

        if config.token.is_none() {
            client.authenticate().await?;
        }

        // 依次探测可用节点
        let mut last_error = None;
        for _ in 0..client.endpoints.len() {
            match client.post("/v3/maintenance/status", json!({})).await {
                Ok(_) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    warn!("etcd 节点 {} 不可用: {}", client.endpoint(), e);
                    last_error = Some(e);
                }
            }
        }
        if let Some(e) = last_error {
            return Err(e);
        }

        info!("已连接etcd集群后端: {}", client.endpoint());
        Ok(Self {
            inner: Arc::new(client),
        })
    }
}

#[async_trait]
impl ClusterBackend for EtcdBackend {
    fn name(&self) -> &'static str {
        "etcd"
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> ClusterResult<bool> {
        let lease = self.inner.grant_lease(ttl).await?;
        let succeeded = self
            .inner
            .txn(json!({
                "compare": [{
                    "key": b64(key),
                    "result": "EQUAL",
                    "target": "CREATE",
                    "create_revision": "0"
                }],
                "success": [{
                    "request_put": {
                        "key": b64(key),
                        "value": b64(value),
                        "lease": lease.to_string()
                    }
                }],
                "failure": []
            }))
            .await;

        match succeeded {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.inner.revoke_lease(lease).await;
                Ok(false)
            }
            Err(e) => {
                self.inner.revoke_lease(lease).await;
                Err(e)
            }
        }
    }

    async fn compare_and_refresh(
        &self,
        key: &str,
        expected: &str,
        _ttl: Duration,
    ) -> ClusterResult<bool> {
        let Some(kv) = self.inner.range_key(key).await? else {
            return Ok(false);
        };
        if decode_string(&kv["value"])? != expected {
            return Ok(false);
        }
        let lease = parse_i64(&kv["lease"]);
        if lease == 0 {
            return Ok(false);
        }

        // 租约仍存活即说明键仍属于我们
        let response = self
            .inner
            .post("/v3/lease/keepalive", json!({ "ID": lease.to_string() }))
            .await?;
        let remaining = parse_i64(&response["result"]["TTL"]);
        Ok(remaining > 0)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> ClusterResult<bool> {
        self.inner
            .txn(json!({
                "compare": [{
                    "key": b64(key),
                    "result": "EQUAL",
                    "target": "VALUE",
                    "value": b64(expected)
                }],
                "success": [{ "request_delete_range": { "key": b64(key) } }],
                "failure": []
            }))
            .await
    }

    async fn get(&self, key: &str) -> ClusterResult<Option<String>> {
        match self.inner.range_key(key).await? {
            Some(kv) => Ok(Some(decode_string(&kv["value"])?)),
            None => Ok(None),
        }
    }

    async fn put_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> ClusterResult<()> {
        let lease = self.inner.grant_lease(ttl).await?;
        // 旧租约会自然过期，这里不做撤销
        self.inner.put(key, value.as_bytes(), lease).await
    }

    async fn delete(&self, key: &str) -> ClusterResult<()> {
        self.inner
            .post("/v3/kv/deleterange", json!({ "key": b64(key) }))
            .await?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> ClusterResult<Vec<(String, String)>> {
        let (_, kvs) = self
            .inner
            .range(json!({
                "key": b64(prefix),
                "range_end": b64(prefix_range_end(prefix))
            }))
            .await?;

        kvs.iter()
            .map(|kv| Ok((decode_string(&kv["key"])?, decode_string(&kv["value"])?)))
            .collect()
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> ClusterResult<()> {
        let lease = self.inner.grant_lease(EVENT_TTL).await?;
        let key = format!("{}/{}", channel, uuid::Uuid::new_v4());
        self.inner.put(&key, &payload, lease).await
    }

    async fn subscribe(&self, channel: &str) -> ClusterResult<MessageStream> {
        let prefix = format!("{channel}/");
        // 只投递订阅之后的事件
        let (mut last_revision, _) = self
            .inner
            .range(json!({ "key": b64(&prefix), "range_end": b64(prefix_range_end(&prefix)), "count_only": true }))
            .await?;

        let (tx, rx) = mpsc::channel(1024);
        let client = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EVENT_POLL_INTERVAL);
            loop {
                interval.tick().await;
                if tx.is_closed() {
                    break;
                }

                let result = client
                    .range(json!({
                        "key": b64(&prefix),
                        "range_end": b64(prefix_range_end(&prefix)),
                        "min_mod_revision": (last_revision + 1).to_string(),
                        "sort_order": "ASCEND",
                        "sort_target": "MOD"
                    }))
                    .await;

                let kvs = match result {
                    Ok((_, kvs)) => kvs,
                    Err(e) => {
                        debug!("轮询etcd事件失败: {}", e);
                        continue;
                    }
                };

                for kv in kvs {
                    last_revision = last_revision.max(parse_i64(&kv["mod_revision"]));
                    match decode_b64(&kv["value"]) {
                        Ok(payload) => {
                            if tx.send(payload).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("丢弃无法解码的etcd事件: {}", e),
                    }
                }
            }
        });

        Ok(rx)
    }
}
