use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cluster_core::{ClusterConfig, ClusterError, ClusterResult};
use cluster_domain::{ClusterBackend, MessageStream};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Consul 会话TTL的下限
const MIN_SESSION_TTL: Duration = Duration::from_secs(10);
/// 事件列表阻塞查询的等待时间
const EVENT_WAIT: &str = "5s";

/// Consul 后端
///
/// 每个带TTL的键绑定一个 `Behavior=delete` 的会话：获取锁用 `?acquire=`，
/// 续期用 `session/renew`，会话失效后 Consul 自动删除键。
/// Consul 会话TTL不小于10秒，且可能在TTL的两倍时间后才失效。
/// 广播使用原生的用户事件 `/v1/event/fire`。
pub struct ConsulBackend {
    inner: Arc<ConsulClient>,
    /// 键 -> 会话ID
    sessions: Mutex<HashMap<String, String>>,
}

struct ConsulClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    key: String,
    value: Option<String>,
    modify_index: u64,
    session: Option<String>,
}

impl KvEntry {
    fn decoded_value(&self) -> ClusterResult<String> {
        let Some(encoded) = &self.value else {
            return Ok(String::new());
        };
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| ClusterError::Serialization(format!("Consul base64解码失败: {e}")))?;
        String::from_utf8(bytes)
            .map_err(|e| ClusterError::Serialization(format!("Consul 值不是UTF-8: {e}")))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UserEvent {
    #[serde(rename = "ID")]
    id: String,
    payload: Option<String>,
}

/// Consul 事件名只允许有限字符
fn event_name(channel: &str) -> String {
    channel
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

fn session_ttl(ttl: Duration) -> String {
    format!("{}s", ttl.max(MIN_SESSION_TTL).as_secs())
}

impl ConsulClient {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, url);
        if let Some(token) = &self.token {
            request = request.header("X-Consul-Token", token);
        }
        request
    }

    async fn send(&self, request: RequestBuilder, context: &str) -> ClusterResult<reqwest::Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ClusterError::Timeout(format!("Consul {context}"))
            } else {
                ClusterError::backend(format!("Consul {context} 请求失败: {e}"))
            }
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ClusterError::backend(format!(
                "Consul {context} 返回 {status}"
            )));
        }
        Ok(response)
    }

    async fn ensure_success(response: reqwest::Response, context: &str) -> ClusterResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(ClusterError::internal(format!(
            "Consul {context} 失败 ({status}): {text}"
        )))
    }

    async fn bool_response(&self, request: RequestBuilder, context: &str) -> ClusterResult<bool> {
        let response = self.send(request, context).await?;
        let response = Self::ensure_success(response, context).await?;
        response
            .json::<bool>()
            .await
            .map_err(|e| ClusterError::backend(format!("Consul {context} 响应解析失败: {e}")))
    }

    async fn create_session(&self, ttl: Duration) -> ClusterResult<String> {
        let body = json!({
            "Name": "cluster-coordination",
            "TTL": session_ttl(ttl),
            "Behavior": "delete",
            "LockDelay": "0s"
        });
        let response = self
            .send(
                self.request(Method::PUT, "/v1/session/create").json(&body),
                "创建会话",
            )
            .await?;
        let response = Self::ensure_success(response, "创建会话").await?;
        let created: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ClusterError::backend(format!("Consul 会话响应解析失败: {e}")))?;
        created["ID"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ClusterError::internal("Consul 会话响应缺少ID"))
    }

    /// 续期会话，会话已不存在时返回 `false`
    async fn renew_session(&self, session: &str) -> ClusterResult<bool> {
        let response = self
            .send(
                self.request(Method::PUT, &format!("/v1/session/renew/{session}")),
                "续期会话",
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::ensure_success(response, "续期会话").await?;
        Ok(true)
    }

    async fn destroy_session(&self, session: &str) {
        let request = self.request(Method::PUT, &format!("/v1/session/destroy/{session}"));
        if let Err(e) = self.send(request, "销毁会话").await {
            debug!("销毁Consul会话 {} 失败: {}", session, e);
        }
    }

    async fn acquire(&self, key: &str, value: &str, session: &str) -> ClusterResult<bool> {
        let request = self
            .request(Method::PUT, &format!("/v1/kv/{key}"))
            .query(&[("acquire", session)])
            .body(value.to_string());
        self.bool_response(request, "acquire").await
    }

    async fn read(&self, key: &str) -> ClusterResult<Option<KvEntry>> {
        let response = self
            .send(self.request(Method::GET, &format!("/v1/kv/{key}")), "读取键")
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::ensure_success(response, "读取键").await?;
        let entries: Vec<KvEntry> = response
            .json()
            .await
            .map_err(|e| ClusterError::backend(format!("Consul KV响应解析失败: {e}")))?;
        Ok(entries.into_iter().next())
    }

    async fn list_events(&self, name: &str, index: u64) -> ClusterResult<(u64, Vec<UserEvent>)> {
        let mut request = self
            .request(Method::GET, "/v1/event/list")
            .query(&[("name", name)]);
        if index > 0 {
            request = request.query(&[("index", index.to_string()), ("wait", EVENT_WAIT.to_string())]);
        }
        let response = self.send(request, "事件列表").await?;
        let next_index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(index);
        let response = Self::ensure_success(response, "事件列表").await?;
        let events: Vec<UserEvent> = response
            .json()
            .await
            .map_err(|e| ClusterError::backend(format!("Consul 事件响应解析失败: {e}")))?;
        Ok((next_index, events))
    }
}

impl ConsulBackend {
    pub async fn connect(config: &ClusterConfig) -> ClusterResult<Self> {
        let base_url = config
            .effective_endpoints()
            .into_iter()
            .next()
            .map(|e| e.trim_end_matches('/').to_string())
            .ok_or_else(|| ClusterError::config_error("Consul 后端缺少 endpoints"))?;

        // 阻塞查询需要比等待时间更长的请求超时
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout().max(Duration::from_secs(10)))
            .build()
            .map_err(|e| ClusterError::internal(format!("创建HTTP客户端失败: {e}")))?;

        let client = ConsulClient {
            http,
            base_url,
            token: config.token.clone().or_else(|| config.password.clone()),
        };

        let response = client
            .send(client.request(Method::GET, "/v1/status/leader"), "状态检查")
            .await?;
        let response = ConsulClient::ensure_success(response, "状态检查").await?;
        let leader = response.text().await.unwrap_or_default();
        info!("已连接Consul集群后端，Raft leader: {}", leader.trim_matches('"'));

        Ok(Self {
            inner: Arc::new(client),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    async fn forget_session(&self, key: &str) {
        if let Some(session) = self.sessions.lock().await.remove(key) {
            self.inner.destroy_session(&session).await;
        }
    }
}

#[async_trait]
impl ClusterBackend for ConsulBackend {
    fn name(&self) -> &'static str {
        "consul"
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> ClusterResult<bool> {
        if let Some(entry) = self.inner.read(key).await? {
            if entry.session.is_some() {
                return Ok(false);
            }
        }

        let session = self.inner.create_session(ttl).await?;
        match self.inner.acquire(key, value, &session).await {
            Ok(true) => {
                if let Some(old) = self.sessions.lock().await.insert(key.to_string(), session) {
                    self.inner.destroy_session(&old).await;
                }
                Ok(true)
            }
            Ok(false) => {
                self.inner.destroy_session(&session).await;
                Ok(false)
            }
            Err(e) => {
                self.inner.destroy_session(&session).await;
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
        let Some(session) = self.sessions.lock().await.get(key).cloned() else {
            return Ok(false);
        };
        let Some(entry) = self.inner.read(key).await? else {
            self.sessions.lock().await.remove(key);
            return Ok(false);
        };
        if entry.session.as_deref() != Some(session.as_str()) || entry.decoded_value()? != expected
        {
            return Ok(false);
        }

        let renewed = self.inner.renew_session(&session).await?;
        if !renewed {
            self.sessions.lock().await.remove(key);
        }
        Ok(renewed)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> ClusterResult<bool> {
        let Some(entry) = self.inner.read(key).await? else {
            return Ok(false);
        };
        if entry.decoded_value()? != expected {
            return Ok(false);
        }

        let request = self
            .inner
            .request(Method::DELETE, &format!("/v1/kv/{key}"))
            .query(&[("cas", entry.modify_index.to_string())]);
        let deleted = self.inner.bool_response(request, "cas删除").await?;
        if deleted {
            self.forget_session(key).await;
        }
        Ok(deleted)
    }

    async fn get(&self, key: &str) -> ClusterResult<Option<String>> {
        match self.inner.read(key).await? {
            Some(entry) => Ok(Some(entry.decoded_value()?)),
            None => Ok(None),
        }
    }

    async fn put_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> ClusterResult<()> {
        let existing = self.sessions.lock().await.get(key).cloned();
        let session = match existing {
            Some(session) if self.inner.renew_session(&session).await? => session,
            _ => {
                let session = self.inner.create_session(ttl).await?;
                self.sessions
                    .lock()
                    .await
                    .insert(key.to_string(), session.clone());
                session
            }
        };

        if !self.inner.acquire(key, value, &session).await? {
            warn!("Consul 键 {} 被其他会话占用，无法写入", key);
            return Err(ClusterError::backend(format!("Consul 键 {key} 被其他会话占用")));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> ClusterResult<()> {
        let response = self
            .inner
            .send(self.inner.request(Method::DELETE, &format!("/v1/kv/{key}")), "删除键")
            .await?;
        ConsulClient::ensure_success(response, "删除键").await?;
        self.forget_session(key).await;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> ClusterResult<Vec<(String, String)>> {
        let request = self
            .inner
            .request(Method::GET, &format!("/v1/kv/{prefix}"))
            .query(&[("recurse", "true")]);
        let response = self.inner.send(request, "列出前缀").await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = ConsulClient::ensure_success(response, "列出前缀").await?;
        let entries: Vec<KvEntry> = response
            .json()
            .await
            .map_err(|e| ClusterError::backend(format!("Consul KV响应解析失败: {e}")))?;

        entries
            .iter()
            .map(|entry| Ok((entry.key.clone(), entry.decoded_value()?)))
            .collect()
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> ClusterResult<()> {
        let name = event_name(channel);
        let request = self
            .inner
            .request(Method::PUT, &format!("/v1/event/fire/{name}"))
            .body(payload);
        let response = self.inner.send(request, "发布事件").await?;
        ConsulClient::ensure_success(response, "发布事件").await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> ClusterResult<MessageStream> {
        let name = event_name(channel);
        // 订阅前已存在的事件不投递
        let (mut index, existing) = self.inner.list_events(&name, 0).await?;
        let mut seen: HashSet<String> = existing.into_iter().map(|e| e.id).collect();

        let (tx, rx) = mpsc::channel(1024);
        let client = Arc::clone(&self.inner);

        tokio::spawn(async move {
            loop {
                if tx.is_closed() {
                    break;
                }
                let (next_index, events) = match client.list_events(&name, index.max(1)).await {
                    Ok(result) => result,
                    Err(e) => {
                        debug!("拉取Consul事件失败: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                // 索引回退说明Consul重启，重新开始阻塞查询
                index = if next_index < index { 0 } else { next_index };

                let mut current = HashSet::with_capacity(events.len());
                for event in events {
                    current.insert(event.id.clone());
                    if seen.contains(&event.id) {
                        continue;
                    }
                    let payload = match event.payload.as_deref().map(|p| STANDARD.decode(p)) {
                        Some(Ok(bytes)) => bytes,
                        Some(Err(e)) => {
                            warn!("丢弃无法解码的Consul事件 {}: {}", event.id, e);
                            continue;
                        }
                        None => Vec::new(),
                    };
                    if tx.send(payload).await.is_err() {
                        return;
                    }
                }
                // Consul 只保留最近的事件，已见集合随之收缩
                seen = current;
            }
        });

        Ok(rx)
    }

    async fn close(&self) -> ClusterResult<()> {
        let sessions: Vec<String> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            self.inner.destroy_session(&session).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_sanitized() {
        assert_eq!(event_name("cluster/events"), "cluster-events");
        assert_eq!(event_name("prod_v2/events"), "prod_v2-events");
    }

    #[test]
    fn test_session_ttl_has_floor() {
        assert_eq!(session_ttl(Duration::from_secs(5)), "10s");
        assert_eq!(session_ttl(Duration::from_secs(30)), "30s");
    }

    #[test]
    fn test_kv_entry_decoding() {
        let raw = r#"[{"Key":"cluster/locks/leader","Value":"bm9kZS0xOmFiYw==","ModifyIndex":42,"Session":"s-1","Flags":0}]"#;
        let entries: Vec<KvEntry> = serde_json::from_str(raw).unwrap();
        assert_eq!(entries[0].decoded_value().unwrap(), "node-1:abc");
        assert_eq!(entries[0].modify_index, 42);
        assert_eq!(entries[0].session.as_deref(), Some("s-1"));

        let raw = r#"[{"Key":"k","Value":null,"ModifyIndex":1}]"#;
        let entries: Vec<KvEntry> = serde_json::from_str(raw).unwrap();
        assert_eq!(entries[0].decoded_value().unwrap(), "");
    }
}
