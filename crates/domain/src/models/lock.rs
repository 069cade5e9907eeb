use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 分布式锁
///
/// `token` 形如 `<node_id>:<uuid>`，作为fencing token：
/// 只有持有相同token的实例才能续期或释放锁。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub key: String,
    pub holder: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    pub fn new(key: impl Into<String>, token: impl Into<String>, ttl: std::time::Duration) -> Self {
        let token = token.into();
        Self {
            key: key.into(),
            holder: token_holder(&token).to_string(),
            token,
            expires_at: Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// 为节点生成新的锁token
pub fn new_lock_token(node_id: &str) -> String {
    format!("{}:{}", node_id, uuid::Uuid::new_v4())
}

/// 从token中解析持有者节点ID（最后一个 `:` 之前的部分）
pub fn token_holder(token: &str) -> &str {
    token.rsplit_once(':').map(|(holder, _)| holder).unwrap_or(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_token_holder() {
        let token = new_lock_token("node-1");
        assert!(token.starts_with("node-1:"));
        assert_eq!(token_holder(&token), "node-1");

        // 节点ID本身包含冒号时仍取最后一段之前的内容
        assert_eq!(token_holder("10.0.0.1:8080:abc"), "10.0.0.1:8080");
        assert_eq!(token_holder("legacy"), "legacy");
    }

    #[test]
    fn test_lock_expiry() {
        let lock = Lock::new("leader", new_lock_token("n1"), Duration::from_secs(5));
        assert_eq!(lock.holder, "n1");
        assert!(!lock.is_expired());

        let expired = Lock::new("leader", new_lock_token("n1"), Duration::ZERO);
        assert!(expired.is_expired());
    }
}
