use chrono::{DateTime, Utc};
use cluster_core::ClusterResult;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::serde_helpers::base64_bytes;

/// 集群内置的控制消息类型
pub mod message_types {
    pub const LEADER_ELECTED: &str = "leader.elected";
    pub const LEADER_DEPOSED: &str = "leader.deposed";
    pub const NODE_JOINED: &str = "node.joined";
    pub const NODE_OFFLINE: &str = "node.offline";
}

/// 集群广播消息
///
/// 线上格式为 `{type, node_id, timestamp, data}`，`data` 为base64编码的不透明负载。
/// 消息可能重复或乱序到达，处理函数必须幂等。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "base64_bytes", default)]
    pub data: Vec<u8>,
}

impl ClusterMessage {
    pub fn new(
        message_type: impl Into<String>,
        node_id: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            node_id: node_id.into(),
            timestamp: Utc::now(),
            data: data.into(),
        }
    }

    /// 以JSON编码负载
    pub fn json<T: Serialize>(
        message_type: impl Into<String>,
        node_id: impl Into<String>,
        payload: &T,
    ) -> ClusterResult<Self> {
        Ok(Self::new(message_type, node_id, serde_json::to_vec(payload)?))
    }

    pub fn decode_data<T: DeserializeOwned>(&self) -> ClusterResult<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    pub fn is_from(&self, node_id: &str) -> bool {
        self.node_id == node_id
    }

    pub fn to_bytes(&self) -> ClusterResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ClusterResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let msg = ClusterMessage::new(message_types::LEADER_ELECTED, "node-1", b"hi".to_vec());
        let value: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();

        assert_eq!(value["type"], "leader.elected");
        assert_eq!(value["node_id"], "node-1");
        assert_eq!(value["data"], "aGk=");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_json_payload() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Offline {
            node: String,
        }

        let msg = ClusterMessage::json(
            message_types::NODE_OFFLINE,
            "leader",
            &Offline { node: "n2".into() },
        )
        .unwrap();
        let decoded = ClusterMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(
            decoded.decode_data::<Offline>().unwrap(),
            Offline { node: "n2".into() }
        );
    }

    #[test]
    fn test_invalid_envelope() {
        assert!(ClusterMessage::from_bytes(b"not json").is_err());
    }
}
