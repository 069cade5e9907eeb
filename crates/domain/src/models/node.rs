use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 节点存活状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Suspect,
    Offline,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Suspect => "suspect",
            NodeStatus::Offline => "offline",
        }
    }
}

/// 集群中的节点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub status: NodeStatus,
    pub last_seen: DateTime<Utc>,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: NodeStatus::Online,
            last_seen: Utc::now(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }

    /// 距离上次心跳经过的时间，时钟回拨时视为0
    pub fn silence(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.last_seen).to_std().unwrap_or_default()
    }
}

/// 节点在选举状态机中的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeRole::Follower => "follower",
            NodeRole::Candidate => "candidate",
            NodeRole::Leader => "leader",
        };
        f.write_str(s)
    }
}
