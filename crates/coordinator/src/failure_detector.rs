use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cluster_domain::{Node, NodeStatus};
use tracing::{info, warn};

/// 节点失效检测阈值
#[derive(Debug, Clone)]
pub struct FailureDetectorConfig {
    pub suspect_after: Duration,
    pub offline_after: Duration,
    /// offline 节点从花名册中移除前的保留时间
    pub cleanup_after: Duration,
}

/// 根据存活键推导节点状态
///
/// 存活键过期的节点保留在花名册中，按最后一次心跳时间逐步降级为 suspect / offline，
/// offline 超过清理阈值后移除。
#[derive(Debug)]
pub struct FailureDetector {
    config: FailureDetectorConfig,
    roster: BTreeMap<String, Node>,
}

impl FailureDetector {
    pub fn new(config: FailureDetectorConfig) -> Self {
        Self {
            config,
            roster: BTreeMap::new(),
        }
    }

    fn status_for(&self, silence: Duration) -> NodeStatus {
        if silence >= self.config.offline_after {
            NodeStatus::Offline
        } else if silence >= self.config.suspect_after {
            NodeStatus::Suspect
        } else {
            NodeStatus::Online
        }
    }

    /// 合并一次存活键快照，返回本次新变为 offline 的节点
    pub fn observe(&mut self, live: Vec<Node>, now: DateTime<Utc>) -> Vec<Node> {
        for node in live {
            match self.roster.get_mut(&node.id) {
                Some(known) => {
                    if node.last_seen > known.last_seen {
                        known.last_seen = node.last_seen;
                    }
                }
                None => {
                    info!("发现新节点: {}", node.id);
                    self.roster.insert(node.id.clone(), node);
                }
            }
        }

        let mut newly_offline = Vec::new();
        let mut removed = Vec::new();
        let statuses: Vec<(String, NodeStatus, Duration)> = self
            .roster
            .values()
            .map(|n| {
                let silence = n.silence(now);
                (n.id.clone(), self.status_for(silence), silence)
            })
            .collect();

        for (id, status, silence) in statuses {
            let Some(node) = self.roster.get_mut(&id) else {
                continue;
            };
            if status != node.status {
                match status {
                    NodeStatus::Offline => {
                        warn!("节点 {} 已离线 (上次心跳: {})", id, node.last_seen);
                        newly_offline.push(Node {
                            status,
                            ..node.clone()
                        });
                    }
                    NodeStatus::Suspect => warn!("节点 {} 心跳延迟，标记为suspect", id),
                    NodeStatus::Online => info!("节点 {} 恢复在线", id),
                }
                node.status = status;
            }
            if status == NodeStatus::Offline
                && silence >= self.config.offline_after + self.config.cleanup_after
            {
                removed.push(id);
            }
        }

        for id in removed {
            self.roster.remove(&id);
            info!("清理离线节点 {}", id);
        }
        newly_offline
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.roster.values().cloned().collect()
    }

    pub fn online_count(&self) -> usize {
        self.roster.values().filter(|n| n.is_online()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> FailureDetector {
        FailureDetector::new(FailureDetectorConfig {
            suspect_after: Duration::from_secs(2),
            offline_after: Duration::from_secs(5),
            cleanup_after: Duration::from_secs(60),
        })
    }

    fn seen_at(id: &str, at: DateTime<Utc>) -> Node {
        Node {
            last_seen: at,
            ..Node::new(id)
        }
    }

    #[test]
    fn test_status_progression() {
        let mut detector = detector();
        let t0 = Utc::now();
        detector.observe(vec![seen_at("a", t0), seen_at("b", t0)], t0);
        assert_eq!(detector.online_count(), 2);

        // b 停止心跳
        let t3 = t0 + chrono::Duration::seconds(3);
        assert!(detector.observe(vec![seen_at("a", t3)], t3).is_empty());
        let statuses: Vec<NodeStatus> = detector.nodes().iter().map(|n| n.status).collect();
        assert_eq!(statuses, vec![NodeStatus::Online, NodeStatus::Suspect]);

        let t6 = t0 + chrono::Duration::seconds(6);
        let offline = detector.observe(vec![seen_at("a", t6)], t6);
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].id, "b");
        // 只报告一次
        assert!(detector.observe(vec![seen_at("a", t6)], t6).is_empty());
    }

    #[test]
    fn test_recovery_and_cleanup() {
        let mut detector = detector();
        let t0 = Utc::now();
        detector.observe(vec![seen_at("a", t0)], t0);

        let t10 = t0 + chrono::Duration::seconds(10);
        assert_eq!(detector.observe(Vec::new(), t10).len(), 1);
        detector.observe(vec![seen_at("a", t10)], t10);
        assert!(detector.nodes()[0].is_online());

        let t80 = t10 + chrono::Duration::seconds(70);
        detector.observe(Vec::new(), t80);
        assert!(detector.nodes().is_empty());
    }
}
