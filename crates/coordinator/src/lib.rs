//! 集群协调：Leader选举、节点心跳和失效检测

pub mod config;
pub mod coordinator;
pub mod failure_detector;

pub use config::DistributedConfig;
pub use coordinator::Coordinator;
pub use failure_detector::{FailureDetector, FailureDetectorConfig};
