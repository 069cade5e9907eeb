pub mod backends;
pub mod cluster;
pub mod factory;
pub mod stores;

pub use backends::*;
pub use cluster::BackendCluster;
pub use factory::ClusterFactory;
pub use stores::{InMemoryJobStore, InMemoryTaskStore, RedisJobStore};

/// 单节点模式使用的集群实现
pub type LocalCluster = BackendCluster<MemoryBackend>;
