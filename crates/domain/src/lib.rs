pub mod cluster;
pub mod models;
pub mod stores;

pub use cluster::{Cluster, ClusterBackend, MessageHandler, MessageStream};
pub use cluster_core::{ClusterError, ClusterResult};
pub use models::*;
pub use stores::{JobStore, ReapOutcome, TaskStore};
