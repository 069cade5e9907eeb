use std::sync::Arc;

use cluster_core::{BackendKind, ClusterConfig, ClusterResult};
use cluster_domain::{Cluster, ClusterBackend, JobStore};
use tracing::{debug, info, warn};

use crate::backends::{ConsulBackend, EtcdBackend, RedisBackend};
use crate::cluster::BackendCluster;
use crate::stores::{InMemoryJobStore, RedisJobStore};

pub struct ClusterFactory;

impl ClusterFactory {
    /// 按配置连接集群后端；后端不可达时退化为单节点模式
    pub async fn create(config: &ClusterConfig) -> Arc<dyn Cluster> {
        let node_id = config.resolve_node_id();
        match Self::try_create(config, &node_id).await {
            Ok(cluster) => cluster,
            Err(e) => {
                warn!(
                    "无法连接 {} 集群后端: {}，以单节点模式运行",
                    config.backend, e
                );
                Arc::new(BackendCluster::local(node_id))
            }
        }
    }

    /// 按配置连接集群后端，失败时返回错误
    pub async fn try_create(config: &ClusterConfig, node_id: &str) -> ClusterResult<Arc<dyn Cluster>> {
        config.validate()?;
        debug!("创建集群连接，后端类型: {}", config.backend);

        match config.backend {
            BackendKind::Local => {
                info!("未配置集群后端，以单节点模式运行");
                Ok(Arc::new(BackendCluster::local(node_id)))
            }
            BackendKind::Redis => {
                let backend = RedisBackend::connect(config).await?;
                Ok(Self::wrap(node_id, backend, config))
            }
            BackendKind::Etcd => {
                let backend = EtcdBackend::connect(config).await?;
                Ok(Self::wrap(node_id, backend, config))
            }
            BackendKind::Consul => {
                let backend = ConsulBackend::connect(config).await?;
                Ok(Self::wrap(node_id, backend, config))
            }
            BackendKind::Zookeeper => Self::connect_zookeeper(config, node_id).await,
        }
    }

    /// 选择作业存储
    ///
    /// 启用作业分发、后端为Redis且集群已连接时使用共享的Redis存储，其余情况使用进程内存储。
    pub async fn create_job_store(
        config: &ClusterConfig,
        cluster: &Arc<dyn Cluster>,
        distributed: bool,
    ) -> Arc<dyn JobStore> {
        if !distributed || config.backend != BackendKind::Redis || cluster.is_standalone() {
            debug!("使用进程内作业存储");
            return Arc::new(InMemoryJobStore::new());
        }
        match RedisJobStore::connect(config).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!("无法连接Redis作业存储: {}，作业仅在本节点可见", e);
                Arc::new(InMemoryJobStore::new())
            }
        }
    }

    fn wrap<B: ClusterBackend>(node_id: &str, backend: B, config: &ClusterConfig) -> Arc<dyn Cluster> {
        info!("节点 {} 使用 {} 集群后端", node_id, backend.name());
        Arc::new(BackendCluster::new(node_id, Arc::new(backend), config))
    }

    #[cfg(feature = "zookeeper")]
    async fn connect_zookeeper(
        config: &ClusterConfig,
        node_id: &str,
    ) -> ClusterResult<Arc<dyn Cluster>> {
        let backend = crate::backends::ZookeeperBackend::connect(config).await?;
        Ok(Self::wrap(node_id, backend, config))
    }

    #[cfg(not(feature = "zookeeper"))]
    async fn connect_zookeeper(
        _config: &ClusterConfig,
        _node_id: &str,
    ) -> ClusterResult<Arc<dyn Cluster>> {
        Err(cluster_core::ClusterError::config_error(
            "ZooKeeper 后端未启用，请使用 zookeeper feature 编译",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_backend_is_standalone() {
        let config = ClusterConfig::new(BackendKind::Local).with_node_id("solo");
        let cluster = ClusterFactory::create(&config).await;
        assert!(cluster.is_standalone());
        assert_eq!(cluster.node_id(), "solo");
        assert_eq!(cluster.backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_unreachable_backend_falls_back() {
        let mut config = ClusterConfig::new(BackendKind::Redis)
            .with_endpoints(["redis://127.0.0.1:1"])
            .with_node_id("n1");
        config.connect_timeout_ms = 200;

        let cluster = ClusterFactory::create(&config).await;
        assert!(cluster.is_standalone());
        assert_eq!(cluster.node_id(), "n1");
        assert!(cluster.acquire_lock("k", std::time::Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_job_store_selection() {
        let config = ClusterConfig::new(BackendKind::Redis)
            .with_endpoints(["redis://127.0.0.1:1"])
            .with_node_id("n1");
        let cluster: Arc<dyn Cluster> = Arc::new(BackendCluster::local("n1"));

        // 单节点模式下即使配置了Redis也不共享
        let store = ClusterFactory::create_job_store(&config, &cluster, true).await;
        assert!(!store.is_shared());

        let local = ClusterConfig::new(BackendKind::Local);
        let store = ClusterFactory::create_job_store(&local, &cluster, true).await;
        assert!(!store.is_shared());
    }

    #[tokio::test]
    async fn test_try_create_reports_errors() {
        let config = ClusterConfig::new(BackendKind::Consul)
            .with_endpoints(["http://127.0.0.1:1"])
            .with_node_id("n1");
        assert!(ClusterFactory::try_create(&config, "n1").await.is_err());
    }
}
