//! 集群后端驱动

pub mod consul;
pub mod etcd;
pub mod faulty;
pub mod memory;
pub mod redis;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

pub use self::consul::ConsulBackend;
pub use self::etcd::EtcdBackend;
pub use self::faulty::FaultInjectingBackend;
pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;
#[cfg(feature = "zookeeper")]
pub use self::zookeeper::ZookeeperBackend;
