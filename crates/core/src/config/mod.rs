pub mod models;

pub use models::{
    generate_node_id, validate_timings, AppConfig, BackendKind, ClusterConfig,
    CoordinationConfig, MetricsConfig, QueueConfig, SchedulerConfig,
};
