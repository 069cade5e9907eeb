pub mod config;
pub mod errors;
pub mod logging;
pub mod retry;

pub use config::*;
pub use errors::{ClusterError, ClusterResult};
pub use logging::{init_logging, LogConfig, LogLevel, OutputFormat};
pub use retry::{retry_with_backoff, BackoffStrategy, RetryPolicy};
