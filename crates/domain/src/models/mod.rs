pub mod job;
pub mod lock;
pub mod message;
pub mod node;
pub mod serde_helpers;
pub mod stats;
pub mod task;
pub mod work;

pub use job::{Job, JobContext, JobHandler, JobStatus, Reservation};
pub use lock::{new_lock_token, token_holder, Lock};
pub use message::{message_types, ClusterMessage};
pub use node::{Node, NodeRole, NodeStatus};
pub use stats::{DistributedStats, PoolStats, PoolStatus, QueueCounts, QueueStats, SchedulerStats};
pub use task::{Task, TaskContext, TaskHandler, TaskInfo, TaskRuntime};
pub use work::WorkUnit;
