//! 固定槽位的工作池
//!
//! 调度引擎和队列引擎通过实现 [`WorkSource`] 复用同一套执行逻辑：
//! 取工作、带超时执行、失败退避重试、panic 隔离以及停机排空。

pub mod execution;
pub mod pool;
pub mod source;

pub use execution::{execute_guarded, ExecutionOutcome};
pub use pool::{WorkerPool, WorkerPoolConfig};
pub use source::WorkSource;
