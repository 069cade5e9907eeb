//! 优先级/延迟作业队列引擎
//!
//! 作业按（可见时间、优先级降序、入队顺序升序）出队，预留超时未确认的作业
//! 会被重新投递，保证至少一次执行。

pub mod engine;
pub mod job_source;

pub use engine::QueueEngine;
pub use job_source::{JobCompletedHook, JobFailedHook, QueueJobSource};
