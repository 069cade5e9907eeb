//! 任务与作业存储实现

pub mod memory_job_store;
pub mod memory_task_store;
pub mod redis_job_store;

pub use memory_job_store::InMemoryJobStore;
pub use memory_task_store::InMemoryTaskStore;
pub use redis_job_store::RedisJobStore;
