use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cluster_core::ClusterResult;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::serde_helpers::{base64_bytes, duration_ms};
use super::work::WorkUnit;

/// 作业状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Delayed,
    Reserved,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Delayed => "delayed",
            JobStatus::Reserved => "reserved",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// 一次预留的标识：预留者加上第几次尝试
///
/// 每次预留都会增加尝试次数，同一作业的两次预留不会有相同的标识。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub worker: String,
    pub attempt: u32,
}

/// 队列作业
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub queue: String,
    /// 数值越大越先被取出
    pub priority: i32,
    #[serde(with = "duration_ms")]
    pub delay: Duration,
    pub max_attempts: u32,
    pub attempts: u32,
    /// 预留超时，超时未确认的作业会重新变为可见；为零时不限时，也不会被回收
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub tags: HashMap<String, String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub reserved_by: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 入队顺序，由存储分配
    pub sequence: u64,
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(payload: impl Into<Vec<u8>>, queue: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload: payload.into(),
            queue: queue.into(),
            priority: 0,
            delay: Duration::ZERO,
            max_attempts: 3,
            attempts: 0,
            timeout: Duration::from_secs(60),
            tags: HashMap::new(),
            status: JobStatus::Pending,
            created_at: now,
            available_at: now,
            reserved_at: None,
            reserved_by: None,
            finished_at: None,
            sequence: 0,
            last_error: None,
        }
    }

    /// 以JSON编码负载创建作业
    pub fn json<T: Serialize>(value: &T, queue: impl Into<String>) -> ClusterResult<Self> {
        Ok(Self::new(serde_json::to_vec(value)?, queue))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn payload_json<T: DeserializeOwned>(&self) -> ClusterResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// 入队时由存储调用：分配序号并根据延迟计算可见时间
    pub fn prepare_enqueue(&mut self, sequence: u64, now: DateTime<Utc>) {
        self.sequence = sequence;
        self.attempts = 0;
        self.reserved_at = None;
        self.reserved_by = None;
        self.finished_at = None;
        self.last_error = None;
        self.make_available_after(self.delay, now);
    }

    /// 设置下一次可见时间，并据此切换 pending/delayed
    pub fn make_available_after(&mut self, delay: Duration, now: DateTime<Utc>) {
        self.available_at = now + to_chrono(delay);
        self.status = if delay.is_zero() {
            JobStatus::Pending
        } else {
            JobStatus::Delayed
        };
        self.reserved_at = None;
        self.reserved_by = None;
    }

    pub fn mark_reserved(&mut self, worker: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Reserved;
        self.attempts = self.attempts.saturating_add(1);
        self.reserved_at = Some(now);
        self.reserved_by = Some(worker.to_string());
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(now);
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.finished_at = Some(now);
        self.last_error = Some(error.into());
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Delayed) && self.available_at <= now
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// 预留截止时间，未预留或不限时为 `None`
    pub fn reservation_deadline(&self) -> Option<DateTime<Utc>> {
        if self.timeout.is_zero() {
            return None;
        }
        self.reserved_at.map(|at| at + to_chrono(self.timeout))
    }

    /// 当前有效的预留
    pub fn reservation(&self) -> Option<Reservation> {
        if self.status != JobStatus::Reserved {
            return None;
        }
        self.reserved_by.as_ref().map(|worker| Reservation {
            worker: worker.clone(),
            attempt: self.attempts,
        })
    }

    /// 作业是否仍处于 `fence` 对应的那次预留中；`None` 只要求处于预留状态
    pub fn is_held_by(&self, fence: Option<&Reservation>) -> bool {
        if self.status != JobStatus::Reserved {
            return false;
        }
        match fence {
            None => true,
            Some(fence) => {
                self.attempts == fence.attempt
                    && self.reserved_by.as_deref() == Some(fence.worker.as_str())
            }
        }
    }
}

impl WorkUnit for Job {
    fn id(&self) -> &str {
        &self.id
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// 作业执行上下文
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: Job,
    pub node_id: String,
    pub cancel: CancellationToken,
}

/// 队列作业处理函数
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> ClusterResult<()>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = ClusterResult<()>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> ClusterResult<()> {
        (self)(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let job = Job::new(b"hello".to_vec(), "emails")
            .with_priority(5)
            .with_max_attempts(0)
            .with_tag("tenant", "acme");

        assert_eq!(job.queue, "emails");
        assert_eq!(job.priority, 5);
        assert_eq!(job.max_attempts, 1);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.id.is_empty());
    }

    #[test]
    fn test_delay_eligibility() {
        let now = Utc::now();
        let mut job = Job::new(Vec::new(), "q").with_delay(Duration::from_secs(2));
        job.prepare_enqueue(1, now);

        assert_eq!(job.status, JobStatus::Delayed);
        assert!(!job.is_eligible(now));
        assert!(job.is_eligible(now + chrono::Duration::seconds(2)));
    }

    #[test]
    fn test_reservation_lifecycle() {
        let now = Utc::now();
        let mut job = Job::new(Vec::new(), "q")
            .with_max_attempts(2)
            .with_timeout(Duration::from_secs(10));
        job.prepare_enqueue(7, now);
        job.mark_reserved("node-1", now);

        assert_eq!(job.attempts, 1);
        assert!(!job.is_eligible(now));
        assert_eq!(
            job.reservation_deadline(),
            Some(now + chrono::Duration::seconds(10))
        );

        job.make_available_after(Duration::ZERO, now);
        job.mark_reserved("node-2", now);
        assert!(job.attempts_exhausted());

        job.mark_failed("boom", now);
        assert!(job.status.is_terminal());
        assert!(!job.is_eligible(now));
    }

    #[test]
    fn test_zero_timeout_has_no_deadline() {
        let now = Utc::now();
        let mut job = Job::new(Vec::new(), "q").with_timeout(Duration::ZERO);
        job.prepare_enqueue(1, now);
        job.mark_reserved("node-1", now);
        assert_eq!(job.reservation_deadline(), None);
    }

    #[test]
    fn test_stale_reservation_is_not_held() {
        let now = Utc::now();
        let mut job = Job::new(Vec::new(), "q");
        job.prepare_enqueue(1, now);
        assert_eq!(job.reservation(), None);

        job.mark_reserved("node-1", now);
        let first = job.reservation().unwrap();
        assert!(job.is_held_by(Some(&first)));
        assert!(job.is_held_by(None));

        job.make_available_after(Duration::ZERO, now);
        job.mark_reserved("node-1", now);
        assert!(!job.is_held_by(Some(&first)));
        assert!(job.is_held_by(job.reservation().as_ref()));

        job.mark_completed(now);
        assert!(!job.is_held_by(None));
    }

    #[test]
    fn test_json_roundtrip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Email {
            to: String,
        }

        let job = Job::json(&Email { to: "a@b.c".into() }, "emails").unwrap();
        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, job);
        assert_eq!(
            decoded.payload_json::<Email>().unwrap(),
            Email { to: "a@b.c".into() }
        );
    }
}
