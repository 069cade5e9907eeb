use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cluster_core::{ClusterError, ClusterResult};
use cluster_domain::{Job, JobStatus, JobStore, QueueCounts, ReapOutcome, Reservation};
use tokio::sync::Mutex;
use tracing::debug;

type ReadyKey = (Reverse<i32>, u64);
type DelayedKey = (DateTime<Utc>, u64);

#[derive(Debug, Default)]
struct QueueIndex {
    /// 可立即执行：优先级降序、序号升序
    ready: BTreeMap<ReadyKey, String>,
    /// 延迟作业：按可见时间排序
    delayed: BTreeMap<DelayedKey, String>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    queues: HashMap<String, QueueIndex>,
    reserved: BTreeSet<String>,
    next_sequence: u64,
}

impl Inner {
    fn index(&mut self, job: &Job) {
        let queue = self.queues.entry(job.queue.clone()).or_default();
        match job.status {
            JobStatus::Pending => {
                queue
                    .ready
                    .insert((Reverse(job.priority), job.sequence), job.id.clone());
            }
            JobStatus::Delayed => {
                queue
                    .delayed
                    .insert((job.available_at, job.sequence), job.id.clone());
            }
            JobStatus::Reserved => {
                self.reserved.insert(job.id.clone());
            }
            JobStatus::Completed | JobStatus::Failed => {}
        }
    }

    fn unindex(&mut self, job: &Job) {
        if let Some(queue) = self.queues.get_mut(&job.queue) {
            queue.ready.remove(&(Reverse(job.priority), job.sequence));
            queue.delayed.remove(&(job.available_at, job.sequence));
        }
        self.reserved.remove(&job.id);
    }

    fn insert(&mut self, mut job: Job, now: DateTime<Utc>) -> Job {
        if let Some(previous) = self.jobs.remove(&job.id) {
            self.unindex(&previous);
        }
        self.next_sequence += 1;
        job.prepare_enqueue(self.next_sequence, now);
        self.index(&job);
        self.jobs.insert(job.id.clone(), job.clone());
        job
    }

    /// 到期的延迟作业移入就绪集合
    fn promote(&mut self, queue_name: &str, now: DateTime<Utc>) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        let pending = queue.delayed.split_off(&(now, u64::MAX));
        let due = std::mem::replace(&mut queue.delayed, pending);
        for (_, id) in due {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.status = JobStatus::Pending;
                queue
                    .ready
                    .insert((Reverse(job.priority), job.sequence), id);
            }
        }
    }

    /// 修改作业并重建索引
    fn update<F>(&mut self, job_id: &str, f: F) -> ClusterResult<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut job = self
            .jobs
            .remove(job_id)
            .ok_or_else(|| ClusterError::job_not_found(job_id))?;
        self.unindex(&job);
        f(&mut job);
        self.index(&job);
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }
}

/// 进程内作业存储，仅对本节点可见
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn push(&self, job: Job) -> ClusterResult<Job> {
        let now = Utc::now();
        Ok(self.inner.lock().await.insert(job, now))
    }

    async fn push_batch(&self, jobs: Vec<Job>) -> ClusterResult<Vec<Job>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        Ok(jobs.into_iter().map(|job| inner.insert(job, now)).collect())
    }

    async fn reserve(
        &self,
        queue: &str,
        worker: &str,
        now: DateTime<Utc>,
    ) -> ClusterResult<Option<Job>> {
        let mut inner = self.inner.lock().await;
        inner.promote(queue, now);

        let Some((_, id)) = inner
            .queues
            .get_mut(queue)
            .and_then(|q| q.ready.pop_first())
        else {
            return Ok(None);
        };
        inner.reserved.insert(id.clone());

        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| ClusterError::internal(format!("索引中的作业 {id} 不存在")))?;
        job.mark_reserved(worker, now);
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job_id: &str, fence: Option<&Reservation>) -> ClusterResult<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.jobs.get(job_id).is_some_and(|job| job.is_held_by(fence)) {
            return Ok(false);
        }
        inner.update(job_id, |job| job.mark_completed(Utc::now()))?;
        Ok(true)
    }

    async fn release(
        &self,
        job_id: &str,
        fence: Option<&Reservation>,
        delay: Duration,
        error: Option<String>,
    ) -> ClusterResult<bool> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get(job_id)
            .ok_or_else(|| ClusterError::job_not_found(job_id))?;
        if !job.is_held_by(fence) {
            debug!("作业 {} 当前状态为 {}，预留已失效，忽略释放", job_id, job.status.as_str());
            return Ok(false);
        }

        let now = Utc::now();
        inner.update(job_id, |job| {
            job.make_available_after(delay, now);
            if error.is_some() {
                job.last_error = error;
            }
        })?;
        Ok(true)
    }

    async fn fail(
        &self,
        job_id: &str,
        fence: Option<&Reservation>,
        error: &str,
    ) -> ClusterResult<bool> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get(job_id)
            .ok_or_else(|| ClusterError::job_not_found(job_id))?;
        let applies = match fence {
            Some(_) => job.is_held_by(fence),
            None => !job.status.is_terminal(),
        };
        if !applies {
            debug!("作业 {} 预留已失效或已结束，忽略失败标记", job_id);
            return Ok(false);
        }
        inner.update(job_id, |job| job.mark_failed(error, Utc::now()))?;
        Ok(true)
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> ClusterResult<ReapOutcome> {
        let mut inner = self.inner.lock().await;
        let expired: Vec<String> = inner
            .reserved
            .iter()
            .filter(|id| {
                inner
                    .jobs
                    .get(*id)
                    .and_then(Job::reservation_deadline)
                    .is_some_and(|deadline| deadline <= now)
            })
            .cloned()
            .collect();

        let mut outcome = ReapOutcome::default();
        for id in expired {
            let job = inner.update(&id, |job| {
                if job.attempts_exhausted() {
                    job.mark_failed("预留超时且尝试次数已耗尽", now);
                } else {
                    job.make_available_after(Duration::ZERO, now);
                    job.last_error = Some("预留超时".to_string());
                }
            })?;
            if job.status == JobStatus::Failed {
                outcome.failed.push(job);
            } else {
                outcome.requeued.push(id);
            }
        }
        Ok(outcome)
    }

    async fn get(&self, job_id: &str) -> ClusterResult<Option<Job>> {
        Ok(self.inner.lock().await.jobs.get(job_id).cloned())
    }

    async fn counts(&self, queue: &str) -> ClusterResult<QueueCounts> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        let mut counts = QueueCounts::default();
        for job in inner.jobs.values().filter(|j| j.queue == queue) {
            match job.status {
                // 已到期但尚未被取出的延迟作业算作待处理
                JobStatus::Delayed if job.available_at <= now => counts.pending += 1,
                JobStatus::Delayed => counts.delayed += 1,
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Reserved => counts.reserved += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn queues(&self) -> ClusterResult<Vec<String>> {
        let mut names: Vec<String> = self.inner.lock().await.queues.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn purge(&self, queue: &str) -> ClusterResult<u64> {
        let mut inner = self.inner.lock().await;
        let ids: Vec<String> = inner
            .jobs
            .values()
            .filter(|j| j.queue == queue)
            .map(|j| j.id.clone())
            .collect();
        for id in &ids {
            inner.jobs.remove(id);
            inner.reserved.remove(id);
        }
        inner.queues.remove(queue);
        Ok(ids.len() as u64)
    }

    async fn prune_finished(&self, before: DateTime<Utc>) -> ClusterResult<u64> {
        let mut inner = self.inner.lock().await;
        let before_len = inner.jobs.len();
        inner.jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.finished_at.is_some_and(|at| at < before))
        });
        Ok((before_len - inner.jobs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let store = InMemoryJobStore::new();
        store.push(Job::new(b"a".to_vec(), "q").with_id("a")).await.unwrap();
        store
            .push(Job::new(b"b".to_vec(), "q").with_id("b").with_priority(5))
            .await
            .unwrap();
        store.push(Job::new(b"c".to_vec(), "q").with_id("c")).await.unwrap();

        let now = Utc::now();
        let mut order = Vec::new();
        while let Some(job) = store.reserve("q", "w", now).await.unwrap() {
            order.push(job.id);
        }
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_delayed_job_becomes_visible() {
        let store = InMemoryJobStore::new();
        let job = store
            .push(Job::new(Vec::new(), "q").with_delay(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Delayed);

        let now = Utc::now();
        assert!(store.reserve("q", "w", now).await.unwrap().is_none());
        assert_eq!(store.counts("q").await.unwrap().delayed, 1);

        let later = job.available_at + chrono::Duration::milliseconds(1);
        let reserved = store.reserve("q", "w", later).await.unwrap().unwrap();
        assert_eq!(reserved.id, job.id);
        assert_eq!(reserved.attempts, 1);
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let store = InMemoryJobStore::new();
        let job = store.push(Job::new(Vec::new(), "q")).await.unwrap();
        assert!(!store.complete(&job.id, None).await.unwrap());

        let reserved = store.reserve("q", "w", Utc::now()).await.unwrap().unwrap();
        let fence = reserved.reservation();
        assert!(store.complete(&job.id, fence.as_ref()).await.unwrap());
        assert!(!store.complete(&job.id, fence.as_ref()).await.unwrap());
        assert!(!store.complete(&job.id, None).await.unwrap());

        let counts = store.counts("q").await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.size(), 0);
    }

    #[tokio::test]
    async fn test_requeue_expired_and_exhaust() {
        let store = InMemoryJobStore::new();
        let job = store
            .push(
                Job::new(Vec::new(), "q")
                    .with_max_attempts(2)
                    .with_timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        let t0 = Utc::now();
        store.reserve("q", "w", t0).await.unwrap().unwrap();
        let t1 = t0 + chrono::Duration::seconds(2);
        let outcome = store.requeue_expired(t1).await.unwrap();
        assert_eq!(outcome.requeued, vec![job.id.clone()]);

        let again = store.reserve("q", "w", t1).await.unwrap().unwrap();
        assert_eq!(again.attempts, 2);
        let outcome = store.requeue_expired(t1 + chrono::Duration::seconds(2)).await.unwrap();
        assert!(outcome.requeued.is_empty());
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(store.get(&job.id).await.unwrap().unwrap().status, JobStatus::Failed);
        assert!(store
            .reserve("q", "w", t1 + chrono::Duration::seconds(10))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_stale_reservation_cannot_touch_redelivered_job() {
        let store = InMemoryJobStore::new();
        let job = store
            .push(
                Job::new(Vec::new(), "q")
                    .with_max_attempts(2)
                    .with_timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        let t0 = Utc::now();
        let first = store.reserve("q", "a", t0).await.unwrap().unwrap();
        let stale = first.reservation().unwrap();
        let t1 = t0 + chrono::Duration::seconds(2);
        assert_eq!(store.requeue_expired(t1).await.unwrap().requeued, vec![job.id.clone()]);

        let second = store.reserve("q", "b", t1).await.unwrap().unwrap();
        assert_eq!(second.attempts, 2);

        // 第一次预留的持有者超时后才回来，不能影响第二次预留
        assert!(!store
            .release(&job.id, Some(&stale), Duration::ZERO, Some("timeout".into()))
            .await
            .unwrap());
        assert!(!store.fail(&job.id, Some(&stale), "timeout").await.unwrap());
        assert!(!store.complete(&job.id, Some(&stale)).await.unwrap());
        assert!(store.reserve("q", "c", t1).await.unwrap().is_none());

        let current = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Reserved);
        assert_eq!(current.reserved_by.as_deref(), Some("b"));
        assert!(current.attempts <= current.max_attempts);

        assert!(store.complete(&job.id, second.reservation().as_ref()).await.unwrap());
        assert_eq!(store.counts("q").await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_zero_timeout_is_never_reaped() {
        let store = InMemoryJobStore::new();
        let job = store
            .push(Job::new(Vec::new(), "q").with_timeout(Duration::ZERO))
            .await
            .unwrap();
        let t0 = Utc::now();
        store.reserve("q", "w", t0).await.unwrap().unwrap();

        let outcome = store.requeue_expired(t0 + chrono::Duration::hours(1)).await.unwrap();
        assert!(outcome.requeued.is_empty());
        assert!(outcome.failed.is_empty());
        assert_eq!(store.get(&job.id).await.unwrap().unwrap().status, JobStatus::Reserved);
    }

    #[tokio::test]
    async fn test_release_with_delay_and_purge() {
        let store = InMemoryJobStore::new();
        let job = store.push(Job::new(Vec::new(), "q")).await.unwrap();
        let now = Utc::now();
        store.reserve("q", "w", now).await.unwrap().unwrap();

        assert!(store
            .release(&job.id, None, Duration::from_secs(30), Some("boom".into()))
            .await
            .unwrap());
        let released = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(released.status, JobStatus::Delayed);
        assert_eq!(released.last_error.as_deref(), Some("boom"));
        assert!(store.reserve("q", "w", now).await.unwrap().is_none());

        store.push_batch(vec![Job::new(Vec::new(), "q"), Job::new(Vec::new(), "q")]).await.unwrap();
        assert_eq!(store.purge("q").await.unwrap(), 3);
        assert_eq!(store.counts("q").await.unwrap(), QueueCounts::default());
    }

    #[tokio::test]
    async fn test_prune_finished() {
        let store = InMemoryJobStore::new();
        let job = store.push(Job::new(Vec::new(), "q")).await.unwrap();
        assert!(store.fail(&job.id, None, "bad payload").await.unwrap());
        assert!(!store.fail(&job.id, None, "again").await.unwrap());

        assert_eq!(store.prune_finished(Utc::now() - chrono::Duration::hours(1)).await.unwrap(), 0);
        assert_eq!(store.prune_finished(Utc::now() + chrono::Duration::seconds(1)).await.unwrap(), 1);
        assert!(store.get(&job.id).await.unwrap().is_none());
    }
}
