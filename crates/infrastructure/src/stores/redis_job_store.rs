use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cluster_core::{ClusterConfig, ClusterError, ClusterResult};
use cluster_domain::{Job, JobStatus, JobStore, QueueCounts, ReapOutcome, Reservation};
use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use tracing::{debug, info, warn};

use crate::backends::redis::{build_client, connect_manager, map_redis_error};

/// 将到期的延迟作业移入就绪集合，然后弹出就绪集合中的第一个成员，
/// 并以认领宽限期写入预留集合，防止取出后进程崩溃导致作业丢失。
const RESERVE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[2], member)
    redis.call('ZADD', KEYS[1], 0, member)
end
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
    return false
end
local member = popped[1]
local id = string.match(member, '^[^:]*:[^:]*:(.*)$')
redis.call('ZADD', KEYS[3], ARGV[2], id)
return id
"#;

/// 作业仍处于指定的那次预留时才从预留集合移除
///
/// 检查和移除在同一个脚本中完成，回收与重新预留不会插入其间。
const TAKE_HELD_SCRIPT: &str = r#"
local raw = redis.call('HGET', KEYS[1], ARGV[1])
if not raw then
    return 0
end
local job = cjson.decode(raw)
if job['status'] ~= 'reserved' then
    return 0
end
if job['reserved_by'] ~= ARGV[2] or tostring(job['attempts']) ~= ARGV[3] then
    return 0
end
return redis.call('ZREM', KEYS[2], ARGV[1])
"#;

/// 认领后写入真实截止时间之前使用的宽限期
const CLAIM_GRACE: Duration = Duration::from_secs(30);

/// Redis 共享作业存储
///
/// 键布局（`{p}` 为键前缀，`{q}` 为队列名）：
/// - `{p}:jobs`：HASH，作业ID -> JSON
/// - `{p}:queues`：SET，队列名
/// - `{p}:seq`：入队序号计数器
/// - `{p}:q:{q}:ready`：ZSET，分数恒为0，成员按字典序编码（优先级降序、序号升序）
/// - `{p}:q:{q}:delayed`：ZSET，分数为可见时间（毫秒），成员与就绪集合相同
/// - `{p}:q:{q}:reserved`：ZSET，分数为预留截止时间（毫秒），成员为作业ID
/// - `{p}:q:{q}:finished`：ZSET，分数为结束时间（毫秒），成员为作业ID
/// - `{p}:q:{q}:counts`：HASH，completed / failed 计数
pub struct RedisJobStore {
    conn: ConnectionManager,
    prefix: String,
    request_timeout: Duration,
    reserve_script: Script,
    take_held_script: Script,
}

/// 就绪集合成员：`{i32::MAX - priority:010}:{sequence:020}:{id}`
pub(crate) fn ready_member(job: &Job) -> String {
    let inverted = i64::from(i32::MAX) - i64::from(job.priority);
    format!("{:010}:{:020}:{}", inverted, job.sequence, job.id)
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// 预留集合中的分数；不限时的作业排在最后，永远不会被回收
pub(crate) fn reserved_score(job: &Job) -> String {
    match job.reservation_deadline() {
        Some(deadline) => millis(deadline).to_string(),
        None => "+inf".to_string(),
    }
}

impl RedisJobStore {
    pub async fn connect(config: &ClusterConfig) -> ClusterResult<Self> {
        let client = build_client(config)?;
        let conn = connect_manager(&client, config.connect_timeout()).await?;
        info!("Redis作业存储已连接");
        Ok(Self::with_connection(
            conn,
            format!("{}:jobs", config.key_prefix.trim_end_matches('/')),
            config.request_timeout(),
        ))
    }

    pub fn with_connection(
        conn: ConnectionManager,
        prefix: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            request_timeout,
            reserve_script: Script::new(RESERVE_SCRIPT),
            take_held_script: Script::new(TAKE_HELD_SCRIPT),
        }
    }

    fn jobs_key(&self) -> String {
        format!("{}:jobs", self.prefix)
    }

    fn queues_key(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    fn seq_key(&self) -> String {
        format!("{}:seq", self.prefix)
    }

    fn queue_key(&self, queue: &str, part: &str) -> String {
        format!("{}:q:{}:{}", self.prefix, queue, part)
    }

    async fn run<T, Fut>(&self, context: &str, fut: Fut) -> ClusterResult<T>
    where
        Fut: Future<Output = Result<T, RedisError>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result.map_err(|e| map_redis_error(context, e)),
            Err(_) => Err(ClusterError::Timeout(format!("Redis {context}"))),
        }
    }

    async fn load(&self, job_id: &str) -> ClusterResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = self
            .run(
                "读取作业",
                redis::cmd("HGET")
                    .arg(self.jobs_key())
                    .arg(job_id)
                    .query_async(&mut conn),
            )
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, job: &Job) -> ClusterResult<()> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(job)?;
        let _: () = self
            .run(
                "保存作业",
                redis::cmd("HSET")
                    .arg(self.jobs_key())
                    .arg(&job.id)
                    .arg(raw)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    /// 从预留集合移除，返回是否由本次调用移除（并发回收时只有一方成功）
    async fn take_reservation(&self, job: &Job) -> ClusterResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .run(
                "ZREM reserved",
                redis::cmd("ZREM")
                    .arg(self.queue_key(&job.queue, "reserved"))
                    .arg(&job.id)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(removed == 1)
    }

    /// 按预留标识移除预留；`fence` 为 `None` 时只要求作业处于预留状态
    async fn take_held(&self, job: &Job, fence: Option<&Reservation>) -> ClusterResult<bool> {
        let Some(fence) = fence else {
            return Ok(job.status == JobStatus::Reserved && self.take_reservation(job).await?);
        };
        if !job.is_held_by(Some(fence)) {
            return Ok(false);
        }
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .run(
                "按预留标识移除",
                self.take_held_script
                    .key(self.jobs_key())
                    .key(self.queue_key(&job.queue, "reserved"))
                    .arg(&job.id)
                    .arg(&fence.worker)
                    .arg(fence.attempt)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(removed == 1)
    }

    async fn next_sequences(&self, count: usize) -> ClusterResult<u64> {
        let mut conn = self.conn.clone();
        let last: u64 = self
            .run(
                "INCRBY seq",
                redis::cmd("INCRBY")
                    .arg(self.seq_key())
                    .arg(count as u64)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(last + 1 - count as u64)
    }

    fn add_enqueue_commands(&self, pipe: &mut redis::Pipeline, job: &Job) -> ClusterResult<()> {
        pipe.cmd("SADD").arg(self.queues_key()).arg(&job.queue).ignore();
        pipe.cmd("HSET")
            .arg(self.jobs_key())
            .arg(&job.id)
            .arg(serde_json::to_string(job)?)
            .ignore();
        self.add_index_commands(pipe, job);
        Ok(())
    }

    fn add_index_commands(&self, pipe: &mut redis::Pipeline, job: &Job) {
        match job.status {
            JobStatus::Pending => {
                pipe.cmd("ZADD")
                    .arg(self.queue_key(&job.queue, "ready"))
                    .arg(0)
                    .arg(ready_member(job))
                    .ignore();
            }
            JobStatus::Delayed => {
                pipe.cmd("ZADD")
                    .arg(self.queue_key(&job.queue, "delayed"))
                    .arg(millis(job.available_at))
                    .arg(ready_member(job))
                    .ignore();
            }
            JobStatus::Reserved => {
                pipe.cmd("ZADD")
                    .arg(self.queue_key(&job.queue, "reserved"))
                    .arg(reserved_score(job))
                    .arg(&job.id)
                    .ignore();
            }
            JobStatus::Completed | JobStatus::Failed => {
                let finished = job.finished_at.unwrap_or_else(Utc::now);
                pipe.cmd("ZADD")
                    .arg(self.queue_key(&job.queue, "finished"))
                    .arg(millis(finished))
                    .arg(&job.id)
                    .ignore();
                pipe.cmd("HINCRBY")
                    .arg(self.queue_key(&job.queue, "counts"))
                    .arg(job.status.as_str())
                    .arg(1)
                    .ignore();
            }
        }
    }

    /// 保存作业并写入新状态对应的索引
    async fn persist(&self, job: &Job, context: &str) -> ClusterResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("HSET")
            .arg(self.jobs_key())
            .arg(&job.id)
            .arg(serde_json::to_string(job)?)
            .ignore();
        // 失败可能发生在任意非终态，先清除旧索引
        pipe.cmd("ZREM")
            .arg(self.queue_key(&job.queue, "ready"))
            .arg(ready_member(job))
            .ignore();
        pipe.cmd("ZREM")
            .arg(self.queue_key(&job.queue, "delayed"))
            .arg(ready_member(job))
            .ignore();
        self.add_index_commands(&mut pipe, job);
        let _: () = self.run(context, pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn members(&self, key: String) -> ClusterResult<Vec<String>> {
        let mut conn = self.conn.clone();
        self.run(
            "ZRANGE",
            redis::cmd("ZRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .query_async(&mut conn),
        )
        .await
    }

    async fn expired_reservations(&self, queue: &str, now: DateTime<Utc>) -> ClusterResult<Vec<String>> {
        let mut conn = self.conn.clone();
        self.run(
            "ZRANGEBYSCORE reserved",
            redis::cmd("ZRANGEBYSCORE")
                .arg(self.queue_key(queue, "reserved"))
                .arg("-inf")
                .arg(millis(now))
                .query_async(&mut conn),
        )
        .await
    }
}

fn member_id(member: &str) -> &str {
    member.splitn(3, ':').nth(2).unwrap_or(member)
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn push(&self, job: Job) -> ClusterResult<Job> {
        let mut pushed = self.push_batch(vec![job]).await?;
        pushed
            .pop()
            .ok_or_else(|| ClusterError::internal("批量入队未返回作业"))
    }

    async fn push_batch(&self, jobs: Vec<Job>) -> ClusterResult<Vec<Job>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let first = self.next_sequences(jobs.len()).await?;
        let now = Utc::now();

        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut prepared = Vec::with_capacity(jobs.len());
        for (offset, mut job) in jobs.into_iter().enumerate() {
            job.prepare_enqueue(first + offset as u64, now);
            self.add_enqueue_commands(&mut pipe, &job)?;
            prepared.push(job);
        }

        let mut conn = self.conn.clone();
        let _: () = self.run("批量入队", pipe.query_async(&mut conn)).await?;
        Ok(prepared)
    }

    async fn reserve(
        &self,
        queue: &str,
        worker: &str,
        now: DateTime<Utc>,
    ) -> ClusterResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let claimed: Option<String> = self
            .run(
                "取出作业",
                self.reserve_script
                    .key(self.queue_key(queue, "ready"))
                    .key(self.queue_key(queue, "delayed"))
                    .key(self.queue_key(queue, "reserved"))
                    .arg(millis(now))
                    .arg(millis(now) + CLAIM_GRACE.as_millis() as i64)
                    .invoke_async(&mut conn),
            )
            .await?;
        let Some(job_id) = claimed else {
            return Ok(None);
        };

        let Some(mut job) = self.load(&job_id).await? else {
            warn!("就绪集合中的作业 {} 已不存在", job_id);
            return Ok(None);
        };
        job.mark_reserved(worker, now);
        self.persist(&job, "预留作业").await?;
        Ok(Some(job))
    }

    async fn complete(&self, job_id: &str, fence: Option<&Reservation>) -> ClusterResult<bool> {
        let Some(mut job) = self.load(job_id).await? else {
            return Ok(false);
        };
        if !self.take_held(&job, fence).await? {
            return Ok(false);
        }
        job.mark_completed(Utc::now());
        self.persist(&job, "完成作业").await?;
        Ok(true)
    }

    async fn release(
        &self,
        job_id: &str,
        fence: Option<&Reservation>,
        delay: Duration,
        error: Option<String>,
    ) -> ClusterResult<bool> {
        let mut job = self
            .load(job_id)
            .await?
            .ok_or_else(|| ClusterError::job_not_found(job_id))?;
        if !self.take_held(&job, fence).await? {
            debug!("作业 {} 已被回收、重新预留或结束，忽略释放", job_id);
            return Ok(false);
        }
        job.make_available_after(delay, Utc::now());
        if error.is_some() {
            job.last_error = error;
        }
        self.persist(&job, "释放作业").await?;
        Ok(true)
    }

    async fn fail(
        &self,
        job_id: &str,
        fence: Option<&Reservation>,
        error: &str,
    ) -> ClusterResult<bool> {
        let mut job = self
            .load(job_id)
            .await?
            .ok_or_else(|| ClusterError::job_not_found(job_id))?;
        match fence {
            Some(_) => {
                if !self.take_held(&job, fence).await? {
                    debug!("作业 {} 预留已失效，忽略失败标记", job_id);
                    return Ok(false);
                }
            }
            None => {
                if job.status.is_terminal() {
                    return Ok(false);
                }
                self.take_reservation(&job).await?;
            }
        }
        job.mark_failed(error, Utc::now());
        self.persist(&job, "作业失败").await?;
        Ok(true)
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> ClusterResult<ReapOutcome> {
        let mut outcome = ReapOutcome::default();
        for queue in self.queues().await? {
            for job_id in self.expired_reservations(&queue, now).await? {
                let Some(mut job) = self.load(&job_id).await? else {
                    continue;
                };
                // 多个节点同时回收时只有移除成功的一方处理
                if !self.take_reservation(&job).await? {
                    continue;
                }

                if job.status == JobStatus::Reserved && job.attempts_exhausted() {
                    job.mark_failed("预留超时且尝试次数已耗尽", now);
                    self.persist(&job, "回收作业").await?;
                    outcome.failed.push(job);
                } else {
                    // 认领后未写入预留状态的作业直接放回，尝试次数不变
                    job.make_available_after(Duration::ZERO, now);
                    job.last_error = Some("预留超时".to_string());
                    self.persist(&job, "回收作业").await?;
                    outcome.requeued.push(job_id);
                }
            }
        }
        Ok(outcome)
    }

    async fn get(&self, job_id: &str) -> ClusterResult<Option<Job>> {
        self.load(job_id).await
    }

    async fn counts(&self, queue: &str) -> ClusterResult<QueueCounts> {
        let mut conn = self.conn.clone();
        let now = millis(Utc::now());
        let delayed_key = self.queue_key(queue, "delayed");
        let counts_key = self.queue_key(queue, "counts");

        let (ready, due, delayed, reserved, completed, failed): (
            u64,
            u64,
            u64,
            u64,
            Option<u64>,
            Option<u64>,
        ) = self
            .run(
                "队列统计",
                redis::pipe()
                    .cmd("ZCARD")
                    .arg(self.queue_key(queue, "ready"))
                    .cmd("ZCOUNT")
                    .arg(&delayed_key)
                    .arg("-inf")
                    .arg(now)
                    .cmd("ZCARD")
                    .arg(&delayed_key)
                    .cmd("ZCARD")
                    .arg(self.queue_key(queue, "reserved"))
                    .cmd("HGET")
                    .arg(&counts_key)
                    .arg(JobStatus::Completed.as_str())
                    .cmd("HGET")
                    .arg(&counts_key)
                    .arg(JobStatus::Failed.as_str())
                    .query_async(&mut conn),
            )
            .await?;

        Ok(QueueCounts {
            pending: ready + due,
            delayed: delayed.saturating_sub(due),
            reserved,
            completed: completed.unwrap_or(0),
            failed: failed.unwrap_or(0),
        })
    }

    async fn queues(&self) -> ClusterResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = self
            .run(
                "SMEMBERS",
                redis::cmd("SMEMBERS")
                    .arg(self.queues_key())
                    .query_async(&mut conn),
            )
            .await?;
        names.sort();
        Ok(names)
    }

    async fn purge(&self, queue: &str) -> ClusterResult<u64> {
        let mut ids: Vec<String> = Vec::new();
        for part in ["ready", "delayed"] {
            ids.extend(
                self.members(self.queue_key(queue, part))
                    .await?
                    .iter()
                    .map(|m| member_id(m).to_string()),
            );
        }
        for part in ["reserved", "finished"] {
            ids.extend(self.members(self.queue_key(queue, part)).await?);
        }
        ids.sort();
        ids.dedup();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for chunk in ids.chunks(100) {
            pipe.cmd("HDEL").arg(self.jobs_key()).arg(chunk).ignore();
        }
        for part in ["ready", "delayed", "reserved", "finished", "counts"] {
            pipe.cmd("DEL").arg(self.queue_key(queue, part)).ignore();
        }
        pipe.cmd("SREM").arg(self.queues_key()).arg(queue).ignore();

        let mut conn = self.conn.clone();
        let _: () = self.run("清空队列", pipe.query_async(&mut conn)).await?;
        Ok(ids.len() as u64)
    }

    async fn prune_finished(&self, before: DateTime<Utc>) -> ClusterResult<u64> {
        let mut removed = 0u64;
        for queue in self.queues().await? {
            let finished_key = self.queue_key(&queue, "finished");
            let mut conn = self.conn.clone();
            let ids: Vec<String> = self
                .run(
                    "ZRANGEBYSCORE finished",
                    redis::cmd("ZRANGEBYSCORE")
                        .arg(&finished_key)
                        .arg("-inf")
                        .arg(format!("({}", millis(before)))
                        .query_async(&mut conn),
                )
                .await?;

            for job_id in ids {
                let status = self.load(&job_id).await?.map(|j| j.status);
                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe.cmd("ZREM").arg(&finished_key).arg(&job_id).ignore();
                pipe.cmd("HDEL").arg(self.jobs_key()).arg(&job_id).ignore();
                if let Some(status) = status.filter(JobStatus::is_terminal) {
                    pipe.cmd("HINCRBY")
                        .arg(self.queue_key(&queue, "counts"))
                        .arg(status.as_str())
                        .arg(-1)
                        .ignore();
                }
                let _: () = self.run("清理作业", pipe.query_async(&mut conn)).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn is_shared(&self) -> bool {
        true
    }
}
