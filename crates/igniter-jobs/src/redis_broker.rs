//! Redis broker.
//!
//! Queue layout, per wire queue name `q` under the configured prefix:
//!
//! - `{p}:{q}:waiting` — sorted set of ids, scored by priority-then-FIFO
//! - `{p}:{q}:delayed` — sorted set of ids, scored by ready time (ms)
//! - `{p}:{q}:active` — hash `id -> worker_id`
//! - `{p}:{q}:completed` / `{p}:{q}:failed` — sorted sets scored by finish time
//! - `{p}:{q}:paused` — flag key
//! - `{p}:{q}:job:{id}` — serialized [`JobRecord`]
//! - `{p}:{q}:logs:{id}` — list of log lines
//!
//! Dedup for explicit job ids rides on `SETNX` of the record key.

use crate::broker::{priority_score, CleanOptions, JobBroker, JobFilter};
use crate::config::RedisConfig;
use crate::record::{JobCounts, JobRecord, JobState};
use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config, Pool, Runtime};
use igniter_core::{IgniterError, IgniterResult};
use redis::AsyncCommands;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Key builder for the broker layout.
struct BrokerKeys {
    prefix: String,
}

impl BrokerKeys {
    fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn waiting(&self, queue: &str) -> String {
        format!("{}:{}:waiting", self.prefix, queue)
    }

    fn delayed(&self, queue: &str) -> String {
        format!("{}:{}:delayed", self.prefix, queue)
    }

    fn active(&self, queue: &str) -> String {
        format!("{}:{}:active", self.prefix, queue)
    }

    fn completed(&self, queue: &str) -> String {
        format!("{}:{}:completed", self.prefix, queue)
    }

    fn failed(&self, queue: &str) -> String {
        format!("{}:{}:failed", self.prefix, queue)
    }

    fn paused(&self, queue: &str) -> String {
        format!("{}:{}:paused", self.prefix, queue)
    }

    fn job(&self, queue: &str, id: &str) -> String {
        format!("{}:{}:job:{}", self.prefix, queue, id)
    }

    fn logs(&self, queue: &str, id: &str) -> String {
        format!("{}:{}:logs:{}", self.prefix, queue, id)
    }

    fn job_pattern(&self, queue: &str) -> String {
        format!("{}:{}:job:*", self.prefix, queue)
    }

    fn logs_pattern(&self, queue: &str) -> String {
        format!("{}:{}:logs:*", self.prefix, queue)
    }
}

/// Redis-backed [`JobBroker`].
pub struct RedisBroker {
    pool: Pool,
    keys: BrokerKeys,
}

impl RedisBroker {
    /// Connects to Redis per the configuration (host/port/password/db) and
    /// verifies the connection.
    pub async fn connect(config: &RedisConfig) -> IgniterResult<Self> {
        let cfg = Config::from_url(config.url());
        let pool = cfg
            .builder()
            .map_err(|e| IgniterError::internal(format!("Invalid Redis config: {e}")))?
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| IgniterError::internal(format!("Failed to create pool: {e}")))?;

        let mut conn = pool.get().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;

        debug!(host = %config.host, port = config.port, "Job broker connected");

        Ok(Self {
            pool,
            keys: BrokerKeys::new(&config.key_prefix),
        })
    }

    /// Wraps an existing pool, for callers that manage their own.
    #[must_use]
    pub fn with_pool(pool: Pool, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            keys: BrokerKeys::new(key_prefix),
        }
    }

    async fn conn(&self) -> IgniterResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    async fn load(
        &self,
        conn: &mut deadpool_redis::Connection,
        queue: &str,
        id: &str,
    ) -> IgniterResult<Option<JobRecord>> {
        let json: Option<String> = conn.get(self.keys.job(queue, id)).await?;
        match json {
            Some(json) => Ok(Some(JobRecord::from_json(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        conn: &mut deadpool_redis::Connection,
        record: &JobRecord,
    ) -> IgniterResult<()> {
        let _: () = conn
            .set(self.keys.job(&record.queue, &record.id), record.to_json()?)
            .await?;
        Ok(())
    }

    /// Moves due delayed jobs into the waiting set.
    async fn promote_due(
        &self,
        conn: &mut deadpool_redis::Connection,
        queue: &str,
    ) -> IgniterResult<()> {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore(self.keys.delayed(queue), 0i64, now_ms)
            .await?;

        for id in due {
            let Some(mut record) = self.load(conn, queue, &id).await? else {
                let _: () = conn.zrem(self.keys.delayed(queue), &id).await?;
                continue;
            };
            record.status = JobState::Waiting;
            self.save(conn, &record).await?;

            let score = priority_score(record.priority, now_ms);
            let _: () = redis::pipe()
                .zrem(self.keys.delayed(queue), &id)
                .zadd(self.keys.waiting(queue), &id, score)
                .query_async(conn)
                .await?;
        }
        Ok(())
    }

    async fn scan_delete(
        &self,
        conn: &mut deadpool_redis::Connection,
        pattern: &str,
    ) -> IgniterResult<()> {
        let mut cursor = 0u64;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(conn)
                .await?;
            if !keys.is_empty() {
                let _: () = conn.del(keys).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(())
    }

    /// Ids in one effective state. The subsets are mutually exclusive and
    /// agree with `get_state`: waiting jobs in a paused queue are `Paused`
    /// (never `Waiting`), and an active-status record without a live hold
    /// in the active hash is `Stalled` (never `Active`).
    async fn ids_for_status(
        &self,
        conn: &mut deadpool_redis::Connection,
        queue: &str,
        status: JobState,
    ) -> IgniterResult<Vec<String>> {
        let ids = match status {
            JobState::Waiting | JobState::Paused => {
                let paused: bool = conn.exists(self.keys.paused(queue)).await?;
                if paused == (status == JobState::Paused) {
                    conn.zrange(self.keys.waiting(queue), 0, -1).await?
                } else {
                    Vec::new()
                }
            }
            JobState::Delayed => conn.zrange(self.keys.delayed(queue), 0, -1).await?,
            JobState::Active => conn.hkeys(self.keys.active(queue)).await?,
            JobState::Stalled => self.stalled_ids(conn, queue).await?,
            JobState::Completed => conn.zrevrange(self.keys.completed(queue), 0, -1).await?,
            JobState::Failed => conn.zrevrange(self.keys.failed(queue), 0, -1).await?,
        };
        Ok(ids)
    }

    /// Stalled jobs have no index of their own: their record still says
    /// active but the worker's hold in the active hash is gone. Scan the
    /// record keys and apply the same liveness check `get_state` uses.
    async fn stalled_ids(
        &self,
        conn: &mut deadpool_redis::Connection,
        queue: &str,
    ) -> IgniterResult<Vec<String>> {
        let prefix = self.keys.job(queue, "");
        let mut ids = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(self.keys.job_pattern(queue))
                .arg("COUNT")
                .arg(200)
                .query_async(conn)
                .await?;
            for key in keys {
                let Some(id) = key.strip_prefix(&prefix) else {
                    continue;
                };
                let held: bool = conn.hexists(self.keys.active(queue), id).await?;
                if held {
                    continue;
                }
                if let Some(record) = self.load(conn, queue, id).await? {
                    if record.status == JobState::Active {
                        ids.push(id.to_string());
                    }
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(ids)
    }
}

#[async_trait]
impl JobBroker for RedisBroker {
    async fn enqueue(&self, mut record: JobRecord) -> IgniterResult<String> {
        let mut conn = self.conn().await?;
        let now_ms = Utc::now().timestamp_millis();

        let delayed = matches!(record.opts.delay, Some(delay) if delay > 0);
        record.status = if delayed { JobState::Delayed } else { JobState::Waiting };
        let json = record.to_json()?;
        let job_key = self.keys.job(&record.queue, &record.id);

        if record.opts.job_id.is_some() {
            let acquired: i64 = redis::cmd("SETNX")
                .arg(&job_key)
                .arg(&json)
                .query_async(&mut conn)
                .await?;
            if acquired == 0 {
                debug!(job_id = %record.id, queue = %record.queue, "Job id already present, skipping enqueue");
                return Ok(record.id);
            }
        } else {
            let _: () = conn.set(&job_key, &json).await?;
        }

        if delayed {
            let ready = now_ms + record.opts.delay.unwrap_or(0) as i64;
            let _: () = conn
                .zadd(self.keys.delayed(&record.queue), &record.id, ready)
                .await?;
        } else {
            let score = priority_score(record.priority, now_ms);
            let _: () = conn
                .zadd(self.keys.waiting(&record.queue), &record.id, score)
                .await?;
        }

        debug!(job_id = %record.id, queue = %record.queue, job = %record.name, "Enqueued job");
        Ok(record.id)
    }

    async fn dequeue(&self, queue: &str, worker_id: &str) -> IgniterResult<Option<JobRecord>> {
        let mut conn = self.conn().await?;

        let paused: bool = conn.exists(self.keys.paused(queue)).await?;
        if paused {
            return Ok(None);
        }

        self.promote_due(&mut conn, queue).await?;

        let popped: Vec<(String, f64)> = conn.zpopmin(self.keys.waiting(queue), 1).await?;
        let Some((id, _score)) = popped.into_iter().next() else {
            return Ok(None);
        };

        let Some(mut record) = self.load(&mut conn, queue, &id).await? else {
            warn!(job_id = %id, queue = %queue, "Waiting id without record, dropping");
            return Ok(None);
        };

        record.status = JobState::Active;
        record.attempts_made += 1;
        record.processed_at = Some(Utc::now());
        self.save(&mut conn, &record).await?;

        let _: () = conn.hset(self.keys.active(queue), &id, worker_id).await?;

        debug!(
            job_id = %id,
            queue = %queue,
            attempt = record.attempts_made,
            worker_id = %worker_id,
            "Dequeued job"
        );
        Ok(Some(record))
    }

    async fn complete(&self, record: &JobRecord, result: Value) -> IgniterResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.hdel(self.keys.active(&record.queue), &record.id).await?;

        let drop_record =
            record.opts.repeat.is_some() || record.opts.remove_on_complete.unwrap_or(false);
        if drop_record {
            let _: () = redis::pipe()
                .del(self.keys.job(&record.queue, &record.id))
                .del(self.keys.logs(&record.queue, &record.id))
                .query_async(&mut conn)
                .await?;
            return Ok(());
        }

        let mut stored = record.clone();
        stored.status = JobState::Completed;
        stored.result = Some(result);
        stored.completed_at = Some(Utc::now());
        stored.error = None;
        self.save(&mut conn, &stored).await?;

        let now_ms = Utc::now().timestamp_millis();
        let _: () = conn
            .zadd(self.keys.completed(&record.queue), &record.id, now_ms)
            .await?;
        Ok(())
    }

    async fn retry_later(
        &self,
        record: &JobRecord,
        error: &str,
        delay: Duration,
    ) -> IgniterResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.hdel(self.keys.active(&record.queue), &record.id).await?;

        let mut stored = record.clone();
        stored.status = JobState::Delayed;
        stored.error = Some(error.to_string());
        self.save(&mut conn, &stored).await?;

        let ready = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let _: () = conn
            .zadd(self.keys.delayed(&record.queue), &record.id, ready)
            .await?;

        debug!(
            job_id = %record.id,
            attempt = record.attempts_made,
            delay_ms = delay.as_millis() as u64,
            "Scheduled retry"
        );
        Ok(())
    }

    async fn fail_terminal(&self, record: &JobRecord, error: &str) -> IgniterResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.hdel(self.keys.active(&record.queue), &record.id).await?;

        if record.opts.remove_on_fail.unwrap_or(false) {
            let _: () = redis::pipe()
                .del(self.keys.job(&record.queue, &record.id))
                .del(self.keys.logs(&record.queue, &record.id))
                .query_async(&mut conn)
                .await?;
            return Ok(());
        }

        let mut stored = record.clone();
        stored.status = JobState::Failed;
        stored.error = Some(error.to_string());
        self.save(&mut conn, &stored).await?;

        let now_ms = Utc::now().timestamp_millis();
        let _: () = conn
            .zadd(self.keys.failed(&record.queue), &record.id, now_ms)
            .await?;

        warn!(job_id = %record.id, queue = %record.queue, error = %error, "Job failed terminally");
        Ok(())
    }

    async fn requeue(&self, record: &JobRecord) -> IgniterResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.hdel(self.keys.active(&record.queue), &record.id).await?;

        let mut stored = record.clone();
        stored.status = JobState::Waiting;
        stored.attempts_made = stored.attempts_made.saturating_sub(1);
        self.save(&mut conn, &stored).await?;

        let score = priority_score(record.priority, record.created_at.timestamp_millis());
        let _: () = conn
            .zadd(self.keys.waiting(&record.queue), &record.id, score)
            .await?;
        Ok(())
    }

    async fn get_job(&self, queue: &str, id: &str) -> IgniterResult<Option<JobRecord>> {
        let mut conn = self.conn().await?;
        self.load(&mut conn, queue, id).await
    }

    async fn get_state(&self, queue: &str, id: &str) -> IgniterResult<Option<JobState>> {
        let mut conn = self.conn().await?;
        let Some(record) = self.load(&mut conn, queue, id).await? else {
            return Ok(None);
        };

        let effective = match record.status {
            JobState::Active => {
                let held: bool = conn.hexists(self.keys.active(queue), id).await?;
                if held { JobState::Active } else { JobState::Stalled }
            }
            JobState::Waiting => {
                let paused: bool = conn.exists(self.keys.paused(queue)).await?;
                if paused { JobState::Paused } else { JobState::Waiting }
            }
            status => status,
        };
        Ok(Some(effective))
    }

    async fn get_logs(&self, queue: &str, id: &str) -> IgniterResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.lrange(self.keys.logs(queue, id), 0, -1).await?)
    }

    async fn append_log(&self, queue: &str, id: &str, line: &str) -> IgniterResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.rpush(self.keys.logs(queue, id), line).await?;
        Ok(())
    }

    async fn set_progress(&self, queue: &str, id: &str, progress: Value) -> IgniterResult<()> {
        let mut conn = self.conn().await?;
        if let Some(mut record) = self.load(&mut conn, queue, id).await? {
            record.progress = Some(progress);
            self.save(&mut conn, &record).await?;
        }
        Ok(())
    }

    async fn get_progress(&self, queue: &str, id: &str) -> IgniterResult<Option<Value>> {
        let mut conn = self.conn().await?;
        Ok(self
            .load(&mut conn, queue, id)
            .await?
            .and_then(|record| record.progress))
    }

    async fn counts(&self, queue: &str) -> IgniterResult<JobCounts> {
        let mut conn = self.conn().await?;
        let waiting: u64 = conn.zcard(self.keys.waiting(queue)).await?;
        let delayed: u64 = conn.zcard(self.keys.delayed(queue)).await?;
        let completed: u64 = conn.zcard(self.keys.completed(queue)).await?;
        let failed: u64 = conn.zcard(self.keys.failed(queue)).await?;
        let active: u64 = conn.hlen(self.keys.active(queue)).await?;
        let paused: bool = conn.exists(self.keys.paused(queue)).await?;

        // Waiting and paused are exclusive, matching get_state: a paused
        // queue reports its backlog under paused only.
        Ok(JobCounts {
            waiting: if paused { 0 } else { waiting },
            active,
            completed,
            failed,
            delayed,
            paused: if paused { waiting } else { 0 },
        })
    }

    async fn jobs_by_filter(
        &self,
        queue: &str,
        filter: &JobFilter,
    ) -> IgniterResult<Vec<JobRecord>> {
        let mut conn = self.conn().await?;
        let statuses: Vec<JobState> = if filter.statuses.is_empty() {
            vec![
                JobState::Waiting,
                JobState::Paused,
                JobState::Active,
                JobState::Stalled,
                JobState::Delayed,
                JobState::Completed,
                JobState::Failed,
            ]
        } else {
            filter.statuses.clone()
        };

        let mut ids: Vec<String> = Vec::new();
        for status in statuses {
            ids.extend(self.ids_for_status(&mut conn, queue, status).await?);
        }

        let selected: Vec<String> = ids
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();

        let mut records = Vec::with_capacity(selected.len());
        for id in selected {
            if let Some(record) = self.load(&mut conn, queue, &id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn pause(&self, queue: &str) -> IgniterResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.set(self.keys.paused(queue), "1").await?;
        Ok(())
    }

    async fn resume(&self, queue: &str) -> IgniterResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(self.keys.paused(queue)).await?;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> IgniterResult<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(self.keys.paused(queue)).await?)
    }

    async fn drain(&self, queue: &str) -> IgniterResult<u64> {
        let mut conn = self.conn().await?;
        let count: u64 = conn.zcard(self.keys.waiting(queue)).await?;
        let ids: Vec<String> = conn.zrange(self.keys.waiting(queue), 0, -1).await?;

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.del(self.keys.job(queue, id));
            pipe.del(self.keys.logs(queue, id));
        }
        pipe.del(self.keys.waiting(queue));
        let _: () = pipe.query_async(&mut conn).await?;

        debug!(queue = %queue, removed = count, "Drained queue");
        Ok(count)
    }

    async fn clean(&self, queue: &str, options: &CleanOptions) -> IgniterResult<u64> {
        let mut conn = self.conn().await?;
        let statuses = if options.statuses.is_empty() {
            vec![JobState::Completed, JobState::Failed]
        } else {
            options.statuses.clone()
        };
        let limit = options.limit.unwrap_or(usize::MAX);
        let now = Utc::now();
        let mut removed = 0u64;

        for status in statuses {
            if removed as usize >= limit {
                break;
            }
            // In-flight jobs are never cleaned.
            let ids = match status {
                JobState::Active | JobState::Stalled => Vec::new(),
                status => self.ids_for_status(&mut conn, queue, status).await?,
            };
            for id in ids {
                if removed as usize >= limit {
                    break;
                }
                let eligible = match (options.older_than, self.load(&mut conn, queue, &id).await?) {
                    (None, _) => true,
                    (Some(_), None) => true,
                    (Some(age), Some(record)) => {
                        let reference = record.completed_at.unwrap_or(record.created_at);
                        now.signed_duration_since(reference)
                            .to_std()
                            .map(|d| d >= age)
                            .unwrap_or(false)
                    }
                };
                if eligible {
                    self.remove(queue, &id).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn obliterate(&self, queue: &str, force: bool) -> IgniterResult<()> {
        let mut conn = self.conn().await?;
        let active: u64 = conn.hlen(self.keys.active(queue)).await?;
        if active > 0 && !force {
            return Err(IgniterError::internal(format!(
                "Cannot obliterate queue '{queue}' with {active} active jobs"
            )));
        }

        let _: () = redis::pipe()
            .del(self.keys.waiting(queue))
            .del(self.keys.delayed(queue))
            .del(self.keys.active(queue))
            .del(self.keys.completed(queue))
            .del(self.keys.failed(queue))
            .del(self.keys.paused(queue))
            .query_async(&mut conn)
            .await?;

        self.scan_delete(&mut conn, &self.keys.job_pattern(queue)).await?;
        self.scan_delete(&mut conn, &self.keys.logs_pattern(queue)).await?;

        debug!(queue = %queue, "Obliterated queue");
        Ok(())
    }

    async fn remove(&self, queue: &str, id: &str) -> IgniterResult<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .zrem(self.keys.waiting(queue), id)
            .zrem(self.keys.delayed(queue), id)
            .zrem(self.keys.completed(queue), id)
            .zrem(self.keys.failed(queue), id)
            .hdel(self.keys.active(queue), id)
            .del(self.keys.job(queue, id))
            .del(self.keys.logs(queue, id))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn promote(&self, queue: &str, id: &str) -> IgniterResult<()> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.zrem(self.keys.delayed(queue), id).await?;
        if removed == 0 {
            return Ok(());
        }

        let Some(mut record) = self.load(&mut conn, queue, id).await? else {
            return Ok(());
        };
        record.status = JobState::Waiting;
        self.save(&mut conn, &record).await?;

        let score = priority_score(record.priority, Utc::now().timestamp_millis());
        let _: () = conn.zadd(self.keys.waiting(queue), id, score).await?;
        Ok(())
    }

    async fn retry_job(&self, queue: &str, id: &str) -> IgniterResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.zrem(self.keys.failed(queue), id).await?;

        let Some(mut record) = self.load(&mut conn, queue, id).await? else {
            return Ok(());
        };
        record.status = JobState::Waiting;
        record.error = None;
        record.attempts_made = 0;
        self.save(&mut conn, &record).await?;

        let score = priority_score(record.priority, Utc::now().timestamp_millis());
        let _: () = conn.zadd(self.keys.waiting(queue), id, score).await?;
        Ok(())
    }

    async fn move_to_failed(&self, queue: &str, id: &str, reason: &str) -> IgniterResult<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .zrem(self.keys.waiting(queue), id)
            .zrem(self.keys.delayed(queue), id)
            .hdel(self.keys.active(queue), id)
            .query_async(&mut conn)
            .await?;

        let Some(mut record) = self.load(&mut conn, queue, id).await? else {
            return Ok(());
        };
        record.status = JobState::Failed;
        record.error = Some(reason.to_string());
        self.save(&mut conn, &record).await?;

        let now_ms = Utc::now().timestamp_millis();
        let _: () = conn.zadd(self.keys.failed(queue), id, now_ms).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = BrokerKeys::new("igniter:jobs");
        assert_eq!(keys.waiting("app__emails"), "igniter:jobs:app__emails:waiting");
        assert_eq!(keys.job("q", "1"), "igniter:jobs:q:job:1");
        assert_eq!(keys.logs("q", "1"), "igniter:jobs:q:logs:1");
        assert_eq!(keys.job_pattern("q"), "igniter:jobs:q:job:*");
    }
}
