//! Durable job storage.
//!
//! [`QueueBackend`] abstracts the job table: Postgres in production
//! ([`PgQueueBackend`], claimed with `FOR UPDATE SKIP LOCKED`), in-memory
//! for tests and database-less deployments ([`MemoryQueueBackend`]).
//!
//! Enqueue is idempotent per logical identity: inserting under an existing
//! non-terminal id returns the existing job instead of duplicating work.
//! Inserting under a terminal id starts a fresh job (re-research after
//! completion is legitimate).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use super::types::{JobRecord, JobState, QueueName, QueueStats};

/// Outcome of an idempotent insert.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(JobRecord),
    /// A non-terminal job with this id already exists; no new work created.
    Existing(JobRecord),
}

impl InsertOutcome {
    pub fn record(&self) -> &JobRecord {
        match self {
            Self::Inserted(j) | Self::Existing(j) => j,
        }
    }
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn health(&self) -> Result<()>;

    async fn insert(&self, job: JobRecord) -> Result<InsertOutcome>;

    async fn get(&self, id: &str) -> Result<Option<JobRecord>>;

    /// Claim the next due job on a queue: waiting/delayed, run_at elapsed,
    /// highest priority first then FIFO. Marks it active, bumps the attempt
    /// counter, and sets the lock.
    async fn claim(&self, queue: QueueName, lock: Duration) -> Result<Option<JobRecord>>;

    /// Push out an active job's lock deadline. Workers call this on a tick
    /// while the handler runs so a healthy long job never looks stalled.
    /// `false` when the job is no longer active.
    async fn extend_lock(&self, id: &str, lock: Duration) -> Result<bool>;

    async fn complete(&self, id: &str, result: serde_json::Value) -> Result<()>;

    /// Schedule another attempt after backoff.
    async fn retry(&self, id: &str, run_at: DateTime<Utc>, reason: &str) -> Result<()>;

    async fn fail(&self, id: &str, reason: &str) -> Result<()>;

    /// Remove a waiting/delayed job outright. `false` when the job is
    /// active or terminal (cancel must go the cooperative route).
    async fn remove_waiting(&self, id: &str) -> Result<bool>;

    /// Flag an active job for cooperative cancellation. `false` when the
    /// job is not active.
    async fn mark_cancel_requested(&self, id: &str) -> Result<bool>;

    async fn set_progress(&self, id: &str, progress: u8) -> Result<()>;

    /// Re-queue active jobs whose lock expired (worker died mid-job).
    async fn requeue_stalled(&self, queue: QueueName) -> Result<usize>;

    async fn stats(&self, queue: QueueName) -> Result<QueueStats>;

    /// Drop terminal jobs older than the cutoff. Maintenance only; no
    /// correctness impact if skipped.
    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize>;
}

fn apply_insert(existing: Option<JobRecord>, job: JobRecord) -> (JobRecord, bool) {
    match existing {
        Some(old) if !old.state.is_terminal() => (old, false),
        _ => (job, true),
    }
}

// ───────────────────────────────────────────────────────────────────────────
// In-memory backend
// ───────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryQueueBackend {
    jobs: Mutex<HashMap<String, JobRecord>>,
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn health(&self) -> Result<()> {
        Ok(())
    }

    async fn insert(&self, job: JobRecord) -> Result<InsertOutcome> {
        let mut jobs = self.jobs.lock().unwrap();
        let (record, inserted) = apply_insert(jobs.get(&job.id).cloned(), job);
        jobs.insert(record.id.clone(), record.clone());
        Ok(if inserted {
            InsertOutcome::Inserted(record)
        } else {
            InsertOutcome::Existing(record)
        })
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        Ok(self.jobs.lock().unwrap().get(id).cloned())
    }

    async fn claim(&self, queue: QueueName, lock: Duration) -> Result<Option<JobRecord>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();
        let due_id = jobs
            .values()
            .filter(|j| {
                j.queue == queue
                    && matches!(j.state, JobState::Waiting | JobState::Delayed)
                    && j.run_at <= now
            })
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.created_at.cmp(&a.created_at))
            })
            .map(|j| j.id.clone());

        let Some(id) = due_id else {
            return Ok(None);
        };
        let job = jobs.get_mut(&id).unwrap();
        job.state = JobState::Active;
        job.attempts_made += 1;
        job.processed_on.get_or_insert(now);
        job.locked_until = Some(now + chrono::Duration::from_std(lock).unwrap_or_default());
        Ok(Some(job.clone()))
    }

    async fn extend_lock(&self, id: &str, lock: Duration) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(id) {
            Some(job) if job.state == JobState::Active => {
                job.locked_until =
                    Some(Utc::now() + chrono::Duration::from_std(lock).unwrap_or_default());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, id: &str, result: serde_json::Value) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(id) {
            job.state = JobState::Completed;
            job.finished_on = Some(Utc::now());
            job.locked_until = None;
            job.progress = 100;
            job.result = Some(result);
        }
        Ok(())
    }

    async fn retry(&self, id: &str, run_at: DateTime<Utc>, reason: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(id) {
            job.state = JobState::Delayed;
            job.run_at = run_at;
            job.locked_until = None;
            job.failed_reason = Some(reason.to_string());
        }
        Ok(())
    }

    async fn fail(&self, id: &str, reason: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(id) {
            job.state = JobState::Failed;
            job.finished_on = Some(Utc::now());
            job.locked_until = None;
            job.failed_reason = Some(reason.to_string());
        }
        Ok(())
    }

    async fn remove_waiting(&self, id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get(id) {
            Some(j) if matches!(j.state, JobState::Waiting | JobState::Delayed) => {
                jobs.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_cancel_requested(&self, id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(id) {
            Some(j) if j.state == JobState::Active => {
                j.cancel_requested = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_progress(&self, id: &str, progress: u8) -> Result<()> {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(id) {
            job.progress = progress.min(100);
        }
        Ok(())
    }

    async fn requeue_stalled(&self, queue: QueueName) -> Result<usize> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();
        let mut requeued = 0;
        for job in jobs.values_mut() {
            if job.queue == queue
                && job.state == JobState::Active
                && job.locked_until.is_some_and(|l| l < now)
            {
                warn!("queue {}: ⚠️ job {} stalled, re-queueing", queue.as_str(), job.id);
                job.state = JobState::Waiting;
                job.locked_until = None;
                job.run_at = now;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn stats(&self, queue: QueueName) -> Result<QueueStats> {
        let jobs = self.jobs.lock().unwrap();
        let mut stats = QueueStats::default();
        for job in jobs.values().filter(|j| j.queue == queue) {
            match job.state {
                JobState::Waiting => stats.waiting += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Delayed => stats.delayed += 1,
            }
        }
        Ok(stats)
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|_, j| {
            !(j.state.is_terminal() && j.finished_on.is_some_and(|f| f < older_than))
        });
        Ok(before - jobs.len())
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Postgres backend
// ───────────────────────────────────────────────────────────────────────────

/// Jobs live in a single table; the full record is a JSONB document with a
/// handful of indexed columns mirrored out of it for claiming and sweeps.
pub struct PgQueueBackend {
    pool: PgPool,
}

impl PgQueueBackend {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("failed to connect queue backend")?;
        let backend = Self { pool };
        backend.ensure_schema().await?;
        Ok(backend)
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue_jobs (
                id           TEXT PRIMARY KEY,
                queue        TEXT NOT NULL,
                state        TEXT NOT NULL,
                priority     INT NOT NULL DEFAULT 0,
                run_at       TIMESTAMPTZ NOT NULL,
                locked_until TIMESTAMPTZ,
                finished_on  TIMESTAMPTZ,
                created_at   TIMESTAMPTZ NOT NULL,
                record       JSONB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("queue schema create failed")?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS queue_jobs_due_idx \
             ON queue_jobs (queue, state, run_at, priority)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mutate<F>(&self, id: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut JobRecord) -> bool,
    {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT record FROM queue_jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let mut job: JobRecord = serde_json::from_value(row.get("record"))?;
        if !f(&mut job) {
            return Ok(false);
        }
        sqlx::query(
            "UPDATE queue_jobs SET state = $2, priority = $3, run_at = $4, \
             locked_until = $5, finished_on = $6, record = $7 WHERE id = $1",
        )
        .bind(&job.id)
        .bind(job.state.as_str())
        .bind(job.priority)
        .bind(job.run_at)
        .bind(job.locked_until)
        .bind(job.finished_on)
        .bind(serde_json::to_value(&job)?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl QueueBackend for PgQueueBackend {
    async fn health(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("queue backend unreachable")?;
        Ok(())
    }

    async fn insert(&self, job: JobRecord) -> Result<InsertOutcome> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query("SELECT record FROM queue_jobs WHERE id = $1 FOR UPDATE")
            .bind(&job.id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| serde_json::from_value::<JobRecord>(row.get("record")))
            .transpose()?;

        let (record, inserted) = apply_insert(existing, job);
        sqlx::query(
            "INSERT INTO queue_jobs (id, queue, state, priority, run_at, locked_until, \
                                     finished_on, created_at, record) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO UPDATE SET state = EXCLUDED.state, \
                 priority = EXCLUDED.priority, run_at = EXCLUDED.run_at, \
                 locked_until = EXCLUDED.locked_until, finished_on = EXCLUDED.finished_on, \
                 record = EXCLUDED.record",
        )
        .bind(&record.id)
        .bind(record.queue.as_str())
        .bind(record.state.as_str())
        .bind(record.priority)
        .bind(record.run_at)
        .bind(record.locked_until)
        .bind(record.finished_on)
        .bind(record.created_at)
        .bind(serde_json::to_value(&record)?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(if inserted {
            info!("queue {}: ➕ enqueued {}", record.queue.as_str(), record.id);
            InsertOutcome::Inserted(record)
        } else {
            InsertOutcome::Existing(record)
        })
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query("SELECT record FROM queue_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| serde_json::from_value(r.get("record")).map_err(Into::into))
            .transpose()
    }

    async fn claim(&self, queue: QueueName, lock: Duration) -> Result<Option<JobRecord>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT record FROM queue_jobs \
             WHERE queue = $1 AND state IN ('waiting', 'delayed') AND run_at <= $2 \
             ORDER BY priority DESC, created_at ASC \
             LIMIT 1 FOR UPDATE SKIP LOCKED",
        )
        .bind(queue.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut job: JobRecord = serde_json::from_value(row.get("record"))?;
        job.state = JobState::Active;
        job.attempts_made += 1;
        job.processed_on.get_or_insert(now);
        job.locked_until = Some(now + chrono::Duration::from_std(lock).unwrap_or_default());

        sqlx::query(
            "UPDATE queue_jobs SET state = $2, locked_until = $3, record = $4 WHERE id = $1",
        )
        .bind(&job.id)
        .bind(job.state.as_str())
        .bind(job.locked_until)
        .bind(serde_json::to_value(&job)?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(job))
    }

    async fn extend_lock(&self, id: &str, lock: Duration) -> Result<bool> {
        self.mutate(id, |job| {
            if job.state == JobState::Active {
                job.locked_until =
                    Some(Utc::now() + chrono::Duration::from_std(lock).unwrap_or_default());
                true
            } else {
                false
            }
        })
        .await
    }

    async fn complete(&self, id: &str, result: serde_json::Value) -> Result<()> {
        self.mutate(id, |job| {
            job.state = JobState::Completed;
            job.finished_on = Some(Utc::now());
            job.locked_until = None;
            job.progress = 100;
            job.result = Some(result);
            true
        })
        .await?;
        Ok(())
    }

    async fn retry(&self, id: &str, run_at: DateTime<Utc>, reason: &str) -> Result<()> {
        self.mutate(id, |job| {
            job.state = JobState::Delayed;
            job.run_at = run_at;
            job.locked_until = None;
            job.failed_reason = Some(reason.to_string());
            true
        })
        .await?;
        Ok(())
    }

    async fn fail(&self, id: &str, reason: &str) -> Result<()> {
        self.mutate(id, |job| {
            job.state = JobState::Failed;
            job.finished_on = Some(Utc::now());
            job.locked_until = None;
            job.failed_reason = Some(reason.to_string());
            true
        })
        .await?;
        Ok(())
    }

    async fn remove_waiting(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM queue_jobs WHERE id = $1 AND state IN ('waiting', 'delayed')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_cancel_requested(&self, id: &str) -> Result<bool> {
        self.mutate(id, |job| {
            if job.state == JobState::Active {
                job.cancel_requested = true;
                true
            } else {
                false
            }
        })
        .await
    }

    async fn set_progress(&self, id: &str, progress: u8) -> Result<()> {
        self.mutate(id, |job| {
            job.progress = progress.min(100);
            true
        })
        .await?;
        Ok(())
    }

    async fn requeue_stalled(&self, queue: QueueName) -> Result<usize> {
        let now = Utc::now();
        let rows = sqlx::query(
            "SELECT id FROM queue_jobs \
             WHERE queue = $1 AND state = 'active' AND locked_until < $2",
        )
        .bind(queue.as_str())
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut requeued = 0;
        for row in rows {
            let id: String = row.get("id");
            let changed = self
                .mutate(&id, |job| {
                    if job.state == JobState::Active
                        && job.locked_until.is_some_and(|l| l < Utc::now())
                    {
                        warn!(
                            "queue {}: ⚠️ job {} stalled, re-queueing",
                            job.queue.as_str(),
                            job.id
                        );
                        job.state = JobState::Waiting;
                        job.locked_until = None;
                        job.run_at = Utc::now();
                        true
                    } else {
                        false
                    }
                })
                .await?;
            if changed {
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn stats(&self, queue: QueueName) -> Result<QueueStats> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS n FROM queue_jobs WHERE queue = $1 GROUP BY state",
        )
        .bind(queue.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let state: String = row.get("state");
            let n: i64 = row.get("n");
            let n = n as usize;
            match state.as_str() {
                "waiting" => stats.waiting = n,
                "active" => stats.active = n,
                "completed" => stats.completed = n,
                "failed" => stats.failed = n,
                "delayed" => stats.delayed = n,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            "DELETE FROM queue_jobs \
             WHERE state IN ('completed', 'failed') AND finished_on < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::mission_job_id;
    use uuid::Uuid;

    fn job(id: &str, queue: QueueName) -> JobRecord {
        JobRecord::new(id.to_string(), queue, serde_json::json!({}), 0)
    }

    #[tokio::test]
    async fn insert_is_idempotent_while_live() {
        let backend = MemoryQueueBackend::new();
        let id = mission_job_id(Uuid::new_v4());

        let first = backend.insert(job(&id, QueueName::Missions)).await.unwrap();
        assert!(matches!(first, InsertOutcome::Inserted(_)));

        let second = backend.insert(job(&id, QueueName::Missions)).await.unwrap();
        assert!(matches!(second, InsertOutcome::Existing(_)));

        // Terminal job under the same id gives way to a fresh one.
        backend.fail(&id, "gone").await.unwrap();
        let third = backend.insert(job(&id, QueueName::Missions)).await.unwrap();
        assert!(matches!(third, InsertOutcome::Inserted(_)));
        assert_eq!(third.record().attempts_made, 0);
    }

    #[tokio::test]
    async fn claim_respects_queue_and_run_at() {
        let backend = MemoryQueueBackend::new();
        backend.insert(job("a", QueueName::Missions)).await.unwrap();

        let mut delayed = job("b", QueueName::Missions);
        delayed.run_at = Utc::now() + chrono::Duration::hours(1);
        delayed.state = JobState::Delayed;
        backend.insert(delayed).await.unwrap();

        let claimed = backend
            .claim(QueueName::Missions, Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, "a");
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempts_made, 1);

        // "b" is not yet due; nothing else claimable.
        assert!(backend
            .claim(QueueName::Missions, Duration::from_secs(600))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn claim_prefers_higher_priority() {
        let backend = MemoryQueueBackend::new();
        backend.insert(job("low", QueueName::Scrape)).await.unwrap();
        let mut high = job("high", QueueName::Scrape);
        high.priority = 10;
        backend.insert(high).await.unwrap();

        let claimed = backend
            .claim(QueueName::Scrape, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, "high");
    }

    #[tokio::test]
    async fn cancel_semantics_waiting_vs_active() {
        let backend = MemoryQueueBackend::new();
        backend.insert(job("w", QueueName::Missions)).await.unwrap();
        // Waiting: removed outright.
        assert!(backend.remove_waiting("w").await.unwrap());
        assert!(backend.get("w").await.unwrap().is_none());

        backend.insert(job("a", QueueName::Missions)).await.unwrap();
        backend
            .claim(QueueName::Missions, Duration::from_secs(600))
            .await
            .unwrap();
        // Active: cannot be removed, only flagged.
        assert!(!backend.remove_waiting("a").await.unwrap());
        assert!(backend.mark_cancel_requested("a").await.unwrap());
        assert!(backend.get("a").await.unwrap().unwrap().cancel_requested);
    }

    #[tokio::test]
    async fn stalled_jobs_are_requeued() {
        let backend = MemoryQueueBackend::new();
        backend.insert(job("s", QueueName::Missions)).await.unwrap();
        backend
            .claim(QueueName::Missions, Duration::from_secs(0))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let requeued = backend.requeue_stalled(QueueName::Missions).await.unwrap();
        assert_eq!(requeued, 1);
        let job = backend.get("s").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        // Attempt counter survives the requeue.
        assert_eq!(job.attempts_made, 1);
    }

    #[tokio::test]
    async fn extended_lock_keeps_a_job_out_of_the_stalled_sweep() {
        let backend = MemoryQueueBackend::new();
        backend.insert(job("e", QueueName::Missions)).await.unwrap();
        backend
            .claim(QueueName::Missions, Duration::from_millis(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        // The original lock has lapsed; a renewal rescues the job.
        assert!(backend.extend_lock("e", Duration::from_secs(60)).await.unwrap());
        assert_eq!(backend.requeue_stalled(QueueName::Missions).await.unwrap(), 0);
        let job = backend.get("e").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Active);

        // Renewal is meaningless once the job left the active state.
        backend.fail("e", "done").await.unwrap();
        assert!(!backend.extend_lock("e", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn stats_and_cleanup() {
        let backend = MemoryQueueBackend::new();
        backend.insert(job("1", QueueName::Results)).await.unwrap();
        backend.insert(job("2", QueueName::Results)).await.unwrap();
        backend
            .claim(QueueName::Results, Duration::from_secs(60))
            .await
            .unwrap();
        backend.complete("1", serde_json::json!({})).await.unwrap();

        let stats = backend.stats(QueueName::Results).await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.waiting, 1);

        let removed = backend.cleanup(Utc::now() + chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(backend.get("1").await.unwrap().is_none());
        assert!(backend.get("2").await.unwrap().is_some());
    }
}
