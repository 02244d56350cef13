//! Durable job queue with at-least-once delivery.
//!
//! SQLite-backed: one logical queue per job label. A leased job is
//! invisible until its lease expires; a crashed worker's jobs return to
//! the queue when the reaper notices the expired lease. Failures retry
//! with capped exponential backoff until the attempt limit, then land
//! in the dead-letter state for operator attention.

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;
use weft::WeftError;

use crate::error::UploadError;

/// Every queue label in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobLabel {
    NewDataItem,
    Plan,
    Prepare,
    Post,
    Verify,
    OversizedItem,
    Unbundle,
    OpticalPost,
    PutOffsets,
    CleanupFs,
    FinalizePayment,
}

impl JobLabel {
    pub const ALL: [JobLabel; 11] = [
        JobLabel::NewDataItem,
        JobLabel::Plan,
        JobLabel::Prepare,
        JobLabel::Post,
        JobLabel::Verify,
        JobLabel::OversizedItem,
        JobLabel::Unbundle,
        JobLabel::OpticalPost,
        JobLabel::PutOffsets,
        JobLabel::CleanupFs,
        JobLabel::FinalizePayment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobLabel::NewDataItem => "newDataItem",
            JobLabel::Plan => "plan",
            JobLabel::Prepare => "prepare",
            JobLabel::Post => "post",
            JobLabel::Verify => "verify",
            JobLabel::OversizedItem => "oversizedItem",
            JobLabel::Unbundle => "unbundleBdi",
            JobLabel::OpticalPost => "opticalPost",
            JobLabel::PutOffsets => "putOffsets",
            JobLabel::CleanupFs => "cleanupFs",
            JobLabel::FinalizePayment => "finalizePayment",
        }
    }

    /// Suffix for `WORKER_CONCURRENCY_*` environment overrides.
    pub fn env_suffix(&self) -> &'static str {
        match self {
            JobLabel::NewDataItem => "NEW_DATA_ITEM",
            JobLabel::Plan => "PLAN",
            JobLabel::Prepare => "PREPARE",
            JobLabel::Post => "POST",
            JobLabel::Verify => "VERIFY",
            JobLabel::OversizedItem => "OVERSIZED_ITEM",
            JobLabel::Unbundle => "UNBUNDLE",
            JobLabel::OpticalPost => "OPTICAL_POST",
            JobLabel::PutOffsets => "PUT_OFFSETS",
            JobLabel::CleanupFs => "CLEANUP_FS",
            JobLabel::FinalizePayment => "FINALIZE_PAYMENT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub label: JobLabel,
    pub payload: serde_json::Value,
    /// 1-based attempt number of the current delivery.
    pub attempt: u32,
}

/// What became of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFate {
    Retrying { delay_secs: u64 },
    Dead,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 300_000,
        }
    }
}

pub struct JobQueue {
    conn: Mutex<Connection>,
    config: QueueConfig,
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

impl JobQueue {
    pub fn open(path: &str, config: QueueConfig) -> Result<Self, UploadError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                label TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                attempt INTEGER NOT NULL DEFAULT 0,
                run_after INTEGER NOT NULL,
                lease_expires INTEGER,
                created_at INTEGER NOT NULL,
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_pop
                ON jobs(label, state, run_after);
            CREATE INDEX IF NOT EXISTS idx_jobs_lease
                ON jobs(state, lease_expires);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, UploadError> {
        self.conn
            .lock()
            .map_err(|_| UploadError::internal("queue lock poisoned"))
    }

    pub fn enqueue(
        &self,
        label: JobLabel,
        payload: &serde_json::Value,
    ) -> Result<i64, UploadError> {
        self.enqueue_delayed(label, payload, 0)
    }

    pub fn enqueue_delayed(
        &self,
        label: JobLabel,
        payload: &serde_json::Value,
        delay_secs: u64,
    ) -> Result<i64, UploadError> {
        let now = now_ts();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO jobs (label, payload, state, attempt, run_after, created_at)
             VALUES (?1, ?2, 'pending', 0, ?3, ?4)",
            params![
                label.as_str(),
                payload.to_string(),
                now + delay_secs as i64,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Lease the next runnable job of a label. The lease makes the job
    /// invisible to other workers until it expires or is acked.
    pub fn lease(&self, label: JobLabel, lease_secs: u64) -> Result<Option<Job>, UploadError> {
        let now = now_ts();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let next: Option<(i64, String, u32)> = tx
            .query_row(
                "SELECT id, payload, attempt FROM jobs
                 WHERE label = ?1 AND state = 'pending' AND run_after <= ?2
                 ORDER BY run_after ASC, id ASC LIMIT 1",
                params![label.as_str(), now],
                |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? as u32)),
            )
            .optional()?;
        let Some((id, payload, attempt)) = next else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET state = 'leased', attempt = attempt + 1, lease_expires = ?2
             WHERE id = ?1",
            params![id, now + lease_secs as i64],
        )?;
        tx.commit()?;

        let payload = serde_json::from_str(&payload)
            .map_err(|e| UploadError::internal(format!("corrupt job payload: {e}")))?;
        Ok(Some(Job {
            id,
            label,
            payload,
            attempt: attempt + 1,
        }))
    }

    /// Acknowledge a completed job.
    pub fn ack(&self, job_id: i64) -> Result<(), UploadError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM jobs WHERE id = ?1", params![job_id])?;
        Ok(())
    }

    /// Record a failure: requeue with backoff, or dead-letter once the
    /// attempt limit is reached.
    pub fn fail(&self, job: &Job, error: &WeftError) -> Result<JobFate, UploadError> {
        let now = now_ts();
        let conn = self.lock()?;
        if job.attempt >= self.config.max_attempts {
            conn.execute(
                "UPDATE jobs SET state = 'dead', last_error = ?2, lease_expires = NULL
                 WHERE id = ?1",
                params![job.id, error.to_string()],
            )?;
            tracing::error!(
                job = job.id,
                label = job.label.as_str(),
                attempt = job.attempt,
                error = %error,
                "job dead-lettered"
            );
            return Ok(JobFate::Dead);
        }

        let delay = weft::backoff::with_jitter(weft::backoff::delay_for_attempt(
            self.config.backoff_base_ms,
            self.config.backoff_cap_ms,
            job.attempt,
        ));
        let delay_secs = delay.as_secs().max(1);
        conn.execute(
            "UPDATE jobs SET state = 'pending', run_after = ?2, last_error = ?3,
                             lease_expires = NULL
             WHERE id = ?1",
            params![job.id, now + delay_secs as i64, error.to_string()],
        )?;
        Ok(JobFate::Retrying { delay_secs })
    }

    /// Extend a held lease. Returns `false` if the job is no longer
    /// leased (lease expired and was reaped) — the worker must abandon
    /// its work.
    pub fn renew(&self, job_id: i64, lease_secs: u64) -> Result<bool, UploadError> {
        let now = now_ts();
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE jobs SET lease_expires = ?2 WHERE id = ?1 AND state = 'leased'",
            params![job_id, now + lease_secs as i64],
        )?;
        Ok(changed == 1)
    }

    /// Return expired leases to the queue (crashed-worker recovery).
    pub fn reap_expired(&self) -> Result<u64, UploadError> {
        let now = now_ts();
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE jobs SET state = 'pending', lease_expires = NULL
             WHERE state = 'leased' AND lease_expires < ?1",
            params![now],
        )?;
        Ok(changed as u64)
    }

    pub fn pending_count(&self, label: JobLabel) -> Result<u64, UploadError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE label = ?1 AND state = 'pending'",
            params![label.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn dead_count(&self) -> Result<u64, UploadError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE state = 'dead'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
