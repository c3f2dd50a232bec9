//! SQLite-backed durable job queues for side-effect delivery.
//!
//! Award processing stays synchronous; everything that leaves the process
//! boundary (email, webhooks, push notifications, bulk XP ingest) goes
//! through a queue so a crash never drops work. Jobs survive restarts,
//! retry with exponential backoff, and land in a dead-letter table once
//! their attempts are exhausted.

#![allow(clippy::missing_errors_doc)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

const DISPATCH_MIGRATION_VERSION: i64 = 2;

const SCHEMA_DISPATCH_V1: &str = r"
CREATE TABLE IF NOT EXISTS job_queues (
  queue_name TEXT PRIMARY KEY,
  max_attempts INTEGER NOT NULL CHECK (max_attempts >= 1),
  base_backoff_ms INTEGER NOT NULL CHECK (base_backoff_ms >= 0),
  max_backoff_ms INTEGER NOT NULL CHECK (max_backoff_ms >= 0),
  backoff_multiplier REAL NOT NULL CHECK (backoff_multiplier >= 1.0),
  visibility_timeout_ms INTEGER NOT NULL CHECK (visibility_timeout_ms > 0),
  retention_ms INTEGER NOT NULL CHECK (retention_ms >= 0),
  rate_per_sec REAL NOT NULL CHECK (rate_per_sec > 0.0),
  concurrency INTEGER NOT NULL CHECK (concurrency >= 1)
);

CREATE TABLE IF NOT EXISTS jobs (
  job_id TEXT PRIMARY KEY,
  queue_name TEXT NOT NULL,
  job_type TEXT NOT NULL,
  payload_json TEXT NOT NULL DEFAULT '{}',
  state TEXT NOT NULL CHECK (state IN ('waiting', 'active', 'done', 'cancelled')),
  priority INTEGER NOT NULL DEFAULT 0,
  attempt_count INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
  max_attempts INTEGER NOT NULL CHECK (max_attempts >= 1),
  run_at_ms INTEGER NOT NULL,
  claimed_at_ms INTEGER,
  dedupe_key TEXT,
  last_error TEXT,
  created_at_ms INTEGER NOT NULL,
  updated_at_ms INTEGER NOT NULL,
  FOREIGN KEY (queue_name) REFERENCES job_queues(queue_name)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_queue_dedupe
  ON jobs(queue_name, dedupe_key) WHERE dedupe_key IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_jobs_queue_state_run
  ON jobs(queue_name, state, priority, run_at_ms);

CREATE TABLE IF NOT EXISTS dead_letters (
  job_id TEXT PRIMARY KEY,
  queue_name TEXT NOT NULL,
  job_type TEXT NOT NULL,
  payload_json TEXT NOT NULL DEFAULT '{}',
  priority INTEGER NOT NULL DEFAULT 0,
  attempt_count INTEGER NOT NULL,
  reason TEXT,
  dead_at_ms INTEGER NOT NULL,
  replayed INTEGER NOT NULL DEFAULT 0 CHECK (replayed IN (0, 1)),
  replayed_at_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_dead_letters_queue_dead
  ON dead_letters(queue_name, replayed, dead_at_ms);
";

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Done,
    Cancelled,
    Dead,
}

impl JobState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Dead => "dead",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "done" => Some(Self::Done),
            "cancelled" => Some(Self::Cancelled),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }
}

/// Handler verdict for one delivery attempt.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum JobError {
    /// Transient trouble; the queue schedules a retry with backoff.
    #[error("retryable job failure: {0}")]
    Retryable(String),
    /// Hopeless payload; goes straight to the dead-letter table.
    #[error("permanent job failure: {0}")]
    Permanent(String),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct QueueConfig {
    pub queue_name: String,
    pub max_attempts: u32,
    pub base_backoff_ms: i64,
    pub max_backoff_ms: i64,
    pub backoff_multiplier: f64,
    pub visibility_timeout_ms: i64,
    pub retention_ms: i64,
    pub rate_per_sec: f64,
    pub concurrency: u32,
}

impl QueueConfig {
    /// Exponential backoff for the retry that follows `attempt_no`, capped
    /// at `max_backoff_ms`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn next_backoff_ms(&self, attempt_no: u32) -> i64 {
        let attempt_no = attempt_no.max(1);
        let exponent = i32::try_from(attempt_no - 1).unwrap_or(i32::MAX);
        let raw = (self.base_backoff_ms as f64) * self.backoff_multiplier.powi(exponent);
        (raw.round() as i64).min(self.max_backoff_ms)
    }
}

/// Built-in queue topology. Every queue is admin-tunable after seeding.
#[must_use]
pub fn default_queues() -> Vec<QueueConfig> {
    let base = |name: &str, max_attempts: u32, rate_per_sec: f64, concurrency: u32| QueueConfig {
        queue_name: name.to_string(),
        max_attempts,
        base_backoff_ms: 1_000,
        max_backoff_ms: 300_000,
        backoff_multiplier: 2.0,
        visibility_timeout_ms: 60_000,
        retention_ms: 7 * 24 * 60 * 60 * 1_000,
        rate_per_sec,
        concurrency,
    };

    vec![
        base("email", 5, 10.0, 2),
        base("webhook", 8, 25.0, 4),
        base("notification", 5, 50.0, 4),
        base("xp_ingest", 3, 100.0, 2),
    ]
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct Job {
    pub job_id: Ulid,
    pub queue_name: String,
    pub job_type: String,
    pub payload: Value,
    pub state: JobState,
    pub priority: i64,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub run_at: OffsetDateTime,
    pub claimed_at: Option<OffsetDateTime>,
    pub dedupe_key: Option<String>,
    pub last_error: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct DeadJob {
    pub job_id: Ulid,
    pub queue_name: String,
    pub job_type: String,
    pub payload: Value,
    pub attempt_count: u32,
    pub reason: Option<String>,
    pub dead_at: OffsetDateTime,
    pub replayed: bool,
}

/// Per-job knobs at submission time. `max_attempts` overrides the queue
/// default; everything else defaults to an immediate, unprioritized job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub priority: i64,
    pub dedupe_key: Option<String>,
    pub max_attempts: Option<u32>,
    pub delay_ms: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Eq, PartialEq)]
pub struct QueueDepths {
    pub queue_name: String,
    pub waiting: i64,
    pub active: i64,
    pub dead: i64,
}

/// Durable job queue over a shared SQLite connection. `Clone` hands out
/// another handle to the same connection, so the CLI, the service, and
/// worker threads can all point at one database.
#[derive(Clone)]
pub struct SqliteJobQueue {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobQueue {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open sqlite database at {db_path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("job queue connection lock poisoned"))
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_DISPATCH_V1)
            .context("failed to apply dispatch schema")?;

        let now = grit_ledger_core::format_rfc3339(grit_ledger_core::now_utc())
            .map_err(|err| anyhow!(err.to_string()))?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![DISPATCH_MIGRATION_VERSION, now],
        )
        .context("failed to register dispatch schema migration")?;

        for config in default_queues() {
            conn.execute(
                "INSERT OR IGNORE INTO job_queues(
                    queue_name, max_attempts, base_backoff_ms, max_backoff_ms,
                    backoff_multiplier, visibility_timeout_ms, retention_ms, rate_per_sec,
                    concurrency
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    config.queue_name,
                    i64::from(config.max_attempts),
                    config.base_backoff_ms,
                    config.max_backoff_ms,
                    config.backoff_multiplier,
                    config.visibility_timeout_ms,
                    config.retention_ms,
                    config.rate_per_sec,
                    i64::from(config.concurrency),
                ],
            )
            .with_context(|| format!("failed to seed queue {}", config.queue_name))?;
        }

        Ok(())
    }

    pub fn upsert_queue(&self, config: &QueueConfig) -> Result<()> {
        if config.queue_name.trim().is_empty() {
            return Err(anyhow!("queue_name MUST NOT be empty"));
        }

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO job_queues(
                queue_name, max_attempts, base_backoff_ms, max_backoff_ms,
                backoff_multiplier, visibility_timeout_ms, retention_ms, rate_per_sec,
                concurrency
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(queue_name) DO UPDATE SET
               max_attempts = excluded.max_attempts,
               base_backoff_ms = excluded.base_backoff_ms,
               max_backoff_ms = excluded.max_backoff_ms,
               backoff_multiplier = excluded.backoff_multiplier,
               visibility_timeout_ms = excluded.visibility_timeout_ms,
               retention_ms = excluded.retention_ms,
               rate_per_sec = excluded.rate_per_sec,
               concurrency = excluded.concurrency",
            params![
                config.queue_name,
                i64::from(config.max_attempts),
                config.base_backoff_ms,
                config.max_backoff_ms,
                config.backoff_multiplier,
                config.visibility_timeout_ms,
                config.retention_ms,
                config.rate_per_sec,
                i64::from(config.concurrency),
            ],
        )
        .context("failed to upsert queue config")?;
        Ok(())
    }

    pub fn queue_config(&self, queue_name: &str) -> Result<Option<QueueConfig>> {
        let conn = self.lock()?;
        queue_config_locked(&conn, queue_name)
    }

    pub fn list_queues(&self) -> Result<Vec<QueueConfig>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT queue_name, max_attempts, base_backoff_ms, max_backoff_ms,
                    backoff_multiplier, visibility_timeout_ms, retention_ms, rate_per_sec,
                    concurrency
             FROM job_queues ORDER BY queue_name ASC",
        )?;
        let rows = stmt.query_map([], parse_queue_row)?;
        collect_rows(rows)
    }

    /// Enqueues a job, optionally delayed or prioritized. A `dedupe_key`
    /// collapses repeat submissions: if a job with the same key already sits
    /// in the queue, the existing job comes back instead of a new row.
    pub fn enqueue(
        &self,
        queue_name: &str,
        job_type: &str,
        payload: &Value,
        options: &EnqueueOptions,
        now: OffsetDateTime,
    ) -> Result<Job> {
        if job_type.trim().is_empty() {
            return Err(anyhow!("job_type MUST NOT be empty"));
        }
        if options.delay_ms < 0 {
            return Err(anyhow!("delay_ms MUST be >= 0"));
        }
        if options.max_attempts == Some(0) {
            return Err(anyhow!("max_attempts override MUST be >= 1"));
        }

        let conn = self.lock()?;
        let Some(config) = queue_config_locked(&conn, queue_name)? else {
            return Err(anyhow!("unknown queue {queue_name}"));
        };
        let max_attempts = options.max_attempts.unwrap_or(config.max_attempts);

        let job_id = Ulid::new();
        let now_ms = dt_to_ms(now);
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO jobs(
                    job_id, queue_name, job_type, payload_json, state, priority, attempt_count,
                    max_attempts, run_at_ms, claimed_at_ms, dedupe_key, last_error,
                    created_at_ms, updated_at_ms
                 ) VALUES (?1, ?2, ?3, ?4, 'waiting', ?5, 0, ?6, ?7, NULL, ?8, NULL, ?9, ?9)",
                params![
                    job_id.to_string(),
                    queue_name,
                    job_type,
                    serde_json::to_string(payload).context("failed to serialize job payload")?,
                    options.priority,
                    i64::from(max_attempts),
                    now_ms + options.delay_ms,
                    options.dedupe_key.as_deref(),
                    now_ms,
                ],
            )
            .context("failed to enqueue job")?;

        if inserted == 0 {
            // Dedupe hit: surface the job already holding the key.
            let key = options
                .dedupe_key
                .as_deref()
                .ok_or_else(|| anyhow!("enqueue ignored without a dedupe_key"))?;
            return load_job_by_dedupe(&conn, queue_name, key)?
                .ok_or_else(|| anyhow!("dedupe collision but existing job not found"));
        }

        load_job(&conn, job_id)?.ok_or_else(|| anyhow!("job vanished right after enqueue"))
    }

    /// Claims the next runnable job in a queue, highest priority first and
    /// oldest within a priority, marking it active and consuming one
    /// attempt. Returns `None` when nothing is due.
    pub fn claim_next(&self, queue_name: &str, now: OffsetDateTime) -> Result<Option<Job>> {
        let conn = self.lock()?;
        let now_ms = dt_to_ms(now);

        let job_id: Option<String> = conn
            .query_row(
                "SELECT job_id FROM jobs
                 WHERE queue_name = ?1 AND state = 'waiting' AND run_at_ms <= ?2
                 ORDER BY priority DESC, run_at_ms ASC, job_id ASC
                 LIMIT 1",
                params![queue_name, now_ms],
                |row| row.get(0),
            )
            .optional()
            .context("failed to select claimable job")?;

        let Some(job_id) = job_id else {
            return Ok(None);
        };

        conn.execute(
            "UPDATE jobs SET
                state = 'active',
                attempt_count = attempt_count + 1,
                claimed_at_ms = ?2,
                updated_at_ms = ?2
             WHERE job_id = ?1",
            params![job_id, now_ms],
        )
        .context("failed to claim job")?;

        let parsed = Ulid::from_string(&job_id).context("corrupt job_id column")?;
        load_job(&conn, parsed)
    }

    pub fn ack_success(&self, job_id: Ulid, now: OffsetDateTime) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE jobs SET state = 'done', claimed_at_ms = NULL, updated_at_ms = ?2
                 WHERE job_id = ?1 AND state = 'active'",
                params![job_id.to_string(), dt_to_ms(now)],
            )
            .context("failed to ack job success")?;
        if updated == 0 {
            return Err(anyhow!("job {job_id} is not active"));
        }
        Ok(())
    }

    /// Records a failed attempt. Either schedules a backoff retry or, once
    /// attempts are exhausted, moves the job to the dead-letter table.
    pub fn ack_failure(&self, job_id: Ulid, error: &str, now: OffsetDateTime) -> Result<JobState> {
        let conn = self.lock()?;
        let Some(job) = load_job(&conn, job_id)? else {
            return Err(anyhow!("unknown job {job_id}"));
        };
        if job.state != JobState::Active {
            return Err(anyhow!("job {job_id} is not active"));
        }

        let config = queue_config_locked(&conn, &job.queue_name)?
            .ok_or_else(|| anyhow!("queue {} disappeared", job.queue_name))?;

        if job.attempt_count >= job.max_attempts {
            bury_locked(&conn, &job, error, now)?;
            return Ok(JobState::Dead);
        }

        let backoff = config.next_backoff_ms(job.attempt_count);
        conn.execute(
            "UPDATE jobs SET
                state = 'waiting',
                run_at_ms = ?2,
                claimed_at_ms = NULL,
                last_error = ?3,
                updated_at_ms = ?4
             WHERE job_id = ?1",
            params![
                job_id.to_string(),
                dt_to_ms(now) + backoff,
                error,
                dt_to_ms(now),
            ],
        )
        .context("failed to schedule retry")?;
        Ok(JobState::Waiting)
    }

    /// Dead-letters an active job immediately, skipping remaining retries.
    pub fn bury(&self, job_id: Ulid, reason: &str, now: OffsetDateTime) -> Result<()> {
        let conn = self.lock()?;
        let Some(job) = load_job(&conn, job_id)? else {
            return Err(anyhow!("unknown job {job_id}"));
        };
        if job.state != JobState::Active {
            return Err(anyhow!("job {job_id} is not active"));
        }
        bury_locked(&conn, &job, reason, now)
    }

    /// Returns lapsed active jobs to the queue. A worker that died
    /// mid-attempt has already consumed that attempt, so a repeatedly
    /// crashing job still converges on the dead-letter table.
    pub fn release_timed_out(&self, now: OffsetDateTime) -> Result<usize> {
        let conn = self.lock()?;
        let now_ms = dt_to_ms(now);

        let expired: Vec<(String, String, i64, i64)> = {
            let mut stmt = conn.prepare(
                "SELECT j.job_id, j.queue_name, j.attempt_count, j.max_attempts
                 FROM jobs j JOIN job_queues q ON q.queue_name = j.queue_name
                 WHERE j.state = 'active'
                   AND j.claimed_at_ms IS NOT NULL
                   AND j.claimed_at_ms + q.visibility_timeout_ms <= ?1",
                )?;
            let rows = stmt.query_map(params![now_ms], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            collect_rows(rows)?
        };

        let mut released = 0_usize;
        for (job_id, queue_name, attempt_count, max_attempts) in expired {
            let config = queue_config_locked(&conn, &queue_name)?
                .ok_or_else(|| anyhow!("queue {queue_name} disappeared"))?;
            let attempts = u32::try_from(attempt_count).context("invalid attempt_count")?;
            let budget = u32::try_from(max_attempts).context("invalid max_attempts")?;

            if attempts >= budget {
                let parsed = Ulid::from_string(&job_id).context("corrupt job_id column")?;
                if let Some(job) = load_job(&conn, parsed)? {
                    bury_locked(&conn, &job, "visibility timeout exceeded", now)?;
                }
            } else {
                conn.execute(
                    "UPDATE jobs SET
                        state = 'waiting',
                        run_at_ms = ?2,
                        claimed_at_ms = NULL,
                        last_error = 'visibility timeout exceeded',
                        updated_at_ms = ?2
                     WHERE job_id = ?1",
                    params![job_id, now_ms + config.next_backoff_ms(attempts)],
                )
                .context("failed to release timed-out job")?;
            }
            released += 1;
        }

        Ok(released)
    }

    /// Cancels a waiting job. Active jobs cannot be cancelled; their
    /// attempt is already in flight.
    pub fn cancel(&self, job_id: Ulid, now: OffsetDateTime) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE jobs SET state = 'cancelled', updated_at_ms = ?2
                 WHERE job_id = ?1 AND state = 'waiting'",
                params![job_id.to_string(), dt_to_ms(now)],
            )
            .context("failed to cancel job")?;
        Ok(updated > 0)
    }

    /// Deletes finished and cancelled jobs older than each queue's
    /// retention window.
    pub fn sweep_retention(&self, now: OffsetDateTime) -> Result<usize> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM jobs WHERE job_id IN (
                    SELECT j.job_id FROM jobs j
                    JOIN job_queues q ON q.queue_name = j.queue_name
                    WHERE j.state IN ('done', 'cancelled')
                      AND j.updated_at_ms + q.retention_ms <= ?1
                 )",
                params![dt_to_ms(now)],
            )
            .context("failed to sweep retention")?;
        Ok(deleted)
    }

    pub fn get_job(&self, job_id: Ulid) -> Result<Option<Job>> {
        let conn = self.lock()?;
        load_job(&conn, job_id)
    }

    pub fn list_dead(&self, queue_name: Option<&str>, limit: usize) -> Result<Vec<DeadJob>> {
        let conn = self.lock()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        if let Some(queue) = queue_name {
            let mut stmt = conn.prepare(
                "SELECT job_id, queue_name, job_type, payload_json, attempt_count, reason,
                        dead_at_ms, replayed
                 FROM dead_letters
                 WHERE queue_name = ?1 AND replayed = 0
                 ORDER BY dead_at_ms DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![queue, limit], parse_dead_row)?;
            collect_rows(rows)
        } else {
            let mut stmt = conn.prepare(
                "SELECT job_id, queue_name, job_type, payload_json, attempt_count, reason,
                        dead_at_ms, replayed
                 FROM dead_letters
                 WHERE replayed = 0
                 ORDER BY dead_at_ms DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], parse_dead_row)?;
            collect_rows(rows)
        }
    }

    /// Requeues a dead-lettered job with a fresh attempt budget and marks
    /// the dead-letter row replayed so it is not replayed twice.
    pub fn replay_dead(&self, job_id: Ulid, now: OffsetDateTime) -> Result<Job> {
        let conn = self.lock()?;

        let row: Option<(String, String, String, i64)> = conn
            .query_row(
                "SELECT queue_name, job_type, payload_json, priority FROM dead_letters
                 WHERE job_id = ?1 AND replayed = 0",
                params![job_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .context("failed to load dead letter")?;

        let Some((queue_name, job_type, payload_json, priority)) = row else {
            return Err(anyhow!("no replayable dead letter for job {job_id}"));
        };

        let config = queue_config_locked(&conn, &queue_name)?
            .ok_or_else(|| anyhow!("queue {queue_name} disappeared"))?;

        let now_ms = dt_to_ms(now);
        conn.execute(
            "INSERT INTO jobs(
                job_id, queue_name, job_type, payload_json, state, priority, attempt_count,
                max_attempts, run_at_ms, claimed_at_ms, dedupe_key, last_error,
                created_at_ms, updated_at_ms
             ) VALUES (?1, ?2, ?3, ?4, 'waiting', ?5, 0, ?6, ?7, NULL, NULL, NULL, ?7, ?7)",
            params![
                job_id.to_string(),
                queue_name,
                job_type,
                payload_json,
                priority,
                i64::from(config.max_attempts),
                now_ms,
            ],
        )
        .context("failed to requeue dead letter")?;

        conn.execute(
            "UPDATE dead_letters SET replayed = 1, replayed_at_ms = ?2 WHERE job_id = ?1",
            params![job_id.to_string(), now_ms],
        )
        .context("failed to mark dead letter replayed")?;

        load_job(&conn, job_id)?.ok_or_else(|| anyhow!("replayed job not found"))
    }

    pub fn depths(&self) -> Result<Vec<QueueDepths>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT q.queue_name,
                    COALESCE(SUM(CASE WHEN j.state = 'waiting' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN j.state = 'active' THEN 1 ELSE 0 END), 0),
                    (SELECT COUNT(*) FROM dead_letters d
                      WHERE d.queue_name = q.queue_name AND d.replayed = 0)
             FROM job_queues q
             LEFT JOIN jobs j ON j.queue_name = q.queue_name
             GROUP BY q.queue_name
             ORDER BY q.queue_name ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(QueueDepths {
                queue_name: row.get(0)?,
                waiting: row.get(1)?,
                active: row.get(2)?,
                dead: row.get(3)?,
            })
        })?;
        collect_rows(rows)
    }
}

fn queue_config_locked(conn: &Connection, queue_name: &str) -> Result<Option<QueueConfig>> {
    conn.query_row(
        "SELECT queue_name, max_attempts, base_backoff_ms, max_backoff_ms,
                backoff_multiplier, visibility_timeout_ms, retention_ms, rate_per_sec,
                concurrency
         FROM job_queues WHERE queue_name = ?1",
        params![queue_name],
        parse_queue_row,
    )
    .optional()
    .context("failed to load queue config")
}

fn bury_locked(conn: &Connection, job: &Job, reason: &str, now: OffsetDateTime) -> Result<()> {
    conn.execute(
        "INSERT INTO dead_letters(
            job_id, queue_name, job_type, payload_json, priority, attempt_count,
            reason, dead_at_ms, replayed
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
        params![
            job.job_id.to_string(),
            job.queue_name,
            job.job_type,
            serde_json::to_string(&job.payload).context("failed to serialize dead payload")?,
            job.priority,
            i64::from(job.attempt_count),
            reason,
            dt_to_ms(now),
        ],
    )
    .context("failed to insert dead letter")?;

    conn.execute(
        "DELETE FROM jobs WHERE job_id = ?1",
        params![job.job_id.to_string()],
    )
    .context("failed to remove dead job from queue")?;
    Ok(())
}

const JOB_COLUMNS: &str = "job_id, queue_name, job_type, payload_json, state, priority,
    attempt_count, max_attempts, run_at_ms, claimed_at_ms, dedupe_key, last_error,
    created_at_ms, updated_at_ms";

fn load_job(conn: &Connection, job_id: Ulid) -> Result<Option<Job>> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
        params![job_id.to_string()],
        parse_job_row,
    )
    .optional()
    .context("failed to load job")
}

fn load_job_by_dedupe(conn: &Connection, queue_name: &str, key: &str) -> Result<Option<Job>> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE queue_name = ?1 AND dedupe_key = ?2"),
        params![queue_name, key],
        parse_job_row,
    )
    .optional()
    .context("failed to load deduplicated job")
}

fn parse_queue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueConfig> {
    let max_attempts: i64 = row.get(1)?;
    let concurrency: i64 = row.get(8)?;
    Ok(QueueConfig {
        queue_name: row.get(0)?,
        max_attempts: u32::try_from(max_attempts).map_err(|err| to_sql_error(1, &err))?,
        base_backoff_ms: row.get(2)?,
        max_backoff_ms: row.get(3)?,
        backoff_multiplier: row.get(4)?,
        visibility_timeout_ms: row.get(5)?,
        retention_ms: row.get(6)?,
        rate_per_sec: row.get(7)?,
        concurrency: u32::try_from(concurrency).map_err(|err| to_sql_error(8, &err))?,
    })
}

fn parse_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let job_id_raw: String = row.get(0)?;
    let job_id = Ulid::from_string(&job_id_raw).map_err(|err| to_sql_error(0, &err))?;
    let payload_raw: String = row.get(3)?;
    let payload: Value =
        serde_json::from_str(&payload_raw).map_err(|err| to_sql_error(3, &err))?;
    let state_raw: String = row.get(4)?;
    let state = JobState::parse(&state_raw)
        .ok_or_else(|| to_sql_error(4, &format!("unknown job state: {state_raw}")))?;
    let attempt_count: i64 = row.get(6)?;
    let max_attempts: i64 = row.get(7)?;
    let claimed_at_ms: Option<i64> = row.get(9)?;

    Ok(Job {
        job_id,
        queue_name: row.get(1)?,
        job_type: row.get(2)?,
        payload,
        state,
        priority: row.get(5)?,
        attempt_count: u32::try_from(attempt_count).map_err(|err| to_sql_error(6, &err))?,
        max_attempts: u32::try_from(max_attempts).map_err(|err| to_sql_error(7, &err))?,
        run_at: ms_to_dt(row.get(8)?).map_err(|err| to_sql_error(8, &err))?,
        claimed_at: match claimed_at_ms {
            Some(ms) => Some(ms_to_dt(ms).map_err(|err| to_sql_error(9, &err))?),
            None => None,
        },
        dedupe_key: row.get(10)?,
        last_error: row.get(11)?,
        created_at: ms_to_dt(row.get(12)?).map_err(|err| to_sql_error(12, &err))?,
        updated_at: ms_to_dt(row.get(13)?).map_err(|err| to_sql_error(13, &err))?,
    })
}

fn parse_dead_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeadJob> {
    let job_id_raw: String = row.get(0)?;
    let job_id = Ulid::from_string(&job_id_raw).map_err(|err| to_sql_error(0, &err))?;
    let payload_raw: String = row.get(3)?;
    let payload: Value =
        serde_json::from_str(&payload_raw).map_err(|err| to_sql_error(3, &err))?;
    let attempt_count: i64 = row.get(4)?;
    let replayed: i64 = row.get(7)?;

    Ok(DeadJob {
        job_id,
        queue_name: row.get(1)?,
        job_type: row.get(2)?,
        payload,
        attempt_count: u32::try_from(attempt_count).map_err(|err| to_sql_error(4, &err))?,
        reason: row.get(5)?,
        dead_at: ms_to_dt(row.get(6)?).map_err(|err| to_sql_error(6, &err))?,
        replayed: replayed != 0,
    })
}

fn to_sql_error(idx: usize, err: &impl ToString) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[must_use]
pub fn dt_to_ms(value: OffsetDateTime) -> i64 {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

pub fn ms_to_dt(ms: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .with_context(|| format!("epoch-ms value out of range: {ms}"))
}

/// Simple token bucket used to pace one worker thread against its queue's
/// `rate_per_sec`.
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    #[must_use]
    pub fn new(rate_per_sec: f64) -> Self {
        let capacity = rate_per_sec.max(1.0);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: rate_per_sec.max(f64::MIN_POSITIVE),
            last_refill: Instant::now(),
        }
    }

    /// Takes one token if available; refills based on elapsed wall time.
    pub fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// One delivery handler per queue. Implementations must be side-effect
/// idempotent: a crash between effect and ack means redelivery.
pub trait JobHandler: Send + Sync {
    fn queue_name(&self) -> &str;
    fn handle(&self, job: &Job) -> Result<(), JobError>;
}

/// Worker pool with `concurrency` threads per queue, all sharing that
/// queue's token bucket so the rate limit applies to the queue as a whole.
/// Each thread claims, runs the handler, and acks inside one iteration.
pub struct WorkerPool {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        queue: &SqliteJobQueue,
        handlers: Vec<Arc<dyn JobHandler>>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();

        for handler in handlers {
            let config = queue
                .queue_config(handler.queue_name())?
                .ok_or_else(|| anyhow!("unknown queue {}", handler.queue_name()))?;
            let bucket = Arc::new(Mutex::new(TokenBucket::new(config.rate_per_sec)));

            for _ in 0..config.concurrency {
                let queue = queue.clone();
                let stop = Arc::clone(&shutdown);
                let handler = Arc::clone(&handler);
                let config = config.clone();
                let bucket = Arc::clone(&bucket);

                handles.push(std::thread::spawn(move || {
                    worker_loop(&queue, handler.as_ref(), &config, &bucket, &stop, poll_interval);
                }));
            }
        }

        Ok(Self { shutdown, handles })
    }

    /// Signals every worker and joins the threads.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles {
            if handle.join().is_err() {
                tracing::warn!("worker thread panicked during shutdown");
            }
        }
    }
}

fn worker_loop(
    queue: &SqliteJobQueue,
    handler: &dyn JobHandler,
    config: &QueueConfig,
    bucket: &Mutex<TokenBucket>,
    stop: &AtomicBool,
    poll_interval: Duration,
) {
    let queue_name = config.queue_name.as_str();
    tracing::info!(queue = queue_name, "worker started");

    while !stop.load(Ordering::SeqCst) {
        let took = match bucket.lock() {
            Ok(mut guard) => guard.try_take(),
            Err(_) => {
                tracing::error!(queue = queue_name, "token bucket lock poisoned");
                break;
            }
        };
        if !took {
            std::thread::sleep(poll_interval);
            continue;
        }

        let now = grit_ledger_core::now_utc();
        if let Err(err) = queue.release_timed_out(now) {
            tracing::warn!(queue = queue_name, error = %err, "timeout sweep failed");
        }

        let claimed = match queue.claim_next(queue_name, now) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(queue = queue_name, error = %err, "claim failed");
                std::thread::sleep(poll_interval);
                continue;
            }
        };

        let Some(job) = claimed else {
            std::thread::sleep(poll_interval);
            continue;
        };

        let job_id = job.job_id;
        let ack_result = match handler.handle(&job) {
            Ok(()) => {
                tracing::info!(queue = queue_name, job = %job_id, "job done");
                queue.ack_success(job_id, grit_ledger_core::now_utc())
            }
            Err(JobError::Retryable(reason)) => {
                tracing::warn!(queue = queue_name, job = %job_id, %reason, "job failed, retrying");
                queue
                    .ack_failure(job_id, &reason, grit_ledger_core::now_utc())
                    .map(|_| ())
            }
            Err(JobError::Permanent(reason)) => {
                tracing::error!(queue = queue_name, job = %job_id, %reason, "job dead-lettered");
                queue.bury(job_id, &reason, grit_ledger_core::now_utc())
            }
        };

        if let Err(err) = ack_result {
            tracing::warn!(queue = queue_name, job = %job_id, error = %err, "ack failed");
        }
    }

    tracing::info!(queue = queue_name, "worker stopped");
}
