//! SQLite implementation of [`JobQueue`].
//!
//! Jobs live in a single `jobs` table. The unique index on
//! `idempotency_key` is what collapses duplicate submissions; claiming is a
//! single conditional `UPDATE ... RETURNING`, atomic under SQLite's write
//! lock, so two consumers can never claim the same job.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    retry_delay, ClaimedJob, EnqueueOutcome, FailDisposition, JobQueue, NewJob, QueueError,
    QueueStats,
};

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub struct SqliteQueue {
    /// Exposed to tests so they can rewind `run_at` when exercising backoff.
    pub(crate) conn: Arc<Mutex<Connection>>,
    max_attempts: u32,
}

impl SqliteQueue {
    pub fn new<P: AsRef<Path>>(path: P, max_attempts: u32) -> Result<Self, QueueError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();

        if path_str != ":memory:" && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        QueueError::storage(
                            "create queue directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| QueueError::storage("open queue database", e.to_string()))?;

        conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))
            .map_err(|e| QueueError::storage("set journal_mode", e.to_string()))?;

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                idempotency_key TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'waiting' CHECK(state IN (
                    'waiting', 'active', 'completed', 'failed'
                )),
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                run_at INTEGER NOT NULL,
                claimed_at INTEGER,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_runnable
                ON jobs(state, run_at) WHERE state = 'waiting';
            "#,
        )
        .map_err(|e| QueueError::storage("create jobs table", e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_attempts,
        })
    }

    /// Creates an in-memory queue (for testing).
    pub fn new_in_memory(max_attempts: u32) -> Result<Self, QueueError> {
        Self::new(":memory:", max_attempts)
    }

    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, QueueError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("queue mutex poisoned");
            f(&conn)
        })
        .await
        .map_err(|e| QueueError::storage(operation, e.to_string()))?
    }
}

#[async_trait]
impl JobQueue for SqliteQueue {
    async fn enqueue(&self, job: NewJob<'_>) -> Result<EnqueueOutcome, QueueError> {
        let idempotency_key = job.idempotency_key.to_string();
        let kind = job.kind.to_string();
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| QueueError::storage("enqueue", e.to_string()))?;
        let max_attempts = self.max_attempts;

        self.with_conn("enqueue", move |conn| {
            let now = now_secs();
            conn.execute(
                "INSERT OR IGNORE INTO jobs
                     (idempotency_key, kind, payload, state, max_attempts, run_at,
                      created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'waiting', ?4, ?5, ?5, ?5)",
                params![idempotency_key, kind, payload, max_attempts, now],
            )
            .map_err(|e| QueueError::storage("enqueue", e.to_string()))?;

            if conn.changes() > 0 {
                Ok(EnqueueOutcome::Enqueued)
            } else {
                Ok(EnqueueOutcome::Duplicate)
            }
        })
        .await
    }

    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
        self.with_conn("claim", move |conn| {
            let now = now_secs();
            let row = conn
                .query_row(
                    "UPDATE jobs
                     SET state = 'active', attempts = attempts + 1,
                         claimed_at = ?1, updated_at = ?1
                     WHERE id = (
                         SELECT id FROM jobs
                         WHERE state = 'waiting' AND run_at <= ?1
                         ORDER BY id LIMIT 1
                     )
                     RETURNING id, kind, payload, attempts, max_attempts",
                    params![now],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, u32>(3)?,
                            row.get::<_, u32>(4)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| QueueError::storage("claim", e.to_string()))?;

            match row {
                Some((id, kind, payload, attempt, max_attempts)) => {
                    let payload = serde_json::from_str(&payload)
                        .map_err(|e| QueueError::storage("claim", e.to_string()))?;
                    Ok(Some(ClaimedJob {
                        id,
                        kind,
                        payload,
                        attempt,
                        max_attempts,
                    }))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn complete(&self, job_id: i64) -> Result<(), QueueError> {
        self.with_conn("complete", move |conn| {
            conn.execute(
                "UPDATE jobs SET state = 'completed', updated_at = ?1 WHERE id = ?2",
                params![now_secs(), job_id],
            )
            .map_err(|e| QueueError::storage("complete", e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn fail(&self, job_id: i64, error: &str) -> Result<FailDisposition, QueueError> {
        let error = error.to_string();
        self.with_conn("fail", move |conn| {
            let now = now_secs();
            let (attempts, max_attempts): (u32, u32) = conn
                .query_row(
                    "SELECT attempts, max_attempts FROM jobs WHERE id = ?1",
                    params![job_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|e| QueueError::storage("fail", e.to_string()))?;

            if attempts >= max_attempts {
                conn.execute(
                    "UPDATE jobs SET state = 'failed', last_error = ?1, updated_at = ?2
                     WHERE id = ?3",
                    params![error, now, job_id],
                )
                .map_err(|e| QueueError::storage("fail", e.to_string()))?;
                return Ok(FailDisposition::Failed);
            }

            let delay = retry_delay(attempts);
            conn.execute(
                "UPDATE jobs
                 SET state = 'waiting', last_error = ?1, run_at = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![error, now + delay.as_secs() as i64, now, job_id],
            )
            .map_err(|e| QueueError::storage("fail", e.to_string()))?;
            Ok(FailDisposition::Retrying { delay })
        })
        .await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.with_conn("stats", move |conn| {
            let mut stmt = conn
                .prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .map_err(|e| QueueError::storage("stats", e.to_string()))?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
                })
                .map_err(|e| QueueError::storage("stats", e.to_string()))?;

            let mut stats = QueueStats::default();
            for row in rows {
                let (state, count) =
                    row.map_err(|e| QueueError::storage("stats", e.to_string()))?;
                match state.as_str() {
                    "waiting" => stats.waiting = count,
                    "active" => stats.active = count,
                    "completed" => stats.completed = count,
                    "failed" => stats.failed = count,
                    _ => {}
                }
            }
            Ok(stats)
        })
        .await
    }
}
