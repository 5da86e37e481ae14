//! SQLite-backed job store. Survives restarts and is shared by every
//! process pointed at the same file.
//!
//! Timestamps are stored as epoch milliseconds so `publish_at` range scans
//! and ordering are plain integer comparisons. Every claim runs in its own
//! `IMMEDIATE` transaction and flips status with a compare-and-set `UPDATE`.
//! The scheduler run lock is a single row in `scheduler_lock`.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use tracing::{debug, warn};

use super::job::{EnqueueOutcome, FailureDisposition, Job, JobHandle, JobStatus, NewJob};
use super::store::{JobStatistics, JobStore, QueuePolicy, StoreError};
use crate::clock::Clock;

const JOB_COLUMNS: &str = "key, artifact_ref, caption, publish_at, status, attempts, \
                           last_error, published_id, created_at, updated_at, expire_at, claim_id";

const RUN_LOCK: &str = "tick";

pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    policy: QueuePolicy,
}

impl SqliteJobStore {
    /// Open or create the job database at `path`.
    pub fn open(path: &Path, clock: Arc<dyn Clock>, policy: QueuePolicy) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::with_connection(conn, clock, policy)
    }

    pub fn open_in_memory(clock: Arc<dyn Clock>, policy: QueuePolicy) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, clock, policy)
    }

    fn with_connection(
        conn: Connection,
        clock: Arc<dyn Clock>,
        policy: QueuePolicy,
    ) -> Result<Self, StoreError> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
            policy,
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Load, transform and write back one job inside a single transaction.
    async fn update<T, F>(&self, key: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Job) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut job = load_job(&tx, &key)?.ok_or_else(|| StoreError::NotFound(key.clone()))?;
            let out = f(&mut job)?;
            save_job(&tx, &job)?;
            tx.commit()?;
            Ok(out)
        })
        .await
    }
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            key          TEXT PRIMARY KEY,
            artifact_ref TEXT NOT NULL,
            caption      TEXT NOT NULL,
            publish_at   INTEGER NOT NULL,
            status       TEXT NOT NULL DEFAULT 'queued',
            attempts     INTEGER NOT NULL DEFAULT 0,
            last_error   TEXT,
            published_id TEXT,
            created_at   INTEGER NOT NULL,
            updated_at   INTEGER NOT NULL,
            expire_at    INTEGER,
            claim_id     TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_status_publish_at ON jobs (status, publish_at);
        CREATE TABLE IF NOT EXISTS scheduler_lock (
            name       TEXT PRIMARY KEY,
            owner      TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );
        ",
    )?;

    // Databases created before claim tokens existed.
    let has_claim_id = conn
        .prepare("SELECT 1 FROM pragma_table_info('jobs') WHERE name = 'claim_id'")?
        .exists([])?;
    if !has_claim_id {
        conn.execute_batch("ALTER TABLE jobs ADD COLUMN claim_id TEXT")?;
    }
    Ok(())
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Raw column values, converted to a [`Job`] outside the rusqlite callback.
struct JobRow {
    key: String,
    artifact_ref: String,
    caption: String,
    publish_at: i64,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    published_id: Option<String>,
    created_at: i64,
    updated_at: i64,
    expire_at: Option<i64>,
    claim_id: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            artifact_ref: row.get(1)?,
            caption: row.get(2)?,
            publish_at: row.get(3)?,
            status: row.get(4)?,
            attempts: row.get(5)?,
            last_error: row.get(6)?,
            published_id: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            expire_at: row.get(10)?,
            claim_id: row.get(11)?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let key = row.key;
        let corrupt = |detail: String| StoreError::Corrupt {
            key: key.clone(),
            detail,
        };
        let time = |ms: i64, field: &str| {
            DateTime::<Utc>::from_timestamp_millis(ms)
                .ok_or_else(|| corrupt(format!("{field} out of range: {ms}")))
        };

        Ok(Job {
            publish_at: time(row.publish_at, "publish_at")?,
            created_at: time(row.created_at, "created_at")?,
            updated_at: time(row.updated_at, "updated_at")?,
            expire_at: row.expire_at.map(|ms| time(ms, "expire_at")).transpose()?,
            status: row.status.parse().map_err(corrupt)?,
            attempts: u32::try_from(row.attempts)
                .map_err(|_| corrupt(format!("negative attempts: {}", row.attempts)))?,
            artifact_ref: row.artifact_ref,
            caption: row.caption,
            last_error: row.last_error,
            published_id: row.published_id,
            claim_id: row.claim_id,
            key: key.clone(),
        })
    }
}

fn load_job(tx: &Transaction<'_>, key: &str) -> Result<Option<Job>, StoreError> {
    let row = tx
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE key = ?1"),
            params![key],
            JobRow::from_row,
        )
        .optional()?;
    row.map(Job::try_from).transpose()
}

fn save_job(tx: &Transaction<'_>, job: &Job) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE jobs
            SET publish_at = ?2, status = ?3, attempts = ?4, last_error = ?5,
                published_id = ?6, updated_at = ?7, claim_id = ?8
          WHERE key = ?1",
        params![
            job.key,
            millis(job.publish_at),
            job.status.as_str(),
            job.attempts,
            job.last_error,
            job.published_id,
            millis(job.updated_at),
            job.claim_id,
        ],
    )?;
    Ok(())
}

/// Claim one candidate in its own transaction. `None` when another caller
/// got there first.
fn claim_one(
    conn: &mut Connection,
    key: &str,
    now: DateTime<Utc>,
) -> Result<Option<JobHandle>, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let claimed = match load_job(&tx, key)? {
        Some(mut job) if job.status == JobStatus::Queued => {
            let handle = job.claim(now)?;
            let changed = tx.execute(
                "UPDATE jobs SET status = 'publishing', updated_at = ?2, claim_id = ?3
                  WHERE key = ?1 AND status = 'queued'",
                params![key, millis(now), handle.claim_id],
            )?;
            (changed == 1).then_some(handle)
        }
        _ => None,
    };
    tx.commit()?;
    Ok(claimed)
}

fn query_jobs(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Job>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, JobRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(Job::try_from).collect()
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome, StoreError> {
        let job = Job::from_new(job, self.clock.now(), &self.policy);
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT (key) DO NOTHING"
                ),
                params![
                    job.key,
                    job.artifact_ref,
                    job.caption,
                    millis(job.publish_at),
                    job.status.as_str(),
                    job.attempts,
                    job.last_error,
                    job.published_id,
                    millis(job.created_at),
                    millis(job.updated_at),
                    job.expire_at.map(millis),
                    job.claim_id,
                ],
            )?;
            Ok(EnqueueOutcome {
                queued: inserted == 1,
                key: job.key,
            })
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<Job>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let job = load_job(&tx, &key)?;
            tx.commit()?;
            Ok(job)
        })
        .await
    }

    async fn claim_due(&self, limit: usize) -> Result<Vec<JobHandle>, StoreError> {
        let now = self.clock.now();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let candidates: Vec<String> = {
                let mut stmt = conn.prepare(
                    "SELECT key FROM jobs
                      WHERE status = 'queued' AND publish_at <= ?1
                      ORDER BY publish_at ASC, created_at ASC, key ASC
                      LIMIT ?2",
                )?;
                stmt.query_map(params![millis(now), limit], |row| row.get(0))?
                    .collect::<rusqlite::Result<_>>()?
            };

            // Claims already committed are handed out even if a later
            // candidate fails; otherwise they would sit in `publishing`
            // until their lease runs out.
            let mut handles = Vec::with_capacity(candidates.len());
            let mut first_error = None;
            for key in candidates {
                match claim_one(conn, &key, now) {
                    Ok(Some(handle)) => handles.push(handle),
                    Ok(None) => debug!(key = %key, "job claimed elsewhere, skipping"),
                    Err(err) => {
                        warn!(key = %key, error = %err, "could not claim job");
                        first_error.get_or_insert(err);
                    }
                }
            }
            match first_error {
                Some(err) if handles.is_empty() => Err(err),
                _ => Ok(handles),
            }
        })
        .await
    }

    async fn mark_done(&self, handle: &JobHandle, published_id: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let published_id = published_id.to_string();
        self.update(&handle.key, move |job| {
            job.complete(&published_id, now)?;
            Ok(())
        })
        .await
    }

    async fn mark_failed(
        &self,
        handle: &JobHandle,
        error: &str,
    ) -> Result<FailureDisposition, StoreError> {
        let now = self.clock.now();
        let policy = self.policy;
        let error = error.to_string();
        let handle = handle.clone();
        let key = handle.key.clone();
        self.update(&key, move |job| Ok(job.fail(&handle, &error, &policy, now)?))
            .await
    }

    async fn reclaim_stale(&self, lease: Duration) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let cutoff = now.checked_sub_signed(lease).unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stale = query_jobs(
                &tx,
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                      WHERE status = 'publishing' AND updated_at <= ?1"
                ),
                params![millis(cutoff)],
            )?;
            for mut job in stale.iter().cloned() {
                job.release_stale(now)?;
                save_job(&tx, &job)?;
            }
            tx.commit()?;
            Ok(stale.len())
        })
        .await
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        self.with_conn(move |conn| {
            let purged = conn.execute(
                "DELETE FROM jobs
                  WHERE expire_at IS NOT NULL AND expire_at <= ?1
                    AND status IN ('done', 'failed')",
                params![millis(now)],
            )?;
            Ok(purged)
        })
        .await
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| match status {
            Some(status) => query_jobs(
                conn,
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1
                      ORDER BY publish_at ASC, key ASC LIMIT ?2"
                ),
                params![status.as_str(), limit],
            ),
            None => query_jobs(
                conn,
                &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY publish_at ASC, key ASC LIMIT ?1"),
                params![limit],
            ),
        })
        .await
    }

    async fn stats(&self) -> Result<JobStatistics, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut stats = JobStatistics::default();
            for (status, count) in rows {
                let status: JobStatus = status.parse().map_err(|detail| StoreError::Corrupt {
                    key: "*".to_string(),
                    detail,
                })?;
                stats.bump(status, u64::try_from(count).unwrap_or(0));
            }
            Ok(stats)
        })
        .await
    }

    async fn try_lock_run(&self, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "DELETE FROM scheduler_lock WHERE name = ?1 AND expires_at <= ?2",
                params![RUN_LOCK, millis(now)],
            )?;
            let taken = tx.execute(
                "INSERT INTO scheduler_lock (name, owner, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (name) DO NOTHING",
                params![RUN_LOCK, owner, millis(expires_at)],
            )?;
            tx.commit()?;
            Ok(taken == 1)
        })
        .await
    }

    async fn unlock_run(&self, owner: &str) -> Result<(), StoreError> {
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM scheduler_lock WHERE name = ?1 AND owner = ?2",
                params![RUN_LOCK, owner],
            )?;
            Ok(())
        })
        .await
    }
}
