use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;

use super::job::{
    EnqueueOutcome, FailureDisposition, Job, JobHandle, JobStatus, NewJob, TransitionError,
};
use crate::backoff::Backoff;

/// Infrastructure failures of a job store. The store never retries these.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store worker failed: {0}")]
    Task(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("corrupt job record {key}: {detail}")]
    Corrupt { key: String, detail: String },
}

/// How failed jobs re-enter the queue and how long records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    pub backoff: Backoff,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Sets each job's `expire_at`; `None` keeps jobs forever.
    pub retention: Option<Duration>,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::job_default(),
            max_attempts: None,
            retention: Some(Duration::days(30)),
        }
    }
}

impl QueuePolicy {
    /// When a job that has failed `attempts` times becomes eligible again.
    pub fn retry_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = Duration::from_std(self.backoff.delay(attempts)).unwrap_or(Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStatistics {
    pub queued: u64,
    pub publishing: u64,
    pub done: u64,
    pub failed: u64,
}

impl JobStatistics {
    pub fn total(&self) -> u64 {
        self.queued + self.publishing + self.done + self.failed
    }

    pub(crate) fn bump(&mut self, status: JobStatus, by: u64) {
        match status {
            JobStatus::Queued => self.queued += by,
            JobStatus::Publishing => self.publishing += by,
            JobStatus::Done => self.done += by,
            JobStatus::Failed => self.failed += by,
        }
    }
}

/// Persistent keyed collection of jobs.
///
/// `claim_due` is the correctness-critical operation: across any number of
/// concurrent callers, a queued job is handed out at most once.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert if absent. An existing job with the same key, in any status,
    /// makes this a no-op reporting `queued: false`.
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Job>, StoreError>;

    /// Claim up to `limit` due jobs, earliest `publish_at` first.
    async fn claim_due(&self, limit: usize) -> Result<Vec<JobHandle>, StoreError>;

    /// Idempotent. Recorded even when the handle's claim was reclaimed: the
    /// remote publish already happened.
    async fn mark_done(&self, handle: &JobHandle, published_id: &str) -> Result<(), StoreError>;

    /// Count the failure and push `publish_at` out by the backoff. A handle
    /// that no longer owns the claim changes nothing and gets
    /// [`FailureDisposition::Superseded`].
    async fn mark_failed(
        &self,
        handle: &JobHandle,
        error: &str,
    ) -> Result<FailureDisposition, StoreError>;

    /// Return jobs stuck in `publishing` for at least `lease` to the queue.
    async fn reclaim_stale(&self, lease: Duration) -> Result<usize, StoreError>;

    /// Drop finished jobs past their `expire_at`.
    async fn purge_expired(&self) -> Result<usize, StoreError>;

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, StoreError>;

    async fn stats(&self) -> Result<JobStatistics, StoreError>;

    /// Take the scheduler run lock for `owner`. Returns `false` while another
    /// owner holds it. A lock not released within `ttl` is up for grabs.
    async fn try_lock_run(&self, owner: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Release the run lock if `owner` still holds it.
    async fn unlock_run(&self, owner: &str) -> Result<(), StoreError>;
}
