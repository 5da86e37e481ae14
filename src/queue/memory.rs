//! In-process job store.
//!
//! One mutex guards the map; every claim re-checks status under the lock
//! before flipping it, which gives the same at-most-one-claim guarantee as a
//! database transaction within a single process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::job::{EnqueueOutcome, FailureDisposition, Job, JobHandle, JobStatus, NewJob};
use super::store::{JobStatistics, JobStore, QueuePolicy, StoreError};
use crate::clock::Clock;

/// Holder of the run lock and when it lapses.
struct RunLock {
    owner: String,
    expires_at: DateTime<Utc>,
}

pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
    run_lock: Mutex<Option<RunLock>>,
    clock: Arc<dyn Clock>,
    policy: QueuePolicy,
}

impl InMemoryJobStore {
    pub fn new(clock: Arc<dyn Clock>, policy: QueuePolicy) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            run_lock: Mutex::new(None),
            clock,
            policy,
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut Job) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut jobs = self.jobs();
        let job = jobs
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        // Work on a copy so a rejected transition leaves the record untouched.
        let mut next = job.clone();
        let out = f(&mut next)?;
        *job = next;
        Ok(out)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome, StoreError> {
        let now = self.clock.now();
        let mut jobs = self.jobs();
        if jobs.contains_key(&job.key) {
            return Ok(EnqueueOutcome {
                queued: false,
                key: job.key,
            });
        }
        let key = job.key.clone();
        jobs.insert(key.clone(), Job::from_new(job, now, &self.policy));
        Ok(EnqueueOutcome { queued: true, key })
    }

    async fn get(&self, key: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs().get(key).cloned())
    }

    async fn claim_due(&self, limit: usize) -> Result<Vec<JobHandle>, StoreError> {
        let now = self.clock.now();

        let candidates: Vec<String> = {
            let jobs = self.jobs();
            let mut due: Vec<&Job> = jobs.values().filter(|job| job.is_due(now)).collect();
            due.sort_by(|a, b| {
                a.publish_at
                    .cmp(&b.publish_at)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.key.cmp(&b.key))
            });
            due.into_iter().take(limit).map(|job| job.key.clone()).collect()
        };

        let mut handles = Vec::with_capacity(candidates.len());
        for key in candidates {
            let mut jobs = self.jobs();
            match jobs.get_mut(&key) {
                Some(job) if job.status == JobStatus::Queued => handles.push(job.claim(now)?),
                _ => debug!(key = %key, "job claimed elsewhere, skipping"),
            }
        }
        Ok(handles)
    }

    async fn mark_done(&self, handle: &JobHandle, published_id: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.update(&handle.key, |job| Ok(job.complete(published_id, now)?))?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        handle: &JobHandle,
        error: &str,
    ) -> Result<FailureDisposition, StoreError> {
        let now = self.clock.now();
        let policy = self.policy;
        self.update(&handle.key, |job| Ok(job.fail(handle, error, &policy, now)?))
    }

    async fn reclaim_stale(&self, lease: Duration) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut reclaimed = 0;
        for job in self.jobs().values_mut() {
            let expired = job.updated_at.checked_add_signed(lease).is_some_and(|at| at <= now);
            if job.status == JobStatus::Publishing && expired {
                job.release_stale(now)?;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut jobs = self.jobs();
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.expire_at.is_some_and(|at| at <= now))
        });
        Ok(before - jobs.len())
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs();
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.publish_at.cmp(&b.publish_at).then(a.key.cmp(&b.key)));
        out.truncate(limit);
        Ok(out)
    }

    async fn stats(&self) -> Result<JobStatistics, StoreError> {
        let mut stats = JobStatistics::default();
        for job in self.jobs().values() {
            stats.bump(job.status, 1);
        }
        Ok(stats)
    }

    async fn try_lock_run(&self, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut lock = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if lock.as_ref().is_some_and(|held| held.expires_at > now) {
            return Ok(false);
        }
        *lock = Some(RunLock {
            owner: owner.to_string(),
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        });
        Ok(true)
    }

    async fn unlock_run(&self, owner: &str) -> Result<(), StoreError> {
        let mut lock = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if lock.as_ref().is_some_and(|held| held.owner == owner) {
            *lock = None;
        }
        Ok(())
    }
}
