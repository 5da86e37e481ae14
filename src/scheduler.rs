//! The tick: reclaim stale leases, claim due jobs, publish each one and
//! record the outcome. At most one tick runs at a time, in this process
//! through the run flag and across processes through the store's run lock.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::publish::Publisher;
use crate::queue::{FailureDisposition, JobHandle, JobStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Most jobs claimed per tick.
    pub batch_size: usize,
    /// Jobs published at once. 1 keeps `publish_at` order.
    pub concurrency: usize,
    /// How long a job may sit in `publishing` before it is handed out again.
    /// Must outlast one worst-case publish.
    pub lease: chrono::Duration,
}

impl SchedulerSettings {
    /// How long the store run lock is held at most: one lease for every
    /// round of `concurrency` publishes in a full batch.
    pub fn run_lock_ttl(&self) -> chrono::Duration {
        let rounds = self.batch_size.div_ceil(self.concurrency.max(1)).max(1);
        i32::try_from(rounds)
            .ok()
            .and_then(|rounds| self.lease.checked_mul(rounds))
            .unwrap_or(chrono::Duration::MAX)
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: 1,
            lease: chrono::Duration::minutes(30),
        }
    }
}

/// Counts for one completed tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub processed: usize,
    pub published: usize,
    /// Failed and put back in the queue.
    pub failed: usize,
    pub dead_lettered: usize,
    pub reclaimed: usize,
    /// Failed after their claim was reclaimed; left to the new claimer.
    pub superseded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Another tick was already running; nothing was claimed.
    Busy,
    Completed(TickReport),
}

enum JobResult {
    Published,
    Failed(FailureDisposition),
}

/// Releases the run flag when dropped, including on early return or panic.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    publisher: Arc<dyn Publisher>,
    settings: SchedulerSettings,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        publisher: Arc<dyn Publisher>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            publisher,
            settings,
            running: AtomicBool::new(false),
        }
    }

    /// Run one tick, or return [`TickOutcome::Busy`] if one is in progress
    /// here or in any other process using the same store.
    ///
    /// A failed publish never stops the other jobs of the tick. A store error
    /// while recording an outcome is returned after every claimed job has
    /// been processed.
    pub async fn run(&self) -> Result<TickOutcome, StoreError> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            info!("tick skipped, a run is already active");
            return Ok(TickOutcome::Busy);
        };

        let run_id = Uuid::new_v4();
        let owner = run_id.to_string();
        if !self
            .store
            .try_lock_run(&owner, self.settings.run_lock_ttl())
            .await?
        {
            info!("tick skipped, another process holds the run lock");
            return Ok(TickOutcome::Busy);
        }

        let result = self.tick().instrument(info_span!("tick", %run_id)).await;
        if let Err(err) = self.store.unlock_run(&owner).await {
            warn!(error = %err, "could not release the run lock, it will lapse");
        }
        result.map(TickOutcome::Completed)
    }

    async fn tick(&self) -> Result<TickReport, StoreError> {
        let mut report = TickReport {
            reclaimed: self.store.reclaim_stale(self.settings.lease).await?,
            ..TickReport::default()
        };
        if report.reclaimed > 0 {
            warn!(reclaimed = report.reclaimed, "returned stale jobs to the queue");
        }

        let handles = self.store.claim_due(self.settings.batch_size).await?;
        if handles.is_empty() {
            debug!("no due jobs");
            return Ok(report);
        }
        info!(claimed = handles.len(), "claimed due jobs");

        let results: Vec<Result<JobResult, StoreError>> = stream::iter(handles)
            .map(|handle| self.process(handle))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut first_error = None;
        for result in results {
            match result {
                Ok(JobResult::Published) => report.published += 1,
                Ok(JobResult::Failed(FailureDisposition::Requeued { .. })) => report.failed += 1,
                Ok(JobResult::Failed(FailureDisposition::DeadLettered { .. })) => {
                    report.dead_lettered += 1
                }
                Ok(JobResult::Failed(FailureDisposition::Superseded)) => report.superseded += 1,
                Err(err) => {
                    error!(error = %err, "could not record job outcome");
                    first_error.get_or_insert(err);
                    continue;
                }
            }
            report.processed += 1;
        }

        info!(
            processed = report.processed,
            published = report.published,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            superseded = report.superseded,
            "tick finished"
        );
        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    async fn process(&self, handle: JobHandle) -> Result<JobResult, StoreError> {
        let span = info_span!("job", key = %handle.key, attempts = handle.attempts);
        self.publish_one(&handle).instrument(span).await
    }

    async fn publish_one(&self, handle: &JobHandle) -> Result<JobResult, StoreError> {
        match self.publisher.publish(&handle.artifact_ref, &handle.caption).await {
            Ok(published_id) => {
                self.store.mark_done(handle, &published_id).await?;
                info!(published_id = %published_id, "job published");
                Ok(JobResult::Published)
            }
            Err(err) => {
                let disposition = self.store.mark_failed(handle, &err.to_string()).await?;
                match disposition {
                    FailureDisposition::Requeued { attempts, retry_at } => {
                        warn!(error = %err, attempts, %retry_at, "publish failed, job requeued")
                    }
                    FailureDisposition::DeadLettered { attempts } => {
                        error!(error = %err, attempts, "publish failed, attempts exhausted")
                    }
                    FailureDisposition::Superseded => {
                        warn!(error = %err, "publish failed after the claim was reclaimed")
                    }
                }
                Ok(JobResult::Failed(disposition))
            }
        }
    }

    /// Tick every `interval` until `shutdown` resolves. Ticks that fall
    /// behind are skipped, not queued up. Expired jobs are purged after
    /// each tick.
    pub async fn run_every(&self, interval: Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, stopping scheduler");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.run().await {
                        error!(error = %err, "tick failed");
                    }
                    match self.store.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => info!(purged, "purged expired jobs"),
                        Err(err) => error!(error = %err, "purge failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::publish::PublishError;
    use crate::queue::{
        EnqueueOutcome, InMemoryJobStore, Job, JobStatistics, JobStatus, NewJob, QueuePolicy,
        SqliteJobStore,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
    }

    fn memory_store(policy: QueuePolicy) -> (Arc<ManualClock>, Arc<InMemoryJobStore>) {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(InMemoryJobStore::new(clock.clone(), policy));
        (clock, store)
    }

    async fn enqueue(store: &dyn JobStore, url: &str) -> String {
        store
            .enqueue(NewJob::new(url, "hi", "2029-12-31T00:00:00Z").unwrap())
            .await
            .unwrap()
            .key
    }

    /// Publishes everything except URLs containing "bad".
    #[derive(Default)]
    struct ScriptedPublisher {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Publisher for ScriptedPublisher {
        async fn publish(&self, artifact_ref: &str, _caption: &str) -> Result<String, PublishError> {
            self.calls.lock().unwrap().push(artifact_ref.to_string());
            if artifact_ref.contains("bad") {
                Err(PublishError::ContainerFailed {
                    creation_id: "c-bad".into(),
                    detail: "Error: Media download has failed".into(),
                })
            } else {
                Ok(format!("media-{}", self.calls.lock().unwrap().len()))
            }
        }
    }

    fn scheduler(store: Arc<dyn JobStore>, publisher: Arc<dyn Publisher>) -> Scheduler {
        Scheduler::new(store, publisher, SchedulerSettings::default())
    }

    #[tokio::test]
    async fn empty_queue_completes_with_empty_report() {
        let (_, store) = memory_store(QueuePolicy::default());
        let sched = scheduler(store, Arc::new(ScriptedPublisher::default()));
        assert_eq!(
            sched.run().await.unwrap(),
            TickOutcome::Completed(TickReport::default())
        );
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_tick() {
        let (_, store) = memory_store(QueuePolicy::default());
        let good_a = enqueue(store.as_ref(), "http://x/a.jpg").await;
        let bad = enqueue(store.as_ref(), "http://x/bad.jpg").await;
        let good_c = enqueue(store.as_ref(), "http://x/c.jpg").await;
        let publisher = Arc::new(ScriptedPublisher::default());
        let sched = scheduler(store.clone(), publisher.clone());

        let outcome = sched.run().await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Completed(TickReport {
                processed: 3,
                published: 2,
                failed: 1,
                dead_lettered: 0,
                reclaimed: 0,
                superseded: 0,
            })
        );
        assert_eq!(publisher.calls.lock().unwrap().len(), 3);

        for key in [good_a, good_c] {
            assert_eq!(store.get(&key).await.unwrap().unwrap().status, JobStatus::Done);
        }
        let bad = store.get(&bad).await.unwrap().unwrap();
        assert_eq!(bad.status, JobStatus::Queued);
        assert_eq!(bad.attempts, 1);
        assert_eq!(
            bad.last_error.as_deref(),
            Some("container c-bad failed: Error: Media download has failed")
        );
        assert_eq!(bad.publish_at, start() + chrono::Duration::seconds(30));
    }

    #[tokio::test]
    async fn exhausted_attempts_dead_letter() {
        let (_, store) = memory_store(QueuePolicy {
            max_attempts: Some(1),
            ..QueuePolicy::default()
        });
        let key = enqueue(store.as_ref(), "http://x/bad.jpg").await;
        let sched = scheduler(store.clone(), Arc::new(ScriptedPublisher::default()));

        let TickOutcome::Completed(report) = sched.run().await.unwrap() else {
            panic!("expected a completed tick");
        };
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(store.get(&key).await.unwrap().unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn stale_publishing_jobs_are_reclaimed_first() {
        let (clock, store) = memory_store(QueuePolicy::default());
        let key = enqueue(store.as_ref(), "http://x/a.jpg").await;
        store.claim_due(1).await.unwrap();
        clock.advance(chrono::Duration::minutes(31));

        let sched = scheduler(store.clone(), Arc::new(ScriptedPublisher::default()));
        let TickOutcome::Completed(report) = sched.run().await.unwrap() else {
            panic!("expected a completed tick");
        };
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.published, 1);
        assert_eq!(store.get(&key).await.unwrap().unwrap().status, JobStatus::Done);
    }

    /// Blocks inside `publish` until released.
    struct BlockingPublisher {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Publisher for BlockingPublisher {
        async fn publish(&self, _artifact_ref: &str, _caption: &str) -> Result<String, PublishError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok("media-1".to_string())
        }
    }

    #[tokio::test]
    async fn second_run_while_active_is_busy_and_claims_nothing() {
        let (_, store) = memory_store(QueuePolicy::default());
        enqueue(store.as_ref(), "http://x/a.jpg").await;
        let publisher = Arc::new(BlockingPublisher {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let sched = Arc::new(scheduler(store.clone(), publisher.clone()));

        let first = tokio::spawn({
            let sched = Arc::clone(&sched);
            async move { sched.run().await }
        });
        publisher.entered.notified().await;

        let late = enqueue(store.as_ref(), "http://x/b.jpg").await;
        assert_eq!(sched.run().await.unwrap(), TickOutcome::Busy);
        assert_eq!(store.get(&late).await.unwrap().unwrap().status, JobStatus::Queued);

        publisher.release.notify_one();
        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(outcome, TickOutcome::Completed(r) if r.published == 1));

        // The flag is released once the first run ends.
        publisher.release.notify_one();
        let outcome = sched.run().await.unwrap();
        assert!(matches!(outcome, TickOutcome::Completed(r) if r.published == 1));
    }

    #[tokio::test]
    async fn run_on_another_store_over_the_same_file_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(start()));
        let open = || {
            let store = SqliteJobStore::open(&path, Arc::clone(&clock), QueuePolicy::default());
            Arc::new(store.unwrap())
        };
        let (store_a, store_b) = (open(), open());
        enqueue(store_a.as_ref(), "http://x/a.jpg").await;

        let blocking = Arc::new(BlockingPublisher {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let first = Arc::new(scheduler(store_a.clone(), blocking.clone()));
        let second = scheduler(store_b.clone(), Arc::new(ScriptedPublisher::default()));

        let running = tokio::spawn({
            let first = Arc::clone(&first);
            async move { first.run().await }
        });
        blocking.entered.notified().await;

        let late = enqueue(store_b.as_ref(), "http://x/b.jpg").await;
        assert_eq!(second.run().await.unwrap(), TickOutcome::Busy);
        assert_eq!(store_b.get(&late).await.unwrap().unwrap().status, JobStatus::Queued);

        blocking.release.notify_one();
        let outcome = running.await.unwrap().unwrap();
        assert!(matches!(outcome, TickOutcome::Completed(r) if r.published == 1));

        let outcome = second.run().await.unwrap();
        assert!(matches!(outcome, TickOutcome::Completed(r) if r.published == 1));
        assert_eq!(store_b.get(&late).await.unwrap().unwrap().status, JobStatus::Done);
    }

    /// Fails, but only after the lease lapsed and another worker took the job.
    struct OvertakenPublisher {
        store: Arc<InMemoryJobStore>,
        clock: Arc<ManualClock>,
    }

    #[async_trait]
    impl Publisher for OvertakenPublisher {
        async fn publish(&self, _artifact_ref: &str, _caption: &str) -> Result<String, PublishError> {
            self.clock.advance(chrono::Duration::minutes(31));
            self.store.reclaim_stale(chrono::Duration::minutes(30)).await.unwrap();
            assert_eq!(self.store.claim_due(1).await.unwrap().len(), 1);
            Err(PublishError::Timeout {
                creation_id: "c-1".into(),
                polls: 10,
            })
        }
    }

    #[tokio::test]
    async fn failure_after_losing_the_claim_leaves_the_new_claimer_alone() {
        let (clock, store) = memory_store(QueuePolicy::default());
        let key = enqueue(store.as_ref(), "http://x/a.jpg").await;
        let publisher = Arc::new(OvertakenPublisher {
            store: store.clone(),
            clock,
        });

        let sched = scheduler(store.clone(), publisher);
        let TickOutcome::Completed(report) = sched.run().await.unwrap() else {
            panic!("expected a completed tick");
        };
        assert_eq!(report.superseded, 1);
        assert_eq!(report.failed, 0);

        let job = store.get(&key).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Publishing);
        assert_eq!(job.attempts, 0);
        assert!(store.claim_due(1).await.unwrap().is_empty());
    }

    #[test]
    fn run_lock_covers_a_full_batch() {
        let settings = SchedulerSettings {
            batch_size: 10,
            concurrency: 3,
            lease: chrono::Duration::minutes(30),
        };
        assert_eq!(settings.run_lock_ttl(), chrono::Duration::minutes(120));
        assert_eq!(
            SchedulerSettings::default().run_lock_ttl(),
            chrono::Duration::minutes(300)
        );
    }

    /// Counts how many publishes overlap.
    #[derive(Default)]
    struct SlowPublisher {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Publisher for SlowPublisher {
        async fn publish(&self, _artifact_ref: &str, _caption: &str) -> Result<String, PublishError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok("media".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_bounds_parallel_publishes() {
        let (_, store) = memory_store(QueuePolicy::default());
        for i in 0..8 {
            enqueue(store.as_ref(), &format!("http://x/{i}.jpg")).await;
        }
        let publisher = Arc::new(SlowPublisher::default());
        let sched = Scheduler::new(
            store,
            publisher.clone(),
            SchedulerSettings {
                concurrency: 3,
                ..SchedulerSettings::default()
            },
        );

        let TickOutcome::Completed(report) = sched.run().await.unwrap() else {
            panic!("expected a completed tick");
        };
        assert_eq!(report.published, 8);
        assert_eq!(publisher.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn sequential_runs_follow_publish_at_order() {
        let (_, store) = memory_store(QueuePolicy::default());
        for (url, at) in [
            ("http://x/late.jpg", "2029-12-31T12:00:00Z"),
            ("http://x/early.jpg", "2029-12-31T01:00:00Z"),
        ] {
            store.enqueue(NewJob::new(url, "hi", at).unwrap()).await.unwrap();
        }
        let publisher = Arc::new(ScriptedPublisher::default());
        scheduler(store, publisher.clone()).run().await.unwrap();
        assert_eq!(
            *publisher.calls.lock().unwrap(),
            ["http://x/early.jpg", "http://x/late.jpg"]
        );
    }

    /// Delegates to an in-memory store but refuses to record one key as done.
    struct FlakyStore {
        inner: InMemoryJobStore,
        broken_key: Mutex<Option<String>>,
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome, StoreError> {
            self.inner.enqueue(job).await
        }
        async fn get(&self, key: &str) -> Result<Option<Job>, StoreError> {
            self.inner.get(key).await
        }
        async fn claim_due(&self, limit: usize) -> Result<Vec<JobHandle>, StoreError> {
            self.inner.claim_due(limit).await
        }
        async fn mark_done(&self, handle: &JobHandle, published_id: &str) -> Result<(), StoreError> {
            if self.broken_key.lock().unwrap().as_deref() == Some(handle.key.as_str()) {
                return Err(StoreError::Task("disk full".into()));
            }
            self.inner.mark_done(handle, published_id).await
        }
        async fn mark_failed(
            &self,
            handle: &JobHandle,
            error: &str,
        ) -> Result<FailureDisposition, StoreError> {
            self.inner.mark_failed(handle, error).await
        }
        async fn reclaim_stale(&self, lease: chrono::Duration) -> Result<usize, StoreError> {
            self.inner.reclaim_stale(lease).await
        }
        async fn purge_expired(&self) -> Result<usize, StoreError> {
            self.inner.purge_expired().await
        }
        async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, StoreError> {
            self.inner.list(status, limit).await
        }
        async fn stats(&self) -> Result<JobStatistics, StoreError> {
            self.inner.stats().await
        }
        async fn try_lock_run(
            &self,
            owner: &str,
            ttl: chrono::Duration,
        ) -> Result<bool, StoreError> {
            self.inner.try_lock_run(owner, ttl).await
        }
        async fn unlock_run(&self, owner: &str) -> Result<(), StoreError> {
            self.inner.unlock_run(owner).await
        }
    }

    #[tokio::test]
    async fn store_error_is_returned_after_remaining_jobs() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(start()));
        let store = Arc::new(FlakyStore {
            inner: InMemoryJobStore::new(clock, QueuePolicy::default()),
            broken_key: Mutex::new(None),
        });
        let broken = enqueue(store.as_ref(), "http://x/a.jpg").await;
        let fine = enqueue(store.as_ref(), "http://x/b.jpg").await;
        *store.broken_key.lock().unwrap() = Some(broken);

        let err = scheduler(store.clone(), Arc::new(ScriptedPublisher::default()))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Task(_)));
        assert_eq!(store.get(&fine).await.unwrap().unwrap().status, JobStatus::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn run_every_ticks_until_shutdown() {
        let (_, store) = memory_store(QueuePolicy::default());
        enqueue(store.as_ref(), "http://x/a.jpg").await;
        let publisher = Arc::new(ScriptedPublisher::default());
        let sched = scheduler(store.clone(), publisher.clone());

        sched
            .run_every(
                Duration::from_secs(60),
                tokio::time::sleep(Duration::from_secs(150)),
            )
            .await;

        // Ticks at 0s, 60s and 120s; only the first has work.
        assert_eq!(publisher.calls.lock().unwrap().len(), 1);
        assert_eq!(store.stats().await.unwrap().done, 1);
    }
}
