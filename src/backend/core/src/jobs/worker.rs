//! Job worker pool.
//!
//! Each worker is an independent polling loop: claim the next pending job from
//! the store, take the distributed lock when a shared cache is configured, run
//! the handler inside a store transaction and record the outcome.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::handler::{JobContext, JobExecutor, JobOutcome};
use super::job::{ExecutionResult, JobError, JobHistory, JobId, QueueJob, QueueJobStatus};
use super::queue::QueueManager;
use super::store::JobStore;
use crate::config::WorkerConfig;
use crate::error::{DroverError, Result};
use crate::telemetry::JobMetrics;

/// Statistics for the worker pool.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Jobs whose handler was invoked
    pub processed: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    /// Failed attempts that were re-queued
    pub retried: Arc<AtomicU64>,
    /// Jobs that reached `Failed`
    pub failed: Arc<AtomicU64>,
    /// Claims abandoned on lock contention
    pub skipped: Arc<AtomicU64>,
    /// Handler panics recovered
    pub panicked: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }
}

/// What a single poll cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing claimable
    Idle,
    /// Claimed, but the lock was held elsewhere
    Skipped(JobId),
    Completed(JobId),
    /// Failed and re-queued
    Retrying(JobId),
    /// Failed permanently
    Failed(JobId),
}

/// Releases a distributed lock when the job is done.
///
/// Dropped without an explicit release (e.g. the processing future was
/// cancelled) it spawns the release instead.
struct LockGuard {
    queue: Arc<QueueManager>,
    job_id: JobId,
    released: bool,
}

impl LockGuard {
    fn new(queue: Arc<QueueManager>, job_id: JobId) -> Self {
        Self {
            queue,
            job_id,
            released: false,
        }
    }

    /// Returns `false` when the lock may still be live in the cache.
    async fn release(mut self) -> bool {
        self.released = true;
        release_lock(&self.queue, self.job_id).await
    }
}

/// Release a still-held lock now. `true` when nothing of ours is left blocking the job.
async fn release_held(lock: &mut Option<LockGuard>) -> bool {
    match lock.take() {
        Some(guard) => guard.release().await,
        None => true,
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let queue = self.queue.clone();
            let job_id = self.job_id;
            handle.spawn(async move {
                release_lock(&queue, job_id).await;
            });
        }
    }
}

async fn release_lock(queue: &QueueManager, job_id: JobId) -> bool {
    match queue.release_lock(job_id).await {
        Ok(_) => true,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Failed to release job lock");
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

struct PoolInner {
    store: Arc<dyn JobStore>,
    queue: Arc<QueueManager>,
    executor: Arc<dyn JobExecutor>,
    config: WorkerConfig,
    stats: WorkerStats,
    shutdown: watch::Sender<bool>,
}

/// Fixed-size pool of job pollers.
pub struct JobWorkerPool {
    inner: Arc<PoolInner>,
    running: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobWorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<QueueManager>,
        executor: Arc<dyn JobExecutor>,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(PoolInner {
                store,
                queue,
                executor,
                config,
                stats: WorkerStats::new(),
                shutdown,
            }),
            running: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.inner.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Worker id of the `index`-th poller.
    pub fn worker_id(&self, index: usize) -> String {
        format!("{}-{}-{}", self.inner.config.name, self.inner.queue.instance_id(), index)
    }

    /// Spawn `concurrency` polling loops. Calling it on a running pool is a no-op.
    pub fn start(&self) -> Result<()> {
        let concurrency = self.inner.config.concurrency;
        if concurrency == 0 {
            return Err(DroverError::configuration("Worker concurrency must be at least 1"));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(worker = %self.inner.config.name, "Worker pool already running");
            return Ok(());
        }

        self.inner.shutdown.send_replace(false);

        let mut handles = self.handles.lock();
        for index in 0..concurrency {
            let worker_id = self.worker_id(index);
            let inner = self.inner.clone();
            let shutdown = self.inner.shutdown.subscribe();
            handles.push(tokio::spawn(inner.run_worker(worker_id, shutdown)));
        }

        info!(
            worker = %self.inner.config.name,
            instance_id = %self.inner.queue.instance_id(),
            concurrency,
            distributed = self.inner.queue.is_distributed(),
            "Job worker pool started"
        );
        Ok(())
    }

    /// Signal shutdown and wait up to the shutdown timeout for workers to finish.
    ///
    /// A job still running when the timeout elapses is abandoned, not aborted;
    /// its lock expires on its own.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.inner.shutdown.send_replace(true);
        let handles = std::mem::take(&mut *self.handles.lock());
        let timeout = self.inner.config.shutdown_timeout;

        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(_) => info!(worker = %self.inner.config.name, "Job worker pool stopped"),
            Err(_) => warn!(
                worker = %self.inner.config.name,
                timeout = ?timeout,
                "Shutdown timeout elapsed with jobs still in flight"
            ),
        }
    }

    /// Run a single poll cycle as `worker_id`.
    pub async fn run_once(&self, worker_id: &str) -> Result<PollOutcome> {
        self.inner.process_next(worker_id).await
    }
}

impl PoolInner {
    async fn run_worker(self: Arc<Self>, worker_id: String, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!(worker = %worker_id, "Worker started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.process_next(&worker_id).await {
                        e.log();
                    }
                }
            }
        }

        debug!(worker = %worker_id, "Worker stopped");
    }

    async fn process_next(&self, worker_id: &str) -> Result<PollOutcome> {
        let Some(job) = self.store.get_next_pending_job(worker_id).await? else {
            return Ok(PollOutcome::Idle);
        };

        JobMetrics::claimed(&job.handler);

        let span = info_span!(
            "job",
            job_id = %job.id,
            handler = %job.handler,
            worker = %worker_id,
            attempt = job.attempt(),
        );
        self.process_claimed(job, worker_id).instrument(span).await
    }

    async fn process_claimed(&self, job: QueueJob, worker_id: &str) -> Result<PollOutcome> {
        let mut lock = if self.queue.is_distributed() {
            match self.queue.acquire_lock(job.id, self.queue.lock_ttl()).await {
                Ok(true) => Some(LockGuard::new(self.queue.clone(), job.id)),
                Ok(false) => {
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                    debug!("Lock held by another instance, abandoning job");
                    return Ok(PollOutcome::Skipped(job.id));
                }
                Err(e) => {
                    warn!(error = %e, "Lock acquisition failed, relying on store claim");
                    None
                }
            }
        } else {
            None
        };

        self.mirror_status(job.id, QueueJobStatus::Processing).await;
        self.stats.processed.fetch_add(1, Ordering::Relaxed);

        let started_at = Utc::now();
        let timer = Instant::now();
        let outcome = self.execute(&job, worker_id).await;
        let attempt = Attempt {
            worker_id,
            started_at,
            finished_at: Utc::now(),
            duration: timer.elapsed(),
        };

        let settled = match &outcome {
            Ok(output) => self.complete(&job, &attempt, output).await,
            Err(err) => self.fail(&job, &attempt, err, &mut lock).await,
        };
        release_held(&mut lock).await;

        match settled {
            Ok(poll) => Ok(poll),
            Err(e) => {
                self.recover(&job, &outcome, &e).await;
                Err(e)
            }
        }
    }

    /// Invoke the handler inside a store transaction, converting panics to errors.
    async fn execute(&self, job: &QueueJob, worker_id: &str) -> JobOutcome {
        let ctx = JobContext::new(job, worker_id, self.queue.clone(), self.shutdown.subscribe());

        let mut tx = self.store.begin().await.map_err(JobError::from)?;

        let invocation = AssertUnwindSafe(self.executor.execute(
            &ctx,
            &job.handler,
            &job.payload,
            tx.as_mut(),
        ))
        .catch_unwind()
        .await;

        let outcome = match invocation {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                self.stats.panicked.fetch_add(1, Ordering::Relaxed);
                JobMetrics::panicked(&job.handler);
                error!(panic = %message, "Handler panicked");
                Err(JobError::panicked(message))
            }
        };

        match outcome {
            Ok(output) => match tx.commit().await {
                Ok(()) => Ok(output),
                Err(e) => Err(JobError::from(e)),
            },
            Err(err) => {
                if let Err(e) = tx.rollback().await {
                    warn!(error = %e, "Transaction rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn complete(
        &self,
        job: &QueueJob,
        attempt: &Attempt<'_>,
        output: &serde_json::Value,
    ) -> Result<PollOutcome> {
        self.record_history(job, attempt, ExecutionResult::Success, Some(output.clone()), None)
            .await?;
        self.store
            .update_queue_job_status(job.id, QueueJobStatus::Completed, Some(output), None)
            .await?;

        if let Err(e) = self.queue.clear_job_data(job.id).await {
            debug!(error = %e, "Failed to clear cached job data");
        }

        self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
        JobMetrics::completed(&job.handler, attempt.duration);
        info!(duration_ms = attempt.duration.as_millis() as u64, "Job completed");
        Ok(PollOutcome::Completed(job.id))
    }

    async fn fail(
        &self,
        job: &QueueJob,
        attempt: &Attempt<'_>,
        err: &JobError,
        lock: &mut Option<LockGuard>,
    ) -> Result<PollOutcome> {
        let message = err.to_string();
        self.record_history(job, attempt, ExecutionResult::Failure, None, Some(message.clone()))
            .await?;

        if err.retryable && job.can_retry() {
            let retry_count = self.store.increment_retry_count(job.id).await?;
            self.store
                .update_queue_job_status(job.id, QueueJobStatus::Retrying, None, Some(&message))
                .await?;

            // The job must be claimable without our lock once it is pending again.
            let lock_released = release_held(lock).await;
            let priority = job.priority.demoted();
            let available_at = self.retry_available_at(retry_count, lock_released);
            self.mirror_status(job.id, QueueJobStatus::Pending).await;
            self.store
                .requeue_queue_job(job.id, priority, available_at)
                .await?;

            if let Err(e) = self.queue.enqueue_job(job.id, priority).await {
                debug!(error = %e, "Cache re-enqueue failed");
            }

            self.stats.retried.fetch_add(1, Ordering::Relaxed);
            JobMetrics::retried(&job.handler);
            warn!(
                error = %message,
                retry_count,
                max_retries = job.max_retries,
                priority = %priority,
                "Job failed, re-queued for retry"
            );
            Ok(PollOutcome::Retrying(job.id))
        } else {
            self.store
                .update_queue_job_status(job.id, QueueJobStatus::Failed, None, Some(&message))
                .await?;
            self.mirror_status(job.id, QueueJobStatus::Failed).await;

            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            JobMetrics::failed(&job.handler, attempt.duration);
            error!(
                error = %message,
                retry_count = job.retry_count,
                retryable = err.retryable,
                "Job failed permanently"
            );
            Ok(PollOutcome::Failed(job.id))
        }
    }

    fn retry_available_at(&self, retry_count: u32, lock_released: bool) -> DateTime<Utc> {
        let now = Utc::now();
        let mut available_at = match &self.config.retry_backoff {
            Some(backoff) => {
                let delay = backoff.delay_for_attempt(retry_count.saturating_sub(1));
                now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
            }
            None => now,
        };
        // A lock left behind makes every claimer skip the job until it expires.
        if !lock_released {
            let lock_ttl = chrono::Duration::from_std(self.queue.lock_ttl())
                .unwrap_or_else(|_| chrono::Duration::zero());
            available_at = available_at.max(now + lock_ttl);
        }
        available_at
    }

    /// Best-effort settle of a claimed job whose bookkeeping hit a store error.
    ///
    /// A committed handler result is marked completed; a retriable failure is
    /// handed back to `Pending`; anything else is marked failed.
    async fn recover(
        &self,
        job: &QueueJob,
        outcome: &JobOutcome,
        cause: &DroverError,
    ) {
        let message = format!("Job bookkeeping failed: {}", cause);
        let settled = match outcome {
            Ok(output) => {
                self.store
                    .update_queue_job_status(job.id, QueueJobStatus::Completed, Some(output), None)
                    .await
                    .map(|()| QueueJobStatus::Completed)
            }
            Err(err) if err.retryable && job.can_retry() => {
                let lock_released = !matches!(
                    self.queue.current_lock(job.id).await,
                    Ok(Some(lock)) if !lock.is_expired_at(Utc::now())
                );
                let available_at = self.retry_available_at(job.retry_count + 1, lock_released);
                match self
                    .store
                    .update_queue_job_status(job.id, QueueJobStatus::Retrying, None, Some(&message))
                    .await
                {
                    Ok(()) => self
                        .store
                        .requeue_queue_job(job.id, job.priority, available_at)
                        .await
                        .map(|()| QueueJobStatus::Pending),
                    Err(e) => Err(e),
                }
            }
            Err(_) => self
                .store
                .update_queue_job_status(job.id, QueueJobStatus::Failed, None, Some(&message))
                .await
                .map(|()| QueueJobStatus::Failed),
        };

        match settled {
            Ok(status) => {
                self.mirror_status(job.id, status).await;
                warn!(error = %cause, status = %status, "Recovered job after store error");
            }
            Err(e) => error!(
                error = %e,
                cause = %cause,
                "Job left in processing after store error"
            ),
        }
    }

    async fn record_history(
        &self,
        job: &QueueJob,
        attempt: &Attempt<'_>,
        result: ExecutionResult,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()> {
        let history = JobHistory {
            id: Uuid::new_v4(),
            queue_job_id: job.id,
            handler: job.handler.clone(),
            started_at: attempt.started_at,
            finished_at: attempt.finished_at,
            duration_ms: attempt.duration.as_millis() as i64,
            retry_attempt: job.retry_count,
            result,
            input: job.payload.clone(),
            output,
            error,
            worker_id: attempt.worker_id.to_string(),
        };
        self.store.create_job_history(&history).await
    }

    async fn mirror_status(&self, job_id: JobId, status: QueueJobStatus) {
        if let Err(e) = self.queue.set_job_status(job_id, status).await {
            debug!(job_id = %job_id, error = %e, "Failed to mirror job status");
        }
    }
}

struct Attempt<'a> {
    worker_id: &'a str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_stats() {
        let stats = WorkerStats::new();
        assert_eq!(stats.processed(), 0);
        assert_eq!(stats.skipped(), 0);

        stats.processed.fetch_add(1, Ordering::Relaxed);
        let shared = stats.clone();
        assert_eq!(shared.processed(), 1);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(boxed.as_ref()), "kaboom");

        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }
}
