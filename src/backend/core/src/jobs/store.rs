//! Durable job store interface.
//!
//! The store is the system of record for scheduled jobs, queue jobs and
//! execution history, and its claim query is the authoritative serialization
//! point between workers. [`InMemoryJobStore`] backs tests and single-process
//! use; the Postgres implementation lives in [`crate::db`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::job::{JobHistory, JobId, Priority, QueueJob, QueueJobStatus, ScheduledJob};
use crate::error::{DroverError, ErrorCode, Result};

/// Transaction handle passed to handlers.
///
/// Concrete stores expose their native transaction through
/// [`as_any_mut`](StoreTransaction::as_any_mut) so store-aware handlers can
/// downcast to it.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Operations the job subsystem needs from durable storage.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new queue job.
    async fn create_queue_job(&self, job: &QueueJob) -> Result<()>;

    async fn get_queue_job(&self, id: JobId) -> Result<Option<QueueJob>>;

    /// Atomically claim the next claimable pending job for `worker_id`.
    ///
    /// The claimed job is returned already marked `Processing`; no two callers
    /// can ever receive the same job from one claim.
    async fn get_next_pending_job(&self, worker_id: &str) -> Result<Option<QueueJob>>;

    /// Set status, output and error. Terminal statuses stamp `completed_at`.
    async fn update_queue_job_status(
        &self,
        id: JobId,
        status: QueueJobStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<()>;

    /// Increment the retry count and return its new value.
    async fn increment_retry_count(&self, id: JobId) -> Result<u32>;

    /// Return a retrying job to `Pending` at the given priority.
    async fn requeue_queue_job(
        &self,
        id: JobId,
        priority: Priority,
        available_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn create_job_history(&self, history: &JobHistory) -> Result<()>;

    /// History rows of one queue job, oldest first.
    async fn list_job_history(&self, queue_job_id: JobId) -> Result<Vec<JobHistory>>;

    /// All scheduled jobs with `active && enabled`.
    async fn list_active_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>>;

    async fn get_scheduled_job(&self, id: JobId) -> Result<Option<ScheduledJob>>;

    /// Record a firing: set `last_run_at`/`next_run_at` and increment
    /// `execution_count`. Returns the new execution count.
    async fn update_scheduled_job_next_run(
        &self,
        id: JobId,
        ran_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<u64>;

    /// Evaluate a gating predicate.
    async fn evaluate_condition(&self, condition: &str) -> Result<bool>;

    /// Open a transaction for one handler invocation.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Store
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct StoreState {
    queue_jobs: HashMap<JobId, QueueJob>,
    history: Vec<JobHistory>,
    scheduled: HashMap<JobId, ScheduledJob>,
    conditions: HashMap<String, bool>,
}

#[derive(Debug, Default)]
struct TransactionCounters {
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// Store kept entirely in process memory.
///
/// The claim runs under a mutex, so concurrent workers never share a job.
/// Conditions evaluate the literals `true`/`false`, or values registered
/// with [`set_condition`](Self::set_condition).
#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<StoreState>,
    transactions: Arc<TransactionCounters>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a scheduled job definition.
    pub fn upsert_scheduled_job(&self, job: ScheduledJob) {
        self.state.lock().scheduled.insert(job.id, job);
    }

    /// Edit a scheduled job definition in place.
    pub fn update_scheduled_job<F>(&self, id: JobId, edit: F) -> Result<()>
    where
        F: FnOnce(&mut ScheduledJob),
    {
        let mut state = self.state.lock();
        let job = state
            .scheduled
            .get_mut(&id)
            .ok_or_else(|| DroverError::job_not_found(id))?;
        edit(job);
        job.updated_at = Utc::now();
        Ok(())
    }

    /// Register the result of a named condition.
    pub fn set_condition(&self, condition: impl Into<String>, value: bool) {
        self.state.lock().conditions.insert(condition.into(), value);
    }

    /// All queue jobs, oldest first.
    pub fn queue_jobs(&self) -> Vec<QueueJob> {
        let mut jobs: Vec<QueueJob> = self.state.lock().queue_jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Queue jobs materialized from one scheduled job.
    pub fn queue_jobs_for_schedule(&self, scheduled_job_id: JobId) -> Vec<QueueJob> {
        self.queue_jobs()
            .into_iter()
            .filter(|j| j.metadata.scheduled_job_id == Some(scheduled_job_id))
            .collect()
    }

    pub fn commit_count(&self) -> u64 {
        self.transactions.commits.load(Ordering::Relaxed)
    }

    pub fn rollback_count(&self) -> u64 {
        self.transactions.rollbacks.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_queue_job(&self, job: &QueueJob) -> Result<()> {
        let mut state = self.state.lock();
        if state.queue_jobs.contains_key(&job.id) {
            return Err(DroverError::new(
                ErrorCode::DuplicateRecord,
                format!("Queue job {} already exists", job.id),
            ));
        }
        state.queue_jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_queue_job(&self, id: JobId) -> Result<Option<QueueJob>> {
        Ok(self.state.lock().queue_jobs.get(&id).cloned())
    }

    async fn get_next_pending_job(&self, worker_id: &str) -> Result<Option<QueueJob>> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let next = state
            .queue_jobs
            .values()
            .filter(|j| j.status == QueueJobStatus::Pending && j.available_at <= now)
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            })
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            state.queue_jobs.get_mut(&id).map(|job| {
                job.status = QueueJobStatus::Processing;
                job.started_at = Some(now);
                job.worker_id = Some(worker_id.to_string());
                job.clone()
            })
        }))
    }

    async fn update_queue_job_status(
        &self,
        id: JobId,
        status: QueueJobStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let job = state
            .queue_jobs
            .get_mut(&id)
            .ok_or_else(|| DroverError::job_not_found(id))?;

        if job.status != status && !job.status.can_transition_to(status) {
            return Err(DroverError::new(
                ErrorCode::InvalidStateTransition,
                format!("Cannot move job {} from {} to {}", id, job.status, status),
            ));
        }

        job.status = status;
        if let Some(output) = output {
            job.output = Some(output.clone());
        }
        if let Some(error) = error {
            job.last_error = Some(error.to_string());
        }
        if status.is_terminal() {
            job.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn increment_retry_count(&self, id: JobId) -> Result<u32> {
        let mut state = self.state.lock();
        let job = state
            .queue_jobs
            .get_mut(&id)
            .ok_or_else(|| DroverError::job_not_found(id))?;
        job.retry_count += 1;
        Ok(job.retry_count)
    }

    async fn requeue_queue_job(
        &self,
        id: JobId,
        priority: Priority,
        available_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let job = state
            .queue_jobs
            .get_mut(&id)
            .ok_or_else(|| DroverError::job_not_found(id))?;
        if !job.status.can_transition_to(QueueJobStatus::Pending) {
            return Err(DroverError::new(
                ErrorCode::InvalidStateTransition,
                format!("Cannot re-queue job {} from {}", id, job.status),
            ));
        }
        job.status = QueueJobStatus::Pending;
        job.priority = priority;
        job.available_at = available_at;
        job.worker_id = None;
        Ok(())
    }

    async fn create_job_history(&self, history: &JobHistory) -> Result<()> {
        self.state.lock().history.push(history.clone());
        Ok(())
    }

    async fn list_job_history(&self, queue_job_id: JobId) -> Result<Vec<JobHistory>> {
        Ok(self
            .state
            .lock()
            .history
            .iter()
            .filter(|h| h.queue_job_id == queue_job_id)
            .cloned()
            .collect())
    }

    async fn list_active_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let mut jobs: Vec<ScheduledJob> = self
            .state
            .lock()
            .scheduled
            .values()
            .filter(|j| j.active && j.enabled)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn get_scheduled_job(&self, id: JobId) -> Result<Option<ScheduledJob>> {
        Ok(self.state.lock().scheduled.get(&id).cloned())
    }

    async fn update_scheduled_job_next_run(
        &self,
        id: JobId,
        ran_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        let job = state
            .scheduled
            .get_mut(&id)
            .ok_or_else(|| DroverError::job_not_found(id))?;
        job.last_run_at = Some(ran_at);
        job.next_run_at = next_run_at;
        job.execution_count += 1;
        job.updated_at = Utc::now();
        Ok(job.execution_count)
    }

    async fn evaluate_condition(&self, condition: &str) -> Result<bool> {
        let condition = condition.trim();
        if condition.eq_ignore_ascii_case("true") {
            return Ok(true);
        }
        if condition.eq_ignore_ascii_case("false") {
            return Ok(false);
        }
        self.state
            .lock()
            .conditions
            .get(condition)
            .copied()
            .ok_or_else(|| {
                DroverError::new(
                    ErrorCode::ConditionFailed,
                    format!("Unknown condition: {}", condition),
                )
            })
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            counters: self.transactions.clone(),
        }))
    }
}

/// Transaction of [`InMemoryJobStore`]; only counts its outcome.
pub struct InMemoryTransaction {
    counters: Arc<TransactionCounters>,
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
