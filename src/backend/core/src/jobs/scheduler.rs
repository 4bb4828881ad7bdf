//! Job scheduling with cron and interval triggers.
//!
//! The scheduler re-derives its entries from the store on every reconciliation
//! pass: each active definition gets its previous entry removed and a fresh one
//! added, so edits take effect within one reconciliation period. While the
//! scheduler runs, every entry owns a timer task that fires the job when due.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::job::{JobId, JobMetadata, QueueJob, ScheduleGate, ScheduledJob, Trigger};
use super::producer::JobProducer;
use super::queue::QueueManager;
use super::store::JobStore;
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::telemetry::JobMetrics;

/// Metadata `source` of queue jobs produced by the scheduler.
pub const SCHEDULER_SOURCE: &str = "scheduler";

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Entries (re)added
    pub scheduled: usize,
    /// Entries removed
    pub unscheduled: usize,
    /// Definitions skipped that had no entry
    pub skipped: usize,
}

/// Result of one firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// A queue job was produced
    Enqueued(JobId),
    /// The gating condition was false or could not be evaluated
    Gated,
    /// The definition is no longer eligible and was unscheduled
    Unscheduled(ScheduleGate),
    /// The definition no longer exists
    Missing,
    /// Another instance already fired this slot
    AlreadyFired,
    /// Another instance is firing this job right now
    Contended,
}

/// Snapshot of an active schedule entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntryInfo {
    pub job_id: JobId,
    pub trigger: Trigger,
    pub next_run: DateTime<Utc>,
}

struct ScheduleEntry {
    trigger: Trigger,
    next_run: DateTime<Utc>,
    timer: Option<JoinHandle<()>>,
}

impl Drop for ScheduleEntry {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct SchedulerInner {
    store: Arc<dyn JobStore>,
    queue: Arc<QueueManager>,
    producer: JobProducer,
    entries: Mutex<HashMap<JobId, ScheduleEntry>>,
    timers_enabled: AtomicBool,
}

/// Turns recurring definitions into queue jobs.
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
    config: SchedulerConfig,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    reconcile_task: Mutex<Option<JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<QueueManager>,
        producer: JobProducer,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                queue,
                producer,
                entries: Mutex::new(HashMap::new()),
                timers_enabled: AtomicBool::new(false),
            }),
            config,
            running: AtomicBool::new(false),
            shutdown,
            reconcile_task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the reconciliation loop; the first pass runs immediately.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running");
            return;
        }

        self.inner.timers_enabled.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(false);

        let inner = self.inner.clone();
        let mut shutdown = self.shutdown.subscribe();
        let period = self.config.reconcile_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = inner.reconcile().await {
                            e.log();
                        }
                    }
                }
            }
        });

        *self.reconcile_task.lock() = Some(task);
        info!(reconcile_interval = ?period, "Job scheduler started");
    }

    /// Stop reconciliation and drop every entry. Firings already in progress finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.shutdown.send_replace(true);
        self.inner.timers_enabled.store(false, Ordering::SeqCst);

        let task = self.reconcile_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Reconciliation task ended abnormally");
            }
        }

        self.inner.entries.lock().clear();
        JobMetrics::schedule_entries(0);
        info!("Job scheduler stopped");
    }

    /// Re-derive schedule entries from the store.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.inner.reconcile().await
    }

    /// Fire `job_id` now, applying the same checks as a timer firing.
    pub async fn fire(&self, job_id: JobId) -> Result<FireOutcome> {
        self.inner.fire(job_id, Utc::now()).await
    }

    pub fn entry(&self, job_id: JobId) -> Option<ScheduleEntryInfo> {
        self.inner.entries.lock().get(&job_id).map(|e| ScheduleEntryInfo {
            job_id,
            trigger: e.trigger.clone(),
            next_run: e.next_run,
        })
    }

    pub fn active_entries(&self) -> Vec<ScheduleEntryInfo> {
        let mut entries: Vec<ScheduleEntryInfo> = self
            .inner
            .entries
            .lock()
            .iter()
            .map(|(id, e)| ScheduleEntryInfo {
                job_id: *id,
                trigger: e.trigger.clone(),
                next_run: e.next_run,
            })
            .collect();
        entries.sort_by_key(|e| e.next_run);
        entries
    }
}

impl SchedulerInner {
    async fn reconcile(self: &Arc<Self>) -> Result<ReconcileReport> {
        let definitions = self.store.list_active_scheduled_jobs().await?;
        let now = Utc::now();
        let mut report = ReconcileReport::default();
        let mut seen = HashSet::with_capacity(definitions.len());

        for job in definitions {
            seen.insert(job.id);

            if let Some(gate) = job.gate_at(now) {
                if gate == ScheduleGate::MissingHandler {
                    warn!(job_id = %job.id, name = %job.name, "Scheduled job has no handler, skipping");
                } else {
                    debug!(job_id = %job.id, name = %job.name, reason = %gate, "Scheduled job not eligible");
                }
                if self.unschedule(job.id) {
                    report.unscheduled += 1;
                } else {
                    report.skipped += 1;
                }
                continue;
            }

            match self.first_run(&job, now) {
                Some(next_run) => {
                    self.schedule(job.id, job.trigger.clone(), next_run);
                    report.scheduled += 1;
                }
                None => {
                    warn!(job_id = %job.id, trigger = %job.trigger, "Trigger has no future run, skipping");
                    if self.unschedule(job.id) {
                        report.unscheduled += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
            }
        }

        let stale: Vec<JobId> = self
            .entries
            .lock()
            .keys()
            .filter(|id| !seen.contains(id))
            .copied()
            .collect();
        for id in stale {
            if self.unschedule(id) {
                report.unscheduled += 1;
            }
        }

        let active = self.entries.lock().len();
        JobMetrics::schedule_entries(active);
        debug!(
            scheduled = report.scheduled,
            unscheduled = report.unscheduled,
            skipped = report.skipped,
            active,
            "Reconciliation finished"
        );
        Ok(report)
    }

    /// When a fresh entry for `job` should first fire.
    ///
    /// Interval entries keep the pending run of the entry they replace (or the
    /// persisted `next_run_at`), clamped into `[now, now + interval]`.
    fn first_run(&self, job: &ScheduledJob, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &job.trigger {
            Trigger::Cron(_) => job.trigger.next_after(now),
            Trigger::Interval(_) => {
                let latest = job.trigger.next_after(now)?;
                let pending = self
                    .entries
                    .lock()
                    .get(&job.id)
                    .filter(|e| e.trigger == job.trigger)
                    .map(|e| e.next_run)
                    .or(job.next_run_at);
                Some(pending.map_or(latest, |at| at.clamp(now, latest)))
            }
        }
    }

    fn schedule(self: &Arc<Self>, job_id: JobId, trigger: Trigger, next_run: DateTime<Utc>) {
        let timer = self
            .timers_enabled
            .load(Ordering::SeqCst)
            .then(|| tokio::spawn(run_entry(Arc::downgrade(self), job_id, trigger.clone(), next_run)));

        let previous = self.entries.lock().insert(
            job_id,
            ScheduleEntry {
                trigger,
                next_run,
                timer,
            },
        );
        drop(previous);
    }

    fn unschedule(&self, job_id: JobId) -> bool {
        let removed = self.entries.lock().remove(&job_id);
        if removed.is_some() {
            debug!(job_id = %job_id, "Schedule entry removed");
        }
        removed.is_some()
    }

    fn set_next_run(&self, job_id: JobId, next_run: DateTime<Utc>) {
        if let Some(entry) = self.entries.lock().get_mut(&job_id) {
            entry.next_run = next_run;
        }
    }

    async fn fire(&self, job_id: JobId, due: DateTime<Utc>) -> Result<FireOutcome> {
        let locked = match self.queue.acquire_lock(job_id, self.queue.lock_ttl()).await {
            Ok(true) => true,
            Ok(false) => return Ok(FireOutcome::Contended),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Schedule lock unavailable, firing without it");
                false
            }
        };

        let outcome = self.fire_locked(job_id, due).await;

        if locked {
            if let Err(e) = self.queue.release_lock(job_id).await {
                warn!(job_id = %job_id, error = %e, "Failed to release schedule lock");
            }
        }
        outcome
    }

    async fn fire_locked(&self, job_id: JobId, due: DateTime<Utc>) -> Result<FireOutcome> {
        let Some(job) = self.store.get_scheduled_job(job_id).await? else {
            self.unschedule(job_id);
            return Ok(FireOutcome::Missing);
        };

        if !job.enabled || !job.active {
            self.unschedule(job_id);
            return Ok(FireOutcome::Unscheduled(ScheduleGate::Inactive));
        }

        if job.last_run_at.is_some_and(|last| last >= due) {
            debug!(job_id = %job_id, "Slot already fired elsewhere");
            return Ok(FireOutcome::AlreadyFired);
        }

        if let Some(condition) = job.condition.as_deref() {
            match self.store.evaluate_condition(condition).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job_id = %job_id, condition, "Condition false, not firing");
                    return Ok(FireOutcome::Gated);
                }
                Err(e) => {
                    warn!(job_id = %job_id, condition, error = %e, "Condition evaluation failed, not firing");
                    return Ok(FireOutcome::Gated);
                }
            }
        }

        let now = Utc::now();
        if let Some(gate) = job.exhausted_at(now) {
            info!(job_id = %job_id, name = %job.name, reason = %gate, "Scheduled job exhausted, unscheduling");
            self.unschedule(job_id);
            return Ok(FireOutcome::Unscheduled(gate));
        }

        let sequence = job.execution_count + 1;
        let metadata = JobMetadata {
            source: Some(SCHEDULER_SOURCE.to_string()),
            scheduled_job_id: Some(job.id),
            scheduled_job_name: Some(job.name.clone()),
            execution_sequence: Some(sequence),
            ..Default::default()
        };
        let queue_job = QueueJob::new(job.handler.clone(), job.payload.clone())
            .with_priority(job.priority)
            .with_max_retries(job.max_retries)
            .with_metadata(metadata);
        let queue_job = self.producer.submit(queue_job).await?;

        let next_run_at = job.trigger.next_after(now);
        let count = self
            .store
            .update_scheduled_job_next_run(job.id, now, next_run_at)
            .await?;

        JobMetrics::schedule_fired(&job.name);
        info!(
            job_id = %job.id,
            name = %job.name,
            queue_job_id = %queue_job.id,
            execution = count,
            next_run_at = ?next_run_at,
            "Scheduled job fired"
        );
        Ok(FireOutcome::Enqueued(queue_job.id))
    }
}

/// Timer loop of one schedule entry.
///
/// Each firing runs in its own task so that replacing or dropping the entry
/// never interrupts a firing halfway.
async fn run_entry(
    inner: std::sync::Weak<SchedulerInner>,
    job_id: JobId,
    trigger: Trigger,
    mut next_run: DateTime<Utc>,
) {
    loop {
        let wait = (next_run - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        let Some(scheduler) = inner.upgrade() else {
            return;
        };
        let due = next_run;
        let firing = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.fire(job_id, due).await }
        });
        drop(scheduler);

        match firing.await {
            Ok(Ok(FireOutcome::Missing)) | Ok(Ok(FireOutcome::Unscheduled(_))) => return,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => e.log(),
            Err(e) => warn!(job_id = %job_id, error = %e, "Firing task failed"),
        }

        next_run = match trigger.next_after(Utc::now().max(due)) {
            Some(next) => next,
            None => return,
        };
        if let Some(scheduler) = inner.upgrade() {
            scheduler.set_next_run(job_id, next_run);
        }
    }
}
