//! Integration tests for the job scheduler.

use drover_core::cache::{CacheBackend, InMemoryBackend, NoopBackend};
use drover_core::config::{QueueConfig, SchedulerConfig};
use drover_core::jobs::{
    FireOutcome, InMemoryJobStore, JobId, JobProducer, JobScheduler, JobStore, Priority,
    QueueJobStatus, QueueManager, ScheduleGate, ScheduledJob, Trigger,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn scheduler_on(store: Arc<InMemoryJobStore>, cache: Arc<dyn CacheBackend>, instance: &str) -> JobScheduler {
    let queue = Arc::new(QueueManager::new(
        cache,
        QueueConfig {
            instance_id: Some(instance.to_string()),
            lock_retries: 0,
            ..QueueConfig::default()
        },
    ));
    let producer = JobProducer::new(store.clone(), queue.clone());
    JobScheduler::new(store, queue, producer, SchedulerConfig::default())
}

fn scheduler(store: Arc<InMemoryJobStore>) -> JobScheduler {
    scheduler_on(store, Arc::new(NoopBackend), "instance-a")
}

fn every(secs: u64) -> Trigger {
    Trigger::interval(Duration::from_secs(secs)).unwrap()
}

// ============================================================================
// Reconciliation Tests
// ============================================================================

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let store = Arc::new(InMemoryJobStore::new());
    let cron = ScheduledJob::new("nightly", "echo", Trigger::parse("0 3 * * *").unwrap());
    let interval = ScheduledJob::new("sync", "echo", every(30));
    let ids = [cron.id, interval.id];
    store.upsert_scheduled_job(cron);
    store.upsert_scheduled_job(interval);

    let scheduler = scheduler(store);
    let first = scheduler.reconcile().await.unwrap();
    assert_eq!(first.scheduled, 2);
    let before = scheduler.active_entries();

    let second = scheduler.reconcile().await.unwrap();
    assert_eq!(second.scheduled, 2);
    assert_eq!(second.unscheduled, 0);

    let after = scheduler.active_entries();
    assert_eq!(after.len(), 2);
    for id in ids {
        assert_eq!(after.iter().filter(|e| e.job_id == id).count(), 1);
    }
    assert_eq!(
        before.iter().map(|e| (e.job_id, e.next_run)).collect::<Vec<_>>(),
        after.iter().map(|e| (e.job_id, e.next_run)).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_reconcile_drops_disabled_and_deleted_definitions() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = ScheduledJob::new("sync", "echo", every(30));
    let id = job.id;
    store.upsert_scheduled_job(job);

    let scheduler = scheduler(store.clone());
    scheduler.reconcile().await.unwrap();
    assert!(scheduler.entry(id).is_some());

    store.update_scheduled_job(id, |j| j.enabled = false).unwrap();
    let report = scheduler.reconcile().await.unwrap();
    assert_eq!(report.unscheduled, 1);
    assert!(scheduler.entry(id).is_none());
}

#[tokio::test]
async fn test_reconcile_picks_up_trigger_change() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = ScheduledJob::new("sync", "echo", every(3600));
    let id = job.id;
    store.upsert_scheduled_job(job);

    let scheduler = scheduler(store.clone());
    scheduler.reconcile().await.unwrap();

    store
        .update_scheduled_job(id, |j| j.trigger = every(5))
        .unwrap();
    scheduler.reconcile().await.unwrap();

    let entry = scheduler.entry(id).unwrap();
    assert_eq!(entry.trigger, every(5));
    assert!(entry.next_run <= chrono::Utc::now() + chrono::Duration::seconds(5));
}

#[tokio::test]
async fn test_future_window_not_scheduled() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = ScheduledJob::new("later", "echo", every(10))
        .with_window(Some(chrono::Utc::now() + chrono::Duration::hours(1)), None);
    let id = job.id;
    store.upsert_scheduled_job(job);

    let scheduler = scheduler(store);
    let report = scheduler.reconcile().await.unwrap();
    assert_eq!(report.scheduled, 0);
    assert!(scheduler.entry(id).is_none());
}

// ============================================================================
// Gating Tests
// ============================================================================

#[tokio::test]
async fn test_execution_limit_never_fires() {
    let store = Arc::new(InMemoryJobStore::new());
    let mut job = ScheduledJob::new("capped", "echo", Trigger::parse("* * * * * *").unwrap())
        .with_max_executions(2);
    job.execution_count = 2;
    let id = job.id;
    store.upsert_scheduled_job(job);

    let scheduler = scheduler(store.clone());
    let report = scheduler.reconcile().await.unwrap();
    assert_eq!(report.scheduled, 0);
    assert!(scheduler.entry(id).is_none());

    assert_eq!(
        scheduler.fire(id).await.unwrap(),
        FireOutcome::Unscheduled(ScheduleGate::ExecutionLimitReached)
    );
    assert!(store.queue_jobs_for_schedule(id).is_empty());
}

#[tokio::test]
async fn test_condition_gates_firing() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = ScheduledJob::new("conditional", "echo", every(60)).with_condition("has_backlog");
    let id = job.id;
    store.upsert_scheduled_job(job);
    let scheduler = scheduler(store.clone());

    // Unknown conditions count as false.
    assert_eq!(scheduler.fire(id).await.unwrap(), FireOutcome::Gated);

    store.set_condition("has_backlog", false);
    assert_eq!(scheduler.fire(id).await.unwrap(), FireOutcome::Gated);
    assert!(store.queue_jobs_for_schedule(id).is_empty());

    store.set_condition("has_backlog", true);
    assert!(matches!(scheduler.fire(id).await.unwrap(), FireOutcome::Enqueued(_)));
    assert_eq!(store.queue_jobs_for_schedule(id).len(), 1);

    // Gated firings do not count as executions.
    let definition = store.get_scheduled_job(id).await.unwrap().unwrap();
    assert_eq!(definition.execution_count, 1);
}

#[tokio::test]
async fn test_ended_window_unschedules_on_fire() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = ScheduledJob::new("expired", "echo", every(60))
        .with_window(None, Some(chrono::Utc::now() - chrono::Duration::seconds(1)));
    let id = job.id;
    store.upsert_scheduled_job(job);

    let scheduler = scheduler(store);
    assert_eq!(
        scheduler.fire(id).await.unwrap(),
        FireOutcome::Unscheduled(ScheduleGate::Ended)
    );
}

// ============================================================================
// Firing Tests
// ============================================================================

#[tokio::test]
async fn test_fire_materializes_queue_job() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = ScheduledJob::new("report", "echo", every(60))
        .with_payload(json!({"kind": "daily"}))
        .with_priority(Priority::HIGH)
        .with_max_retries(7);
    let id = job.id;
    store.upsert_scheduled_job(job);

    let scheduler = scheduler(store.clone());
    let FireOutcome::Enqueued(queue_job_id) = scheduler.fire(id).await.unwrap() else {
        panic!("expected the job to be enqueued");
    };

    let queue_job = store.get_queue_job(queue_job_id).await.unwrap().unwrap();
    assert_eq!(queue_job.status, QueueJobStatus::Pending);
    assert_eq!(queue_job.handler, "echo");
    assert_eq!(queue_job.payload, json!({"kind": "daily"}));
    assert_eq!(queue_job.priority, Priority::HIGH);
    assert_eq!(queue_job.max_retries, 7);
    assert_eq!(queue_job.metadata.source.as_deref(), Some("scheduler"));
    assert_eq!(queue_job.metadata.scheduled_job_id, Some(id));
    assert_eq!(queue_job.metadata.scheduled_job_name.as_deref(), Some("report"));
    assert_eq!(queue_job.metadata.execution_sequence, Some(1));

    let definition = store.get_scheduled_job(id).await.unwrap().unwrap();
    assert_eq!(definition.execution_count, 1);
    assert!(definition.last_run_at.is_some());
    assert!(definition.next_run_at > definition.last_run_at);
}

#[tokio::test]
async fn test_fire_contended_across_instances() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = ScheduledJob::new("shared", "echo", every(60));
    let id = job.id;
    store.upsert_scheduled_job(job);

    let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryBackend::new());
    let a = scheduler_on(store.clone(), cache.clone(), "instance-a");

    let holder = QueueManager::new(
        cache,
        QueueConfig {
            instance_id: Some("instance-b".to_string()),
            ..QueueConfig::default()
        },
    );
    assert!(holder.acquire_lock(id, Duration::from_secs(60)).await.unwrap());

    assert_eq!(a.fire(id).await.unwrap(), FireOutcome::Contended);
    assert!(store.queue_jobs_for_schedule(id).is_empty());

    holder.release_lock(id).await.unwrap();
    assert!(matches!(a.fire(id).await.unwrap(), FireOutcome::Enqueued(_)));
}

#[tokio::test]
async fn test_unknown_definition_is_missing() {
    let scheduler = scheduler(Arc::new(InMemoryJobStore::new()));
    assert_eq!(scheduler.fire(JobId::new()).await.unwrap(), FireOutcome::Missing);
}

// ============================================================================
// Scenario Tests
// ============================================================================

#[tokio::test]
async fn test_every_second_capped_at_three_manual() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = ScheduledJob::new("tick", "echo", Trigger::parse("@every 1s").unwrap())
        .with_max_executions(3);
    let id = job.id;
    store.upsert_scheduled_job(job);
    let scheduler = scheduler(store.clone());

    for sequence in 1..=3u64 {
        let report = scheduler.reconcile().await.unwrap();
        assert_eq!(report.scheduled, 1);
        assert!(matches!(scheduler.fire(id).await.unwrap(), FireOutcome::Enqueued(_)));
        assert_eq!(store.queue_jobs_for_schedule(id).len() as u64, sequence);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let report = scheduler.reconcile().await.unwrap();
    assert_eq!(report.scheduled, 0);
    assert_eq!(report.unscheduled, 1);
    assert!(scheduler.entry(id).is_none());

    let sequences: Vec<Option<u64>> = store
        .queue_jobs_for_schedule(id)
        .iter()
        .map(|j| j.metadata.execution_sequence)
        .collect();
    assert_eq!(sequences, vec![Some(1), Some(2), Some(3)]);
}

#[tokio::test]
async fn test_every_second_capped_at_three_with_timers() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = ScheduledJob::new("tick", "echo", Trigger::parse("@every 1s").unwrap())
        .with_max_executions(3);
    let id = job.id;
    store.upsert_scheduled_job(job);

    let scheduler = scheduler(store.clone());
    scheduler.start();
    assert!(scheduler.is_running());

    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert_eq!(store.queue_jobs_for_schedule(id).len(), 3);
    assert!(scheduler.entry(id).is_none());

    let report = scheduler.reconcile().await.unwrap();
    assert_eq!(report.scheduled, 0);
    assert!(scheduler.entry(id).is_none());

    scheduler.stop().await;
    assert!(!scheduler.is_running());
    assert!(scheduler.active_entries().is_empty());
}
