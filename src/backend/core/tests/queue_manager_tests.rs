//! Integration tests for cross-instance coordination through the queue manager.
//!
//! Several `QueueManager`s sharing one `InMemoryBackend` stand in for several
//! server instances sharing one Redis.

use drover_core::cache::{CacheBackend, InMemoryBackend, NoopBackend};
use drover_core::config::QueueConfig;
use drover_core::error::ErrorCode;
use drover_core::jobs::{JobId, Priority, QueueJobStatus, QueueManager};
use std::sync::Arc;
use std::time::Duration;

fn instance(cache: Arc<dyn CacheBackend>, id: &str) -> QueueManager {
    QueueManager::new(
        cache,
        QueueConfig {
            instance_id: Some(id.to_string()),
            lock_retries: 0,
            lock_retry_backoff: Duration::from_millis(1),
            ..QueueConfig::default()
        },
    )
}

fn pair() -> (QueueManager, QueueManager) {
    let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryBackend::new());
    (instance(cache.clone(), "instance-a"), instance(cache, "instance-b"))
}

// ============================================================================
// Lock Ownership Tests
// ============================================================================

#[tokio::test]
async fn test_only_one_instance_acquires() {
    let (a, b) = pair();
    let job = JobId::new();

    assert!(a.acquire_lock(job, Duration::from_secs(60)).await.unwrap());
    assert!(!b.acquire_lock(job, Duration::from_secs(60)).await.unwrap());

    let lock = b.current_lock(job).await.unwrap().unwrap();
    assert_eq!(lock.owner, "instance-a");
}

#[tokio::test]
async fn test_non_owner_cannot_release() {
    let (a, b) = pair();
    let job = JobId::new();
    a.acquire_lock(job, Duration::from_secs(60)).await.unwrap();

    let err = b.release_lock(job).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::LockNotOwned);

    // Still held by the owner.
    assert!(a.current_lock(job).await.unwrap().is_some());
    assert!(a.release_lock(job).await.unwrap());
    assert!(a.current_lock(job).await.unwrap().is_none());
}

#[tokio::test]
async fn test_non_owner_cannot_extend() {
    let (a, b) = pair();
    let job = JobId::new();
    a.acquire_lock(job, Duration::from_secs(60)).await.unwrap();
    let before = a.current_lock(job).await.unwrap().unwrap().expires_at;

    let err = b.extend_lock(job, Duration::from_secs(600)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::LockNotOwned);

    let after = a.current_lock(job).await.unwrap().unwrap().expires_at;
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_extend_missing_lock_is_not_held() {
    let (a, _) = pair();
    let err = a.extend_lock(JobId::new(), Duration::from_secs(5)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::LockNotHeld);
}

#[tokio::test]
async fn test_release_missing_lock_is_false() {
    let (a, _) = pair();
    assert!(!a.release_lock(JobId::new()).await.unwrap());
}

// ============================================================================
// Lock TTL Tests
// ============================================================================

#[tokio::test]
async fn test_expired_lock_acquired_by_other_instance() {
    let (a, b) = pair();
    let job = JobId::new();

    assert!(a.acquire_lock(job, Duration::from_millis(50)).await.unwrap());
    assert!(!b.acquire_lock(job, Duration::from_secs(60)).await.unwrap());

    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(b.acquire_lock(job, Duration::from_secs(60)).await.unwrap());
    assert_eq!(b.current_lock(job).await.unwrap().unwrap().owner, "instance-b");

    // The previous owner has lost it.
    let err = a.release_lock(job).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::LockNotOwned);
}

#[tokio::test]
async fn test_lock_retry_waits_for_release() {
    let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryBackend::new());
    let a = Arc::new(instance(cache.clone(), "instance-a"));
    let b = QueueManager::new(
        cache,
        QueueConfig {
            instance_id: Some("instance-b".to_string()),
            lock_retries: 5,
            lock_retry_backoff: Duration::from_millis(20),
            ..QueueConfig::default()
        },
    );
    let job = JobId::new();
    a.acquire_lock(job, Duration::from_secs(60)).await.unwrap();

    let releaser = {
        let a = a.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            a.release_lock(job).await.unwrap();
        })
    };

    assert!(b.acquire_lock(job, Duration::from_secs(60)).await.unwrap());
    releaser.await.unwrap();
}

// ============================================================================
// Queue Entry and Status Mirror Tests
// ============================================================================

#[tokio::test]
async fn test_entries_visible_across_instances() {
    let (a, b) = pair();
    let job = JobId::new();

    a.enqueue_job(job, Priority::HIGH).await.unwrap();

    let entry = b.get_queue_entry(job).await.unwrap().unwrap();
    assert_eq!(entry.priority, Priority::HIGH);
    assert_eq!(entry.instance_id, "instance-a");
    assert_eq!(b.dequeue_job().await.unwrap(), Some(job));
    assert_eq!(a.dequeue_job().await.unwrap(), None);
}

#[tokio::test]
async fn test_status_mirror_shared() {
    let (a, b) = pair();
    let job = JobId::new();

    a.set_job_status(job, QueueJobStatus::Processing).await.unwrap();
    assert_eq!(
        b.get_job_status(job).await.unwrap(),
        Some(QueueJobStatus::Processing)
    );

    b.clear_job_data(job).await.unwrap();
    assert_eq!(a.get_job_status(job).await.unwrap(), None);
}

#[tokio::test]
async fn test_clear_keeps_foreign_lock() {
    let (a, b) = pair();
    let job = JobId::new();
    a.acquire_lock(job, Duration::from_secs(60)).await.unwrap();

    b.clear_job_data(job).await.unwrap();
    assert!(a.current_lock(job).await.unwrap().is_some());
}

// ============================================================================
// Degraded Mode Tests
// ============================================================================

#[tokio::test]
async fn test_noop_cache_never_errors() {
    let queue = QueueManager::new(Arc::new(NoopBackend), QueueConfig::default());
    let job = JobId::new();

    assert!(!queue.is_distributed());
    queue.enqueue_job(job, Priority::NORMAL).await.unwrap();
    assert!(queue.acquire_lock(job, Duration::from_secs(1)).await.unwrap());
    assert!(queue.acquire_lock(job, Duration::from_secs(1)).await.unwrap());
    queue.extend_lock(job, Duration::from_secs(1)).await.unwrap();
    queue.set_job_status(job, QueueJobStatus::Pending).await.unwrap();
    assert_eq!(queue.get_job_status(job).await.unwrap(), None);
    assert_eq!(queue.dequeue_job().await.unwrap(), None);
    queue.clear_job_data(job).await.unwrap();
    queue.health_check().await.unwrap();
}

#[tokio::test]
async fn test_generated_instance_ids_differ() {
    let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryBackend::new());
    let a = QueueManager::new(cache.clone(), QueueConfig::default());
    let b = QueueManager::new(cache, QueueConfig::default());

    assert!(a.instance_id().starts_with("instance-"));
    assert_ne!(a.instance_id(), b.instance_id());
}
