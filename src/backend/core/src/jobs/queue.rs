//! Distributed queue manager.
//!
//! Best-effort coordination primitives over the shared cache: queue
//! bookkeeping, per-job distributed locks and ephemeral status mirrors. The job
//! store stays the system of record; nothing here is durable.
//!
//! Cache layout (every key carries a TTL):
//!
//! ```text
//! job:queue:pending        list of pending job ids
//! job:queue:entry:<id>     QueueEntry
//! job:lock:<id>            DistributedLock
//! job:status:<id>          status string
//! ```

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::job::{DistributedLock, JobId, Priority, QueueEntry, QueueJobStatus};
use crate::cache::CacheBackend;
use crate::config::QueueConfig;
use crate::error::{DroverError, Result};
use crate::telemetry::JobMetrics;

const PENDING_KEY: &str = "job:queue:pending";
const HEALTH_TTL: Duration = Duration::from_secs(10);

fn entry_key(job_id: JobId) -> String {
    format!("job:queue:entry:{}", job_id)
}

fn lock_key(job_id: JobId) -> String {
    format!("job:lock:{}", job_id)
}

fn status_key(job_id: JobId) -> String {
    format!("job:status:{}", job_id)
}

/// Cache-backed coordination for one instance.
pub struct QueueManager {
    instance_id: String,
    cache: Arc<dyn CacheBackend>,
    config: QueueConfig,
}

impl QueueManager {
    pub fn new(cache: Arc<dyn CacheBackend>, config: QueueConfig) -> Self {
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("instance-{}", Uuid::new_v4()));

        debug!(
            instance_id = %instance_id,
            backend = cache.name(),
            "Queue manager created"
        );

        Self {
            instance_id,
            cache,
            config,
        }
    }

    /// Identifier recorded as lock owner.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Whether a real shared cache backs this manager.
    pub fn is_distributed(&self) -> bool {
        !self.cache.is_noop()
    }

    /// Default TTL for locks taken by workers.
    pub fn lock_ttl(&self) -> Duration {
        self.config.lock_ttl
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Queue bookkeeping
    // ═══════════════════════════════════════════════════════════════════════════

    /// Record a queue entry and append the job id to the pending list.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn enqueue_job(&self, job_id: JobId, priority: Priority) -> Result<()> {
        let entry = QueueEntry {
            job_id,
            priority,
            enqueued_at: Utc::now(),
            instance_id: self.instance_id.clone(),
        };
        let bytes = serde_json::to_vec(&entry)?;

        self.cache
            .set(&entry_key(job_id), &bytes, self.config.entry_ttl)
            .await?;
        self.cache
            .push_back(PENDING_KEY, &job_id.to_string(), self.config.entry_ttl)
            .await?;

        debug!(job_id = %job_id, priority = %priority, "Job enqueued in cache");
        Ok(())
    }

    /// Pop one pending job id. Only a hint; the store claim decides ordering.
    pub async fn dequeue_job(&self) -> Result<Option<JobId>> {
        while let Some(raw) = self.cache.pop_front(PENDING_KEY).await? {
            match raw.parse::<JobId>() {
                Ok(job_id) => return Ok(Some(job_id)),
                Err(_) => warn!(member = %raw, "Discarding malformed pending marker"),
            }
        }
        Ok(None)
    }

    /// Queue entry written by [`enqueue_job`](Self::enqueue_job), if still cached.
    pub async fn get_queue_entry(&self, job_id: JobId) -> Result<Option<QueueEntry>> {
        match self.cache.get(&entry_key(job_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Distributed locks
    // ═══════════════════════════════════════════════════════════════════════════

    async fn read_lock(&self, job_id: JobId) -> Result<Option<DistributedLock>> {
        Ok(self.read_lock_record(job_id).await?.map(|(lock, _)| lock))
    }

    /// Decoded lock plus the raw bytes it was read from, for compare-and-delete.
    async fn read_lock_record(&self, job_id: JobId) -> Result<Option<(DistributedLock, Vec<u8>)>> {
        let Some(bytes) = self.cache.get(&lock_key(job_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<DistributedLock>(&bytes) {
            Ok(lock) => Ok(Some((lock, bytes))),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Unreadable lock record, treating as expired");
                let mut stale = DistributedLock::new(job_id, String::new(), Duration::ZERO);
                stale.expires_at = Utc::now() - chrono::Duration::seconds(1);
                Ok(Some((stale, bytes)))
            }
        }
    }

    /// Lock currently recorded for `job_id`, if any.
    pub async fn current_lock(&self, job_id: JobId) -> Result<Option<DistributedLock>> {
        self.read_lock(job_id).await
    }

    /// Try to take the lock for `job_id`.
    ///
    /// Retries with linear back-off while the lock is held elsewhere. An expired
    /// lock is removed and the attempt repeated immediately. Returns `false` on
    /// contention; never blocks indefinitely.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn acquire_lock(&self, job_id: JobId, ttl: Duration) -> Result<bool> {
        let key = lock_key(job_id);

        for attempt in 0..=self.config.lock_retries {
            let lock = DistributedLock::new(job_id, &self.instance_id, ttl);
            let bytes = serde_json::to_vec(&lock)?;

            if self.cache.set_if_absent(&key, &bytes, ttl).await? {
                debug!(job_id = %job_id, attempt, "Lock acquired");
                return Ok(true);
            }

            match self.read_lock_record(job_id).await? {
                // Released between our write and read.
                None => continue,
                Some((existing, raw)) if existing.is_expired_at(Utc::now()) => {
                    debug!(job_id = %job_id, owner = %existing.owner, "Removing expired lock");
                    self.cache.delete_if_eq(&key, &raw).await?;
                }
                Some((existing, _)) => {
                    debug!(job_id = %job_id, owner = %existing.owner, attempt, "Lock held elsewhere");
                    if attempt < self.config.lock_retries {
                        tokio::time::sleep(self.config.lock_retry_backoff * (attempt + 1)).await;
                    }
                }
            }
        }

        JobMetrics::lock_contended();
        Ok(false)
    }

    /// Release the lock for `job_id`.
    ///
    /// Returns `Ok(false)` when no lock exists and an ownership error when the
    /// lock belongs to another instance.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn release_lock(&self, job_id: JobId) -> Result<bool> {
        match self.read_lock_record(job_id).await? {
            None => Ok(false),
            Some((lock, _)) if !lock.is_owned_by(&self.instance_id) => Err(DroverError::lock_not_owned(
                job_id,
                &lock.owner,
                &self.instance_id,
            )),
            Some((_, raw)) => {
                // Only the record we just read; a lock re-acquired meanwhile survives.
                let removed = self.cache.delete_if_eq(&lock_key(job_id), &raw).await?;
                debug!(job_id = %job_id, "Lock released");
                Ok(removed)
            }
        }
    }

    /// Push the expiry of an owned lock `extra` further out.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn extend_lock(&self, job_id: JobId, extra: Duration) -> Result<()> {
        let now = Utc::now();
        match self.read_lock(job_id).await? {
            None if self.cache.is_noop() => Ok(()),
            None => Err(DroverError::lock_not_held(job_id)),
            Some(lock) if !lock.is_owned_by(&self.instance_id) => Err(DroverError::lock_not_owned(
                job_id,
                &lock.owner,
                &self.instance_id,
            )),
            Some(lock) if lock.is_expired_at(now) => Err(DroverError::lock_not_held(job_id)),
            Some(mut lock) => {
                lock.expires_at += chrono::Duration::from_std(extra)
                    .map_err(|e| DroverError::internal(format!("Lock extension out of range: {}", e)))?;
                let bytes = serde_json::to_vec(&lock)?;
                self.cache
                    .set(&lock_key(job_id), &bytes, lock.remaining(now))
                    .await?;
                debug!(job_id = %job_id, expires_at = %lock.expires_at, "Lock extended");
                Ok(())
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Status mirror
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn set_job_status(&self, job_id: JobId, status: QueueJobStatus) -> Result<()> {
        self.cache
            .set(&status_key(job_id), status.as_str().as_bytes(), self.config.status_ttl)
            .await
    }

    pub async fn get_job_status(&self, job_id: JobId) -> Result<Option<QueueJobStatus>> {
        match self.cache.get(&status_key(job_id)).await? {
            Some(bytes) => {
                let raw = String::from_utf8_lossy(&bytes);
                Ok(Some(raw.parse()?))
            }
            None => Ok(None),
        }
    }

    /// Remove lock, status and queue entry for a finished job. Idempotent.
    ///
    /// A live lock owned by another instance is left alone.
    pub async fn clear_job_data(&self, job_id: JobId) -> Result<()> {
        match self.read_lock_record(job_id).await? {
            Some((lock, _))
                if !lock.is_owned_by(&self.instance_id) && !lock.is_expired_at(Utc::now()) =>
            {
                debug!(job_id = %job_id, owner = %lock.owner, "Keeping lock owned by another instance");
            }
            Some((_, raw)) => {
                self.cache.delete_if_eq(&lock_key(job_id), &raw).await?;
            }
            None => {}
        }
        self.cache.delete(&status_key(job_id)).await?;
        self.cache.delete(&entry_key(job_id)).await?;
        Ok(())
    }

    /// Write, read back and delete a probe key.
    pub async fn health_check(&self) -> Result<()> {
        if self.cache.is_noop() {
            return Ok(());
        }

        let key = format!("job:health:{}", self.instance_id);
        let probe = Uuid::new_v4().to_string();
        self.cache.set(&key, probe.as_bytes(), HEALTH_TTL).await?;
        let read = self.cache.get(&key).await?;
        self.cache.delete(&key).await?;

        match read {
            Some(bytes) if bytes == probe.as_bytes() => Ok(()),
            _ => Err(DroverError::cache_unavailable(format!(
                "Health probe round-trip failed on {} backend",
                self.cache.name()
            ))),
        }
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("instance_id", &self.instance_id)
            .field("backend", &self.cache.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemoryBackend, NoopBackend};
    use crate::error::ErrorCode;

    fn manager(cache: Arc<dyn CacheBackend>, instance: &str) -> QueueManager {
        QueueManager::new(
            cache,
            QueueConfig {
                instance_id: Some(instance.to_string()),
                lock_retry_backoff: Duration::from_millis(5),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_enqueue_dequeue() {
        let qm = manager(Arc::new(InMemoryBackend::new()), "a");
        let first = JobId::new();
        let second = JobId::new();

        qm.enqueue_job(first, Priority::NORMAL).await.unwrap();
        qm.enqueue_job(second, Priority::HIGH).await.unwrap();

        let entry = qm.get_queue_entry(first).await.unwrap().unwrap();
        assert_eq!(entry.instance_id, "a");

        assert_eq!(qm.dequeue_job().await.unwrap(), Some(first));
        assert_eq!(qm.dequeue_job().await.unwrap(), Some(second));
        assert_eq!(qm.dequeue_job().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryBackend::new());
        let a = manager(cache.clone(), "a");
        let b = manager(cache, "b");
        let job = JobId::new();

        assert!(a.acquire_lock(job, Duration::from_secs(60)).await.unwrap());
        assert!(!b.acquire_lock(job, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_requires_ownership() {
        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryBackend::new());
        let a = manager(cache.clone(), "a");
        let b = manager(cache, "b");
        let job = JobId::new();

        a.acquire_lock(job, Duration::from_secs(60)).await.unwrap();

        let err = b.release_lock(job).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::LockNotOwned);

        let err = b.extend_lock(job, Duration::from_secs(60)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::LockNotOwned);

        assert!(a.release_lock(job).await.unwrap());
        assert!(!a.release_lock(job).await.unwrap());
    }

    /// Cache where another instance takes the lock right after it is read.
    struct ReacquiredAfterRead {
        inner: InMemoryBackend,
        next_owner: parking_lot::Mutex<Option<Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl CacheBackend for ReacquiredAfterRead {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            let value = self.inner.get(key).await?;
            let next = self.next_owner.lock().take();
            if let Some(bytes) = next {
                self.inner.set(key, &bytes, Duration::from_secs(60)).await?;
            }
            Ok(value)
        }

        async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }

        async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
            self.inner.delete_if_eq(key, expected).await
        }

        async fn push_back(&self, key: &str, member: &str, ttl: Duration) -> Result<()> {
            self.inner.push_back(key, member, ttl).await
        }

        async fn pop_front(&self, key: &str) -> Result<Option<String>> {
            self.inner.pop_front(key).await
        }

        fn name(&self) -> &'static str {
            "reacquired_after_read"
        }
    }

    #[tokio::test]
    async fn test_release_keeps_lock_reacquired_after_read() {
        let cache = Arc::new(ReacquiredAfterRead {
            inner: InMemoryBackend::new(),
            next_owner: parking_lot::Mutex::new(None),
        });
        let a = manager(cache.clone(), "a");
        let job = JobId::new();
        assert!(a.acquire_lock(job, Duration::from_secs(60)).await.unwrap());

        let taken_over = DistributedLock::new(job, "b", Duration::from_secs(60));
        *cache.next_owner.lock() = Some(serde_json::to_vec(&taken_over).unwrap());

        assert!(!a.release_lock(job).await.unwrap());
        assert_eq!(a.current_lock(job).await.unwrap().unwrap().owner, "b");
    }

    #[tokio::test]
    async fn test_clear_keeps_lock_reacquired_after_read() {
        let cache = Arc::new(ReacquiredAfterRead {
            inner: InMemoryBackend::new(),
            next_owner: parking_lot::Mutex::new(None),
        });
        let a = manager(cache.clone(), "a");
        let job = JobId::new();
        assert!(a.acquire_lock(job, Duration::from_secs(60)).await.unwrap());

        let taken_over = DistributedLock::new(job, "b", Duration::from_secs(60));
        *cache.next_owner.lock() = Some(serde_json::to_vec(&taken_over).unwrap());

        a.clear_job_data(job).await.unwrap();
        assert_eq!(a.current_lock(job).await.unwrap().unwrap().owner, "b");
    }

    #[tokio::test]
    async fn test_extend_lock_moves_expiry() {
        let qm = manager(Arc::new(InMemoryBackend::new()), "a");
        let job = JobId::new();

        assert_eq!(
            qm.extend_lock(job, Duration::from_secs(1)).await.unwrap_err().code(),
            ErrorCode::LockNotHeld
        );

        qm.acquire_lock(job, Duration::from_secs(60)).await.unwrap();
        let before = qm.current_lock(job).await.unwrap().unwrap().expires_at;
        qm.extend_lock(job, Duration::from_secs(30)).await.unwrap();
        let after = qm.current_lock(job).await.unwrap().unwrap().expires_at;
        assert_eq!(after - before, chrono::Duration::seconds(30));
    }

    #[tokio::test]
    async fn test_status_mirror_and_clear() {
        let qm = manager(Arc::new(InMemoryBackend::new()), "a");
        let job = JobId::new();

        qm.enqueue_job(job, Priority::NORMAL).await.unwrap();
        qm.acquire_lock(job, Duration::from_secs(60)).await.unwrap();
        qm.set_job_status(job, QueueJobStatus::Processing).await.unwrap();
        assert_eq!(
            qm.get_job_status(job).await.unwrap(),
            Some(QueueJobStatus::Processing)
        );

        qm.clear_job_data(job).await.unwrap();
        qm.clear_job_data(job).await.unwrap();
        assert_eq!(qm.get_job_status(job).await.unwrap(), None);
        assert!(qm.current_lock(job).await.unwrap().is_none());
        assert!(qm.get_queue_entry(job).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_noop_backend_never_errors() {
        let qm = manager(Arc::new(NoopBackend), "solo");
        let job = JobId::new();

        assert!(!qm.is_distributed());
        qm.enqueue_job(job, Priority::NORMAL).await.unwrap();
        assert_eq!(qm.dequeue_job().await.unwrap(), None);
        assert!(qm.acquire_lock(job, Duration::from_secs(1)).await.unwrap());
        qm.extend_lock(job, Duration::from_secs(1)).await.unwrap();
        assert!(!qm.release_lock(job).await.unwrap());
        qm.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_check_in_memory() {
        let qm = manager(Arc::new(InMemoryBackend::new()), "a");
        qm.health_check().await.unwrap();
    }
}
