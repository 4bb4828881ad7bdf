//! Producer-side contract for creating queue jobs.

use std::sync::Arc;
use tracing::{debug, warn};

use super::handler::JobExecutor;
use super::job::{JobMetadata, Priority, QueueJob, QueueJobStatus};
use super::queue::QueueManager;
use super::store::JobStore;
use crate::error::{DroverError, ErrorCode, Result};
use crate::telemetry::JobMetrics;

/// Creates queue jobs: persist to the store first, then notify the queue manager.
#[derive(Clone)]
pub struct JobProducer {
    store: Arc<dyn JobStore>,
    queue: Arc<QueueManager>,
    executor: Option<Arc<dyn JobExecutor>>,
}

impl JobProducer {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<QueueManager>) -> Self {
        Self {
            store,
            queue,
            executor: None,
        }
    }

    /// Reject jobs whose handler `executor` does not know.
    pub fn with_executor(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Create and enqueue a job.
    ///
    /// Only the store write can fail the call; cache bookkeeping is best-effort.
    pub async fn create_job(
        &self,
        handler: &str,
        payload: serde_json::Value,
        priority: Priority,
        max_retries: u32,
        metadata: JobMetadata,
    ) -> Result<QueueJob> {
        let job = QueueJob::new(handler, payload)
            .with_priority(priority)
            .with_max_retries(max_retries)
            .with_metadata(metadata);
        self.submit(job).await
    }

    /// Persist and enqueue a fully built job.
    pub async fn submit(&self, job: QueueJob) -> Result<QueueJob> {
        if job.handler.trim().is_empty() {
            return Err(DroverError::invalid_definition("Queue job has no handler"));
        }
        if let Some(executor) = &self.executor {
            if !executor.has_handler(&job.handler) {
                return Err(DroverError::new(
                    ErrorCode::HandlerNotFound,
                    format!("No handler registered for '{}'", job.handler),
                )
                .with_context("handler", &job.handler));
            }
        }

        self.store.create_queue_job(&job).await?;

        if let Err(e) = self.queue.enqueue_job(job.id, job.priority).await {
            warn!(job_id = %job.id, error = %e, "Cache enqueue failed; store remains authoritative");
        }
        if let Err(e) = self.queue.set_job_status(job.id, QueueJobStatus::Pending).await {
            warn!(job_id = %job.id, error = %e, "Failed to mirror job status");
        }

        JobMetrics::produced(job.metadata.source.as_deref().unwrap_or("direct"));
        debug!(
            job_id = %job.id,
            handler = %job.handler,
            priority = %job.priority,
            "Queue job created"
        );
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryBackend;
    use crate::config::QueueConfig;
    use crate::jobs::handler::HandlerRegistry;
    use crate::jobs::store::InMemoryJobStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_job_persists_and_enqueues() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(QueueManager::new(
            Arc::new(InMemoryBackend::new()),
            QueueConfig::default(),
        ));
        let producer = JobProducer::new(store.clone(), queue.clone());

        let metadata = JobMetadata::new().with_source("test").with("tenant", "acme");
        let job = producer
            .create_job("echo", json!({"k": 1}), Priority::HIGH, 2, metadata.clone())
            .await
            .unwrap();

        let stored = store.get_queue_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.metadata, metadata);
        assert_eq!(stored.priority, Priority::HIGH);
        assert_eq!(stored.max_retries, 2);
        assert_eq!(stored.status, QueueJobStatus::Pending);

        assert_eq!(queue.dequeue_job().await.unwrap(), Some(job.id));
        assert_eq!(
            queue.get_job_status(job.id).await.unwrap(),
            Some(QueueJobStatus::Pending)
        );
    }

    #[tokio::test]
    async fn test_unknown_handler_rejected_with_executor() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(QueueManager::new(
            Arc::new(InMemoryBackend::new()),
            QueueConfig::default(),
        ));
        let producer =
            JobProducer::new(store.clone(), queue).with_executor(Arc::new(HandlerRegistry::new()));

        let err = producer
            .create_job("nope", json!(null), Priority::NORMAL, 0, JobMetadata::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::HandlerNotFound);
        assert!(store.queue_jobs().is_empty());
    }
}
