//! Handler execution boundary.
//!
//! Workers invoke a [`JobExecutor`] by handler name. [`HandlerRegistry`] is the
//! stock executor: it maps names to [`JobHandler`] implementations.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::job::{JobError, JobId, JobMetadata, QueueJob};
use super::queue::QueueManager;
use super::store::StoreTransaction;
use crate::error::Result;

/// Result of one handler invocation.
pub type JobOutcome = std::result::Result<serde_json::Value, JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to handlers during execution.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub handler: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub worker_id: String,
    pub metadata: JobMetadata,
    queue: Arc<QueueManager>,
    shutdown: watch::Receiver<bool>,
}

impl JobContext {
    pub fn new(
        job: &QueueJob,
        worker_id: impl Into<String>,
        queue: Arc<QueueManager>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            job_id: job.id,
            handler: job.handler.clone(),
            attempt: job.attempt(),
            worker_id: worker_id.into(),
            metadata: job.metadata.clone(),
            queue,
            shutdown,
        }
    }

    /// Check if the worker pool is stopping.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Extend this job's distributed lock.
    ///
    /// Handlers that may outlive the lock TTL must call this periodically.
    pub async fn extend_lock(&self, extra: Duration) -> Result<()> {
        self.queue.extend_lock(self.job_id, extra).await
    }

    /// Log a message with job context.
    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.job_id,
            handler = %self.handler,
            attempt = self.attempt,
            "{}", message
        );
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("handler", &self.handler)
            .field("attempt", &self.attempt)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Executor Traits
// ═══════════════════════════════════════════════════════════════════════════════

/// Entry point workers call to run a job.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run `handler` with `payload` inside the store transaction `tx`.
    async fn execute(
        &self,
        ctx: &JobContext,
        handler: &str,
        payload: &serde_json::Value,
        tx: &mut dyn StoreTransaction,
    ) -> JobOutcome;

    /// Whether `handler` can be executed at all.
    fn has_handler(&self, handler: &str) -> bool;
}

/// A named unit of work.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(
        &self,
        ctx: &JobContext,
        payload: &serde_json::Value,
        tx: &mut dyn StoreTransaction,
    ) -> JobOutcome;
}

struct FnHandler<F> {
    name: String,
    func: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        ctx: &JobContext,
        payload: &serde_json::Value,
        _tx: &mut dyn StoreTransaction,
    ) -> JobOutcome {
        (self.func)(ctx.clone(), payload.clone()).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Name-indexed set of handlers.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own name, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> &mut Self {
        let name = handler.name().to_string();
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::warn!(handler = %name, "Replacing previously registered handler");
        }
        self
    }

    /// Register a closure that does not need the store transaction.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn(JobContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobOutcome> + Send + 'static,
    {
        self.register(Arc::new(FnHandler {
            name: name.into(),
            func,
        }))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl JobExecutor for HandlerRegistry {
    async fn execute(
        &self,
        ctx: &JobContext,
        handler: &str,
        payload: &serde_json::Value,
        tx: &mut dyn StoreTransaction,
    ) -> JobOutcome {
        match self.handlers.get(handler) {
            Some(h) => h.handle(ctx, payload, tx).await,
            None => Err(JobError::fatal(format!("No handler registered for '{}'", handler))
                .with_code("HANDLER_NOT_FOUND")),
        }
    }

    fn has_handler(&self, handler: &str) -> bool {
        self.handlers.contains_key(handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoopBackend;
    use crate::config::QueueConfig;
    use crate::jobs::store::{InMemoryJobStore, JobStore};
    use serde_json::json;

    fn context(job: &QueueJob) -> JobContext {
        let queue = Arc::new(QueueManager::new(Arc::new(NoopBackend), QueueConfig::default()));
        let (_tx, rx) = watch::channel(false);
        JobContext::new(job, "worker-0", queue, rx)
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_name() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("double", |_ctx, payload| async move {
            let n = payload.as_i64().ok_or_else(|| JobError::fatal("expected a number"))?;
            Ok(json!(n * 2))
        });

        let store = InMemoryJobStore::new();
        let job = QueueJob::new("double", json!(21));
        let ctx = context(&job);
        let mut tx = store.begin().await.unwrap();

        let output = registry
            .execute(&ctx, "double", &job.payload, tx.as_mut())
            .await
            .unwrap();
        assert_eq!(output, json!(42));
        assert!(registry.has_handler("double"));
        assert_eq!(registry.names(), vec!["double"]);
    }

    #[tokio::test]
    async fn test_unknown_handler_is_fatal() {
        let registry = HandlerRegistry::new();
        let store = InMemoryJobStore::new();
        let job = QueueJob::new("missing", json!(null));
        let ctx = context(&job);
        let mut tx = store.begin().await.unwrap();

        let err = registry
            .execute(&ctx, "missing", &job.payload, tx.as_mut())
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.code.as_deref(), Some("HANDLER_NOT_FOUND"));
    }
}
