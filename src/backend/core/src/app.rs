//! Application wiring for the job subsystem.

use std::sync::Arc;

use crate::cache::{self, CacheBackend, NoopBackend};
use crate::config::Config;
use crate::error::Result;
use crate::jobs::{
    IntegrationJobCreator, JobExecutor, JobProducer, JobScheduler, JobStore, JobWorkerPool,
    QueueManager,
};

/// Every long-lived component of a running instance.
pub struct AppContext {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<QueueManager>,
    pub producer: JobProducer,
    pub workers: JobWorkerPool,
    pub scheduler: JobScheduler,
    pub integrations: IntegrationJobCreator,
    scheduler_enabled: bool,
}

impl AppContext {
    /// Wire the components over an already-connected store and cache.
    pub fn build(
        config: &Config,
        store: Arc<dyn JobStore>,
        cache: Arc<dyn CacheBackend>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        let queue = Arc::new(QueueManager::new(cache, config.queue.clone()));
        let producer = JobProducer::new(store.clone(), queue.clone()).with_executor(executor.clone());

        let workers = JobWorkerPool::new(
            store.clone(),
            queue.clone(),
            executor,
            config.worker.clone(),
        );
        let scheduler = JobScheduler::new(
            store.clone(),
            queue.clone(),
            producer.clone(),
            config.scheduler.clone(),
        );
        let integrations = IntegrationJobCreator::new(producer.clone(), config.integration.clone());

        Self {
            store,
            queue,
            producer,
            workers,
            scheduler,
            integrations,
            scheduler_enabled: config.scheduler.enabled,
        }
    }

    /// Connect the shared cache and verify it answers.
    ///
    /// Falls back to [`NoopBackend`] when the cache is absent or unhealthy.
    pub async fn connect_cache(config: &Config) -> Arc<dyn CacheBackend> {
        let backend = cache::connect(config.redis.as_ref()).await;
        if backend.is_noop() {
            return backend;
        }

        let probe = QueueManager::new(backend.clone(), config.queue.clone());
        match probe.health_check().await {
            Ok(()) => backend,
            Err(e) => {
                tracing::warn!(
                    cache = backend.name(),
                    error = %e,
                    "Cache health check failed; running in single-instance mode"
                );
                Arc::new(NoopBackend)
            }
        }
    }

    /// Start workers and, when enabled, the scheduler.
    pub fn start(&self) -> Result<()> {
        self.workers.start()?;
        if self.scheduler_enabled {
            self.scheduler.start();
        } else {
            tracing::info!("Scheduler disabled on this instance");
        }
        tracing::info!(
            instance_id = %self.queue.instance_id(),
            distributed = self.queue.is_distributed(),
            "Job subsystem started"
        );
        Ok(())
    }

    /// Stop the scheduler first so no new jobs are produced, then drain workers.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.workers.stop().await;
        tracing::info!(
            processed = self.workers.stats().processed(),
            "Job subsystem stopped"
        );
    }
}
