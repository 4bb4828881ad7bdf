//! Built-in job handlers.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use super::handler::{HandlerRegistry, JobContext, JobHandler, JobOutcome};
use super::job::JobError;
use super::store::StoreTransaction;
use crate::db::{PgJobStore, PgStoreTransaction};

/// Register every built-in handler.
pub fn register_builtin_handlers(registry: &mut HandlerRegistry) {
    registry
        .register(Arc::new(EchoHandler))
        .register(Arc::new(PurgeHistoryHandler));
}

/// Handler: returns its payload as output. Useful for smoke tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn handle(
        &self,
        ctx: &JobContext,
        payload: &serde_json::Value,
        _tx: &mut dyn StoreTransaction,
    ) -> JobOutcome {
        ctx.log_info("Echoing payload");
        Ok(payload.clone())
    }
}

/// Payload of [`PurgeHistoryHandler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeHistoryPayload {
    /// History rows older than this many days are deleted.
    #[serde(default = "default_retention_days")]
    pub older_than_days: u32,
}

fn default_retention_days() -> u32 {
    30
}

impl Default for PurgeHistoryPayload {
    fn default() -> Self {
        Self {
            older_than_days: default_retention_days(),
        }
    }
}

/// Handler: deletes old execution history inside the job's transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct PurgeHistoryHandler;

#[async_trait]
impl JobHandler for PurgeHistoryHandler {
    fn name(&self) -> &str {
        "purge_job_history"
    }

    async fn handle(
        &self,
        ctx: &JobContext,
        payload: &serde_json::Value,
        tx: &mut dyn StoreTransaction,
    ) -> JobOutcome {
        let params: PurgeHistoryPayload = if payload.is_null() {
            PurgeHistoryPayload::default()
        } else {
            serde_json::from_value(payload.clone())
                .map_err(|e| JobError::fatal(format!("Invalid payload: {}", e)))?
        };

        let pg = tx
            .as_any_mut()
            .downcast_mut::<PgStoreTransaction>()
            .ok_or_else(|| {
                JobError::fatal("purge_job_history requires a PostgreSQL store")
                    .with_code("UNSUPPORTED_STORE")
            })?;

        let cutoff = Utc::now() - chrono::Duration::days(i64::from(params.older_than_days));
        let deleted = PgJobStore::purge_job_history(pg.connection(), cutoff).await?;

        ctx.log_info(&format!(
            "Purged {} history rows older than {} days",
            deleted, params.older_than_days
        ));
        Ok(json!({ "deleted": deleted, "cutoff": cutoff }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoopBackend;
    use crate::config::QueueConfig;
    use crate::jobs::handler::JobExecutor;
    use crate::jobs::job::QueueJob;
    use crate::jobs::queue::QueueManager;
    use crate::jobs::store::{InMemoryJobStore, JobStore};
    use tokio::sync::watch;

    fn context(job: &QueueJob) -> JobContext {
        let queue = Arc::new(QueueManager::new(Arc::new(NoopBackend), QueueConfig::default()));
        let (_tx, rx) = watch::channel(false);
        JobContext::new(job, "worker-test", queue, rx)
    }

    #[tokio::test]
    async fn test_builtins_registered() {
        let mut registry = HandlerRegistry::new();
        register_builtin_handlers(&mut registry);
        assert_eq!(registry.names(), vec!["echo", "purge_job_history"]);
    }

    #[tokio::test]
    async fn test_echo_returns_payload() {
        let mut registry = HandlerRegistry::new();
        register_builtin_handlers(&mut registry);
        let store = InMemoryJobStore::new();
        let job = QueueJob::new("echo", json!({"hello": "world"}));
        let mut tx = store.begin().await.unwrap();

        let output = registry
            .execute(&context(&job), "echo", &job.payload, tx.as_mut())
            .await
            .unwrap();
        assert_eq!(output, json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn test_purge_rejects_non_postgres_transaction() {
        let store = InMemoryJobStore::new();
        let job = QueueJob::new("purge_job_history", json!({"older_than_days": 7}));
        let mut tx = store.begin().await.unwrap();

        let err = PurgeHistoryHandler
            .handle(&context(&job), &job.payload, tx.as_mut())
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.code.as_deref(), Some("UNSUPPORTED_STORE"));
    }

    #[test]
    fn test_purge_payload_default() {
        let params: PurgeHistoryPayload = serde_json::from_value(json!({})).unwrap();
        assert_eq!(params.older_than_days, 30);
    }
}
