//! Distributed background job system.
//!
//! - **Queue manager**: cache-backed locks, queue entries and a status mirror
//!   shared by every instance
//! - **Store**: durable queue jobs, execution history and scheduled job
//!   definitions (PostgreSQL in production, in-memory for tests)
//! - **Worker pool**: concurrent claim/lock/execute loops with retry and
//!   graceful shutdown
//! - **Scheduler**: cron and interval triggers reconciled against the store
//! - **Producers**: direct submission and integration message translation
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                          Background Job System                          │
//! ├────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐   ┌─────────────┐ │
//! │  │ Integration │   │  Scheduler  │   │  JobStore   │   │ Worker Pool │ │
//! │  │   Creator   │──▶│ (Cron/      │──▶│ (Postgres)  │──▶│  (Executor) │ │
//! │  │  / Producer │   │  Interval)  │   │             │   │             │ │
//! │  └─────────────┘   └─────────────┘   └─────────────┘   └─────────────┘ │
//! │         │                 │                 │                 │        │
//! │         ▼                 ▼                 ▼                 ▼        │
//! │  ┌──────────────────────────────────────────────────────────────────┐ │
//! │  │            QueueManager (locks, entries, status mirror)          │ │
//! │  │                    over a shared TTL cache                       │ │
//! │  └──────────────────────────────────────────────────────────────────┘ │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use drover_core::jobs::{HandlerRegistry, JobProducer, JobWorkerPool, QueueManager};
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_fn("send_email", |ctx, payload| async move {
//!     ctx.log_info("sending");
//!     Ok(payload)
//! });
//! let registry = Arc::new(registry);
//!
//! let producer = JobProducer::new(store.clone(), queue.clone()).with_executor(registry.clone());
//! producer.create_job("send_email", json!({"to": "a@b.c"}), Priority::NORMAL, 3, JobMetadata::new()).await?;
//!
//! let pool = JobWorkerPool::new(store, queue, registry, WorkerConfig::default());
//! pool.start()?;
//! ```

pub mod builtin;
pub mod handler;
pub mod integration;
pub mod job;
pub mod producer;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use builtin::{register_builtin_handlers, EchoHandler, PurgeHistoryHandler};
pub use handler::{HandlerRegistry, JobContext, JobExecutor, JobHandler, JobOutcome};
pub use integration::{IntegrationJobCreator, IntegrationMessage, MessageDirection};
pub use job::{
    BackoffStrategy, CronExpr, DistributedLock, ExecutionResult, JobError, JobHistory, JobId,
    JobMetadata, Priority, QueueEntry, QueueJob, QueueJobStatus, ScheduleGate, ScheduledJob,
    Trigger,
};
pub use producer::JobProducer;
pub use queue::QueueManager;
pub use scheduler::{FireOutcome, JobScheduler, ReconcileReport, ScheduleEntryInfo};
pub use store::{InMemoryJobStore, InMemoryTransaction, JobStore, StoreTransaction};
pub use worker::{JobWorkerPool, PollOutcome, WorkerStats};
