#![allow(clippy::result_large_err)]
//! # Drover Core
//!
//! Distributed background job processing.
//!
//! ## Architecture
//!
//! - **Jobs**: queue jobs, execution history and recurring definitions
//! - **Queue Manager**: cross-instance locks, queue entries and status mirrors over a shared TTL cache
//! - **Worker Pool**: concurrent execution with retries, priority demotion and panic recovery
//! - **Scheduler**: cron and interval triggers reconciled against the store
//! - **Integrations**: jobs created from inbound and outbound integration messages
//! - **Telemetry**: structured logging, optional OTLP export and Prometheus metrics

pub mod app;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{DroverError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::app::AppContext;
    pub use crate::cache::{CacheBackend, InMemoryBackend, NoopBackend, RedisBackend};
    pub use crate::config::Config;
    pub use crate::db::{Database, PgJobStore};
    pub use crate::error::{DroverError, ErrorCode, Result};
    pub use crate::jobs::{
        HandlerRegistry, IntegrationJobCreator, IntegrationMessage, JobContext, JobError,
        JobHandler, JobId, JobMetadata, JobProducer, JobScheduler, JobStore, JobWorkerPool,
        Priority, QueueJob, QueueJobStatus, QueueManager, ScheduledJob, Trigger,
    };
}
