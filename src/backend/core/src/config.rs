//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

use crate::jobs::BackoffStrategy;
use crate::telemetry::{LoggingConfig, MetricsConfig};

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Shared cache configuration; absent means single-instance mode
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// Distributed queue manager configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Integration job creator configuration
    #[serde(default)]
    pub integration: IntegrationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Run embedded migrations at startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix prepended to every cache key
    #[serde(default)]
    pub key_prefix: String,

    /// Connection timeout
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: String::new(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Configuration for the distributed queue manager.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Identifier of this instance; generated when absent
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Time-to-live of distributed locks
    #[serde(default = "default_lock_ttl", with = "humantime_serde")]
    pub lock_ttl: Duration,

    /// Time-to-live of queue entries
    #[serde(default = "default_entry_ttl", with = "humantime_serde")]
    pub entry_ttl: Duration,

    /// Time-to-live of status mirrors
    #[serde(default = "default_entry_ttl", with = "humantime_serde")]
    pub status_ttl: Duration,

    /// Retries after the first failed lock attempt
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,

    /// Base delay of the linear lock retry back-off
    #[serde(default = "default_lock_backoff", with = "humantime_serde")]
    pub lock_retry_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            lock_ttl: default_lock_ttl(),
            entry_ttl: default_entry_ttl(),
            status_ttl: default_entry_ttl(),
            lock_retries: default_lock_retries(),
            lock_retry_backoff: default_lock_backoff(),
        }
    }
}

/// Configuration for the job worker pool.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent pollers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Delay between polls of each worker
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long `stop` waits for in-flight jobs
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Worker name used as prefix for worker ids
    #[serde(default = "default_worker_name")]
    pub name: String,

    /// Optional delay applied to retried jobs on top of the priority demotion
    #[serde(default)]
    pub retry_backoff: Option<BackoffStrategy>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval: default_poll_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            name: default_worker_name(),
            retry_backoff: None,
        }
    }
}

/// Configuration for the job scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Whether this instance runs the scheduler
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Period of the reconciliation loop
    #[serde(default = "default_reconcile_interval", with = "humantime_serde")]
    pub reconcile_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reconcile_interval: default_reconcile_interval(),
        }
    }
}

/// Configuration for jobs created from integration messages.
#[derive(Debug, Clone, Deserialize)]
pub struct IntegrationConfig {
    /// Handler invoked for inbound messages
    #[serde(default = "default_inbound_handler")]
    pub inbound_handler: String,

    /// Handler invoked for outbound messages
    #[serde(default = "default_outbound_handler")]
    pub outbound_handler: String,

    /// Priority of integration jobs
    #[serde(default = "default_integration_priority")]
    pub priority: i32,

    /// Retry ceiling of integration jobs
    #[serde(default = "default_integration_retries")]
    pub max_retries: u32,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            inbound_handler: default_inbound_handler(),
            outbound_handler: default_outbound_handler(),
            priority: default_integration_priority(),
            max_retries: default_integration_retries(),
        }
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_connect_timeout() -> Duration { Duration::from_secs(5) }
fn default_lock_ttl() -> Duration { Duration::from_secs(5 * 60) }
fn default_entry_ttl() -> Duration { Duration::from_secs(24 * 60 * 60) }
fn default_lock_retries() -> u32 { 3 }
fn default_lock_backoff() -> Duration { Duration::from_millis(100) }
fn default_concurrency() -> usize { 4 }
fn default_poll_interval() -> Duration { Duration::from_secs(1) }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(30) }
fn default_worker_name() -> String { "drover-worker".to_string() }
fn default_reconcile_interval() -> Duration { Duration::from_secs(60) }
fn default_inbound_handler() -> String { "integration.inbound".to_string() }
fn default_outbound_handler() -> String { "integration.outbound".to_string() }
fn default_integration_priority() -> i32 { 5 }
fn default_integration_retries() -> u32 { 3 }

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("DROVER").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("DROVER").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}
