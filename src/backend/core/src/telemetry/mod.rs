//! Telemetry: structured logging, optional OTLP trace export, and Prometheus metrics.
//!
//! ```rust,no_run
//! use drover_core::telemetry::{init_logging, init_metrics, LoggingConfig, MetricsConfig};
//!
//! init_logging(&LoggingConfig::default(), "drover-server").expect("logging");
//! init_metrics(&MetricsConfig::default()).expect("metrics");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, shutdown_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, JobMetrics, MetricsConfig};
