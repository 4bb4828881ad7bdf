//! Prometheus metrics for the job subsystem.
//!
//! Metric names are centralised in [`JobMetrics`] so that the worker pool,
//! scheduler and queue manager record under one consistent vocabulary.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether the Prometheus exporter is installed
    #[serde(default)]
    pub enabled: bool,

    /// Listen address of the exporter's scrape endpoint
    #[serde(default = "default_metrics_listen")]
    pub listen: String,

    /// Histogram buckets for job durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_listen() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]
}

/// Install the Prometheus recorder and its HTTP scrape listener.
///
/// Does nothing when metrics are disabled; the `metrics` macros are then no-ops.
pub fn init_metrics(config: &MetricsConfig) -> anyhow::Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config.listen.parse()?;
    let mut builder = PrometheusBuilder::new().with_http_listener(addr);

    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    builder = builder.set_buckets(&config.duration_buckets)?;
    builder.install()?;

    JobMetrics::describe();

    tracing::info!(listen = %addr, "Metrics exporter installed");
    Ok(())
}

/// Recorders for job subsystem metrics.
pub struct JobMetrics;

impl JobMetrics {
    pub const CLAIMED: &'static str = "drover_jobs_claimed_total";
    pub const COMPLETED: &'static str = "drover_jobs_completed_total";
    pub const RETRIED: &'static str = "drover_jobs_retried_total";
    pub const FAILED: &'static str = "drover_jobs_failed_total";
    pub const PANICKED: &'static str = "drover_jobs_panicked_total";
    pub const LOCK_CONTENDED: &'static str = "drover_lock_contended_total";
    pub const DURATION: &'static str = "drover_job_duration_seconds";
    pub const SCHEDULE_FIRED: &'static str = "drover_schedule_fired_total";
    pub const SCHEDULE_ENTRIES: &'static str = "drover_schedule_entries";
    pub const PRODUCED: &'static str = "drover_jobs_produced_total";

    /// Register metric descriptions with the installed recorder.
    pub fn describe() {
        describe_counter!(Self::CLAIMED, "Queue jobs claimed by workers");
        describe_counter!(Self::COMPLETED, "Queue jobs completed successfully");
        describe_counter!(Self::RETRIED, "Queue jobs re-queued for retry");
        describe_counter!(Self::FAILED, "Queue jobs that failed permanently");
        describe_counter!(Self::PANICKED, "Handler panics recovered by workers");
        describe_counter!(Self::LOCK_CONTENDED, "Claims abandoned because the lock was held elsewhere");
        describe_histogram!(Self::DURATION, "Handler execution time in seconds");
        describe_counter!(Self::SCHEDULE_FIRED, "Scheduled job firings that produced a queue job");
        describe_gauge!(Self::SCHEDULE_ENTRIES, "Active schedule entries on this instance");
        describe_counter!(Self::PRODUCED, "Queue jobs created by producers");
    }

    pub fn claimed(handler: &str) {
        counter!(Self::CLAIMED, "handler" => handler.to_string()).increment(1);
    }

    pub fn completed(handler: &str, duration: Duration) {
        counter!(Self::COMPLETED, "handler" => handler.to_string()).increment(1);
        histogram!(Self::DURATION, "handler" => handler.to_string()).record(duration.as_secs_f64());
    }

    pub fn retried(handler: &str) {
        counter!(Self::RETRIED, "handler" => handler.to_string()).increment(1);
    }

    pub fn failed(handler: &str, duration: Duration) {
        counter!(Self::FAILED, "handler" => handler.to_string()).increment(1);
        histogram!(Self::DURATION, "handler" => handler.to_string()).record(duration.as_secs_f64());
    }

    pub fn panicked(handler: &str) {
        counter!(Self::PANICKED, "handler" => handler.to_string()).increment(1);
    }

    pub fn lock_contended() {
        counter!(Self::LOCK_CONTENDED).increment(1);
    }

    pub fn schedule_fired(job_name: &str) {
        counter!(Self::SCHEDULE_FIRED, "job" => job_name.to_string()).increment(1);
    }

    pub fn schedule_entries(count: usize) {
        gauge!(Self::SCHEDULE_ENTRIES).set(count as f64);
    }

    pub fn produced(source: &str) {
        counter!(Self::PRODUCED, "source" => source.to_string()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_defaults() {
        let config = MetricsConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.listen, "0.0.0.0:9090");
        assert!(!config.duration_buckets.is_empty());
    }

    #[test]
    fn test_disabled_metrics_is_noop() {
        assert!(init_metrics(&MetricsConfig::default()).is_ok());
        // Without a recorder the macros must not panic.
        JobMetrics::claimed("echo");
        JobMetrics::completed("echo", Duration::from_millis(5));
    }
}
