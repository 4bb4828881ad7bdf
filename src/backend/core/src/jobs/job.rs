//! Job data model.
//!
//! This module provides the records the job subsystem moves around:
//!
//! - **ScheduledJob**: a durable, recurring definition driven by a [`Trigger`]
//! - **QueueJob**: one concrete unit of work claimed and executed by a worker
//! - **JobHistory**: append-only record of a single execution attempt
//! - **DistributedLock / QueueEntry**: ephemeral records that live only in the cache

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{DroverError, ErrorCode, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for scheduled jobs and queue jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = DroverError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s).map(Self).map_err(|e| {
            DroverError::with_internal(ErrorCode::DeserializationError, "Invalid job id", e.to_string())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Advisory job priority; higher values are claimed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOWEST: Priority = Priority(0);
    pub const LOW: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(5);
    pub const HIGH: Priority = Priority(10);

    /// The priority a job is re-queued at after a failed attempt.
    pub fn demoted(self) -> Self {
        Self(self.0.saturating_sub(1).max(Self::LOWEST.0))
    }

    pub fn value(self) -> i32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a queue job.
///
/// `Pending -> Processing -> {Completed | Retrying -> Pending | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueJobStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed by a worker and executing
    Processing,
    /// Finished successfully
    Completed,
    /// Failed below the retry ceiling; about to be re-queued
    Retrying,
    /// Failed at the retry ceiling
    Failed,
}

impl QueueJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
        }
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: QueueJobStatus) -> bool {
        use QueueJobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Retrying)
                | (Processing, Failed)
                | (Retrying, Pending)
        )
    }
}

impl fmt::Display for QueueJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueJobStatus {
    type Err = DroverError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "retrying" => Ok(Self::Retrying),
            "failed" => Ok(Self::Failed),
            other => Err(DroverError::new(
                ErrorCode::DeserializationError,
                format!("Unknown queue job status: {}", other),
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Triggers
// ═══════════════════════════════════════════════════════════════════════════════

/// A parsed cron expression.
///
/// Accepts 5-field (minute precision) and 6/7-field (second precision)
/// expressions as well as descriptors such as `@hourly`.
#[derive(Clone)]
pub struct CronExpr {
    source: String,
    schedule: cron::Schedule,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let source = expr.trim();
        if source.is_empty() {
            return Err(DroverError::invalid_schedule("Cron expression is empty"));
        }

        let normalized = if source.starts_with('@') {
            source.to_string()
        } else {
            match source.split_whitespace().count() {
                5 => format!("0 {}", source),
                6 | 7 => source.to_string(),
                n => {
                    return Err(DroverError::invalid_schedule(format!(
                        "Cron expression '{}' has {} fields, expected 5 to 7",
                        source, n
                    )))
                }
            }
        };

        let schedule = cron::Schedule::from_str(&normalized)?;
        Ok(Self {
            source: source.to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Next match strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl fmt::Debug for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronExpr").field(&self.source).finish()
    }
}

impl PartialEq for CronExpr {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for CronExpr {}

/// What decides when a scheduled job fires next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Cron(CronExpr),
    Interval(Duration),
}

impl Trigger {
    /// Parse a cron expression, or `@every <duration>` for a fixed interval.
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        match trimmed.strip_prefix("@every") {
            Some(rest) => {
                let interval = humantime::parse_duration(rest.trim()).map_err(|e| {
                    DroverError::invalid_schedule(format!("Invalid interval '{}': {}", rest.trim(), e))
                })?;
                Self::interval(interval)
            }
            None => Ok(Self::Cron(CronExpr::parse(trimmed)?)),
        }
    }

    /// Build a fixed interval trigger.
    ///
    /// Intervals are persisted in whole seconds, so the interval must be a
    /// non-zero whole number of seconds.
    pub fn interval(interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(DroverError::invalid_schedule("Interval must be greater than zero"));
        }
        if interval.subsec_nanos() != 0 {
            return Err(DroverError::invalid_schedule(format!(
                "Interval must be a whole number of seconds, got {}",
                humantime::format_duration(interval)
            )));
        }
        Ok(Self::Interval(interval))
    }

    /// Build a trigger from the two persisted columns, exactly one of which must be set.
    pub fn from_parts(cron_expression: Option<&str>, interval_seconds: Option<i64>) -> Result<Self> {
        let cron_expression = cron_expression.filter(|c| !c.trim().is_empty());
        match (cron_expression, interval_seconds) {
            (Some(expr), None) => Self::parse(expr),
            (None, Some(secs)) if secs > 0 => Self::interval(Duration::from_secs(secs as u64)),
            (None, Some(secs)) => Err(DroverError::invalid_schedule(format!(
                "Interval must be positive, got {}s",
                secs
            ))),
            (Some(_), Some(_)) => Err(DroverError::invalid_schedule(
                "Cron expression and interval are mutually exclusive",
            )),
            (None, None) => Err(DroverError::invalid_schedule(
                "Either a cron expression or an interval is required",
            )),
        }
    }

    /// Split back into the persisted `(cron_expression, interval_seconds)` columns.
    pub fn to_parts(&self) -> (Option<String>, Option<i64>) {
        match self {
            Self::Cron(expr) => (Some(expr.as_str().to_string()), None),
            Self::Interval(interval) => (None, Some(interval.as_secs() as i64)),
        }
    }

    /// Next fire time after `after`: the next cron match, or `after + interval`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(expr) => expr.next_after(after),
            Self::Interval(interval) => {
                chrono::Duration::from_std(*interval).ok().map(|d| after + d)
            }
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron(expr) => f.write_str(expr.as_str()),
            Self::Interval(interval) => write!(f, "@every {}", humantime::format_duration(*interval)),
        }
    }
}

impl FromStr for Trigger {
    type Err = DroverError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduled Job
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a scheduled job must not fire (or stay scheduled) right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleGate {
    /// `enabled` or `active` is false
    Inactive,
    /// No handler name configured
    MissingHandler,
    /// `start_at` is in the future
    NotStarted,
    /// `end_at` has passed
    Ended,
    /// `execution_count` reached `max_executions`
    ExecutionLimitReached,
}

impl fmt::Display for ScheduleGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Inactive => "inactive",
            Self::MissingHandler => "missing handler",
            Self::NotStarted => "not started",
            Self::Ended => "ended",
            Self::ExecutionLimitReached => "execution limit reached",
        };
        f.write_str(s)
    }
}

/// A durable, recurring job definition.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub id: JobId,
    pub name: String,
    pub handler: String,
    pub trigger: Trigger,
    pub payload: serde_json::Value,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub max_executions: Option<u64>,
    pub execution_count: u64,
    /// Boolean predicate evaluated against the job store right before firing
    pub condition: Option<String>,
    pub priority: Priority,
    pub max_retries: u32,
    pub enabled: bool,
    pub active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn new(name: impl Into<String>, handler: impl Into<String>, trigger: Trigger) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            name: name.into(),
            handler: handler.into(),
            trigger,
            payload: serde_json::Value::Null,
            start_at: None,
            end_at: None,
            max_executions: None,
            execution_count: 0,
            condition: None,
            priority: Priority::default(),
            max_retries: 3,
            enabled: true,
            active: true,
            last_run_at: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_window(mut self, start_at: Option<DateTime<Utc>>, end_at: Option<DateTime<Utc>>) -> Self {
        self.start_at = start_at;
        self.end_at = end_at;
        self
    }

    pub fn with_max_executions(mut self, max: u64) -> Self {
        self.max_executions = Some(max);
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether the execution window has closed or the execution cap is reached.
    pub fn exhausted_at(&self, now: DateTime<Utc>) -> Option<ScheduleGate> {
        if self.end_at.is_some_and(|end| end <= now) {
            return Some(ScheduleGate::Ended);
        }
        if self
            .max_executions
            .is_some_and(|max| self.execution_count >= max)
        {
            return Some(ScheduleGate::ExecutionLimitReached);
        }
        None
    }

    /// Reasons this definition must not be scheduled at `now`, if any.
    pub fn gate_at(&self, now: DateTime<Utc>) -> Option<ScheduleGate> {
        if !self.enabled || !self.active {
            return Some(ScheduleGate::Inactive);
        }
        if self.handler.trim().is_empty() {
            return Some(ScheduleGate::MissingHandler);
        }
        if self.start_at.is_some_and(|start| start > now) {
            return Some(ScheduleGate::NotStarted);
        }
        self.exhausted_at(now)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Metadata
// ═══════════════════════════════════════════════════════════════════════════════

/// Provenance carried by a queue job.
///
/// Well-known keys are typed fields; anything else lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Producer of the job, e.g. `scheduler` or `integration:inbound`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Scheduled job this queue job was materialized from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_job_id: Option<JobId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_job_name: Option<String>,

    /// 1-based firing sequence number of the scheduled job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_sequence: Option<u64>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl JobMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attach an arbitrary additional value.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.extra.get(key)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Job
// ═══════════════════════════════════════════════════════════════════════════════

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: JobId,
    pub handler: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub max_retries: u32,
    pub retry_count: u32,
    pub status: QueueJobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Not claimable before this instant
    pub available_at: DateTime<Utc>,
    pub output: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub worker_id: Option<String>,
    pub metadata: JobMetadata,
}

impl QueueJob {
    pub fn new(handler: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            handler: handler.into(),
            payload,
            priority: Priority::default(),
            max_retries: 3,
            retry_count: 0,
            status: QueueJobStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            available_at: now,
            output: None,
            last_error: None,
            worker_id: None,
            metadata: JobMetadata::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_metadata(mut self, metadata: JobMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Whether another attempt is allowed after a failure.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// 1-based number of the attempt currently running.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job History
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionResult {
    Success,
    Failure,
}

impl ExecutionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Failure => "Failure",
        }
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionResult {
    type Err = DroverError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Success" => Ok(Self::Success),
            "Failure" => Ok(Self::Failure),
            other => Err(DroverError::new(
                ErrorCode::DeserializationError,
                format!("Unknown execution result: {}", other),
            )),
        }
    }
}

/// Append-only record of a single execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHistory {
    pub id: Uuid,
    pub queue_job_id: JobId,
    pub handler: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    /// 0 for the first attempt
    pub retry_attempt: u32,
    pub result: ExecutionResult,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub worker_id: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache-resident Records
// ═══════════════════════════════════════════════════════════════════════════════

/// Distributed mutual-exclusion record for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedLock {
    pub job_id: JobId,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DistributedLock {
    pub fn new(job_id: JobId, owner: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            owner: owner.into(),
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365)),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_owned_by(&self, instance_id: &str) -> bool {
        self.owner == instance_id
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Queue bookkeeping record written on enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub instance_id: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for job execution failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Whether this error is retryable
    pub retryable: bool,
    /// Optional error code
    pub code: Option<String>,
    /// Additional context
    pub context: Option<serde_json::Value>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
            context: None,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
            context: None,
        }
    }

    /// Error produced from a recovered handler panic.
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::retryable(format!("handler panicked: {}", message.into())).with_code("PANIC")
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Add context.
    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<DroverError> for JobError {
    fn from(error: DroverError) -> Self {
        Self {
            message: error.user_message().to_string(),
            retryable: error.is_retryable(),
            code: Some(error.code().to_string()),
            context: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for delaying retried jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed {
        delay_secs: u64,
    },
    /// Linear increase in delay (initial + increment * attempt)
    Linear {
        initial_delay_secs: u64,
        increment_secs: u64,
    },
    /// Exponential increase in delay (initial * multiplier^attempt)
    Exponential {
        initial_delay_secs: u64,
        max_delay_secs: u64,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_secs: 5,
            max_delay_secs: 3600,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = match self {
            Self::Fixed { delay_secs } => *delay_secs,
            Self::Linear {
                initial_delay_secs,
                increment_secs,
            } => initial_delay_secs.saturating_add(increment_secs.saturating_mul(attempt as u64)),
            Self::Exponential {
                initial_delay_secs,
                max_delay_secs,
                multiplier,
            } => {
                let delay = (*initial_delay_secs as f64) * multiplier.powi(attempt as i32);
                delay.min(*max_delay_secs as f64) as u64
            }
        };

        Duration::from_secs(secs)
    }

    /// Create a fixed backoff strategy.
    pub fn fixed(delay_secs: u64) -> Self {
        Self::Fixed { delay_secs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_priority_demotion_floors_at_lowest() {
        assert_eq!(Priority(5).demoted(), Priority(4));
        assert_eq!(Priority::LOWEST.demoted(), Priority::LOWEST);
    }

    #[test]
    fn test_status_transitions() {
        use QueueJobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Completed));
        assert!(Failed.is_terminal());
        assert_eq!("retrying".parse::<QueueJobStatus>().unwrap(), Retrying);
    }

    #[test]
    fn test_five_field_cron_is_minute_precision() {
        let trigger = Trigger::parse("*/5 * * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 30).unwrap();
        let next = trigger.next_after(start).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 12, 5, 0).unwrap());
    }

    #[test]
    fn test_six_field_cron_and_descriptor() {
        let every_second = Trigger::parse("* * * * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            every_second.next_after(start).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap()
        );

        let hourly = Trigger::parse("@hourly").unwrap();
        assert_eq!(
            hourly.next_after(start).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_every_parses_to_interval() {
        let trigger = Trigger::parse("@every 90s").unwrap();
        assert_eq!(trigger, Trigger::Interval(Duration::from_secs(90)));
        assert!(Trigger::parse("@every 0s").is_err());
        assert!(Trigger::parse("* *").is_err());
    }

    #[test]
    fn test_interval_survives_persisted_columns() {
        for expr in ["@every 1s", "@every 90s", "@every 2h 30m"] {
            let trigger = Trigger::parse(expr).unwrap();
            let (cron, secs) = trigger.to_parts();
            assert_eq!(Trigger::from_parts(cron.as_deref(), secs).unwrap(), trigger);
        }

        for expr in ["@every 500ms", "@every 1500ms"] {
            let err = Trigger::parse(expr).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidSchedule);
        }
        assert!(Trigger::interval(Duration::from_millis(2500)).is_err());
    }

    #[test]
    fn test_trigger_from_parts_is_exclusive() {
        assert!(Trigger::from_parts(Some("0 * * * *"), Some(10)).is_err());
        assert!(Trigger::from_parts(None, None).is_err());
        assert!(Trigger::from_parts(Some("  "), None).is_err());
        assert!(Trigger::from_parts(None, Some(-1)).is_err());

        let interval = Trigger::from_parts(None, Some(30)).unwrap();
        assert_eq!(interval.to_parts(), (None, Some(30)));

        let cron = Trigger::from_parts(Some("0 * * * *"), None).unwrap();
        assert_eq!(cron.to_parts(), (Some("0 * * * *".to_string()), None));
    }

    #[test]
    fn test_schedule_gates() {
        let now = Utc::now();
        let trigger = Trigger::interval(Duration::from_secs(1)).unwrap();

        let job = ScheduledJob::new("report", "echo", trigger.clone()).with_max_executions(2);
        assert_eq!(job.gate_at(now), None);

        let mut capped = job.clone();
        capped.execution_count = 2;
        assert_eq!(capped.gate_at(now), Some(ScheduleGate::ExecutionLimitReached));

        let future = job
            .clone()
            .with_window(Some(now + chrono::Duration::hours(1)), None);
        assert_eq!(future.gate_at(now), Some(ScheduleGate::NotStarted));

        let ended = job
            .clone()
            .with_window(None, Some(now - chrono::Duration::seconds(1)));
        assert_eq!(ended.gate_at(now), Some(ScheduleGate::Ended));

        let no_handler = ScheduledJob::new("broken", "", trigger);
        assert_eq!(no_handler.gate_at(now), Some(ScheduleGate::MissingHandler));
    }

    #[test]
    fn test_metadata_extra_keys_flatten() {
        let metadata = JobMetadata::new()
            .with_source("integration:inbound")
            .with_correlation_id("corr-1")
            .with("tenant", "acme");

        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["source"], "integration:inbound");
        assert_eq!(json["tenant"], "acme");

        let back: JobMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, metadata);
    }

    #[test]
    fn test_lock_expiry_and_ownership() {
        let lock = DistributedLock::new(JobId::new(), "instance-a", Duration::from_secs(60));
        assert!(lock.is_owned_by("instance-a"));
        assert!(!lock.is_owned_by("instance-b"));
        assert!(!lock.is_expired_at(Utc::now()));
        assert!(lock.is_expired_at(Utc::now() + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_backoff_strategies() {
        assert_eq!(BackoffStrategy::fixed(10).delay_for_attempt(3), Duration::from_secs(10));

        let linear = BackoffStrategy::Linear {
            initial_delay_secs: 2,
            increment_secs: 3,
        };
        assert_eq!(linear.delay_for_attempt(2), Duration::from_secs(8));

        let exp = BackoffStrategy::default();
        assert_eq!(exp.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(exp.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(exp.delay_for_attempt(20), Duration::from_secs(3600));
    }
}
