//! Core types for docshift
//!
//! Defines the fundamental records of a migration run:
//! - Job identity, status and configuration
//! - Job specification supplied at start
//! - External service dependencies
//! - Static key-space partitions

use crate::error::{ConfigError, EngineError};
use crate::monitor::{HealthReport, HealthThresholds};
use crate::state_machine;
use chrono::{DateTime, Utc};
use docshift_store::{KeyRange, ShapeVersion};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use ulid::Ulid;

/// Unique job identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Generate new job ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
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

impl FromStr for JobId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    Validating,
    Running,
    PausedManual,
    PausedDegraded,
    Completing,
    Completed,
    RollingBack,
    RolledBack,
    RollbackFailed,
    /// Readiness validation failed; nothing was written
    Rejected,
}

impl JobStatus {
    /// Every status, in declaration order
    pub const ALL: [JobStatus; 11] = [
        JobStatus::Pending,
        JobStatus::Validating,
        JobStatus::Running,
        JobStatus::PausedManual,
        JobStatus::PausedDegraded,
        JobStatus::Completing,
        JobStatus::Completed,
        JobStatus::RollingBack,
        JobStatus::RolledBack,
        JobStatus::RollbackFailed,
        JobStatus::Rejected,
    ];

    /// Check if no further transition is possible
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::RolledBack | Self::RollbackFailed | Self::Rejected
        )
    }

    /// Check if workers are held at a batch boundary
    #[inline]
    #[must_use]
    pub fn is_paused(self) -> bool {
        matches!(self, Self::PausedManual | Self::PausedDegraded)
    }

    /// Stable lowercase-camel name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Running => "running",
            Self::PausedManual => "pausedManual",
            Self::PausedDegraded => "pausedDegraded",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::RollingBack => "rollingBack",
            Self::RolledBack => "rolledBack",
            Self::RollbackFailed => "rollbackFailed",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Documents per batch transaction
    pub batch_size: usize,
    /// Parallel partition workers
    pub concurrency_limit: usize,
    /// Failed-document ratio that forces rollback
    pub failure_threshold: f64,
    /// Retries per batch before it is marked failed
    pub max_retries: u32,
    /// Retries per rollback chunk after its first attempt, before the job
    /// lands in `rollbackFailed`
    pub max_rollback_retries: u32,
    /// Optional operations-per-transaction ceiling below the store's own
    pub quota_ceiling: Option<usize>,
    /// Estimated encoded document size used for the payload budget
    pub estimated_document_bytes: usize,
    /// Secondary index writes caused by one document write
    pub index_updates_per_document: usize,
    /// Documents processed before the failure ratio is evaluated
    /// (defaults to one batch)
    pub min_sample_size: Option<usize>,
    /// First retry delay
    pub retry_base_delay_ms: u64,
    /// Retry delay cap
    pub retry_max_delay_ms: u64,
    /// Deadline for one batch including retries
    pub batch_deadline_ms: u64,
    /// Health report interval
    pub monitor_interval_ms: u64,
    /// Delay between completion and compatibility shim retirement
    pub shim_grace_period_ms: u64,
    /// Health classification thresholds
    pub thresholds: HealthThresholds,
}

impl JobConfig {
    /// Allowed batch sizes
    pub const BATCH_SIZE_RANGE: (usize, usize) = (1, 10_000);
    /// Allowed worker counts
    pub const CONCURRENCY_RANGE: (usize, usize) = (1, 64);
    /// Upper bound for retry counters
    pub const MAX_RETRIES: u32 = 20;

    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With batch size
    #[inline]
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// With concurrency limit
    #[inline]
    #[must_use]
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// With failure threshold
    #[inline]
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: f64) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// With batch retry budget
    #[inline]
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// With rollback retry budget
    #[inline]
    #[must_use]
    pub fn with_max_rollback_retries(mut self, retries: u32) -> Self {
        self.max_rollback_retries = retries;
        self
    }

    /// With retry delays
    #[inline]
    #[must_use]
    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay_ms = duration_ms(base);
        self.retry_max_delay_ms = duration_ms(max);
        self
    }

    /// With health report interval
    #[inline]
    #[must_use]
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval_ms = duration_ms(interval);
        self
    }

    /// With shim grace period
    #[inline]
    #[must_use]
    pub fn with_shim_grace_period(mut self, grace: Duration) -> Self {
        self.shim_grace_period_ms = duration_ms(grace);
        self
    }

    /// With health thresholds
    #[inline]
    #[must_use]
    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Health report interval
    #[inline]
    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// Shim grace period
    #[inline]
    #[must_use]
    pub fn shim_grace_period(&self) -> Duration {
        Duration::from_millis(self.shim_grace_period_ms)
    }

    /// Batch deadline
    #[inline]
    #[must_use]
    pub fn batch_deadline(&self) -> Duration {
        Duration::from_millis(self.batch_deadline_ms)
    }

    /// Documents to observe before the failure ratio counts
    #[inline]
    #[must_use]
    pub fn effective_min_sample(&self) -> usize {
        self.min_sample_size.unwrap_or(self.batch_size)
    }

    /// Check every value against its allowed range
    ///
    /// # Errors
    /// Returns the first `ConfigError::OutOfRange` found
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (min_batch, max_batch) = Self::BATCH_SIZE_RANGE;
        if !(min_batch..=max_batch).contains(&self.batch_size) {
            return Err(out_of_range("batch_size", self.batch_size, "1..=10000"));
        }
        let (min_conc, max_conc) = Self::CONCURRENCY_RANGE;
        if !(min_conc..=max_conc).contains(&self.concurrency_limit) {
            return Err(out_of_range(
                "concurrency_limit",
                self.concurrency_limit,
                "1..=64",
            ));
        }
        if !(self.failure_threshold > 0.0 && self.failure_threshold < 1.0) {
            return Err(out_of_range(
                "failure_threshold",
                self.failure_threshold,
                "0.0 < t < 1.0",
            ));
        }
        if self.max_retries > Self::MAX_RETRIES {
            return Err(out_of_range("max_retries", self.max_retries, "0..=20"));
        }
        if !(1..=Self::MAX_RETRIES).contains(&self.max_rollback_retries) {
            return Err(out_of_range(
                "max_rollback_retries",
                self.max_rollback_retries,
                "1..=20",
            ));
        }
        if self.quota_ceiling == Some(0) {
            return Err(out_of_range("quota_ceiling", 0, ">= 1"));
        }
        if self.estimated_document_bytes == 0 {
            return Err(out_of_range("estimated_document_bytes", 0, ">= 1"));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(out_of_range(
                "retry_base_delay_ms",
                self.retry_base_delay_ms,
                "<= retry_max_delay_ms",
            ));
        }
        if self.monitor_interval_ms == 0 {
            return Err(out_of_range("monitor_interval_ms", 0, ">= 1"));
        }
        if self.batch_deadline_ms == 0 {
            return Err(out_of_range("batch_deadline_ms", 0, ">= 1"));
        }
        Ok(())
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            concurrency_limit: 4,
            failure_threshold: 0.01,
            max_retries: 5,
            max_rollback_retries: 3,
            quota_ceiling: None,
            estimated_document_bytes: 2048,
            index_updates_per_document: 0,
            min_sample_size: None,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 5_000,
            batch_deadline_ms: 30_000,
            monitor_interval_ms: 5_000,
            shim_grace_period_ms: 60_000,
            thresholds: HealthThresholds::default(),
        }
    }
}

fn out_of_range(field: &'static str, value: impl fmt::Display, allowed: &'static str) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        value: value.to_string(),
        allowed,
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// External prerequisite validated before any write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceDependency {
    /// Environment variable carrying a credential
    Credential { env: String, scope: String },
    /// Composite index that must exist
    Index { collection: String, name: String },
    /// Dependent service with a minimum version
    Service { name: String, min_version: String },
}

impl ServiceDependency {
    /// Human-readable subject for reports
    #[must_use]
    pub fn subject(&self) -> String {
        match self {
            Self::Credential { env, scope } => format!("credential:{env} ({scope})"),
            Self::Index { collection, name } => format!("index:{collection}/{name}"),
            Self::Service { name, min_version } => format!("service:{name}>={min_version}"),
        }
    }
}

/// Disjoint slice of the key space processed by one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub index: usize,
    pub range: KeyRange,
    /// Documents in the range when the partition was computed
    pub estimated_documents: usize,
}

/// What to migrate and how
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub collection: String,
    pub source_shape: ShapeVersion,
    pub target_shape: ShapeVersion,
    pub config: JobConfig,
    pub dependencies: Vec<ServiceDependency>,
}

impl JobSpec {
    /// Create spec with default configuration
    #[must_use]
    pub fn new(
        collection: impl Into<String>,
        source_shape: ShapeVersion,
        target_shape: ShapeVersion,
    ) -> Self {
        Self {
            collection: collection.into(),
            source_shape,
            target_shape,
            config: JobConfig::default(),
            dependencies: Vec::new(),
        }
    }

    /// With configuration
    #[inline]
    #[must_use]
    pub fn with_config(mut self, config: JobConfig) -> Self {
        self.config = config;
        self
    }

    /// With an additional dependency
    #[inline]
    #[must_use]
    pub fn with_dependency(mut self, dependency: ServiceDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Check config ranges and job definition
    ///
    /// # Errors
    /// Returns `ConfigError` describing the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.config.validate()?;
        if self.collection.is_empty() {
            return Err(ConfigError::InvalidJob("collection must not be empty".into()));
        }
        if self.collection.starts_with(crate::checkpoint::ADMIN_PREFIX) {
            return Err(ConfigError::InvalidJob(format!(
                "collection '{}' is reserved for migration records",
                self.collection
            )));
        }
        if self.source_shape == self.target_shape {
            return Err(ConfigError::InvalidJob(format!(
                "source and target shape are both {}",
                self.source_shape
            )));
        }
        Ok(())
    }
}

/// One recorded status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: JobStatus,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// One migration run
///
/// Owned by the orchestrator and mutated only through [`MigrationJob::transition`].
/// Records are retained after completion for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationJob {
    pub id: JobId,
    pub collection: String,
    pub source_shape: ShapeVersion,
    pub target_shape: ShapeVersion,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub config: JobConfig,
    pub dependencies: Vec<ServiceDependency>,
    /// Computed once during validation
    pub partitions: Vec<Partition>,
    /// Whether the pre-migration snapshot was fully written
    pub backup_complete: bool,
    /// Latest health report seen by the orchestrator
    pub last_health: Option<HealthReport>,
    /// Reason for the latest transition
    pub status_reason: Option<String>,
    pub history: Vec<StatusChange>,
}

impl MigrationJob {
    /// Create a pending job from a spec
    #[must_use]
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: JobId::new(),
            collection: spec.collection,
            source_shape: spec.source_shape,
            target_shape: spec.target_shape,
            status: JobStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            config: spec.config,
            dependencies: spec.dependencies,
            partitions: Vec::new(),
            backup_complete: false,
            last_health: None,
            status_reason: None,
            history: Vec::new(),
        }
    }

    /// Move to `to`, recording the change
    ///
    /// # Errors
    /// Returns `EngineError::IllegalStateTransition` if the state machine
    /// forbids the move
    pub fn transition(&mut self, to: JobStatus, reason: Option<String>) -> Result<(), EngineError> {
        state_machine::validate_transition(self.status, to)?;
        self.history.push(StatusChange {
            from: self.status,
            to,
            at: Utc::now(),
            reason: reason.clone(),
        });
        self.status = to;
        self.status_reason = reason;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> JobSpec {
        JobSpec::new("trades", ShapeVersion(1), ShapeVersion(2))
    }

    #[test]
    fn default_config_is_valid() {
        assert!(JobConfig::default().validate().is_ok());
        assert_eq!(JobConfig::default().failure_threshold, 0.01);
    }

    #[test]
    fn config_rejects_out_of_range_values() {
        let cases = [
            JobConfig::new().with_batch_size(0),
            JobConfig::new().with_batch_size(10_001),
            JobConfig::new().with_concurrency_limit(0),
            JobConfig::new().with_concurrency_limit(65),
            JobConfig::new().with_failure_threshold(0.0),
            JobConfig::new().with_failure_threshold(1.5),
            JobConfig::new().with_max_retries(21),
            JobConfig::new().with_max_rollback_retries(0),
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(ConfigError::OutOfRange { .. })),
                "{config:?} should be rejected"
            );
        }
    }

    #[test]
    fn config_deserializes_partial_toml() {
        let config: JobConfig = toml::from_str("batch_size = 50\nconcurrency_limit = 2\n").unwrap();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.concurrency_limit, 2);
        assert_eq!(config.max_retries, JobConfig::default().max_retries);
    }

    #[test]
    fn spec_rejects_same_shapes_and_admin_collections() {
        let same = JobSpec::new("trades", ShapeVersion(1), ShapeVersion(1));
        assert!(matches!(same.validate(), Err(ConfigError::InvalidJob(_))));

        let admin = JobSpec::new("_docshift_jobs", ShapeVersion(1), ShapeVersion(2));
        assert!(matches!(admin.validate(), Err(ConfigError::InvalidJob(_))));

        assert!(spec().validate().is_ok());
    }

    #[test]
    fn job_transition_records_history() {
        let mut job = MigrationJob::new(spec());
        job.transition(JobStatus::Validating, None).unwrap();
        job.transition(JobStatus::Running, Some("ready".into())).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.history.len(), 2);
        assert!(job.completed_at.is_none());

        let err = job.transition(JobStatus::Pending, None).unwrap_err();
        assert!(matches!(err, EngineError::IllegalStateTransition { .. }));
        assert_eq!(job.status, JobStatus::Running);
    }

    #[test]
    fn terminal_transition_sets_completed_at() {
        let mut job = MigrationJob::new(spec());
        job.transition(JobStatus::RolledBack, Some("aborted".into())).unwrap();
        assert!(job.completed_at.is_some());
        assert!(job.status.is_terminal());
    }

    #[test]
    fn job_id_parses_from_display() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn status_serializes_camel_case() {
        let json = serde_json::to_string(&JobStatus::PausedDegraded).unwrap();
        assert_eq!(json, "\"pausedDegraded\"");
        for status in JobStatus::ALL {
            assert_eq!(
                serde_json::to_string(&status).unwrap(),
                format!("\"{}\"", status.as_str())
            );
        }
    }
}
