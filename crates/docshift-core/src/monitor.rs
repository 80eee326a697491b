//! Health monitoring
//!
//! Workers push one [`BatchSample`] per batch attempt; the monitor task turns
//! the samples of each interval into a [`HealthReport`] and publishes it:
//! - to the orchestrator (one-way, the orchestrator is the only consumer
//!   that acts on it)
//! - to subscribers of the broadcast stream (dashboards)
//! - to the `metrics` facade
//!
//! Memory is the document bytes held by batch attempts in flight, tracked
//! by [`InFlightMemory`]; each report carries the peak of its interval.
//!
//! Aggregation is best-effort. Samples are sent with `try_send` and reports
//! are forwarded with `try_send`, so a slow or failed monitor never blocks
//! the batch path.

use crate::types::{JobConfig, JobId, JobStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Reports kept for trend detection
pub const HISTORY_LEN: usize = 32;
/// Consecutive critical reports that force a rollback
pub const CRITICAL_STREAK: u32 = 3;

const SAMPLE_BUFFER: usize = 1024;

/// Overall health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    /// Gauge value (0 healthy, 1 degraded, 2 critical)
    #[inline]
    #[must_use]
    pub fn level(self) -> f64 {
        match self {
            Self::Healthy => 0.0,
            Self::Degraded => 1.0,
            Self::Critical => 2.0,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Alert thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub p95_budget_ms: f64,
    pub p99_budget_ms: f64,
    pub memory_ceiling_mb: f64,
    /// Error rate above which the job is degraded
    pub degraded_error_rate: f64,
    /// Throughput floor, checked only while samples arrive
    pub min_throughput_per_sec: Option<f64>,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            p95_budget_ms: 250.0,
            p99_budget_ms: 1000.0,
            memory_ceiling_mb: 512.0,
            degraded_error_rate: 0.008,
            min_throughput_per_sec: None,
        }
    }
}

/// Point-in-time health snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub error_rate: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub throughput_per_sec: f64,
    /// Peak document bytes held by in-flight batches during the interval
    pub memory_used_mb: f64,
    /// Document bytes committed during the interval
    #[serde(default)]
    pub bytes_written_mb: f64,
    pub status: HealthStatus,
    pub documents_processed: usize,
    pub documents_failed: usize,
    pub generated_at: DateTime<Utc>,
}

impl HealthReport {
    /// Report for an interval without samples
    #[must_use]
    pub fn idle() -> Self {
        Self {
            error_rate: 0.0,
            p95_latency_ms: 0.0,
            p99_latency_ms: 0.0,
            throughput_per_sec: 0.0,
            memory_used_mb: 0.0,
            bytes_written_mb: 0.0,
            status: HealthStatus::Healthy,
            documents_processed: 0,
            documents_failed: 0,
            generated_at: Utc::now(),
        }
    }
}

/// Timing and error counts of one batch attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchSample {
    pub duration: Duration,
    pub processed: usize,
    pub failed: usize,
    pub bytes_written: usize,
}

const MIB: f64 = 1024.0 * 1024.0;

/// Document bytes held by batch attempts in flight
#[derive(Debug, Default)]
pub struct InFlightMemory {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightMemory {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hold `bytes` until the reservation is dropped
    #[must_use]
    pub fn reserve(self: &Arc<Self>, bytes: usize) -> MemoryReservation {
        let mut reservation = MemoryReservation {
            memory: Arc::clone(self),
            bytes: 0,
        };
        reservation.grow(bytes);
        reservation
    }

    /// Bytes held right now
    #[inline]
    #[must_use]
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Peak since the previous call; the next window starts at the current level
    pub fn take_peak(&self) -> usize {
        let now = self.current();
        self.peak.swap(now, Ordering::SeqCst).max(now)
    }
}

/// Bytes held by one batch attempt
#[derive(Debug)]
pub struct MemoryReservation {
    memory: Arc<InFlightMemory>,
    bytes: usize,
}

impl MemoryReservation {
    /// Hold `bytes` more
    pub fn grow(&mut self, bytes: usize) {
        self.bytes += bytes;
        let now = self.memory.current.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.memory.peak.fetch_max(now, Ordering::SeqCst);
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.memory.current.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

/// Classify interval metrics against thresholds
#[must_use]
pub fn classify(
    report: &HealthReport,
    thresholds: &HealthThresholds,
    failure_threshold: f64,
    has_samples: bool,
) -> HealthStatus {
    if report.error_rate > failure_threshold
        || report.p99_latency_ms > thresholds.p99_budget_ms
        || report.memory_used_mb > thresholds.memory_ceiling_mb
    {
        return HealthStatus::Critical;
    }
    let slow = has_samples
        && thresholds
            .min_throughput_per_sec
            .is_some_and(|floor| report.throughput_per_sec < floor);
    if report.error_rate > thresholds.degraded_error_rate
        || report.p95_latency_ms > thresholds.p95_budget_ms
        || slow
    {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}

/// Nearest-rank percentile of sorted millisecond values
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * sorted.len() as f64 - 1e-9).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Turns samples into reports and keeps the rolling window
#[derive(Debug, Clone)]
pub struct HealthAggregator {
    thresholds: HealthThresholds,
    failure_threshold: f64,
    pending: Vec<BatchSample>,
    history: VecDeque<HealthReport>,
    memory: Arc<InFlightMemory>,
}

impl HealthAggregator {
    /// Create aggregator for a job configuration
    #[must_use]
    pub fn new(config: &JobConfig) -> Self {
        Self {
            thresholds: config.thresholds.clone(),
            failure_threshold: config.failure_threshold,
            pending: Vec::new(),
            history: VecDeque::with_capacity(HISTORY_LEN),
            memory: InFlightMemory::new(),
        }
    }

    /// Gauge workers reserve batch memory on
    #[must_use]
    pub fn memory(&self) -> Arc<InFlightMemory> {
        self.memory.clone()
    }

    /// Add a sample to the current interval
    pub fn record(&mut self, sample: BatchSample) {
        self.pending.push(sample);
    }

    /// Close the current interval of length `interval` and produce its report
    pub fn report(&mut self, interval: Duration) -> HealthReport {
        let samples = std::mem::take(&mut self.pending);
        let mut report = HealthReport::idle();

        if !samples.is_empty() {
            let processed: usize = samples.iter().map(|s| s.processed).sum();
            let failed: usize = samples.iter().map(|s| s.failed).sum();
            let written: usize = samples.iter().map(|s| s.bytes_written).sum();
            let mut latencies: Vec<f64> = samples
                .iter()
                .map(|s| s.duration.as_secs_f64() * 1000.0)
                .collect();
            latencies.sort_by(f64::total_cmp);

            report.documents_processed = processed;
            report.documents_failed = failed;
            report.error_rate = if processed == 0 {
                0.0
            } else {
                failed as f64 / processed as f64
            };
            report.p95_latency_ms = percentile(&latencies, 0.95);
            report.p99_latency_ms = percentile(&latencies, 0.99);
            report.throughput_per_sec = processed as f64 / interval.as_secs_f64().max(f64::EPSILON);
            report.bytes_written_mb = written as f64 / MIB;
        }
        report.memory_used_mb = self.memory.take_peak() as f64 / MIB;
        report.status = classify(
            &report,
            &self.thresholds,
            self.failure_threshold,
            !samples.is_empty(),
        );

        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(report.clone());
        report
    }

    /// Most recent report
    #[must_use]
    pub fn latest(&self) -> Option<&HealthReport> {
        self.history.back()
    }

    /// Rolling window, oldest first
    #[must_use]
    pub fn history(&self) -> &VecDeque<HealthReport> {
        &self.history
    }
}

/// What the orchestrator should do about a report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthDecision {
    Continue,
    /// Move `running -> pausedDegraded`
    Pause,
    /// Move `pausedDegraded -> running`
    Resume,
    /// Force `rollingBack` without operator input
    EmergencyStop(String),
}

/// Emergency-stop rule
///
/// Three consecutive critical reports, or one report whose error rate
/// exceeds the failure threshold, stop the job.
#[derive(Debug, Clone)]
pub struct EmergencyPolicy {
    failure_threshold: f64,
    critical_streak: u32,
}

impl EmergencyPolicy {
    /// Create policy
    #[inline]
    #[must_use]
    pub fn new(failure_threshold: f64) -> Self {
        Self {
            failure_threshold,
            critical_streak: 0,
        }
    }

    /// Current run of consecutive critical reports
    #[inline]
    #[must_use]
    pub fn critical_streak(&self) -> u32 {
        self.critical_streak
    }

    /// Decide how to react to `report` while the job is in `status`
    pub fn observe(&mut self, report: &HealthReport, status: JobStatus) -> HealthDecision {
        if report.status == HealthStatus::Critical {
            self.critical_streak += 1;
        } else {
            self.critical_streak = 0;
        }

        if report.error_rate > self.failure_threshold {
            return HealthDecision::EmergencyStop(format!(
                "error rate {:.4} exceeds failure threshold {:.4}",
                report.error_rate, self.failure_threshold
            ));
        }
        if self.critical_streak >= CRITICAL_STREAK {
            return HealthDecision::EmergencyStop(format!(
                "{} consecutive critical health reports",
                self.critical_streak
            ));
        }
        match (report.status, status) {
            (HealthStatus::Degraded, JobStatus::Running) => HealthDecision::Pause,
            (HealthStatus::Healthy, JobStatus::PausedDegraded) => HealthDecision::Resume,
            _ => HealthDecision::Continue,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    latest: Option<HealthReport>,
    history: VecDeque<HealthReport>,
}

/// Running monitor task
#[derive(Debug)]
pub struct MonitorHandle {
    samples: mpsc::Sender<BatchSample>,
    memory: Arc<InFlightMemory>,
    shared: Arc<RwLock<Shared>>,
    events: broadcast::Sender<HealthReport>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Spawn the monitor for a job
    ///
    /// # Arguments
    /// * `job_id` - Job label for logs and metrics
    /// * `config` - Interval and thresholds
    /// * `sink` - Orchestrator inbox; reports are dropped when it is full
    pub fn spawn(job_id: JobId, config: &JobConfig, sink: mpsc::Sender<HealthReport>) -> Self {
        let (samples, samples_rx) = mpsc::channel(SAMPLE_BUFFER);
        let (events, _) = broadcast::channel(HISTORY_LEN);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(RwLock::new(Shared::default()));
        let aggregator = HealthAggregator::new(config);
        let memory = aggregator.memory();

        let task = tokio::spawn(run_monitor(
            job_id,
            aggregator,
            config.monitor_interval(),
            samples_rx,
            sink,
            shared.clone(),
            events.clone(),
            shutdown_rx,
        ));

        Self {
            samples,
            memory,
            shared,
            events,
            shutdown,
            task,
        }
    }

    /// Sender workers use to push samples
    #[must_use]
    pub fn sample_sender(&self) -> mpsc::Sender<BatchSample> {
        self.samples.clone()
    }

    /// In-flight memory gauge workers reserve on
    #[must_use]
    pub fn memory(&self) -> Arc<InFlightMemory> {
        self.memory.clone()
    }

    /// Latest report (pull)
    #[must_use]
    pub fn get_status(&self) -> Option<HealthReport> {
        self.shared.read().latest.clone()
    }

    /// Rolling window of recent reports, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<HealthReport> {
        self.shared.read().history.iter().cloned().collect()
    }

    /// Report stream (push)
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HealthReport> {
        self.events.subscribe()
    }

    /// Stop the task and wait for it
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "monitor task ended abnormally");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_monitor(
    job_id: JobId,
    mut aggregator: HealthAggregator,
    interval: Duration,
    mut samples: mpsc::Receiver<BatchSample>,
    sink: mpsc::Sender<HealthReport>,
    shared: Arc<RwLock<Shared>>,
    events: broadcast::Sender<HealthReport>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    let job = job_id.to_string();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = aggregator.report(interval);
                publish(&job, &report);
                {
                    let mut shared = shared.write();
                    shared.latest = Some(report.clone());
                    shared.history = aggregator.history().clone();
                }
                let _ = events.send(report.clone());
                if let Err(e) = sink.try_send(report) {
                    tracing::debug!(job_id = %job, error = %e, "health report not delivered");
                }
            }
            sample = samples.recv() => match sample {
                Some(sample) => {
                    metrics::histogram!("docshift_batch_latency_ms", "job_id" => job.clone())
                        .record(sample.duration.as_secs_f64() * 1000.0);
                    aggregator.record(sample);
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!(job_id = %job, "monitor stopped");
}

fn publish(job: &str, report: &HealthReport) {
    let migrated = report.documents_processed.saturating_sub(report.documents_failed);
    metrics::counter!("docshift_documents_migrated_total", "job_id" => job.to_string())
        .increment(migrated as u64);
    metrics::counter!("docshift_documents_failed_total", "job_id" => job.to_string())
        .increment(report.documents_failed as u64);
    metrics::gauge!("docshift_health_status", "job_id" => job.to_string()).set(report.status.level());

    match report.status {
        HealthStatus::Healthy => tracing::debug!(
            job_id = job,
            throughput = report.throughput_per_sec,
            p95_ms = report.p95_latency_ms,
            "health report"
        ),
        status => tracing::warn!(
            job_id = job,
            %status,
            error_rate = report.error_rate,
            p95_ms = report.p95_latency_ms,
            p99_ms = report.p99_latency_ms,
            memory_mb = report.memory_used_mb,
            "job health degraded"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ms: u64, processed: usize, failed: usize) -> BatchSample {
        BatchSample {
            duration: Duration::from_millis(ms),
            processed,
            failed,
            bytes_written: 1024,
        }
    }

    fn report_with(status: HealthStatus, error_rate: f64) -> HealthReport {
        HealthReport {
            status,
            error_rate,
            ..HealthReport::idle()
        }
    }

    #[test]
    fn idle_interval_is_healthy() {
        let mut agg = HealthAggregator::new(&JobConfig::default());
        let report = agg.report(Duration::from_secs(5));
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.throughput_per_sec, 0.0);
    }

    #[test]
    fn aggregates_interval_samples() {
        let mut agg = HealthAggregator::new(&JobConfig::default());
        for ms in 1..=100 {
            agg.record(sample(ms, 200, 1));
        }
        let report = agg.report(Duration::from_secs(10));
        assert_eq!(report.documents_processed, 20_000);
        assert!((report.error_rate - 0.005).abs() < 1e-9);
        assert_eq!(report.p95_latency_ms, 95.0);
        assert_eq!(report.p99_latency_ms, 99.0);
        assert_eq!(report.throughput_per_sec, 2000.0);
        assert_eq!(report.status, HealthStatus::Healthy);

        // next interval starts empty
        assert_eq!(agg.report(Duration::from_secs(10)).documents_processed, 0);
    }

    #[test]
    fn classification_thresholds() {
        let config = JobConfig::default();
        let mut agg = HealthAggregator::new(&config);
        agg.record(sample(300, 100, 0));
        assert_eq!(agg.report(Duration::from_secs(1)).status, HealthStatus::Degraded);

        agg.record(sample(1500, 100, 0));
        assert_eq!(agg.report(Duration::from_secs(1)).status, HealthStatus::Critical);

        agg.record(sample(10, 1000, 9));
        assert_eq!(agg.report(Duration::from_secs(1)).status, HealthStatus::Degraded);

        agg.record(sample(10, 100, 2));
        assert_eq!(agg.report(Duration::from_secs(1)).status, HealthStatus::Critical);
    }

    #[test]
    fn memory_is_peak_held_not_bytes_written() {
        let mut agg = HealthAggregator::new(&JobConfig::default());
        // 2 GiB committed in one interval, nothing held
        agg.record(BatchSample {
            bytes_written: 2 * 1024 * 1024 * 1024,
            ..sample(10, 100, 0)
        });
        let report = agg.report(Duration::from_secs(1));
        assert_eq!(report.memory_used_mb, 0.0);
        assert_eq!(report.bytes_written_mb, 2048.0);
        assert_eq!(report.status, HealthStatus::Healthy);

        let memory = agg.memory();
        let held = memory.reserve(600 * 1024 * 1024);
        let report = agg.report(Duration::from_secs(1));
        assert_eq!(report.memory_used_mb, 600.0);
        assert_eq!(report.status, HealthStatus::Critical);

        // still held when this interval began
        drop(held);
        assert_eq!(memory.current(), 0);
        assert_eq!(agg.report(Duration::from_secs(1)).memory_used_mb, 600.0);
        assert_eq!(agg.report(Duration::from_secs(1)).memory_used_mb, 0.0);
    }

    #[test]
    fn peak_covers_overlapping_reservations() {
        let memory = InFlightMemory::new();
        let first = memory.reserve(100);
        let mut second = memory.reserve(150);
        second.grow(50);
        drop(second);
        assert_eq!(memory.current(), 100);
        assert_eq!(memory.take_peak(), 300);
        assert_eq!(memory.take_peak(), 100);
        drop(first);
        assert_eq!(memory.take_peak(), 100);
        assert_eq!(memory.take_peak(), 0);
    }

    #[test]
    fn throughput_floor_only_applies_with_samples() {
        let mut config = JobConfig::default();
        config.thresholds.min_throughput_per_sec = Some(1000.0);
        let mut agg = HealthAggregator::new(&config);
        assert_eq!(agg.report(Duration::from_secs(1)).status, HealthStatus::Healthy);
        agg.record(sample(10, 10, 0));
        assert_eq!(agg.report(Duration::from_secs(1)).status, HealthStatus::Degraded);
    }

    #[test]
    fn history_is_bounded() {
        let mut agg = HealthAggregator::new(&JobConfig::default());
        for _ in 0..HISTORY_LEN + 5 {
            agg.report(Duration::from_secs(1));
        }
        assert_eq!(agg.history().len(), HISTORY_LEN);
    }

    #[test]
    fn three_critical_reports_stop_the_job() {
        let mut policy = EmergencyPolicy::new(0.01);
        let critical = report_with(HealthStatus::Critical, 0.0);
        assert_eq!(policy.observe(&critical, JobStatus::Running), HealthDecision::Continue);
        assert_eq!(policy.observe(&critical, JobStatus::Running), HealthDecision::Continue);
        assert!(matches!(
            policy.observe(&critical, JobStatus::Running),
            HealthDecision::EmergencyStop(_)
        ));
    }

    #[test]
    fn healthy_report_breaks_the_streak() {
        let mut policy = EmergencyPolicy::new(0.01);
        let critical = report_with(HealthStatus::Critical, 0.0);
        let healthy = report_with(HealthStatus::Healthy, 0.0);
        policy.observe(&critical, JobStatus::Running);
        policy.observe(&critical, JobStatus::Running);
        policy.observe(&healthy, JobStatus::Running);
        assert_eq!(policy.critical_streak(), 0);
        assert_eq!(policy.observe(&critical, JobStatus::Running), HealthDecision::Continue);
    }

    #[test]
    fn error_rate_over_threshold_stops_immediately() {
        let mut policy = EmergencyPolicy::new(0.01);
        let report = report_with(HealthStatus::Critical, 0.02);
        assert!(matches!(
            policy.observe(&report, JobStatus::Running),
            HealthDecision::EmergencyStop(_)
        ));
    }

    #[test]
    fn degraded_pauses_and_healthy_resumes() {
        let mut policy = EmergencyPolicy::new(0.01);
        let degraded = report_with(HealthStatus::Degraded, 0.009);
        let healthy = report_with(HealthStatus::Healthy, 0.0);
        assert_eq!(policy.observe(&degraded, JobStatus::Running), HealthDecision::Pause);
        assert_eq!(policy.observe(&healthy, JobStatus::PausedDegraded), HealthDecision::Resume);
        assert_eq!(policy.observe(&healthy, JobStatus::PausedManual), HealthDecision::Continue);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_task_publishes_reports() {
        let config = JobConfig::default().with_monitor_interval(Duration::from_millis(100));
        let (sink, mut inbox) = mpsc::channel(8);
        let monitor = MonitorHandle::spawn(JobId::new(), &config, sink);
        let mut stream = monitor.subscribe();

        monitor.sample_sender().send(sample(5, 200, 0)).await.unwrap();
        let report = inbox.recv().await.unwrap();
        assert_eq!(report.documents_processed, 200);
        assert_eq!(stream.recv().await.unwrap(), report);
        assert_eq!(monitor.get_status(), Some(report));
        assert_eq!(monitor.history().len(), 1);

        monitor.shutdown().await;
    }
}
