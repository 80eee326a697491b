//! Migration orchestrator
//!
//! The orchestrator owns every job it starts and is the only writer of job
//! status. Each running job gets one driver task that:
//! - spawns one worker per partition (up to `concurrency_limit`)
//! - consumes worker events and monitor health reports
//! - serves operator commands from [`JobHandle`]
//! - escalates threshold breaches to an automatic rollback
//!
//! The monitor only emits reports; the driver is their sole consumer, so
//! there is no two-way dependency between them. Every transition is
//! persisted to the job record before it is published.

use crate::batch::{run_partition, BatchProcessor, BatchStatus, PartitionCursor, WorkerEvent, WorkerSignal};
use crate::budget::OperationBudget;
use crate::checkpoint::{CheckpointStore, LedgerView};
use crate::error::EngineError;
use crate::jobs::JobRepository;
use crate::monitor::{EmergencyPolicy, HealthDecision, HealthReport, MonitorHandle};
use crate::report::JobStatusReport;
use crate::rollback::{load_plans, CheckpointRef, RollbackManager, RollbackOutcome, RollbackPlan, RollbackStrategy};
use crate::shim::{CompatibilityShim, ShimState};
use crate::state_machine::validate_transition;
use crate::transform::Transform;
use crate::types::{JobId, JobSpec, JobStatus, MigrationJob};
use crate::validator::{EnvSource, ProcessEnv, Validator};
use docshift_store::DocumentStore;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::Instrument;

const CONTROL_BUFFER: usize = 16;
const HEALTH_BUFFER: usize = 16;
const EVENT_BUFFER: usize = 1024;

/// Notification published by a running job
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    StatusChanged {
        from: JobStatus,
        to: JobStatus,
        reason: Option<String>,
    },
    BatchCommitted {
        partition: usize,
        sequence: u64,
        documents_migrated: usize,
        documents_failed: usize,
    },
    Health(HealthReport),
    /// Operator attention required
    Alert { message: String },
    RollbackFinished(RollbackPlan),
    /// Grace period after completion elapsed
    ShimRetired,
}

/// Live counters of a running job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub documents_migrated: usize,
    pub documents_failed: usize,
    pub documents_skipped: usize,
    pub checkpoints: usize,
    pub batches_failed: usize,
    pub partitions_total: usize,
    pub partitions_finished: usize,
}

impl JobProgress {
    /// Documents that reached the transform
    #[inline]
    #[must_use]
    pub fn documents_processed(&self) -> usize {
        self.documents_migrated + self.documents_failed
    }
}

type Reply = oneshot::Sender<Result<JobStatus, EngineError>>;

#[derive(Debug)]
enum ControlCommand {
    Pause(Reply),
    Resume(Reply),
    Abort(Reply),
    Rollback {
        strategy: RollbackStrategy,
        checkpoint: Option<u64>,
        reply: Reply,
    },
}

/// Control surface of one running job
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    control: mpsc::Sender<ControlCommand>,
    status: watch::Receiver<JobStatus>,
    events: broadcast::Sender<JobEvent>,
    progress: Arc<RwLock<JobProgress>>,
    health: Arc<RwLock<Option<HealthReport>>>,
    shim: Arc<CompatibilityShim>,
}

impl JobHandle {
    #[inline]
    #[must_use]
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    /// Live counters
    #[must_use]
    pub fn progress(&self) -> JobProgress {
        self.progress.read().clone()
    }

    /// Latest health report
    #[must_use]
    pub fn health(&self) -> Option<HealthReport> {
        self.health.read().clone()
    }

    /// Event stream
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Compatibility shim for the live application
    #[must_use]
    pub fn shim(&self) -> Arc<CompatibilityShim> {
        self.shim.clone()
    }

    /// Pause at the next batch boundary
    ///
    /// # Errors
    /// - `EngineError::IllegalStateTransition` unless the job is `running`
    /// - `EngineError::JobFinished` if the job already reached a terminal status
    pub async fn pause(&self) -> Result<JobStatus, EngineError> {
        self.request(ControlCommand::Pause).await
    }

    /// Resume a manually paused job
    ///
    /// # Errors
    /// - `EngineError::IllegalStateTransition` unless the job is `pausedManual`
    /// - `EngineError::JobFinished` if the job already reached a terminal status
    pub async fn resume(&self) -> Result<JobStatus, EngineError> {
        self.request(ControlCommand::Resume).await
    }

    /// Stop the job and revert everything it wrote
    ///
    /// Returns once the rollback has finished.
    ///
    /// # Errors
    /// Returns `EngineError::JobFinished` if the job already reached a terminal status
    pub async fn abort(&self) -> Result<JobStatus, EngineError> {
        self.request(ControlCommand::Abort).await
    }

    /// Stop the job and roll back with `strategy`
    ///
    /// # Errors
    /// - `EngineError::Rollback` if the plan is invalid (nothing is stopped)
    /// - `EngineError::JobFinished` if the job already reached a terminal status
    pub async fn rollback(
        &self,
        strategy: RollbackStrategy,
        checkpoint: Option<u64>,
    ) -> Result<JobStatus, EngineError> {
        self.request(|reply| ControlCommand::Rollback {
            strategy,
            checkpoint,
            reply,
        })
        .await
    }

    /// Wait for a terminal status
    pub async fn wait(&self) -> JobStatus {
        self.wait_until(|_, _| false).await
    }

    /// Wait until `done` holds or the job reaches a terminal status
    pub async fn wait_until<F>(&self, done: F) -> JobStatus
    where
        F: Fn(JobStatus, &JobProgress) -> bool,
    {
        let mut status = self.status.clone();
        let mut events = self.events.subscribe();
        loop {
            let current = *status.borrow_and_update();
            if current.is_terminal() || done(current, &self.progress()) {
                return current;
            }
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        return *status.borrow();
                    }
                }
                event = events.recv() => {
                    if matches!(event, Err(broadcast::error::RecvError::Closed)) {
                        return *status.borrow();
                    }
                }
            }
        }
    }

    async fn request(
        &self,
        command: impl FnOnce(Reply) -> ControlCommand,
    ) -> Result<JobStatus, EngineError> {
        let (reply, response) = oneshot::channel();
        if self.control.send(command(reply)).await.is_err() {
            return Err(self.closed());
        }
        response.await.map_err(|_| self.closed())?
    }

    fn closed(&self) -> EngineError {
        let status = self.status();
        if status.is_terminal() {
            EngineError::JobFinished {
                id: self.id,
                status,
            }
        } else {
            EngineError::DriverStopped(format!("job {} driver is gone", self.id))
        }
    }
}

/// Starts, recovers and inspects migration jobs
#[derive(Debug, Clone)]
pub struct Orchestrator {
    store: Arc<dyn DocumentStore>,
    env: Arc<dyn EnvSource>,
    jobs: JobRepository,
}

impl Orchestrator {
    /// Create orchestrator over `store`, reading credentials from the process environment
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            jobs: JobRepository::new(store.clone()),
            store,
            env: Arc::new(ProcessEnv),
        }
    }

    /// With environment source for credential checks
    #[must_use]
    pub fn with_env(mut self, env: Arc<dyn EnvSource>) -> Self {
        self.env = env;
        self
    }

    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Validate and start a job
    ///
    /// # Workflow
    /// 1. Check configuration ranges
    /// 2. `pending -> validating`, run every readiness check
    /// 3. Plan partitions and take the pre-migration snapshot
    /// 4. `validating -> running`, spawn the driver
    ///
    /// # Errors
    /// - `EngineError::InvalidConfig` if the configuration is out of range (no job is created)
    /// - `EngineError::Validation` if readiness checks fail (job ends `rejected`)
    /// - `EngineError::Store` if preparation fails (job ends `rolledBack`)
    pub async fn start(
        &self,
        spec: JobSpec,
        transform: Arc<dyn Transform>,
    ) -> Result<JobHandle, EngineError> {
        spec.validate()?;
        spec.config.validate()?;
        let job = MigrationJob::new(spec);
        let span = tracing::info_span!("job", job_id = %job.id, collection = %job.collection);
        self.prepare(job, transform).instrument(span).await
    }

    async fn prepare(
        &self,
        mut job: MigrationJob,
        transform: Arc<dyn Transform>,
    ) -> Result<JobHandle, EngineError> {
        tracing::info!(
            source = %job.source_shape,
            target = %job.target_shape,
            transform = transform.name(),
            "starting migration job"
        );
        self.jobs.save(&job).await?;
        job.transition(JobStatus::Validating, None)?;
        self.jobs.save(&job).await?;

        let validator = Validator::new(self.store.clone(), self.env.clone());
        let result = match validator.validate(&job).await.into_result() {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(failed = e.failures.len(), "readiness validation failed");
                job.transition(JobStatus::Rejected, Some(e.to_string()))?;
                self.jobs.save(&job).await?;
                return Err(e.into());
            }
        };
        let budget = match result.budget {
            Some(budget) => budget,
            None => OperationBudget::for_config(&job.config, &self.store.limits())?,
        };

        let prepared = async {
            job.partitions = validator.plan_partitions(&job).await?;
            validator.snapshot(&job, &budget).await?;
            Ok::<_, EngineError>(())
        }
        .await;
        if let Err(e) = prepared {
            tracing::error!(error = %e, "job preparation failed before any document was migrated");
            let reason = format!("preparation failed: {e}");
            job.transition(JobStatus::RollingBack, Some(reason.clone()))?;
            let manager = RollbackManager::new(self.store.clone(), transform, &job)?;
            manager
                .record_no_op(&job, manager.default_strategy(), Some(reason))
                .await;
            job.transition(JobStatus::RolledBack, None)?;
            self.jobs.save(&job).await?;
            return Err(e);
        }
        job.backup_complete = true;

        job.transition(JobStatus::Running, None)?;
        self.jobs.save(&job).await?;
        let cursors = job.partitions.iter().cloned().map(PartitionCursor::new).collect();
        self.launch(job, transform, cursors).await
    }

    /// Re-attach to a job left unfinished by a stopped process
    ///
    /// Partition cursors resume after each partition's ledger tail; a job
    /// found in `rollingBack` finishes its rollback.
    ///
    /// # Errors
    /// - `EngineError::JobNotFound` if no record exists
    /// - `EngineError::JobFinished` if the job is terminal
    /// - `EngineError::IllegalOperation` if the job never started running
    pub async fn recover(
        &self,
        job_id: JobId,
        transform: Arc<dyn Transform>,
    ) -> Result<JobHandle, EngineError> {
        let job = self.jobs.load(job_id).await?;
        match job.status {
            status if status.is_terminal() => {
                return Err(EngineError::JobFinished { id: job_id, status })
            }
            status @ (JobStatus::Pending | JobStatus::Validating) => {
                return Err(EngineError::IllegalOperation {
                    operation: "recover",
                    status,
                })
            }
            _ => {}
        }

        let ledger = LedgerView::load(self.store.as_ref(), job_id).await?;
        let cursors = job
            .partitions
            .iter()
            .cloned()
            .map(|p| PartitionCursor::resume(p, &ledger))
            .collect();
        tracing::info!(
            %job_id,
            status = %job.status,
            checkpoints = ledger.len(),
            "recovering job"
        );
        self.launch(job, transform, cursors).await
    }

    async fn launch(
        &self,
        job: MigrationJob,
        transform: Arc<dyn Transform>,
        cursors: Vec<PartitionCursor>,
    ) -> Result<JobHandle, EngineError> {
        let checkpoints = Arc::new(CheckpointStore::open(self.store.clone(), job.id).await?);
        let ledger = checkpoints.ledger().await?;
        let rollback = RollbackManager::new(self.store.clone(), transform.clone(), &job)?;
        let shim = Arc::new(CompatibilityShim::new(
            &job,
            self.store.clone(),
            transform.clone(),
            ledger.clone(),
        ));
        let processor = BatchProcessor::new(&job, self.store.clone(), transform, checkpoints.clone());

        let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER);
        let (status_tx, status_rx) = watch::channel(job.status);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let initial = if job.status.is_paused() {
            WorkerSignal::Pause
        } else {
            WorkerSignal::Run
        };
        let (signal, _) = watch::channel(initial);
        let progress = Arc::new(RwLock::new(JobProgress {
            documents_migrated: ledger.documents_migrated(),
            documents_failed: ledger.documents_failed(),
            checkpoints: ledger.len(),
            partitions_total: job.partitions.len(),
            ..JobProgress::default()
        }));
        let health = Arc::new(RwLock::new(job.last_health.clone()));

        let handle = JobHandle {
            id: job.id,
            control: control_tx,
            status: status_rx,
            events: events.clone(),
            progress: progress.clone(),
            health: health.clone(),
            shim: shim.clone(),
        };
        let span = tracing::info_span!("job", job_id = %job.id, collection = %job.collection);
        let driver = Driver {
            policy: EmergencyPolicy::new(job.config.failure_threshold),
            min_sample: job.config.effective_min_sample(),
            job,
            store: self.store.clone(),
            jobs: self.jobs.clone(),
            checkpoints,
            rollback,
            shim,
            signal,
            status: status_tx,
            events,
            progress,
            health,
            workers: JoinSet::new(),
            worker_events: worker_rx,
        };
        tokio::spawn(driver.run(processor, cursors, worker_tx, control_rx).instrument(span));
        Ok(handle)
    }

    /// Persisted job with ledger totals and latest rollback
    ///
    /// # Errors
    /// - `EngineError::JobNotFound` if no record exists
    /// - `EngineError::Store` / `EngineError::CorruptRecord` on read failures
    pub async fn status(&self, job_id: JobId) -> Result<JobStatusReport, EngineError> {
        let job = self.jobs.load(job_id).await?;
        JobStatusReport::load(self.store.as_ref(), job).await
    }

    /// Most recently created job
    ///
    /// # Errors
    /// Returns `EngineError` if the job records cannot be read
    pub async fn latest_job(&self) -> Result<Option<MigrationJob>, EngineError> {
        self.jobs.latest().await
    }

    /// Every job, oldest first
    ///
    /// # Errors
    /// Returns `EngineError` if the job records cannot be read
    pub async fn list_jobs(&self) -> Result<Vec<MigrationJob>, EngineError> {
        self.jobs.list().await
    }

    /// Roll back a job no process is driving
    ///
    /// `strategy` defaults to `complete` for invertible transforms and
    /// `backupRestore` otherwise.
    ///
    /// # Errors
    /// - `EngineError::JobFinished` if the job is terminal
    /// - `EngineError::Rollback` if the plan is invalid (job unchanged)
    /// - `EngineError::IllegalStateTransition` if the job cannot roll back from its status
    pub async fn rollback_offline(
        &self,
        job_id: JobId,
        transform: Arc<dyn Transform>,
        strategy: Option<RollbackStrategy>,
        checkpoint: Option<u64>,
    ) -> Result<MigrationJob, EngineError> {
        self.offline_rollback(job_id, transform, strategy, checkpoint, "rollback requested by operator")
            .await
    }

    /// Abort a job no process is driving
    ///
    /// # Errors
    /// Same as [`Orchestrator::rollback_offline`]
    pub async fn abort_offline(
        &self,
        job_id: JobId,
        transform: Arc<dyn Transform>,
    ) -> Result<MigrationJob, EngineError> {
        self.offline_rollback(job_id, transform, None, None, "aborted by operator")
            .await
    }

    async fn offline_rollback(
        &self,
        job_id: JobId,
        transform: Arc<dyn Transform>,
        strategy: Option<RollbackStrategy>,
        checkpoint: Option<u64>,
        reason: &str,
    ) -> Result<MigrationJob, EngineError> {
        let mut job = self.jobs.load(job_id).await?;
        if job.status.is_terminal() {
            return Err(EngineError::JobFinished {
                id: job_id,
                status: job.status,
            });
        }
        let manager = RollbackManager::new(self.store.clone(), transform, &job)?;
        let strategy = strategy.unwrap_or_else(|| manager.default_strategy());
        let target = checkpoint.map(|seq| CheckpointRef::new(job_id, seq));

        if job.status == JobStatus::Pending {
            manager
                .record_no_op(&job, strategy, Some(reason.to_string()))
                .await;
            job.transition(JobStatus::RolledBack, Some(reason.to_string()))?;
            self.jobs.save(&job).await?;
            return Ok(job);
        }
        if job.status != JobStatus::RollingBack {
            validate_transition(job.status, JobStatus::RollingBack)?;
            let ledger = LedgerView::load(self.store.as_ref(), job_id).await?;
            if !ledger.is_empty() {
                manager.plan(&job, strategy, target, &ledger)?;
            }
            job.transition(JobStatus::RollingBack, Some(reason.to_string()))?;
            self.jobs.save(&job).await?;
        }

        match run_plan(&manager, self.store.as_ref(), &job, strategy, target, reason.to_string()).await {
            Ok(plan) => {
                tracing::info!(%job_id, strategy = %plan.strategy, "offline rollback finished");
                job.transition(JobStatus::RolledBack, Some(format!("{strategy} rollback finished")))?;
            }
            Err(e) => {
                alert_rollback_failed(job_id, &e);
                job.transition(JobStatus::RollbackFailed, Some(e.to_string()))?;
            }
        }
        self.jobs.save(&job).await?;
        Ok(job)
    }
}

/// Execute a rollback for a job already in `rollingBack`
///
/// An empty ledger means no batch ever committed, so a no-op plan is recorded.
async fn run_plan(
    manager: &RollbackManager,
    store: &dyn DocumentStore,
    job: &MigrationJob,
    strategy: RollbackStrategy,
    target: Option<CheckpointRef>,
    reason: String,
) -> Result<RollbackPlan, EngineError> {
    let ledger = LedgerView::load(store, job.id).await?;
    if ledger.is_empty() {
        return Ok(manager.record_no_op(job, strategy, Some(reason)).await);
    }
    let mut plan = manager.plan(job, strategy, target, &ledger)?.with_reason(reason);
    manager.execute(job, &mut plan, &ledger).await?;
    Ok(plan)
}

fn alert_rollback_failed(job_id: JobId, error: &EngineError) -> String {
    let message = format!("rollback of job {job_id} failed, operator intervention required: {error}");
    tracing::error!(%job_id, error = %error, alert = true, "ROLLBACK FAILED");
    message
}

struct Driver {
    job: MigrationJob,
    store: Arc<dyn DocumentStore>,
    jobs: JobRepository,
    checkpoints: Arc<CheckpointStore>,
    rollback: RollbackManager,
    shim: Arc<CompatibilityShim>,
    policy: EmergencyPolicy,
    min_sample: usize,
    signal: watch::Sender<WorkerSignal>,
    status: watch::Sender<JobStatus>,
    events: broadcast::Sender<JobEvent>,
    progress: Arc<RwLock<JobProgress>>,
    health: Arc<RwLock<Option<HealthReport>>>,
    workers: JoinSet<PartitionCursor>,
    worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl Driver {
    async fn run(
        mut self,
        processor: BatchProcessor,
        cursors: Vec<PartitionCursor>,
        worker_tx: mpsc::UnboundedSender<WorkerEvent>,
        mut control: mpsc::Receiver<ControlCommand>,
    ) {
        let (health_tx, mut health_rx) = mpsc::channel(HEALTH_BUFFER);
        let monitor = MonitorHandle::spawn(self.job.id, &self.job.config, health_tx);

        match self.job.status {
            JobStatus::RollingBack => self.resume_rollback().await,
            // every partition finished before the restart
            JobStatus::Completing => {}
            _ => {
                let processor = Arc::new(
                    processor
                        .with_samples(monitor.sample_sender())
                        .with_memory(monitor.memory()),
                );
                for cursor in cursors {
                    self.workers.spawn(run_partition(
                        processor.clone(),
                        cursor,
                        self.signal.subscribe(),
                        worker_tx.clone(),
                    ));
                }
                tracing::info!(workers = self.workers.len(), "partition workers started");
            }
        }
        drop(worker_tx);

        while !self.job.status.is_terminal() {
            tokio::select! {
                Some(command) = control.recv() => self.on_command(command).await,
                Some(report) = health_rx.recv() => self.on_health(report).await,
                Some(event) = self.worker_events.recv() => {
                    if let Some(reason) = self.on_worker_event(event) {
                        self.emergency_rollback(reason).await;
                    }
                }
                Some(joined) = self.workers.join_next() => {
                    if let Err(e) = joined {
                        self.emergency_rollback(format!("partition worker died: {e}")).await;
                    }
                }
                else => break,
            }

            let finishing = matches!(self.job.status, JobStatus::Running | JobStatus::Completing);
            if finishing && self.workers.is_empty() {
                let mut breach = None;
                while let Ok(event) = self.worker_events.try_recv() {
                    breach = breach.or(self.on_worker_event(event));
                }
                match breach {
                    Some(reason) => self.emergency_rollback(reason).await,
                    None => self.finish().await,
                }
            }
        }

        monitor.shutdown().await;
        tracing::info!(status = %self.job.status, "job driver stopped");
    }

    async fn on_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Pause(reply) => {
                let _ = reply.send(self.pause().await);
            }
            ControlCommand::Resume(reply) => {
                let _ = reply.send(self.resume().await);
            }
            ControlCommand::Abort(reply) => {
                let strategy = self.rollback.default_strategy();
                let result = self
                    .roll_back(strategy, None, "aborted by operator".to_string())
                    .await;
                let _ = reply.send(result);
            }
            ControlCommand::Rollback {
                strategy,
                checkpoint,
                reply,
            } => {
                let result = self
                    .roll_back(strategy, checkpoint, "rollback requested by operator".to_string())
                    .await;
                let _ = reply.send(result);
            }
        }
    }

    async fn pause(&mut self) -> Result<JobStatus, EngineError> {
        if self.job.status != JobStatus::Running {
            return Err(EngineError::IllegalStateTransition {
                from: self.job.status,
                to: JobStatus::PausedManual,
            });
        }
        self.transition(JobStatus::PausedManual, Some("paused by operator".to_string()))
            .await?;
        self.signal.send_replace(WorkerSignal::Pause);
        Ok(self.job.status)
    }

    async fn resume(&mut self) -> Result<JobStatus, EngineError> {
        if self.job.status != JobStatus::PausedManual {
            return Err(EngineError::IllegalStateTransition {
                from: self.job.status,
                to: JobStatus::Running,
            });
        }
        self.transition(JobStatus::Running, Some("resumed by operator".to_string()))
            .await?;
        self.signal.send_replace(WorkerSignal::Run);
        Ok(self.job.status)
    }

    async fn on_health(&mut self, report: HealthReport) {
        *self.health.write() = Some(report.clone());
        self.job.last_health = Some(report.clone());
        let _ = self.events.send(JobEvent::Health(report.clone()));

        match self.policy.observe(&report, self.job.status) {
            HealthDecision::Continue => self.persist().await,
            HealthDecision::Pause => {
                let reason = format!("health {}", report.status);
                if self.transition(JobStatus::PausedDegraded, Some(reason)).await.is_ok() {
                    self.signal.send_replace(WorkerSignal::Pause);
                }
            }
            HealthDecision::Resume => {
                let reason = "health recovered".to_string();
                if self.transition(JobStatus::Running, Some(reason)).await.is_ok() {
                    self.signal.send_replace(WorkerSignal::Run);
                }
            }
            HealthDecision::EmergencyStop(reason) => self.emergency_rollback(reason).await,
        }
    }

    /// Apply a worker event; returns a reason if the job must roll back
    fn on_worker_event(&mut self, event: WorkerEvent) -> Option<String> {
        match event {
            WorkerEvent::Batch(result) => {
                {
                    let mut progress = self.progress.write();
                    progress.documents_migrated += result.documents_migrated;
                    progress.documents_failed += result.documents_failed;
                    progress.documents_skipped += result.documents_skipped;
                    progress.checkpoints += usize::from(result.checkpoint.is_some());
                    progress.batches_failed += usize::from(result.status == BatchStatus::Failed);
                }
                if let Some(checkpoint) = result.checkpoint {
                    let _ = self.events.send(JobEvent::BatchCommitted {
                        partition: checkpoint.partition,
                        sequence: checkpoint.sequence_number,
                        documents_migrated: checkpoint.documents_migrated,
                        documents_failed: checkpoint.documents_failed,
                    });
                    self.shim.observe_checkpoint(checkpoint);
                }
                self.failure_ratio_breach()
            }
            WorkerEvent::Finished { partition } => {
                self.progress.write().partitions_finished += 1;
                tracing::debug!(partition, "partition complete");
                None
            }
            WorkerEvent::Failed { partition, error } => {
                Some(format!("partition {partition} cannot make progress: {error}"))
            }
        }
    }

    fn failure_ratio_breach(&self) -> Option<String> {
        let progress = self.progress.read();
        let processed = progress.documents_processed();
        if processed == 0 || processed < self.min_sample {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = progress.documents_failed as f64 / processed as f64;
        let threshold = self.job.config.failure_threshold;
        (ratio > threshold).then(|| {
            format!("failed-document ratio {ratio:.4} exceeds failure threshold {threshold:.4}")
        })
    }

    async fn finish(&mut self) {
        if self.job.status == JobStatus::Running {
            let reason = Some("all partitions finished".to_string());
            if let Err(e) = self.transition(JobStatus::Completing, reason).await {
                tracing::error!(error = %e, "cannot enter completing");
                return;
            }
        }
        if let Some(reason) = self.failure_ratio_breach() {
            self.emergency_rollback(reason).await;
            return;
        }
        if let Err(e) = self.transition(JobStatus::Completed, None).await {
            tracing::error!(error = %e, "cannot complete job");
            return;
        }
        let progress = self.progress();
        tracing::info!(
            documents_migrated = progress.documents_migrated,
            documents_failed = progress.documents_failed,
            checkpoints = progress.checkpoints,
            "migration completed"
        );
        self.schedule_shim_retirement();
    }

    fn schedule_shim_retirement(&self) {
        let shim = self.shim.clone();
        let events = self.events.clone();
        let grace = self.job.config.shim_grace_period();
        tracing::info!(grace_ms = grace.as_millis() as u64, "compatibility shim draining");
        tokio::spawn(
            async move {
                tokio::time::sleep(grace).await;
                if shim.state() == ShimState::Retired {
                    tracing::info!("compatibility shim retired");
                    let _ = events.send(JobEvent::ShimRetired);
                }
            }
            .in_current_span(),
        );
    }

    async fn emergency_rollback(&mut self, reason: String) {
        if validate_transition(self.job.status, JobStatus::RollingBack).is_err() {
            return;
        }
        tracing::warn!(%reason, "emergency stop");
        let strategy = self.rollback.default_strategy();
        if let Err(e) = self.roll_back(strategy, None, reason).await {
            tracing::error!(error = %e, "automatic rollback could not start");
        }
    }

    /// Stop workers, then move through `rollingBack` to a terminal status
    async fn roll_back(
        &mut self,
        strategy: RollbackStrategy,
        checkpoint: Option<u64>,
        reason: String,
    ) -> Result<JobStatus, EngineError> {
        validate_transition(self.job.status, JobStatus::RollingBack)?;
        let target = checkpoint.map(|seq| CheckpointRef::new(self.job.id, seq));
        let ledger = self.checkpoints.ledger().await?;
        if !ledger.is_empty() {
            self.rollback.plan(&self.job, strategy, target, &ledger)?;
        }

        self.stop_workers().await;
        self.transition(JobStatus::RollingBack, Some(reason.clone()))
            .await?;
        self.finish_rollback(strategy, target, reason).await;
        Ok(self.job.status)
    }

    async fn resume_rollback(&mut self) {
        let pending = match load_plans(self.store.as_ref(), self.job.id).await {
            Ok(plans) => plans
                .into_iter()
                .rev()
                .find(|p| p.outcome == RollbackOutcome::Pending),
            Err(e) => {
                tracing::warn!(error = %e, "cannot read rollback plans, using default strategy");
                None
            }
        };
        let (strategy, target) = match pending {
            Some(plan) => (plan.strategy, plan.target_checkpoint),
            None => (self.rollback.default_strategy(), None),
        };
        self.finish_rollback(strategy, target, "resumed after restart".to_string())
            .await;
    }

    async fn finish_rollback(
        &mut self,
        strategy: RollbackStrategy,
        target: Option<CheckpointRef>,
        reason: String,
    ) {
        let result = run_plan(
            &self.rollback,
            self.store.as_ref(),
            &self.job,
            strategy,
            target,
            reason,
        )
        .await;
        let transition = match result {
            Ok(plan) => {
                let reason = format!("{} rollback finished", plan.strategy);
                let _ = self.events.send(JobEvent::RollbackFinished(plan));
                self.transition(JobStatus::RolledBack, Some(reason)).await
            }
            Err(e) => {
                let message = alert_rollback_failed(self.job.id, &e);
                let _ = self.events.send(JobEvent::Alert { message });
                self.transition(JobStatus::RollbackFailed, Some(e.to_string()))
                    .await
            }
        };
        if let Err(e) = transition {
            tracing::error!(error = %e, "cannot record rollback result");
        }
    }

    async fn stop_workers(&mut self) {
        self.signal.send_replace(WorkerSignal::Stop);
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "partition worker died while stopping");
            }
        }
        while let Ok(event) = self.worker_events.try_recv() {
            let _ = self.on_worker_event(event);
        }
    }

    async fn transition(&mut self, to: JobStatus, reason: Option<String>) -> Result<(), EngineError> {
        let from = self.job.status;
        self.job.transition(to, reason.clone())?;
        tracing::info!(%from, %to, reason = reason.as_deref().unwrap_or(""), "job status changed");
        self.persist().await;
        self.shim.observe_status(to, self.job.completed_at);
        self.status.send_replace(to);
        let _ = self.events.send(JobEvent::StatusChanged { from, to, reason });
        Ok(())
    }

    async fn persist(&self) {
        if let Err(e) = self.jobs.save(&self.job).await {
            tracing::warn!(error = %e, "cannot persist job record");
        }
    }

    fn progress(&self) -> JobProgress {
        self.progress.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::RenameFields;
    use crate::types::{JobConfig, ServiceDependency};
    use crate::validator::StaticEnv;
    use docshift_store::{Document, MemoryStore, ShapeVersion};
    use serde_json::json;
    use std::time::Duration;

    fn seeded(docs: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.seed(
            "trades",
            (0..docs).map(|i| {
                Document::new(format!("doc-{i:04}"), ShapeVersion(1), json!({"owner": i}))
            }),
        );
        store
    }

    fn spec(batch_size: usize) -> JobSpec {
        JobSpec::new("trades", ShapeVersion(1), ShapeVersion(2)).with_config(
            JobConfig::default()
                .with_batch_size(batch_size)
                .with_concurrency_limit(2)
                .with_monitor_interval(Duration::from_millis(50))
                .with_shim_grace_period(Duration::from_millis(10)),
        )
    }

    fn rename() -> Arc<dyn Transform> {
        Arc::new(RenameFields::new([("owner", "owner_id")]))
    }

    #[tokio::test]
    async fn out_of_range_config_creates_no_job() {
        let orchestrator = Orchestrator::new(seeded(1));
        let bad = spec(0);
        let err = orchestrator.start(bad, rename()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
        assert_eq!(orchestrator.latest_job().await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_readiness_rejects_job() {
        let orchestrator = Orchestrator::new(seeded(4)).with_env(Arc::new(StaticEnv::new()));
        let spec = spec(2)
            .with_dependency(ServiceDependency::Credential {
                env: "DOCSHIFT_TOKEN".into(),
                scope: "admin".into(),
            })
            .with_dependency(ServiceDependency::Index {
                collection: "trades".into(),
                name: "by_owner_id".into(),
            });

        let err = orchestrator.start(spec, rename()).await.unwrap_err();
        let EngineError::Validation(validation) = err else {
            panic!("expected validation error, got {err}");
        };
        assert_eq!(validation.failures.len(), 2);

        let job = orchestrator.latest_job().await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Rejected);
        assert_eq!(orchestrator.status(job.id).await.unwrap().exit.code(), 1);
    }

    #[tokio::test]
    async fn job_runs_to_completion() {
        let store = seeded(10);
        let orchestrator = Orchestrator::new(store.clone());
        let handle = orchestrator.start(spec(2), rename()).await.unwrap();

        assert_eq!(handle.wait().await, JobStatus::Completed);
        let progress = handle.progress();
        assert_eq!(progress.documents_migrated, 10);
        assert_eq!(progress.checkpoints, 5);
        assert_eq!(progress.partitions_finished, progress.partitions_total);
        assert!(store.snapshot("trades").iter().all(|d| d.shape == ShapeVersion(2)));

        let report = orchestrator.status(handle.id()).await.unwrap();
        assert_eq!(report.job.status, JobStatus::Completed);
        assert_eq!(report.ledger.checkpoints, 5);
        assert_eq!(report.exit.code(), 0);
    }

    #[tokio::test]
    async fn pause_and_resume_only_from_legal_states() {
        let store = seeded(100);
        store.set_commit_latency(Some(Duration::from_millis(5)));
        let orchestrator = Orchestrator::new(store);
        let handle = orchestrator.start(spec(2), rename()).await.unwrap();

        assert!(matches!(
            handle.resume().await,
            Err(EngineError::IllegalStateTransition { .. })
        ));
        assert_eq!(handle.pause().await.unwrap(), JobStatus::PausedManual);
        assert!(matches!(
            handle.pause().await,
            Err(EngineError::IllegalStateTransition { .. })
        ));
        assert_eq!(handle.resume().await.unwrap(), JobStatus::Running);
        assert_eq!(handle.wait().await, JobStatus::Completed);

        assert!(matches!(
            handle.pause().await,
            Err(EngineError::JobFinished { .. })
        ));
    }

    #[tokio::test]
    async fn abort_reverts_everything() {
        let store = seeded(40);
        let before = store.snapshot("trades");
        store.set_commit_latency(Some(Duration::from_millis(5)));
        let orchestrator = Orchestrator::new(store.clone());
        let handle = orchestrator.start(spec(2), rename()).await.unwrap();

        handle
            .wait_until(|_, progress| progress.documents_migrated >= 10)
            .await;
        assert_eq!(handle.abort().await.unwrap(), JobStatus::RolledBack);

        let after = store.snapshot("trades");
        assert!(after.iter().all(|d| d.shape == ShapeVersion(1)));
        let bodies: Vec<_> = after.iter().map(|d| &d.body).collect();
        let original: Vec<_> = before.iter().map(|d| &d.body).collect();
        assert_eq!(bodies, original);
    }

    #[tokio::test]
    async fn offline_abort_of_pending_job_is_no_op() {
        let store = seeded(2);
        let orchestrator = Orchestrator::new(store.clone());
        let job = MigrationJob::new(spec(2));
        JobRepository::new(store.clone()).save(&job).await.unwrap();

        let aborted = orchestrator.abort_offline(job.id, rename()).await.unwrap();
        assert_eq!(aborted.status, JobStatus::RolledBack);
        let report = orchestrator.status(job.id).await.unwrap();
        assert_eq!(
            report.last_rollback.map(|p| p.outcome),
            Some(RollbackOutcome::NoOp)
        );
        assert!(matches!(
            orchestrator.abort_offline(job.id, rename()).await,
            Err(EngineError::JobFinished { .. })
        ));
    }

    #[tokio::test]
    async fn recover_rejects_terminal_jobs() {
        let store = seeded(4);
        let orchestrator = Orchestrator::new(store);
        let handle = orchestrator.start(spec(2), rename()).await.unwrap();
        handle.wait().await;
        assert!(matches!(
            orchestrator.recover(handle.id(), rename()).await,
            Err(EngineError::JobFinished { .. })
        ));
    }
}
