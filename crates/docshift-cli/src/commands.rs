//! Subcommand implementations
//!
//! State directory layout:
//! - `store/` - the JSON document store (application and admin collections)
//! - `control/` - the [`ControlMailbox`]
//! - `jobs/<job>.toml` - job file a job was started from, used to rebuild
//!   its transform for offline abort and rollback

use crate::mailbox::{ControlCommand, ControlMailbox, ControlReply, ControlRequest};
use anyhow::Context as _;
use docshift_core::{
    EngineError, ExitStatus, JobEvent, JobHandle, JobId, JobStatus, MigrationFile,
    MigrationJob, Orchestrator, ProcessEnv, Transform,
};
use docshift_store::FileStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Mailbox poll and lease heartbeat interval
const MAILBOX_POLL: Duration = Duration::from_millis(500);
/// How long `pause`/`resume` wait for the running process
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
/// How long `abort`/`rollback` wait; reverting can take a while
const ROLLBACK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
pub(crate) struct Context {
    state_dir: PathBuf,
}

impl Context {
    pub(crate) fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    fn mailbox(&self) -> ControlMailbox {
        ControlMailbox::new(self.state_dir.join("control"))
    }

    fn saved_config(&self, job: JobId) -> PathBuf {
        self.state_dir.join("jobs").join(format!("{job}.toml"))
    }

    async fn orchestrator(&self) -> anyhow::Result<Orchestrator> {
        let root = self.state_dir.join("store");
        let store = FileStore::open(&root)
            .await
            .with_context(|| format!("opening store at {}", root.display()))?;
        Ok(Orchestrator::new(Arc::new(store)))
    }

    async fn resolve_job(
        &self,
        orchestrator: &Orchestrator,
        job: Option<JobId>,
    ) -> anyhow::Result<MigrationJob> {
        match job {
            Some(id) => Ok(orchestrator.status(id).await?.job),
            None => orchestrator
                .latest_job()
                .await?
                .ok_or_else(|| anyhow::anyhow!("no jobs in {}", self.state_dir.display())),
        }
    }

    /// Transform from `override_path`, or from the job file saved at start
    fn transform_for(
        &self,
        job: JobId,
        override_path: Option<&Path>,
    ) -> anyhow::Result<Arc<dyn Transform>> {
        let saved = self.saved_config(job);
        let path = override_path.unwrap_or(&saved);
        let file = MigrationFile::load(path).with_context(|| {
            format!("job {job} needs its job file; pass --config <path>")
        })?;
        Ok(file.into_spec().1)
    }

    /// `docshift start`
    pub(crate) async fn start(
        &self,
        config: Option<PathBuf>,
        resume: Option<JobId>,
    ) -> anyhow::Result<ExitStatus> {
        let orchestrator = self.orchestrator().await?;
        let handle = match resume {
            Some(job_id) => {
                let transform = self.transform_for(job_id, config.as_deref())?;
                orchestrator.recover(job_id, transform).await?
            }
            None => {
                let path = config.ok_or_else(|| anyhow::anyhow!("--config is required"))?;
                let mut file = MigrationFile::load(&path)?;
                file.apply_env_overrides(&ProcessEnv)?;
                let (spec, transform) = file.into_spec();
                match orchestrator.start(spec, transform).await {
                    Ok(handle) => {
                        self.save_config(handle.id(), &path).await?;
                        handle
                    }
                    Err(EngineError::Validation(e)) => {
                        println!("readiness validation failed:");
                        for failure in &e.failures {
                            println!("  [{}] {}: {}", failure.stage, failure.subject, failure.detail);
                        }
                        return Ok(ExitStatus::ValidationFailed);
                    }
                    Err(EngineError::InvalidConfig(e)) => {
                        println!("invalid job configuration: {e}");
                        return Ok(ExitStatus::ValidationFailed);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        println!("job {} {}", handle.id(), handle.status());
        let status = self.drive(&handle).await?;
        tracing::info!(job_id = %handle.id(), %status, "job process exiting");

        let report = orchestrator.status(handle.id()).await?;
        println!("{report}");
        Ok(report.exit)
    }

    async fn save_config(&self, job: JobId, source: &Path) -> anyhow::Result<()> {
        let target = self.saved_config(job);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(source, &target)
            .await
            .with_context(|| format!("saving job file to {}", target.display()))?;
        Ok(())
    }

    /// Serve the mailbox until the job is terminal or the process is interrupted
    async fn drive(&self, handle: &JobHandle) -> anyhow::Result<JobStatus> {
        let job_id = handle.id();
        let mailbox = self.mailbox();
        mailbox.heartbeat(job_id).await?;

        let mut events = handle.subscribe();
        let mut poll = tokio::time::interval(MAILBOX_POLL);
        let finished = handle.wait();
        tokio::pin!(finished);

        let status = loop {
            tokio::select! {
                status = &mut finished => break status,
                _ = poll.tick() => {
                    if let Err(e) = mailbox.heartbeat(job_id).await {
                        tracing::warn!(error = %e, "cannot refresh control lease");
                    }
                    match mailbox.take(job_id).await {
                        Ok(Some(request)) => serve(handle, &mailbox, request).await,
                        Ok(None) => {}
                        Err(e) => tracing::warn!(error = %e, "cannot read control request"),
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => report_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "event stream lagged");
                    }
                    Err(RecvError::Closed) => break handle.status(),
                },
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("interrupted");
                    if handle.status() == JobStatus::Running {
                        match handle.pause().await {
                            Ok(status) => println!("job {job_id} {status}; continue with `docshift start --resume {job_id}`"),
                            Err(e) => tracing::warn!(error = %e, "cannot pause on interrupt"),
                        }
                    }
                    break handle.status();
                }
            }
        };

        mailbox.release(job_id).await?;
        Ok(status)
    }

    /// `docshift status`
    pub(crate) async fn status(&self, job: Option<JobId>, json: bool) -> anyhow::Result<ExitStatus> {
        let orchestrator = self.orchestrator().await?;
        let job = self.resolve_job(&orchestrator, job).await?;
        let report = orchestrator.status(job.id).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("{report}");
            if self.mailbox().is_live(job.id).await? {
                println!("driver      attached");
            }
        }
        Ok(report.exit)
    }

    /// `docshift status --all`
    pub(crate) async fn list(&self, json: bool) -> anyhow::Result<ExitStatus> {
        let orchestrator = self.orchestrator().await?;
        let jobs = orchestrator.list_jobs().await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        } else {
            for job in &jobs {
                println!(
                    "{}  {:<15} {} ({} -> {})  {}",
                    job.id,
                    job.status.as_str(),
                    job.collection,
                    job.source_shape,
                    job.target_shape,
                    job.started_at.to_rfc3339()
                );
            }
        }
        Ok(ExitStatus::Success)
    }

    /// `pause`, `resume`, `abort` and `rollback`
    ///
    /// Goes through the mailbox when a process is driving the job. Otherwise
    /// `abort` and `rollback` run in this process; `pause` and `resume` need
    /// a driver.
    pub(crate) async fn control(
        &self,
        job: Option<JobId>,
        command: ControlCommand,
        config: Option<PathBuf>,
    ) -> anyhow::Result<ExitStatus> {
        let orchestrator = self.orchestrator().await?;
        let job = self.resolve_job(&orchestrator, job).await?;
        let mailbox = self.mailbox();

        if mailbox.is_live(job.id).await? {
            let request = ControlRequest::new(command);
            mailbox.post(job.id, &request).await?;
            let timeout = match command {
                ControlCommand::Pause | ControlCommand::Resume => CONTROL_TIMEOUT,
                ControlCommand::Abort | ControlCommand::Rollback { .. } => ROLLBACK_TIMEOUT,
            };
            let reply = mailbox
                .await_reply(job.id, request.id, MAILBOX_POLL / 5, timeout)
                .await?;
            if let Some(error) = reply.error {
                anyhow::bail!(error);
            }
            // reopen: the driving process changed the store on disk
            let report = self.orchestrator().await?.status(job.id).await?;
            println!("{report}");
            return Ok(report.exit);
        }

        match command {
            ControlCommand::Pause | ControlCommand::Resume => anyhow::bail!(
                "job {} ({}) has no running process; re-attach with `docshift start --resume {}`",
                job.id,
                job.status,
                job.id
            ),
            ControlCommand::Abort => {
                let transform = self.transform_for(job.id, config.as_deref())?;
                orchestrator.abort_offline(job.id, transform).await?;
            }
            ControlCommand::Rollback { strategy, checkpoint } => {
                let transform = self.transform_for(job.id, config.as_deref())?;
                orchestrator
                    .rollback_offline(job.id, transform, Some(strategy), checkpoint)
                    .await?;
            }
        }
        let report = orchestrator.status(job.id).await?;
        println!("{report}");
        Ok(report.exit)
    }
}

async fn serve(handle: &JobHandle, mailbox: &ControlMailbox, request: ControlRequest) {
    tracing::info!(
        request = %request.id,
        command = ?request.command,
        issued_at = %request.issued_at,
        "control request"
    );
    let result = match request.command {
        ControlCommand::Pause => handle.pause().await,
        ControlCommand::Resume => handle.resume().await,
        ControlCommand::Abort => handle.abort().await,
        ControlCommand::Rollback { strategy, checkpoint } => {
            handle.rollback(strategy, checkpoint).await
        }
    };
    let reply = ControlReply::new(request.id, result.map_err(|e| e.to_string()));
    if let Err(e) = mailbox.reply(handle.id(), &reply).await {
        tracing::warn!(error = %e, "cannot write control reply");
    }
}

fn report_event(event: &JobEvent) {
    match event {
        JobEvent::StatusChanged { from, to, reason } => {
            println!(
                "status {from} -> {to}{}",
                reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default()
            );
        }
        JobEvent::Alert { message } => eprintln!("ALERT: {message}"),
        JobEvent::RollbackFinished(plan) => {
            println!("rollback {} finished: {:?}", plan.strategy, plan.outcome);
        }
        JobEvent::ShimRetired => println!("compatibility shim retired"),
        JobEvent::BatchCommitted { .. } | JobEvent::Health(_) => {}
    }
}
