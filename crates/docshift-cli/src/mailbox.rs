//! File mailbox between CLI processes
//!
//! The process running a job (`docshift start`) owns a lease and polls for
//! requests; `pause`, `resume`, `abort` and `rollback` from another shell
//! drop a request file and wait for the reply. Per job, under `<dir>`:
//! - `<job>.lease.json` - owner pid and heartbeat
//! - `<job>.request.json` - at most one pending request
//! - `<job>.reply.json` - answer to the last request

use chrono::{DateTime, Utc};
use docshift_core::{JobId, JobStatus, RollbackStrategy};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use ulid::Ulid;

/// Lease older than this is considered abandoned
pub(crate) const LEASE_TTL: Duration = Duration::from_secs(5);

/// Operator command for a running job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub(crate) enum ControlCommand {
    Pause,
    Resume,
    Abort,
    Rollback {
        strategy: RollbackStrategy,
        checkpoint: Option<u64>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ControlRequest {
    pub(crate) id: Ulid,
    pub(crate) command: ControlCommand,
    pub(crate) issued_at: DateTime<Utc>,
}

impl ControlRequest {
    pub(crate) fn new(command: ControlCommand) -> Self {
        Self {
            id: Ulid::new(),
            command,
            issued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ControlReply {
    pub(crate) request: Ulid,
    pub(crate) status: Option<JobStatus>,
    pub(crate) error: Option<String>,
}

impl ControlReply {
    pub(crate) fn new(request: Ulid, result: Result<JobStatus, String>) -> Self {
        match result {
            Ok(status) => Self {
                request,
                status: Some(status),
                error: None,
            },
            Err(error) => Self {
                request,
                status: None,
                error: Some(error),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Lease {
    pid: u32,
    heartbeat_at: DateTime<Utc>,
}

/// Mailbox directory
#[derive(Debug, Clone)]
pub(crate) struct ControlMailbox {
    dir: PathBuf,
}

impl ControlMailbox {
    pub(crate) fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, job: JobId, kind: &str) -> PathBuf {
        self.dir.join(format!("{job}.{kind}.json"))
    }

    /// Claim or refresh the lease for `job`
    pub(crate) async fn heartbeat(&self, job: JobId) -> anyhow::Result<()> {
        let lease = Lease {
            pid: std::process::id(),
            heartbeat_at: Utc::now(),
        };
        write_json(&self.path(job, "lease"), &lease).await
    }

    /// Drop the lease for `job`
    pub(crate) async fn release(&self, job: JobId) -> anyhow::Result<()> {
        remove_if_exists(&self.path(job, "lease")).await
    }

    /// Whether a process refreshed the lease within [`LEASE_TTL`]
    pub(crate) async fn is_live(&self, job: JobId) -> anyhow::Result<bool> {
        let Some(lease) = read_json::<Lease>(&self.path(job, "lease")).await? else {
            return Ok(false);
        };
        let age = Utc::now().signed_duration_since(lease.heartbeat_at);
        Ok(age.to_std().map_or(true, |age| age < LEASE_TTL))
    }

    /// Leave a request for the lease owner
    pub(crate) async fn post(&self, job: JobId, request: &ControlRequest) -> anyhow::Result<()> {
        remove_if_exists(&self.path(job, "reply")).await?;
        write_json(&self.path(job, "request"), request).await
    }

    /// Take the pending request, if any
    pub(crate) async fn take(&self, job: JobId) -> anyhow::Result<Option<ControlRequest>> {
        let path = self.path(job, "request");
        let request = read_json(&path).await?;
        if request.is_some() {
            remove_if_exists(&path).await?;
        }
        Ok(request)
    }

    pub(crate) async fn reply(&self, job: JobId, reply: &ControlReply) -> anyhow::Result<()> {
        write_json(&self.path(job, "reply"), reply).await
    }

    /// Poll for the reply to `request` until `timeout`
    pub(crate) async fn await_reply(
        &self,
        job: JobId,
        request: Ulid,
        poll: Duration,
        timeout: Duration,
    ) -> anyhow::Result<ControlReply> {
        let path = self.path(job, "reply");
        let wait = async {
            loop {
                if let Some(reply) = read_json::<ControlReply>(&path).await? {
                    if reply.request == request {
                        remove_if_exists(&path).await?;
                        return Ok::<_, anyhow::Error>(reply);
                    }
                }
                tokio::time::sleep(poll).await;
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            anyhow::anyhow!("no reply from the process running job {job} within {timeout:?}")
        })?
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_if_exists(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn request_is_taken_once() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = ControlMailbox::new(dir.path());
        let job = JobId::new();

        assert_eq!(mailbox.take(job).await.unwrap(), None);
        let request = ControlRequest::new(ControlCommand::Rollback {
            strategy: RollbackStrategy::Partial,
            checkpoint: Some(7),
        });
        mailbox.post(job, &request).await.unwrap();

        assert_eq!(mailbox.take(job).await.unwrap(), Some(request));
        assert_eq!(mailbox.take(job).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reply_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = ControlMailbox::new(dir.path());
        let job = JobId::new();
        let request = ControlRequest::new(ControlCommand::Pause);
        mailbox.post(job, &request).await.unwrap();

        let owner = mailbox.clone();
        let answer = tokio::spawn(async move {
            let taken = loop {
                if let Some(r) = owner.take(job).await.unwrap() {
                    break r;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            };
            owner
                .reply(job, &ControlReply::new(taken.id, Ok(JobStatus::PausedManual)))
                .await
                .unwrap();
        });

        let reply = mailbox
            .await_reply(job, request.id, Duration::from_millis(5), Duration::from_secs(5))
            .await
            .unwrap();
        answer.await.unwrap();
        assert_eq!(reply.status, Some(JobStatus::PausedManual));
        assert_eq!(reply.error, None);
    }

    #[tokio::test]
    async fn lease_expires() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = ControlMailbox::new(dir.path());
        let job = JobId::new();

        assert!(!mailbox.is_live(job).await.unwrap());
        mailbox.heartbeat(job).await.unwrap();
        assert!(mailbox.is_live(job).await.unwrap());

        let stale = Lease {
            pid: 1,
            heartbeat_at: Utc::now() - chrono::Duration::seconds(60),
        };
        write_json(&mailbox.path(job, "lease"), &stale).await.unwrap();
        assert!(!mailbox.is_live(job).await.unwrap());

        mailbox.release(job).await.unwrap();
        assert!(!mailbox.is_live(job).await.unwrap());
    }
}
