//! Persisted job records
//!
//! `MigrationJob` records live in the `_docshift_jobs` admin collection,
//! keyed by job id, so job history survives process restarts. Records are
//! overwritten on every transition and never deleted.

use crate::checkpoint::{decode_record, encode_record, JOBS_COLLECTION};
use crate::error::EngineError;
use crate::types::{JobId, MigrationJob};
use docshift_store::{DocKey, DocumentStore, KeyRange, Transaction};
use std::sync::Arc;

/// Load and save job records
#[derive(Debug, Clone)]
pub struct JobRepository {
    store: Arc<dyn DocumentStore>,
}

impl JobRepository {
    /// Create repository over `store`
    #[inline]
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Write the current state of `job`
    ///
    /// # Errors
    /// Returns `EngineError::Store` if the commit fails
    pub async fn save(&self, job: &MigrationJob) -> Result<(), EngineError> {
        let doc = encode_record(job_key(job.id), job)?;
        self.store
            .commit(Transaction::new().put(JOBS_COLLECTION, doc))
            .await?;
        Ok(())
    }

    /// Load one job
    ///
    /// # Errors
    /// - `EngineError::JobNotFound` if no record exists
    /// - `EngineError::CorruptRecord` if the record cannot be decoded
    pub async fn load(&self, id: JobId) -> Result<MigrationJob, EngineError> {
        let doc = self
            .store
            .get(JOBS_COLLECTION, &job_key(id))
            .await?
            .ok_or(EngineError::JobNotFound(id))?;
        decode_record(&doc)
    }

    /// Every job, oldest first (job ids sort by creation time)
    ///
    /// # Errors
    /// Returns `EngineError` if the store fails or a record is corrupt
    pub async fn list(&self) -> Result<Vec<MigrationJob>, EngineError> {
        let docs = self
            .store
            .scan(JOBS_COLLECTION, &KeyRange::full(), None, usize::MAX)
            .await?;
        docs.iter().map(decode_record).collect()
    }

    /// Most recently created job
    ///
    /// # Errors
    /// Returns `EngineError` if the store fails or a record is corrupt
    pub async fn latest(&self) -> Result<Option<MigrationJob>, EngineError> {
        Ok(self.list().await?.pop())
    }
}

fn job_key(id: JobId) -> DocKey {
    DocKey::new(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobSpec, JobStatus};
    use docshift_store::{MemoryStore, ShapeVersion};

    #[tokio::test]
    async fn save_load_and_list() {
        let repo = JobRepository::new(Arc::new(MemoryStore::new()));
        let mut first = MigrationJob::new(JobSpec::new("a", ShapeVersion(1), ShapeVersion(2)));
        repo.save(&first).await.unwrap();
        // ulids only order across milliseconds
        tokio::time::sleep(std::time::Duration::from_millis(3)).await;
        let second = MigrationJob::new(JobSpec::new("b", ShapeVersion(1), ShapeVersion(2)));
        repo.save(&second).await.unwrap();

        first.transition(JobStatus::Validating, None).unwrap();
        repo.save(&first).await.unwrap();

        let loaded = repo.load(first.id).await.unwrap();
        assert_eq!(loaded.status, JobStatus::Validating);
        assert_eq!(repo.list().await.unwrap().len(), 2);
        assert_eq!(repo.latest().await.unwrap().map(|j| j.id), Some(second.id));
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let repo = JobRepository::new(Arc::new(MemoryStore::new()));
        let id = JobId::new();
        assert!(matches!(repo.load(id).await, Err(EngineError::JobNotFound(j)) if j == id));
    }
}
