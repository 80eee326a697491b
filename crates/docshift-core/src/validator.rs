//! Dependency and readiness validation
//!
//! Runs before any write, in order:
//! 1. Environment: credential variables are present
//! 2. Connectivity: the document store answers a ping
//! 3. Dependency: declared indexes exist and services meet minimum versions
//! 4. Capacity: a full batch fits the store's operation and payload ceilings
//!
//! Every check runs even after a failure, so operators get the complete
//! readiness picture. The validator also computes the static partitions and
//! takes the pre-migration snapshot used by `backupRestore`.

use crate::budget::OperationBudget;
use crate::error::{EngineError, ValidationError};
use crate::partition::plan_partitions;
use crate::retry::{retry, RetryPolicy};
use crate::rollback::{backup_key, BackupRecord};
use crate::checkpoint::{encode_record, BACKUPS_COLLECTION};
use crate::types::{MigrationJob, Partition, ServiceDependency};
use docshift_store::{DocKey, Document, DocumentStore, KeyRange, ServiceInfo, StoreError, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Source of environment variables
pub trait EnvSource: Send + Sync + fmt::Debug {
    /// Value of `name`, if set
    fn var(&self, name: &str) -> Option<String>;
}

/// Process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Fixed set of variables
#[derive(Debug, Clone, Default)]
pub struct StaticEnv(BTreeMap<String, String>);

impl StaticEnv {
    /// Create empty environment
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With variable
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }
}

impl EnvSource for StaticEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned()
    }
}

/// Validation stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStage {
    Environment,
    Connectivity,
    Dependency,
    Capacity,
}

impl fmt::Display for CheckStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Environment => "environment",
            Self::Connectivity => "connectivity",
            Self::Dependency => "dependency",
            Self::Capacity => "capacity",
        };
        f.write_str(name)
    }
}

/// Outcome of one readiness check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub stage: CheckStage,
    pub subject: String,
    pub passed: bool,
    pub detail: String,
}

impl CheckOutcome {
    /// Passed check
    #[must_use]
    pub fn passed(stage: CheckStage, subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            stage,
            subject: subject.into(),
            passed: true,
            detail: detail.into(),
        }
    }

    /// Failed check
    #[must_use]
    pub fn failed(stage: CheckStage, subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            stage,
            subject: subject.into(),
            passed: false,
            detail: detail.into(),
        }
    }
}

/// Every check run for a job, in stage order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub checks: Vec<CheckOutcome>,
    /// Probe answer, if the store was reachable
    pub service: Option<ServiceInfo>,
    /// Budget, if capacity passed
    pub budget: Option<OperationBudget>,
}

impl HealthCheckResult {
    /// Whether every check passed
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// Failed checks only
    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.checks.iter().filter(|c| !c.passed)
    }

    /// Convert to `Result`
    ///
    /// # Errors
    /// Returns `ValidationError` listing every failure
    pub fn into_result(self) -> Result<Self, ValidationError> {
        if self.is_ready() {
            Ok(self)
        } else {
            Err(ValidationError {
                failures: self.failures().cloned().collect(),
            })
        }
    }
}

/// Readiness validator
#[derive(Debug, Clone)]
pub struct Validator {
    store: Arc<dyn DocumentStore>,
    env: Arc<dyn EnvSource>,
}

impl Validator {
    /// Create validator
    #[inline]
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, env: Arc<dyn EnvSource>) -> Self {
        Self { store, env }
    }

    /// Run every readiness check for `job`
    pub async fn validate(&self, job: &MigrationJob) -> HealthCheckResult {
        let mut result = HealthCheckResult::default();

        // 1. environment
        let credentials: Vec<_> = job
            .dependencies
            .iter()
            .filter_map(|d| match d {
                ServiceDependency::Credential { env, scope } => Some((d, env, scope)),
                _ => None,
            })
            .collect();
        if credentials.is_empty() {
            result.checks.push(CheckOutcome::passed(
                CheckStage::Environment,
                "credentials",
                "none required",
            ));
        }
        for (dep, env, scope) in credentials {
            let outcome = match self.env.var(env) {
                Some(value) if !value.trim().is_empty() => {
                    CheckOutcome::passed(CheckStage::Environment, dep.subject(), format!("present for {scope}"))
                }
                Some(_) => CheckOutcome::failed(CheckStage::Environment, dep.subject(), "set but empty"),
                None => CheckOutcome::failed(CheckStage::Environment, dep.subject(), "not set"),
            };
            result.checks.push(outcome);
        }

        // 2. connectivity
        match self.store.ping().await {
            Ok(info) => {
                result.checks.push(CheckOutcome::passed(
                    CheckStage::Connectivity,
                    "store",
                    format!("{} {}", info.name, info.version),
                ));
                result.service = Some(info);
            }
            Err(e) => {
                result.checks.push(CheckOutcome::failed(
                    CheckStage::Connectivity,
                    "store",
                    e.to_string(),
                ));
            }
        }

        // 3. dependencies, concurrently; results keep declaration order
        let service = result.service.clone();
        let checks = job
            .dependencies
            .iter()
            .filter(|d| !matches!(d, ServiceDependency::Credential { .. }))
            .map(|dep| self.check_dependency(dep, service.as_ref()));
        result.checks.extend(futures::future::join_all(checks).await);

        // 4. capacity
        match OperationBudget::for_config(&job.config, &self.store.limits()) {
            Ok(budget) => {
                result.checks.push(CheckOutcome::passed(
                    CheckStage::Capacity,
                    "batch budget",
                    format!(
                        "{} ops / {} bytes per batch",
                        budget.ops_per_batch, budget.payload_per_batch
                    ),
                ));
                result.budget = Some(budget);
            }
            Err(e) => {
                result.checks.push(CheckOutcome::failed(
                    CheckStage::Capacity,
                    "batch budget",
                    e.to_string(),
                ));
            }
        }

        for failure in result.failures() {
            tracing::warn!(
                job_id = %job.id,
                stage = %failure.stage,
                subject = %failure.subject,
                detail = %failure.detail,
                "readiness check failed"
            );
        }
        result
    }

    async fn check_dependency(&self, dep: &ServiceDependency, service: Option<&ServiceInfo>) -> CheckOutcome {
        match dep {
            ServiceDependency::Index { collection, name } => self.check_index(dep, collection, name).await,
            ServiceDependency::Service { name, min_version } => {
                check_service(dep, service, name, min_version)
            }
            ServiceDependency::Credential { .. } => {
                CheckOutcome::passed(CheckStage::Environment, dep.subject(), "checked with environment")
            }
        }
    }

    async fn check_index(&self, dep: &ServiceDependency, collection: &str, name: &str) -> CheckOutcome {
        match self.store.list_indexes(collection).await {
            Ok(indexes) if indexes.iter().any(|i| i == name) => {
                CheckOutcome::passed(CheckStage::Dependency, dep.subject(), "exists")
            }
            Ok(_) => CheckOutcome::failed(CheckStage::Dependency, dep.subject(), "index missing"),
            Err(e) => CheckOutcome::failed(CheckStage::Dependency, dep.subject(), e.to_string()),
        }
    }

    /// Compute static partitions from the collection's current keys
    ///
    /// # Errors
    /// Returns `StoreError` if the keys cannot be listed
    pub async fn plan_partitions(&self, job: &MigrationJob) -> Result<Vec<Partition>, StoreError> {
        let keys = self.store.keys(&job.collection).await?;
        let partitions = plan_partitions(&keys, job.config.batch_size, job.config.concurrency_limit);
        tracing::info!(
            job_id = %job.id,
            documents = keys.len(),
            partitions = partitions.len(),
            "planned partitions"
        );
        Ok(partitions)
    }

    /// Copy every document of the collection into the backup collection
    ///
    /// Returns the number of documents captured.
    ///
    /// # Errors
    /// Returns `EngineError` if a snapshot chunk cannot be written
    pub async fn snapshot(&self, job: &MigrationJob, budget: &OperationBudget) -> Result<usize, EngineError> {
        let policy = RetryPolicy::for_batches(&job.config);
        let chunk = budget.snapshot_chunk();
        let range = KeyRange::full();
        let mut after: Option<DocKey> = None;
        let mut captured = 0;

        loop {
            let page = self
                .store
                .scan(&job.collection, &range, after.as_ref(), chunk)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.key.clone());

            let records = page
                .iter()
                .map(|doc| {
                    let record = BackupRecord {
                        job_id: job.id,
                        document: doc.clone(),
                    };
                    encode_record(backup_key(job.id, &doc.key), &record)
                })
                .collect::<Result<Vec<_>, _>>()?;
            for run in budget.split_by_payload(&records, chunk, Document::encoded_len) {
                let mut txn = Transaction::new();
                txn.declare_reads(run.len());
                for record in run {
                    txn.push_put(BACKUPS_COLLECTION, record.clone());
                }
                let outcome = retry(&policy, None, |_| self.store.commit(txn.clone())).await;
                outcome.into_result()?;
            }
            captured += page.len();

            if page.len() < chunk {
                break;
            }
        }

        tracing::info!(job_id = %job.id, documents = captured, "pre-migration snapshot taken");
        Ok(captured)
    }
}

fn check_service(
    dep: &ServiceDependency,
    info: Option<&ServiceInfo>,
    name: &str,
    min_version: &str,
) -> CheckOutcome {
    let Some(info) = info else {
        return CheckOutcome::failed(CheckStage::Dependency, dep.subject(), "store unreachable");
    };
    let found = info
        .services
        .get(name)
        .map(String::as_str)
        .or_else(|| (info.name == name).then_some(info.version.as_str()));
    let Some(found) = found else {
        return CheckOutcome::failed(CheckStage::Dependency, dep.subject(), "service not registered");
    };
    match (parse_version(found), parse_version(min_version)) {
        (Some(have), Some(need)) if compare_versions(&have, &need).is_ge() => {
            CheckOutcome::passed(CheckStage::Dependency, dep.subject(), format!("version {found}"))
        }
        (Some(_), Some(_)) => CheckOutcome::failed(
            CheckStage::Dependency,
            dep.subject(),
            format!("version {found} is older than {min_version}"),
        ),
        _ => CheckOutcome::failed(
            CheckStage::Dependency,
            dep.subject(),
            format!("cannot compare versions '{found}' and '{min_version}'"),
        ),
    }
}

/// Parse a dotted numeric version (`2`, `2.1`, `2.1.7`)
fn parse_version(raw: &str) -> Option<Vec<u64>> {
    let raw = raw.trim().trim_start_matches('v');
    let core = raw.split(['-', '+']).next()?;
    core.split('.').map(|part| part.parse().ok()).collect()
}

fn compare_versions(a: &[u64], b: &[u64]) -> std::cmp::Ordering {
    let len = a.len().max(b.len());
    let pad = |v: &[u64], i: usize| v.get(i).copied().unwrap_or(0);
    (0..len)
        .map(|i| pad(a, i).cmp(&pad(b, i)))
        .find(|o| o.is_ne())
        .unwrap_or(std::cmp::Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobConfig, JobSpec};
    use docshift_store::{Document, MemoryStore, ShapeVersion};
    use serde_json::json;

    fn job(deps: Vec<ServiceDependency>) -> MigrationJob {
        let mut spec = JobSpec::new("trades", ShapeVersion(1), ShapeVersion(2));
        spec.dependencies = deps;
        MigrationJob::new(spec)
    }

    fn index(name: &str) -> ServiceDependency {
        ServiceDependency::Index {
            collection: "trades".into(),
            name: name.into(),
        }
    }

    fn credential(env: &str) -> ServiceDependency {
        ServiceDependency::Credential {
            env: env.into(),
            scope: "admin".into(),
        }
    }

    fn service(name: &str, min: &str) -> ServiceDependency {
        ServiceDependency::Service {
            name: name.into(),
            min_version: min.into(),
        }
    }

    #[tokio::test]
    async fn ready_job_passes_every_stage() {
        let store = Arc::new(
            MemoryStore::new()
                .with_index("trades", "by_owner")
                .with_service("search", "2.4.1"),
        );
        let env = Arc::new(StaticEnv::new().with("TOKEN", "secret"));
        let validator = Validator::new(store, env);
        let result = validator
            .validate(&job(vec![credential("TOKEN"), index("by_owner"), service("search", "2.1")]))
            .await;
        assert!(result.is_ready(), "{:?}", result.failures().collect::<Vec<_>>());
        assert!(result.budget.is_some());
        let stages: Vec<CheckStage> = result.checks.iter().map(|c| c.stage).collect();
        let mut sorted = stages.clone();
        sorted.sort();
        assert_eq!(stages, sorted);
    }

    #[tokio::test]
    async fn reports_every_failure_not_just_the_first() {
        let store = Arc::new(MemoryStore::new().with_service("search", "1.9"));
        let validator = Validator::new(store, Arc::new(StaticEnv::new()));
        let mut job = job(vec![
            credential("TOKEN"),
            index("by_owner"),
            service("search", "2.0"),
            service("billing", "1"),
        ]);
        job.config = JobConfig::default().with_batch_size(400);

        let err = validator.validate(&job).await.into_result().unwrap_err();
        let stages: Vec<CheckStage> = err.failures.iter().map(|f| f.stage).collect();
        assert_eq!(
            stages,
            vec![
                CheckStage::Environment,
                CheckStage::Dependency,
                CheckStage::Dependency,
                CheckStage::Dependency,
                CheckStage::Capacity,
            ]
        );
    }

    #[tokio::test]
    async fn unreachable_store_fails_connectivity_and_dependencies() {
        let store = Arc::new(MemoryStore::new());
        store.set_reachable(false);
        let validator = Validator::new(store, Arc::new(StaticEnv::new()));
        let result = validator
            .validate(&job(vec![index("by_owner"), service("search", "1")]))
            .await;
        let failed: Vec<&str> = result.failures().map(|f| f.subject.as_str()).collect();
        assert_eq!(failed, vec!["store", "index:trades/by_owner", "service:search>=1"]);
    }

    #[tokio::test]
    async fn snapshot_copies_every_document() {
        let store = Arc::new(MemoryStore::new());
        store.seed(
            "trades",
            (0..600).map(|i| Document::new(format!("doc-{i:06}"), ShapeVersion(1), json!({"i": i}))),
        );
        let validator = Validator::new(store.clone(), Arc::new(ProcessEnv));
        let job = job(Vec::new());
        let budget = OperationBudget::for_config(&job.config, &store.limits()).unwrap();

        let captured = validator.snapshot(&job, &budget).await.unwrap();
        assert_eq!(captured, 600);
        assert_eq!(store.count(BACKUPS_COLLECTION).await.unwrap(), 600);
    }

    #[test]
    fn version_comparison() {
        let v = |s| parse_version(s).unwrap();
        assert!(compare_versions(&v("2.1"), &v("2.1.0")).is_eq());
        assert!(compare_versions(&v("2.10"), &v("2.9")).is_gt());
        assert!(compare_versions(&v("v1.2.3-beta"), &v("1.2.4")).is_lt());
        assert!(parse_version("two").is_none());
    }
}
