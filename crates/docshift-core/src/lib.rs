//! docshift Core - Online document migration engine
//!
//! Moves every document of a collection from one shape to another while the
//! application keeps running:
//! - Validates readiness (credentials, connectivity, dependencies, capacity)
//! - Processes disjoint key-range partitions in parallel, one atomic
//!   transaction and one checkpoint per batch
//! - Serves both shapes to the live application through a compatibility shim
//! - Watches health and rolls back automatically on threshold breaches
//! - Reverts by inverse transform or from a pre-migration snapshot
//!
//! # Example
//!
//! ```rust,ignore
//! use docshift_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(store: Arc<dyn DocumentStore>) -> Result<(), EngineError> {
//! let spec = JobSpec::new("trades", ShapeVersion(1), ShapeVersion(2));
//! let transform = Arc::new(RenameFields::new([("owner", "owner_id")]));
//!
//! let handle = Orchestrator::new(store).start(spec, transform).await?;
//! let status = handle.wait().await;
//! println!("job {} finished as {status}", handle.id());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod batch;
pub mod budget;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod jobs;
pub mod monitor;
pub mod orchestrator;
pub mod partition;
pub mod report;
pub mod retry;
pub mod rollback;
pub mod shim;
pub mod state_machine;
pub mod transform;
pub mod types;
pub mod validator;

pub use batch::{BatchOperation, BatchProcessor, BatchResult, BatchStatus, PartitionCursor};
pub use budget::OperationBudget;
pub use checkpoint::{Checkpoint, CheckpointStore, LedgerView};
pub use config::MigrationFile;
pub use error::{ConfigError, EngineError, RollbackError, TransformError, ValidationError};
pub use jobs::JobRepository;
pub use monitor::{HealthReport, HealthStatus, HealthThresholds, InFlightMemory, MonitorHandle};
pub use orchestrator::{JobEvent, JobHandle, JobProgress, Orchestrator};
pub use partition::plan_partitions;
pub use report::{ExitStatus, JobStatusReport, LedgerSummary};
pub use retry::{retry, RetryOutcome, RetryPolicy};
pub use rollback::{CheckpointRef, RollbackManager, RollbackOutcome, RollbackPlan, RollbackStrategy};
pub use shim::{CompatibilityShim, ShimState};
pub use transform::{NestFields, RenameFields, Transform, TransformSpec};
pub use types::{
    JobConfig, JobId, JobSpec, JobStatus, MigrationJob, Partition, ServiceDependency,
};
pub use validator::{
    CheckOutcome, CheckStage, EnvSource, HealthCheckResult, ProcessEnv, StaticEnv, Validator,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for running migrations
    pub use crate::{
        EngineError, JobConfig, JobHandle, JobSpec, JobStatus, Orchestrator, RenameFields,
        RollbackStrategy, Transform,
    };
    pub use docshift_store::{DocKey, Document, DocumentStore, ShapeVersion};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
