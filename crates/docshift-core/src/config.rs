//! Job files
//!
//! A job file is TOML:
//!
//! ```toml
//! collection = "trades"
//! source_shape = 1
//! target_shape = 2
//!
//! [job]
//! batch_size = 200
//! concurrency_limit = 4
//!
//! [transform]
//! kind = "rename_fields"
//! fields = { owner = "owner_id" }
//!
//! [[dependencies]]
//! kind = "index"
//! collection = "trades"
//! name = "by_owner_id"
//! ```
//!
//! `DOCSHIFT_FAILURE_THRESHOLD`, `DOCSHIFT_BATCH_SIZE` and
//! `DOCSHIFT_CONCURRENCY_LIMIT` override the `[job]` table.

use crate::error::ConfigError;
use crate::transform::{Transform, TransformSpec};
use crate::types::{JobConfig, JobSpec, ServiceDependency};
use crate::validator::EnvSource;
use docshift_store::ShapeVersion;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Override for `failure_threshold`
pub const ENV_FAILURE_THRESHOLD: &str = "DOCSHIFT_FAILURE_THRESHOLD";
/// Override for `batch_size`
pub const ENV_BATCH_SIZE: &str = "DOCSHIFT_BATCH_SIZE";
/// Override for `concurrency_limit`
pub const ENV_CONCURRENCY_LIMIT: &str = "DOCSHIFT_CONCURRENCY_LIMIT";

/// Parsed job file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationFile {
    pub collection: String,
    pub source_shape: ShapeVersion,
    pub target_shape: ShapeVersion,
    #[serde(default)]
    pub job: JobConfig,
    pub transform: TransformSpec,
    #[serde(default)]
    pub dependencies: Vec<ServiceDependency>,
}

impl MigrationFile {
    /// Read and parse a job file
    ///
    /// # Errors
    /// - `ConfigError::Io` if the file cannot be read
    /// - `ConfigError::Parse` if it is not a valid job file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Parse a job file
    ///
    /// # Errors
    /// Returns `ConfigError::Parse` if `text` is not a valid job file
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment overrides
    ///
    /// # Errors
    /// Returns `ConfigError::Parse` if an override is not a number
    pub fn apply_env_overrides(&mut self, env: &dyn EnvSource) -> Result<(), ConfigError> {
        if let Some(v) = parse_override(env, ENV_FAILURE_THRESHOLD)? {
            self.job.failure_threshold = v;
        }
        if let Some(v) = parse_override(env, ENV_BATCH_SIZE)? {
            self.job.batch_size = v;
        }
        if let Some(v) = parse_override(env, ENV_CONCURRENCY_LIMIT)? {
            self.job.concurrency_limit = v;
        }
        Ok(())
    }

    /// Split into job spec and transform
    #[must_use]
    pub fn into_spec(self) -> (JobSpec, Arc<dyn Transform>) {
        let transform = self.transform.build();
        let spec = JobSpec {
            collection: self.collection,
            source_shape: self.source_shape,
            target_shape: self.target_shape,
            config: self.job,
            dependencies: self.dependencies,
        };
        (spec, transform)
    }
}

fn parse_override<T>(env: &dyn EnvSource, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = env.var(name) else {
        return Ok(None);
    };
    let value = raw
        .trim()
        .parse()
        .map_err(|e| ConfigError::Parse(format!("{name}={raw}: {e}")))?;
    tracing::debug!(variable = name, value = %raw.trim(), "config override from environment");
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::StaticEnv;
    use pretty_assertions::assert_eq;

    const FILE: &str = r#"
collection = "trades"
source_shape = 1
target_shape = 2

[job]
batch_size = 100
failure_threshold = 0.02

[transform]
kind = "rename_fields"
fields = { owner = "owner_id" }

[[dependencies]]
kind = "index"
collection = "trades"
name = "by_owner_id"

[[dependencies]]
kind = "service"
name = "document-store"
min_version = "2.1"
"#;

    #[test]
    fn parses_full_file_with_defaults() {
        let file = MigrationFile::from_toml_str(FILE).unwrap();
        assert_eq!(file.collection, "trades");
        assert_eq!(file.target_shape, ShapeVersion(2));
        assert_eq!(file.job.batch_size, 100);
        assert_eq!(file.job.concurrency_limit, JobConfig::default().concurrency_limit);
        assert_eq!(file.dependencies.len(), 2);

        let (spec, transform) = file.into_spec();
        assert_eq!(spec.source_shape, ShapeVersion(1));
        assert!(transform.is_invertible());
    }

    #[test]
    fn env_overrides_win() {
        let mut file = MigrationFile::from_toml_str(FILE).unwrap();
        let env = StaticEnv::new()
            .with(ENV_BATCH_SIZE, "50")
            .with(ENV_CONCURRENCY_LIMIT, " 8 ")
            .with(ENV_FAILURE_THRESHOLD, "0.005");
        file.apply_env_overrides(&env).unwrap();
        assert_eq!(file.job.batch_size, 50);
        assert_eq!(file.job.concurrency_limit, 8);
        assert!((file.job.failure_threshold - 0.005).abs() < f64::EPSILON);
    }

    #[test]
    fn bad_override_is_a_parse_error() {
        let mut file = MigrationFile::from_toml_str(FILE).unwrap();
        let env = StaticEnv::new().with(ENV_BATCH_SIZE, "lots");
        assert!(matches!(
            file.apply_env_overrides(&env),
            Err(ConfigError::Parse(msg)) if msg.starts_with("DOCSHIFT_BATCH_SIZE=lots")
        ));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = MigrationFile::from_toml_str("collection = \"a\"\nbogus = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = MigrationFile::load(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
