//! Testing utilities for docshift workspace
//!
//! Shared fixtures: seeded collections, fault-injecting transforms and
//! snapshot comparisons.

#![allow(missing_docs)]

use docshift_core::{JobConfig, JobSpec, RenameFields, Transform, TransformError};
use docshift_store::{DocKey, Document, MemoryStore, ShapeVersion};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

pub const COLLECTION: &str = "trades";
pub const SOURCE: ShapeVersion = ShapeVersion(1);
pub const TARGET: ShapeVersion = ShapeVersion(2);

/// Key of the `i`th seeded document
pub fn key(i: usize) -> DocKey {
    DocKey::new(format!("doc-{i:06}"))
}

/// Source-shape body of the `i`th seeded document
pub fn body(i: usize) -> Value {
    json!({
        "owner": format!("owner-{}", i % 97),
        "amount": i * 10,
        "status": if i % 3 == 0 { "open" } else { "settled" },
    })
}

/// Seed `count` source-shape documents into `collection`
pub fn seed_collection(store: &MemoryStore, collection: &str, count: usize) {
    store.seed(
        collection,
        (0..count).map(|i| Document::new(key(i), SOURCE, body(i))),
    );
}

/// [`body`] with a `padding` string of `padding` bytes
pub fn padded_body(i: usize, padding: usize) -> Value {
    let mut body = body(i);
    body["padding"] = Value::String("x".repeat(padding));
    body
}

/// Seed `count` source-shape documents carrying `padding` extra bytes each
pub fn seed_padded(store: &MemoryStore, collection: &str, count: usize, padding: usize) {
    store.seed(
        collection,
        (0..count).map(|i| Document::new(key(i), SOURCE, padded_body(i, padding))),
    );
}

/// Fresh store holding `count` documents in [`COLLECTION`]
pub fn seeded_store(count: usize) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    seed_collection(&store, COLLECTION, count);
    store
}

/// `owner -> owner_id`
pub fn rename_owner() -> Arc<dyn Transform> {
    Arc::new(RenameFields::new([("owner", "owner_id")]))
}

/// Config with short intervals for tests
pub fn fast_config(batch_size: usize, concurrency: usize) -> JobConfig {
    JobConfig::default()
        .with_batch_size(batch_size)
        .with_concurrency_limit(concurrency)
        .with_retry_delays(Duration::from_millis(1), Duration::from_millis(5))
        .with_monitor_interval(Duration::from_millis(50))
        .with_shim_grace_period(Duration::from_millis(20))
}

/// Spec for [`COLLECTION`] moving [`SOURCE`] to [`TARGET`]
pub fn test_spec(config: JobConfig) -> JobSpec {
    JobSpec::new(COLLECTION, SOURCE, TARGET).with_config(config)
}

/// Numeric suffix of a seeded key
fn ordinal(key: &DocKey) -> Option<usize> {
    key.as_str().rsplit('-').next()?.parse().ok()
}

/// Wraps a transform and rejects every `every`th document
///
/// Documents whose ordinal `i` satisfies `i % every == every - 1` fail
/// forward; inverse always delegates.
#[derive(Debug)]
pub struct FlakyTransform {
    inner: Arc<dyn Transform>,
    every: usize,
}

impl FlakyTransform {
    pub fn new(inner: Arc<dyn Transform>, every: usize) -> Self {
        Self {
            inner,
            every: every.max(1),
        }
    }

    /// Whether the document at `key` is rejected
    pub fn rejects(&self, key: &DocKey) -> bool {
        ordinal(key).is_some_and(|i| i % self.every == self.every - 1)
    }
}

impl Transform for FlakyTransform {
    fn name(&self) -> &str {
        "flaky"
    }

    fn forward(&self, key: &DocKey, body: &Value) -> Result<Value, TransformError> {
        if self.rejects(key) {
            return Err(TransformError::Rejected(format!("{key} rejected by fixture")));
        }
        self.inner.forward(key, body)
    }

    fn inverse(&self, key: &DocKey, body: &Value) -> Result<Value, TransformError> {
        self.inner.inverse(key, body)
    }

    fn is_invertible(&self) -> bool {
        self.inner.is_invertible()
    }
}

/// Counts forward calls
#[derive(Debug)]
pub struct CountingTransform {
    inner: Arc<dyn Transform>,
    forward_calls: AtomicUsize,
}

impl CountingTransform {
    pub fn new(inner: Arc<dyn Transform>) -> Self {
        Self {
            inner,
            forward_calls: AtomicUsize::new(0),
        }
    }

    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::SeqCst)
    }
}

impl Transform for CountingTransform {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn forward(&self, key: &DocKey, body: &Value) -> Result<Value, TransformError> {
        self.forward_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.forward(key, body)
    }

    fn inverse(&self, key: &DocKey, body: &Value) -> Result<Value, TransformError> {
        self.inner.inverse(key, body)
    }

    fn is_invertible(&self) -> bool {
        self.inner.is_invertible()
    }
}

/// Documents of `snapshot` in `shape`
pub fn count_in_shape(snapshot: &[Document], shape: ShapeVersion) -> usize {
    snapshot.iter().filter(|d| d.shape == shape).count()
}

/// Assert keys, shapes and bodies match (revisions are ignored)
pub fn assert_same_content(before: &[Document], after: &[Document]) {
    assert_eq!(before.len(), after.len(), "document count differs");
    for (b, a) in before.iter().zip(after) {
        assert_eq!(b.key, a.key);
        assert_eq!(b.shape, a.shape, "shape differs for {}", b.key);
        assert_eq!(
            serde_json::to_vec(&b.body).unwrap(),
            serde_json::to_vec(&a.body).unwrap(),
            "body differs for {}",
            b.key
        );
    }
}

/// Install a test log subscriber once per process (`RUST_LOG` filtered)
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
