//! Domain transform capability
//!
//! The engine never branches on document shape itself; the per-document
//! mapping is injected as a [`Transform`]. Transforms must be per-document
//! pure: the output depends only on the key and body passed in.
//!
//! Both directions must accept a *dual* body (old-shape fields and
//! new-shape fields side by side, as written by the compatibility shim) as
//! long as the two representations agree.

use crate::error::TransformError;
use docshift_store::DocKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Per-document mapping between the source and target shape
pub trait Transform: Send + Sync + fmt::Debug {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Map a source-shape body to the target shape
    ///
    /// # Errors
    /// Returns `TransformError` if this document cannot be migrated
    fn forward(&self, key: &DocKey, body: &Value) -> Result<Value, TransformError>;

    /// Map a target-shape body back to the source shape
    ///
    /// # Errors
    /// Returns `TransformError::NotInvertible` unless overridden
    fn inverse(&self, key: &DocKey, body: &Value) -> Result<Value, TransformError> {
        let _ = (key, body);
        Err(TransformError::NotInvertible)
    }

    /// Whether [`Transform::inverse`] restores the exact source body
    fn is_invertible(&self) -> bool {
        false
    }

    /// Body readable under both shapes
    ///
    /// Defaults to the union of the source body and its forward mapping,
    /// forward fields winning.
    ///
    /// # Errors
    /// Returns `TransformError` if the forward mapping fails
    fn dual(&self, key: &DocKey, source_body: &Value) -> Result<Value, TransformError> {
        let forward = self.forward(key, source_body)?;
        merge_bodies(source_body, &forward)
    }
}

/// Union of two object bodies; fields of `overlay` win
///
/// # Errors
/// Returns `TransformError::Malformed` if either body is not an object
pub fn merge_bodies(base: &Value, overlay: &Value) -> Result<Value, TransformError> {
    let mut merged = as_object(base)?.clone();
    for (field, value) in as_object(overlay)? {
        merged.insert(field.clone(), value.clone());
    }
    Ok(Value::Object(merged))
}

fn as_object(body: &Value) -> Result<&Map<String, Value>, TransformError> {
    body.as_object()
        .ok_or_else(|| TransformError::Malformed(format!("expected object, found {}", kind(body))))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Rename top-level fields (`from -> to`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameFields {
    fields: BTreeMap<String, String>,
}

impl RenameFields {
    /// Create from `(from, to)` pairs
    #[must_use]
    pub fn new<I, A, B>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(from, to)| (from.into(), to.into()))
                .collect(),
        }
    }

    fn apply<'a>(
        body: &Value,
        pairs: impl Iterator<Item = (&'a String, &'a String)>,
    ) -> Result<Value, TransformError> {
        let mut out = as_object(body)?.clone();
        for (from, to) in pairs {
            let Some(value) = out.remove(from) else {
                continue;
            };
            match out.get(to) {
                Some(existing) if *existing != value => {
                    return Err(TransformError::Conflict { field: to.clone() });
                }
                _ => {
                    out.insert(to.clone(), value);
                }
            }
        }
        Ok(Value::Object(out))
    }
}

impl Transform for RenameFields {
    fn name(&self) -> &str {
        "rename_fields"
    }

    fn forward(&self, _key: &DocKey, body: &Value) -> Result<Value, TransformError> {
        Self::apply(body, self.fields.iter())
    }

    fn inverse(&self, _key: &DocKey, body: &Value) -> Result<Value, TransformError> {
        Self::apply(body, self.fields.iter().map(|(from, to)| (to, from)))
    }

    fn is_invertible(&self) -> bool {
        true
    }
}

/// Move top-level fields into a nested object
///
/// `{a, b, x}` becomes `{into: {a, b}, x}`. Fields missing from the source
/// stay missing from the nested object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestFields {
    fields: Vec<String>,
    into: String,
}

impl NestFields {
    /// Create transform nesting `fields` under `into`
    #[must_use]
    pub fn new(fields: impl IntoIterator<Item = impl Into<String>>, into: impl Into<String>) -> Self {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            into: into.into(),
        }
    }
}

impl Transform for NestFields {
    fn name(&self) -> &str {
        "nest_fields"
    }

    fn forward(&self, _key: &DocKey, body: &Value) -> Result<Value, TransformError> {
        let mut out = as_object(body)?.clone();
        let existing = match out.remove(&self.into) {
            Some(Value::Object(map)) => Some(map),
            Some(other) => {
                return Err(TransformError::Malformed(format!(
                    "'{}' is a {}, expected object",
                    self.into,
                    kind(&other)
                )));
            }
            None => None,
        };

        let mut nested = Map::new();
        for field in &self.fields {
            if let Some(value) = out.remove(field) {
                nested.insert(field.clone(), value);
            }
        }
        if let Some(existing) = existing {
            for (field, value) in existing {
                match nested.get(&field) {
                    Some(current) if *current != value => {
                        return Err(TransformError::Conflict {
                            field: format!("{}.{field}", self.into),
                        });
                    }
                    _ => {
                        nested.insert(field, value);
                    }
                }
            }
        }
        out.insert(self.into.clone(), Value::Object(nested));
        Ok(Value::Object(out))
    }

    fn inverse(&self, _key: &DocKey, body: &Value) -> Result<Value, TransformError> {
        let mut out = as_object(body)?.clone();
        let nested = match out.remove(&self.into) {
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(TransformError::Malformed(format!(
                    "'{}' is a {}, expected object",
                    self.into,
                    kind(&other)
                )));
            }
            None => return Err(TransformError::Malformed(format!("missing '{}'", self.into))),
        };
        for (field, value) in nested {
            match out.get(&field) {
                Some(current) if *current != value => {
                    return Err(TransformError::Conflict { field });
                }
                _ => {
                    out.insert(field, value);
                }
            }
        }
        Ok(Value::Object(out))
    }

    fn is_invertible(&self) -> bool {
        true
    }
}

/// Built-in transform as declared in a job file's `[transform]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformSpec {
    RenameFields { fields: BTreeMap<String, String> },
    NestFields { fields: Vec<String>, into: String },
}

impl TransformSpec {
    /// Instantiate the transform
    #[must_use]
    pub fn build(&self) -> Arc<dyn Transform> {
        match self {
            Self::RenameFields { fields } => Arc::new(RenameFields::new(fields.clone())),
            Self::NestFields { fields, into } => {
                Arc::new(NestFields::new(fields.iter().cloned(), into.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn key() -> DocKey {
        DocKey::new("doc-000001")
    }

    #[test]
    fn rename_forward_and_inverse() {
        let t = RenameFields::new([("owner", "owner_id")]);
        let source = json!({"owner": "alice", "amount": 10});
        let target = t.forward(&key(), &source).unwrap();
        assert_eq!(target, json!({"owner_id": "alice", "amount": 10}));
        assert_eq!(t.inverse(&key(), &target).unwrap(), source);
    }

    #[test]
    fn rename_accepts_consistent_dual_body() {
        let t = RenameFields::new([("owner", "owner_id")]);
        let dual = t.dual(&key(), &json!({"owner": "alice"})).unwrap();
        assert_eq!(dual, json!({"owner": "alice", "owner_id": "alice"}));
        assert_eq!(t.forward(&key(), &dual).unwrap(), json!({"owner_id": "alice"}));
        assert_eq!(t.inverse(&key(), &dual).unwrap(), json!({"owner": "alice"}));
    }

    #[test]
    fn rename_rejects_conflicting_dual_body() {
        let t = RenameFields::new([("owner", "owner_id")]);
        let err = t
            .forward(&key(), &json!({"owner": "alice", "owner_id": "bob"}))
            .unwrap_err();
        assert_eq!(
            err,
            TransformError::Conflict {
                field: "owner_id".into()
            }
        );
    }

    #[test]
    fn non_object_body_is_malformed() {
        let t = RenameFields::new([("a", "b")]);
        assert!(matches!(
            t.forward(&key(), &json!([1, 2])),
            Err(TransformError::Malformed(_))
        ));
    }

    #[test]
    fn nest_round_trip() {
        let t = NestFields::new(["amount", "status"], "detail");
        let source = json!({"owner": "a", "amount": 5, "status": "open"});
        let target = t.forward(&key(), &source).unwrap();
        assert_eq!(
            target,
            json!({"owner": "a", "detail": {"amount": 5, "status": "open"}})
        );
        assert_eq!(t.inverse(&key(), &target).unwrap(), source);

        let dual = t.dual(&key(), &source).unwrap();
        assert_eq!(t.forward(&key(), &dual).unwrap(), target);
        assert_eq!(t.inverse(&key(), &dual).unwrap(), source);
    }

    #[test]
    fn nest_inverse_requires_container() {
        let t = NestFields::new(["amount"], "detail");
        assert!(matches!(
            t.inverse(&key(), &json!({"amount": 1})),
            Err(TransformError::Malformed(_))
        ));
    }

    #[test]
    fn default_inverse_is_not_invertible() {
        #[derive(Debug)]
        struct Upper;
        impl Transform for Upper {
            fn name(&self) -> &str {
                "upper"
            }
            fn forward(&self, _key: &DocKey, body: &Value) -> Result<Value, TransformError> {
                Ok(body.clone())
            }
        }
        assert!(!Upper.is_invertible());
        assert_eq!(
            Upper.inverse(&key(), &json!({})),
            Err(TransformError::NotInvertible)
        );
    }

    #[test]
    fn spec_deserializes_from_toml() {
        let spec: TransformSpec =
            toml::from_str("kind = \"rename_fields\"\nfields = { owner = \"owner_id\" }\n").unwrap();
        let t = spec.build();
        assert_eq!(t.name(), "rename_fields");
        assert!(t.is_invertible());

        let spec: TransformSpec =
            toml::from_str("kind = \"nest_fields\"\nfields = [\"a\"]\ninto = \"b\"\n").unwrap();
        assert_eq!(spec.build().name(), "nest_fields");
    }
}
