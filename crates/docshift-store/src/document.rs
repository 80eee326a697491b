//! Documents, keys and key ranges
//!
//! Keys are ordered lexicographically; every scan the engine performs is in
//! key order so that progress can be resumed from the last processed key.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Document key (lexicographically ordered)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocKey(String);

impl DocKey {
    /// Create new key
    #[inline]
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow key as string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DocKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Schema/structure version of a document
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ShapeVersion(pub u32);

impl fmt::Display for ShapeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A stored document
///
/// `revision` is assigned by the store on every write and is ignored on
/// input; it backs [`crate::Precondition::RevisionIs`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: DocKey,
    pub shape: ShapeVersion,
    #[serde(default)]
    pub revision: u64,
    pub body: Value,
}

impl Document {
    /// Create a document that has not been written yet
    #[inline]
    #[must_use]
    pub fn new(key: impl Into<DocKey>, shape: ShapeVersion, body: Value) -> Self {
        Self {
            key: key.into(),
            shape,
            revision: 0,
            body,
        }
    }

    /// Approximate encoded size in bytes (key + JSON body)
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.key.as_str().len() + serde_json::to_vec(&self.body).map_or(0, |v| v.len())
    }
}

/// Half-open key range `[start, end)`
///
/// `None` on either side means unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Option<DocKey>,
    pub end: Option<DocKey>,
}

impl KeyRange {
    /// Range covering the whole key space
    #[inline]
    #[must_use]
    pub fn full() -> Self {
        Self::default()
    }

    /// Create new range
    #[inline]
    #[must_use]
    pub fn new(start: Option<DocKey>, end: Option<DocKey>) -> Self {
        Self { start, end }
    }

    /// Range of all keys starting with an ASCII `prefix`
    #[must_use]
    pub fn prefix(prefix: &str) -> Self {
        Self {
            start: Some(DocKey::new(prefix)),
            end: Some(DocKey::new(format!("{prefix}\u{7f}"))),
        }
    }

    /// Check whether `key` falls inside the range
    #[must_use]
    pub fn contains(&self, key: &DocKey) -> bool {
        let above_start = self.start.as_ref().map_or(true, |s| key >= s);
        let below_end = self.end.as_ref().map_or(true, |e| key < e);
        above_start && below_end
    }

    /// Check whether two ranges share at least one possible key
    #[must_use]
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        let starts_before_other_ends = match (&self.start, &other.end) {
            (Some(s), Some(e)) => s < e,
            _ => true,
        };
        let other_starts_before_self_ends = match (&other.start, &self.end) {
            (Some(s), Some(e)) => s < e,
            _ => true,
        };
        starts_before_other_ends && other_starts_before_self_ends
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self.start.as_ref().map_or("-inf", DocKey::as_str);
        let end = self.end.as_ref().map_or("+inf", DocKey::as_str);
        write!(f, "[{start}, {end})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_range_contains() {
        let range = KeyRange::new(Some("b".into()), Some("d".into()));
        assert!(!range.contains(&"a".into()));
        assert!(range.contains(&"b".into()));
        assert!(range.contains(&"c".into()));
        assert!(!range.contains(&"d".into()));
    }

    #[test]
    fn full_range_contains_everything() {
        let range = KeyRange::full();
        assert!(range.contains(&"".into()));
        assert!(range.contains(&"zzz".into()));
    }

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        let left = KeyRange::new(None, Some("m".into()));
        let right = KeyRange::new(Some("m".into()), None);
        assert!(!left.overlaps(&right));
        assert!(!right.overlaps(&left));

        let wide = KeyRange::new(Some("a".into()), Some("z".into()));
        assert!(wide.overlaps(&left));
        assert!(wide.overlaps(&right));
    }

    #[test]
    fn prefix_range_matches_children_only() {
        let range = KeyRange::prefix("job-1/");
        assert!(range.contains(&"job-1/0001/000000000001".into()));
        assert!(!range.contains(&"job-10/0001".into()));
        assert!(!range.contains(&"job-2/0001".into()));
    }

    #[test]
    fn document_serde_keeps_shape() {
        let doc = Document::new("k", ShapeVersion(2), serde_json::json!({"a": 1}));
        let json = serde_json::to_string(&doc).unwrap();
        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
        assert_eq!(back.shape, ShapeVersion(2));
    }
}
