//! Content-addressed cache keys.
//!
//! A key is the namespace plus the SHA-256 of the canonical JSON rendering of
//! the inputs. Object keys are sorted before hashing, so two inputs that
//! differ only in field order share a key.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{Result, TasklineError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: String,
    digest: String,
}

impl CacheKey {
    /// Key for `inputs` under `namespace`.
    pub fn for_inputs<I: Serialize + ?Sized>(namespace: impl Into<String>, inputs: &I) -> Result<Self> {
        let namespace = namespace.into();
        if namespace.is_empty() || namespace.contains(char::is_whitespace) {
            return Err(TasklineError::validation(format!(
                "Invalid cache namespace '{}'",
                namespace
            )));
        }

        let value = serde_json::to_value(inputs)?;
        let canonical = serde_json::to_vec(&canonicalize(value))?;
        Ok(Self {
            namespace,
            digest: hex::encode(Sha256::digest(&canonical)),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Hex SHA-256 of the canonical inputs.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Storage key: `{prefix}{namespace}:{digest}`.
    pub fn render(&self, prefix: &str) -> String {
        format!("{}{}:{}", prefix, self.namespace, self.digest)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.digest)
    }
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_order_does_not_matter() {
        let a = CacheKey::for_inputs("ephemeris", &json!({"lat": 1.5, "lon": 2.5, "opts": {"x": 1, "y": 2}})).unwrap();
        let b = CacheKey::for_inputs("ephemeris", &json!({"opts": {"y": 2, "x": 1}, "lon": 2.5, "lat": 1.5})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_namespace_and_inputs_separate_keys() {
        let a = CacheKey::for_inputs("a", &json!([1, 2])).unwrap();
        let b = CacheKey::for_inputs("b", &json!([1, 2])).unwrap();
        let c = CacheKey::for_inputs("a", &json!([2, 1])).unwrap();
        assert_ne!(a.render(""), b.render(""));
        assert_ne!(a, c);
    }

    #[test]
    fn test_render() {
        let key = CacheKey::for_inputs("ns", &"x").unwrap();
        let rendered = key.render("taskline:cache:");
        assert!(rendered.starts_with("taskline:cache:ns:"));
        assert_eq!(key.digest().len(), 64);
    }

    #[test]
    fn test_bad_namespace() {
        assert!(CacheKey::for_inputs("", &1).is_err());
        assert!(CacheKey::for_inputs("has space", &1).is_err());
    }
}
