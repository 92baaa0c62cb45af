//! Job return values.
//!
//! Handler results are stored as JSON. Values that cannot be represented as
//! JSON (for example maps keyed by tuples) are stored as an envelope carrying
//! the type name and a debug rendering, so serialization never turns a
//! successful job into a failed one.

use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;

/// Value produced by a job handler.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    /// Handler produced nothing
    Unit,
    /// Structured JSON value
    Json(Value),
    /// Value that could not be serialized structurally
    Opaque { type_name: String, repr: String },
}

impl TaskOutput {
    pub fn json(value: impl Into<Value>) -> Self {
        Self::Json(value.into())
    }

    /// Serialize `value`, falling back to the `{type, repr}` envelope.
    pub fn from_serialize<T>(value: &T) -> Self
    where
        T: Serialize + fmt::Debug + ?Sized,
    {
        match serde_json::to_value(value) {
            Ok(v) => Self::Json(v),
            Err(e) => {
                tracing::debug!(
                    type_name = std::any::type_name::<T>(),
                    error = %e,
                    "Result is not JSON-representable, storing envelope"
                );
                Self::Opaque {
                    type_name: std::any::type_name::<T>().to_string(),
                    repr: format!("{:?}", value),
                }
            }
        }
    }

    /// The JSON stored on the job record.
    pub fn into_value(self) -> Value {
        match self {
            Self::Unit => Value::Null,
            Self::Json(v) => v,
            Self::Opaque { type_name, repr } => json!({ "type": type_name, "repr": repr }),
        }
    }
}

impl From<Value> for TaskOutput {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<()> for TaskOutput {
    fn from(_: ()) -> Self {
        Self::Unit
    }
}

/// Serialize any value for storage without failing.
pub fn safe_serialize<T>(value: &T) -> Value
where
    T: Serialize + fmt::Debug + ?Sized,
{
    TaskOutput::from_serialize(value).into_value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_structured_value() {
        let mut map = HashMap::new();
        map.insert("a", 1);
        assert_eq!(safe_serialize(&map), json!({"a": 1}));
    }

    #[test]
    fn test_unrepresentable_value_uses_envelope() {
        let mut map = HashMap::new();
        map.insert((1, 2), "pair");

        let value = safe_serialize(&map);
        let envelope = value.as_object().unwrap();
        assert!(envelope["type"].as_str().unwrap().contains("HashMap"));
        assert!(envelope["repr"].as_str().unwrap().contains("pair"));
    }

    #[test]
    fn test_unit_is_null() {
        assert_eq!(TaskOutput::from(()).into_value(), Value::Null);
    }
}
