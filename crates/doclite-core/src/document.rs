//! Document model: metadata plus a flattened user body.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DbError, Result};

/// Column holding the document id.
pub const ID_COLUMN: &str = "_id";

/// Column holding the JSONB-encoded user body.
pub const BODY_COLUMN: &str = "body";

/// Default name of the creation-timestamp column.
pub const CREATED_AT_COLUMN: &str = "createdAt";

/// Default name of the update-timestamp column.
pub const UPDATED_AT_COLUMN: &str = "updatedAt";

/// A stored document: metadata columns plus the typed user body.
///
/// `id` is immutable after insert, `created_at` is assigned on insert and
/// never changed, `updated_at` is refreshed on every successful write. Both
/// timestamps are milliseconds since the Unix epoch (0 when the collection
/// runs with timestamps disabled).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document<T> {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(rename = "createdAt", default)]
    pub created_at: i64,

    #[serde(rename = "updatedAt", default)]
    pub updated_at: i64,

    #[serde(flatten)]
    pub data: T,
}

impl<T> Document<T> {
    /// Consumes the document, returning the user body.
    pub fn into_data(self) -> T {
        self.data
    }
}

/// A shallow top-level patch applied by the update operations.
///
/// Each entry replaces the field of the same name in the user body; fields
/// absent from the patch are untouched. Nested objects are replaced whole,
/// not merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(Map<String, Value>);

impl Patch {
    /// Creates an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field to a JSON-convertible value.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Sets a field to any serializable value.
    pub fn try_set(mut self, field: impl Into<String>, value: impl Serialize) -> Result<Self> {
        self.0.insert(field.into(), serde_json::to_value(value)?);
        Ok(self)
    }

    /// Builds a patch from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(DbError::serialization(format!(
                "patch must be a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    /// Returns `true` if the patch has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the patch entries.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// The field names touched by this patch.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Applies the patch to a body object, replacing top-level fields.
    pub fn apply_to(&self, body: &mut Map<String, Value>) {
        for (k, v) in &self.0 {
            body.insert(k.clone(), v.clone());
        }
    }
}

/// Lowercase JSON type name for error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        name: String,
        age: i64,
    }

    #[test]
    fn document_serializes_flat() {
        let doc = Document {
            id: "abc".into(),
            created_at: 100,
            updated_at: 200,
            data: User {
                name: "Alice".into(),
                age: 30,
            },
        };
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            value,
            json!({
                "_id": "abc",
                "createdAt": 100,
                "updatedAt": 200,
                "name": "Alice",
                "age": 30,
            })
        );
    }

    #[test]
    fn document_round_trips() {
        let doc = Document {
            id: "abc".into(),
            created_at: 1,
            updated_at: 2,
            data: User {
                name: "Bob".into(),
                age: 41,
            },
        };
        let text = serde_json::to_string(&doc).unwrap();
        let back: Document<User> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn patch_applies_shallow_replacement() {
        let mut body = json!({"name": "Alice", "tags": {"a": 1}})
            .as_object()
            .unwrap()
            .clone();
        let patch = Patch::new().set("tags", json!({"b": 2})).set("age", 30);
        patch.apply_to(&mut body);
        assert_eq!(body.get("name"), Some(&json!("Alice")));
        // Replaced whole, not merged.
        assert_eq!(body.get("tags"), Some(&json!({"b": 2})));
        assert_eq!(body.get("age"), Some(&json!(30)));
    }

    #[test]
    fn patch_rejects_non_objects() {
        let err = Patch::from_value(json!([1, 2])).unwrap_err();
        assert!(matches!(err, DbError::Serialization { .. }));
    }
}
