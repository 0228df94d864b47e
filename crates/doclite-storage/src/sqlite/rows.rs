//! Row codec: document encode/decode, projection, parameter binding, and
//! driver error mapping.
//!
//! This module is the single boundary where `rusqlite` errors become
//! [`DbError`] values.

use rusqlite::types::Value as SqlValue;
use rusqlite::Row;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use doclite_core::document::{json_type_name, Document, ID_COLUMN};
use doclite_core::error::{DbError, Result};
use doclite_core::options::Projection;
use doclite_core::scalar::Scalar;
use doclite_core::schema::Schema;

/// A decoded row before it is typed: metadata plus the raw body object.
#[derive(Debug, Clone)]
pub(crate) struct RawDoc {
    pub id: String,
    pub body: Map<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RawDoc {
    /// Types the raw body, applying an optional projection first.
    pub(crate) fn into_document<T: DeserializeOwned>(
        mut self,
        projection: Option<&Projection>,
    ) -> Result<Document<T>> {
        if let Some(projection) = projection {
            apply_projection(&mut self.body, projection);
        }
        let data: T = serde_json::from_value(Value::Object(self.body))
            .map_err(|e| DbError::serialization(format!("failed to decode document body: {e}")))?;
        Ok(Document {
            id: self.id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            data,
        })
    }
}

/// Serializes a user body, stripping metadata keys so the id is never
/// duplicated inside `body`.
pub(crate) fn encode_body<T: Serialize>(schema: &Schema, data: &T) -> Result<Map<String, Value>> {
    let value = serde_json::to_value(data)
        .map_err(|e| DbError::serialization(format!("failed to encode document body: {e}")))?;
    let Value::Object(mut map) = value else {
        return Err(DbError::serialization(format!(
            "document must serialize to a JSON object, got {}",
            json_type_name(&value)
        )));
    };
    strip_meta_keys(schema, &mut map);
    Ok(map)
}

/// Removes `_id` and active timestamp columns from a body object.
pub(crate) fn strip_meta_keys(schema: &Schema, map: &mut Map<String, Value>) {
    map.remove(ID_COLUMN);
    if let Some(created) = schema.timestamps().created_column() {
        map.remove(created);
    }
    if let Some(updated) = schema.timestamps().updated_column() {
        map.remove(updated);
    }
}

/// Decodes one row of the standard select column list:
/// `_id, json(body), [created, updated]`.
pub(crate) fn decode_raw(schema: &Schema, row: &Row<'_>) -> Result<RawDoc> {
    let id: String = row.get(0).map_err(|e| map_sqlite_err(e, None))?;
    let body_text: String = row.get(1).map_err(|e| map_sqlite_err(e, None))?;
    let (created_at, updated_at) = if schema.timestamps().enabled() {
        (
            row.get(2).map_err(|e| map_sqlite_err(e, None))?,
            row.get(3).map_err(|e| map_sqlite_err(e, None))?,
        )
    } else {
        (0, 0)
    };
    let value: Value = serde_json::from_str(&body_text)
        .map_err(|e| DbError::serialization(format!("stored body is not valid JSON: {e}")))?;
    let Value::Object(body) = value else {
        return Err(DbError::serialization(format!(
            "stored body is not a JSON object, got {}",
            json_type_name(&value)
        )));
    };
    Ok(RawDoc {
        id,
        body,
        created_at,
        updated_at,
    })
}

/// Post-read projection. `_id` and timestamps live outside the body, so
/// `Select` keeps them implicitly and `Omit` cannot touch them.
pub(crate) fn apply_projection(body: &mut Map<String, Value>, projection: &Projection) {
    match projection {
        Projection::Select(fields) => {
            body.retain(|key, _| fields.iter().any(|f| f == key));
        }
        Projection::Omit(fields) => {
            for field in fields {
                if field != ID_COLUMN {
                    body.remove(field);
                }
            }
        }
    }
}

/// The column list matching [`decode_raw`].
pub(crate) fn select_columns(schema: &Schema) -> String {
    let mut columns = vec![ID_COLUMN.to_owned(), "json(body) AS body".to_owned()];
    if let Some(created) = schema.timestamps().created_column() {
        columns.push(created.to_owned());
    }
    if let Some(updated) = schema.timestamps().updated_column() {
        columns.push(updated.to_owned());
    }
    columns.join(", ")
}

pub(crate) fn quote_table(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Converts a scalar parameter into a driver value. Booleans bind as 0/1.
pub(crate) fn scalar_to_sql(scalar: &Scalar) -> SqlValue {
    match scalar {
        Scalar::Null => SqlValue::Null,
        Scalar::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Scalar::Int(i) => SqlValue::Integer(*i),
        Scalar::Real(r) => SqlValue::Real(*r),
        Scalar::Text(s) => SqlValue::Text(s.clone()),
    }
}

// ---------------------------------------------------------------------------
// Driver error mapping
// ---------------------------------------------------------------------------

/// Maps a driver error into the [`DbError`] taxonomy.
pub(crate) fn map_sqlite_err(e: rusqlite::Error, sql: Option<&str>) -> DbError {
    match e {
        rusqlite::Error::SqliteFailure(ffi, message) => {
            let text = message.unwrap_or_else(|| ffi.to_string());
            match ffi.code {
                rusqlite::ErrorCode::ConstraintViolation => DbError::Constraint { message: text },
                rusqlite::ErrorCode::CannotOpen | rusqlite::ErrorCode::NotADatabase => {
                    DbError::Connection { message: text }
                }
                _ => DbError::Database {
                    message: text,
                    driver_code: Some(ffi.extended_code),
                },
            }
        }
        rusqlite::Error::InvalidQuery => DbError::Query {
            message: "invalid query".into(),
            sql: sql.map(str::to_owned),
        },
        rusqlite::Error::SqlInputError { msg, sql, .. } => DbError::Query {
            message: msg,
            sql: Some(sql),
        },
        other => DbError::Database {
            message: other.to_string(),
            driver_code: None,
        },
    }
}

/// Maps a write error, turning unique-constraint failures into
/// [`DbError::UniqueConstraint`] with the offending field and value.
pub(crate) fn map_write_err(
    e: rusqlite::Error,
    table: &str,
    id: &str,
    body: &Map<String, Value>,
) -> DbError {
    if let rusqlite::Error::SqliteFailure(ffi, Some(message)) = &e {
        let unique = ffi.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            || ffi.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY;
        if unique {
            if let Some(fields) = unique_fields_from_message(message, table) {
                let value = unique_value(&fields, id, body);
                return DbError::unique(fields.join(", "), value);
            }
        }
    }
    map_sqlite_err(e, None)
}

/// Extracts field names from "UNIQUE constraint failed: table._col, ...",
/// stripping the table prefix and the generated-column underscore.
fn unique_fields_from_message(message: &str, table: &str) -> Option<Vec<String>> {
    let rest = message.split("UNIQUE constraint failed: ").nth(1)?;
    let prefix = format!("{table}.");
    let fields: Vec<String> = rest
        .split(',')
        .map(|column| {
            let column = column.trim();
            let column = column.strip_prefix(&prefix).unwrap_or(column);
            if column == ID_COLUMN {
                column.to_owned()
            } else {
                column.strip_prefix('_').unwrap_or(column).to_owned()
            }
        })
        .filter(|c| !c.is_empty())
        .collect();
    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

fn unique_value(fields: &[String], id: &str, body: &Map<String, Value>) -> String {
    let first = &fields[0];
    if first == ID_COLUMN {
        return id.to_owned();
    }
    match body.get(first.as_str()) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doclite_core::schema::{FieldDef, SqlType};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::builder()
            .field(FieldDef::new("email", SqlType::Text).unique())
            .build()
            .unwrap()
    }

    #[test]
    fn encode_strips_meta_keys() {
        #[derive(Serialize)]
        struct Doc {
            #[serde(rename = "_id")]
            id: String,
            #[serde(rename = "createdAt")]
            created: i64,
            name: String,
        }
        let body = encode_body(
            &schema(),
            &Doc {
                id: "x".into(),
                created: 9,
                name: "Ada".into(),
            },
        )
        .unwrap();
        assert_eq!(body.len(), 1);
        assert_eq!(body.get("name"), Some(&json!("Ada")));
    }

    #[test]
    fn encode_rejects_non_objects() {
        let err = encode_body(&schema(), &42).unwrap_err();
        assert!(matches!(err, DbError::Serialization { .. }));
    }

    #[test]
    fn projection_select_keeps_only_listed_fields() {
        let mut body = json!({"a": 1, "b": 2, "c": 3}).as_object().unwrap().clone();
        apply_projection(&mut body, &Projection::Select(vec!["a".into(), "c".into()]));
        assert_eq!(Value::Object(body), json!({"a": 1, "c": 3}));
    }

    #[test]
    fn projection_omit_removes_listed_fields_but_never_id() {
        let mut body = json!({"a": 1, "b": 2}).as_object().unwrap().clone();
        apply_projection(
            &mut body,
            &Projection::Omit(vec!["b".into(), "_id".into()]),
        );
        assert_eq!(Value::Object(body), json!({"a": 1}));
    }

    #[test]
    fn unique_message_parsing_strips_prefixes() {
        let fields =
            unique_fields_from_message("UNIQUE constraint failed: users._email", "users").unwrap();
        assert_eq!(fields, vec!["email"]);
        let compound = unique_fields_from_message(
            "UNIQUE constraint failed: users._org, users._email",
            "users",
        )
        .unwrap();
        assert_eq!(compound, vec!["org", "email"]);
        let pk = unique_fields_from_message("UNIQUE constraint failed: users._id", "users").unwrap();
        assert_eq!(pk, vec!["_id"]);
        assert!(unique_fields_from_message("no such table", "users").is_none());
    }

    #[test]
    fn unique_value_renders_strings_raw() {
        let body = json!({"email": "a@x", "age": 7}).as_object().unwrap().clone();
        assert_eq!(unique_value(&["email".into()], "id0", &body), "a@x");
        assert_eq!(unique_value(&["age".into()], "id0", &body), "7");
        assert_eq!(unique_value(&["_id".into()], "id0", &body), "id0");
    }

    #[test]
    fn scalars_bind_with_their_types() {
        assert_eq!(scalar_to_sql(&Scalar::Bool(true)), SqlValue::Integer(1));
        assert_eq!(scalar_to_sql(&Scalar::Int(5)), SqlValue::Integer(5));
        assert_eq!(
            scalar_to_sql(&Scalar::Text("5".into())),
            SqlValue::Text("5".into())
        );
        assert_eq!(scalar_to_sql(&Scalar::Null), SqlValue::Null);
    }
}
