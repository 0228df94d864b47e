//! Schema model: field definitions, compound indexes, timestamp policy.
//!
//! Schemas are immutable value types validated at build time. The table
//! builder and the query translator both work off the same [`Schema`], which
//! keeps generated columns and field resolution aligned.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{BODY_COLUMN, CREATED_AT_COLUMN, ID_COLUMN, UPDATED_AT_COLUMN};
use crate::error::DbError;

/// SQLite column affinity for an indexed field's generated column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SqlType {
    Text,
    Integer,
    Real,
    Numeric,
    Blob,
    Boolean,
}

impl SqlType {
    /// The declared type used in DDL. Booleans store as INTEGER 0/1.
    pub fn ddl(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer | Self::Boolean => "INTEGER",
            Self::Real => "REAL",
            Self::Numeric => "NUMERIC",
            Self::Blob => "BLOB",
        }
    }
}

/// Definition of one user field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name within the document body.
    pub name: String,
    /// JSON path within the body; defaults to `$.<name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,
    /// Column affinity of the generated column.
    pub sql_type: SqlType,
    /// Whether the field is projected into a generated column and indexed.
    #[serde(default)]
    pub indexed: bool,
    /// Whether values must be unique across documents (implies indexed).
    #[serde(default)]
    pub unique: bool,
    /// Whether the field may be absent or null.
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Default value recorded for documentation and upsert seeding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_true() -> bool {
    true
}

impl FieldDef {
    /// Creates a field definition with the given name and type.
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            json_path: None,
            sql_type,
            indexed: false,
            unique: false,
            nullable: true,
            default: None,
        }
    }

    /// Marks the field as indexed.
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Marks the field as unique (and therefore indexed).
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self.indexed = true;
        self
    }

    /// Marks the field as non-nullable.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Overrides the JSON path extracted into the generated column.
    pub fn json_path(mut self, path: impl Into<String>) -> Self {
        self.json_path = Some(path.into());
        self
    }

    /// Records a default value.
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// The effective JSON path for extraction.
    pub fn path(&self) -> String {
        self.json_path
            .clone()
            .unwrap_or_else(|| format!("$.{}", self.name))
    }

    /// The generated column backing this field when indexed.
    pub fn generated_column(&self) -> String {
        format!("_{}", self.name)
    }
}

/// A named index over several indexed fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundIndex {
    pub name: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl CompoundIndex {
    /// Creates a non-unique compound index.
    pub fn new(name: impl Into<String>, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Marks the index as unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Whether and how a collection maintains timestamp columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimestampPolicy {
    /// Maintain `created_at`/`updated_at` columns with the given names.
    Enabled {
        created_at: String,
        updated_at: String,
    },
    /// No timestamp columns; document timestamps read as 0.
    Disabled,
}

impl Default for TimestampPolicy {
    fn default() -> Self {
        Self::Enabled {
            created_at: CREATED_AT_COLUMN.to_owned(),
            updated_at: UPDATED_AT_COLUMN.to_owned(),
        }
    }
}

impl TimestampPolicy {
    /// Returns `true` when timestamp columns are maintained.
    pub fn enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }

    /// The creation-timestamp column, when enabled.
    pub fn created_column(&self) -> Option<&str> {
        match self {
            Self::Enabled { created_at, .. } => Some(created_at),
            Self::Disabled => None,
        }
    }

    /// The update-timestamp column, when enabled.
    pub fn updated_column(&self) -> Option<&str> {
        match self {
            Self::Enabled { updated_at, .. } => Some(updated_at),
            Self::Disabled => None,
        }
    }
}

/// An immutable, validated collection schema.
///
/// Structural equality (`PartialEq`) governs whether a re-registration of a
/// collection is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<FieldDef>,
    compound_indexes: Vec<CompoundIndex>,
    timestamps: TimestampPolicy,
}

impl Schema {
    /// Starts building a schema.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// An empty schema: no declared fields, default timestamps.
    pub fn empty() -> Self {
        Self {
            fields: Vec::new(),
            compound_indexes: Vec::new(),
            timestamps: TimestampPolicy::default(),
        }
    }

    /// All declared fields.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// All compound indexes.
    pub fn compound_indexes(&self) -> &[CompoundIndex] {
        &self.compound_indexes
    }

    /// The timestamp policy.
    pub fn timestamps(&self) -> &TimestampPolicy {
        &self.timestamps
    }

    /// Looks up a declared field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Returns `true` if the field is declared and indexed.
    pub fn is_indexed(&self, name: &str) -> bool {
        self.field(name).is_some_and(|f| f.indexed)
    }

    /// Returns `true` if the name refers to a metadata column
    /// (`_id` or an active timestamp column).
    pub fn is_meta_column(&self, name: &str) -> bool {
        name == ID_COLUMN
            || self.timestamps.created_column() == Some(name)
            || self.timestamps.updated_column() == Some(name)
    }

    /// The declared fields that carry generated columns.
    pub fn indexed_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.indexed)
    }
}

/// Builder for [`Schema`]; `build` performs all structural validation.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    fields: Vec<FieldDef>,
    compound_indexes: Vec<CompoundIndex>,
    timestamps: Option<TimestampPolicy>,
}

/// Schema construction failures.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("duplicate field name: {0}")]
    DuplicateField(String),

    #[error("field name {0:?} is not a valid identifier")]
    InvalidFieldName(String),

    #[error("field name {0} is reserved")]
    ReservedName(String),

    #[error("field {0} is unique but not indexed")]
    UniqueNotIndexed(String),

    #[error("generated column _{0} collides with field _{0}")]
    GeneratedColumnCollision(String),

    #[error("compound index {index} references unknown field {field}")]
    UnknownCompoundField { index: String, field: String },

    #[error("compound index {index} references non-indexed field {field}")]
    CompoundFieldNotIndexed { index: String, field: String },

    #[error("compound index {0} has no fields")]
    EmptyCompoundIndex(String),

    #[error("duplicate index name: {0}")]
    DuplicateIndexName(String),

    #[error("timestamp columns must differ, both named {0}")]
    TimestampColumnClash(String),
}

impl From<SchemaError> for DbError {
    fn from(e: SchemaError) -> Self {
        DbError::schema(e.to_string())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl SchemaBuilder {
    /// Adds a field definition.
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Adds a compound index.
    pub fn compound_index(mut self, index: CompoundIndex) -> Self {
        self.compound_indexes.push(index);
        self
    }

    /// Overrides the timestamp policy.
    pub fn timestamps(mut self, policy: TimestampPolicy) -> Self {
        self.timestamps = Some(policy);
        self
    }

    /// Disables timestamp columns.
    pub fn without_timestamps(mut self) -> Self {
        self.timestamps = Some(TimestampPolicy::Disabled);
        self
    }

    /// Validates and produces the schema.
    pub fn build(self) -> Result<Schema, SchemaError> {
        let timestamps = self.timestamps.unwrap_or_default();

        if let TimestampPolicy::Enabled {
            created_at,
            updated_at,
        } = &timestamps
        {
            if created_at == updated_at {
                return Err(SchemaError::TimestampColumnClash(created_at.clone()));
            }
        }

        let mut reserved: Vec<&str> = vec![ID_COLUMN, BODY_COLUMN, CREATED_AT_COLUMN, UPDATED_AT_COLUMN];
        if let Some(c) = timestamps.created_column() {
            reserved.push(c);
        }
        if let Some(u) = timestamps.updated_column() {
            reserved.push(u);
        }

        for (i, field) in self.fields.iter().enumerate() {
            if !is_identifier(&field.name) {
                return Err(SchemaError::InvalidFieldName(field.name.clone()));
            }
            if reserved.contains(&field.name.as_str()) {
                return Err(SchemaError::ReservedName(field.name.clone()));
            }
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(SchemaError::DuplicateField(field.name.clone()));
            }
            if field.unique && !field.indexed {
                return Err(SchemaError::UniqueNotIndexed(field.name.clone()));
            }
            // A field named `_x` would collide with the generated column of
            // an indexed field named `x`.
            if field.indexed {
                let generated = field.generated_column();
                if self.fields.iter().any(|f| f.name == generated) {
                    return Err(SchemaError::GeneratedColumnCollision(field.name.clone()));
                }
            }
        }

        for (i, index) in self.compound_indexes.iter().enumerate() {
            if index.fields.is_empty() {
                return Err(SchemaError::EmptyCompoundIndex(index.name.clone()));
            }
            if self.compound_indexes[..i].iter().any(|x| x.name == index.name) {
                return Err(SchemaError::DuplicateIndexName(index.name.clone()));
            }
            for field in &index.fields {
                match self.fields.iter().find(|f| &f.name == field) {
                    None => {
                        return Err(SchemaError::UnknownCompoundField {
                            index: index.name.clone(),
                            field: field.clone(),
                        });
                    }
                    Some(def) if !def.indexed => {
                        return Err(SchemaError::CompoundFieldNotIndexed {
                            index: index.name.clone(),
                            field: field.clone(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(Schema {
            fields: self.fields,
            compound_indexes: self.compound_indexes,
            timestamps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn name_field() -> FieldDef {
        FieldDef::new("name", SqlType::Text).indexed()
    }

    #[test]
    fn builds_a_minimal_schema() {
        let schema = Schema::builder()
            .field(name_field())
            .field(FieldDef::new("age", SqlType::Integer))
            .build()
            .unwrap();
        assert!(schema.is_indexed("name"));
        assert!(!schema.is_indexed("age"));
        assert!(!schema.is_indexed("missing"));
        assert!(schema.timestamps().enabled());
    }

    #[test]
    fn unique_implies_indexed_via_builder() {
        let field = FieldDef::new("email", SqlType::Text).unique();
        assert!(field.indexed);
    }

    #[test]
    fn rejects_duplicate_fields() {
        let err = Schema::builder()
            .field(name_field())
            .field(FieldDef::new("name", SqlType::Integer))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateField(f) if f == "name"));
    }

    #[test]
    fn rejects_reserved_names() {
        for reserved in ["_id", "body", "createdAt", "updatedAt"] {
            let err = Schema::builder()
                .field(FieldDef::new(reserved, SqlType::Text))
                .build()
                .unwrap_err();
            assert!(matches!(err, SchemaError::ReservedName(_)), "{reserved}");
        }
    }

    #[test]
    fn rejects_custom_timestamp_names_as_fields() {
        let err = Schema::builder()
            .timestamps(TimestampPolicy::Enabled {
                created_at: "inserted".into(),
                updated_at: "touched".into(),
            })
            .field(FieldDef::new("touched", SqlType::Integer))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::ReservedName(f) if f == "touched"));
    }

    #[test]
    fn rejects_unique_without_index() {
        let mut field = FieldDef::new("email", SqlType::Text);
        field.unique = true;
        let err = Schema::builder().field(field).build().unwrap_err();
        assert!(matches!(err, SchemaError::UniqueNotIndexed(_)));
    }

    #[test]
    fn rejects_generated_column_collision() {
        let err = Schema::builder()
            .field(name_field())
            .field(FieldDef::new("_name", SqlType::Text))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::GeneratedColumnCollision(f) if f == "name"));
    }

    #[test]
    fn rejects_dotted_field_names() {
        let err = Schema::builder()
            .field(FieldDef::new("a.b", SqlType::Text))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidFieldName(_)));
    }

    #[test]
    fn compound_index_fields_must_exist_and_be_indexed() {
        let missing = Schema::builder()
            .field(name_field())
            .compound_index(CompoundIndex::new("idx_pair", ["name", "ghost"]))
            .build()
            .unwrap_err();
        assert!(matches!(missing, SchemaError::UnknownCompoundField { .. }));

        let unindexed = Schema::builder()
            .field(name_field())
            .field(FieldDef::new("age", SqlType::Integer))
            .compound_index(CompoundIndex::new("idx_pair", ["name", "age"]))
            .build()
            .unwrap_err();
        assert!(matches!(unindexed, SchemaError::CompoundFieldNotIndexed { .. }));
    }

    #[test]
    fn rejects_duplicate_index_names() {
        let err = Schema::builder()
            .field(name_field())
            .compound_index(CompoundIndex::new("idx", ["name"]))
            .compound_index(CompoundIndex::new("idx", ["name"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateIndexName(_)));
    }

    #[test]
    fn structural_equality_ignores_nothing() {
        let a = Schema::builder().field(name_field()).build().unwrap();
        let b = Schema::builder().field(name_field()).build().unwrap();
        let c = Schema::builder()
            .field(FieldDef::new("name", SqlType::Text))
            .build()
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c); // indexed flag differs
    }

    #[test]
    fn path_defaults_to_dollar_name() {
        let f = FieldDef::new("age", SqlType::Integer);
        assert_eq!(f.path(), "$.age");
        let custom = FieldDef::new("age", SqlType::Integer).json_path("$.profile.age");
        assert_eq!(custom.path(), "$.profile.age");
    }

    #[test]
    fn boolean_fields_store_as_integer() {
        assert_eq!(SqlType::Boolean.ddl(), "INTEGER");
    }
}
