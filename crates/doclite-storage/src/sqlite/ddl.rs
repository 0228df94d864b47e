//! DDL synthesis and idempotent application for collection tables.
//!
//! Each collection maps to one table: `_id` primary key, a JSONB `body`,
//! timestamp columns when enabled, and one virtual generated column per
//! indexed field. Pre-existing tables are verified against the requested
//! schema; drift is reported, never migrated.

use rusqlite::Connection;
use tracing::debug;

use doclite_core::error::{DbError, Result};
use doclite_core::schema::Schema;

use crate::sqlite::rows::{map_sqlite_err, quote_table};

/// Creates the table and indexes if missing, or verifies an existing table
/// against the schema.
pub(crate) fn apply_schema(conn: &Connection, table: &str, schema: &Schema) -> Result<()> {
    if table_exists(conn, table)? {
        verify_table(conn, table, schema)?;
    } else {
        let sql = create_table_sql(table, schema);
        conn.execute_batch(&sql).map_err(|e| DbError::Database {
            message: format!("failed to create table {table}: {e}"),
            driver_code: None,
        })?;
        debug!(table, "created collection table");
    }
    for sql in index_sql(table, schema) {
        conn.execute_batch(&sql).map_err(|e| DbError::Database {
            message: format!("failed to create index on {table}: {e}"),
            driver_code: None,
        })?;
    }
    Ok(())
}

/// The CREATE TABLE statement for a schema.
pub(crate) fn create_table_sql(table: &str, schema: &Schema) -> String {
    let mut columns = vec![
        "_id TEXT PRIMARY KEY NOT NULL".to_owned(),
        "body BLOB NOT NULL".to_owned(),
    ];
    if let Some(created) = schema.timestamps().created_column() {
        columns.push(format!("{created} INTEGER NOT NULL"));
    }
    if let Some(updated) = schema.timestamps().updated_column() {
        columns.push(format!("{updated} INTEGER NOT NULL"));
    }
    for field in schema.indexed_fields() {
        columns.push(format!(
            "{} {} GENERATED ALWAYS AS (jsonb_extract(body, '{}')) VIRTUAL",
            field.generated_column(),
            field.sql_type.ddl(),
            field.path().replace('\'', "''"),
        ));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote_table(table),
        columns.join(",\n    ")
    )
}

/// One CREATE INDEX statement per indexed field plus one per compound index.
pub(crate) fn index_sql(table: &str, schema: &Schema) -> Vec<String> {
    let mut statements = Vec::new();
    for field in schema.indexed_fields() {
        let unique = if field.unique { "UNIQUE " } else { "" };
        statements.push(format!(
            "CREATE {unique}INDEX IF NOT EXISTS \"idx_{table}_{}\" ON {} ({})",
            field.name,
            quote_table(table),
            field.generated_column(),
        ));
    }
    for index in schema.compound_indexes() {
        let unique = if index.unique { "UNIQUE " } else { "" };
        let columns: Vec<String> = index.fields.iter().map(|f| format!("_{f}")).collect();
        statements.push(format!(
            "CREATE {unique}INDEX IF NOT EXISTS \"{}\" ON {} ({})",
            index.name,
            quote_table(table),
            columns.join(", "),
        ));
    }
    statements
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")
        .map_err(|e| map_sqlite_err(e, None))?;
    let mut rows = stmt
        .query(rusqlite::params![table])
        .map_err(|e| map_sqlite_err(e, None))?;
    Ok(rows.next().map_err(|e| map_sqlite_err(e, None))?.is_some())
}

struct ExistingColumn {
    name: String,
    decl_type: String,
    hidden: i64,
}

/// Compares an existing table's columns against the schema. Generated
/// columns must match exactly: missing, extra, or retyped columns are
/// schema drift, which this layer refuses to migrate.
fn verify_table(conn: &Connection, table: &str, schema: &Schema) -> Result<()> {
    let sql = format!("PRAGMA table_xinfo({})", quote_table(table));
    let mut stmt = conn.prepare(&sql).map_err(|e| map_sqlite_err(e, None))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ExistingColumn {
                name: row.get("name")?,
                decl_type: row.get("type")?,
                hidden: row.get("hidden")?,
            })
        })
        .map_err(|e| map_sqlite_err(e, None))?;

    let mut existing = Vec::new();
    for row in rows {
        existing.push(row.map_err(|e| map_sqlite_err(e, None))?);
    }

    let find = |name: &str| existing.iter().find(|c| c.name == name);

    if find("_id").is_none() || find("body").is_none() {
        return Err(DbError::schema(format!(
            "table {table} exists but lacks the _id/body columns"
        )));
    }
    for column in [
        schema.timestamps().created_column(),
        schema.timestamps().updated_column(),
    ]
    .into_iter()
    .flatten()
    {
        if find(column).is_none() {
            return Err(DbError::schema(format!(
                "table {table} lacks timestamp column {column}"
            )));
        }
    }

    // VIRTUAL generated columns report hidden = 2.
    for field in schema.indexed_fields() {
        let generated = field.generated_column();
        match find(&generated) {
            None => {
                return Err(DbError::schema(format!(
                    "table {table} lacks generated column {generated} for indexed field {}",
                    field.name
                )));
            }
            Some(column) if column.hidden != 2 => {
                return Err(DbError::schema(format!(
                    "column {generated} of table {table} is not a virtual generated column"
                )));
            }
            Some(column)
                if !column.decl_type.eq_ignore_ascii_case(field.sql_type.ddl()) =>
            {
                return Err(DbError::schema(format!(
                    "generated column {generated} of table {table} is declared {} but the schema requires {}",
                    column.decl_type,
                    field.sql_type.ddl()
                )));
            }
            Some(_) => {}
        }
    }

    for column in &existing {
        if column.hidden == 2
            && !schema
                .indexed_fields()
                .any(|f| f.generated_column() == column.name)
        {
            return Err(DbError::schema(format!(
                "table {table} carries generated column {} not present in the schema",
                column.name
            )));
        }
    }

    debug!(table, "existing table matches the requested schema");
    Ok(())
}
