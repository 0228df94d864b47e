//! Connection-level read and insert operations, shared between collection
//! handles and transaction-scoped collections.

use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use doclite_core::document::ID_COLUMN;
use doclite_core::error::{DbError, Result};
use doclite_core::filter::Filter;
use doclite_core::options::FindOptions;
use doclite_core::scalar::Scalar;
use doclite_core::schema::Schema;
use doclite_query::{CursorAnchor, CursorDirection, SqlQuery, Translator};

use crate::cancel::{checkpoint, CancelToken};
use crate::sqlite::collection::CollectionCore;
use crate::sqlite::rows::{
    decode_raw, map_sqlite_err, map_write_err, quote_table, scalar_to_sql, select_columns, RawDoc,
};

/// Rows between cancellation checks while draining a result set.
pub(crate) const ROW_BATCH: usize = 256;

// ---------------------------------------------------------------------------
// Primary-key path
// ---------------------------------------------------------------------------

pub(crate) fn find_by_id_raw(
    conn: &Connection,
    table: &str,
    schema: &Schema,
    id: &str,
) -> Result<Option<RawDoc>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE _id = ?",
        select_columns(schema),
        quote_table(table)
    );
    let mut stmt = conn.prepare(&sql).map_err(|e| map_sqlite_err(e, Some(&sql)))?;
    let mut rows = stmt
        .query(rusqlite::params![id])
        .map_err(|e| map_sqlite_err(e, Some(&sql)))?;
    match rows.next().map_err(|e| map_sqlite_err(e, None))? {
        Some(row) => Ok(Some(decode_raw(schema, row)?)),
        None => Ok(None),
    }
}

pub(crate) fn find_by_id_on_conn<T: DeserializeOwned>(
    conn: &Connection,
    core: &CollectionCore<T>,
    id: &str,
) -> Result<Option<doclite_core::Document<T>>> {
    match find_by_id_raw(conn, &core.name, &core.schema, id)? {
        Some(raw) => Ok(Some(raw.into_document(None)?)),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Filtered reads
// ---------------------------------------------------------------------------

pub(crate) fn find_on_conn<T: DeserializeOwned>(
    conn: &Connection,
    core: &CollectionCore<T>,
    filter: &Filter,
    options: &FindOptions,
    signal: Option<&CancelToken>,
) -> Result<Vec<doclite_core::Document<T>>> {
    options.validate()?;
    let anchor = resolve_cursor(conn, core, options)?;
    let translator = Translator::with_cache(&core.schema, &core.cache);
    let query = translator.select(&core.name, filter, options, anchor.as_ref())?;
    query_documents(conn, &core.schema, &query, options, signal)
}

pub(crate) fn find_one_on_conn<T: DeserializeOwned>(
    conn: &Connection,
    core: &CollectionCore<T>,
    filter: &Filter,
    options: &FindOptions,
    signal: Option<&CancelToken>,
) -> Result<Option<doclite_core::Document<T>>> {
    // The primary-key fast path bypasses the translator, but only when no
    // search constraint could narrow the match further.
    if options.search.is_none() && options.cursor.is_none() {
        if let Some(id) = filter.as_id_lookup() {
            return match find_by_id_raw(conn, &core.name, &core.schema, id)? {
                Some(raw) => Ok(Some(raw.into_document(options.projection.as_ref())?)),
                None => Ok(None),
            };
        }
    }
    let mut narrowed = options.clone();
    narrowed.limit = Some(1);
    narrowed.skip = None;
    Ok(find_on_conn(conn, core, filter, &narrowed, signal)?.into_iter().next())
}

pub(crate) fn count_on_conn<T>(
    conn: &Connection,
    core: &CollectionCore<T>,
    filter: &Filter,
) -> Result<i64> {
    let translator = Translator::with_cache(&core.schema, &core.cache);
    let query = translator.count(&core.name, filter)?;
    run_count(conn, &query)
}

pub(crate) fn estimated_count_on_conn<T>(
    conn: &Connection,
    core: &CollectionCore<T>,
) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}", quote_table(&core.name));
    run_count(
        conn,
        &SqlQuery {
            sql,
            params: Vec::new(),
        },
    )
}

fn run_count(conn: &Connection, query: &SqlQuery) -> Result<i64> {
    let mut stmt = conn
        .prepare(&query.sql)
        .map_err(|e| map_sqlite_err(e, Some(&query.sql)))?;
    let mut rows = stmt
        .query(rusqlite::params_from_iter(
            query.params.iter().map(scalar_to_sql),
        ))
        .map_err(|e| map_sqlite_err(e, Some(&query.sql)))?;
    match rows.next().map_err(|e| map_sqlite_err(e, None))? {
        Some(row) => row.get(0).map_err(|e| map_sqlite_err(e, None)),
        None => Ok(0),
    }
}

/// Distinct non-null values of one field, ascending, array-wise for
/// array-valued fields.
pub(crate) fn distinct_on_conn<T>(
    conn: &Connection,
    core: &CollectionCore<T>,
    field: &str,
    filter: &Filter,
    signal: Option<&CancelToken>,
) -> Result<Vec<Value>> {
    let translator = Translator::with_cache(&core.schema, &core.cache);
    let query = translator.distinct(&core.name, field, filter)?;
    let mut stmt = conn
        .prepare(&query.sql)
        .map_err(|e| map_sqlite_err(e, Some(&query.sql)))?;
    let mut rows = stmt
        .query(rusqlite::params_from_iter(
            query.params.iter().map(scalar_to_sql),
        ))
        .map_err(|e| map_sqlite_err(e, Some(&query.sql)))?;
    let mut values = Vec::new();
    let mut n = 0usize;
    while let Some(row) = rows.next().map_err(|e| map_sqlite_err(e, None))? {
        if n > 0 && n % ROW_BATCH == 0 {
            checkpoint(signal)?;
        }
        let rendered: String = row.get("value").map_err(|e| map_sqlite_err(e, None))?;
        let value: Value = serde_json::from_str(&rendered)
            .map_err(|e| DbError::serialization(format!("distinct value is not valid JSON: {e}")))?;
        values.push(value);
        n += 1;
    }
    Ok(values)
}

fn query_documents<T: DeserializeOwned>(
    conn: &Connection,
    schema: &Schema,
    query: &SqlQuery,
    options: &FindOptions,
    signal: Option<&CancelToken>,
) -> Result<Vec<doclite_core::Document<T>>> {
    let mut stmt = conn
        .prepare(&query.sql)
        .map_err(|e| map_sqlite_err(e, Some(&query.sql)))?;
    let mut rows = stmt
        .query(rusqlite::params_from_iter(
            query.params.iter().map(scalar_to_sql),
        ))
        .map_err(|e| map_sqlite_err(e, Some(&query.sql)))?;
    let mut documents = Vec::new();
    let mut n = 0usize;
    while let Some(row) = rows.next().map_err(|e| map_sqlite_err(e, None))? {
        if n > 0 && n % ROW_BATCH == 0 {
            checkpoint(signal)?;
        }
        let raw = decode_raw(schema, row)?;
        documents.push(raw.into_document(options.projection.as_ref())?);
        n += 1;
    }
    Ok(documents)
}

/// Collects matching rows undecoded, for read-modify-write operations.
pub(crate) fn query_raw(
    conn: &Connection,
    schema: &Schema,
    query: &SqlQuery,
    signal: Option<&CancelToken>,
) -> Result<Vec<RawDoc>> {
    let mut stmt = conn
        .prepare(&query.sql)
        .map_err(|e| map_sqlite_err(e, Some(&query.sql)))?;
    let mut rows = stmt
        .query(rusqlite::params_from_iter(
            query.params.iter().map(scalar_to_sql),
        ))
        .map_err(|e| map_sqlite_err(e, Some(&query.sql)))?;
    let mut raws = Vec::new();
    let mut n = 0usize;
    while let Some(row) = rows.next().map_err(|e| map_sqlite_err(e, None))? {
        if n > 0 && n % ROW_BATCH == 0 {
            checkpoint(signal)?;
        }
        raws.push(decode_raw(schema, row)?);
        n += 1;
    }
    Ok(raws)
}

// ---------------------------------------------------------------------------
// Cursor resolution
// ---------------------------------------------------------------------------

/// Fetches the cursor anchor row and extracts its sort-key values. A
/// missing anchor is a query error; silently falling back to id-only
/// comparison would return the wrong page.
fn resolve_cursor<T>(
    conn: &Connection,
    core: &CollectionCore<T>,
    options: &FindOptions,
) -> Result<Option<CursorAnchor>> {
    let Some(cursor) = &options.cursor else {
        return Ok(None);
    };
    let (id, direction) = match (&cursor.after, &cursor.before) {
        (Some(id), None) => (id, CursorDirection::After),
        (None, Some(id)) => (id, CursorDirection::Before),
        _ => {
            return Err(DbError::query(
                "cursor requires exactly one of after/before",
            ));
        }
    };
    let raw = find_by_id_raw(conn, &core.name, &core.schema, id)?
        .ok_or_else(|| DbError::query(format!("cursor anchor document not found: {id}")))?;
    let keys = options
        .sort
        .iter()
        .map(|(field, _)| anchor_key(&core.schema, &raw, field))
        .collect();
    Ok(Some(CursorAnchor {
        direction,
        id: id.clone(),
        keys,
    }))
}

fn anchor_key(schema: &Schema, raw: &RawDoc, field: &str) -> Scalar {
    if field == ID_COLUMN {
        return Scalar::Text(raw.id.clone());
    }
    if schema.timestamps().created_column() == Some(field) {
        return Scalar::Int(raw.created_at);
    }
    if schema.timestamps().updated_column() == Some(field) {
        return Scalar::Int(raw.updated_at);
    }
    let path = schema
        .field(field)
        .map(|f| f.path())
        .unwrap_or_else(|| format!("$.{field}"));
    lookup_path(&raw.body, &path)
        .and_then(Scalar::from_json)
        .unwrap_or(Scalar::Null)
}

/// Walks a `$.a.b` path through a body object.
fn lookup_path<'v>(body: &'v Map<String, Value>, path: &str) -> Option<&'v Value> {
    let rest = path.strip_prefix("$.")?;
    let mut segments = rest.split('.');
    let mut current = body.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// Inserts
// ---------------------------------------------------------------------------

/// Inserts one prepared row. `body_map` is only consulted for error context.
pub(crate) fn insert_row_on_conn(
    conn: &Connection,
    table: &str,
    schema: &Schema,
    id: &str,
    body_json: &str,
    now: i64,
    body_map: &Map<String, Value>,
) -> Result<()> {
    if let (Some(created), Some(updated)) = (
        schema.timestamps().created_column(),
        schema.timestamps().updated_column(),
    ) {
        let sql = format!(
            "INSERT INTO {} (_id, body, {created}, {updated}) VALUES (?, jsonb(?), ?, ?)",
            quote_table(table)
        );
        conn.execute(&sql, rusqlite::params![id, body_json, now, now])
            .map_err(|e| map_write_err(e, table, id, body_map))?;
    } else {
        let sql = format!(
            "INSERT INTO {} (_id, body) VALUES (?, jsonb(?))",
            quote_table(table)
        );
        conn.execute(&sql, rusqlite::params![id, body_json])
            .map_err(|e| map_write_err(e, table, id, body_map))?;
    }
    Ok(())
}

/// Rewrites a row's body and refreshes its update timestamp. Returns `true`
/// when the row existed.
pub(crate) fn update_row_on_conn(
    conn: &Connection,
    table: &str,
    schema: &Schema,
    id: &str,
    body_json: &str,
    now: i64,
    body_map: &Map<String, Value>,
) -> Result<bool> {
    let changed = if let Some(updated) = schema.timestamps().updated_column() {
        let sql = format!(
            "UPDATE {} SET body = jsonb(?), {updated} = ? WHERE _id = ?",
            quote_table(table)
        );
        conn.execute(&sql, rusqlite::params![body_json, now, id])
            .map_err(|e| map_write_err(e, table, id, body_map))?
    } else {
        let sql = format!(
            "UPDATE {} SET body = jsonb(?) WHERE _id = ?",
            quote_table(table)
        );
        conn.execute(&sql, rusqlite::params![body_json, id])
            .map_err(|e| map_write_err(e, table, id, body_map))?
    };
    Ok(changed > 0)
}
