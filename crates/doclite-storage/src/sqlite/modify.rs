//! Connection-level write operations: update, replace, delete, and the
//! atomic find-and-modify family. Callers wrap these in a transaction when
//! one is not already active.

use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use doclite_core::document::{Document, Patch, ID_COLUMN};
use doclite_core::error::{DbError, Result};
use doclite_core::filter::{CompareOp, FieldOp, Filter};
use doclite_core::id::new_id_at;
use doclite_core::options::{FindOptions, SortOrder};
use doclite_core::scalar::Scalar;
use doclite_core::schema::Schema;
use doclite_query::Translator;

use crate::cancel::CancelToken;
use crate::sqlite::collection::CollectionCore;
use crate::sqlite::documents::{
    find_by_id_raw, insert_row_on_conn, query_raw, update_row_on_conn,
};
use crate::sqlite::rows::{encode_body, map_sqlite_err, quote_table, scalar_to_sql, RawDoc};

/// Result of one find-and-modify style operation.
pub(crate) struct ModifyOutcome<T> {
    pub matched: bool,
    pub upserted: bool,
    pub before: Option<Document<T>>,
    pub after: Option<Document<T>>,
}

impl<T> ModifyOutcome<T> {
    fn miss() -> Self {
        Self {
            matched: false,
            upserted: false,
            before: None,
            after: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Target selection
// ---------------------------------------------------------------------------

/// Finds the first row matching the filter, honoring the sort.
fn find_target_raw<T>(
    conn: &Connection,
    core: &CollectionCore<T>,
    filter: &Filter,
    sort: &[(String, SortOrder)],
) -> Result<Option<RawDoc>> {
    if let Some(id) = filter.as_id_lookup() {
        return find_by_id_raw(conn, &core.name, &core.schema, id);
    }
    let mut options = FindOptions::new().limit(1);
    options.sort = sort.to_vec();
    let translator = Translator::with_cache(&core.schema, &core.cache);
    let query = translator.select(&core.name, filter, &options, None)?;
    Ok(query_raw(conn, &core.schema, &query, None)?.into_iter().next())
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

pub(crate) fn update_one_on_conn<T: Serialize + DeserializeOwned>(
    conn: &Connection,
    core: &CollectionCore<T>,
    filter: &Filter,
    patch: &Patch,
    upsert: bool,
    sort: &[(String, SortOrder)],
    now: i64,
) -> Result<ModifyOutcome<T>> {
    let Some(old) = find_target_raw(conn, core, filter, sort)? else {
        if upsert {
            let mut payload = Map::new();
            patch.apply_to(&mut payload);
            let doc = upsert_insert(conn, core, filter, payload, now)?;
            return Ok(ModifyOutcome {
                matched: false,
                upserted: true,
                before: None,
                after: Some(doc),
            });
        }
        return Ok(ModifyOutcome::miss());
    };

    let mut merged = old.body.clone();
    patch.apply_to(&mut merged);
    let (validated, final_body) = validate_body(core, merged)?;
    let body_json = serde_json::to_string(&final_body)?;
    update_row_on_conn(
        conn,
        &core.name,
        &core.schema,
        &old.id,
        &body_json,
        now,
        &final_body,
    )?;

    let created_at = old.created_at;
    let id = old.id.clone();
    let before = old.into_document(None)?;
    Ok(ModifyOutcome {
        matched: true,
        upserted: false,
        before: Some(before),
        after: Some(Document {
            id,
            created_at,
            updated_at: effective_now(&core.schema, now),
            data: validated,
        }),
    })
}

pub(crate) fn update_many_on_conn<T: Serialize + DeserializeOwned>(
    conn: &Connection,
    core: &CollectionCore<T>,
    filter: &Filter,
    patch: &Patch,
    now: i64,
    signal: Option<&CancelToken>,
) -> Result<(usize, usize)> {
    let translator = Translator::with_cache(&core.schema, &core.cache);
    let query = translator.select(&core.name, filter, &FindOptions::new(), None)?;
    let targets = query_raw(conn, &core.schema, &query, signal)?;
    let matched = targets.len();
    let mut modified = 0usize;
    for old in targets {
        let mut merged = old.body;
        patch.apply_to(&mut merged);
        let (_, final_body) = validate_body::<T>(core, merged)?;
        let body_json = serde_json::to_string(&final_body)?;
        if update_row_on_conn(
            conn,
            &core.name,
            &core.schema,
            &old.id,
            &body_json,
            now,
            &final_body,
        )? {
            modified += 1;
        }
    }
    Ok((matched, modified))
}

// ---------------------------------------------------------------------------
// Replace
// ---------------------------------------------------------------------------

pub(crate) fn replace_one_on_conn<T: Serialize + DeserializeOwned>(
    conn: &Connection,
    core: &CollectionCore<T>,
    filter: &Filter,
    replacement: &T,
    upsert: bool,
    sort: &[(String, SortOrder)],
    now: i64,
) -> Result<ModifyOutcome<T>> {
    let payload = encode_body(&core.schema, replacement)?;
    let Some(old) = find_target_raw(conn, core, filter, sort)? else {
        if upsert {
            let doc = upsert_insert(conn, core, filter, payload, now)?;
            return Ok(ModifyOutcome {
                matched: false,
                upserted: true,
                before: None,
                after: Some(doc),
            });
        }
        return Ok(ModifyOutcome::miss());
    };

    let (validated, final_body) = validate_body(core, payload)?;
    let body_json = serde_json::to_string(&final_body)?;
    update_row_on_conn(
        conn,
        &core.name,
        &core.schema,
        &old.id,
        &body_json,
        now,
        &final_body,
    )?;

    let created_at = old.created_at;
    let id = old.id.clone();
    let before = old.into_document(None)?;
    Ok(ModifyOutcome {
        matched: true,
        upserted: false,
        before: Some(before),
        after: Some(Document {
            id,
            created_at,
            updated_at: effective_now(&core.schema, now),
            data: validated,
        }),
    })
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

pub(crate) fn delete_one_on_conn<T>(
    conn: &Connection,
    core: &CollectionCore<T>,
    filter: &Filter,
) -> Result<bool> {
    if let Some(id) = filter.as_id_lookup() {
        let sql = format!("DELETE FROM {} WHERE _id = ?", quote_table(&core.name));
        let changed = conn
            .execute(&sql, rusqlite::params![id])
            .map_err(|e| map_sqlite_err(e, Some(&sql)))?;
        return Ok(changed > 0);
    }
    let translator = Translator::with_cache(&core.schema, &core.cache);
    let subquery = translator.select_ids(&core.name, filter, &FindOptions::new().limit(1))?;
    let sql = format!(
        "DELETE FROM {} WHERE _id IN ({})",
        quote_table(&core.name),
        subquery.sql
    );
    let changed = conn
        .execute(
            &sql,
            rusqlite::params_from_iter(subquery.params.iter().map(scalar_to_sql)),
        )
        .map_err(|e| map_sqlite_err(e, Some(&sql)))?;
    Ok(changed > 0)
}

pub(crate) fn delete_many_on_conn<T>(
    conn: &Connection,
    core: &CollectionCore<T>,
    filter: &Filter,
) -> Result<usize> {
    let translator = Translator::with_cache(&core.schema, &core.cache);
    let query = translator.delete(&core.name, filter)?;
    conn.execute(
        &query.sql,
        rusqlite::params_from_iter(query.params.iter().map(scalar_to_sql)),
    )
    .map_err(|e| map_sqlite_err(e, Some(&query.sql)))
}

pub(crate) fn find_one_and_delete_on_conn<T: DeserializeOwned>(
    conn: &Connection,
    core: &CollectionCore<T>,
    filter: &Filter,
    sort: &[(String, SortOrder)],
) -> Result<Option<Document<T>>> {
    let Some(raw) = find_target_raw(conn, core, filter, sort)? else {
        return Ok(None);
    };
    let sql = format!("DELETE FROM {} WHERE _id = ?", quote_table(&core.name));
    conn.execute(&sql, rusqlite::params![raw.id])
        .map_err(|e| map_sqlite_err(e, Some(&sql)))?;
    Ok(Some(raw.into_document(None)?))
}

// ---------------------------------------------------------------------------
// Upsert
// ---------------------------------------------------------------------------

/// Inserts the merge of the filter's equality literals and the payload.
/// Non-equality filter terms only affect the lookup, never the new body.
fn upsert_insert<T: Serialize + DeserializeOwned>(
    conn: &Connection,
    core: &CollectionCore<T>,
    filter: &Filter,
    payload: Map<String, Value>,
    now: i64,
) -> Result<Document<T>> {
    let mut body = Map::new();
    let mut id_literal = None;
    collect_eq_literals(filter, &core.schema, &mut body, &mut id_literal);
    for (key, value) in payload {
        body.insert(key, value);
    }
    let (validated, final_body) = validate_body(core, body)?;
    let body_json = serde_json::to_string(&final_body)?;
    let id = id_literal.unwrap_or_else(|| new_id_at(now));
    insert_row_on_conn(
        conn,
        &core.name,
        &core.schema,
        &id,
        &body_json,
        now,
        &final_body,
    )?;
    let stamp = effective_now(&core.schema, now);
    Ok(Document {
        id,
        created_at: stamp,
        updated_at: stamp,
        data: validated,
    })
}

fn collect_eq_literals(
    filter: &Filter,
    schema: &Schema,
    out: &mut Map<String, Value>,
    id_out: &mut Option<String>,
) {
    match filter {
        Filter::And(inner) => {
            for f in inner {
                collect_eq_literals(f, schema, out, id_out);
            }
        }
        Filter::Field {
            name,
            op: FieldOp::Cmp(CompareOp::Eq(value)),
        } => {
            if name == ID_COLUMN {
                if let Scalar::Text(id) = value {
                    *id_out = Some(id.clone());
                }
            } else if !schema.is_meta_column(name) && !name.contains('.') {
                out.insert(name.clone(), value.to_json());
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Shared body validation
// ---------------------------------------------------------------------------

/// Types a candidate body, runs the collection validator, and overlays the
/// validated fields back. Keys the document carries beyond the typed shape
/// survive untouched.
fn validate_body<T: Serialize + DeserializeOwned>(
    core: &CollectionCore<T>,
    merged: Map<String, Value>,
) -> Result<(T, Map<String, Value>)> {
    let candidate: T = serde_json::from_value(Value::Object(merged.clone()))
        .map_err(|e| DbError::serialization(format!("merged document is malformed: {e}")))?;
    let validated = core.validate_data(candidate)?;
    let mut final_body = merged;
    for (key, value) in encode_body(&core.schema, &validated)? {
        final_body.insert(key, value);
    }
    Ok((validated, final_body))
}

/// Timestamps read as 0 when the collection keeps none.
fn effective_now(schema: &Schema, now: i64) -> i64 {
    if schema.timestamps().enabled() {
        now
    } else {
        0
    }
}
