//! Typed collection handles.
//!
//! A [`Collection`] is a cheap handle over shared per-collection state (the
//! schema, validator, template cache, and event bus) plus the database it
//! belongs to. Handles carry their own cancellation token and retry
//! override, so per-call settings are expressed by deriving a scoped handle:
//!
//! ```ignore
//! users.with_cancellation(token).insert_one(doc)?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use doclite_core::document::{Document, Patch, ID_COLUMN};
use doclite_core::error::{DbError, Result, TxStep};
use doclite_core::events::CollectionEvent;
use doclite_core::filter::Filter;
use doclite_core::id::{new_id_at, now_ms};
use doclite_core::options::{FindOptions, ReturnDocument, SortOrder};
use doclite_core::schema::Schema;
use doclite_core::validate::Validator;
use doclite_query::TemplateCache;

use crate::cancel::{checkpoint, CancelToken};
use crate::events::{EventBus, SubscriptionId};
use crate::retry::{run_with_retry, RetrySetting};
use crate::sqlite::database::DatabaseInner;
use crate::sqlite::rows::{encode_body, map_sqlite_err, quote_table};
use crate::sqlite::{documents, modify};

/// Shared state for one registered collection.
pub(crate) struct CollectionCore<T> {
    pub(crate) name: String,
    pub(crate) schema: Schema,
    pub(crate) cache: TemplateCache,
    pub(crate) validator: Option<Arc<dyn Validator<T>>>,
    pub(crate) events: EventBus<T>,
    pub(crate) retry: Option<RetrySetting>,
    pub(crate) dropped: AtomicBool,
}

impl<T> CollectionCore<T> {
    pub(crate) fn validate_data(&self, data: T) -> Result<T> {
        match &self.validator {
            Some(validator) => validator.validate(data).map_err(DbError::from),
            None => Ok(data),
        }
    }
}

/// Registration-time settings that are not part of the structural schema.
pub struct CollectionOptions<T> {
    /// Validator invoked before every insert, update, and replace.
    pub validator: Option<Arc<dyn Validator<T>>>,
    /// Collection-level retry override.
    pub retry: Option<RetrySetting>,
}

impl<T> Default for CollectionOptions<T> {
    fn default() -> Self {
        Self {
            validator: None,
            retry: None,
        }
    }
}

impl<T> CollectionOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validator(mut self, validator: impl Validator<T> + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn retry(mut self, setting: RetrySetting) -> Self {
        self.retry = Some(setting);
        self
    }
}

/// Options for [`Collection::insert_many`].
#[derive(Debug, Clone)]
pub struct InsertManyOptions {
    /// Ordered batches stop at the first failure and roll back; unordered
    /// batches collect failures and keep the successful rows.
    pub ordered: bool,
}

impl Default for InsertManyOptions {
    fn default() -> Self {
        Self { ordered: true }
    }
}

/// One failed document of an unordered batch insert.
#[derive(Debug)]
pub struct InsertFailure {
    /// Position in the input batch.
    pub index: usize,
    pub error: DbError,
}

/// Result of [`Collection::insert_many`].
#[derive(Debug)]
pub struct InsertManyResult<T> {
    pub documents: Vec<Document<T>>,
    pub inserted_count: usize,
    /// Per-document failures; empty in ordered mode (the batch errors out).
    pub failures: Vec<InsertFailure>,
}

/// Options for [`Collection::update_one`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Insert the merge of filter equality terms and the patch on no match.
    pub upsert: bool,
}

/// Result of [`Collection::update_many`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateManyResult {
    pub matched_count: usize,
    pub modified_count: usize,
}

/// Options for the find-and-modify family.
#[derive(Debug, Clone, Default)]
pub struct ModifyOptions {
    /// Pick which matching document is modified.
    pub sort: Vec<(String, SortOrder)>,
    /// Which snapshot to return; ignored by `find_one_and_delete`.
    pub return_document: ReturnDocument,
    /// Insert on no match; ignored by `find_one_and_delete`.
    pub upsert: bool,
}

impl ModifyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((field.into(), order));
        self
    }

    pub fn return_before(mut self) -> Self {
        self.return_document = ReturnDocument::Before;
        self
    }

    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }
}

/// A typed handle onto one collection.
pub struct Collection<T> {
    pub(crate) db: Arc<DatabaseInner>,
    pub(crate) core: Arc<CollectionCore<T>>,
    signal: Option<CancelToken>,
    retry: Option<RetrySetting>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            core: Arc::clone(&self.core),
            signal: self.signal.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.core.name)
            .finish()
    }
}

impl<T> Collection<T> {
    pub(crate) fn new(db: Arc<DatabaseInner>, core: Arc<CollectionCore<T>>) -> Self {
        Self {
            db,
            core,
            signal: None,
            retry: None,
        }
    }

    /// Collection name (and table name).
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The schema the collection was registered with.
    pub fn schema(&self) -> &Schema {
        &self.core.schema
    }

    /// Derives a handle whose operations observe the given token.
    pub fn with_cancellation(&self, token: CancelToken) -> Self {
        let mut scoped = self.clone();
        scoped.signal = Some(token);
        scoped
    }

    /// Derives a handle with a call-level retry override.
    pub fn with_retry(&self, setting: RetrySetting) -> Self {
        let mut scoped = self.clone();
        scoped.retry = Some(setting);
        scoped
    }

    /// Subscribes to lifecycle events.
    pub fn on(
        &self,
        listener: impl Fn(&CollectionEvent<T>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.core.events.subscribe(listener)
    }

    /// Removes a subscription.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.core.events.unsubscribe(id)
    }

    /// Removes all subscriptions.
    pub fn clear_listeners(&self) {
        self.core.events.clear();
    }

    // -- Internal plumbing ---------------------------------------------------

    fn check_entry(&self) -> Result<()> {
        if self.core.dropped.load(Ordering::SeqCst) {
            return Err(DbError::invalid_operation(format!(
                "collection {} has been dropped",
                self.core.name
            )));
        }
        checkpoint(self.signal.as_ref())
    }

    /// Resolves retry settings (call > collection > database) and runs the
    /// closure under the resulting policy.
    fn run<R>(&self, op: &'static str, f: impl FnMut() -> Result<R>) -> Result<R> {
        let setting = self
            .retry
            .clone()
            .or_else(|| self.core.retry.clone())
            .unwrap_or_else(|| self.db.options.retry.clone());
        run_with_retry(
            setting.policy(),
            &self.db.hooks(),
            self.signal.as_ref(),
            op,
            f,
        )
    }

    /// Runs a write inside a transaction of its own. The connection is held
    /// exclusively per operation, so an outer transaction can only belong to
    /// a transaction handle, which uses its own collection type.
    fn with_tx<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        self.db.with_conn(|conn| {
            if conn.is_autocommit() {
                let tx = conn
                    .unchecked_transaction()
                    .map_err(|e| DbError::transaction(TxStep::Begin, e.to_string()))?;
                let value = f(&tx)?;
                tx.commit()
                    .map_err(|e| DbError::transaction(TxStep::Commit, e.to_string()))?;
                Ok(value)
            } else {
                f(conn)
            }
        })
    }

    fn emit(&self, make: impl FnOnce() -> CollectionEvent<T>) {
        if self.core.events.has_listeners() {
            self.core.events.emit(&make());
        }
    }

    fn stamp(&self, now: i64) -> i64 {
        if self.core.schema.timestamps().enabled() {
            now
        } else {
            0
        }
    }
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    // -- Validation ----------------------------------------------------------

    /// Runs the registered validator without touching the database.
    pub fn validate(&self, doc: T) -> Result<T> {
        self.core.validate_data(doc)
    }

    // -- Inserts -------------------------------------------------------------

    /// Inserts a document, assigning its id and timestamps.
    pub fn insert_one(&self, data: T) -> Result<Document<T>> {
        self.check_entry()?;
        let data = self.core.validate_data(data)?;
        let body = encode_body(&self.core.schema, &data)?;
        let body_json = serde_json::to_string(&body)?;
        let now = now_ms();
        let id = new_id_at(now);
        self.run("insertOne", || {
            self.db.with_conn(|conn| {
                checkpoint(self.signal.as_ref())?;
                documents::insert_row_on_conn(
                    conn,
                    &self.core.name,
                    &self.core.schema,
                    &id,
                    &body_json,
                    now,
                    &body,
                )
            })
        })?;
        let stamp = self.stamp(now);
        let doc = Document {
            id,
            created_at: stamp,
            updated_at: stamp,
            data,
        };
        self.emit(|| CollectionEvent::Insert { doc: doc.clone() });
        Ok(doc)
    }

    /// Inserts a batch inside one transaction.
    pub fn insert_many(
        &self,
        docs: Vec<T>,
        options: Option<InsertManyOptions>,
    ) -> Result<InsertManyResult<T>> {
        let ordered = options.unwrap_or_default().ordered;
        self.check_entry()?;
        let now = now_ms();

        struct Prepared<T> {
            index: usize,
            id: String,
            body_json: String,
            body: serde_json::Map<String, Value>,
            data: T,
        }

        let mut prepared: Vec<Prepared<T>> = Vec::new();
        let mut failures: Vec<InsertFailure> = Vec::new();
        for (index, data) in docs.into_iter().enumerate() {
            let outcome = self.core.validate_data(data).and_then(|data| {
                let body = encode_body(&self.core.schema, &data)?;
                let body_json = serde_json::to_string(&body)?;
                Ok(Prepared {
                    index,
                    id: new_id_at(now),
                    body_json,
                    body,
                    data,
                })
            });
            match outcome {
                Ok(p) => prepared.push(p),
                Err(error) if ordered => return Err(error),
                Err(error) => failures.push(InsertFailure { index, error }),
            }
        }

        let driver_failures = self.run("insertMany", || {
            self.with_tx(|conn| {
                let mut fails: Vec<(usize, DbError)> = Vec::new();
                for (slot, p) in prepared.iter().enumerate() {
                    checkpoint(self.signal.as_ref())?;
                    let inserted = documents::insert_row_on_conn(
                        conn,
                        &self.core.name,
                        &self.core.schema,
                        &p.id,
                        &p.body_json,
                        now,
                        &p.body,
                    );
                    match inserted {
                        Ok(()) => {}
                        Err(error) if ordered => return Err(error),
                        Err(error) => fails.push((slot, error)),
                    }
                }
                Ok(fails)
            })
        })?;

        let failed_slots: std::collections::HashSet<usize> =
            driver_failures.iter().map(|(slot, _)| *slot).collect();
        let slot_to_index: Vec<usize> = prepared.iter().map(|p| p.index).collect();
        let stamp = self.stamp(now);
        let mut documents = Vec::with_capacity(prepared.len());
        for (slot, p) in prepared.into_iter().enumerate() {
            if failed_slots.contains(&slot) {
                continue;
            }
            documents.push(Document {
                id: p.id,
                created_at: stamp,
                updated_at: stamp,
                data: p.data,
            });
        }
        for (slot, error) in driver_failures {
            failures.push(InsertFailure {
                index: slot_to_index[slot],
                error,
            });
        }
        failures.sort_by_key(|f| f.index);

        let result = InsertManyResult {
            inserted_count: documents.len(),
            documents,
            failures,
        };
        self.emit(|| CollectionEvent::InsertMany {
            docs: result.documents.clone(),
            inserted_count: result.inserted_count,
        });
        Ok(result)
    }

    // -- Reads ---------------------------------------------------------------

    /// Fetches a document by primary key. A missing id is `Ok(None)`.
    pub fn find_by_id(&self, id: &str) -> Result<Option<Document<T>>> {
        self.check_entry()?;
        self.run("findById", || {
            self.db.with_conn(|conn| {
                checkpoint(self.signal.as_ref())?;
                documents::find_by_id_on_conn(conn, &self.core, id)
            })
        })
    }

    /// Finds the first document matching the filter (or id).
    pub fn find_one(
        &self,
        target: impl Into<Filter>,
        options: Option<FindOptions>,
    ) -> Result<Option<Document<T>>> {
        let filter = target.into();
        let options = options.unwrap_or_default();
        self.check_entry()?;
        self.run("findOne", || {
            self.db.with_conn(|conn| {
                checkpoint(self.signal.as_ref())?;
                documents::find_one_on_conn(conn, &self.core, &filter, &options, self.signal.as_ref())
            })
        })
    }

    /// Finds every document matching the filter.
    pub fn find(&self, filter: Filter, options: Option<FindOptions>) -> Result<Vec<Document<T>>> {
        let options = options.unwrap_or_default();
        self.check_entry()?;
        self.run("find", || {
            self.db.with_conn(|conn| {
                checkpoint(self.signal.as_ref())?;
                documents::find_on_conn(conn, &self.core, &filter, &options, self.signal.as_ref())
            })
        })
    }

    /// Counts documents matching the filter.
    pub fn count(&self, filter: Filter) -> Result<i64> {
        self.check_entry()?;
        self.run("count", || {
            self.db.with_conn(|conn| {
                checkpoint(self.signal.as_ref())?;
                documents::count_on_conn(conn, &self.core, &filter)
            })
        })
    }

    /// Table-level row count without a filter.
    pub fn estimated_document_count(&self) -> Result<i64> {
        self.check_entry()?;
        self.run("estimatedDocumentCount", || {
            self.db.with_conn(|conn| {
                checkpoint(self.signal.as_ref())?;
                documents::estimated_count_on_conn(conn, &self.core)
            })
        })
    }

    /// Distinct non-null values of a field, ascending.
    pub fn distinct(&self, field: &str, filter: Option<Filter>) -> Result<Vec<Value>> {
        let filter = filter.unwrap_or(Filter::Empty);
        self.check_entry()?;
        self.run("distinct", || {
            self.db.with_conn(|conn| {
                checkpoint(self.signal.as_ref())?;
                documents::distinct_on_conn(conn, &self.core, field, &filter, self.signal.as_ref())
            })
        })
    }

    /// Case-insensitive substring search over the given fields.
    pub fn search(
        &self,
        text: &str,
        fields: &[&str],
        options: Option<FindOptions>,
    ) -> Result<Vec<Document<T>>> {
        if text.is_empty() {
            return Err(DbError::query("search text must be non-empty"));
        }
        if fields.is_empty() {
            return Err(DbError::query("search requires at least one field"));
        }
        let mut options = options.unwrap_or_default();
        let case_sensitive = options
            .search
            .as_ref()
            .is_some_and(|s| s.case_sensitive);
        options.search = Some(doclite_core::SearchSpec {
            text: text.to_owned(),
            fields: fields.iter().map(|f| (*f).to_owned()).collect(),
            case_sensitive,
        });
        self.find(Filter::Empty, Some(options))
    }

    // -- Updates -------------------------------------------------------------

    /// Applies a shallow patch to the first matching document.
    pub fn update_one(
        &self,
        target: impl Into<Filter>,
        patch: Patch,
        options: Option<UpdateOptions>,
    ) -> Result<Option<Document<T>>> {
        let filter = target.into();
        let upsert = options.unwrap_or_default().upsert;
        self.check_entry()?;
        check_patch_keys(&self.core.schema, &patch)?;
        let now = now_ms();
        let outcome = self.run("updateOne", || {
            self.with_tx(|conn| {
                checkpoint(self.signal.as_ref())?;
                modify::update_one_on_conn(conn, &self.core, &filter, &patch, upsert, &[], now)
            })
        })?;
        self.emit(|| CollectionEvent::Update {
            filter: filter.clone(),
            patch: patch.clone(),
            doc: outcome.after.clone(),
            upserted: outcome.upserted,
        });
        Ok(outcome.after)
    }

    /// Applies a shallow patch to every matching document.
    pub fn update_many(&self, filter: Filter, patch: Patch) -> Result<UpdateManyResult> {
        self.check_entry()?;
        check_patch_keys(&self.core.schema, &patch)?;
        let now = now_ms();
        let (matched_count, modified_count) = self.run("updateMany", || {
            self.with_tx(|conn| {
                checkpoint(self.signal.as_ref())?;
                modify::update_many_on_conn(
                    conn,
                    &self.core,
                    &filter,
                    &patch,
                    now,
                    self.signal.as_ref(),
                )
            })
        })?;
        self.emit(|| CollectionEvent::UpdateMany {
            filter: filter.clone(),
            patch: patch.clone(),
            matched_count,
            modified_count,
        });
        Ok(UpdateManyResult {
            matched_count,
            modified_count,
        })
    }

    /// Replaces the entire user body of the first matching document,
    /// preserving its id and creation timestamp.
    pub fn replace_one(
        &self,
        target: impl Into<Filter>,
        doc: T,
    ) -> Result<Option<Document<T>>> {
        let filter = target.into();
        self.check_entry()?;
        let now = now_ms();
        let outcome = self.run("replaceOne", || {
            self.with_tx(|conn| {
                checkpoint(self.signal.as_ref())?;
                modify::replace_one_on_conn(conn, &self.core, &filter, &doc, false, &[], now)
            })
        })?;
        self.emit(|| CollectionEvent::Replace {
            filter: filter.clone(),
            doc: outcome.after.clone(),
        });
        Ok(outcome.after)
    }

    // -- Deletes -------------------------------------------------------------

    /// Deletes the first matching document. Returns whether a row went away.
    pub fn delete_one(&self, target: impl Into<Filter>) -> Result<bool> {
        let filter = target.into();
        self.check_entry()?;
        let deleted = self.run("deleteOne", || {
            self.db.with_conn(|conn| {
                checkpoint(self.signal.as_ref())?;
                modify::delete_one_on_conn(conn, &self.core, &filter)
            })
        })?;
        self.emit(|| CollectionEvent::Delete {
            filter: filter.clone(),
            deleted,
        });
        Ok(deleted)
    }

    /// Deletes every matching document, returning the count.
    pub fn delete_many(&self, filter: Filter) -> Result<usize> {
        self.check_entry()?;
        let deleted_count = self.run("deleteMany", || {
            self.db.with_conn(|conn| {
                checkpoint(self.signal.as_ref())?;
                modify::delete_many_on_conn(conn, &self.core, &filter)
            })
        })?;
        self.emit(|| CollectionEvent::DeleteMany {
            filter: filter.clone(),
            deleted_count,
        });
        Ok(deleted_count)
    }

    // -- Atomic find-and-modify ----------------------------------------------

    /// Finds, patches, and returns one document atomically.
    pub fn find_one_and_update(
        &self,
        target: impl Into<Filter>,
        patch: Patch,
        options: Option<ModifyOptions>,
    ) -> Result<Option<Document<T>>> {
        let filter = target.into();
        let opts = options.unwrap_or_default();
        self.check_entry()?;
        check_patch_keys(&self.core.schema, &patch)?;
        let now = now_ms();
        let outcome = self.run("findOneAndUpdate", || {
            self.with_tx(|conn| {
                checkpoint(self.signal.as_ref())?;
                modify::update_one_on_conn(
                    conn,
                    &self.core,
                    &filter,
                    &patch,
                    opts.upsert,
                    &opts.sort,
                    now,
                )
            })
        })?;
        self.emit(|| CollectionEvent::FindOneAndUpdate {
            filter: filter.clone(),
            patch: patch.clone(),
            before: outcome.before.clone(),
            after: outcome.after.clone(),
            upserted: outcome.upserted,
        });
        resolve_return(&filter, opts.return_document, outcome)
    }

    /// Finds, replaces, and returns one document atomically.
    pub fn find_one_and_replace(
        &self,
        target: impl Into<Filter>,
        doc: T,
        options: Option<ModifyOptions>,
    ) -> Result<Option<Document<T>>> {
        let filter = target.into();
        let opts = options.unwrap_or_default();
        self.check_entry()?;
        let now = now_ms();
        let outcome = self.run("findOneAndReplace", || {
            self.with_tx(|conn| {
                checkpoint(self.signal.as_ref())?;
                modify::replace_one_on_conn(
                    conn,
                    &self.core,
                    &filter,
                    &doc,
                    opts.upsert,
                    &opts.sort,
                    now,
                )
            })
        })?;
        self.emit(|| CollectionEvent::FindOneAndReplace {
            filter: filter.clone(),
            before: outcome.before.clone(),
            after: outcome.after.clone(),
            upserted: outcome.upserted,
        });
        resolve_return(&filter, opts.return_document, outcome)
    }

    /// Finds, deletes, and returns one document atomically.
    pub fn find_one_and_delete(
        &self,
        target: impl Into<Filter>,
        options: Option<ModifyOptions>,
    ) -> Result<Option<Document<T>>> {
        let filter = target.into();
        let opts = options.unwrap_or_default();
        self.check_entry()?;
        let doc = self.run("findOneAndDelete", || {
            self.with_tx(|conn| {
                checkpoint(self.signal.as_ref())?;
                modify::find_one_and_delete_on_conn(conn, &self.core, &filter, &opts.sort)
            })
        })?;
        self.emit(|| CollectionEvent::FindOneAndDelete {
            filter: filter.clone(),
            doc: doc.clone(),
        });
        Ok(doc)
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Drops the collection table and clears its listeners.
    pub fn drop(&self) -> Result<()> {
        checkpoint(self.signal.as_ref())?;
        if self.core.dropped.swap(true, Ordering::SeqCst) {
            return Err(DbError::invalid_operation(format!(
                "collection {} has already been dropped",
                self.core.name
            )));
        }
        {
            let mut registry = self.db.lock_registry()?;
            registry.remove(&self.core.name);
            self.db.with_conn(|conn| {
                conn.execute_batch(&format!(
                    "DROP TABLE IF EXISTS {}",
                    quote_table(&self.core.name)
                ))
                .map_err(|e| map_sqlite_err(e, None))
            })?;
        }
        self.emit(|| CollectionEvent::Drop {
            name: self.core.name.clone(),
        });
        self.core.events.clear();
        Ok(())
    }
}

/// Maps a modify outcome to the requested snapshot. A `Before` request with
/// no match and no upsert is the one case that reports `NotFound`; an
/// upsert returns none because no pre-image exists.
pub(crate) fn resolve_return<T>(
    filter: &Filter,
    which: ReturnDocument,
    outcome: modify::ModifyOutcome<T>,
) -> Result<Option<Document<T>>> {
    match which {
        ReturnDocument::After => Ok(outcome.after),
        ReturnDocument::Before => {
            if outcome.upserted {
                Ok(None)
            } else if !outcome.matched {
                Err(DbError::not_found(describe_target(filter)))
            } else {
                Ok(outcome.before)
            }
        }
    }
}

pub(crate) fn describe_target(filter: &Filter) -> String {
    filter
        .as_id_lookup()
        .map(str::to_owned)
        .unwrap_or_else(|| format!("{filter:?}"))
}

/// Patches may not touch `_id` or the managed timestamp columns.
pub(crate) fn check_patch_keys(schema: &Schema, patch: &Patch) -> Result<()> {
    for key in patch.fields() {
        if key == ID_COLUMN {
            return Err(DbError::validation_field(key, "_id is immutable"));
        }
        if schema.timestamps().created_column() == Some(key)
            || schema.timestamps().updated_column() == Some(key)
        {
            return Err(DbError::validation_field(
                key,
                "timestamp columns are managed by the database",
            ));
        }
    }
    Ok(())
}
