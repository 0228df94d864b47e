//! [`Database`] -- connection owner, collection registry, transactions.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use rusqlite::Connection;
use tracing::{debug, info};

use doclite_core::error::{DbError, Result, TxStep};
use doclite_core::schema::Schema;
use doclite_query::TemplateCache;

use crate::config::DbOptions;
use crate::events::EventBus;
use crate::retry::{run_with_retry, RetryHooks};
use crate::sqlite::collection::{Collection, CollectionCore, CollectionOptions};
use crate::sqlite::ddl;
use crate::sqlite::rows::map_sqlite_err;

pub(crate) struct Registered {
    pub(crate) schema: Schema,
    pub(crate) core: Arc<dyn Any + Send + Sync>,
}

pub(crate) struct DatabaseInner {
    pub(crate) conn: Mutex<Option<Connection>>,
    pub(crate) external: bool,
    pub(crate) options: DbOptions,
    pub(crate) hooks: Mutex<RetryHooks>,
    pub(crate) registry: Mutex<HashMap<String, Registered>>,
    pub(crate) tx_owner: Mutex<Option<ThreadId>>,
}

impl DatabaseInner {
    /// Runs a closure with exclusive access to the live connection.
    pub(crate) fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        self.ensure_no_active_tx()?;
        let guard = self
            .conn
            .lock()
            .map_err(|e| DbError::connection(format!("connection mutex poisoned: {e}")))?;
        let conn = guard
            .as_ref()
            .ok_or_else(|| DbError::connection("database is closed"))?;
        f(conn)
    }

    /// A thread holding a transaction guard must go through the
    /// transaction's collection handles; re-locking here would deadlock.
    fn ensure_no_active_tx(&self) -> Result<()> {
        let owner = self
            .tx_owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *owner == Some(thread::current().id()) {
            return Err(DbError::invalid_operation(
                "a transaction is active on this thread; use the transaction's collection handles",
            ));
        }
        Ok(())
    }

    pub(crate) fn hooks(&self) -> RetryHooks {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn lock_registry(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<String, Registered>>> {
        self.registry
            .lock()
            .map_err(|e| DbError::connection(format!("registry mutex poisoned: {e}")))
    }

    /// Fetches an already-registered collection core with type checking.
    pub(crate) fn lookup_core<T: Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<CollectionCore<T>>> {
        let registry = self.lock_registry()?;
        let entry = registry.get(name).ok_or_else(|| {
            DbError::invalid_operation(format!("collection {name} is not registered"))
        })?;
        Arc::clone(&entry.core)
            .downcast::<CollectionCore<T>>()
            .map_err(|_| {
                DbError::invalid_operation(format!(
                    "collection {name} is registered with a different document type"
                ))
            })
    }
}

/// An embedded document database over one SQLite connection.
///
/// Handles are cheap clones sharing the connection, the collection
/// registry, and the retry hooks.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DatabaseInner>,
}

impl Database {
    /// Opens (or creates) a database file with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, DbOptions::default())
    }

    /// Opens (or creates) a database file.
    pub fn open_with(path: impl AsRef<Path>, options: DbOptions) -> Result<Self> {
        let path = path.as_ref();
        info!(?path, "opening SQLite database");
        let conn = Connection::open(path).map_err(|e| {
            DbError::connection(format!("failed to open {}: {e}", path.display()))
        })?;
        Self::build(conn, options, false)
    }

    /// Opens an in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with(DbOptions::default())
    }

    /// Opens an in-memory database with options.
    pub fn in_memory_with(options: DbOptions) -> Result<Self> {
        debug!("opening in-memory SQLite database");
        let conn = Connection::open_in_memory()
            .map_err(|e| DbError::connection(format!("failed to open in-memory db: {e}")))?;
        Self::build(conn, options, false)
    }

    /// Wraps an externally created connection. [`Database::close`] hands the
    /// connection back instead of releasing it.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        Self::from_connection_with(conn, DbOptions::default())
    }

    /// Wraps an externally created connection with options.
    pub fn from_connection_with(conn: Connection, options: DbOptions) -> Result<Self> {
        Self::build(conn, options, true)
    }

    fn build(conn: Connection, options: DbOptions, external: bool) -> Result<Self> {
        conn.execute_batch(&options.pragma_sql())
            .map_err(|e| DbError::connection(format!("failed to set pragmas: {e}")))?;
        Ok(Self {
            inner: Arc::new(DatabaseInner {
                conn: Mutex::new(Some(conn)),
                external,
                options,
                hooks: Mutex::new(RetryHooks::default()),
                registry: Mutex::new(HashMap::new()),
                tx_owner: Mutex::new(None),
            }),
        })
    }

    /// The options this database was opened with.
    pub fn options(&self) -> &DbOptions {
        &self.inner.options
    }

    /// Installs retry observation/classification hooks.
    pub fn set_retry_hooks(&self, hooks: RetryHooks) {
        *self
            .inner
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = hooks;
    }

    /// Registers (or re-opens) a collection with the default options.
    pub fn collection<T: Send + Sync + 'static>(
        &self,
        name: &str,
        schema: Schema,
    ) -> Result<Collection<T>> {
        self.collection_with_options(name, schema, CollectionOptions::default())
    }

    /// Registers (or re-opens) a collection.
    ///
    /// The first registration wins: later requests must carry a structurally
    /// equal schema and the same document type. Registration-time options of
    /// later requests are ignored.
    pub fn collection_with_options<T: Send + Sync + 'static>(
        &self,
        name: &str,
        schema: Schema,
        options: CollectionOptions<T>,
    ) -> Result<Collection<T>> {
        validate_collection_name(name)?;
        let mut registry = self.inner.lock_registry()?;
        if let Some(existing) = registry.get(name) {
            if existing.schema != schema {
                return Err(DbError::schema(format!(
                    "collection {name} is already registered with a different schema"
                )));
            }
            let core = Arc::clone(&existing.core)
                .downcast::<CollectionCore<T>>()
                .map_err(|_| {
                    DbError::invalid_operation(format!(
                        "collection {name} is registered with a different document type"
                    ))
                })?;
            return Ok(Collection::new(Arc::clone(&self.inner), core));
        }

        self.inner
            .with_conn(|conn| ddl::apply_schema(conn, name, &schema))?;
        debug!(collection = name, "registered collection");

        let core = Arc::new(CollectionCore {
            name: name.to_owned(),
            schema: schema.clone(),
            cache: TemplateCache::new(self.inner.options.template_cache_capacity),
            validator: options.validator,
            events: EventBus::new(),
            retry: options.retry,
            dropped: AtomicBool::new(false),
        });
        registry.insert(
            name.to_owned(),
            Registered {
                schema,
                core: core.clone() as Arc<dyn Any + Send + Sync>,
            },
        );
        Ok(Collection::new(Arc::clone(&self.inner), core))
    }

    /// Closes the database. Owned connections are released; externally
    /// provided ones are handed back. Closing twice is a no-op.
    pub fn close(&self) -> Result<Option<Connection>> {
        let mut guard = self
            .inner
            .conn
            .lock()
            .map_err(|e| DbError::connection(format!("connection mutex poisoned: {e}")))?;
        match guard.take() {
            None => Ok(None),
            Some(conn) => {
                if self.inner.external {
                    debug!("detaching externally owned connection");
                    Ok(Some(conn))
                } else {
                    conn.close()
                        .map_err(|(_, e)| DbError::connection(format!("failed to close: {e}")))?;
                    debug!("closed SQLite database");
                    Ok(None)
                }
            }
        }
    }

    /// Returns `true` once closed.
    pub fn is_closed(&self) -> bool {
        self.inner
            .conn
            .lock()
            .map(|guard| guard.is_none())
            .unwrap_or(true)
    }

    // -- Transactions --------------------------------------------------------

    /// Opens a manual transaction. Dropping the handle without committing
    /// rolls back.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        {
            let owner = self
                .inner
                .tx_owner
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *owner == Some(thread::current().id()) {
                return Err(DbError::transaction(
                    TxStep::Nest,
                    "nested transactions are not supported",
                ));
            }
        }
        let guard = self
            .inner
            .conn
            .lock()
            .map_err(|e| DbError::connection(format!("connection mutex poisoned: {e}")))?;
        {
            let conn = guard
                .as_ref()
                .ok_or_else(|| DbError::connection("database is closed"))?;
            let setting = self.inner.options.retry.clone();
            run_with_retry(setting.policy(), &self.inner.hooks(), None, "begin", || {
                conn.execute_batch("BEGIN IMMEDIATE")
                    .map_err(|e| map_sqlite_err(e, None))
            })
            .map_err(|e| DbError::transaction(TxStep::Begin, e.to_string()))?;
        }
        *self
            .inner
            .tx_owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(thread::current().id());
        debug!("transaction started");
        Ok(Transaction {
            inner: Arc::clone(&self.inner),
            guard: Some(guard),
            pending: RefCell::new(Vec::new()),
            finished: Cell::new(false),
        })
    }

    /// Runs a closure inside a transaction: commit on `Ok`, rollback on
    /// `Err`. Queued write events fire after the commit.
    pub fn execute<R>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<R>) -> Result<R> {
        let tx = self.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("external", &self.inner.external)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn validate_collection_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(DbError::invalid_operation(format!(
            "invalid collection name: {name:?}"
        )));
    }
    Ok(())
}

/// A manual transaction holding the connection exclusively. Collections
/// inside the transaction come from [`Transaction::collection`]; their
/// write events are queued and fire only after a successful commit.
pub struct Transaction<'db> {
    pub(crate) inner: Arc<DatabaseInner>,
    guard: Option<MutexGuard<'db, Option<Connection>>>,
    pending: RefCell<Vec<Box<dyn FnOnce()>>>,
    finished: Cell<bool>,
}

impl Transaction<'_> {
    pub(crate) fn conn(&self) -> Result<&Connection> {
        match &self.guard {
            Some(guard) => guard
                .as_ref()
                .ok_or_else(|| DbError::connection("database is closed")),
            None => Err(DbError::connection("transaction already finished")),
        }
    }

    pub(crate) fn queue_event(&self, event: Box<dyn FnOnce()>) {
        self.pending.borrow_mut().push(event);
    }

    /// Commits. Busy/locked commit failures are retried within the
    /// database's retry budget before the transaction rolls back.
    pub fn commit(self) -> Result<()> {
        self.finish(true)
    }

    /// Rolls back.
    pub fn rollback(self) -> Result<()> {
        self.finish(false)
    }

    fn finish(mut self, commit: bool) -> Result<()> {
        if self.finished.get() {
            return Ok(());
        }
        self.finished.set(true);
        let result = match self.conn() {
            Err(e) => Err(e),
            Ok(conn) if commit => {
                let setting = self.inner.options.retry.clone();
                run_with_retry(setting.policy(), &self.inner.hooks(), None, "commit", || {
                    conn.execute_batch("COMMIT").map_err(|e| map_sqlite_err(e, None))
                })
                .map_err(|e| {
                    let _ = conn.execute_batch("ROLLBACK");
                    DbError::transaction(TxStep::Commit, e.to_string())
                })
            }
            Ok(conn) => conn
                .execute_batch("ROLLBACK")
                .map_err(|e| DbError::transaction(TxStep::Rollback, e.to_string())),
        };
        self.release();
        if commit && result.is_ok() {
            for event in self.pending.take() {
                event();
            }
        }
        result
    }

    fn release(&mut self) {
        self.guard = None;
        *self
            .inner
            .tx_owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished.get() {
            self.finished.set(true);
            if let Some(guard) = &self.guard {
                if let Some(conn) = guard.as_ref() {
                    let _ = conn.execute_batch("ROLLBACK");
                    debug!("transaction dropped without commit; rolled back");
                }
            }
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doclite_core::schema::{FieldDef, SqlType};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        label: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Other {
        label: String,
        extra: Option<i64>,
    }

    fn schema() -> Schema {
        Schema::builder()
            .field(FieldDef::new("label", SqlType::Text).indexed())
            .build()
            .unwrap()
    }

    #[test]
    fn open_and_close_is_idempotent() {
        let db = Database::in_memory().unwrap();
        assert!(!db.is_closed());
        assert!(db.close().unwrap().is_none());
        assert!(db.is_closed());
        assert!(db.close().unwrap().is_none());
    }

    #[test]
    fn operations_after_close_report_connection_errors() {
        let db = Database::in_memory().unwrap();
        let items = db.collection::<Item>("items", schema()).unwrap();
        db.close().unwrap();
        let err = items
            .insert_one(Item {
                label: "late".into(),
            })
            .unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
    }

    #[test]
    fn external_connections_are_handed_back_on_close() {
        let conn = Connection::open_in_memory().unwrap();
        let db = Database::from_connection(conn).unwrap();
        let returned = db.close().unwrap();
        assert!(returned.is_some());
        // The returned connection is still usable by its owner.
        returned
            .unwrap()
            .execute_batch("CREATE TABLE t (x TEXT)")
            .unwrap();
    }

    #[test]
    fn file_backed_database_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        {
            let db = Database::open(&path).unwrap();
            let items = db.collection::<Item>("items", schema()).unwrap();
            items
                .insert_one(Item {
                    label: "persisted".into(),
                })
                .unwrap();
            db.close().unwrap();
        }
        let db = Database::open(&path).unwrap();
        let items = db.collection::<Item>("items", schema()).unwrap();
        assert_eq!(items.estimated_document_count().unwrap(), 1);
    }

    #[test]
    fn schema_mismatch_on_reregistration_is_rejected() {
        let db = Database::in_memory().unwrap();
        let _items = db.collection::<Item>("items", schema()).unwrap();
        let different = Schema::builder()
            .field(FieldDef::new("label", SqlType::Text))
            .build()
            .unwrap();
        let err = db.collection::<Item>("items", different).unwrap_err();
        assert!(matches!(err, DbError::SchemaValidation { .. }));
    }

    #[test]
    fn type_mismatch_on_reregistration_is_rejected() {
        let db = Database::in_memory().unwrap();
        let _items = db.collection::<Item>("items", schema()).unwrap();
        let err = db.collection::<Other>("items", schema()).unwrap_err();
        assert!(matches!(err, DbError::InvalidOperation { .. }));
    }

    #[test]
    fn same_registration_shares_state() {
        let db = Database::in_memory().unwrap();
        let a = db.collection::<Item>("items", schema()).unwrap();
        let b = db.collection::<Item>("items", schema()).unwrap();
        a.insert_one(Item { label: "x".into() }).unwrap();
        assert_eq!(b.estimated_document_count().unwrap(), 1);
    }

    #[test]
    fn invalid_collection_names_are_rejected() {
        let db = Database::in_memory().unwrap();
        for bad in ["", "has space", "quote\"name", "1leading"] {
            let err = db.collection::<Item>(bad, schema()).unwrap_err();
            assert!(matches!(err, DbError::InvalidOperation { .. }), "{bad}");
        }
    }

    #[test]
    fn execute_commits_on_ok() {
        let db = Database::in_memory().unwrap();
        let _items = db.collection::<Item>("items", schema()).unwrap();
        db.execute(|tx| {
            let items = tx.collection::<Item>("items")?;
            items.insert_one(Item { label: "a".into() })?;
            items.insert_one(Item { label: "b".into() })?;
            Ok(())
        })
        .unwrap();
        let items = db.collection::<Item>("items", schema()).unwrap();
        assert_eq!(items.estimated_document_count().unwrap(), 2);
    }

    #[test]
    fn execute_rolls_back_on_err() {
        let db = Database::in_memory().unwrap();
        let _items = db.collection::<Item>("items", schema()).unwrap();
        let result: Result<()> = db.execute(|tx| {
            let items = tx.collection::<Item>("items")?;
            items.insert_one(Item { label: "a".into() })?;
            Err(DbError::invalid_operation("forced failure"))
        });
        assert!(result.is_err());
        let items = db.collection::<Item>("items", schema()).unwrap();
        assert_eq!(items.estimated_document_count().unwrap(), 0);
    }

    #[test]
    fn nested_execute_is_rejected() {
        let db = Database::in_memory().unwrap();
        let _items = db.collection::<Item>("items", schema()).unwrap();
        let result: Result<()> = db.execute(|_tx| {
            let inner: Result<()> = db.execute(|_| Ok(()));
            inner
        });
        match result {
            Err(DbError::Transaction { step, .. }) => assert_eq!(step, TxStep::Nest),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn collection_handles_refuse_to_run_inside_a_transaction() {
        let db = Database::in_memory().unwrap();
        let items = db.collection::<Item>("items", schema()).unwrap();
        let result: Result<()> = db.execute(|_tx| {
            items.insert_one(Item { label: "x".into() })?;
            Ok(())
        });
        assert!(matches!(result, Err(DbError::InvalidOperation { .. })));
    }

    #[test]
    fn dropping_a_manual_transaction_rolls_back() {
        let db = Database::in_memory().unwrap();
        let _items = db.collection::<Item>("items", schema()).unwrap();
        {
            let tx = db.transaction().unwrap();
            let items = tx.collection::<Item>("items").unwrap();
            items.insert_one(Item { label: "x".into() }).unwrap();
            // Dropped without commit.
        }
        let items = db.collection::<Item>("items", schema()).unwrap();
        assert_eq!(items.estimated_document_count().unwrap(), 0);
    }

    #[test]
    fn manual_commit_persists() {
        let db = Database::in_memory().unwrap();
        let _items = db.collection::<Item>("items", schema()).unwrap();
        let tx = db.transaction().unwrap();
        {
            let items = tx.collection::<Item>("items").unwrap();
            items.insert_one(Item { label: "x".into() }).unwrap();
        }
        tx.commit().unwrap();
        let items = db.collection::<Item>("items", schema()).unwrap();
        assert_eq!(items.estimated_document_count().unwrap(), 1);
    }

    #[test]
    fn unregistered_tx_collections_are_an_error() {
        let db = Database::in_memory().unwrap();
        let result: Result<()> = db.execute(|tx| {
            tx.collection::<Item>("ghost")?;
            Ok(())
        });
        assert!(matches!(result, Err(DbError::InvalidOperation { .. })));
    }
}
