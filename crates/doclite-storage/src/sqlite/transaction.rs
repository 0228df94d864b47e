//! Transaction-scoped collection handles.
//!
//! A [`TxCollection`] executes on the connection held by its
//! [`Transaction`], without per-operation retries or inner transactions:
//! the surrounding transaction provides atomicity, and its commit decides
//! when queued write events fire.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use doclite_core::document::{Document, Patch};
use doclite_core::error::{DbError, Result};
use doclite_core::events::CollectionEvent;
use doclite_core::filter::Filter;
use doclite_core::id::{new_id_at, now_ms};
use doclite_core::options::FindOptions;

use crate::cancel::{checkpoint, CancelToken};
use crate::sqlite::collection::{
    check_patch_keys, resolve_return, CollectionCore, InsertFailure, InsertManyOptions,
    InsertManyResult, ModifyOptions, UpdateManyResult, UpdateOptions,
};
use crate::sqlite::database::Transaction;
use crate::sqlite::rows::encode_body;
use crate::sqlite::{documents, modify};

impl<'db> Transaction<'db> {
    /// Opens a transaction-scoped handle onto an already-registered
    /// collection.
    pub fn collection<T: Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<TxCollection<'_, 'db, T>> {
        let core = self.inner.lookup_core::<T>(name)?;
        Ok(TxCollection {
            tx: self,
            core,
            signal: None,
        })
    }
}

/// A typed collection handle bound to an active transaction.
pub struct TxCollection<'tx, 'db, T> {
    tx: &'tx Transaction<'db>,
    core: Arc<CollectionCore<T>>,
    signal: Option<CancelToken>,
}

impl<T> TxCollection<'_, '_, T> {
    /// Collection name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Derives a handle whose operations observe the given token.
    pub fn with_cancellation(mut self, token: CancelToken) -> Self {
        self.signal = Some(token);
        self
    }

    fn check_entry(&self) -> Result<()> {
        if self.core.dropped.load(Ordering::SeqCst) {
            return Err(DbError::invalid_operation(format!(
                "collection {} has been dropped",
                self.core.name
            )));
        }
        checkpoint(self.signal.as_ref())
    }

    fn emit(&self, make: impl FnOnce() -> CollectionEvent<T>)
    where
        T: 'static,
    {
        if self.core.events.has_listeners() {
            let core = Arc::clone(&self.core);
            let event = make();
            self.tx.queue_event(Box::new(move || core.events.emit(&event)));
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

impl<T> TxCollection<'_, '_, T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Runs the registered validator without touching the database.
    pub fn validate(&self, doc: T) -> Result<T> {
        self.core.validate_data(doc)
    }

    pub fn insert_one(&self, data: T) -> Result<Document<T>> {
        self.check_entry()?;
        let data = self.core.validate_data(data)?;
        let body = encode_body(&self.core.schema, &data)?;
        let body_json = serde_json::to_string(&body)?;
        let now = now_ms();
        let id = new_id_at(now);
        documents::insert_row_on_conn(
            self.tx.conn()?,
            &self.core.name,
            &self.core.schema,
            &id,
            &body_json,
            now,
            &body,
        )?;
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

    /// Batch insert reusing the surrounding transaction for atomicity.
    pub fn insert_many(
        &self,
        docs: Vec<T>,
        options: Option<InsertManyOptions>,
    ) -> Result<InsertManyResult<T>> {
        let ordered = options.unwrap_or_default().ordered;
        self.check_entry()?;
        let now = now_ms();
        let stamp = self.stamp(now);
        let mut documents_out = Vec::new();
        let mut failures = Vec::new();
        for (index, data) in docs.into_iter().enumerate() {
            checkpoint(self.signal.as_ref())?;
            let inserted = self.core.validate_data(data).and_then(|data| {
                let body = encode_body(&self.core.schema, &data)?;
                let body_json = serde_json::to_string(&body)?;
                let id = new_id_at(now);
                documents::insert_row_on_conn(
                    self.tx.conn()?,
                    &self.core.name,
                    &self.core.schema,
                    &id,
                    &body_json,
                    now,
                    &body,
                )?;
                Ok(Document {
                    id,
                    created_at: stamp,
                    updated_at: stamp,
                    data,
                })
            });
            match inserted {
                Ok(doc) => documents_out.push(doc),
                Err(error) if ordered => return Err(error),
                Err(error) => failures.push(InsertFailure { index, error }),
            }
        }
        let result = InsertManyResult {
            inserted_count: documents_out.len(),
            documents: documents_out,
            failures,
        };
        self.emit(|| CollectionEvent::InsertMany {
            docs: result.documents.clone(),
            inserted_count: result.inserted_count,
        });
        Ok(result)
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<Document<T>>> {
        self.check_entry()?;
        documents::find_by_id_on_conn(self.tx.conn()?, &self.core, id)
    }

    pub fn find_one(
        &self,
        target: impl Into<Filter>,
        options: Option<FindOptions>,
    ) -> Result<Option<Document<T>>> {
        let filter = target.into();
        let options = options.unwrap_or_default();
        self.check_entry()?;
        documents::find_one_on_conn(
            self.tx.conn()?,
            &self.core,
            &filter,
            &options,
            self.signal.as_ref(),
        )
    }

    pub fn find(&self, filter: Filter, options: Option<FindOptions>) -> Result<Vec<Document<T>>> {
        let options = options.unwrap_or_default();
        self.check_entry()?;
        documents::find_on_conn(
            self.tx.conn()?,
            &self.core,
            &filter,
            &options,
            self.signal.as_ref(),
        )
    }

    pub fn count(&self, filter: Filter) -> Result<i64> {
        self.check_entry()?;
        documents::count_on_conn(self.tx.conn()?, &self.core, &filter)
    }

    pub fn estimated_document_count(&self) -> Result<i64> {
        self.check_entry()?;
        documents::estimated_count_on_conn(self.tx.conn()?, &self.core)
    }

    pub fn distinct(&self, field: &str, filter: Option<Filter>) -> Result<Vec<Value>> {
        let filter = filter.unwrap_or(Filter::Empty);
        self.check_entry()?;
        documents::distinct_on_conn(
            self.tx.conn()?,
            &self.core,
            field,
            &filter,
            self.signal.as_ref(),
        )
    }

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
        let outcome = modify::update_one_on_conn(
            self.tx.conn()?,
            &self.core,
            &filter,
            &patch,
            upsert,
            &[],
            now,
        )?;
        self.emit(|| CollectionEvent::Update {
            filter: filter.clone(),
            patch: patch.clone(),
            doc: outcome.after.clone(),
            upserted: outcome.upserted,
        });
        Ok(outcome.after)
    }

    pub fn update_many(&self, filter: Filter, patch: Patch) -> Result<UpdateManyResult> {
        self.check_entry()?;
        check_patch_keys(&self.core.schema, &patch)?;
        let now = now_ms();
        let (matched_count, modified_count) = modify::update_many_on_conn(
            self.tx.conn()?,
            &self.core,
            &filter,
            &patch,
            now,
            self.signal.as_ref(),
        )?;
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

    pub fn replace_one(&self, target: impl Into<Filter>, doc: T) -> Result<Option<Document<T>>> {
        let filter = target.into();
        self.check_entry()?;
        let now = now_ms();
        let outcome = modify::replace_one_on_conn(
            self.tx.conn()?,
            &self.core,
            &filter,
            &doc,
            false,
            &[],
            now,
        )?;
        self.emit(|| CollectionEvent::Replace {
            filter: filter.clone(),
            doc: outcome.after.clone(),
        });
        Ok(outcome.after)
    }

    pub fn delete_one(&self, target: impl Into<Filter>) -> Result<bool> {
        let filter = target.into();
        self.check_entry()?;
        let deleted = modify::delete_one_on_conn(self.tx.conn()?, &self.core, &filter)?;
        self.emit(|| CollectionEvent::Delete {
            filter: filter.clone(),
            deleted,
        });
        Ok(deleted)
    }

    pub fn delete_many(&self, filter: Filter) -> Result<usize> {
        self.check_entry()?;
        let deleted_count = modify::delete_many_on_conn(self.tx.conn()?, &self.core, &filter)?;
        self.emit(|| CollectionEvent::DeleteMany {
            filter: filter.clone(),
            deleted_count,
        });
        Ok(deleted_count)
    }

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
        let outcome = modify::update_one_on_conn(
            self.tx.conn()?,
            &self.core,
            &filter,
            &patch,
            opts.upsert,
            &opts.sort,
            now,
        )?;
        self.emit(|| CollectionEvent::FindOneAndUpdate {
            filter: filter.clone(),
            patch: patch.clone(),
            before: outcome.before.clone(),
            after: outcome.after.clone(),
            upserted: outcome.upserted,
        });
        resolve_return(&filter, opts.return_document, outcome)
    }

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
        let outcome = modify::replace_one_on_conn(
            self.tx.conn()?,
            &self.core,
            &filter,
            &doc,
            opts.upsert,
            &opts.sort,
            now,
        )?;
        self.emit(|| CollectionEvent::FindOneAndReplace {
            filter: filter.clone(),
            before: outcome.before.clone(),
            after: outcome.after.clone(),
            upserted: outcome.upserted,
        });
        resolve_return(&filter, opts.return_document, outcome)
    }

    pub fn find_one_and_delete(
        &self,
        target: impl Into<Filter>,
        options: Option<ModifyOptions>,
    ) -> Result<Option<Document<T>>> {
        let filter = target.into();
        let opts = options.unwrap_or_default();
        self.check_entry()?;
        let doc = modify::find_one_and_delete_on_conn(
            self.tx.conn()?,
            &self.core,
            &filter,
            &opts.sort,
        )?;
        self.emit(|| CollectionEvent::FindOneAndDelete {
            filter: filter.clone(),
            doc: doc.clone(),
        });
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::database::Database;
    use doclite_core::schema::{FieldDef, Schema, SqlType};
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Account {
        owner: String,
        balance: i64,
    }

    fn setup() -> Database {
        let db = Database::in_memory().unwrap();
        let schema = Schema::builder()
            .field(FieldDef::new("owner", SqlType::Text).unique())
            .field(FieldDef::new("balance", SqlType::Integer).indexed())
            .build()
            .unwrap();
        db.collection::<Account>("accounts", schema).unwrap();
        db
    }

    #[test]
    fn writes_in_a_transaction_see_each_other() {
        let db = setup();
        db.execute(|tx| {
            let accounts = tx.collection::<Account>("accounts")?;
            let doc = accounts.insert_one(Account {
                owner: "ada".into(),
                balance: 10,
            })?;
            let read = accounts.find_by_id(&doc.id)?.unwrap();
            assert_eq!(read.data.balance, 10);
            accounts.update_one(doc.id.as_str(), Patch::new().set("balance", 20), None)?;
            let read = accounts.find_by_id(&doc.id)?.unwrap();
            assert_eq!(read.data.balance, 20);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn events_fire_only_after_commit() {
        let db = setup();
        let accounts = db
            .collection::<Account>("accounts", schema_of(&db))
            .unwrap();
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        accounts.on(move |event| {
            log_clone.lock().unwrap().push(event.kind().to_owned());
        });

        db.execute(|tx| {
            let accounts = tx.collection::<Account>("accounts")?;
            accounts.insert_one(Account {
                owner: "ada".into(),
                balance: 1,
            })?;
            accounts.delete_many(Filter::field("balance").lt(0))?;
            // Nothing is visible to listeners until the commit.
            assert!(log.lock().unwrap().is_empty());
            Ok(())
        })
        .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["insert", "deleteMany"]);
    }

    #[test]
    fn events_are_discarded_on_rollback() {
        let db = setup();
        let accounts = db
            .collection::<Account>("accounts", schema_of(&db))
            .unwrap();
        let fired = Arc::new(Mutex::new(0usize));
        let fired_clone = Arc::clone(&fired);
        accounts.on(move |_| {
            *fired_clone.lock().unwrap() += 1;
        });

        let result: Result<()> = db.execute(|tx| {
            let accounts = tx.collection::<Account>("accounts")?;
            accounts.insert_one(Account {
                owner: "ada".into(),
                balance: 1,
            })?;
            Err(DbError::invalid_operation("boom"))
        });
        assert!(result.is_err());
        assert_eq!(*fired.lock().unwrap(), 0);
    }

    #[test]
    fn duplicate_unique_key_rolls_back_the_whole_batch() {
        let db = setup();
        let result: Result<()> = db.execute(|tx| {
            let accounts = tx.collection::<Account>("accounts")?;
            accounts.insert_one(Account {
                owner: "ada".into(),
                balance: 1,
            })?;
            accounts.insert_one(Account {
                owner: "ada".into(),
                balance: 2,
            })?;
            Ok(())
        });
        assert!(matches!(result, Err(DbError::UniqueConstraint { .. })));
        let accounts = db
            .collection::<Account>("accounts", schema_of(&db))
            .unwrap();
        assert_eq!(accounts.estimated_document_count().unwrap(), 0);
    }

    fn schema_of(_db: &Database) -> Schema {
        Schema::builder()
            .field(FieldDef::new("owner", SqlType::Text).unique())
            .field(FieldDef::new("balance", SqlType::Integer).indexed())
            .build()
            .unwrap()
    }
}
