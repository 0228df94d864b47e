//! SQLite-backed runtime for the doclite document database.
//!
//! Documents are stored as JSONB blobs with indexed fields projected into
//! virtual generated columns. The runtime provides typed collections with
//! CRUD, batch writes, atomic find-and-modify, transactions, retries,
//! cooperative cancellation, and lifecycle events.
//!
//! ```no_run
//! use doclite_storage::{Database, Filter, FieldDef, Schema, SqlType};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct User { name: String, email: String }
//!
//! # fn main() -> doclite_storage::Result<()> {
//! let db = Database::in_memory()?;
//! let schema = Schema::builder()
//!     .field(FieldDef::new("email", SqlType::Text).unique())
//!     .field(FieldDef::new("name", SqlType::Text).indexed())
//!     .build()?;
//! let users = db.collection::<User>("users", schema)?;
//! users.insert_one(User { name: "Ada".into(), email: "ada@example.com".into() })?;
//! let found = users.find(Filter::field("name").eq("Ada"), None)?;
//! assert_eq!(found.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod config;
pub mod events;
pub mod retry;
pub mod sqlite;

// Re-exports: the whole public surface is reachable from this crate.
pub use doclite_core::{
    ArrayOp, CollectionEvent, CompareOp, CursorSpec, DbError, Document, FieldDef, FieldOp, Filter,
    FindOptions, FnValidator, Patch, Projection, Result, ReturnDocument, Scalar, Schema,
    SchemaBuilder, SearchSpec, SortOrder, SqlType, StringOp, TimestampPolicy, TxStep,
    ValidationFailure, Validator,
};
pub use doclite_query::TemplateCache;

pub use cancel::CancelToken;
pub use config::{DbOptions, JournalMode};
pub use events::SubscriptionId;
pub use retry::{RetryContext, RetryHooks, RetryPolicy, RetrySetting};
pub use sqlite::collection::{
    Collection, CollectionOptions, InsertFailure, InsertManyOptions, InsertManyResult,
    ModifyOptions, UpdateManyResult, UpdateOptions,
};
pub use sqlite::database::{Database, Transaction};
pub use sqlite::transaction::TxCollection;
