//! Core types and traits for the doclite document database.
//!
//! Everything in this crate is a pure value type: documents, schemas, the
//! filter AST, find options, error variants, and the validator contract.
//! Nothing here touches a database driver.

pub mod document;
pub mod error;
pub mod events;
pub mod filter;
pub mod id;
pub mod options;
pub mod schema;
pub mod scalar;
pub mod validate;

// Re-exports for convenience.
pub use document::{Document, Patch};
pub use error::{DbError, Result, TxStep};
pub use events::CollectionEvent;
pub use filter::{ArrayOp, CompareOp, FieldOp, Filter, StringOp};
pub use options::{
    CursorSpec, FindOptions, Projection, ReturnDocument, SearchSpec, SortOrder,
};
pub use scalar::Scalar;
pub use schema::{CompoundIndex, FieldDef, Schema, SchemaBuilder, SqlType, TimestampPolicy};
pub use validate::{FnValidator, ValidationFailure, Validator};
