//! Query translation for the doclite document database.
//!
//! Turns a [`Filter`](doclite_core::Filter) plus
//! [`FindOptions`](doclite_core::FindOptions) into parameterized SQLite SQL,
//! routing indexed fields through their generated columns and everything
//! else through `jsonb_extract`. An optional bounded template cache reuses
//! SQL for filters of identical shape.

pub mod cache;
pub mod translate;

pub use cache::TemplateCache;
pub use translate::{
    CursorAnchor, CursorDirection, SqlQuery, TranslateError, Translator, MAX_FILTER_DEPTH,
};
