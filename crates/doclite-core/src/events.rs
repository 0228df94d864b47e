//! Typed event payloads emitted by the collection runtime.
//!
//! Payloads are value types; the listener registry and dispatch live in the
//! storage crate. Events fire only after the driver round-trip succeeds
//! (after commit for transactional writes), and never for reads.

use crate::document::{Document, Patch};
use crate::filter::Filter;

/// A lifecycle event on one collection.
#[derive(Debug, Clone)]
pub enum CollectionEvent<T> {
    Insert {
        doc: Document<T>,
    },
    InsertMany {
        docs: Vec<Document<T>>,
        inserted_count: usize,
    },
    Update {
        filter: Filter,
        patch: Patch,
        doc: Option<Document<T>>,
        upserted: bool,
    },
    UpdateMany {
        filter: Filter,
        patch: Patch,
        matched_count: usize,
        modified_count: usize,
    },
    Replace {
        filter: Filter,
        doc: Option<Document<T>>,
    },
    Delete {
        filter: Filter,
        deleted: bool,
    },
    DeleteMany {
        filter: Filter,
        deleted_count: usize,
    },
    FindOneAndUpdate {
        filter: Filter,
        patch: Patch,
        before: Option<Document<T>>,
        after: Option<Document<T>>,
        upserted: bool,
    },
    FindOneAndReplace {
        filter: Filter,
        before: Option<Document<T>>,
        after: Option<Document<T>>,
        upserted: bool,
    },
    FindOneAndDelete {
        filter: Filter,
        doc: Option<Document<T>>,
    },
    Drop {
        name: String,
    },
    /// A listener failed while handling another event.
    Error {
        operation: &'static str,
        message: String,
    },
}

impl<T> CollectionEvent<T> {
    /// Stable event kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::InsertMany { .. } => "insertMany",
            Self::Update { .. } => "update",
            Self::UpdateMany { .. } => "updateMany",
            Self::Replace { .. } => "replace",
            Self::Delete { .. } => "delete",
            Self::DeleteMany { .. } => "deleteMany",
            Self::FindOneAndUpdate { .. } => "findOneAndUpdate",
            Self::FindOneAndReplace { .. } => "findOneAndReplace",
            Self::FindOneAndDelete { .. } => "findOneAndDelete",
            Self::Drop { .. } => "drop",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        let e: CollectionEvent<()> = CollectionEvent::Drop { name: "users".into() };
        assert_eq!(e.kind(), "drop");
        let e: CollectionEvent<()> = CollectionEvent::Error {
            operation: "insert",
            message: "listener panicked".into(),
        };
        assert_eq!(e.kind(), "error");
    }
}
