//! Options for find and find-and-modify operations.

use crate::error::{DbError, Result};

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    /// SQL keyword.
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    /// Flips the direction.
    pub fn reversed(&self) -> Self {
        match self {
            Self::Asc => Self::Desc,
            Self::Desc => Self::Asc,
        }
    }
}

/// Field projection applied after rows are decoded. `Select` and `Omit`
/// are mutually exclusive by construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Keep only the listed fields (plus `_id` and timestamps).
    Select(Vec<String>),
    /// Remove the listed fields; `_id` cannot be omitted.
    Omit(Vec<String>),
}

/// Multi-field substring search, expanded by the translator into an `OR` of
/// contains-matches ANDed with the base filter.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSpec {
    pub text: String,
    pub fields: Vec<String>,
    pub case_sensitive: bool,
}

/// Keyset pagination anchored at a document id. At most one of `after` /
/// `before` may be set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CursorSpec {
    pub after: Option<String>,
    pub before: Option<String>,
}

/// Which snapshot a find-and-modify operation returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReturnDocument {
    /// The pre-mutation snapshot.
    Before,
    /// The post-mutation row.
    #[default]
    After,
}

/// Options for `find`-family operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Vec<(String, SortOrder)>,
    pub limit: Option<i64>,
    pub skip: Option<i64>,
    pub projection: Option<Projection>,
    pub search: Option<SearchSpec>,
    pub cursor: Option<CursorSpec>,
}

impl FindOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a sort key.
    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: i64) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Keeps only the listed fields in results.
    pub fn select(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.projection = Some(Projection::Select(
            fields.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Removes the listed fields from results.
    pub fn omit(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.projection = Some(Projection::Omit(
            fields.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Adds a case-insensitive substring search over the given fields.
    pub fn search(
        mut self,
        text: impl Into<String>,
        fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.search = Some(SearchSpec {
            text: text.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            case_sensitive: false,
        });
        self
    }

    /// Makes a previously added search case-sensitive.
    pub fn case_sensitive(mut self) -> Self {
        if let Some(search) = &mut self.search {
            search.case_sensitive = true;
        }
        self
    }

    /// Pages forward from the document with the given id.
    pub fn after(mut self, id: impl Into<String>) -> Self {
        self.cursor.get_or_insert_with(CursorSpec::default).after = Some(id.into());
        self
    }

    /// Pages backward from the document with the given id.
    pub fn before(mut self, id: impl Into<String>) -> Self {
        self.cursor.get_or_insert_with(CursorSpec::default).before = Some(id.into());
        self
    }

    /// Checks cross-field consistency: cursor direction is unambiguous and
    /// a search, when present, names a non-empty text and field list.
    pub fn validate(&self) -> Result<()> {
        if let Some(cursor) = &self.cursor {
            if cursor.after.is_some() && cursor.before.is_some() {
                return Err(DbError::query(
                    "cursor cannot page after and before at the same time",
                ));
            }
            if cursor.after.is_none() && cursor.before.is_none() {
                return Err(DbError::query("cursor requires an anchor id"));
            }
        }
        if let Some(search) = &self.search {
            if search.text.is_empty() {
                return Err(DbError::query("search text must be non-empty"));
            }
            if search.fields.is_empty() {
                return Err(DbError::query("search requires at least one field"));
            }
        }
        Ok(())
    }
}
