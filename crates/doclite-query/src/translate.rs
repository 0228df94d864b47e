//! Filter/options to SQL translation.
//!
//! Field references resolve in three tiers: metadata columns (`_id`,
//! timestamp columns) stay bare, indexed fields go through their generated
//! columns, everything else goes through `jsonb_extract` on the body. Every
//! literal becomes one positional parameter; duplicates are never merged.

use std::sync::Arc;

use doclite_core::document::ID_COLUMN;
use doclite_core::error::DbError;
use doclite_core::filter::{ArrayOp, CompareOp, FieldOp, Filter, StringOp};
use doclite_core::options::{FindOptions, SearchSpec, SortOrder};
use doclite_core::scalar::Scalar;
use doclite_core::schema::Schema;

use crate::cache::TemplateCache;

/// Deepest filter nesting the translator accepts.
pub const MAX_FILTER_DEPTH: usize = 64;

/// A translated statement: SQL text plus its bound parameters in order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<Scalar>,
}

/// Which side of the anchor a cursor pages toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorDirection {
    After,
    Before,
}

/// A resolved pagination anchor: the anchor document's id and its values
/// for each requested sort key, in sort order. The collection runtime
/// resolves anchors; the translator only compares against them.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorAnchor {
    pub direction: CursorDirection,
    pub id: String,
    pub keys: Vec<Scalar>,
}

/// Translation failures.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("filter nesting exceeds the supported depth of {max}")]
    TooDeep { max: usize },

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("cursor pagination requires a resolved anchor")]
    UnresolvedCursor,
}

impl From<TranslateError> for DbError {
    fn from(e: TranslateError) -> Self {
        DbError::query(e.to_string())
    }
}

type Result<T> = std::result::Result<T, TranslateError>;

/// Field-resolution context: top level, or rebound to an array element.
enum FieldCtx {
    Root,
    Elem(String),
}

/// Translates filters and options against one collection's schema.
pub struct Translator<'a> {
    schema: &'a Schema,
    cache: Option<&'a TemplateCache>,
}

impl<'a> Translator<'a> {
    /// Creates a translator without a template cache.
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            cache: None,
        }
    }

    /// Creates a translator backed by a template cache.
    pub fn with_cache(schema: &'a Schema, cache: &'a TemplateCache) -> Self {
        Self {
            schema,
            cache: Some(cache),
        }
    }

    // -- Statements ----------------------------------------------------------

    /// Translates a full document SELECT.
    pub fn select(
        &self,
        table: &str,
        filter: &Filter,
        options: &FindOptions,
        anchor: Option<&CursorAnchor>,
    ) -> Result<SqlQuery> {
        let columns = self.select_columns();
        self.select_with_columns(table, &columns, filter, options, anchor, true)
    }

    /// Translates a SELECT returning only `_id`, used by targeted writes.
    /// Never cached: the template cache is reserved for document selects.
    pub fn select_ids(
        &self,
        table: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<SqlQuery> {
        self.select_with_columns(table, ID_COLUMN, filter, options, None, false)
    }

    /// Translates `COUNT(*)` over a filter.
    pub fn count(&self, table: &str, filter: &Filter) -> Result<SqlQuery> {
        let mut params = Vec::new();
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote_table(table));
        if let Some(clause) = self.where_clause(filter, &mut params)? {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }
        Ok(SqlQuery { sql, params })
    }

    /// Translates a bulk DELETE over a filter.
    pub fn delete(&self, table: &str, filter: &Filter) -> Result<SqlQuery> {
        let mut params = Vec::new();
        let mut sql = format!("DELETE FROM {}", quote_table(table));
        if let Some(clause) = self.where_clause(filter, &mut params)? {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }
        Ok(SqlQuery { sql, params })
    }

    /// Translates a DISTINCT over one field, excluding nulls, ascending.
    ///
    /// The `value` column carries the JSON rendering of each distinct value.
    pub fn distinct(&self, table: &str, field: &str, filter: &Filter) -> Result<SqlQuery> {
        let mut params = Vec::new();
        let resolved = self.resolve(&FieldCtx::Root, field);
        let mut clauses = Vec::new();
        if let Some(clause) = self.where_clause(filter, &mut params)? {
            clauses.push(clause);
        }
        clauses.push(format!("{resolved} IS NOT NULL"));
        let sql = format!(
            "SELECT DISTINCT {resolved} AS raw, json_quote({resolved}) AS value FROM {} WHERE {} ORDER BY raw ASC",
            quote_table(table),
            clauses.join(" AND "),
        );
        Ok(SqlQuery { sql, params })
    }

    // -- Select assembly -----------------------------------------------------

    fn select_with_columns(
        &self,
        table: &str,
        columns: &str,
        filter: &Filter,
        options: &FindOptions,
        anchor: Option<&CursorAnchor>,
        use_cache: bool,
    ) -> Result<SqlQuery> {
        let anchor = self.check_cursor(options, anchor)?;
        let effective = effective_filter(filter, options.search.as_ref());
        let sort = effective_sort(options, anchor.is_some());

        let key = if use_cache && self.cache.is_some() && cache_friendly(&effective) {
            Some(fingerprint(&effective, &sort, options, anchor))
        } else {
            None
        };

        if let (Some(cache), Some(key)) = (self.cache, key.as_deref()) {
            if let Some(sql) = cache.get(key) {
                let params = self.collect_select_params(&effective, &sort, options, anchor)?;
                return Ok(SqlQuery {
                    sql: sql.to_string(),
                    params,
                });
            }
        }

        let mut params = Vec::new();
        let mut clauses = Vec::new();
        if let Some(clause) = self.where_clause(&effective, &mut params)? {
            clauses.push(clause);
        }
        if let Some(anchor) = anchor {
            clauses.push(self.cursor_clause(&sort, options, anchor, &mut params)?);
        }

        let mut sql = format!("SELECT {columns} FROM {}", quote_table(table));
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        if !sort.is_empty() {
            let keys: Vec<String> = sort
                .iter()
                .map(|(field, order)| format!("{} {}", self.resolve(&FieldCtx::Root, field), order.sql()))
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&keys.join(", "));
        }
        push_limit_clause(options, &mut sql, &mut params);

        if let (Some(cache), Some(key)) = (self.cache, key) {
            cache.insert(key, Arc::from(sql.as_str()));
        }
        Ok(SqlQuery { sql, params })
    }

    /// Column list for document selects. `body` is read back as JSON text.
    fn select_columns(&self) -> String {
        let mut columns = vec![ID_COLUMN.to_owned(), "json(body) AS body".to_owned()];
        if let Some(created) = self.schema.timestamps().created_column() {
            columns.push(created.to_owned());
        }
        if let Some(updated) = self.schema.timestamps().updated_column() {
            columns.push(updated.to_owned());
        }
        columns.join(", ")
    }

    fn check_cursor<'c>(
        &self,
        options: &FindOptions,
        anchor: Option<&'c CursorAnchor>,
    ) -> Result<Option<&'c CursorAnchor>> {
        match &options.cursor {
            None => Ok(None),
            Some(cursor) => {
                if cursor.after.is_some() && cursor.before.is_some() {
                    return Err(TranslateError::InvalidOptions(
                        "cursor cannot page after and before at the same time".into(),
                    ));
                }
                if cursor.after.is_none() && cursor.before.is_none() {
                    return Err(TranslateError::InvalidOptions(
                        "cursor requires an anchor id".into(),
                    ));
                }
                anchor.map(Some).ok_or(TranslateError::UnresolvedCursor)
            }
        }
    }

    /// Parameter extraction for a cache hit: must push in exactly the order
    /// the builder binds them (filter walk, cursor keys, limit, skip).
    fn collect_select_params(
        &self,
        effective: &Filter,
        sort: &[(String, SortOrder)],
        options: &FindOptions,
        anchor: Option<&CursorAnchor>,
    ) -> Result<Vec<Scalar>> {
        let mut params = Vec::new();
        filter_params(effective, &mut params);
        if let Some(anchor) = anchor {
            let keys = full_cursor_keys(sort, options, anchor)?;
            for i in 0..sort.len() {
                for key in &keys[..=i] {
                    params.push(key.clone());
                }
            }
        }
        limit_params(options, &mut params);
        Ok(params)
    }

    // -- WHERE translation ---------------------------------------------------

    /// Translates a filter to a WHERE clause body. `Filter::Empty` means no
    /// constraint at all and yields `None`.
    fn where_clause(&self, filter: &Filter, params: &mut Vec<Scalar>) -> Result<Option<String>> {
        if filter.is_empty() {
            return Ok(None);
        }
        let mut elem_counter = 0usize;
        self.filter_sql(filter, &FieldCtx::Root, 1, &mut elem_counter, params)
            .map(Some)
    }

    fn filter_sql(
        &self,
        filter: &Filter,
        ctx: &FieldCtx,
        depth: usize,
        elem_counter: &mut usize,
        params: &mut Vec<Scalar>,
    ) -> Result<String> {
        if depth > MAX_FILTER_DEPTH {
            return Err(TranslateError::TooDeep {
                max: MAX_FILTER_DEPTH,
            });
        }
        match filter {
            Filter::Empty => Ok("1=1".to_owned()),
            Filter::And(inner) => {
                if inner.is_empty() {
                    return Ok("1=1".to_owned());
                }
                let parts = self.subfilters(inner, ctx, depth, elem_counter, params)?;
                Ok(format!("({})", parts.join(" AND ")))
            }
            Filter::Or(inner) => {
                if inner.is_empty() {
                    return Ok("0=1".to_owned());
                }
                let parts = self.subfilters(inner, ctx, depth, elem_counter, params)?;
                Ok(format!("({})", parts.join(" OR ")))
            }
            Filter::Nor(inner) => {
                if inner.is_empty() {
                    return Ok("1=1".to_owned());
                }
                let parts = self.subfilters(inner, ctx, depth, elem_counter, params)?;
                Ok(format!("NOT ({})", parts.join(" OR ")))
            }
            Filter::Not(inner) => {
                let sql = self.filter_sql(inner, ctx, depth + 1, elem_counter, params)?;
                Ok(format!("NOT ({sql})"))
            }
            Filter::Field { name, op } => self.field_sql(name, op, ctx, depth, elem_counter, params),
        }
    }

    fn subfilters(
        &self,
        inner: &[Filter],
        ctx: &FieldCtx,
        depth: usize,
        elem_counter: &mut usize,
        params: &mut Vec<Scalar>,
    ) -> Result<Vec<String>> {
        inner
            .iter()
            .map(|f| self.filter_sql(f, ctx, depth + 1, elem_counter, params))
            .collect()
    }

    fn field_sql(
        &self,
        name: &str,
        op: &FieldOp,
        ctx: &FieldCtx,
        depth: usize,
        elem_counter: &mut usize,
        params: &mut Vec<Scalar>,
    ) -> Result<String> {
        match op {
            FieldOp::Cmp(cmp) => {
                let field = self.resolve(ctx, name);
                Ok(match cmp {
                    CompareOp::Eq(v) => {
                        params.push(v.clone());
                        format!("{field} = ?")
                    }
                    CompareOp::Ne(v) => {
                        params.push(v.clone());
                        format!("{field} != ?")
                    }
                    CompareOp::Gt(v) => {
                        params.push(v.clone());
                        format!("{field} > ?")
                    }
                    CompareOp::Gte(v) => {
                        params.push(v.clone());
                        format!("{field} >= ?")
                    }
                    CompareOp::Lt(v) => {
                        params.push(v.clone());
                        format!("{field} < ?")
                    }
                    CompareOp::Lte(v) => {
                        params.push(v.clone());
                        format!("{field} <= ?")
                    }
                    CompareOp::In(values) => {
                        if values.is_empty() {
                            "0=1".to_owned()
                        } else {
                            params.extend(values.iter().cloned());
                            format!("{field} IN ({})", placeholders(values.len()))
                        }
                    }
                    CompareOp::NotIn(values) => {
                        if values.is_empty() {
                            "1=1".to_owned()
                        } else {
                            params.extend(values.iter().cloned());
                            format!("{field} NOT IN ({})", placeholders(values.len()))
                        }
                    }
                })
            }
            FieldOp::Str(op) => {
                let field = self.resolve(ctx, name);
                Ok(match op {
                    StringOp::Like(pattern) => {
                        params.push(Scalar::Text(pattern.clone()));
                        format!("{field} LIKE ?")
                    }
                    StringOp::ILike(pattern) => {
                        params.push(Scalar::Text(pattern.clone()));
                        format!("{field} LIKE ? COLLATE NOCASE")
                    }
                    StringOp::Contains(text) => {
                        params.push(Scalar::Text(format!("%{text}%")));
                        format!("{field} LIKE ?")
                    }
                    StringOp::StartsWith(prefix) => {
                        params.push(Scalar::Text(format!("{prefix}%")));
                        format!("{field} LIKE ?")
                    }
                    StringOp::EndsWith(suffix) => {
                        params.push(Scalar::Text(format!("%{suffix}")));
                        format!("{field} LIKE ?")
                    }
                })
            }
            FieldOp::Arr(op) => self.array_sql(name, op, ctx, depth, elem_counter, params),
            FieldOp::Exists(positive) => Ok(self.exists_sql(ctx, name, *positive)),
        }
    }

    fn array_sql(
        &self,
        name: &str,
        op: &ArrayOp,
        ctx: &FieldCtx,
        depth: usize,
        elem_counter: &mut usize,
        params: &mut Vec<Scalar>,
    ) -> Result<String> {
        let field = self.resolve(ctx, name);
        match op {
            ArrayOp::All(values) => {
                if values.is_empty() {
                    return Ok("1=1".to_owned());
                }
                let parts: Vec<String> = values
                    .iter()
                    .map(|v| {
                        params.push(v.clone());
                        format!(
                            "EXISTS (SELECT 1 FROM json_each({field}) WHERE json_each.value = ?)"
                        )
                    })
                    .collect();
                if parts.len() == 1 {
                    Ok(parts.into_iter().next().unwrap_or_default())
                } else {
                    Ok(format!("({})", parts.join(" AND ")))
                }
            }
            ArrayOp::Size(n) => {
                params.push(Scalar::Int(*n));
                Ok(format!("json_array_length({field}) = ?"))
            }
            ArrayOp::ElemMatch(inner) => {
                let alias = format!("je{}", *elem_counter);
                *elem_counter += 1;
                let elem_ctx = FieldCtx::Elem(format!("{alias}.value"));
                let inner_sql = self.filter_sql(inner, &elem_ctx, depth + 1, elem_counter, params)?;
                Ok(format!(
                    "EXISTS (SELECT 1 FROM json_each({field}) AS {alias} WHERE {inner_sql})"
                ))
            }
            ArrayOp::Index(index, inner) => {
                let elem_ctx = FieldCtx::Elem(format!("json_extract({field}, '$[{index}]')"));
                self.filter_sql(inner, &elem_ctx, depth + 1, elem_counter, params)
            }
        }
    }

    // -- Field resolution ----------------------------------------------------

    fn resolve(&self, ctx: &FieldCtx, name: &str) -> String {
        match ctx {
            FieldCtx::Root => {
                if self.schema.is_meta_column(name) {
                    return name.to_owned();
                }
                match self.schema.field(name) {
                    Some(field) if field.indexed => field.generated_column(),
                    Some(field) => {
                        format!("jsonb_extract(body, '{}')", escape_path(&field.path()))
                    }
                    None => format!("jsonb_extract(body, '{}')", escape_path(&dotted_path(name))),
                }
            }
            FieldCtx::Elem(expr) => {
                if name.is_empty() {
                    expr.clone()
                } else {
                    format!("jsonb_extract({expr}, '{}')", escape_path(&dotted_path(name)))
                }
            }
        }
    }

    /// Existence probes distinguish "absent" from "json null", which the
    /// value form cannot, so they go through two-argument `json_type`.
    fn exists_sql(&self, ctx: &FieldCtx, name: &str, positive: bool) -> String {
        let suffix = if positive { "IS NOT NULL" } else { "IS NULL" };
        match ctx {
            FieldCtx::Root => {
                if self.schema.is_meta_column(name) {
                    return if positive { "1=1" } else { "0=1" }.to_owned();
                }
                let path = self
                    .schema
                    .field(name)
                    .map(|f| f.path())
                    .unwrap_or_else(|| dotted_path(name));
                format!("json_type(body, '{}') {suffix}", escape_path(&path))
            }
            FieldCtx::Elem(expr) => {
                if name.is_empty() {
                    return if positive { "1=1" } else { "0=1" }.to_owned();
                }
                format!(
                    "json_type({expr}, '{}') {suffix}",
                    escape_path(&dotted_path(name))
                )
            }
        }
    }

    // -- Cursor --------------------------------------------------------------

    fn cursor_clause(
        &self,
        sort: &[(String, SortOrder)],
        options: &FindOptions,
        anchor: &CursorAnchor,
        params: &mut Vec<Scalar>,
    ) -> Result<String> {
        let keys = full_cursor_keys(sort, options, anchor)?;
        let mut disjuncts = Vec::with_capacity(sort.len());
        for i in 0..sort.len() {
            let mut terms = Vec::with_capacity(i + 1);
            for j in 0..i {
                terms.push(format!("{} = ?", self.resolve(&FieldCtx::Root, &sort[j].0)));
                params.push(keys[j].clone());
            }
            let op = cursor_cmp(sort[i].1, anchor.direction);
            terms.push(format!("{} {op} ?", self.resolve(&FieldCtx::Root, &sort[i].0)));
            params.push(keys[i].clone());
            if terms.len() == 1 {
                disjuncts.push(terms.remove(0));
            } else {
                disjuncts.push(format!("({})", terms.join(" AND ")));
            }
        }
        Ok(format!("({})", disjuncts.join(" OR ")))
    }
}

// ---------------------------------------------------------------------------
// Helpers shared by the build and cache-hit paths
// ---------------------------------------------------------------------------

/// Folds a search into the base filter: an OR of contains-matches over the
/// searched fields, ANDed with the base.
fn effective_filter(filter: &Filter, search: Option<&SearchSpec>) -> Filter {
    let Some(search) = search else {
        return filter.clone();
    };
    let matches: Vec<Filter> = search
        .fields
        .iter()
        .map(|field| {
            let op = if search.case_sensitive {
                StringOp::Contains(search.text.clone())
            } else {
                StringOp::ILike(format!("%{}%", search.text))
            };
            Filter::Field {
                name: field.clone(),
                op: FieldOp::Str(op),
            }
        })
        .collect();
    let search_filter = Filter::Or(matches);
    if filter.is_empty() {
        search_filter
    } else {
        Filter::And(vec![filter.clone(), search_filter])
    }
}

/// The sort keys actually emitted: the requested keys, plus `_id` ascending
/// as a final tiebreaker when a cursor is active and `_id` is absent.
fn effective_sort(options: &FindOptions, cursor_active: bool) -> Vec<(String, SortOrder)> {
    let mut sort = options.sort.clone();
    if cursor_active && !sort.iter().any(|(field, _)| field == ID_COLUMN) {
        sort.push((ID_COLUMN.to_owned(), SortOrder::Asc));
    }
    sort
}

/// Anchor values aligned with the effective sort: caller-resolved values for
/// the requested keys, the anchor id for the appended tiebreaker.
fn full_cursor_keys(
    sort: &[(String, SortOrder)],
    options: &FindOptions,
    anchor: &CursorAnchor,
) -> std::result::Result<Vec<Scalar>, TranslateError> {
    if anchor.keys.len() != options.sort.len() {
        return Err(TranslateError::InvalidOptions(format!(
            "cursor anchor carries {} sort values but the sort has {} keys",
            anchor.keys.len(),
            options.sort.len()
        )));
    }
    let mut keys = anchor.keys.clone();
    keys.extend(
        std::iter::repeat_with(|| Scalar::Text(anchor.id.clone())).take(sort.len() - keys.len()),
    );
    Ok(keys)
}

fn cursor_cmp(order: SortOrder, direction: CursorDirection) -> &'static str {
    match (direction, order) {
        (CursorDirection::After, SortOrder::Asc) | (CursorDirection::Before, SortOrder::Desc) => ">",
        (CursorDirection::After, SortOrder::Desc) | (CursorDirection::Before, SortOrder::Asc) => "<",
    }
}

fn push_limit_clause(options: &FindOptions, sql: &mut String, params: &mut Vec<Scalar>) {
    // OFFSET needs a LIMIT in SQLite; -1 means unlimited.
    if options.limit.is_some() || options.skip.is_some() {
        sql.push_str(" LIMIT ?");
        params.push(Scalar::Int(options.limit.unwrap_or(-1)));
        if let Some(skip) = options.skip {
            sql.push_str(" OFFSET ?");
            params.push(Scalar::Int(skip));
        }
    }
}

fn limit_params(options: &FindOptions, params: &mut Vec<Scalar>) {
    if options.limit.is_some() || options.skip.is_some() {
        params.push(Scalar::Int(options.limit.unwrap_or(-1)));
        if let Some(skip) = options.skip {
            params.push(Scalar::Int(skip));
        }
    }
}

/// Pushes the filter's literals in emission order, mirroring `filter_sql`.
fn filter_params(filter: &Filter, params: &mut Vec<Scalar>) {
    match filter {
        Filter::Empty => {}
        Filter::And(inner) | Filter::Or(inner) | Filter::Nor(inner) => {
            for f in inner {
                filter_params(f, params);
            }
        }
        Filter::Not(inner) => filter_params(inner, params),
        Filter::Field { op, .. } => match op {
            FieldOp::Cmp(cmp) => match cmp {
                CompareOp::Eq(v)
                | CompareOp::Ne(v)
                | CompareOp::Gt(v)
                | CompareOp::Gte(v)
                | CompareOp::Lt(v)
                | CompareOp::Lte(v) => params.push(v.clone()),
                CompareOp::In(values) | CompareOp::NotIn(values) => {
                    params.extend(values.iter().cloned());
                }
            },
            FieldOp::Str(op) => match op {
                StringOp::Like(p) | StringOp::ILike(p) => params.push(Scalar::Text(p.clone())),
                StringOp::Contains(s) => params.push(Scalar::Text(format!("%{s}%"))),
                StringOp::StartsWith(s) => params.push(Scalar::Text(format!("{s}%"))),
                StringOp::EndsWith(s) => params.push(Scalar::Text(format!("%{s}"))),
            },
            FieldOp::Arr(op) => match op {
                ArrayOp::All(values) => params.extend(values.iter().cloned()),
                ArrayOp::Size(n) => params.push(Scalar::Int(*n)),
                ArrayOp::ElemMatch(inner) | ArrayOp::Index(_, inner) => {
                    filter_params(inner, params);
                }
            },
            FieldOp::Exists(_) => {}
        },
    }
}

/// Subtrees with array-element rebinding are always freshly translated.
fn cache_friendly(filter: &Filter) -> bool {
    match filter {
        Filter::Empty => true,
        Filter::And(inner) | Filter::Or(inner) | Filter::Nor(inner) => {
            inner.iter().all(cache_friendly)
        }
        Filter::Not(inner) => cache_friendly(inner),
        Filter::Field { op, .. } => !matches!(
            op,
            FieldOp::Arr(ArrayOp::ElemMatch(_)) | FieldOp::Arr(ArrayOp::Index(..))
        ),
    }
}

/// Shape fingerprint over the effective filter and options: operators,
/// field names, structure, and list lengths — never values.
fn fingerprint(
    filter: &Filter,
    sort: &[(String, SortOrder)],
    options: &FindOptions,
    anchor: Option<&CursorAnchor>,
) -> String {
    let mut out = String::with_capacity(64);
    filter_shape(filter, &mut out);
    out.push('|');
    for (field, order) in sort {
        escape_shape(field, &mut out);
        out.push(match order {
            SortOrder::Asc => '+',
            SortOrder::Desc => '-',
        });
        out.push(',');
    }
    out.push('|');
    if options.limit.is_some() || options.skip.is_some() {
        out.push('L');
    }
    if options.skip.is_some() {
        out.push('K');
    }
    if let Some(anchor) = anchor {
        out.push(match anchor.direction {
            CursorDirection::After => '>',
            CursorDirection::Before => '<',
        });
    }
    out
}

fn filter_shape(filter: &Filter, out: &mut String) {
    match filter {
        Filter::Empty => out.push('E'),
        Filter::And(inner) => shape_list("A", inner, out),
        Filter::Or(inner) => shape_list("O", inner, out),
        Filter::Nor(inner) => shape_list("N", inner, out),
        Filter::Not(inner) => {
            out.push_str("!(");
            filter_shape(inner, out);
            out.push(')');
        }
        Filter::Field { name, op } => {
            out.push_str("F(");
            escape_shape(name, out);
            out.push(';');
            match op {
                FieldOp::Cmp(cmp) => match cmp {
                    CompareOp::Eq(_) => out.push_str("eq"),
                    CompareOp::Ne(_) => out.push_str("ne"),
                    CompareOp::Gt(_) => out.push_str("gt"),
                    CompareOp::Gte(_) => out.push_str("gte"),
                    CompareOp::Lt(_) => out.push_str("lt"),
                    CompareOp::Lte(_) => out.push_str("lte"),
                    CompareOp::In(values) => {
                        out.push_str("in#");
                        out.push_str(&values.len().to_string());
                    }
                    CompareOp::NotIn(values) => {
                        out.push_str("nin#");
                        out.push_str(&values.len().to_string());
                    }
                },
                FieldOp::Str(op) => out.push_str(match op {
                    StringOp::Like(_) => "like",
                    StringOp::ILike(_) => "ilike",
                    StringOp::Contains(_) => "has",
                    StringOp::StartsWith(_) => "pre",
                    StringOp::EndsWith(_) => "suf",
                }),
                FieldOp::Arr(op) => match op {
                    ArrayOp::All(values) => {
                        out.push_str("all#");
                        out.push_str(&values.len().to_string());
                    }
                    ArrayOp::Size(_) => out.push_str("size"),
                    // Not cacheable; shaped only for completeness.
                    ArrayOp::ElemMatch(inner) => {
                        out.push_str("em(");
                        filter_shape(inner, out);
                        out.push(')');
                    }
                    ArrayOp::Index(index, inner) => {
                        out.push_str("ix");
                        out.push_str(&index.to_string());
                        out.push('(');
                        filter_shape(inner, out);
                        out.push(')');
                    }
                },
                FieldOp::Exists(true) => out.push_str("ex+"),
                FieldOp::Exists(false) => out.push_str("ex-"),
            }
            out.push(')');
        }
    }
}

fn shape_list(tag: &str, inner: &[Filter], out: &mut String) {
    out.push_str(tag);
    out.push('[');
    for f in inner {
        filter_shape(f, out);
        out.push(',');
    }
    out.push(']');
}

/// Field names feed the fingerprint verbatim; escape the delimiters so no
/// name can forge another shape.
fn escape_shape(name: &str, out: &mut String) {
    for c in name.chars() {
        if matches!(c, '\\' | ';' | ')' | ',' | '|' | '(') {
            out.push('\\');
        }
        out.push(c);
    }
}

fn placeholders(n: usize) -> String {
    let mut out = String::with_capacity(n * 3);
    for i in 0..n {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('?');
    }
    out
}

fn dotted_path(name: &str) -> String {
    format!("$.{name}")
}

fn escape_path(path: &str) -> String {
    path.replace('\'', "''")
}

fn quote_table(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use doclite_core::schema::{FieldDef, SqlType};
    use pretty_assertions::assert_eq;

    fn schema() -> Schema {
        Schema::builder()
            .field(FieldDef::new("name", SqlType::Text).indexed())
            .field(FieldDef::new("age", SqlType::Integer).indexed())
            .field(FieldDef::new("email", SqlType::Text).unique())
            .field(FieldDef::new("status", SqlType::Text))
            .field(FieldDef::new("tags", SqlType::Text))
            .build()
            .unwrap()
    }

    fn select(filter: &Filter) -> SqlQuery {
        let schema = schema();
        Translator::new(&schema)
            .select("users", filter, &FindOptions::new(), None)
            .unwrap()
    }

    fn where_of(query: &SqlQuery) -> &str {
        query
            .sql
            .split_once(" WHERE ")
            .map(|(_, rest)| rest)
            .unwrap_or("")
    }

    #[test]
    fn indexed_fields_use_generated_columns() {
        let q = select(&Filter::field("name").eq("Alice"));
        assert_eq!(where_of(&q), "_name = ?");
        assert_eq!(q.params, vec![Scalar::Text("Alice".into())]);
    }

    #[test]
    fn non_indexed_fields_use_jsonb_extract() {
        let q = select(&Filter::field("status").eq("active"));
        assert_eq!(where_of(&q), "jsonb_extract(body, '$.status') = ?");
        assert_eq!(q.params, vec![Scalar::Text("active".into())]);
    }

    #[test]
    fn meta_columns_stay_bare() {
        let q = select(&Filter::field("_id").eq("x"));
        assert_eq!(where_of(&q), "_id = ?");
        let q = select(&Filter::field("createdAt").gte(100));
        assert_eq!(where_of(&q), "createdAt >= ?");
        assert_eq!(q.params, vec![Scalar::Int(100)]);
    }

    #[test]
    fn dotted_names_produce_nested_paths() {
        let q = select(&Filter::field("profile.city").eq("Oslo"));
        assert_eq!(where_of(&q), "jsonb_extract(body, '$.profile.city') = ?");
    }

    #[test]
    fn or_of_in_and_eq_matches_expected_sql() {
        let filter = Filter::or([
            Filter::field("age").in_list([25, 30]),
            Filter::field("role").eq("admin"),
        ]);
        let q = select(&filter);
        assert_eq!(
            where_of(&q),
            "(_age IN (?, ?) OR jsonb_extract(body, '$.role') = ?)"
        );
        assert_eq!(
            q.params,
            vec![Scalar::Int(25), Scalar::Int(30), Scalar::Text("admin".into())]
        );
    }

    #[test]
    fn empty_list_operators_collapse_to_constants() {
        assert_eq!(where_of(&select(&Filter::field("age").in_list(Vec::<i64>::new()))), "0=1");
        assert_eq!(where_of(&select(&Filter::field("age").not_in(Vec::<i64>::new()))), "1=1");
        assert_eq!(where_of(&select(&Filter::field("tags").all(Vec::<i64>::new()))), "1=1");
        assert_eq!(where_of(&select(&Filter::and([]))), "1=1");
        assert_eq!(where_of(&select(&Filter::or([]))), "0=1");
        assert_eq!(where_of(&select(&Filter::nor([]))), "1=1");
    }

    #[test]
    fn empty_filter_has_no_where() {
        let q = select(&Filter::Empty);
        assert_eq!(q.sql, "SELECT _id, json(body) AS body, createdAt, updatedAt FROM \"users\"");
        assert!(q.params.is_empty());
    }

    #[test]
    fn string_operators_transform_patterns() {
        let q = select(&Filter::field("name").contains("li"));
        assert_eq!(where_of(&q), "_name LIKE ?");
        assert_eq!(q.params, vec![Scalar::Text("%li%".into())]);

        let q = select(&Filter::field("name").starts_with("Al"));
        assert_eq!(q.params, vec![Scalar::Text("Al%".into())]);

        let q = select(&Filter::field("name").ends_with("ce"));
        assert_eq!(q.params, vec![Scalar::Text("%ce".into())]);

        let q = select(&Filter::field("name").ilike("al%"));
        assert_eq!(where_of(&q), "_name LIKE ? COLLATE NOCASE");
        assert_eq!(q.params, vec![Scalar::Text("al%".into())]);

        let q = select(&Filter::field("name").like("%_x%"));
        // Patterns pass through untouched.
        assert_eq!(q.params, vec![Scalar::Text("%_x%".into())]);
    }

    #[test]
    fn array_all_expands_to_exists_per_value() {
        let q = select(&Filter::field("tags").all(["a", "b"]));
        assert_eq!(
            where_of(&q),
            "(EXISTS (SELECT 1 FROM json_each(jsonb_extract(body, '$.tags')) WHERE json_each.value = ?) \
             AND EXISTS (SELECT 1 FROM json_each(jsonb_extract(body, '$.tags')) WHERE json_each.value = ?))"
        );
        assert_eq!(q.params.len(), 2);
    }

    #[test]
    fn array_size_uses_json_array_length() {
        let q = select(&Filter::field("tags").size(3));
        assert_eq!(where_of(&q), "json_array_length(jsonb_extract(body, '$.tags')) = ?");
        assert_eq!(q.params, vec![Scalar::Int(3)]);
    }

    #[test]
    fn elem_match_rebinds_fields_to_the_element() {
        let q = select(&Filter::field("tags").elem_match(Filter::field("k").eq(1)));
        assert_eq!(
            where_of(&q),
            "EXISTS (SELECT 1 FROM json_each(jsonb_extract(body, '$.tags')) AS je0 \
             WHERE jsonb_extract(je0.value, '$.k') = ?)"
        );
    }

    #[test]
    fn elem_match_with_empty_name_matches_scalar_elements() {
        let q = select(&Filter::field("tags").elem_match(Filter::field("").eq(5)));
        assert_eq!(
            where_of(&q),
            "EXISTS (SELECT 1 FROM json_each(jsonb_extract(body, '$.tags')) AS je0 WHERE je0.value = ?)"
        );
    }

    #[test]
    fn index_op_rebinds_to_the_array_slot() {
        let q = select(&Filter::field("tags").at_index(2, Filter::field("").eq("x")));
        assert_eq!(
            where_of(&q),
            "json_extract(jsonb_extract(body, '$.tags'), '$[2]') = ?"
        );
    }

    #[test]
    fn exists_uses_json_type_probe() {
        let q = select(&Filter::field("status").exists(true));
        assert_eq!(where_of(&q), "json_type(body, '$.status') IS NOT NULL");
        let q = select(&Filter::field("status").exists(false));
        assert_eq!(where_of(&q), "json_type(body, '$.status') IS NULL");
        let q = select(&Filter::field("_id").exists(true));
        assert_eq!(where_of(&q), "1=1");
    }

    #[test]
    fn nor_and_not_negate() {
        let q = select(&Filter::nor([
            Filter::field("age").eq(1),
            Filter::field("age").eq(2),
        ]));
        assert_eq!(where_of(&q), "NOT (_age = ? OR _age = ?)");
        let q = select(&Filter::not(Filter::field("age").eq(1)));
        assert_eq!(where_of(&q), "NOT (_age = ?)");
    }

    #[test]
    fn depth_guard_rejects_runaway_nesting() {
        let mut filter = Filter::field("age").eq(1);
        for _ in 0..MAX_FILTER_DEPTH {
            filter = Filter::not(filter);
        }
        let schema = schema();
        let err = Translator::new(&schema)
            .select("users", &filter, &FindOptions::new(), None)
            .unwrap_err();
        assert!(matches!(err, TranslateError::TooDeep { .. }));

        let mut shallow = Filter::field("age").eq(1);
        for _ in 0..MAX_FILTER_DEPTH - 2 {
            shallow = Filter::not(shallow);
        }
        assert!(
            Translator::new(&schema)
                .select("users", &shallow, &FindOptions::new(), None)
                .is_ok()
        );
    }

    #[test]
    fn duplicate_literals_bind_separately() {
        let filter = Filter::and([
            Filter::field("age").eq(30),
            Filter::field("age").ne(30),
        ]);
        let q = select(&filter);
        assert_eq!(q.params, vec![Scalar::Int(30), Scalar::Int(30)]);
    }

    #[test]
    fn translation_is_deterministic() {
        let filter = Filter::and([
            Filter::field("name").contains("a"),
            Filter::or([
                Filter::field("age").in_list([1, 2, 3]),
                Filter::field("status").exists(false),
            ]),
        ]);
        let schema = schema();
        let translator = Translator::new(&schema);
        let opts = FindOptions::new().sort("age", SortOrder::Desc).limit(5);
        let a = translator.select("users", &filter, &opts, None).unwrap();
        let b = translator.select("users", &filter, &opts, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sort_limit_skip_render_in_order() {
        let opts = FindOptions::new()
            .sort("age", SortOrder::Desc)
            .sort("status", SortOrder::Asc)
            .limit(10)
            .skip(20);
        let schema = schema();
        let q = Translator::new(&schema)
            .select("users", &Filter::Empty, &opts, None)
            .unwrap();
        assert!(q.sql.ends_with(
            "ORDER BY _age DESC, jsonb_extract(body, '$.status') ASC LIMIT ? OFFSET ?"
        ));
        assert_eq!(q.params, vec![Scalar::Int(10), Scalar::Int(20)]);
    }

    #[test]
    fn skip_without_limit_emits_unbounded_limit() {
        let schema = schema();
        let q = Translator::new(&schema)
            .select("users", &Filter::Empty, &FindOptions::new().skip(7), None)
            .unwrap();
        assert!(q.sql.ends_with("LIMIT ? OFFSET ?"));
        assert_eq!(q.params, vec![Scalar::Int(-1), Scalar::Int(7)]);
    }

    #[test]
    fn search_expands_to_contains_or() {
        let schema = schema();
        let opts = FindOptions::new().search("smith", ["name", "status"]);
        let q = Translator::new(&schema)
            .select("users", &Filter::field("age").gt(18), &opts, None)
            .unwrap();
        assert_eq!(
            where_of(&q),
            "(_age > ? AND (_name LIKE ? COLLATE NOCASE OR jsonb_extract(body, '$.status') LIKE ? COLLATE NOCASE))"
        );
        assert_eq!(
            q.params,
            vec![
                Scalar::Int(18),
                Scalar::Text("%smith%".into()),
                Scalar::Text("%smith%".into())
            ]
        );
    }

    #[test]
    fn case_sensitive_search_uses_plain_like() {
        let schema = schema();
        let opts = FindOptions::new().search("Ada", ["name"]).case_sensitive();
        let q = Translator::new(&schema)
            .select("users", &Filter::Empty, &opts, None)
            .unwrap();
        assert_eq!(where_of(&q), "(_name LIKE ?)");
        assert_eq!(q.params, vec![Scalar::Text("%Ada%".into())]);
    }

    #[test]
    fn cursor_without_sort_compares_ids() {
        let schema = schema();
        let opts = FindOptions::new().after("01H");
        let anchor = CursorAnchor {
            direction: CursorDirection::After,
            id: "01H".into(),
            keys: vec![],
        };
        let q = Translator::new(&schema)
            .select("users", &Filter::Empty, &opts, Some(&anchor))
            .unwrap();
        assert_eq!(where_of(&q), "(_id > ?) ORDER BY _id ASC");
        assert_eq!(q.params, vec![Scalar::Text("01H".into())]);
    }

    #[test]
    fn cursor_with_sort_builds_tuple_disjunction() {
        let schema = schema();
        let opts = FindOptions::new().sort("age", SortOrder::Desc).after("01H");
        let anchor = CursorAnchor {
            direction: CursorDirection::After,
            id: "01H".into(),
            keys: vec![Scalar::Int(30)],
        };
        let q = Translator::new(&schema)
            .select("users", &Filter::Empty, &opts, Some(&anchor))
            .unwrap();
        assert_eq!(
            where_of(&q),
            "(_age < ? OR (_age = ? AND _id > ?)) ORDER BY _age DESC, _id ASC"
        );
        assert_eq!(
            q.params,
            vec![
                Scalar::Int(30),
                Scalar::Int(30),
                Scalar::Text("01H".into())
            ]
        );
    }

    #[test]
    fn before_cursor_flips_comparisons() {
        let schema = schema();
        let opts = FindOptions::new().sort("age", SortOrder::Asc).before("01H");
        let anchor = CursorAnchor {
            direction: CursorDirection::Before,
            id: "01H".into(),
            keys: vec![Scalar::Int(30)],
        };
        let q = Translator::new(&schema)
            .select("users", &Filter::Empty, &opts, Some(&anchor))
            .unwrap();
        assert_eq!(
            where_of(&q),
            "(_age < ? OR (_age = ? AND _id < ?)) ORDER BY _age ASC, _id ASC"
        );
    }

    #[test]
    fn cursor_without_anchor_is_an_error() {
        let schema = schema();
        let err = Translator::new(&schema)
            .select("users", &Filter::Empty, &FindOptions::new().after("x"), None)
            .unwrap_err();
        assert!(matches!(err, TranslateError::UnresolvedCursor));
    }

    #[test]
    fn ambiguous_cursor_is_an_error() {
        let schema = schema();
        let opts = FindOptions::new().after("a").before("b");
        let anchor = CursorAnchor {
            direction: CursorDirection::After,
            id: "a".into(),
            keys: vec![],
        };
        let err = Translator::new(&schema)
            .select("users", &Filter::Empty, &opts, Some(&anchor))
            .unwrap_err();
        assert!(matches!(err, TranslateError::InvalidOptions(_)));
    }

    #[test]
    fn anchor_key_mismatch_is_an_error() {
        let schema = schema();
        let opts = FindOptions::new().sort("age", SortOrder::Asc).after("x");
        let anchor = CursorAnchor {
            direction: CursorDirection::After,
            id: "x".into(),
            keys: vec![],
        };
        let err = Translator::new(&schema)
            .select("users", &Filter::Empty, &opts, Some(&anchor))
            .unwrap_err();
        assert!(matches!(err, TranslateError::InvalidOptions(_)));
    }

    #[test]
    fn count_and_delete_share_where_translation() {
        let schema = schema();
        let translator = Translator::new(&schema);
        let filter = Filter::field("age").gte(18);
        let count = translator.count("users", &filter).unwrap();
        assert_eq!(count.sql, "SELECT COUNT(*) FROM \"users\" WHERE _age >= ?");
        let delete = translator.delete("users", &filter).unwrap();
        assert_eq!(delete.sql, "DELETE FROM \"users\" WHERE _age >= ?");
        assert_eq!(count.params, delete.params);
    }

    #[test]
    fn distinct_excludes_nulls_and_orders_ascending() {
        let schema = schema();
        let translator = Translator::new(&schema);
        let q = translator.distinct("users", "age", &Filter::Empty).unwrap();
        assert_eq!(
            q.sql,
            "SELECT DISTINCT _age AS raw, json_quote(_age) AS value FROM \"users\" \
             WHERE _age IS NOT NULL ORDER BY raw ASC"
        );
        let q = translator
            .distinct("users", "status", &Filter::field("age").gt(1))
            .unwrap();
        assert_eq!(
            q.sql,
            "SELECT DISTINCT jsonb_extract(body, '$.status') AS raw, \
             json_quote(jsonb_extract(body, '$.status')) AS value FROM \"users\" \
             WHERE _age > ? AND jsonb_extract(body, '$.status') IS NOT NULL ORDER BY raw ASC"
        );
    }

    #[test]
    fn select_ids_targets_only_the_id_column() {
        let schema = schema();
        let translator = Translator::new(&schema);
        let q = translator
            .select_ids(
                "users",
                &Filter::field("age").gt(1),
                &FindOptions::new().sort("age", SortOrder::Asc).limit(1),
            )
            .unwrap();
        assert_eq!(
            q.sql,
            "SELECT _id FROM \"users\" WHERE _age > ? ORDER BY _age ASC LIMIT ?"
        );
    }

    #[test]
    fn timestamps_disabled_shrinks_the_column_list() {
        let schema = Schema::builder()
            .field(FieldDef::new("name", SqlType::Text).indexed())
            .without_timestamps()
            .build()
            .unwrap();
        let q = Translator::new(&schema)
            .select("logs", &Filter::Empty, &FindOptions::new(), None)
            .unwrap();
        assert_eq!(q.sql, "SELECT _id, json(body) AS body FROM \"logs\"");
    }

    #[test]
    fn param_count_equals_literal_leaves() {
        let filter = Filter::and([
            Filter::field("age").in_list([1, 2, 3]),
            Filter::field("name").contains("x"),
            Filter::field("tags").all(["a", "b"]),
            Filter::field("tags").size(2),
            Filter::field("status").exists(true),
            Filter::not(Filter::field("age").lt(10)),
        ]);
        // 3 (in) + 1 (contains) + 2 (all) + 1 (size) + 0 (exists) + 1 (lt)
        let q = select(&filter);
        assert_eq!(q.params.len(), 8);
        assert_eq!(q.sql.matches('?').count(), 8);
    }

    // -- Template cache ------------------------------------------------------

    #[test]
    fn cache_hit_matches_fresh_translation() {
        let schema = schema();
        let cache = TemplateCache::default();
        let cached = Translator::with_cache(&schema, &cache);
        let fresh = Translator::new(&schema);

        let opts = FindOptions::new().sort("age", SortOrder::Desc).limit(10).skip(5);
        let first = cached
            .select("users", &Filter::field("age").gt(21), &opts, None)
            .unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.misses(), 1);

        // Same shape, different values: template reused, params re-extracted.
        let hit = cached
            .select("users", &Filter::field("age").gt(65), &opts, None)
            .unwrap();
        assert_eq!(cache.hits(), 1);
        assert_eq!(hit.sql, first.sql);

        let reference = fresh
            .select("users", &Filter::field("age").gt(65), &opts, None)
            .unwrap();
        assert_eq!(hit, reference);
    }

    #[test]
    fn in_list_length_changes_the_template() {
        let schema = schema();
        let cache = TemplateCache::default();
        let translator = Translator::with_cache(&schema, &cache);
        let opts = FindOptions::new();
        translator
            .select("users", &Filter::field("age").in_list([1]), &opts, None)
            .unwrap();
        translator
            .select("users", &Filter::field("age").in_list([1, 2]), &opts, None)
            .unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.hits(), 0);
    }

    #[test]
    fn elem_match_bypasses_the_cache() {
        let schema = schema();
        let cache = TemplateCache::default();
        let translator = Translator::with_cache(&schema, &cache);
        let filter = Filter::field("tags").elem_match(Filter::field("k").eq(1));
        translator
            .select("users", &filter, &FindOptions::new(), None)
            .unwrap();
        translator
            .select("users", &filter, &FindOptions::new(), None)
            .unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.hits(), 0);
    }

    #[test]
    fn id_selects_do_not_pollute_the_cache() {
        let schema = schema();
        let cache = TemplateCache::default();
        let translator = Translator::with_cache(&schema, &cache);
        translator
            .select_ids("users", &Filter::field("age").gt(1), &FindOptions::new())
            .unwrap();
        assert!(cache.is_empty());
    }
}
