//! `Query<T>`: a declarative, cloneable description of a read.

use super::filter::FilterExpr;
use super::types::{Collation, MAX_SORT_FIELDS, Order, Projection, ReadPreference, SortSpec, sort_document};
use crate::cache::{CacheKeyParts, cache_key};
use crate::driver::{CountRequest, FindRequest};
use crate::entity::{Entity, EntityMeta};
use crate::errors::OdmError;
use crate::odm::OdmCore;
use crate::pool::AsyncPool;
use bson::{Bson, Document};
use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

pub struct Query<T: Entity> {
    pub(crate) core: Arc<OdmCore>,
    pub(crate) pool: Weak<AsyncPool>,
    pub(crate) meta: Arc<EntityMeta>,
    raw_filter: Option<Document>,
    and_exprs: Vec<FilterExpr>,
    or_exprs: Vec<FilterExpr>,
    nor_exprs: Vec<FilterExpr>,
    where_clause: Option<String>,
    sort: Vec<SortSpec>,
    pub(crate) skip: u64,
    pub(crate) limit: u64,
    pub(crate) projection: Projection,
    collation: Option<Collation>,
    read_preference: Option<ReadPreference>,
    collection: String,
    tags: BTreeSet<String>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            pool: Weak::clone(&self.pool),
            meta: Arc::clone(&self.meta),
            raw_filter: self.raw_filter.clone(),
            and_exprs: self.and_exprs.clone(),
            or_exprs: self.or_exprs.clone(),
            nor_exprs: self.nor_exprs.clone(),
            where_clause: self.where_clause.clone(),
            sort: self.sort.clone(),
            skip: self.skip,
            limit: self.limit,
            projection: self.projection.clone(),
            collation: self.collation.clone(),
            read_preference: self.read_preference,
            collection: self.collection.clone(),
            tags: self.tags.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("type", &self.meta.type_name)
            .field("collection", &self.collection)
            .field("filter", &self.to_query_object())
            .field("sort", &self.sort)
            .field("skip", &self.skip)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl<T: Entity> Query<T> {
    pub(crate) fn new(core: Arc<OdmCore>, pool: Weak<AsyncPool>, meta: Arc<EntityMeta>) -> Self {
        let collection = meta.collection.clone();
        Self {
            core,
            pool,
            meta,
            raw_filter: None,
            and_exprs: Vec::new(),
            or_exprs: Vec::new(),
            nor_exprs: Vec::new(),
            where_clause: None,
            sort: Vec::new(),
            skip: 0,
            limit: 0,
            projection: Projection::default(),
            collation: None,
            read_preference: None,
            collection,
            tags: BTreeSet::new(),
            _entity: PhantomData,
        }
    }

    fn has_structured(&self) -> bool {
        !self.and_exprs.is_empty() || !self.or_exprs.is_empty() || !self.nor_exprs.is_empty() || self.where_clause.is_some()
    }

    fn ensure_structured_allowed(&self) -> Result<(), OdmError> {
        if self.raw_filter.is_some() {
            return Err(OdmError::InvalidQuery("query already has a raw filter".into()));
        }
        Ok(())
    }

    /// Use `filter` verbatim.
    ///
    /// # Errors
    /// `InvalidQuery` when structured filters were added already.
    pub fn filter(mut self, filter: Document) -> Result<Self, OdmError> {
        if self.has_structured() {
            return Err(OdmError::InvalidQuery("query already has structured filters".into()));
        }
        self.raw_filter = Some(filter);
        Ok(self)
    }

    /// AND `expr` into the filter.
    ///
    /// # Errors
    /// `InvalidQuery` when a raw filter is set.
    pub fn and(mut self, expr: FilterExpr) -> Result<Self, OdmError> {
        self.ensure_structured_allowed()?;
        self.and_exprs.push(expr);
        Ok(self)
    }

    /// # Errors
    /// `InvalidQuery` when a raw filter is set.
    pub fn or(mut self, expr: FilterExpr) -> Result<Self, OdmError> {
        self.ensure_structured_allowed()?;
        self.or_exprs.push(expr);
        Ok(self)
    }

    /// # Errors
    /// `InvalidQuery` when a raw filter is set.
    pub fn nor(mut self, expr: FilterExpr) -> Result<Self, OdmError> {
        self.ensure_structured_allowed()?;
        self.nor_exprs.push(expr);
        Ok(self)
    }

    /// Shorthand for `and(field(path).eq(value))`.
    ///
    /// # Errors
    /// `InvalidQuery` when a raw filter is set.
    pub fn eq(self, path: &str, value: impl Into<Bson>) -> Result<Self, OdmError> {
        self.and(super::filter::field(path).eq(value))
    }

    /// Server-side script predicate. Such queries cannot be counted by the server.
    ///
    /// # Errors
    /// `InvalidQuery` when a raw filter is set.
    pub fn where_clause(mut self, script: impl Into<String>) -> Result<Self, OdmError> {
        self.ensure_structured_allowed()?;
        self.where_clause = Some(script.into());
        Ok(self)
    }

    #[must_use]
    pub fn sort(mut self, field: impl Into<String>, order: Order) -> Self {
        let field = field.into();
        self.sort.retain(|s| s.field != field);
        if self.sort.len() < MAX_SORT_FIELDS {
            self.sort.push(SortSpec { field, order });
        }
        self
    }

    #[must_use]
    pub fn asc(self, field: impl Into<String>) -> Self {
        self.sort(field, Order::Asc)
    }

    #[must_use]
    pub fn desc(self, field: impl Into<String>) -> Self {
        self.sort(field, Order::Desc)
    }

    #[must_use]
    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    /// 0 removes the limit.
    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// # Errors
    /// `InvalidQuery` when the projection already excludes fields.
    pub fn project(mut self, field: impl Into<String>) -> Result<Self, OdmError> {
        self.projection.include(field)?;
        Ok(self)
    }

    /// # Errors
    /// `InvalidQuery` when the projection already includes fields.
    pub fn exclude(mut self, field: impl Into<String>) -> Result<Self, OdmError> {
        self.projection.exclude(field)?;
        Ok(self)
    }

    #[must_use]
    pub fn collation(mut self, collation: Collation) -> Self {
        self.collation = Some(collation);
        self
    }

    #[must_use]
    pub fn read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.read_preference = Some(read_preference);
        self
    }

    /// Read from `collection` instead of the type's resolved one.
    #[must_use]
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    #[must_use]
    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    #[must_use]
    pub fn get_skip(&self) -> u64 {
        self.skip
    }

    #[must_use]
    pub fn get_limit(&self) -> u64 {
        self.limit
    }

    #[must_use]
    pub fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    /// True when the query narrows the result set at all.
    #[must_use]
    pub fn has_filter(&self) -> bool {
        self.raw_filter.as_ref().is_some_and(|f| !f.is_empty()) || self.has_structured()
    }

    pub(crate) fn has_where(&self) -> bool {
        self.where_clause.is_some() || self.raw_filter.as_ref().is_some_and(|f| f.contains_key("$where"))
    }

    /// The wire filter document.
    #[must_use]
    pub fn to_query_object(&self) -> Document {
        if let Some(raw) = &self.raw_filter {
            return raw.clone();
        }
        let mut d = Document::new();
        let or_nor_free = self.or_exprs.is_empty() && self.nor_exprs.is_empty();
        match self.and_exprs.as_slice() {
            [] => {}
            [single] if or_nor_free && self.where_clause.is_none() => d = single.to_document(),
            many => {
                d.insert("$and", many.iter().map(|e| Bson::Document(e.to_document())).collect::<Vec<_>>());
            }
        }
        if !self.or_exprs.is_empty() {
            d.insert("$or", self.or_exprs.iter().map(|e| Bson::Document(e.to_document())).collect::<Vec<_>>());
        }
        if !self.nor_exprs.is_empty() {
            d.insert("$nor", self.nor_exprs.iter().map(|e| Bson::Document(e.to_document())).collect::<Vec<_>>());
        }
        if let Some(w) = &self.where_clause {
            d.insert("$where", w.clone());
        }
        d
    }

    #[must_use]
    pub fn sort_document(&self) -> Document {
        sort_document(&self.sort)
    }

    /// The projection sent to the server; `None` when absent or equal to every declared field.
    #[must_use]
    pub fn effective_projection(&self) -> Option<Document> {
        if self.projection.is_empty() || self.projection.includes_exactly(&self.meta.declared_fields) {
            return None;
        }
        Some(self.projection.to_document())
    }

    pub(crate) fn effective_read_preference(&self) -> ReadPreference {
        self.read_preference.unwrap_or(self.core.config.default_read_preference)
    }

    pub(crate) fn cache_key_with(&self, namespace: &str, limit: u64, suffix: Option<&str>) -> String {
        let filter = self.to_query_object();
        let sort = self.sort_document();
        let projection = self.effective_projection();
        cache_key(&CacheKeyParts {
            type_name: namespace,
            filter: &filter,
            sort: &sort,
            projection: projection.as_ref(),
            collection: &self.collection,
            skip: self.skip,
            limit,
            suffix,
        })
    }

    /// Key of this query's full-object results.
    #[must_use]
    pub fn cache_key(&self) -> String {
        self.cache_key_with(self.meta.type_name, self.limit, None)
    }

    pub(crate) fn find_request(&self, limit: u64, batch_size: usize) -> FindRequest {
        FindRequest {
            database: self.core.config.database.clone(),
            collection: self.collection.clone(),
            filter: self.to_query_object(),
            sort: self.sort_document(),
            projection: self.effective_projection(),
            skip: self.skip,
            limit,
            batch_size,
            read_preference: Some(self.effective_read_preference()),
            collation: self.collation.clone(),
        }
    }

    pub(crate) fn count_request(&self) -> CountRequest {
        CountRequest {
            database: self.core.config.database.clone(),
            collection: self.collection.clone(),
            filter: self.to_query_object(),
            collation: self.collation.clone(),
            read_preference: Some(self.effective_read_preference()),
        }
    }

    pub(crate) fn collation_ref(&self) -> Option<&Collation> {
        self.collation.as_ref()
    }
}
