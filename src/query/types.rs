use crate::errors::OdmError;
use bson::{Bson, Document};
use serde::Deserialize;
use std::collections::BTreeMap;

// Safety limits to prevent resource abuse
pub(crate) const MAX_SORT_FIELDS: usize = 8;
pub(crate) const MAX_PROJECTION_FIELDS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Asc => 1,
            Self::Desc => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortSpec {
    pub field: String,
    pub order: Order,
}

/// Ordered sort specification as the wire document `{field: 1 | -1, ...}`.
#[must_use]
pub fn sort_document(sort: &[SortSpec]) -> Document {
    let mut d = Document::new();
    for s in sort.iter().take(MAX_SORT_FIELDS) {
        d.insert(s.field.clone(), s.order.as_i32());
    }
    d
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPreference {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadPreference {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::PrimaryPreferred => "primaryPreferred",
            Self::Secondary => "secondary",
            Self::SecondaryPreferred => "secondaryPreferred",
            Self::Nearest => "nearest",
        }
    }
}

/// Language-aware string comparison rules.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Collation {
    pub locale: String,
    pub strength: Option<i32>,
    pub case_level: Option<bool>,
    pub numeric_ordering: Option<bool>,
}

impl Collation {
    #[must_use]
    pub fn new(locale: impl Into<String>) -> Self {
        Self { locale: locale.into(), ..Default::default() }
    }

    #[must_use]
    pub fn to_document(&self) -> Document {
        let mut d = Document::new();
        d.insert("locale", self.locale.clone());
        if let Some(s) = self.strength {
            d.insert("strength", s);
        }
        if let Some(c) = self.case_level {
            d.insert("caseLevel", c);
        }
        if let Some(n) = self.numeric_ordering {
            d.insert("numericOrdering", n);
        }
        d
    }
}

/// Field projection: inclusion-only or exclusion-only, never mixed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Projection {
    fields: BTreeMap<String, i32>,
}

impl Projection {
    /// Add an included field.
    ///
    /// # Errors
    /// `InvalidQuery` when the projection already excludes fields.
    pub fn include(&mut self, field: impl Into<String>) -> Result<(), OdmError> {
        self.put(field.into(), 1)
    }

    /// Add an excluded field.
    ///
    /// # Errors
    /// `InvalidQuery` when the projection already includes fields.
    pub fn exclude(&mut self, field: impl Into<String>) -> Result<(), OdmError> {
        self.put(field.into(), 0)
    }

    fn put(&mut self, field: String, flag: i32) -> Result<(), OdmError> {
        if self.fields.values().any(|v| *v != flag) {
            return Err(OdmError::InvalidQuery(format!(
                "cannot mix inclusion and exclusion in projection (field {field})"
            )));
        }
        if self.fields.len() >= MAX_PROJECTION_FIELDS && !self.fields.contains_key(&field) {
            return Err(OdmError::InvalidQuery("projection has too many fields".into()));
        }
        self.fields.insert(field, flag);
        Ok(())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// All-zero projections are exclusion-only.
    #[must_use]
    pub fn is_exclusion(&self) -> bool {
        !self.fields.is_empty() && self.fields.values().all(|v| *v == 0)
    }

    /// True when this projection includes exactly the given field set.
    #[must_use]
    pub fn includes_exactly(&self, fields: &[String]) -> bool {
        !self.is_exclusion()
            && self.fields.len() == fields.len()
            && fields.iter().all(|f| self.fields.contains_key(f))
    }

    #[must_use]
    pub fn to_document(&self) -> Document {
        self.fields.iter().map(|(k, v)| (k.clone(), Bson::Int32(*v))).collect()
    }
}
