//! Structured filter expressions, rendered to wire filter documents.

use crate::driver::eval::CmpOp;
use bson::{Bson, Document, doc};

#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    Cmp { path: String, op: CmpOp, value: Bson },
    In { path: String, values: Vec<Bson> },
    Nin { path: String, values: Vec<Bson> },
    Exists { path: String, exists: bool },
    /// Negates a single-field expression.
    Not(Box<FilterExpr>),
    #[cfg(feature = "regex")]
    Regex { path: String, pattern: String, case_insensitive: bool },
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Nor(Vec<FilterExpr>),
}

fn op_name(op: &CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "$eq",
        CmpOp::Ne => "$ne",
        CmpOp::Gt => "$gt",
        CmpOp::Gte => "$gte",
        CmpOp::Lt => "$lt",
        CmpOp::Lte => "$lte",
    }
}

fn list(exprs: &[FilterExpr]) -> Bson {
    Bson::Array(exprs.iter().map(|e| Bson::Document(e.to_document())).collect())
}

impl FilterExpr {
    fn path(&self) -> Option<&str> {
        match self {
            Self::Cmp { path, .. } | Self::In { path, .. } | Self::Nin { path, .. } | Self::Exists { path, .. } => {
                Some(path)
            }
            #[cfg(feature = "regex")]
            Self::Regex { path, .. } => Some(path),
            Self::Not(inner) => inner.path(),
            Self::And(_) | Self::Or(_) | Self::Nor(_) => None,
        }
    }

    /// The operator document of a single-field expression, e.g. `{"$gt": 3}`.
    fn operator_doc(&self) -> Option<Document> {
        Some(match self {
            Self::Cmp { op, value, .. } => {
                let mut d = Document::new();
                d.insert(op_name(op), value.clone());
                d
            }
            Self::In { values, .. } => doc! { "$in": values.clone() },
            Self::Nin { values, .. } => doc! { "$nin": values.clone() },
            Self::Exists { exists, .. } => doc! { "$exists": *exists },
            Self::Not(inner) => doc! { "$not": inner.operator_doc()? },
            #[cfg(feature = "regex")]
            Self::Regex { pattern, case_insensitive, .. } => {
                let mut d = doc! { "$regex": pattern.clone() };
                if *case_insensitive {
                    d.insert("$options", "i");
                }
                d
            }
            Self::And(_) | Self::Or(_) | Self::Nor(_) => return None,
        })
    }

    #[must_use]
    pub fn to_document(&self) -> Document {
        match self {
            Self::And(items) => doc! { "$and": list(items) },
            Self::Or(items) => doc! { "$or": list(items) },
            Self::Nor(items) => doc! { "$nor": list(items) },
            leaf => match (leaf.path(), leaf.operator_doc()) {
                (Some(path), Some(ops)) => {
                    let mut d = Document::new();
                    d.insert(path, ops);
                    d
                }
                _ => Document::new(),
            },
        }
    }

    #[must_use]
    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }
}

/// Start a single-field expression: `field("age").gte(18)`.
#[must_use]
pub fn field(path: impl Into<String>) -> Field {
    Field { path: path.into() }
}

#[derive(Debug, Clone)]
pub struct Field {
    path: String,
}

impl Field {
    fn cmp(self, op: CmpOp, value: impl Into<Bson>) -> FilterExpr {
        FilterExpr::Cmp { path: self.path, op, value: value.into() }
    }

    #[must_use]
    pub fn eq(self, value: impl Into<Bson>) -> FilterExpr {
        self.cmp(CmpOp::Eq, value)
    }

    #[must_use]
    pub fn ne(self, value: impl Into<Bson>) -> FilterExpr {
        self.cmp(CmpOp::Ne, value)
    }

    #[must_use]
    pub fn gt(self, value: impl Into<Bson>) -> FilterExpr {
        self.cmp(CmpOp::Gt, value)
    }

    #[must_use]
    pub fn gte(self, value: impl Into<Bson>) -> FilterExpr {
        self.cmp(CmpOp::Gte, value)
    }

    #[must_use]
    pub fn lt(self, value: impl Into<Bson>) -> FilterExpr {
        self.cmp(CmpOp::Lt, value)
    }

    #[must_use]
    pub fn lte(self, value: impl Into<Bson>) -> FilterExpr {
        self.cmp(CmpOp::Lte, value)
    }

    #[must_use]
    pub fn is_in<I, V>(self, values: I) -> FilterExpr
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        FilterExpr::In { path: self.path, values: values.into_iter().map(Into::into).collect() }
    }

    #[must_use]
    pub fn not_in<I, V>(self, values: I) -> FilterExpr
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        FilterExpr::Nin { path: self.path, values: values.into_iter().map(Into::into).collect() }
    }

    #[must_use]
    pub fn exists(self, exists: bool) -> FilterExpr {
        FilterExpr::Exists { path: self.path, exists }
    }

    #[cfg(feature = "regex")]
    #[must_use]
    pub fn matches(self, pattern: impl Into<String>, case_insensitive: bool) -> FilterExpr {
        FilterExpr::Regex { path: self.path, pattern: pattern.into(), case_insensitive }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::eval::{eval_filter, parse_filter};

    #[test]
    fn leaf_rendering() {
        assert_eq!(field("age").gte(18).to_document(), doc! {"age": {"$gte": 18}});
        assert_eq!(field("tag").is_in(["a", "b"]).to_document(), doc! {"tag": {"$in": ["a", "b"]}});
        assert_eq!(field("x").exists(false).to_document(), doc! {"x": {"$exists": false}});
        assert_eq!(field("n").lt(3).not().to_document(), doc! {"n": {"$not": {"$lt": 3}}});
    }

    #[test]
    fn rendered_filters_evaluate() {
        let f = FilterExpr::Or(vec![field("a").eq(1), FilterExpr::And(vec![field("b").gt(5), field("b").lt(9)])]);
        let m = parse_filter(&f.to_document()).unwrap();
        assert!(eval_filter(&doc! {"a": 1}, &m));
        assert!(eval_filter(&doc! {"a": 2, "b": 7}, &m));
        assert!(!eval_filter(&doc! {"a": 2, "b": 9}, &m));
    }

    #[test]
    fn negated_group_renders_empty() {
        let f = FilterExpr::Or(vec![field("a").eq(1)]).not();
        assert_eq!(f.to_document(), Document::new());
    }
}
