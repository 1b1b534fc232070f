//! Canonical cache keys.
//!
//! Structurally equal queries produce equal keys regardless of how their maps were built:
//! filter and projection documents are written with sorted keys, sort documents keep their
//! (semantically meaningful) order.

use bson::{Bson, Document};
use std::fmt::Write;

/// Everything a cached read depends on.
#[derive(Debug, Clone, Copy)]
pub struct CacheKeyParts<'a> {
    pub type_name: &'a str,
    pub filter: &'a Document,
    pub sort: &'a Document,
    /// Already reduced: `None` when the projection is absent or covers every declared field.
    pub projection: Option<&'a Document>,
    pub collection: &'a str,
    pub skip: u64,
    pub limit: u64,
    /// Separates result shapes sharing a filter (`idlist`, `distinct:<field>`).
    pub suffix: Option<&'a str>,
}

fn write_bson(out: &mut String, v: &Bson, sort_keys: bool) {
    match v {
        Bson::Document(d) => write_document(out, d, sort_keys),
        Bson::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_bson(out, item, sort_keys);
            }
            out.push(']');
        }
        Bson::String(s) => out.push_str(&serde_json::Value::String(s.clone()).to_string()),
        Bson::Int32(i) => {
            let _ = write!(out, "{i}");
        }
        Bson::Int64(i) => {
            let _ = write!(out, "{i}L");
        }
        Bson::Double(f) => {
            let _ = write!(out, "{f:?}D");
        }
        Bson::Boolean(b) => {
            let _ = write!(out, "{b}");
        }
        Bson::Null => out.push_str("null"),
        other => {
            let _ = write!(out, "{other}");
        }
    }
}

fn write_document(out: &mut String, d: &Document, sort_keys: bool) {
    let mut entries: Vec<(&String, &Bson)> = d.iter().collect();
    if sort_keys {
        entries.sort_by(|a, b| a.0.cmp(b.0));
    }
    out.push('{');
    for (i, (k, v)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&serde_json::Value::String(k.clone()).to_string());
        out.push(':');
        write_bson(out, v, sort_keys);
    }
    out.push('}');
}

/// Order-stable rendering of a map whose key order carries no meaning.
#[must_use]
pub fn canonical_document(d: &Document) -> String {
    let mut out = String::new();
    write_document(&mut out, d, true);
    out
}

/// Rendering that keeps key order, for sort specifications.
#[must_use]
pub fn ordered_document(d: &Document) -> String {
    let mut out = String::new();
    write_document(&mut out, d, false);
    out
}

#[must_use]
pub fn cache_key(parts: &CacheKeyParts<'_>) -> String {
    let mut key = String::with_capacity(128);
    let _ = write!(
        key,
        "{}|f:{}|c:{}|l:{}|s:{}|o:{}",
        parts.type_name,
        canonical_document(parts.filter),
        parts.collection,
        parts.limit,
        parts.skip,
        ordered_document(parts.sort)
    );
    if let Some(p) = parts.projection {
        let _ = write!(key, "|p:{}", canonical_document(p));
    }
    if let Some(s) = parts.suffix {
        let _ = write!(key, "|{s}");
    }
    key
}
