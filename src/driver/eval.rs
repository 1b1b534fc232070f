//! Server-side semantics for the in-process driver: filter documents, sort specs,
//! projections and update operators evaluated against BSON documents.

use crate::errors::OdmError;
use bson::{Bson, Document};
use std::cmp::Ordering;

// Safety limits to prevent resource abuse
pub(crate) const MAX_PATH_DEPTH: usize = 32;
pub(crate) const MAX_IN_SET: usize = 1000;
pub(crate) const MAX_SORT_FIELDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// A parsed filter document.
#[derive(Debug, Clone)]
pub enum Matcher {
    True,
    And(Vec<Matcher>),
    Or(Vec<Matcher>),
    Nor(Vec<Matcher>),
    Not(Box<Matcher>),
    Exists { path: String, exists: bool },
    In { path: String, values: Vec<Bson> },
    Nin { path: String, values: Vec<Bson> },
    Cmp { path: String, op: CmpOp, value: Bson },
    #[cfg(feature = "regex")]
    Regex { path: String, pattern: String, case_insensitive: bool },
    /// Server-side script; there is no script engine in-process.
    Where,
}

impl Matcher {
    #[must_use]
    pub fn contains_where(&self) -> bool {
        match self {
            Self::Where => true,
            Self::And(ms) | Self::Or(ms) | Self::Nor(ms) => ms.iter().any(Self::contains_where),
            Self::Not(m) => m.contains_where(),
            _ => false,
        }
    }
}

fn sub_matchers(key: &str, v: &Bson) -> Result<Vec<Matcher>, OdmError> {
    let Bson::Array(items) = v else {
        return Err(OdmError::InvalidQuery(format!("{key} requires an array")));
    };
    items
        .iter()
        .map(|it| match it {
            Bson::Document(d) => parse_filter(d),
            _ => Err(OdmError::InvalidQuery(format!("{key} entries must be documents"))),
        })
        .collect()
}

fn parse_field_ops(path: &str, ops: &Document) -> Result<Matcher, OdmError> {
    let mut parts = Vec::new();
    #[cfg(feature = "regex")]
    let case_insensitive = ops.get_str("$options").is_ok_and(|o| o.contains('i'));
    for (op, v) in ops {
        let path = path.to_string();
        let m = match op.as_str() {
            "$eq" => Matcher::Cmp { path, op: CmpOp::Eq, value: v.clone() },
            "$ne" => Matcher::Cmp { path, op: CmpOp::Ne, value: v.clone() },
            "$gt" => Matcher::Cmp { path, op: CmpOp::Gt, value: v.clone() },
            "$gte" => Matcher::Cmp { path, op: CmpOp::Gte, value: v.clone() },
            "$lt" => Matcher::Cmp { path, op: CmpOp::Lt, value: v.clone() },
            "$lte" => Matcher::Cmp { path, op: CmpOp::Lte, value: v.clone() },
            "$in" | "$nin" => {
                let Bson::Array(values) = v else {
                    return Err(OdmError::InvalidQuery(format!("{op} requires an array")));
                };
                let values: Vec<Bson> = values.iter().take(MAX_IN_SET).cloned().collect();
                if op == "$in" { Matcher::In { path, values } } else { Matcher::Nin { path, values } }
            }
            "$exists" => Matcher::Exists { path, exists: truthy(v) },
            "$not" => match v {
                Bson::Document(inner) => Matcher::Not(Box::new(parse_field_ops(&path, inner)?)),
                _ => return Err(OdmError::InvalidQuery("$not requires a document".into())),
            },
            #[cfg(feature = "regex")]
            "$regex" => match v {
                Bson::String(pattern) => Matcher::Regex { path, pattern: pattern.clone(), case_insensitive },
                _ => return Err(OdmError::InvalidQuery("$regex requires a string".into())),
            },
            #[cfg(feature = "regex")]
            "$options" => continue,
            other => return Err(OdmError::InvalidQuery(format!("unsupported operator {other}"))),
        };
        parts.push(m);
    }
    Ok(if parts.len() == 1 { parts.remove(0) } else { Matcher::And(parts) })
}

fn is_operator_doc(v: &Bson) -> Option<&Document> {
    match v {
        Bson::Document(d) if !d.is_empty() && d.keys().all(|k| k.starts_with('$')) => Some(d),
        _ => None,
    }
}

/// Parse a filter document.
///
/// # Errors
/// `InvalidQuery` on malformed or unsupported operators.
pub fn parse_filter(filter: &Document) -> Result<Matcher, OdmError> {
    let mut parts = Vec::new();
    for (k, v) in filter {
        let m = match k.as_str() {
            "$and" => Matcher::And(sub_matchers(k, v)?),
            "$or" => Matcher::Or(sub_matchers(k, v)?),
            "$nor" => Matcher::Nor(sub_matchers(k, v)?),
            "$where" => Matcher::Where,
            _ => match is_operator_doc(v) {
                Some(ops) => parse_field_ops(k, ops)?,
                None => Matcher::Cmp { path: k.clone(), op: CmpOp::Eq, value: v.clone() },
            },
        };
        parts.push(m);
    }
    Ok(match parts.len() {
        0 => Matcher::True,
        1 => parts.remove(0),
        _ => Matcher::And(parts),
    })
}

pub fn eval_filter(doc: &Document, m: &Matcher) -> bool {
    match m {
        Matcher::True | Matcher::Where => true,
        Matcher::And(ms) => ms.iter().all(|f| eval_filter(doc, f)),
        Matcher::Or(ms) => ms.iter().any(|f| eval_filter(doc, f)),
        Matcher::Nor(ms) => !ms.iter().any(|f| eval_filter(doc, f)),
        Matcher::Not(f) => !eval_filter(doc, f),
        Matcher::Exists { path, exists } => get_path(doc, path).is_some() == *exists,
        Matcher::In { path, values } => {
            get_path(doc, path).is_some_and(|v| values.iter().any(|x| matches_value(v, x)))
        }
        Matcher::Nin { path, values } => {
            !get_path(doc, path).is_some_and(|v| values.iter().any(|x| matches_value(v, x)))
        }
        Matcher::Cmp { path, op, value } => {
            let found = get_path(doc, path);
            match op {
                CmpOp::Eq => found.is_some_and(|v| matches_value(v, value)),
                CmpOp::Ne => !found.is_some_and(|v| matches_value(v, value)),
                _ => found.is_some_and(|v| {
                    let c = compare_bson(v, value);
                    match op {
                        CmpOp::Gt => c == Ordering::Greater,
                        CmpOp::Gte => c != Ordering::Less,
                        CmpOp::Lt => c == Ordering::Less,
                        _ => c != Ordering::Greater,
                    }
                }),
            }
        }
        #[cfg(feature = "regex")]
        Matcher::Regex { path, pattern, case_insensitive } => {
            if let Some(Bson::String(s)) = get_path(doc, path) {
                let mut re = regex::RegexBuilder::new(pattern);
                re.case_insensitive(*case_insensitive);
                re.build().is_ok_and(|r| r.is_match(s))
            } else {
                false
            }
        }
    }
}

fn truthy(v: &Bson) -> bool {
    match v {
        Bson::Boolean(b) => *b,
        Bson::Int32(i) => *i != 0,
        Bson::Int64(i) => *i != 0,
        Bson::Double(f) => *f != 0.0,
        Bson::Null => false,
        _ => true,
    }
}

fn is_num(x: &Bson) -> bool {
    matches!(x, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_))
}

#[allow(clippy::cast_precision_loss)]
fn as_f64(x: &Bson) -> f64 {
    match x {
        Bson::Int32(i) => f64::from(*i),
        Bson::Int64(i) => *i as f64,
        Bson::Double(f) => *f,
        _ => f64::NAN,
    }
}

/// Equality as the server applies it: numbers compare across widths and an array field
/// matches any of its elements.
fn matches_value(field: &Bson, wanted: &Bson) -> bool {
    if values_equal(field, wanted) {
        return true;
    }
    match field {
        Bson::Array(items) if !matches!(wanted, Bson::Array(_)) => items.iter().any(|i| values_equal(i, wanted)),
        _ => false,
    }
}

pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    if is_num(a) && is_num(b) {
        return compare_bson(a, b) == Ordering::Equal;
    }
    a == b
}

pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    if path.is_empty() || path.len() > 1024 {
        return None;
    }
    let mut cur = doc;
    let mut parts = path.split('.').peekable();
    let mut segs = 0usize;
    while let Some(part) = parts.next() {
        segs += 1;
        if segs > MAX_PATH_DEPTH {
            return None;
        }
        let v = cur.get(part)?;
        if parts.peek().is_none() {
            return Some(v);
        }
        match v {
            Bson::Document(d) => cur = d,
            _ => return None,
        }
    }
    None
}

pub fn compare_bson(a: &Bson, b: &Bson) -> Ordering {
    if is_num(a) && is_num(b) {
        return as_f64(a).total_cmp(&as_f64(b));
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.timestamp_millis().cmp(&y.timestamp_millis()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(v: &Bson) -> u8 {
    match v {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => 255,
        _ => 12,
    }
}

/// Order by a sort document (`{field: 1 | -1, ...}`), first key most significant.
pub fn compare_docs(a: &Document, b: &Document, sort: &Document) -> Ordering {
    for (field, dir) in sort.iter().take(MAX_SORT_FIELDS) {
        let ord = match (get_path(a, field), get_path(b, field)) {
            (Some(x), Some(y)) => compare_bson(x, y),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            let descending = matches!(dir, Bson::Int32(-1) | Bson::Int64(-1)) || as_f64(dir) < 0.0;
            return if descending { ord.reverse() } else { ord };
        }
    }
    Ordering::Equal
}

/// Apply an inclusion or exclusion projection. `_id` is kept unless excluded.
pub fn project(doc: &Document, projection: &Document) -> Document {
    let id_only = projection.len() == 1 && projection.get("_id").is_some_and(truthy);
    let inclusive = id_only || projection.iter().any(|(k, v)| k != "_id" && truthy(v));
    if !inclusive {
        let mut out = doc.clone();
        for (k, v) in projection {
            if !truthy(v) {
                out.remove(k);
            }
        }
        return out;
    }
    let mut out = Document::new();
    let id_hidden = projection.get("_id").is_some_and(|v| !truthy(v));
    if !id_hidden && let Some(id) = doc.get("_id") {
        out.insert("_id", id.clone());
    }
    for (k, v) in projection {
        if k != "_id" && truthy(v) && let Some(found) = get_path(doc, k) {
            out.insert(k.clone(), found.clone());
        }
    }
    out
}

fn ensure_subdoc<'a>(root: &'a mut Document, key: &str) -> Result<&'a mut Document, OdmError> {
    if !matches!(root.get(key), Some(Bson::Document(_))) {
        root.insert(key.to_string(), Bson::Document(Document::new()));
    }
    match root.get_mut(key) {
        Some(Bson::Document(d)) => Ok(d),
        _ => Err(OdmError::InvalidQuery(format!("cannot traverse into {key}"))),
    }
}

fn traverse_to_parent<'a>(root: &'a mut Document, path: &str) -> Result<(&'a mut Document, String), OdmError> {
    let mut cur = root;
    let mut iter = path.split('.').peekable();
    while let Some(seg) = iter.next() {
        if iter.peek().is_none() {
            return Ok((cur, seg.to_string()));
        }
        cur = ensure_subdoc(cur, seg)?;
    }
    Err(OdmError::InvalidQuery("empty update path".into()))
}

fn set_path(root: &mut Document, path: &str, value: Bson) -> Result<bool, OdmError> {
    let (parent, last) = traverse_to_parent(root, path)?;
    let old = parent.insert(last, value.clone());
    Ok(old.as_ref() != Some(&value))
}

fn inc_value(cur: Option<&Bson>, by: &Bson) -> Result<Bson, OdmError> {
    let cur = cur.cloned().unwrap_or(Bson::Int32(0));
    Ok(match (&cur, by) {
        (Bson::Int32(a), Bson::Int32(b)) => a.checked_add(*b).map_or_else(|| Bson::Int64(i64::from(*a) + i64::from(*b)), Bson::Int32),
        (Bson::Int32(a), Bson::Int64(b)) => Bson::Int64(i64::from(*a).saturating_add(*b)),
        (Bson::Int64(a), Bson::Int32(b)) => Bson::Int64(a.saturating_add(i64::from(*b))),
        (Bson::Int64(a), Bson::Int64(b)) => Bson::Int64(a.saturating_add(*b)),
        (a, b) if is_num(a) && is_num(b) => Bson::Double(as_f64(a) + as_f64(b)),
        _ => return Err(OdmError::InvalidQuery("$inc requires numeric values".into())),
    })
}

fn operator_fields<'a>(update: &'a Document, op: &str) -> Result<Option<&'a Document>, OdmError> {
    match update.get(op) {
        None => Ok(None),
        Some(Bson::Document(d)) => Ok(Some(d)),
        Some(_) => Err(OdmError::InvalidQuery(format!("{op} requires a document"))),
    }
}

/// Whether an update document is a replacement (no `$` operators).
#[must_use]
pub fn is_replacement(update: &Document) -> bool {
    !update.keys().any(|k| k.starts_with('$'))
}

/// Apply an update document (`$set $unset $inc $push $pull`) or a replacement.
///
/// # Errors
/// `InvalidQuery` on unknown operators or type mismatches.
pub fn apply_update(doc: &mut Document, update: &Document) -> Result<bool, OdmError> {
    if is_replacement(update) {
        let id = doc.get("_id").cloned();
        let mut next = update.clone();
        if let Some(id) = id {
            next.insert("_id", id);
        }
        let changed = next != *doc;
        *doc = next;
        return Ok(changed);
    }
    if let Some(op) = update.keys().find(|k| !matches!(k.as_str(), "$set" | "$unset" | "$inc" | "$push" | "$pull")) {
        return Err(OdmError::InvalidQuery(format!("unsupported update operator {op}")));
    }
    let mut changed = false;
    if let Some(set) = operator_fields(update, "$set")? {
        for (k, v) in set {
            changed |= set_path(doc, k, v.clone())?;
        }
    }
    if let Some(unset) = operator_fields(update, "$unset")? {
        for k in unset.keys() {
            let (parent, last) = traverse_to_parent(doc, k)?;
            changed |= parent.remove(&last).is_some();
        }
    }
    if let Some(inc) = operator_fields(update, "$inc")? {
        for (k, by) in inc {
            let next = inc_value(get_path(doc, k), by)?;
            changed |= set_path(doc, k, next)?;
        }
    }
    if let Some(push) = operator_fields(update, "$push")? {
        for (k, v) in push {
            let mut items = match get_path(doc, k) {
                Some(Bson::Array(a)) => a.clone(),
                None => Vec::new(),
                Some(_) => return Err(OdmError::InvalidQuery(format!("$push target {k} is not an array"))),
            };
            items.push(v.clone());
            set_path(doc, k, Bson::Array(items))?;
            changed = true;
        }
    }
    if let Some(pull) = operator_fields(update, "$pull")? {
        for (k, v) in pull {
            if let Some(Bson::Array(a)) = get_path(doc, k) {
                let kept: Vec<Bson> = a.iter().filter(|x| !values_equal(x, v)).cloned().collect();
                if kept.len() != a.len() {
                    set_path(doc, k, Bson::Array(kept))?;
                    changed = true;
                }
            }
        }
    }
    Ok(changed)
}

/// Seed document for an upsert: the equality parts of the filter.
#[must_use]
pub fn upsert_seed(filter: &Document) -> Document {
    let mut seed = Document::new();
    for (k, v) in filter {
        if !k.starts_with('$') && is_operator_doc(v).is_none() {
            seed.insert(k.clone(), v.clone());
        }
    }
    seed
}
