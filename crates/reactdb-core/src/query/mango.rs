//! Mango-style queries and a small selector matcher.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Document, get_path, is_deleted};

use super::planner::PreparedQuery;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortPart {
    pub field: String,
    pub direction: SortDirection,
}

/// A query: selector plus optional sort, skip and limit.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MangoQuery {
    #[serde(default)]
    pub selector: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl MangoQuery {
    /// A query matching every document.
    pub fn all() -> Self {
        Self::default()
    }

    /// A query with the given selector. Non-object values select everything.
    pub fn with_selector(selector: Value) -> Self {
        Self {
            selector: match selector {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            ..Self::default()
        }
    }

    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(SortPart {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip greater than zero.
    pub fn has_skip(&self) -> bool {
        self.skip.is_some_and(|s| s > 0)
    }
}

/// The id targeted by a query that can be answered with one point lookup.
///
/// Qualifies when `limit == 1`, there is no skip, and the selector has exactly
/// one key, the primary key, whose value is a string or `{"$eq": string}`.
pub fn is_find_one_by_id_query(primary_path: &str, query: &MangoQuery) -> Option<String> {
    if query.limit != Some(1) || query.has_skip() || query.selector.len() != 1 {
        return None;
    }
    match query.selector.get(primary_path)? {
        Value::String(id) => Some(id.clone()),
        Value::Object(ops) if ops.len() == 1 => ops.get("$eq")?.as_str().map(str::to_string),
        _ => None,
    }
}

/// Evaluates selectors and sort orders against documents.
pub trait QueryMatcher: Send + Sync {
    fn matches(&self, query: &PreparedQuery, doc: &Document) -> bool;

    /// Result order: the query's sort fields, then primary key ascending.
    fn compare(&self, query: &PreparedQuery, a: &Document, b: &Document) -> Ordering;
}

/// Matcher for the common Mango operators: `$eq`, `$ne`, `$gt`, `$gte`, `$lt`,
/// `$lte`, `$in`, `$nin`, `$exists`, and top-level `$and` / `$or`.
/// Tombstones never match.
#[derive(Debug, Default, Clone, Copy)]
pub struct MangoMatcher;

impl QueryMatcher for MangoMatcher {
    fn matches(&self, query: &PreparedQuery, doc: &Document) -> bool {
        !is_deleted(doc) && matches_selector(&query.query.selector, doc)
    }

    fn compare(&self, query: &PreparedQuery, a: &Document, b: &Document) -> Ordering {
        for part in &query.query.sort {
            let ordering =
                compare_values(field_or_null(a, &part.field), field_or_null(b, &part.field));
            let ordering = match part.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        compare_values(
            field_or_null(a, &query.primary_path),
            field_or_null(b, &query.primary_path),
        )
    }
}

fn field_or_null<'a>(doc: &'a Value, path: &str) -> &'a Value {
    get_path(doc, path).unwrap_or(&Value::Null)
}

fn matches_selector(selector: &Map<String, Value>, doc: &Value) -> bool {
    selector.iter().all(|(key, condition)| match key.as_str() {
        "$and" => sub_selectors(condition)
            .is_some_and(|mut subs| subs.all(|s| matches_selector(s, doc))),
        "$or" => sub_selectors(condition)
            .is_some_and(|mut subs| subs.any(|s| matches_selector(s, doc))),
        field => matches_condition(get_path(doc, field), condition),
    })
}

fn sub_selectors(condition: &Value) -> Option<impl Iterator<Item = &Map<String, Value>>> {
    let list = condition.as_array()?;
    Some(list.iter().filter_map(Value::as_object))
}

fn matches_condition(value: Option<&Value>, condition: &Value) -> bool {
    match condition.as_object() {
        Some(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => {
            ops.iter().all(|(op, arg)| apply_operator(value, op, arg))
        }
        _ => value.is_some_and(|v| values_equal(v, condition)),
    }
}

fn apply_operator(value: Option<&Value>, op: &str, arg: &Value) -> bool {
    let ordered = |accept: fn(Ordering) -> bool| {
        value.is_some_and(|v| same_kind(v, arg) && accept(compare_values(v, arg)))
    };
    match op {
        "$eq" => value.is_some_and(|v| values_equal(v, arg)),
        "$ne" => !value.is_some_and(|v| values_equal(v, arg)),
        "$gt" => ordered(|o| o == Ordering::Greater),
        "$gte" => ordered(|o| o != Ordering::Less),
        "$lt" => ordered(|o| o == Ordering::Less),
        "$lte" => ordered(|o| o != Ordering::Greater),
        "$in" => arg
            .as_array()
            .is_some_and(|list| value.is_some_and(|v| list.iter().any(|a| values_equal(v, a)))),
        "$nin" => arg
            .as_array()
            .is_some_and(|list| !value.is_some_and(|v| list.iter().any(|a| values_equal(v, a)))),
        "$exists" => arg.as_bool() == Some(value.is_some()),
        _ => false,
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Null, Value::Null)
    )
}

/// Equality that treats `1` and `1.0` as the same number.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

/// Total order over JSON values, consistent with the index encoding:
/// null < false < true < numbers < strings. Arrays and objects sort last
/// and compare equal among themselves.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
