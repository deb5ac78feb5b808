use serde_json::Value;

use crate::encoding::{INDEX_MAX, encode_prefix, encode_prefix_upper};
use crate::error::{QueryError, Result};
use crate::types::{DELETED_FIELD, RxSchema};

use super::mango::{MangoQuery, SortDirection};

/// How a query is answered from one index: the index, the encoded key range
/// to scan, and what the scan already guarantees.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    /// Field list of the index to scan, `_deleted` prefix included.
    pub index: Vec<String>,
    pub start_key: String,
    pub end_key: String,
    pub inclusive_start: bool,
    pub inclusive_end: bool,
    /// Index order already equals the requested order.
    pub sort_satisfied_by_index: bool,
    /// Every entry in range matches; the matcher can be skipped.
    pub selector_satisfied_by_index: bool,
}

impl QueryPlan {
    /// Every live document, in primary key order.
    pub fn full_scan(primary_path: &str) -> Self {
        let index = vec![DELETED_FIELD.to_string(), primary_path.to_string()];
        let (start_key, end_key) = live_bounds(&index);
        Self {
            index,
            start_key,
            end_key,
            inclusive_start: true,
            inclusive_end: false,
            sort_satisfied_by_index: true,
            selector_satisfied_by_index: false,
        }
    }
}

fn live_bounds(index: &[String]) -> (String, String) {
    let live = [Value::Bool(false)];
    (
        encode_prefix(index, &live).unwrap_or_default(),
        encode_prefix_upper(index, &live).unwrap_or_else(|_| INDEX_MAX.to_string()),
    )
}

/// A query together with its execution plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedQuery {
    pub query: MangoQuery,
    pub primary_path: String,
    pub plan: QueryPlan,
}

/// Turns a query into index bounds.
pub trait QueryPlanner: Send + Sync {
    fn prepare(&self, schema: &RxSchema, query: &MangoQuery) -> Result<PreparedQuery>;
}

/// Picks the schema index whose fields equal an all-ascending sort, else the
/// primary key index, and narrows the scan with a range condition on the
/// index's first field when the selector has one.
#[derive(Debug, Default, Clone, Copy)]
pub struct IndexScanPlanner;

impl QueryPlanner for IndexScanPlanner {
    fn prepare(&self, schema: &RxSchema, query: &MangoQuery) -> Result<PreparedQuery> {
        if query.sort.iter().any(|part| part.field.is_empty()) {
            return Err(QueryError::Invalid("sort field must not be empty".to_string()).into());
        }
        let primary_path = schema.primary_key.as_str();
        let primary_index = vec![primary_path.to_string()];

        let sort_fields: Vec<String> = query.sort.iter().map(|p| p.field.clone()).collect();
        let all_ascending = query.sort.iter().all(|p| p.direction == SortDirection::Asc);
        let sorted_index = schema
            .indexes
            .iter()
            .chain(std::iter::once(&primary_index))
            .find(|fields| all_ascending && !sort_fields.is_empty() && **fields == sort_fields);

        let (fields, sort_satisfied) = match sorted_index {
            Some(fields) => (fields.clone(), true),
            None => (primary_index, query.sort.is_empty()),
        };
        let mut index = Vec::with_capacity(fields.len() + 1);
        index.push(DELETED_FIELD.to_string());
        index.extend(fields);

        let (mut start_key, mut end_key) = live_bounds(&index);
        if let Some(condition) = query.selector.get(&index[1]) {
            narrow(&index, condition, &mut start_key, &mut end_key);
        }

        Ok(PreparedQuery {
            query: query.clone(),
            primary_path: primary_path.to_string(),
            plan: QueryPlan {
                index,
                start_key,
                end_key,
                inclusive_start: true,
                inclusive_end: false,
                sort_satisfied_by_index: sort_satisfied,
                selector_satisfied_by_index: false,
            },
        })
    }
}

/// Tighten the bounds from an equality or range condition on the first field
/// after `_deleted`. Non-scalar operands leave the bounds untouched.
fn narrow(index: &[String], condition: &Value, start: &mut String, end: &mut String) {
    let prefix = |value: &Value| encode_prefix(index, &[Value::Bool(false), value.clone()]).ok();
    let prefix_upper =
        |value: &Value| encode_prefix_upper(index, &[Value::Bool(false), value.clone()]).ok();

    let mut lowers = Vec::new();
    let mut uppers = Vec::new();
    match condition.as_object() {
        Some(ops) => {
            for (op, arg) in ops {
                match op.as_str() {
                    "$eq" => {
                        lowers.push(prefix(arg));
                        uppers.push(prefix_upper(arg));
                    }
                    "$gt" => lowers.push(prefix_upper(arg)),
                    "$gte" => lowers.push(prefix(arg)),
                    "$lt" => uppers.push(prefix(arg)),
                    "$lte" => uppers.push(prefix_upper(arg)),
                    _ => {}
                }
            }
        }
        None => {
            lowers.push(prefix(condition));
            uppers.push(prefix_upper(condition));
        }
    }

    if let Some(lower) = lowers.into_iter().flatten().max()
        && lower > *start
    {
        *start = lower;
    }
    if let Some(upper) = uppers.into_iter().flatten().min()
        && upper < *end
    {
        *end = upper;
    }
}
