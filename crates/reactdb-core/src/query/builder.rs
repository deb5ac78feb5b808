use serde_json::Value;

use crate::error::{QueryError, Result};

use super::mango::{MangoQuery, SortDirection, SortPart};

/// Chainable query refinement. Collections without one reject the builder
/// methods on [`RxQuery`](super::RxQuery) with `Error::PluginMissing`.
pub trait QueryBuilder: Send + Sync {
    fn where_eq(&self, query: &MangoQuery, field: &str, value: Value) -> Result<MangoQuery>;

    fn sort(&self, query: &MangoQuery, field: &str, direction: SortDirection) -> Result<MangoQuery>;

    fn skip(&self, query: &MangoQuery, skip: Option<usize>) -> Result<MangoQuery>;

    fn limit(&self, query: &MangoQuery, limit: Option<usize>) -> Result<MangoQuery>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MangoQueryBuilder;

impl QueryBuilder for MangoQueryBuilder {
    fn where_eq(&self, query: &MangoQuery, field: &str, value: Value) -> Result<MangoQuery> {
        if field.is_empty() || field.starts_with('$') {
            return Err(QueryError::Invalid(format!("'{field}' is not a field name")).into());
        }
        let mut next = query.clone();
        next.selector.insert(field.to_string(), value);
        Ok(next)
    }

    fn sort(
        &self,
        query: &MangoQuery,
        field: &str,
        direction: SortDirection,
    ) -> Result<MangoQuery> {
        if field.is_empty() {
            return Err(QueryError::Invalid("sort field must not be empty".to_string()).into());
        }
        if query.sort.iter().any(|part| part.field == field) {
            return Err(QueryError::Invalid(format!("already sorted by '{field}'")).into());
        }
        let mut next = query.clone();
        next.sort.push(SortPart {
            field: field.to_string(),
            direction,
        });
        Ok(next)
    }

    fn skip(&self, query: &MangoQuery, skip: Option<usize>) -> Result<MangoQuery> {
        let mut next = query.clone();
        next.skip = skip;
        Ok(next)
    }

    fn limit(&self, query: &MangoQuery, limit: Option<usize>) -> Result<MangoQuery> {
        let mut next = query.clone();
        next.limit = limit;
        Ok(next)
    }
}
