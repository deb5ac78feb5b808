use std::ops::Bound;

use crate::error::Result;
use crate::kv::{KvTransaction, Subspace};
use crate::query::{PreparedQuery, QueryMatcher};
use crate::types::Document;

use super::index_meta::IndexMeta;
use super::instance::decode_document;

/// Execute a prepared query as a range scan over `index`, resolving every
/// hit through the main store.
pub(crate) async fn run_query(
    tx: &mut dyn KvTransaction,
    main: &Subspace,
    index: &IndexMeta,
    prepared: &PreparedQuery,
    matcher: &dyn QueryMatcher,
) -> Result<Vec<Document>> {
    let plan = &prepared.plan;
    let query = &prepared.query;
    let skip = query.skip.unwrap_or(0);
    // Once the index yields the final order, the scan can stop at skip + limit.
    let wanted = match (plan.sort_satisfied_by_index, query.limit) {
        (true, Some(limit)) => Some(skip.saturating_add(limit)),
        _ => None,
    };

    let start = bound(&plan.start_key, plan.inclusive_start);
    let end = bound(&plan.end_key, plan.inclusive_end);
    let range = index.subspace.range_between(start, end);
    let raw_limit = if plan.selector_satisfied_by_index { wanted } else { None };
    let entries = tx.get_range(&range, raw_limit).await?;

    let mut documents = Vec::new();
    for (_, id) in entries {
        let Some(raw) = tx.get(&main.pack(&id)).await? else {
            continue;
        };
        let doc = decode_document(&raw)?;
        if !plan.selector_satisfied_by_index && !matcher.matches(prepared, &doc) {
            continue;
        }
        documents.push(doc);
        if wanted.is_some_and(|w| documents.len() >= w) {
            break;
        }
    }

    if !plan.sort_satisfied_by_index {
        documents.sort_by(|a, b| matcher.compare(prepared, a, b));
    }
    let documents = documents.into_iter().skip(skip);
    Ok(match query.limit {
        Some(limit) => documents.take(limit).collect(),
        None => documents.collect(),
    })
}

fn bound(key: &str, inclusive: bool) -> Bound<&[u8]> {
    if inclusive {
        Bound::Included(key.as_bytes())
    } else {
        Bound::Excluded(key.as_bytes())
    }
}
