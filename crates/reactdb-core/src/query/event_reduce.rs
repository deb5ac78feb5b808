use crate::types::{ChangeEvent, Document, get_path};

use super::mango::QueryMatcher;
use super::planner::PreparedQuery;

/// What an [`EventReducer`] concluded from a batch of change events.
#[derive(Debug, Clone, PartialEq)]
pub enum ReduceOutcome {
    /// The events do not affect the result.
    Unchanged,
    /// The new result cannot be derived from the events alone.
    RunFullQueryAgain,
    /// The new result, in query order.
    NewResults(Vec<Document>),
}

pub struct ReduceInput<'a> {
    pub query: &'a PreparedQuery,
    /// The cached result the events are applied to.
    pub current: &'a [Document],
    /// At most one event per document, oldest first.
    pub events: &'a [ChangeEvent],
    pub matcher: &'a dyn QueryMatcher,
}

/// Derives a query's new result from its old result plus change events.
pub trait EventReducer: Send + Sync {
    fn reduce(&self, input: ReduceInput<'_>) -> ReduceOutcome;
}

/// Applies events to the cached result when the outcome is certain and asks
/// for a full run otherwise.
///
/// With a skip, any relevant event forces a full run. With a limit, removing a
/// document from a full window, or moving one to the last slot of a full
/// window, forces a full run because a document outside the window may
/// belong in it.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEventReducer;

impl EventReducer for DefaultEventReducer {
    fn reduce(&self, input: ReduceInput<'_>) -> ReduceOutcome {
        let ReduceInput {
            query,
            current,
            events,
            matcher,
        } = input;
        let id_of = |doc: &Document| {
            get_path(doc, &query.primary_path)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let limit = query.query.limit;

        if query.query.has_skip() {
            let relevant = events.iter().any(|event| {
                matcher.matches(query, &event.document)
                    || event.previous.as_ref().is_some_and(|p| matcher.matches(query, p))
                    || current
                        .iter()
                        .any(|d| id_of(d).as_deref() == Some(event.document_id.as_str()))
            });
            return if relevant {
                ReduceOutcome::RunFullQueryAgain
            } else {
                ReduceOutcome::Unchanged
            };
        }

        let mut documents = current.to_vec();
        for event in events {
            let id = event.document_id.as_str();
            let position = documents.iter().position(|d| id_of(d).as_deref() == Some(id));
            let matches_now = matcher.matches(query, &event.document);
            let window_full = limit.is_some_and(|l| documents.len() >= l);

            match (position, matches_now) {
                (None, false) => {}
                (Some(index), false) => {
                    if window_full {
                        return ReduceOutcome::RunFullQueryAgain;
                    }
                    documents.remove(index);
                }
                (Some(index), true) => {
                    documents[index] = event.document.clone();
                    documents.sort_by(|a, b| matcher.compare(query, a, b));
                    let now_last = documents.last().and_then(id_of).as_deref() == Some(id);
                    if window_full && now_last {
                        return ReduceOutcome::RunFullQueryAgain;
                    }
                }
                (None, true) => {
                    documents.push(event.document.clone());
                    documents.sort_by(|a, b| matcher.compare(query, a, b));
                    if let Some(limit) = limit {
                        documents.truncate(limit);
                    }
                }
            }
        }

        if documents == current {
            ReduceOutcome::Unchanged
        } else {
            ReduceOutcome::NewResults(documents)
        }
    }
}

/// Never reduces; every change triggers a full run.
#[derive(Debug, Default, Clone, Copy)]
pub struct FullRerunReducer;

impl EventReducer for FullRerunReducer {
    fn reduce(&self, _input: ReduceInput<'_>) -> ReduceOutcome {
        ReduceOutcome::RunFullQueryAgain
    }
}
