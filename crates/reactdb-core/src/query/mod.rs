//! Live queries: Mango queries, planning, incremental recomputation from
//! change events, and the per-collection query cache.

pub mod builder;
pub mod cache;
pub mod event_reduce;
pub mod mango;
pub mod planner;
pub mod rx_query;

pub use builder::{MangoQueryBuilder, QueryBuilder};
pub use cache::{CacheReplacementPolicy, DefaultCacheReplacementPolicy, QueryCache, query_signature};
pub use event_reduce::{
    DefaultEventReducer, EventReducer, FullRerunReducer, ReduceInput, ReduceOutcome,
};
pub use mango::{
    MangoMatcher, MangoQuery, QueryMatcher, SortDirection, SortPart, compare_values,
    is_find_one_by_id_query,
};
pub use planner::{IndexScanPlanner, PreparedQuery, QueryPlan, QueryPlanner};
pub use rx_query::{QueryOp, QueryOutput, QueryResult, QueryStats, QuerySubscription, RxQuery};
