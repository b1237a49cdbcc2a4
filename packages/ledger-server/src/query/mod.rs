//! Query Builder / Query Layer (component C5, spec.md §4.5).
//!
//! Thin: the point-lookup shortcut and predicate evaluation already live in
//! [`crate::store`] since they need direct access to each backend's
//! indexes. This module owns HTTP filter-body parsing and the pass-through
//! call into the store.

pub mod filter;

use ledger_core::{EntityData, QueryExpr, QueryOptions};

use crate::store::{BiTemporalStore, StoreError};

pub use filter::{FilterBody, FilterParseError};

/// Runs a query against `store`, returning matching entities in the shape
/// the HTTP layer serializes directly (spec.md §4.5 "Result").
pub async fn run(store: &dyn BiTemporalStore, expr: &QueryExpr, options: &QueryOptions) -> Result<Vec<EntityData>, StoreError> {
    store.query_entities(expr, options).await
}
