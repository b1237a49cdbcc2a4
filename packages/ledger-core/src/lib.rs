//! Ledger core -- entity-key hashing, the bi-temporal block/operation wire
//! schema, numeric-annotation coercion, and the query expression language.
//!
//! This crate has no I/O: no clock, no storage engine, no network. It is the
//! shared vocabulary between the write queue, the block processor, the
//! bi-temporal store, and the query layer, all of which live in
//! `ledger-server`.

pub mod attribute;
pub mod block;
pub mod entity;
pub mod key;
pub mod numeric;
pub mod query;

pub use attribute::{is_synthetic, synthetic, AttributeValue, NumericValue, StringValue};
pub use block::{
    tx_op_index, Block, BlockBatch, MalformedBatchError, Operation, OperationDecodeError,
    OperationKind, OperationPayload, OwnerAddress, DEFAULT_OPS_PER_TX, INF,
};
pub use entity::{EntityData, StringOrNumeric};
pub use key::{EntityKey, KeyParseError};
pub use numeric::{coerce_numeric, coerce_numeric_map};
pub use query::{ComparisonOp, IncludeMask, Predicate, QueryExpr, QueryOptions, DEFAULT_RESULTS_PER_PAGE};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }

    #[test]
    fn reexports_accessible() {
        let _ = crate::EntityKey::hash("smoke-test");
        let _ = crate::INF;
        let _ = crate::IncludeMask::default();
        let _ = crate::QueryOptions::default();
    }
}
