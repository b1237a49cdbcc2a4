//! The Bi-Temporal EAV Store contract (component C1, spec.md §4.1).

use async_trait::async_trait;
use ledger_core::{BlockBatch, EntityData, EntityKey, MalformedBatchError, QueryExpr, QueryOptions};
use thiserror::Error;

/// Errors raised by a [`BiTemporalStore`].
///
/// Variants map directly onto spec.md §7's error kinds: `AlreadyExists`,
/// `NotFound`, and `MalformedBatch` are fatal to the containing block.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity already exists and is still active")]
    AlreadyExists,

    #[error("entity not found or already expired")]
    NotFound,

    #[error("malformed batch: {0}")]
    MalformedBatch(#[from] MalformedBatchError),

    #[error("bad query: {0}")]
    BadQuery(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Persists entities as versioned string-attribute, numeric-attribute, and
/// payload rows; exposes apply-block, query, and get-latest-block.
///
/// Concurrency contract (spec.md §4.1): at most one writer (`apply_block`)
/// runs at a time per instance; readers (`query_entities`,
/// `get_last_block`) observe the state as of the most recently committed
/// block and never block the writer.
#[async_trait]
pub trait BiTemporalStore: Send + Sync {
    /// Atomically applies every operation of every block in `batch`, in
    /// `(tx_index, op_index)` order, updating the last-committed block.
    ///
    /// Fails atomically -- no partial application -- if any operation
    /// violates a schema constraint or if the batch is not strictly
    /// monotonic relative to the last committed block.
    async fn apply_block(&self, batch: &BlockBatch) -> Result<(), StoreError>;

    /// Executes a query expression against the most recent (or a
    /// historical, via `options.at_block`) snapshot.
    async fn query_entities(
        &self,
        expr: &QueryExpr,
        options: &QueryOptions,
    ) -> Result<Vec<EntityData>, StoreError>;

    /// Returns the largest block number applied so far, or 0 if none.
    async fn get_last_block(&self) -> u64;

    /// Returns the keys of every entity whose `$expiration` equals `block`
    /// and is still active -- the set the block processor must close.
    async fn expired_at(&self, block: u64) -> Vec<EntityKey>;

    /// Count of entities with at least one currently active row.
    async fn count_active(&self) -> u64;

    /// Administrative truncate. Returns `Ok(false)` when the backend does
    /// not support truncation (surfaced as `ErrNotImplemented` at the HTTP
    /// layer, spec.md §6.2).
    async fn clean(&self) -> Result<bool, StoreError>;
}
