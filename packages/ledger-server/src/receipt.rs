//! Receipt tracking for `/receipt/{id}` polling (spec.md §6.2, §7).
//!
//! Write endpoints are fire-and-forget: a `202` means "durably enqueued",
//! not "committed". A receipt only appears here once its batch has
//! actually been applied to the store, giving callers a way to obtain
//! strong visibility without blocking the write path.

use dashmap::DashMap;

use crate::queue::OperationId;

/// One committed write's outcome.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub operation_id: OperationId,
    pub key: String,
    pub created_at_block: u64,
}

/// Lock-free map from operation id to its receipt, populated by the
/// consumer after each successful `apply_block`.
#[derive(Default)]
pub struct ReceiptRegistry {
    receipts: DashMap<OperationId, Receipt>,
}

impl ReceiptRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(&self, operation_id: OperationId, key: String, created_at_block: u64) {
        self.receipts.insert(operation_id, Receipt { operation_id, key, created_at_block });
    }

    #[must_use]
    pub fn get(&self, operation_id: OperationId) -> Option<Receipt> {
        self.receipts.get(&operation_id).map(|entry| entry.clone())
    }
}
