//! Request/pending-entity types shared by the Write Queue and Block
//! Processor (spec.md §4.3, §4.4).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use ledger_core::OwnerAddress;
use serde::{Deserialize, Serialize};

/// Client-visible handle for polling `/receipt/{id}` (spec.md §6.2).
///
/// Backed by a process-local monotonic counter rather than a UUID: receipts
/// only need to be unique within one server's lifetime, and a counter avoids
/// pulling in randomness for something this cheap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u64);

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

impl OperationId {
    #[must_use]
    pub fn new() -> Self {
        Self(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded create/update request, as handed to the Write Queue by the
/// HTTP ingress (C6) after JSON decoding.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub plaintext_key: String,
    pub content_type: String,
    pub content: Bytes,
    pub owner: OwnerAddress,
    /// Blocks-to-live; combined with the commit block to compute
    /// `$expiration` (spec.md §4.1).
    pub btl: u64,
    pub string_attributes: BTreeMap<String, String>,
    /// Raw, not-yet-coerced numeric annotations as received over the wire
    /// (spec.md §4.3: ints, floats, or decimal strings).
    pub numeric_attributes: HashMap<String, serde_json::Value>,
}

/// Which kind of write this pending entity represents. Delete requests
/// never pass through `EnqueueRequest`/`PendingEntity` since they carry no
/// payload; the queue tracks them separately (see `write_queue`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Create,
    Update,
}

/// A queued create or update, already assigned its `(tx_index, op_index)`
/// and operation id, waiting to be drained into a block (spec.md §4.3).
#[derive(Debug, Clone)]
pub struct PendingEntity {
    pub operation_id: OperationId,
    pub kind: PendingKind,
    pub request: EnqueueRequest,
    pub tx_index: u64,
    pub op_index: u64,
}
