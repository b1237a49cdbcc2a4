//! Write Queue (component C3, spec.md §4.3).
//!
//! Mutex-guarded, single-writer-at-any-instant list pair. The HTTP ingress
//! calls [`WriteQueue::enqueue`]; the Block Processor calls
//! [`WriteQueue::drain`] once per tick.

use std::collections::{BTreeMap, HashMap};

use ledger_core::attribute::is_synthetic;
use ledger_core::{synthetic, tx_op_index};
use parking_lot::Mutex;
use thiserror::Error;

use super::types::{EnqueueRequest, OperationId, PendingEntity, PendingKind};

/// Validation failures raised before a request ever touches the queue's
/// lists (spec.md §6.2, §7: `ErrValidation`, never reaches the queue).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("key must not be empty")]
    EmptyKey,
    #[error("content_type must not be empty")]
    EmptyContentType,
    #[error("expires_in (btl) must be greater than zero")]
    NonPositiveBtl,
    #[error("attribute key {0:?} is reserved for system use")]
    ReservedAttributeKey(String),
}

/// A drained snapshot of pending work, ready for the Block Processor to
/// assign final op-indices relative to the target block.
#[derive(Debug, Default)]
pub struct Drained {
    pub creates: Vec<PendingEntity>,
    pub updates: Vec<PendingEntity>,
}

impl Drained {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty()
    }
}

struct Inner {
    creates: Vec<PendingEntity>,
    updates: Vec<PendingEntity>,
    current_block: u64,
    cur_tx_index: u64,
    cur_op_index: u64,
}

/// The queue itself. Cloneable via `Arc` at the call site; internal state
/// is a single `parking_lot::Mutex` guarding everything that must move
/// together (spec.md §4.3: "a mutex", singular).
pub struct WriteQueue {
    inner: Mutex<Inner>,
    ops_per_tx: u64,
}

impl WriteQueue {
    #[must_use]
    pub fn new(starting_block: u64, ops_per_tx: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                creates: Vec::new(),
                updates: Vec::new(),
                current_block: starting_block,
                cur_tx_index: 0,
                cur_op_index: 0,
            }),
            ops_per_tx,
        }
    }

    /// Rejects a raw user-supplied attribute map that names a reserved
    /// (`$`-prefixed) key.
    ///
    /// spec.md §9 describes this check as living in the consumer (C2), but
    /// C2 legitimately receives a producer-injected `$key` string attribute
    /// once a request reaches the wire `OperationPayload` (see
    /// `crate::store::memory::write_version`): by the time a payload gets
    /// there, `$key` is supposed to be present. Enforcing the reservation
    /// here, against the attribute map as the caller supplied it (before
    /// `$key` injection), is the only point in the pipeline where "user
    /// tried to set a synthetic key" and "the system set one" are
    /// distinguishable.
    fn reject_reserved_keys(strings: &BTreeMap<String, String>, numerics: &HashMap<String, serde_json::Value>) -> Result<(), EnqueueError> {
        for key in strings.keys().chain(numerics.keys()) {
            if is_synthetic(key) {
                return Err(EnqueueError::ReservedAttributeKey(key.clone()));
            }
        }
        Ok(())
    }

    fn validate(request: &EnqueueRequest) -> Result<(), EnqueueError> {
        if request.plaintext_key.is_empty() {
            return Err(EnqueueError::EmptyKey);
        }
        if request.content_type.is_empty() {
            return Err(EnqueueError::EmptyContentType);
        }
        if request.btl == 0 {
            return Err(EnqueueError::NonPositiveBtl);
        }
        Self::reject_reserved_keys(&request.string_attributes, &request.numeric_attributes)?;
        Ok(())
    }

    /// Enqueues a create or update request, returning the operation id the
    /// caller should hand back to the client for `/receipt/{id}` polling.
    pub fn enqueue(&self, kind: PendingKind, mut request: EnqueueRequest) -> Result<OperationId, EnqueueError> {
        Self::validate(&request)?;

        request.string_attributes.insert(synthetic::KEY.to_string(), request.plaintext_key.clone());

        let operation_id = OperationId::new();
        let mut inner = self.inner.lock();

        let tx_index = inner.cur_tx_index;
        let op_index = inner.cur_op_index;
        inner.cur_op_index = (inner.cur_op_index + 1) % self.ops_per_tx;
        if inner.cur_op_index == 0 {
            inner.cur_tx_index += 1;
        }

        let entity = PendingEntity { operation_id, kind, request, tx_index, op_index };
        match kind {
            PendingKind::Create => inner.creates.push(entity),
            PendingKind::Update => inner.updates.push(entity),
        }

        Ok(operation_id)
    }

    /// Drains both lists and, if anything was drained, advances the
    /// in-flight block number and resets the op-index counters
    /// (spec.md §4.3 drain contract).
    pub fn drain(&self) -> Drained {
        let mut inner = self.inner.lock();
        let drained = Drained {
            creates: std::mem::take(&mut inner.creates),
            updates: std::mem::take(&mut inner.updates),
        };
        if !drained.is_empty() {
            inner.cur_tx_index = 0;
            inner.cur_op_index = 0;
            inner.current_block += 1;
        }
        drained
    }

    #[must_use]
    pub fn current_block(&self) -> u64 {
        self.inner.lock().current_block
    }

    /// Current combined length of both lists, reported by `/health`
    /// (spec.md §6.2).
    #[must_use]
    pub fn queue_size(&self) -> usize {
        let inner = self.inner.lock();
        inner.creates.len() + inner.updates.len()
    }

    #[must_use]
    pub fn ops_per_tx(&self) -> u64 {
        self.ops_per_tx
    }
}

/// Assigns final `(tx_index, op_index)` pairs to a drained snapshot in
/// arrival order, creates first then updates, continuing the numbering
/// across the boundary (spec.md §4.4 step 3).
pub fn renumber(drained: &mut Drained, ops_per_tx: u64) {
    let mut position = 0u64;
    for entity in drained.creates.iter_mut().chain(drained.updates.iter_mut()) {
        let (tx_index, op_index) = tx_op_index(position, ops_per_tx);
        entity.tx_index = tx_index;
        entity.op_index = op_index;
        position += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ledger_core::OwnerAddress;

    fn request(key: &str) -> EnqueueRequest {
        EnqueueRequest {
            plaintext_key: key.to_string(),
            content_type: "text/plain".to_string(),
            content: Bytes::from_static(b"hello"),
            owner: OwnerAddress::from_bytes([0u8; 20]),
            btl: 100,
            string_attributes: BTreeMap::new(),
            numeric_attributes: HashMap::new(),
        }
    }

    #[test]
    fn op_index_wraps_and_advances_tx_index() {
        let queue = WriteQueue::new(1, 10);
        for i in 0..15 {
            queue.enqueue(PendingKind::Create, request(&format!("k{i}"))).unwrap();
        }
        let drained = queue.drain();
        assert_eq!(drained.creates.len(), 15);
        assert_eq!((drained.creates[9].tx_index, drained.creates[9].op_index), (0, 9));
        assert_eq!((drained.creates[10].tx_index, drained.creates[10].op_index), (1, 0));
        assert_eq!((drained.creates[14].tx_index, drained.creates[14].op_index), (1, 4));
    }

    #[test]
    fn drain_resets_counters_and_advances_block_only_when_nonempty() {
        let queue = WriteQueue::new(1, 10);
        assert!(queue.drain().is_empty());
        assert_eq!(queue.current_block(), 1);

        queue.enqueue(PendingKind::Create, request("a")).unwrap();
        let drained = queue.drain();
        assert!(!drained.is_empty());
        assert_eq!(queue.current_block(), 2);
    }

    #[test]
    fn injects_plaintext_key_string_attribute() {
        let queue = WriteQueue::new(1, 10);
        queue.enqueue(PendingKind::Create, request("my-key")).unwrap();
        let drained = queue.drain();
        assert_eq!(drained.creates[0].request.string_attributes.get("$key"), Some(&"my-key".to_string()));
    }

    #[test]
    fn rejects_reserved_attribute_keys() {
        let queue = WriteQueue::new(1, 10);
        let mut req = request("a");
        req.string_attributes.insert("$owner".to_string(), "spoofed".to_string());
        let err = queue.enqueue(PendingKind::Create, req).unwrap_err();
        assert!(matches!(err, EnqueueError::ReservedAttributeKey(_)));
    }

    #[test]
    fn rejects_empty_key_and_non_positive_btl() {
        let queue = WriteQueue::new(1, 10);
        let mut req = request("");
        assert_eq!(queue.enqueue(PendingKind::Create, req.clone()).unwrap_err(), EnqueueError::EmptyKey);
        req.plaintext_key = "k".to_string();
        req.btl = 0;
        assert_eq!(queue.enqueue(PendingKind::Create, req).unwrap_err(), EnqueueError::NonPositiveBtl);
    }
}
