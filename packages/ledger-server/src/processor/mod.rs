//! Block Processor (component C4, spec.md §4.4).

pub mod channel;

use std::sync::Arc;
use std::time::{Duration, Instant};

use ledger_core::{Block, BlockBatch, Operation, OperationPayload};
use tracing::{error, info, warn};

use crate::queue::{renumber, OperationId, PendingKind, WriteQueue};
use crate::store::BiTemporalStore;

pub use channel::{bounded, BatchReceiver, BatchSender, ChannelClosed};

/// A `(operation id, plaintext key)` pair riding alongside a batch so the
/// consumer can confirm receipts once the batch actually commits. The wire
/// `Operation` itself carries no operation id (spec.md §6.1 is bit-exact
/// and has no room for one).
#[derive(Debug, Clone)]
pub struct PendingReceipt {
    pub operation_id: OperationId,
    pub key: String,
}

/// A `BlockBatch` paired with the receipts it should confirm once applied.
#[derive(Debug, Clone)]
pub struct ProcessedBatch {
    pub batch: BlockBatch,
    pub receipts: Vec<PendingReceipt>,
}

fn payload_from_request(request: &crate::queue::EnqueueRequest) -> OperationPayload {
    OperationPayload {
        key: ledger_core::EntityKey::hash(&request.plaintext_key),
        content_type: request.content_type.clone(),
        btl: request.btl,
        owner: request.owner,
        content: request.content.clone(),
        string_attributes: request.string_attributes.clone(),
        numeric_attributes: ledger_core::coerce_numeric_map(&request.numeric_attributes).into_iter().collect(),
    }
}

/// Builds one tick's `ProcessedBatch` from a queue snapshot plus the set of
/// entity keys the store reports as expiring at `block_number`
/// (spec.md §4.4 steps 2-4). Returns `None` if there is nothing to do.
fn build_batch(block_number: u64, mut drained: crate::queue::Drained, expired: Vec<ledger_core::EntityKey>, ops_per_tx: u64) -> Option<ProcessedBatch> {
    if drained.is_empty() && expired.is_empty() {
        return None;
    }

    renumber(&mut drained, ops_per_tx);
    let next_position = (drained.creates.len() + drained.updates.len()) as u64;

    let mut receipts = Vec::with_capacity(drained.creates.len() + drained.updates.len());
    let mut operations = Vec::with_capacity(drained.creates.len() + drained.updates.len() + expired.len());

    for entity in &drained.creates {
        operations.push(Operation::create(entity.tx_index, entity.op_index, payload_from_request(&entity.request)));
        receipts.push(PendingReceipt { operation_id: entity.operation_id, key: entity.request.plaintext_key.clone() });
    }
    for entity in &drained.updates {
        operations.push(Operation::update(entity.tx_index, entity.op_index, payload_from_request(&entity.request)));
        receipts.push(PendingReceipt { operation_id: entity.operation_id, key: entity.request.plaintext_key.clone() });
    }
    for (offset, key) in expired.into_iter().enumerate() {
        let (tx_index, op_index) = ledger_core::tx_op_index(next_position + offset as u64, ops_per_tx);
        operations.push(Operation::delete(tx_index, op_index, key));
    }

    let block = Block::new(block_number, operations);
    Some(ProcessedBatch { batch: BlockBatch::single(block), receipts })
}

/// Drives the periodic tick: drains the queue, discovers expirations,
/// assembles a batch, and pushes it to the consumer.
pub struct BlockProcessor {
    queue: Arc<WriteQueue>,
    store: Arc<dyn BiTemporalStore>,
    sender: BatchSender,
    cadence: Duration,
}

impl BlockProcessor {
    #[must_use]
    pub fn new(queue: Arc<WriteQueue>, store: Arc<dyn BiTemporalStore>, sender: BatchSender, cadence: Duration) -> Self {
        Self { queue, store, sender, cadence }
    }

    /// Runs one tick's worth of work (spec.md §4.4 steps 1-5).
    ///
    /// Returns `Ok(true)` if a batch was pushed, `Ok(false)` if the tick
    /// was skipped (nothing pending), `Err` if the push channel is closed.
    async fn tick(&self) -> Result<bool, ChannelClosed> {
        let span = tracing::info_span!("block_processor_tick", block = tracing::field::Empty);
        let _entered = span.enter();

        let block_number = self.queue.current_block();
        span.record("block", block_number);
        let started = Instant::now();

        let drained = self.queue.drain();
        let expired = self.store.expired_at(block_number).await;

        let Some(processed) = build_batch(block_number, drained, expired, self.queue.ops_per_tx()) else {
            return Ok(false);
        };

        let operations = &processed.batch.blocks[0].operations;
        let entity_count = operations.len();
        let string_attrs: usize = operations
            .iter()
            .filter_map(|op| match &op.kind {
                ledger_core::OperationKind::Create(p) | ledger_core::OperationKind::Update(p) => Some(p.string_attributes.len()),
                ledger_core::OperationKind::Delete(_) => None,
            })
            .sum();
        let numeric_attrs: usize = operations
            .iter()
            .filter_map(|op| match &op.kind {
                ledger_core::OperationKind::Create(p) | ledger_core::OperationKind::Update(p) => Some(p.numeric_attributes.len()),
                ledger_core::OperationKind::Delete(_) => None,
            })
            .sum();

        self.sender.push(processed).await?;

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::counter!("ledger_blocks_produced_total").increment(1);
        metrics::counter!("ledger_operations_applied_total").increment(entity_count as u64);
        metrics::histogram!("ledger_block_tick_duration_ms").record(duration_ms);
        info!(block = block_number, operations = entity_count, string_attrs, numeric_attrs, duration_ms, "pushed block to consumer");
        Ok(true)
    }

    /// Runs the tick loop at `cadence`, recovering panics inside a tick so
    /// later ticks continue (spec.md §4.4 step 7, §7).
    ///
    /// Returns when `cancel` fires (graceful shutdown) or the push channel
    /// closes (the consumer side went away).
    pub async fn run(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        let mut interval = tokio::time::interval(self.cadence);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("shutdown requested; stopping block processor");
                    return;
                }
                _ = interval.tick() => {}
            }

            let this = Arc::clone(&self);
            let started = Instant::now();
            let result = tokio::spawn(async move { this.tick().await }).await;
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(ChannelClosed)) => {
                    warn!("consumer channel closed; stopping block processor");
                    return;
                }
                Err(join_err) => {
                    error!(error = %join_err, elapsed = ?started.elapsed(), "block processor tick panicked; continuing");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ledger_core::{EntityKey, OwnerAddress};
    use std::collections::{BTreeMap, HashMap};

    use crate::queue::{Drained, EnqueueRequest, PendingEntity};

    fn entity(key: &str, id: OperationId) -> PendingEntity {
        PendingEntity {
            operation_id: id,
            kind: PendingKind::Create,
            request: EnqueueRequest {
                plaintext_key: key.to_string(),
                content_type: "text/plain".to_string(),
                content: Bytes::from_static(b"x"),
                owner: OwnerAddress::from_bytes([0u8; 20]),
                btl: 10,
                string_attributes: BTreeMap::new(),
                numeric_attributes: HashMap::new(),
            },
            tx_index: 0,
            op_index: 0,
        }
    }

    #[test]
    fn build_batch_returns_none_when_nothing_pending() {
        assert!(build_batch(1, Drained::default(), vec![], 10).is_none());
    }

    #[test]
    fn build_batch_orders_creates_then_updates_then_deletes() {
        let drained = Drained {
            creates: vec![entity("a", OperationId::new())],
            updates: vec![entity("b", OperationId::new())],
        };
        let expired = vec![EntityKey::hash("c")];
        let processed = build_batch(5, drained, expired, 10).unwrap();
        let ops = &processed.batch.blocks[0].operations;
        assert_eq!(ops.len(), 3);
        assert!(matches!(ops[0].kind, ledger_core::OperationKind::Create(_)));
        assert!(matches!(ops[1].kind, ledger_core::OperationKind::Update(_)));
        assert!(matches!(ops[2].kind, ledger_core::OperationKind::Delete(_)));
        assert_eq!(processed.receipts.len(), 2);
    }

    #[test]
    fn build_batch_continues_op_index_numbering_into_deletes() {
        let drained = Drained { creates: vec![entity("a", OperationId::new())], updates: vec![] };
        let expired = vec![EntityKey::hash("b"), EntityKey::hash("c")];
        let processed = build_batch(5, drained, expired, 10).unwrap();
        let ops = &processed.batch.blocks[0].operations;
        assert_eq!((ops[0].tx_index, ops[0].op_index), (0, 0));
        assert_eq!((ops[1].tx_index, ops[1].op_index), (0, 1));
        assert_eq!((ops[2].tx_index, ops[2].op_index), (0, 2));
    }
}
