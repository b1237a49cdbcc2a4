//! Operation Batch Consumer (component C2, spec.md §4.2).
//!
//! The boundary between "event stream" and "database": converts a
//! [`BlockBatch`] into calls against a [`BiTemporalStore`], re-asserting the
//! create-before-update-before-delete ordering the Block Processor is
//! supposed to have produced, and drives the store's `follow_events` loop.

use std::sync::Arc;

use ledger_core::{BlockBatch, OperationKind};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::processor::ProcessedBatch;
use crate::receipt::ReceiptRegistry;
use crate::store::{BiTemporalStore, BlockLog, StoreError};

/// Errors the consumer can raise before a batch ever reaches the store.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("block {block} has a {kind} operation at position {position} before all creates and updates")]
    OutOfOrder { block: u64, kind: &'static str, position: usize },
}

/// Validates ordering, then hands a batch to the store.
pub struct OperationBatchConsumer {
    store: Arc<dyn BiTemporalStore>,
    log: Arc<dyn BlockLog>,
    receipts: Arc<ReceiptRegistry>,
}

impl OperationBatchConsumer {
    #[must_use]
    pub fn new(store: Arc<dyn BiTemporalStore>, log: Arc<dyn BlockLog>, receipts: Arc<ReceiptRegistry>) -> Self {
        Self { store, log, receipts }
    }

    /// Re-asserts that every block in `batch` orders creates, then
    /// updates, then deletes (spec.md §4.2).
    fn validate_ordering(batch: &BlockBatch) -> Result<(), ValidationError> {
        for block in &batch.blocks {
            let mut seen_update = false;
            let mut seen_delete = false;
            for (position, op) in block.operations.iter().enumerate() {
                match &op.kind {
                    OperationKind::Create(_) => {
                        if seen_update || seen_delete {
                            return Err(ValidationError::OutOfOrder { block: block.number, kind: "create", position });
                        }
                    }
                    OperationKind::Update(_) => {
                        if seen_delete {
                            return Err(ValidationError::OutOfOrder { block: block.number, kind: "update", position });
                        }
                        seen_update = true;
                    }
                    OperationKind::Delete(_) => {
                        seen_delete = true;
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies one batch: validates ordering, commits to the store,
    /// appends to the durability log, and confirms receipts.
    pub async fn apply(&self, processed: &ProcessedBatch) -> Result<(), StoreError> {
        Self::validate_ordering(&processed.batch)
            .map_err(|e| StoreError::Backend(anyhow::anyhow!(e)))?;

        self.store.apply_block(&processed.batch).await?;

        if let Err(e) = self.log.append(&processed.batch).await {
            warn!(error = %e, "failed to append batch to durability log after a successful apply_block");
        }

        let block_number = processed.batch.blocks.first().map(|b| b.number).unwrap_or_default();
        for receipt in &processed.receipts {
            self.receipts.commit(receipt.operation_id, receipt.key.clone(), block_number);
        }

        Ok(())
    }

    /// Long-running loop: pulls processed batches from `rx` until it is
    /// closed, applying each via [`Self::apply`] (spec.md §4.1
    /// `follow_events`).
    ///
    /// A `StoreError::AlreadyExists`, `NotFound`, or `MalformedBatch` is
    /// fatal per spec.md §7: this function returns the error and the
    /// caller MUST treat the store as read-only until restart.
    pub async fn follow_events(&self, mut rx: mpsc::Receiver<ProcessedBatch>) -> Result<(), StoreError> {
        info!("batch consumer started");
        while let Some(processed) = rx.recv().await {
            if let Err(e) = self.apply(&processed).await {
                error!(error = %e, "fatal error applying batch; consumer stopping");
                return Err(e);
            }
        }
        info!("batch consumer stopped: channel closed");
        Ok(())
    }
}
