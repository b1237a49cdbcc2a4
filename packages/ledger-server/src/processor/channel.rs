//! Bounded single-producer/single-consumer handoff between the Block
//! Processor and the Operation Batch Consumer (spec.md §4.4 step 5, §5).
//!
//! A push past the soft deadline logs a warning but keeps blocking: the
//! processor "MUST NOT drop the batch" and there is no hard cancellation.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use super::ProcessedBatch;

#[derive(Debug, Error)]
#[error("consumer channel closed")]
pub struct ChannelClosed;

/// Producer half, held by the Block Processor.
pub struct BatchSender {
    tx: mpsc::Sender<ProcessedBatch>,
    soft_deadline: Duration,
}

/// Consumer half, held by the Operation Batch Consumer's `follow_events`
/// loop.
pub struct BatchReceiver {
    rx: mpsc::Receiver<ProcessedBatch>,
}

/// Builds a bounded channel of the given capacity (spec.md §5: "bounded
/// buffer").
#[must_use]
pub fn bounded(capacity: usize, soft_deadline: Duration) -> (BatchSender, BatchReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (BatchSender { tx, soft_deadline }, BatchReceiver { rx })
}

impl BatchSender {
    /// Pushes a batch, blocking if the channel is full. Logs a warning
    /// once `soft_deadline` elapses but keeps waiting rather than giving
    /// up (spec.md §4.4 step 5).
    pub async fn push(&self, batch: ProcessedBatch) -> Result<(), ChannelClosed> {
        let send_fut = self.tx.send(batch);
        tokio::pin!(send_fut);
        let mut warned = false;
        loop {
            tokio::select! {
                result = &mut send_fut => return result.map_err(|_| ChannelClosed),
                () = tokio::time::sleep(self.soft_deadline), if !warned => {
                    warned = true;
                    metrics::counter!("ledger_push_soft_deadline_overruns_total").increment(1);
                    warn!(deadline_secs = self.soft_deadline.as_secs_f64(), "push to consumer channel exceeded soft deadline; still waiting");
                }
            }
        }
    }
}

impl BatchReceiver {
    pub async fn recv(&mut self) -> Option<ProcessedBatch> {
        self.rx.recv().await
    }

    pub fn into_inner(self) -> mpsc::Receiver<ProcessedBatch> {
        self.rx
    }
}
