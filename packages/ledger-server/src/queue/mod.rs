//! Write Queue (component C3, spec.md §4.3).

pub mod types;
pub mod write_queue;

pub use types::{EnqueueRequest, OperationId, PendingEntity, PendingKind};
pub use write_queue::{renumber, Drained, EnqueueError, WriteQueue};
