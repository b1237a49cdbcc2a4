//! The Bi-Temporal EAV Store (component C1, spec.md §4.1).

pub mod engine;
pub mod factory;
pub mod log;
pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use engine::{BiTemporalStore, StoreError};
pub use factory::{build, StoreHandle};
pub use log::{BlockLog, NullBlockLog};
pub use memory::MemoryStore;

#[cfg(feature = "redb")]
pub use log::RedbBlockLog;

#[cfg(feature = "postgres")]
pub use postgres::PgStore;
