//! Picks and wires a [`BiTemporalStore`] + [`BlockLog`] pair from a
//! [`crate::config::StorageBackend`] selection.

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::config::StorageBackend;

use super::engine::BiTemporalStore;
use super::log::{BlockLog, NullBlockLog};
use super::memory::MemoryStore;

/// A store ready to serve traffic, paired with the log it replayed from
/// (if any) so the caller can keep appending to it after startup.
pub struct StoreHandle {
    pub store: Arc<dyn BiTemporalStore>,
    pub log: Arc<dyn BlockLog>,
}

/// Builds the configured backend, replaying any durable log into a fresh
/// in-memory store before returning.
pub async fn build(backend: &StorageBackend, ops_per_tx: u64) -> Result<StoreHandle> {
    match backend {
        StorageBackend::Memory => Ok(StoreHandle {
            store: Arc::new(MemoryStore::new(ops_per_tx)),
            log: Arc::new(NullBlockLog),
        }),

        #[cfg(feature = "redb")]
        StorageBackend::Redb { path } => {
            let log = Arc::new(super::log::RedbBlockLog::open(path).context("opening redb log")?);
            let store = Arc::new(MemoryStore::new(ops_per_tx));
            for batch in log.replay().await.context("replaying redb log")? {
                store.apply_block(&batch).await.context("replaying batch into memory store")?;
            }
            Ok(StoreHandle { store, log })
        }
        #[cfg(not(feature = "redb"))]
        StorageBackend::Redb { .. } => {
            bail!("redb support not compiled in; rebuild with --features redb")
        }

        #[cfg(feature = "postgres")]
        StorageBackend::Postgres { url } => {
            let store = Arc::new(super::postgres::PgStore::connect(url, ops_per_tx).await.context("connecting to postgres")?);
            Ok(StoreHandle { store, log: Arc::new(NullBlockLog) })
        }
        #[cfg(not(feature = "postgres"))]
        StorageBackend::Postgres { .. } => {
            bail!("postgres support not compiled in; rebuild with --features postgres")
        }
    }
}
