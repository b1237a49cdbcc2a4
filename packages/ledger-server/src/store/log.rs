//! Write-ahead durability for [`super::MemoryStore`] (spec.md §6.4: "a
//! committed block... MUST be visible after restart").
//!
//! The in-memory store alone satisfies the logical contract of C1 but not
//! its durability clause. A [`BlockLog`] is an append-only record of every
//! committed [`BlockBatch`], replayed into a fresh [`super::MemoryStore`] on
//! startup.

use anyhow::Result;
use async_trait::async_trait;
use ledger_core::BlockBatch;

/// Append-only log of committed batches, used to rebuild in-memory state on
/// restart.
#[async_trait]
pub trait BlockLog: Send + Sync {
    /// Appends a successfully applied batch. Called after, not instead of,
    /// `MemoryStore::apply_block`.
    async fn append(&self, batch: &BlockBatch) -> Result<()>;

    /// Returns every previously appended batch, in commit order.
    async fn replay(&self) -> Result<Vec<BlockBatch>>;
}

/// No-op log for tests and ephemeral (`--storage memory`, no path) runs.
#[derive(Debug, Default)]
pub struct NullBlockLog;

#[async_trait]
impl BlockLog for NullBlockLog {
    async fn append(&self, _batch: &BlockBatch) -> Result<()> {
        Ok(())
    }

    async fn replay(&self) -> Result<Vec<BlockBatch>> {
        Ok(Vec::new())
    }
}

#[cfg(feature = "redb")]
pub use redb_log::RedbBlockLog;

#[cfg(feature = "redb")]
mod redb_log {
    use std::path::Path;
    use std::sync::Arc;

    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use ledger_core::BlockBatch;
    use redb::{Database, ReadableTable, TableDefinition};

    use super::BlockLog;

    const BATCHES: TableDefinition<u64, &[u8]> = TableDefinition::new("batches");

    /// `redb`-backed append-only log, keyed by the first block number of
    /// each appended batch.
    pub struct RedbBlockLog {
        db: Arc<Database>,
    }

    impl RedbBlockLog {
        pub fn open(path: &Path) -> Result<Self> {
            let db = Database::create(path).with_context(|| format!("opening redb log at {}", path.display()))?;
            {
                let txn = db.begin_write()?;
                txn.open_table(BATCHES)?;
                txn.commit()?;
            }
            Ok(Self { db: Arc::new(db) })
        }
    }

    #[async_trait]
    impl BlockLog for RedbBlockLog {
        async fn append(&self, batch: &BlockBatch) -> Result<()> {
            let db = Arc::clone(&self.db);
            let encoded = serde_json::to_vec(batch)?;
            let key = batch.first_block_number().unwrap_or(0);
            tokio::task::spawn_blocking(move || -> Result<()> {
                let txn = db.begin_write()?;
                {
                    let mut table = txn.open_table(BATCHES)?;
                    table.insert(key, encoded.as_slice())?;
                }
                txn.commit()?;
                Ok(())
            })
            .await??;
            Ok(())
        }

        async fn replay(&self) -> Result<Vec<BlockBatch>> {
            let db = Arc::clone(&self.db);
            tokio::task::spawn_blocking(move || -> Result<Vec<BlockBatch>> {
                let txn = db.begin_read()?;
                let table = txn.open_table(BATCHES)?;
                let mut batches = Vec::new();
                for entry in table.iter()? {
                    let (_, value) = entry?;
                    let batch: BlockBatch = serde_json::from_slice(value.value())?;
                    batches.push(batch);
                }
                Ok(batches)
            })
            .await?
        }
    }

}
