//! `replicate <source> <target> [num_blocks]`: copies every entity created
//! in the source store's first `num_blocks` blocks into the target store
//! under freshly generated keys, preserving each entity's remaining
//! time-to-live.
//!
//! Runs entirely in-process: it calls the target's
//! [`OperationBatchConsumer`] directly rather than going through a write
//! queue and block processor, so there is no HTTP ingress and no caller to
//! wait on. Only entities that were ever *created* are copied -- later
//! updates to their attributes are not replayed, since the target receives
//! them as brand-new creates.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use ledger_core::{
    synthetic, tx_op_index, Block, BlockBatch, EntityKey, IncludeMask, Operation, OperationPayload,
    Predicate, QueryExpr, QueryOptions, StringOrNumeric, DEFAULT_OPS_PER_TX, INF,
};
use ledger_server::config::StorageBackend;
use ledger_server::processor::ProcessedBatch;
use ledger_server::receipt::ReceiptRegistry;
use ledger_server::store::{self, BiTemporalStore};
use ledger_server::OperationBatchConsumer;
use tracing_subscriber::EnvFilter;

const SCAN_PAGE_SIZE: usize = 1000;

/// Copies entities between two bi-temporal stores under fresh keys.
#[derive(Debug, Parser)]
#[command(name = "replicate", about = "Copy entities from one store into another under fresh keys")]
struct Args {
    /// Source store, e.g. `memory`, `redb:path/to/source.redb`, or
    /// `postgres:postgres://...`.
    source: String,

    /// Target store, using the same syntax as `source`.
    target: String,

    /// Number of leading source blocks to scan. Defaults to the source's
    /// last committed block (i.e. its whole history).
    num_blocks: Option<u64>,
}

/// Parses the `kind[:rest]` backend syntax shared by `source` and `target`.
fn parse_backend(spec: &str) -> Result<StorageBackend> {
    let (kind, rest) = spec.split_once(':').unwrap_or((spec, ""));
    match kind {
        "memory" => Ok(StorageBackend::Memory),
        "redb" => {
            if rest.is_empty() {
                bail!("redb backend requires a path, e.g. redb:ledger.redb");
            }
            Ok(StorageBackend::Redb { path: PathBuf::from(rest) })
        }
        "postgres" => {
            if rest.is_empty() {
                bail!("postgres backend requires a connection url, e.g. postgres:postgres://...");
            }
            Ok(StorageBackend::Postgres { url: spec[kind.len() + 1..].to_string() })
        }
        other => bail!("unrecognized backend kind '{other}' (expected memory, redb, or postgres)"),
    }
}

/// Converts one query result back into creation inputs, generating a fresh
/// plaintext key and carrying over content, owner, and attributes.
///
/// The new entity's `btl` preserves the original's remaining lifetime at
/// the block it was scanned from, so a near-expiry source entity does not
/// become immortal on the target.
fn build_create_payload(entity: ledger_core::EntityData, scanned_at_block: u64) -> OperationPayload {
    let fresh_key = format!("replicated-{}", uuid::Uuid::new_v4());

    let mut string_attributes = std::collections::BTreeMap::new();
    let mut numeric_attributes = std::collections::BTreeMap::new();
    string_attributes.insert(synthetic::KEY.to_string(), fresh_key);
    for (key, value) in entity.attributes {
        match value {
            StringOrNumeric::String(s) => {
                string_attributes.insert(key, s);
            }
            StringOrNumeric::Numeric(n) => {
                numeric_attributes.insert(key, n);
            }
        }
    }

    let expiration = entity.expiration.unwrap_or(INF);
    let btl = expiration.saturating_sub(scanned_at_block);

    OperationPayload {
        key: EntityKey::hash(string_attributes.get(synthetic::KEY).expect("just inserted")),
        content_type: entity.content_type.unwrap_or_default(),
        btl,
        owner: entity.owner.unwrap_or_else(|| ledger_core::OwnerAddress::from_bytes([0u8; 20])),
        content: entity.payload.unwrap_or_default(),
        string_attributes,
        numeric_attributes,
    }
}

/// Pages through every entity whose `$createdAtBlock` is `source_block`,
/// as seen from that block's own snapshot.
async fn entities_created_at(store: &dyn BiTemporalStore, source_block: u64) -> Result<Vec<ledger_core::EntityData>> {
    let expr = QueryExpr::new(vec![Predicate::NumericEq {
        key: synthetic::CREATED_AT_BLOCK.to_string(),
        value: source_block,
    }]);

    let mut found = Vec::new();
    let mut offset = 0;
    loop {
        let options = QueryOptions {
            at_block: Some(source_block),
            results_per_page: SCAN_PAGE_SIZE,
            offset,
            include: IncludeMask::all(),
        };
        let page = store.query_entities(&expr, &options).await.context("scanning source block")?;
        let page_len = page.len();
        found.extend(page);
        if page_len < SCAN_PAGE_SIZE {
            break;
        }
        offset += SCAN_PAGE_SIZE;
    }
    Ok(found)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let source_backend = parse_backend(&args.source)?;
    let target_backend = parse_backend(&args.target)?;

    let source = store::build(&source_backend, DEFAULT_OPS_PER_TX).await.context("opening source store")?;
    let target = store::build(&target_backend, DEFAULT_OPS_PER_TX).await.context("opening target store")?;
    let consumer = OperationBatchConsumer::new(
        std::sync::Arc::clone(&target.store),
        std::sync::Arc::clone(&target.log),
        std::sync::Arc::new(ReceiptRegistry::new()),
    );

    let source_last_block = source.store.get_last_block().await;
    let scan_through = args.num_blocks.unwrap_or(source_last_block).min(source_last_block);

    let mut next_target_block = target.store.get_last_block().await + 1;
    let mut entities_copied = 0u64;
    let mut blocks_written = 0u64;

    for source_block in 1..=scan_through {
        let entities = entities_created_at(source.store.as_ref(), source_block).await?;
        if entities.is_empty() {
            continue;
        }

        let operations: Vec<Operation> = entities
            .into_iter()
            .enumerate()
            .map(|(position, entity)| {
                let (tx_index, op_index) = tx_op_index(position as u64, DEFAULT_OPS_PER_TX);
                Operation::create(tx_index, op_index, build_create_payload(entity, source_block))
            })
            .collect();

        let count = operations.len() as u64;
        let batch = BlockBatch::single(Block::new(next_target_block, operations));
        consumer
            .apply(&ProcessedBatch { batch, receipts: vec![] })
            .await
            .with_context(|| format!("applying replicated block {next_target_block}"))?;

        entities_copied += count;
        blocks_written += 1;
        next_target_block += 1;
    }

    tracing::info!(
        scanned_blocks = scan_through,
        blocks_written,
        entities_copied,
        "replication complete"
    );
    Ok(())
}
