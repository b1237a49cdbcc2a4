//! Server configuration (ambient stack).
//!
//! `ServerConfig` and its `Default` are the in-scope contract; `clap` is
//! just the binary's way of populating it from flags and environment
//! variables (CLI ergonomics are explicitly out of scope, spec.md §1).

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use ledger_core::DEFAULT_OPS_PER_TX;

use crate::network::NetworkConfig;

/// Storage backend selection (spec.md §6.4: "the implementation is free to
/// choose engines" so long as durability holds).
#[derive(Debug, Clone)]
pub enum StorageBackend {
    /// No durability. Lost on restart; used for tests and `replicate`'s
    /// in-process target store.
    Memory,
    /// Default: in-memory store paired with a `redb` write-ahead log.
    Redb { path: PathBuf },
    /// The reference relational schema sketched in spec.md §4.1.
    Postgres { url: String },
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::Redb { path: PathBuf::from("ledger.redb") }
    }
}

/// Runtime configuration for the whole pipeline: write queue, block
/// processor, store, and HTTP ingress.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Identifies this node in logs; not used for consensus (there is none).
    pub node_id: String,
    /// Block processor tick cadence (spec.md §4.4 default: 2 seconds).
    pub block_cadence: Duration,
    /// Op-indices per transaction (spec.md §4.3 default: 10).
    pub ops_per_tx: u64,
    /// Bounded push-channel capacity between the processor and consumer.
    pub channel_capacity: usize,
    /// Soft deadline before a full push channel logs a warning (spec.md
    /// §4.4 default: 5 seconds). Never a hard cancellation.
    pub push_soft_deadline: Duration,
    /// HTTP ingress bind address and middleware configuration.
    pub http: NetworkConfig,
    /// Storage backend selection.
    pub storage: StorageBackend,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: "ledger-node".to_string(),
            block_cadence: Duration::from_secs(2),
            ops_per_tx: DEFAULT_OPS_PER_TX,
            channel_capacity: 16,
            push_soft_deadline: Duration::from_secs(5),
            http: NetworkConfig::default(),
            storage: StorageBackend::default(),
        }
    }
}

/// Command-line flags for the `ledger-server` binary.
///
/// A thin `clap` skin over [`ServerConfig`] -- parsing ergonomics live here
/// so the config type itself stays free of CLI concerns.
#[derive(Debug, Parser)]
#[command(name = "ledger-server", about = "Bi-temporal EAV block-ingestion server")]
pub struct Cli {
    #[arg(long, env = "LEDGER_NODE_ID", default_value = "ledger-node")]
    pub node_id: String,

    #[arg(long, env = "LEDGER_BLOCK_CADENCE_MS", default_value_t = 2000)]
    pub block_cadence_ms: u64,

    #[arg(long, env = "LEDGER_OPS_PER_TX", default_value_t = DEFAULT_OPS_PER_TX)]
    pub ops_per_tx: u64,

    #[arg(long, env = "LEDGER_CHANNEL_CAPACITY", default_value_t = 16)]
    pub channel_capacity: usize,

    #[arg(long, env = "LEDGER_PUSH_SOFT_DEADLINE_MS", default_value_t = 5000)]
    pub push_soft_deadline_ms: u64,

    #[arg(long, env = "LEDGER_HTTP_HOST", default_value = "0.0.0.0")]
    pub http_host: String,

    #[arg(long, env = "LEDGER_HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    #[arg(long, env = "LEDGER_STORAGE", value_enum, default_value_t = StorageKind::Redb)]
    pub storage: StorageKind,

    #[arg(long, env = "LEDGER_REDB_PATH", default_value = "ledger.redb")]
    pub redb_path: PathBuf,

    #[arg(long, env = "LEDGER_POSTGRES_URL")]
    pub postgres_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageKind {
    Memory,
    Redb,
    Postgres,
}

impl Cli {
    /// Converts parsed flags into the in-scope [`ServerConfig`] contract.
    ///
    /// # Panics
    ///
    /// Panics if `--storage postgres` is selected without
    /// `--postgres-url`/`LEDGER_POSTGRES_URL` set -- a misconfiguration,
    /// not a runtime condition.
    #[must_use]
    pub fn into_config(self) -> ServerConfig {
        let storage = match self.storage {
            StorageKind::Memory => StorageBackend::Memory,
            StorageKind::Redb => StorageBackend::Redb { path: self.redb_path },
            StorageKind::Postgres => StorageBackend::Postgres {
                url: self.postgres_url.expect("--postgres-url is required when --storage postgres is selected"),
            },
        };

        ServerConfig {
            node_id: self.node_id,
            block_cadence: Duration::from_millis(self.block_cadence_ms),
            ops_per_tx: self.ops_per_tx,
            channel_capacity: self.channel_capacity,
            push_soft_deadline: Duration::from_millis(self.push_soft_deadline_ms),
            http: NetworkConfig {
                host: self.http_host,
                port: self.http_port,
                ..NetworkConfig::default()
            },
            storage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_defaults_match_spec() {
        let config = ServerConfig::default();
        assert_eq!(config.block_cadence, Duration::from_secs(2));
        assert_eq!(config.ops_per_tx, 10);
        assert_eq!(config.push_soft_deadline, Duration::from_secs(5));
    }

    #[test]
    fn cli_parses_minimal_args() {
        let cli = Cli::parse_from(["ledger-server"]);
        assert_eq!(cli.node_id, "ledger-node");
        assert_eq!(cli.block_cadence_ms, 2000);
        assert_eq!(cli.storage, StorageKind::Redb);
    }

    #[test]
    fn cli_into_config_builds_redb_backend() {
        let cli = Cli::parse_from(["ledger-server", "--storage", "memory"]);
        let config = cli.into_config();
        assert!(matches!(config.storage, StorageBackend::Memory));
    }
}
