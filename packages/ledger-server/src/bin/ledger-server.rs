//! Entry point: wires the write queue, block processor, batch consumer,
//! bi-temporal store, and HTTP ingress together and runs them to
//! completion or shutdown signal.

use std::sync::Arc;

use clap::Parser;
use ledger_server::config::Cli;
use ledger_server::network::NetworkModule;
use ledger_server::processor::bounded;
use ledger_server::queue::WriteQueue;
use ledger_server::receipt::ReceiptRegistry;
use ledger_server::{store, BlockProcessor, OperationBatchConsumer};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    if let Some(addr) = std::env::var("LEDGER_METRICS_ADDR").ok().and_then(|s| s.parse::<std::net::SocketAddr>().ok()) {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| anyhow::anyhow!("failed to install prometheus exporter: {e}"))?;
    }

    let config = Cli::parse().into_config();
    tracing::info!(node_id = %config.node_id, "starting ledger-server");

    let handle = store::build(&config.storage, config.ops_per_tx).await?;
    let queue = Arc::new(WriteQueue::new(handle.store.get_last_block().await + 1, config.ops_per_tx));
    let receipts = Arc::new(ReceiptRegistry::new());

    let (sender, receiver) = bounded(config.channel_capacity, config.push_soft_deadline);

    let cancel = CancellationToken::new();
    let processor = Arc::new(BlockProcessor::new(Arc::clone(&queue), Arc::clone(&handle.store), sender, config.block_cadence));
    let processor_handle = tokio::spawn(Arc::clone(&processor).run(cancel.clone()));

    let consumer = Arc::new(OperationBatchConsumer::new(Arc::clone(&handle.store), Arc::clone(&handle.log), Arc::clone(&receipts)));
    let consumer_handle = tokio::spawn({
        let consumer = Arc::clone(&consumer);
        async move { consumer.follow_events(receiver.into_inner()).await }
    });

    let mut network = NetworkModule::new(config.http, queue, Arc::clone(&handle.store), receipts);
    let port = network.start().await?;
    tracing::info!(port, "HTTP ingress listening");

    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };

    tokio::pin!(consumer_handle);
    tokio::select! {
        result = network.serve(shutdown_signal) => {
            result?;
            // Graceful path: stop the ticker, drop our sender handle so the
            // channel closes, then let the consumer drain whatever it was
            // already holding before it sees the close.
            cancel.cancel();
            let _ = processor_handle.await;
            drop(processor);
            if let Ok(Err(e)) = (&mut consumer_handle).await {
                tracing::error!(error = %e, "batch consumer terminated; store is read-only until restart");
            }
        }
        result = &mut consumer_handle => {
            // The consumer hit a fatal store error on its own; the store is
            // read-only until restart, so there is nothing left to drain.
            if let Ok(Err(e)) = result {
                tracing::error!(error = %e, "batch consumer terminated; store is read-only until restart");
            }
            processor_handle.abort();
        }
    }

    Ok(())
}
