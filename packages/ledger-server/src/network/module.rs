//! Network module with deferred startup lifecycle.
//!
//! Implements the deferred startup pattern: `new()` creates resources,
//! `start()` binds the TCP listener, and `serve()` starts accepting
//! connections. This separation allows the rest of the application to
//! wire the write queue, store, and receipt registry between `start()`
//! and `serve()`.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    clean_handler, count_handler, create_handler, get_handler, health_handler, query_handler,
    receipt_handler, update_handler, AppState,
};
use super::handlers::health::{liveness_handler, readiness_handler};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::queue::WriteQueue;
use crate::receipt::ReceiptRegistry;
use crate::store::BiTemporalStore;

/// Manages the full HTTP server lifecycle for the entity ingress (C6).
///
/// Follows the deferred startup pattern:
/// 1. `new()` -- allocates the shutdown controller
/// 2. `start()` -- binds TCP listener to the configured address
/// 3. `serve()` -- begins accepting connections until shutdown is signalled
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
    queue: Arc<WriteQueue>,
    store: Arc<dyn BiTemporalStore>,
    receipts: Arc<ReceiptRegistry>,
}

impl NetworkModule {
    #[must_use]
    pub fn new(config: NetworkConfig, queue: Arc<WriteQueue>, store: Arc<dyn BiTemporalStore>, receipts: Arc<ReceiptRegistry>) -> Self {
        Self {
            config,
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
            queue,
            store,
            receipts,
        }
    }

    /// Returns a shared reference to the shutdown controller.
    ///
    /// Other modules use this to check health state or trigger shutdown.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    fn app_state(&self) -> AppState {
        AppState {
            queue: Arc::clone(&self.queue),
            store: Arc::clone(&self.store),
            receipts: Arc::clone(&self.receipts),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::new(self.config.clone()),
            start_time: Instant::now(),
        }
    }

    fn routes(state: AppState) -> Router<AppState> {
        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/entities", post(create_handler))
            .route("/entities/update/{key}", post(update_handler))
            .route("/entities/query", post(query_handler))
            .route("/entities/count", get(count_handler))
            .route("/entities/clean", delete(clean_handler))
            .route("/entities/{key}", get(get_handler))
            .route("/receipt/{id}", get(receipt_handler))
            .layer(middleware::from_fn(metrics_layer))
            .layer(middleware::from_fn_with_state(state, drain_tracking_layer))
    }

    /// Assembles the axum router with all routes and middleware
    /// (spec.md §6.2).
    #[must_use]
    pub fn build_router(&self) -> Router {
        let state = self.app_state();
        Self::routes(state.clone()).layer(build_http_layers(&self.config)).with_state(state)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Starts serving connections until the shutdown signal fires.
    ///
    /// Consumes `self` because the listener is moved into the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server encounters a fatal I/O error.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let shutdown_ctrl = Arc::clone(&self.shutdown);
        let config = self.config.clone();
        let state = self.app_state();
        let listener = self.listener.expect("start() must be called before serve()");

        let router = Self::routes(state.clone()).layer(build_http_layers(&config)).with_state(state);

        shutdown_ctrl.set_ready();

        if let Some(ref tls_config) = config.tls {
            serve_tls(listener, router, tls_config, shutdown_ctrl, shutdown).await
        } else {
            serve_plain(listener, router, shutdown_ctrl, shutdown).await
        }
    }
}

/// Serves plain HTTP connections using axum's built-in server.
async fn serve_plain(
    listener: TcpListener,
    router: Router,
    shutdown_ctrl: Arc<ShutdownController>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("serving plain HTTP connections");

    axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;

    drain(shutdown_ctrl).await;
    Ok(())
}

/// Serves TLS connections using `axum-server` with rustls.
///
/// Reuses the pre-bound TCP listener by converting it to a `std::net::TcpListener`.
async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls_config: &super::config::TlsConfig,
    shutdown_ctrl: Arc<ShutdownController>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls_config = RustlsConfig::from_pem_file(&tls_config.cert_path, &tls_config.key_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load TLS certificates: {e}"))?;

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        shutdown.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!("serving TLS connections on {}", addr);

    axum_server::from_tcp_rustls(std_listener, rustls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;

    drain(shutdown_ctrl).await;
    Ok(())
}

/// Holds an [`crate::network::shutdown::InFlightGuard`] for the duration of
/// every request, so `drain()`'s `wait_for_drain()` actually has something
/// to wait for instead of seeing zero in-flight requests immediately.
async fn drain_tracking_layer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let _guard = state.shutdown.in_flight_guard();
    next.run(request).await
}

/// Records per-route request counts and latency for the entity ingress.
///
/// Independent of the block-production metrics in [`crate::processor`];
/// this one measures HTTP traffic rather than block-ingestion throughput.
async fn metrics_layer(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
    let status = response.status().as_u16().to_string();
    metrics::counter!("ledger_http_requests_total", "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    metrics::histogram!("ledger_http_request_duration_ms", "method" => method, "path" => path).record(duration_ms);

    response
}

/// Transitions to Draining, then Stopped once in-flight requests finish
/// (up to 30 seconds).
async fn drain(shutdown_ctrl: Arc<ShutdownController>) {
    shutdown_ctrl.trigger_shutdown();

    let drained = shutdown_ctrl.wait_for_drain(Duration::from_secs(30)).await;
    if drained {
        info!("all in-flight requests drained successfully");
    } else {
        warn!("drain timeout expired with in-flight requests remaining");
    }
}
