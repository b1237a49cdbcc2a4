//! HTTP handler definitions for the bi-temporal EAV ingestion server.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports all handler functions for convenient access
//! when building the router.

pub mod entities;
pub mod health;

pub use entities::{
    clean_handler, count_handler, create_handler, get_handler, query_handler, receipt_handler, update_handler,
};
pub use health::health_handler;

use std::sync::Arc;
use std::time::Instant;

use super::{NetworkConfig, ShutdownController};
use crate::queue::WriteQueue;
use crate::receipt::ReceiptRegistry;
use crate::store::BiTemporalStore;

/// Shared application state passed to all axum handlers via `State`
/// extraction. Cheap to clone: everything behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Write Queue (C3): where `POST /entities` and `POST
    /// /entities/update/{key}` enqueue their requests.
    pub queue: Arc<WriteQueue>,
    /// Bi-Temporal Store (C1): where reads are served from.
    pub store: Arc<dyn BiTemporalStore>,
    /// Committed-write receipts, polled via `GET /receipt/{id}`.
    pub receipts: Arc<ReceiptRegistry>,
    /// Graceful shutdown controller with health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Network configuration (bind address, TLS, request timeout).
    pub config: Arc<NetworkConfig>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}
