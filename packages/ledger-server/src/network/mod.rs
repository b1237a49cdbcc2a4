//! HTTP ingress (component C6, spec.md §2, §6.2): configuration, router,
//! middleware, and graceful shutdown control.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::*;
pub use handlers::AppState;
pub use module::NetworkModule;
pub use shutdown::*;
