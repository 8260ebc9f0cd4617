//! Forward-proxy front end
//!
//! Accepts plain HTTP proxy requests and sends them through a
//! [`Transport`](crate::network::Transport), normally a
//! [`Dispatcher`](crate::intercept::Dispatcher).

mod connection_pool;
mod http;
mod server;

pub use connection_pool::{ConnectionGuard, ConnectionPool};
pub use http::{HttpProxy, ProxyBody};
pub use server::ProxyServer;

/// Maximum number of concurrent connections
pub const MAX_CONNECTIONS: usize = 4096;

/// Graceful shutdown timeout
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;
