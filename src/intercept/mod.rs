//! Interception of outgoing exchanges
//!
//! The [`Dispatcher`] decides which requests to intercept. Each intercepted
//! request gets an [`Interceptor`] that forwards it, relays every event to
//! the caller through an [`ExchangeClient`] and keeps a
//! [`RequestRecord`](crate::recording::RequestRecord) of the exchange.

mod client;
mod dispatch;
mod interceptor;

pub use client::{EventRelay, ExchangeClient};
pub use dispatch::Dispatcher;
pub use interceptor::{Interceptor, Phase};

/// How long teardown waits for an exchange's driver after cancelling the
/// forwarding call
pub const SETTLE_TIMEOUT_MS: u64 = 200;
