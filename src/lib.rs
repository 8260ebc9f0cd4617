//! Tapwire - in-process HTTP interception and exchange recording
//!
//! Requests sent through a [`Dispatcher`](intercept::Dispatcher) are
//! forwarded to the network unmodified. Those that pass the host filter are
//! recorded along the way: request snapshot, response metadata, body,
//! outcome and timing.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod error;
pub mod filter;
pub mod intercept;
pub mod network;
pub mod proxy;
pub mod recording;
pub mod registry;

pub use error::{Result, TapwireError, TransportError};
