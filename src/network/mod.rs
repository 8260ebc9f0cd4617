//! Network layer for tapwire
//!
//! Provides the transport abstraction, request bodies and the hyper client
//! that talks to the real network.

mod body;
mod client;
mod policy;
mod transport;

pub use body::{RequestBody, StreamBody, StreamCapture, TeeBody};
pub use client::HyperTransport;
pub use policy::CacheStoragePolicy;
pub use transport::{
    is_intercepted, CallBody, CallHandle, Challenge, ChallengeDisposition, ForwardCall,
    Intercepted, RedirectDecision, RedirectTarget, ResponseDisposition, ResponseHead, Transport,
    TransportEvent, TrustVerdict,
};

/// Default capacity of a call's event queue
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Default limit on followed redirects per call
pub const DEFAULT_MAX_REDIRECTS: usize = 20;

/// Upper bound for draining a streamed request body at teardown
pub const DRAIN_TIMEOUT_MS: u64 = 5000;
