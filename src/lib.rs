//! A bidirectional UDP relay that obfuscates WireGuard traffic in flight.
//!
//! See [`obfuscation`] for the wire codec, [`session`] for the per-peer
//! state machine, and [`pipeline`] for the ingress/worker plumbing that
//! ties them together.

pub mod config;
pub mod error;
pub mod obfuscation;
pub mod pipeline;
pub mod relay;
pub mod session;

pub use error::Error;
pub use relay::Relay;
