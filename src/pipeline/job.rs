//! The unit of work passed from ingress to a worker.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::session::PeerEntry;

/// MTU + worst-case padding.
pub const QUEUE_BUFFER_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    FromClient,
    FromServer,
}

/// A fixed-size buffer plus the bookkeeping a worker needs to process it.
/// Lives inside a `PacketQueue` slot and is reused across cycles rather
/// than reallocated per packet.
pub struct PacketJob {
    pub buffer: [u8; QUEUE_BUFFER_SIZE],
    pub len: usize,
    pub addr: SocketAddr,
    pub direction: Direction,
    /// Set only for server-side arrivals, where ingress already knows
    /// which peer's upstream socket produced the datagram.
    pub peer: Option<Arc<PeerEntry>>,
    pub timestamp_ms: u64,
}

impl PacketJob {
    pub fn empty() -> Self {
        Self {
            buffer: [0u8; QUEUE_BUFFER_SIZE],
            len: 0,
            addr: "0.0.0.0:0".parse().unwrap(),
            direction: Direction::FromClient,
            peer: None,
            timestamp_ms: 0,
        }
    }
}
