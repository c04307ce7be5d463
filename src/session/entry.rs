//! The per-peer session entry: one WireGuard relay session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use socket2::Socket;

use super::masking::MaskingHandler;

/// Capacity of the per-peer deferred-send ring, deliberately small:
/// oldest-drop-on-full, since WireGuard retransmits.
pub const PENDING_SEND_CAPACITY: usize = 16;

/// Maximum size of a buffered packet in the pending-send ring (MTU + max padding).
pub const PENDING_SLOT_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeDirection {
    None = 0,
    ClientToServer = 1,
    ServerToClient = 2,
}

impl HandshakeDirection {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => HandshakeDirection::ClientToServer,
            2 => HandshakeDirection::ServerToClient,
            _ => HandshakeDirection::None,
        }
    }
}

struct PendingSlot {
    data: Vec<u8>,
    len: usize,
}

/// Fixed-capacity ring of packets deferred because `server_sock` would have
/// blocked. Oldest-drop-on-full: a new packet that arrives when the ring is
/// full is simply not enqueued.
struct PendingRing {
    slots: Vec<PendingSlot>,
    head: usize,
    tail: usize,
    count: usize,
}

impl PendingRing {
    fn new() -> Self {
        let slots = (0..PENDING_SEND_CAPACITY)
            .map(|_| PendingSlot {
                data: vec![0u8; PENDING_SLOT_SIZE],
                len: 0,
            })
            .collect();
        Self {
            slots,
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    fn push(&mut self, data: &[u8]) -> bool {
        if self.count == PENDING_SEND_CAPACITY || data.len() > PENDING_SLOT_SIZE {
            return false;
        }
        let slot = &mut self.slots[self.head];
        slot.data[..data.len()].copy_from_slice(data);
        slot.len = data.len();
        self.head = (self.head + 1) % PENDING_SEND_CAPACITY;
        self.count += 1;
        true
    }

    fn peek_front(&self) -> Option<&[u8]> {
        if self.count == 0 {
            return None;
        }
        let slot = &self.slots[self.tail];
        Some(&slot.data[..slot.len])
    }

    fn drop_front(&mut self) {
        if self.count > 0 {
            self.tail = (self.tail + 1) % PENDING_SEND_CAPACITY;
            self.count -= 1;
        }
    }
}

/// One end-to-end WireGuard session being relayed.
///
/// Scalar fields touched from both the client-side and server-side worker
/// (handshake bookkeeping, version, activity timestamp) are atomics rather
/// than behind a lock: each field transitions independently and a benign
/// race between the two workers (e.g. both bumping `last_activity_time`)
/// cannot corrupt state, only pick one of two valid recent values.
pub struct PeerEntry {
    pub client_addr: SocketAddr,
    pub forward_addr: SocketAddr,
    pub server_sock: Socket,

    handshaked: AtomicBool,
    handshake_direction: AtomicU8,
    client_obfuscated: AtomicBool,
    server_obfuscated: AtomicBool,
    version: AtomicU8,

    last_handshake_request_time: AtomicU64,
    last_handshake_time: AtomicU64,
    last_activity_time: AtomicU64,

    masking_handler: OnceLock<Arc<dyn MaskingHandler>>,
    pending_sends: Mutex<PendingRing>,
}

impl PeerEntry {
    pub fn new(
        client_addr: SocketAddr,
        forward_addr: SocketAddr,
        server_sock: Socket,
        initial_version: u8,
        now_ms: u64,
    ) -> Self {
        Self {
            client_addr,
            forward_addr,
            server_sock,
            handshaked: AtomicBool::new(false),
            handshake_direction: AtomicU8::new(HandshakeDirection::None as u8),
            client_obfuscated: AtomicBool::new(false),
            server_obfuscated: AtomicBool::new(false),
            version: AtomicU8::new(initial_version),
            last_handshake_request_time: AtomicU64::new(0),
            last_handshake_time: AtomicU64::new(0),
            last_activity_time: AtomicU64::new(now_ms),
            masking_handler: OnceLock::new(),
            pending_sends: Mutex::new(PendingRing::new()),
        }
    }

    pub fn handshaked(&self) -> bool {
        self.handshaked.load(Ordering::Acquire)
    }

    pub fn set_handshaked(&self, v: bool) {
        self.handshaked.store(v, Ordering::Release);
    }

    pub fn handshake_direction(&self) -> HandshakeDirection {
        HandshakeDirection::from_u8(self.handshake_direction.load(Ordering::Acquire))
    }

    pub fn set_handshake_direction(&self, dir: HandshakeDirection) {
        self.handshake_direction.store(dir as u8, Ordering::Release);
    }

    pub fn client_obfuscated(&self) -> bool {
        self.client_obfuscated.load(Ordering::Acquire)
    }

    pub fn server_obfuscated(&self) -> bool {
        self.server_obfuscated.load(Ordering::Acquire)
    }

    pub fn set_obfuscation_sides(&self, client_obfuscated: bool, server_obfuscated: bool) {
        self.client_obfuscated.store(client_obfuscated, Ordering::Release);
        self.server_obfuscated.store(server_obfuscated, Ordering::Release);
    }

    pub fn version(&self) -> u8 {
        self.version.load(Ordering::Acquire)
    }

    /// Versions only ever decrease for the life of the entry.
    pub fn downgrade_version(&self, observed: u8) {
        let mut current = self.version.load(Ordering::Acquire);
        while observed < current {
            match self.version.compare_exchange_weak(
                current,
                observed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn last_handshake_request_time(&self) -> u64 {
        self.last_handshake_request_time.load(Ordering::Acquire)
    }

    pub fn stamp_handshake_request(&self, now_ms: u64) {
        self.last_handshake_request_time.store(now_ms, Ordering::Release);
    }

    pub fn stamp_handshake_complete(&self, now_ms: u64) {
        self.last_handshake_time.store(now_ms, Ordering::Release);
    }

    pub fn last_activity_time(&self) -> u64 {
        self.last_activity_time.load(Ordering::Acquire)
    }

    pub fn stamp_activity(&self, now_ms: u64) {
        self.last_activity_time.store(now_ms, Ordering::Release);
    }

    pub fn is_idle(&self, now_ms: u64, idle_timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_activity_time()) > idle_timeout_ms
    }

    /// Pins the masking handler for this session on first traffic. A later
    /// call is a no-op: only the first writer wins.
    pub fn set_masking_handler_once(&self, handler: Arc<dyn MaskingHandler>) {
        let _ = self.masking_handler.set(handler);
    }

    pub fn masking_handler(&self) -> Option<&dyn MaskingHandler> {
        self.masking_handler.get().map(|b| b.as_ref())
    }

    /// Drains deferred sends in FIFO order, stopping at the first
    /// would-block (the item stays queued for the next attempt). Returns
    /// the number of packets successfully flushed.
    pub fn drain_pending_sends(&self) -> usize {
        let mut ring = self.pending_sends.lock().unwrap();
        let mut flushed = 0;
        loop {
            let Some(data) = ring.peek_front().map(|d| d.to_vec()) else {
                break;
            };
            match self.server_sock.send(&data) {
                Ok(_) => {
                    ring.drop_front();
                    flushed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    ring.drop_front();
                }
            }
        }
        flushed
    }

    /// Enqueues `data` for later retry; drops it if the ring is full.
    pub fn enqueue_pending(&self, data: &[u8]) -> bool {
        self.pending_sends.lock().unwrap().push(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_socket() -> Socket {
        let sock = Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .unwrap();
        sock.set_nonblocking(true).unwrap();
        sock.bind(&"127.0.0.1:0".parse::<SocketAddr>().unwrap().into())
            .unwrap();
        sock
    }

    #[test]
    fn version_only_decreases() {
        let entry = PeerEntry::new(
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
            test_socket(),
            1,
            0,
        );
        entry.downgrade_version(0);
        assert_eq!(entry.version(), 0);
        entry.downgrade_version(1); // attempt to raise, must be ignored
        assert_eq!(entry.version(), 0);
    }

    #[test]
    fn idle_detection_uses_configured_timeout() {
        let entry = PeerEntry::new(
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
            test_socket(),
            1,
            0,
        );
        entry.stamp_activity(1_000);
        assert!(!entry.is_idle(1_500, 1_000));
        assert!(entry.is_idle(3_000, 1_000));
    }

    #[test]
    fn masking_handler_pins_on_first_write_only() {
        let entry = PeerEntry::new(
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
            test_socket(),
            1,
            0,
        );
        assert!(entry.masking_handler().is_none());
        entry.set_masking_handler_once(std::sync::Arc::new(super::super::masking::NoopMaskingHandler));
        assert!(entry.masking_handler().is_some());
    }

    #[test]
    fn pending_ring_drops_oldest_policy_is_drop_new_when_full() {
        let entry = PeerEntry::new(
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
            test_socket(),
            1,
            0,
        );
        for i in 0..PENDING_SEND_CAPACITY {
            assert!(entry.enqueue_pending(&[i as u8]));
        }
        assert!(!entry.enqueue_pending(&[255]), "ring should be full");
    }
}
