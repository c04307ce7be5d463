//! The session table: maps a client address to its peer entry.
//!
//! Invariants: exactly one entry per distinct `client_addr`;
//! entries are created only by the client-side worker, only on an
//! Initiation from a previously-unseen source; `server_sock`'s lifetime
//! equals the entry's lifetime.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use super::entry::PeerEntry;
use super::masking::MaskingHandler;
use crate::obfuscation::OBFUSCATION_VERSION;

/// Bound on how many entries a single `reap` call inspects, so eviction
/// cost per call stays fixed regardless of how many peers are live.
const REAP_SCAN_SIZE: usize = 64;

pub struct SessionTable {
    entries: RwLock<HashMap<SocketAddr, Arc<PeerEntry>>>,
    /// FIFO of live addresses, used as a round-robin cursor for `reap`:
    /// each call pops a bounded slice off the front, and every address
    /// still live and not idle goes back on the end for its next turn.
    reap_queue: Mutex<VecDeque<SocketAddr>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            reap_queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<PeerEntry>> {
        self.entries.read().unwrap().get(addr).cloned()
    }

    /// Snapshot of all live entries, for the ingress thread to poll their
    /// upstream sockets.
    pub fn snapshot(&self) -> Vec<Arc<PeerEntry>> {
        self.entries.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Creates a new entry for `client_addr` if one doesn't already exist.
    /// Only the client-side worker calls this, on an Initiation. `handler`
    /// is the relay's configured masking scheme, pinned onto the entry
    /// immediately (chosen on first traffic).
    pub fn get_or_create(
        &self,
        client_addr: SocketAddr,
        forward_addr: SocketAddr,
        handler: Arc<dyn MaskingHandler>,
        now_ms: u64,
    ) -> std::io::Result<Arc<PeerEntry>> {
        if let Some(existing) = self.get(&client_addr) {
            return Ok(existing);
        }

        let mut entries = self.entries.write().unwrap();
        if let Some(existing) = entries.get(&client_addr) {
            return Ok(existing.clone());
        }

        let server_sock = new_upstream_socket(forward_addr)?;
        let entry = Arc::new(PeerEntry::new(
            client_addr,
            forward_addr,
            server_sock,
            OBFUSCATION_VERSION,
            now_ms,
        ));
        entry.set_masking_handler_once(handler);
        entries.insert(client_addr, entry.clone());
        self.reap_queue.lock().unwrap().push_back(client_addr);
        info!(peer = %client_addr, forward = %forward_addr, "peer entry created");
        Ok(entry)
    }

    /// Scans a bounded slice of the table, round-robin, and evicts entries
    /// idle longer than `idle_timeout_ms`. Called between batches by a
    /// worker. Eviction cost per call is O(`REAP_SCAN_SIZE`), not O(live
    /// peers): a live, still-active address is pushed back onto the queue
    /// for its next turn rather than rescanning the whole table every time.
    pub fn reap(&self, now_ms: u64, idle_timeout_ms: u64) -> usize {
        let mut queue = self.reap_queue.lock().unwrap();
        let scan_len = REAP_SCAN_SIZE.min(queue.len());
        let mut evicted = 0;

        for _ in 0..scan_len {
            let Some(addr) = queue.pop_front() else { break };

            let is_idle = match self.entries.read().unwrap().get(&addr) {
                Some(entry) => entry.is_idle(now_ms, idle_timeout_ms),
                None => continue, // entry already gone; drop it from the queue too
            };

            if !is_idle {
                queue.push_back(addr);
                continue;
            }

            if let Some(entry) = self.entries.write().unwrap().remove(&addr) {
                debug!(peer = %addr, "peer entry evicted (idle timeout)");
                // `entry`'s Socket closes its fd on drop; any in-flight job
                // still holding an Arc<PeerEntry> keeps it alive until that
                // job finishes processing, bounding how long a concurrent
                // worker can still touch a socket this method just removed.
                drop(entry);
                evicted += 1;
            }
        }

        evicted
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

fn new_upstream_socket(forward_addr: SocketAddr) -> std::io::Result<Socket> {
    let domain = if forward_addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_nonblocking(true)?;
    let local: SocketAddr = if forward_addr.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    sock.bind(&local.into())?;
    if let Err(e) = sock.connect(&forward_addr.into()) {
        warn!(forward = %forward_addr, error = %e, "failed to connect upstream socket");
        return Err(e);
    }
    Ok(sock)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> Arc<dyn super::MaskingHandler> {
        Arc::new(super::super::masking::NoopMaskingHandler)
    }

    #[test]
    fn get_or_create_returns_same_entry_for_same_address() {
        let table = SessionTable::new();
        let client: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let forward: SocketAddr = "127.0.0.1:9002".parse().unwrap();

        let a = table.get_or_create(client, forward, noop_handler(), 0).unwrap();
        let b = table.get_or_create(client, forward, noop_handler(), 0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn reap_evicts_only_idle_entries() {
        let table = SessionTable::new();
        let client: SocketAddr = "127.0.0.1:9003".parse().unwrap();
        let forward: SocketAddr = "127.0.0.1:9004".parse().unwrap();
        let entry = table.get_or_create(client, forward, noop_handler(), 0).unwrap();
        entry.stamp_activity(0);

        let evicted = table.reap(500, 1_000);
        assert_eq!(evicted, 0);
        assert_eq!(table.len(), 1);

        let evicted = table.reap(5_000, 1_000);
        assert_eq!(evicted, 1);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn reap_scans_only_a_bounded_slice_per_call() {
        let table = SessionTable::new();
        let total = REAP_SCAN_SIZE * 2 + 10;
        for i in 0..total {
            let client: SocketAddr = format!("127.0.0.1:{}", 20_000 + i).parse().unwrap();
            let forward: SocketAddr = "127.0.0.1:9005".parse().unwrap();
            table.get_or_create(client, forward, noop_handler(), 0).unwrap();
        }
        assert_eq!(table.len(), total);

        // All entries are idle, but a single reap call must not evict more
        // than REAP_SCAN_SIZE of them.
        let evicted = table.reap(10_000, 1_000);
        assert_eq!(evicted, REAP_SCAN_SIZE);
        assert_eq!(table.len(), total - REAP_SCAN_SIZE);

        // Repeated calls keep draining the rest, round-robin.
        let evicted = table.reap(10_000, 1_000);
        assert_eq!(evicted, REAP_SCAN_SIZE);
        let evicted = table.reap(10_000, 1_000);
        assert_eq!(evicted, 10);
        assert_eq!(table.len(), 0);
    }
}
