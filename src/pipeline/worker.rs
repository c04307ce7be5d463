//! Direction-specific packet handlers plus the worker
//! loops that drain a `PacketQueue` and run them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::Socket;
use tracing::{debug, trace, warn};

use crate::obfuscation::{decode, encode, is_obfuscated, ObfuscationParams};
use crate::session::{
    apply_response, classify, record_initiation, MaskingContext, MaskingHandler, PacketClass,
    SessionTable, Side,
};

use super::job::PacketJob;
use super::queue::PacketQueue;

/// Bound on spin iterations before a worker yields to a short sleep.
const IDLE_SPIN_LIMIT: u32 = 256;
const IDLE_SLEEP: Duration = Duration::from_micros(100);

/// Scatter-send batch size on platforms with `sendmmsg`.
#[cfg(target_os = "linux")]
pub const SEND_BATCH: usize = 16;

/// Shared, read-mostly state every worker needs. One instance is shared
/// (via `Arc`) between the client-side and server-side worker threads.
pub struct WorkerContext {
    pub params: ObfuscationParams,
    pub table: Arc<SessionTable>,
    pub masking_handler: Arc<dyn MaskingHandler>,
    pub forward_addr: SocketAddr,
    pub handshake_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    /// The single listening socket, shared with ingress; only the
    /// server-side worker writes to it.
    pub listen_sock: Arc<Socket>,
    pub running: Arc<AtomicBool>,
}

/// Handles one datagram that arrived on the listening socket.
pub fn process_from_client(job: &mut PacketJob, ctx: &WorkerContext, now_ms: u64) {
    let client_addr = job.addr;
    let mut len = job.len;
    if len < 4 {
        trace!(peer = %client_addr, len, "dropping undersized client datagram");
        return;
    }

    let existing = ctx.table.get(&client_addr);
    let obfuscated = is_obfuscated(&job.buffer[..len]);

    let mcx = MaskingContext {
        peer: existing.as_deref(),
        peer_addr: client_addr,
        forward_addr: ctx.forward_addr,
    };

    if obfuscated {
        let new_len = ctx.masking_handler.unwrap_from_client(&mut job.buffer, len, &mcx);
        if new_len <= 0 {
            debug!(peer = %client_addr, "masking handler rejected client datagram");
            return;
        }
        len = new_len as usize;
    }

    if len < 4 {
        trace!(peer = %client_addr, len, "dropping undersized client datagram after unwrap");
        return;
    }

    let mut version = existing
        .as_ref()
        .map(|e| e.version())
        .unwrap_or(crate::obfuscation::OBFUSCATION_VERSION);

    if obfuscated {
        let original_len = len;
        let decoded = decode(&mut job.buffer, len, &ctx.params, &mut version);
        if decoded < 4 || decoded as usize > original_len {
            debug!(peer = %client_addr, decoded, "dropping client datagram that failed to decode");
            return;
        }
        len = decoded as usize;
    }

    let packet_type = crate::obfuscation::params::packet_type(&job.buffer[..len]);
    let class = classify(packet_type);

    let entry = match class {
        PacketClass::Initiation => {
            let entry = match existing.clone() {
                Some(e) => e,
                None => match ctx.table.get_or_create(
                    client_addr,
                    ctx.forward_addr,
                    ctx.masking_handler.clone(),
                    now_ms,
                ) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(peer = %client_addr, error = %e, "failed to create peer entry");
                        return;
                    }
                },
            };
            if !obfuscated {
                ctx.masking_handler.on_handshake_req_from_client(&mcx);
            }
            record_initiation(&entry, Side::Client, now_ms);
            entry
        }
        PacketClass::Response => {
            let Some(entry) = existing else {
                debug!(peer = %client_addr, "response from unknown peer, dropping");
                return;
            };
            if !apply_response(&entry, Side::Client, obfuscated, ctx.handshake_timeout_ms, now_ms) {
                debug!(peer = %client_addr, "handshake response outside window or wrong direction, dropping");
                return;
            }
            entry
        }
        _ => {
            let Some(entry) = existing else {
                debug!(peer = %client_addr, "packet from unknown peer before handshake, dropping");
                return;
            };
            if !entry.handshaked() {
                trace!(peer = %client_addr, "dropping packet, handshake not yet complete");
                return;
            }
            entry
        }
    };

    entry.downgrade_version(version);

    if !obfuscated {
        let new_len = encode(&mut job.buffer, len, &ctx.params, entry.version());
        if new_len < 4 {
            return;
        }
        len = new_len;
        let mcx = MaskingContext {
            peer: Some(entry.as_ref()),
            peer_addr: client_addr,
            forward_addr: ctx.forward_addr,
        };
        len = ctx.masking_handler.data_wrap_to_server(&mut job.buffer, len, &mcx);
    }

    entry.drain_pending_sends();
    match entry.server_sock.send(&job.buffer[..len]) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            entry.enqueue_pending(&job.buffer[..len]);
        }
        Err(e) => {
            debug!(peer = %client_addr, error = %e, "upstream send failed");
        }
    }
    entry.stamp_activity(now_ms);
}

/// Handles one datagram that arrived on a peer's upstream socket.
/// Returns the length to send back to the client on
/// success (leaves the encoded/wrapped bytes in `job.buffer`), or `None`
/// to drop.
pub fn process_from_server(job: &mut PacketJob, ctx: &WorkerContext, now_ms: u64) -> Option<usize> {
    let entry = job.peer.clone()?;
    let mut len = job.len;
    if len < 4 {
        trace!(peer = %entry.client_addr, len, "dropping undersized server datagram");
        return None;
    }

    let obfuscated = is_obfuscated(&job.buffer[..len]);
    let mcx = MaskingContext {
        peer: Some(entry.as_ref()),
        peer_addr: entry.client_addr,
        forward_addr: ctx.forward_addr,
    };

    if obfuscated {
        let new_len = ctx.masking_handler.unwrap_from_server(&mut job.buffer, len, &mcx);
        if new_len <= 0 {
            debug!(peer = %entry.client_addr, "masking handler rejected server datagram");
            return None;
        }
        len = new_len as usize;
    }

    if len < 4 {
        trace!(peer = %entry.client_addr, len, "dropping undersized server datagram after unwrap");
        return None;
    }

    let mut version = entry.version();
    if obfuscated {
        let original_len = len;
        let decoded = decode(&mut job.buffer, len, &ctx.params, &mut version);
        if decoded < 4 || decoded as usize > original_len {
            debug!(peer = %entry.client_addr, decoded, "dropping server datagram that failed to decode");
            return None;
        }
        len = decoded as usize;
    }

    let packet_type = crate::obfuscation::params::packet_type(&job.buffer[..len]);
    match classify(packet_type) {
        PacketClass::Initiation => {
            if !obfuscated {
                ctx.masking_handler.on_handshake_req_from_server(&mcx);
            }
            record_initiation(&entry, Side::Server, now_ms);
        }
        PacketClass::Response => {
            if !apply_response(&entry, Side::Server, obfuscated, ctx.handshake_timeout_ms, now_ms) {
                debug!(peer = %entry.client_addr, "handshake response outside window or wrong direction, dropping");
                return None;
            }
        }
        _ => {
            if !entry.handshaked() {
                trace!(peer = %entry.client_addr, "dropping packet, handshake not yet complete");
                return None;
            }
        }
    }

    entry.downgrade_version(version);

    if !obfuscated {
        let new_len = encode(&mut job.buffer, len, &ctx.params, entry.version());
        if new_len < 4 {
            return None;
        }
        len = new_len;
        len = ctx.masking_handler.data_wrap_to_client(&mut job.buffer, len, &mcx);
    }

    entry.stamp_activity(now_ms);
    Some(len)
}

/// Drives the client→server queue: one packet at a time, no batching (the
/// upstream sockets are per-peer, so there's nothing to scatter-send).
pub fn run_client_worker(queue: &PacketQueue, ctx: &WorkerContext, worker_index: usize) {
    debug!(worker_index, "client-side worker started");
    let mut idle_count: u32 = 0;

    while ctx.running.load(Ordering::Relaxed) {
        let Some(job) = queue.peek_mut() else {
            if queue.is_shutdown() {
                break;
            }
            back_off(&mut idle_count);
            continue;
        };
        idle_count = 0;

        let now_ms = job.timestamp_ms;
        process_from_client(job, ctx, now_ms);
        queue.consume();

        ctx.table.reap(now_ms, ctx.idle_timeout_ms);
    }

    debug!(worker_index, "client-side worker stopped");
}

/// Drives the server→client queue. On Linux, batches up to `SEND_BATCH`
/// outgoing datagrams into one `sendmmsg`; elsewhere falls back to one
/// `send_to` per ready packet.
pub fn run_server_worker(queue: &PacketQueue, ctx: &WorkerContext, worker_index: usize) {
    debug!(worker_index, "server-side worker started");
    let mut idle_count: u32 = 0;

    while ctx.running.load(Ordering::Relaxed) {
        #[cfg(target_os = "linux")]
        let sent = drain_batch_linux(queue, ctx);
        #[cfg(not(target_os = "linux"))]
        let sent = drain_one_at_a_time(queue, ctx);

        if sent > 0 {
            idle_count = 0;
        } else {
            if queue.is_shutdown() {
                break;
            }
            back_off(&mut idle_count);
        }
    }

    debug!(worker_index, "server-side worker stopped");
}

fn back_off(idle_count: &mut u32) {
    if *idle_count > IDLE_SPIN_LIMIT {
        std::thread::sleep(IDLE_SLEEP);
    } else {
        *idle_count += 1;
        std::thread::yield_now();
    }
}

fn drain_one_at_a_time(queue: &PacketQueue, ctx: &WorkerContext) -> usize {
    let mut sent = 0;
    loop {
        let Some(job) = queue.peek_mut() else { break };
        let now_ms = job.timestamp_ms;
        let client_addr = job.addr;
        if let Some(len) = process_from_server(job, ctx, now_ms) {
            match ctx.listen_sock.send_to(&job.buffer[..len], &client_addr.into()) {
                Ok(_) => sent += 1,
                Err(e) => debug!(peer = %client_addr, error = %e, "client send failed"),
            }
        }
        queue.consume();
        ctx.table.reap(now_ms, ctx.idle_timeout_ms);
    }
    sent
}

/// One drained, ready-to-send packet, copied out of its queue slot before
/// the slot is recycled by `consume`.
#[cfg(target_os = "linux")]
struct ReadyPacket {
    data: Vec<u8>,
    addr: SocketAddr,
}

/// Batches up to `SEND_BATCH` ready datagrams and sends them in one
/// `sendmmsg` call. IPv4 destinations only, matching the upstream
/// relay's addressing model; IPv6 falls back to one `sendto` per packet.
#[cfg(target_os = "linux")]
fn drain_batch_linux(queue: &PacketQueue, ctx: &WorkerContext) -> usize {
    use std::net::SocketAddrV4;
    use std::os::fd::AsRawFd;

    let mut batch: Vec<ReadyPacket> = Vec::with_capacity(SEND_BATCH);
    let mut last_now_ms = 0u64;

    while batch.len() < SEND_BATCH {
        let Some(job) = queue.peek_mut() else { break };
        last_now_ms = job.timestamp_ms;
        let client_addr = job.addr;
        if let Some(len) = process_from_server(job, ctx, last_now_ms) {
            batch.push(ReadyPacket {
                data: job.buffer[..len].to_vec(),
                addr: client_addr,
            });
        }
        queue.consume();
    }

    if batch.is_empty() {
        return 0;
    }
    ctx.table.reap(last_now_ms, ctx.idle_timeout_ms);

    let v4_addrs: Option<Vec<SocketAddrV4>> = batch
        .iter()
        .map(|p| match p.addr {
            SocketAddr::V4(a) => Some(a),
            SocketAddr::V6(_) => None,
        })
        .collect();

    let Some(v4_addrs) = v4_addrs else {
        return send_one_at_a_time(&batch, ctx);
    };

    let mut iovecs: Vec<libc::iovec> = batch
        .iter()
        .map(|p| libc::iovec {
            iov_base: p.data.as_ptr() as *mut libc::c_void,
            iov_len: p.data.len(),
        })
        .collect();
    let mut sockaddrs: Vec<libc::sockaddr_in> = v4_addrs.iter().map(to_sockaddr_in).collect();
    let mut hdrs: Vec<libc::mmsghdr> = (0..batch.len())
        .map(|i| libc::mmsghdr {
            msg_hdr: libc::msghdr {
                msg_name: &mut sockaddrs[i] as *mut _ as *mut libc::c_void,
                msg_namelen: std::mem::size_of::<libc::sockaddr_in>() as u32,
                msg_iov: &mut iovecs[i] as *mut libc::iovec,
                msg_iovlen: 1,
                msg_control: std::ptr::null_mut(),
                msg_controllen: 0,
                msg_flags: 0,
            },
            msg_len: 0,
        })
        .collect();

    let fd = ctx.listen_sock.as_raw_fd();
    // SAFETY: `hdrs`, the `iovecs` and `sockaddrs` they point into all
    // outlive this call, and `fd` is a valid open datagram socket owned by
    // `ctx.listen_sock`.
    let rc = unsafe { libc::sendmmsg(fd, hdrs.as_mut_ptr(), hdrs.len() as u32, libc::MSG_DONTWAIT) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        warn!(error = %err, "sendmmsg failed");
        return 0;
    }
    rc as usize
}

#[cfg(target_os = "linux")]
fn to_sockaddr_in(addr: &std::net::SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
    }
}

#[cfg(target_os = "linux")]
fn send_one_at_a_time(batch: &[ReadyPacket], ctx: &WorkerContext) -> usize {
    let mut sent = 0;
    for p in batch {
        match ctx.listen_sock.send_to(&p.data, &p.addr.into()) {
            Ok(_) => sent += 1,
            Err(e) => debug!(peer = %p.addr, error = %e, "client send failed"),
        }
    }
    sent
}
