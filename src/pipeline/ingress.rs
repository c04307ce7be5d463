//! The ingress loop: owns the listening socket, polls every peer's
//! upstream socket, and either enqueues jobs for the worker threads or, in
//! single-threaded mode, processes them inline.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use socket2::Socket;
use tracing::debug;

use super::job::{Direction, PacketJob};
use super::queue::PacketQueue;
use super::worker::{process_from_client, process_from_server, WorkerContext};

const IDLE_SPIN_LIMIT: u32 = 256;
const IDLE_SLEEP: Duration = Duration::from_micros(100);

/// The two SPSC queues ingress feeds in threaded mode.
pub struct Queues<'a> {
    pub client: &'a PacketQueue,
    pub server: &'a PacketQueue,
}

/// Runs the ingress loop until `running` is cleared.
///
/// With `queues: None` (single-core / `ThreadMode::Single`), every
/// datagram is handled inline on this thread; the pipeline collapses to
/// just this loop as a simple single-threaded fallback.
/// With `queues: Some(..)`, datagrams are copied into the appropriate
/// queue for a worker thread to process.
pub fn run_ingress(
    listen_sock: &Socket,
    ctx: &WorkerContext,
    queues: Option<Queues<'_>>,
    running: &AtomicBool,
) {
    debug!("ingress loop started");
    let mut idle_count: u32 = 0;
    let mut recv_buf = vec![0u8; super::job::QUEUE_BUFFER_SIZE];

    while running.load(Ordering::Relaxed) {
        let mut did_work = false;

        if let Some(len_addr) = recv_nonblocking(listen_sock, &mut recv_buf) {
            did_work = true;
            let (len, addr) = len_addr;
            let now_ms = now_ms();
            match &queues {
                Some(q) => enqueue_client_job(q.client, &recv_buf, len, addr, now_ms),
                None => {
                    let mut job = PacketJob::empty();
                    job.buffer[..len].copy_from_slice(&recv_buf[..len]);
                    job.len = len;
                    job.addr = addr;
                    job.direction = Direction::FromClient;
                    job.timestamp_ms = now_ms;
                    process_from_client(&mut job, ctx, now_ms);
                }
            }
        }

        for entry in ctx.table.snapshot() {
            if let Some(len) = recv_nonblocking_connected(&entry.server_sock, &mut recv_buf) {
                did_work = true;
                let now_ms = now_ms();
                match &queues {
                    Some(q) => enqueue_server_job(q.server, &recv_buf, len, &entry, now_ms),
                    None => {
                        let mut job = PacketJob::empty();
                        job.buffer[..len].copy_from_slice(&recv_buf[..len]);
                        job.len = len;
                        job.addr = entry.client_addr;
                        job.direction = Direction::FromServer;
                        job.peer = Some(entry.clone());
                        job.timestamp_ms = now_ms;
                        if let Some(send_len) = process_from_server(&mut job, ctx, now_ms) {
                            let _ = listen_sock.send_to(&job.buffer[..send_len], &entry.client_addr.into());
                        }
                    }
                }
            }
        }

        if did_work {
            idle_count = 0;
        } else {
            back_off(&mut idle_count);
        }
    }

    debug!("ingress loop stopped");
}

fn back_off(idle_count: &mut u32) {
    if *idle_count > IDLE_SPIN_LIMIT {
        std::thread::sleep(IDLE_SLEEP);
    } else {
        *idle_count += 1;
        std::thread::yield_now();
    }
}

/// Reinterprets an already-initialized buffer as `&mut [MaybeUninit<u8>]`
/// for socket2's uninit-friendly recv methods. Sound: `u8` and
/// `MaybeUninit<u8>` share layout, and we only ever read back the prefix
/// the kernel reports as written.
fn as_uninit(buf: &mut [u8]) -> &mut [std::mem::MaybeUninit<u8>] {
    unsafe { &mut *(buf as *mut [u8] as *mut [std::mem::MaybeUninit<u8>]) }
}

fn recv_nonblocking(sock: &Socket, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
    match sock.recv_from(as_uninit(buf)) {
        Ok((len, addr)) => addr.as_socket().map(|a| (len, a)),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
        Err(_) => None,
    }
}

fn recv_nonblocking_connected(sock: &Socket, buf: &mut [u8]) -> Option<usize> {
    match sock.recv(as_uninit(buf)) {
        Ok(len) => Some(len),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
        Err(_) => None,
    }
}

fn enqueue_client_job(queue: &PacketQueue, data: &[u8], len: usize, addr: SocketAddr, now_ms: u64) {
    let Some(job) = queue.reserve() else {
        debug!(peer = %addr, "client queue full, dropping datagram");
        return;
    };
    job.buffer[..len].copy_from_slice(&data[..len]);
    job.len = len;
    job.addr = addr;
    job.direction = Direction::FromClient;
    job.peer = None;
    job.timestamp_ms = now_ms;
    queue.publish();
}

fn enqueue_server_job(
    queue: &PacketQueue,
    data: &[u8],
    len: usize,
    entry: &Arc<crate::session::PeerEntry>,
    now_ms: u64,
) {
    let Some(job) = queue.reserve() else {
        debug!(peer = %entry.client_addr, "server queue full, dropping datagram");
        return;
    };
    job.buffer[..len].copy_from_slice(&data[..len]);
    job.len = len;
    job.addr = entry.client_addr;
    job.direction = Direction::FromServer;
    job.peer = Some(entry.clone());
    job.timestamp_ms = now_ms;
    queue.publish();
}

static START: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since process start. Deliberately monotonic rather than
/// wall-clock: handshake- and idle-timeout comparisons must not jump
/// backwards or forwards across an NTP slew or manual clock change.
fn now_ms() -> u64 {
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}
