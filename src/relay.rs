//! Lifecycle glue: picks a thread mode, wires sockets/queues/workers
//! together, and owns shutdown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;

use crate::config::{ObfuscatorConfig, ThreadMode};
use crate::error::Error;
use crate::obfuscation::ObfuscationParams;
use crate::pipeline::{run_client_worker, run_ingress, run_server_worker, PacketQueue, Queues, WorkerContext};
use crate::session::{HttpMimicryMaskingHandler, MaskingHandler, NoopMaskingHandler, SessionTable};

/// Thread-count bands the relay selects between based on detected CPU count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedMode {
    Single,
    Dual,
    Multi,
}

fn detect_cpu_cores() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn resolve_mode(requested: ThreadMode) -> ResolvedMode {
    match requested {
        ThreadMode::Single => ResolvedMode::Single,
        ThreadMode::Dual => ResolvedMode::Dual,
        ThreadMode::Auto => {
            let cores = detect_cpu_cores();
            info!(cores, "detected logical CPU(s)");
            if cores <= 1 {
                ResolvedMode::Single
            } else if cores <= 4 {
                ResolvedMode::Dual
            } else {
                ResolvedMode::Multi
            }
        }
    }
}

fn build_masking_handler(name: Option<&str>) -> Arc<dyn MaskingHandler> {
    match name {
        Some("http") => Arc::new(HttpMimicryMaskingHandler::new("example.com")),
        _ => Arc::new(NoopMaskingHandler),
    }
}

fn bind_listen_socket(addr: SocketAddr) -> Result<Socket, Error> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|source| Error::Bind { addr, source })?;
    sock.set_nonblocking(true)?;
    sock.bind(&addr.into()).map_err(|source| Error::Bind { addr, source })?;
    Ok(sock)
}

/// A running (or not-yet-started) relay instance.
pub struct Relay {
    config: ObfuscatorConfig,
    running: Arc<AtomicBool>,
    table: Arc<SessionTable>,
    listen_sock: Arc<Socket>,
    mode: ResolvedMode,
    client_queue: Arc<PacketQueue>,
    server_queue: Arc<PacketQueue>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl Relay {
    pub fn new(config: ObfuscatorConfig) -> Result<Self, Error> {
        let listen_sock = bind_listen_socket(config.listen)?;
        let mode = resolve_mode(config.thread_mode);
        match mode {
            ResolvedMode::Single => info!("using single-threaded mode"),
            ResolvedMode::Dual => info!("using dual-threaded mode (1 ingress + 2 workers)"),
            ResolvedMode::Multi => info!("using multi-threaded mode (1 ingress + 2 workers)"),
        }

        Ok(Self {
            config,
            running: Arc::new(AtomicBool::new(true)),
            table: Arc::new(SessionTable::new()),
            listen_sock: Arc::new(listen_sock),
            mode,
            client_queue: Arc::new(PacketQueue::new()),
            server_queue: Arc::new(PacketQueue::new()),
            workers: Vec::new(),
        })
    }

    fn worker_context(&self) -> Arc<WorkerContext> {
        Arc::new(WorkerContext {
            params: ObfuscationParams::new(self.config.key_bytes.clone(), self.config.max_dummy_length_data),
            table: self.table.clone(),
            masking_handler: build_masking_handler(self.config.masking_handler.as_deref()),
            forward_addr: self.config.forward,
            handshake_timeout_ms: self.config.handshake_timeout_ms,
            idle_timeout_ms: self.config.idle_timeout_ms,
            listen_sock: self.listen_sock.clone(),
            running: self.running.clone(),
        })
    }

    /// Starts worker threads (threaded modes only) and runs the ingress
    /// loop on the calling thread until `shutdown` is called from another
    /// thread. Blocks.
    pub fn run(&mut self) -> Result<(), Error> {
        let ctx = self.worker_context();

        if self.mode != ResolvedMode::Single {
            let client_queue = self.client_queue.clone();
            let server_queue = self.server_queue.clone();

            let client_ctx = ctx.clone();
            let handle = std::thread::Builder::new()
                .name("obfusc-client".into())
                .spawn(move || run_client_worker(&client_queue, &client_ctx, 0))
                .map_err(|e| Error::WorkerSpawn(e.to_string()))?;
            self.workers.push(handle);

            let server_ctx = ctx.clone();
            let handle = std::thread::Builder::new()
                .name("obfusc-server".into())
                .spawn(move || run_server_worker(&server_queue, &server_ctx, 1))
                .map_err(|e| Error::WorkerSpawn(e.to_string()))?;
            self.workers.push(handle);

            info!(workers = self.workers.len(), "started worker thread(s)");
        }

        let queues = if self.mode == ResolvedMode::Single {
            None
        } else {
            Some(Queues {
                client: &self.client_queue,
                server: &self.server_queue,
            })
        };

        run_ingress(&self.listen_sock, &ctx, queues, &self.running);
        Ok(())
    }

    /// Signals the ingress loop and worker threads to stop, then joins them.
    pub fn shutdown(&mut self) {
        info!("shutting down relay");
        self.running.store(false, Ordering::Release);
        self.client_queue.set_shutdown();
        self.server_queue.set_shutdown();

        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        info!("relay shut down");
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }
}
