//! The packet-processing pipeline: ingress, SPSC queues, and the worker
//! loops that decode/re-encode/send.

pub mod ingress;
pub mod job;
pub mod queue;
pub mod worker;

pub use ingress::{run_ingress, Queues};
pub use job::{Direction, PacketJob, QUEUE_BUFFER_SIZE};
pub use queue::{PacketQueue, QUEUE_MASK, QUEUE_SIZE};
pub use worker::{process_from_client, process_from_server, run_client_worker, run_server_worker, WorkerContext};
