//! `packetrelay`: the socket backend of a multi-connection TCP server/client library with
//! optional TLS and pluggable upper-layer protocols ("frontends"). This crate owns the I/O
//! event loop, the connection slot table, per-connection outgoing queues, the send-worker
//! pool, the close worker, and the connection lifecycle state machine; frontends (HTTP,
//! WebSocket, raw protocols, ...) live outside it and are handed in as trait objects.

mod acceptor;
mod backend;
mod block;
mod buffer;
mod close_worker;
pub mod common;
pub mod config;
mod conn;
mod disconnect;
mod error;
mod frontend;
mod id;
pub mod insecure_verifier;
mod queue;
mod send_worker;
mod slot;
mod transport;
mod writer;

#[cfg(test)]
mod tests;

pub use backend::{Backend, HttpWriterPair};
pub use config::{load_settings, BackendInitSettings};
pub use disconnect::DisconnectFlags;
pub use error::{Error, ErrorKind, Result};
pub use frontend::{Frontend, IoOpType, ListenData};
pub use id::ConnectionId;
pub use writer::Writer;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Installs a global `tracing` subscriber that writes to stdout. Mirrors the teacher's
/// `init_tracing`: callers that already have their own subscriber should skip this.
pub fn init_tracing(max_level: Level) {
    let subscriber = FmtSubscriber::builder().with_max_level(max_level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

/// Builds the multi-threaded tokio runtime the backend's acceptors, connect path and recv
/// tasks run on. `num_io_threads` comes from [`BackendInitSettings`]; the send-worker pool and
/// close worker spawn their own dedicated OS threads outside this runtime (spec §5: I/O
/// threads, send threads and the close thread are three separate pools).
pub fn build_runtime(settings: &BackendInitSettings) -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.num_io_threads as usize)
        .enable_all()
        .build()
}
