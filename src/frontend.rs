//! The pluggable upper-layer protocol contract (spec §6). A `Frontend` is handed the raw byte
//! stream of each connection and decides what, if anything, to parse out of it and send back;
//! HTTP/WebSocket/raw-protocol parsing itself is out of scope here; only the trait and a
//! trivial test harness implementation live in this crate.

use std::sync::Arc;

use rustls::ServerConfig;

use crate::id::ConnectionId;
use crate::error::Result;

/// Per-listener configuration handed to the acceptor when a listening socket is registered
/// (spec §5 "RegisterListener" / §6 `UseSSL`+`GetSSLConfig`): which frontend parses
/// connections accepted on it, and the TLS server config to negotiate with, if any. `None`
/// means plaintext.
#[derive(Clone)]
pub struct ListenData {
    pub local_interface: String,
    pub port: u16,
    pub frontend: Arc<dyn Frontend>,
    pub tls_config: Option<Arc<ServerConfig>>,
}

impl ListenData {
    pub fn new(local_interface: impl Into<String>, port: u16, frontend: Arc<dyn Frontend>) -> Self {
        Self { local_interface: local_interface.into(), port, frontend, tls_config: None }
    }

    pub fn with_tls(mut self, config: Arc<ServerConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }
}

/// The operations a send-worker thread pulls off a connection's op queue (spec §4.7). Kept
/// here, next to `Frontend`, since frontends are the ones enqueuing `SendPacket`/`SendHttp*`
/// work through the backend.
#[derive(Debug)]
pub enum IoOpType {
    SendPacket,
    FreePacket,
    ClearQueue,
    Close,
}

/// Implemented once per upper-layer protocol and handed to the backend at listener/connect
/// time. All callbacks run on the connection's recv path; long-running work should be handed
/// off rather than blocking it.
pub trait Frontend: Send + Sync + 'static {
    /// A new connection has finished its handshake (TCP accept, or TLS handshake if enabled)
    /// and is ready to send/receive.
    fn on_connect(&self, id: ConnectionId) -> Result<()> {
        let _ = id;
        Ok(())
    }

    /// New plaintext bytes arrived. Returns how many bytes were consumed; unconsumed bytes
    /// stay buffered and are represented again, with more data appended, on the next call.
    fn on_recv(&self, id: ConnectionId, data: &[u8]) -> Result<usize>;

    /// The connection is gone; any frontend-side per-connection state should be dropped.
    fn on_disconnect(&self, id: ConnectionId) {
        let _ = id;
    }
}
