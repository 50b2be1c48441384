//! The dedicated close thread (spec §4.12), adapted from the teacher's `CloseSocketThread`
//! pattern of a single worker draining a bounded queue off the hot send/recv paths. Actually
//! closing a socket is cheap, but doing it from whichever thread happens to notice a
//! disconnect (an I/O task, a send worker) would mean the kernel call blocks a thread that
//! has other connections to service; routing it through one dedicated thread keeps that cost
//! off all of them.

use std::os::unix::io::RawFd;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

use tracing::{debug, warn};

use crate::id::ConnectionId;

/// Shuts down the raw socket underlying `id` in both directions. Dropping tokio's
/// `OwnedReadHalf`/`OwnedWriteHalf` elsewhere completes the actual `close()` once both tasks
/// holding them have exited; `shutdown` wakes any task currently blocked in a read or write.
fn shutdown_socket(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
    }
}

struct Msg {
    id: ConnectionId,
    fd: RawFd,
}

pub struct CloseWorker {
    tx: Option<SyncSender<Msg>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl CloseWorker {
    /// `capacity` mirrors the teacher's close queue sizing (one slot per possible
    /// connection): enqueuing should never legitimately block on a correctly sized backend.
    /// `on_closed` runs on the close-worker thread once the socket is down; the backend wires
    /// it to `SetSocketDisconnected` + `SetDisconnectFlag(THREAD_CLOSE)` (spec §4.12).
    pub fn new(capacity: usize, on_closed: impl Fn(ConnectionId) + Send + 'static) -> Self {
        let (tx, rx): (SyncSender<Msg>, Receiver<Msg>) = sync_channel(capacity.max(1));
        let handle = std::thread::Builder::new()
            .name("close-worker".into())
            .spawn(move || {
                while let Ok(Msg { id, fd }) = rx.recv() {
                    shutdown_socket(fd);
                    debug!(?id, "closed connection socket");
                    on_closed(id);
                }
            })
            .expect("failed to spawn close-worker thread");
        Self { tx: Some(tx), handle: Some(handle) }
    }

    /// Enqueue `id` for closing. If the queue is full (should not happen at the configured
    /// capacity; defensive only) or the worker is gone, the close happens inline on the
    /// caller's thread instead — matching the teacher's fallback in `QueueCloseSocket`.
    pub fn enqueue(&self, id: ConnectionId, fd: RawFd) {
        let Some(tx) = &self.tx else {
            shutdown_socket(fd);
            return;
        };
        match tx.try_send(Msg { id, fd }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(?id, "close queue full, closing inline");
                shutdown_socket(fd);
            }
            Err(TrySendError::Disconnected(_)) => {
                shutdown_socket(fd);
            }
        }
    }
}

impl Drop for CloseWorker {
    fn drop(&mut self) {
        // Drop the sender first so the worker's `rx.recv()` observes disconnection and exits,
        // then join it. Mirrors the teacher's drop-order discipline in `SendWorkerPool`/the
        // original's destructor: release whatever the worker is waiting on before joining.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}
