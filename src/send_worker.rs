//! The dedicated send-worker thread pool (spec §4.7/§4.10). `N` OS threads, each running its
//! own tiny single-threaded tokio runtime, partition plaintext connections by `id % N`
//! ([`ConnectionId::send_thread_index`]) and own each connection's socket write half for its
//! whole lifetime; an app thread enqueuing a packet only ever touches the lock-free
//! [`GenQueue`] and a [`tokio::sync::Notify`], never the socket itself.
//!
//! TLS connections are the one case this pool doesn't drive: rustls's `Connection` unifies
//! read and write state, so splitting it across a reader task and a writer thread would need
//! its own mutex duplicating the synchronization the queue already provides. Instead a TLS
//! connection's single full-duplex task (spawned on the ordinary tokio I/O runtime) drains its
//! own send queue inline; see `BackendShared::run_tls_connection`.

use std::io::IoSlice;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, warn};

use crate::backend::BackendShared;
use crate::common::Ark;
use crate::conn::ConnState;
use crate::disconnect::DisconnectFlags;
use crate::error::Result;
use crate::id::ConnectionId;
use crate::slot::Connection;

/// Maximum number of queued packets considered in one vectored write pass. Bounding this
/// keeps the `IoSlice` vector on the stack-sized side and caps tail latency for the packet
/// at the front of a very deep queue. Plays the role of spec §4.10's `kBufferSetCount`.
const MAX_IOVECS: usize = 16;

enum Msg {
    Register { ctx: Arc<BackendShared>, conn: Ark<ConnState>, write_half: OwnedWriteHalf },
}

pub struct SendWorkerPool {
    senders: Vec<UnboundedSender<Msg>>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl SendWorkerPool {
    pub fn new(num_threads: u32) -> Self {
        let mut senders = Vec::with_capacity(num_threads as usize);
        let mut threads = Vec::with_capacity(num_threads as usize);
        for idx in 0..num_threads {
            let (tx, mut rx) = unbounded_channel::<Msg>();
            let handle = std::thread::Builder::new()
                .name(format!("send-worker-{idx}"))
                .spawn(move || {
                    let rt = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed to build send-worker runtime");
                    rt.block_on(async move {
                        while let Some(msg) = rx.recv().await {
                            match msg {
                                Msg::Register { ctx, conn, write_half } => {
                                    tokio::spawn(run_connection_sender(ctx, conn, write_half));
                                }
                            }
                        }
                    });
                })
                .expect("failed to spawn send-worker thread");
            senders.push(tx);
            threads.push(handle);
        }
        Self { senders, threads }
    }

    /// Hand a freshly accepted/connected plaintext connection's write half off to the thread
    /// responsible for `id`.
    pub fn register(&self, ctx: Arc<BackendShared>, id: ConnectionId, conn: Ark<ConnState>, write_half: OwnedWriteHalf) {
        let idx = id.send_thread_index(self.senders.len() as u32);
        if self.senders[idx].send(Msg::Register { ctx, conn, write_half }).is_err() {
            warn!(?id, "send-worker thread gone, dropping write half");
        }
    }

    pub fn num_threads(&self) -> usize {
        self.senders.len()
    }
}

impl Drop for SendWorkerPool {
    fn drop(&mut self) {
        // Dropping every sender closes the channel each thread's runtime is blocked on,
        // which ends its `block_on` future; the runtime itself is then dropped inside the
        // thread closure, which in turn drains whatever per-connection sender tasks are still
        // spawned on it.
        self.senders.clear();
        for t in self.threads.drain(..) {
            t.join().ok();
        }
    }
}

async fn run_connection_sender(ctx: Arc<BackendShared>, conn: Ark<ConnState>, mut write_half: OwnedWriteHalf) {
    let id = conn.id();
    loop {
        let flags = conn.disconnect_flags();
        if flags.contains(DisconnectFlags::SOCKET) && flags.intersects(DisconnectFlags::CLOSE_FLAGS) {
            ctx.release_send_queue(&conn);
            ctx.set_disconnect_flag(&conn, DisconnectFlags::SEND_THREAD);
            debug!(?id, "send worker exiting, connection closing");
            return;
        }

        match drain_once(&conn, &mut write_half).await {
            Ok(true) => continue,
            Ok(false) => conn.send_notify.notified().await,
            Err(e) => {
                warn!(?id, error = %e, "send worker socket error");
                ctx.set_socket_disconnected(&conn);
                ctx.set_disconnect_flag(&conn, DisconnectFlags::SEND_THREAD);
                return;
            }
        }
    }
}

/// One vectored-write pass over whatever is currently queued. Returns `Ok(true)` if it's
/// worth immediately looping again (more work may remain), `Ok(false)` if the queue is
/// drained and the worker should go back to sleep on `send_notify`.
async fn drain_once(conn: &ConnState, write_half: &mut OwnedWriteHalf) -> Result<bool> {
    let pending = conn.send_queue.peek_top(MAX_IOVECS);
    if pending.is_empty() {
        return Ok(false);
    }

    // Borrow each writer's unsent segments and flatten into one IoSlice list for a single
    // vectored syscall, exactly mirroring the original's FillBufferSet assembly.
    let segment_lists: Vec<Vec<(crate::block::BlockHandle, u32, u32)>> =
        pending.iter().map(|p| p.writer.segments_from(p.sent)).collect();
    let mut slices: Vec<IoSlice> = Vec::new();
    for (pending_entry, segs) in pending.iter().zip(segment_lists.iter()) {
        for (handle, offset, len) in segs {
            let block = pending_entry.writer.read_block(*handle);
            slices.push(IoSlice::new(&block[*offset as usize..(*offset + *len) as usize]));
        }
    }
    if slices.is_empty() {
        // Every pending entry was already fully sent; just clean the queue up.
        let entry = pending.into_iter().next().unwrap();
        let size = entry.writer.total_len() - entry.sent;
        conn.send_queue.advance();
        requeue_freed(conn, entry, size);
        return Ok(true);
    }

    let written = write_half.write_vectored(&slices).await?;
    apply_written(conn, pending, written);
    Ok(true)
}

fn apply_written(conn: &ConnState, pending: Vec<crate::conn::PendingSend>, mut written: usize) {
    for mut entry in pending {
        let remaining = entry.writer.total_len() - entry.sent;
        if written as u32 >= remaining {
            written -= remaining as usize;
            conn.send_queue.advance();
            conn.note_packet_sent(1);
            requeue_freed(conn, entry, remaining);
        } else {
            entry.sent += written as u32;
            conn.send_queue.replace_top(entry);
            break;
        }
    }
}

/// Pushes a fully-sent writer onto the free queue and runs `FreePacket(size)` (spec §4.10)
/// against it, releasing the packet-slot reservation it was holding once the free queue's
/// byte accounting catches up to it.
fn requeue_freed(conn: &ConnState, entry: crate::conn::PendingSend, size: u32) {
    let generation = conn.queue_generation();
    if conn.free_queue.enqueue(entry.writer, generation).is_err() {
        // Free queue full or connection already reset; the writer's own refcount drop still
        // reclaims its blocks, it's just not reported back through the free queue, so release
        // its reservation directly rather than leaking it.
        conn.release_packet_slots(1, generation);
        return;
    }
    conn.free_packet(size);
}
