//! Per-connection state (spec §3 `ConnectionSlot`, §4.8), the `C` that
//! [`crate::slot::SlotTable`] is generic over. Bundles the bits every connection needs
//! regardless of direction (accepted vs outgoing) or transport (plain vs TLS): the disconnect
//! bitmask, the two generation-tagged queues (outgoing sends, pending frees), the recv-side
//! buffer and transport, and the frontend that parses its bytes.

use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering::{AcqRel, Acquire, Relaxed, Release}};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::buffer::RecvBuffer;
use crate::common::{coarse_monotonic_now, Ark, AtomicRefCounted};
use crate::disconnect::DisconnectFlags;
use crate::frontend::Frontend;
use crate::id::ConnectionId;
use crate::queue::GenQueue;
use crate::slot::Connection;
use crate::transport::Transport;
use crate::writer::Writer;

/// One entry in a connection's outgoing queue: the packet plus how much of it has already
/// been handed to the socket, so a partial vectored write can resume without re-copying.
pub struct PendingSend {
    pub writer: Ark<Writer>,
    pub sent: u32,
}

impl Clone for PendingSend {
    fn clone(&self) -> Self {
        Self { writer: self.writer.clone(), sent: self.sent }
    }
}

/// The parts of a connection only ever touched by whichever task currently holds
/// `recv_critical_section`, or by the connection's own TLS full-duplex task (spec §4.7): the
/// recv-side block-chain buffer and the TLS state machine, if any. Correctness does not
/// depend on lock-free access here (spec §5's "structural, not mutex-based, serialization" is
/// enforced by `recv_critical_section` and per-connection send-thread affinity before this
/// mutex is ever touched), so a plain mutex realizes it; it is never contended in practice.
pub struct ConnIo {
    pub recv_buffer: RecvBuffer,
    pub transport: Transport,
}

pub struct ConnState {
    refcount: AtomicU32,
    id: std::sync::OnceLock<ConnectionId>,
    disconnect_flags: AtomicU16,
    last_active: AtomicU32,
    pub raw_fd: RawFd,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub frontend: Arc<dyn Frontend>,
    pub send_queue: GenQueue<PendingSend>,
    pub free_queue: GenQueue<Ark<Writer>>,
    /// Signalled whenever new work is enqueued, so the owning send-worker (or, for TLS
    /// connections, the connection's own full-duplex task) wakes up instead of polling.
    pub send_notify: Notify,
    /// CAS gate (spec §4.7 `ProcessReceivedData`): exactly one task may be inside
    /// `Frontend::on_recv` for this connection at a time. A task that loses the race reposts
    /// itself rather than blocking.
    recv_critical_section: AtomicBool,
    /// Reservation against `MaxPendingFrees` (spec §3); every successful send reserves one
    /// slot here, released once the free-worker matches a completed write back to its writer.
    pending_packets: AtomicU32,
    /// Bytes the kernel has accepted but not yet matched to a writer at the head of
    /// `free_queue` (spec §3 `pending_free_data`); consumed by `free_packet`.
    pending_free_data: AtomicU32,
    pub io: Mutex<ConnIo>,
    packets_sent: AtomicU32,
    packets_recved: AtomicU32,
    failed_connection: AtomicBool,
}

impl ConnState {
    pub fn new(
        raw_fd: RawFd,
        remote_ip: Ipv4Addr,
        remote_port: u16,
        frontend: Arc<dyn Frontend>,
        recv_buffer: RecvBuffer,
        transport: Transport,
        send_queue_capacity: usize,
        free_queue_capacity: usize,
    ) -> Self {
        Self {
            refcount: AtomicU32::new(1),
            id: std::sync::OnceLock::new(),
            disconnect_flags: AtomicU16::new(0),
            last_active: AtomicU32::new(coarse_monotonic_now()),
            raw_fd,
            remote_ip,
            remote_port,
            frontend,
            send_queue: GenQueue::new(send_queue_capacity),
            free_queue: GenQueue::new(free_queue_capacity),
            send_notify: Notify::new(),
            recv_critical_section: AtomicBool::new(false),
            pending_packets: AtomicU32::new(0),
            pending_free_data: AtomicU32::new(0),
            io: Mutex::new(ConnIo { recv_buffer, transport }),
            packets_sent: AtomicU32::new(0),
            packets_recved: AtomicU32::new(0),
            failed_connection: AtomicBool::new(false),
        }
    }

    pub fn touch(&self) {
        self.last_active.store(coarse_monotonic_now(), Relaxed);
    }

    pub fn disconnect_flags(&self) -> DisconnectFlags {
        DisconnectFlags::from_bits_truncate(self.disconnect_flags.load(Acquire))
    }

    /// Set `flag`, returning the resulting mask. Monotonic: a flag once set is never cleared.
    /// Returns `None` if `flag` was already set (the caller's side effects should not repeat).
    pub fn set_disconnect_flag(&self, flag: DisconnectFlags) -> Option<DisconnectFlags> {
        let prev = DisconnectFlags::from_bits_truncate(self.disconnect_flags.fetch_or(flag.bits(), AcqRel));
        if prev.contains(flag) {
            None
        } else {
            Some(prev | flag)
        }
    }

    /// True the first time the mask reaches [`DisconnectFlags::ALL`]; cleanup code should
    /// gate on this so it runs exactly once per connection.
    pub fn is_fully_disconnected(&self) -> bool {
        self.disconnect_flags().contains(DisconnectFlags::ALL)
    }

    pub fn queue_generation(&self) -> u8 {
        self.send_queue.generation()
    }

    /// CAS the recv critical section 0 -> 1. Returns true if acquired.
    pub fn try_enter_recv_section(&self) -> bool {
        self.recv_critical_section.compare_exchange(false, true, AcqRel, Acquire).is_ok()
    }

    pub fn leave_recv_section(&self) {
        self.recv_critical_section.store(false, Release);
    }

    /// Reserve `amount` pending-free slots (spec §4.3 `ReservePacketSlot`). Fails without
    /// side effects if doing so would exceed `max_pending_frees`.
    pub fn reserve_packet_slots(&self, amount: u32, max_pending_frees: u32) -> bool {
        loop {
            let cur = self.pending_packets.load(Acquire);
            if cur > max_pending_frees.saturating_sub(amount) {
                return false;
            }
            if self.pending_packets.compare_exchange_weak(cur, cur + amount, AcqRel, Acquire).is_ok() {
                return true;
            }
        }
    }

    /// Release `amount` pending-free slots, unless `generation` is stale (spec's
    /// `ReleasePacketSlot`: a stale release is a no-op, the slot was already recycled).
    pub fn release_packet_slots(&self, amount: u32, generation: u8) {
        if generation == self.queue_generation() {
            self.pending_packets.fetch_sub(amount, AcqRel);
        }
    }

    /// `FreePacket(size)` (spec §4.10): `size` bytes the kernel just accepted for this
    /// connection. Adds them to `pending_free_data`, then while the writer at the head of
    /// `free_queue` has a total length no greater than what's accumulated, pops it, releases
    /// the packet-slot reservation it was holding, and subtracts its length. Popping the `Ark`
    /// drops the caller's last reference to the writer, freeing its block chain.
    pub fn free_packet(&self, size: u32) {
        self.pending_free_data.fetch_add(size, AcqRel);
        let generation = self.queue_generation();
        loop {
            let Some(head) = self.free_queue.peek_top(1).into_iter().next() else { break };
            let len = head.total_len();
            drop(head);
            if len > self.pending_free_data.load(Acquire) {
                break;
            }
            if self.free_queue.try_dequeue().is_none() {
                break;
            }
            self.pending_free_data.fetch_sub(len, AcqRel);
            self.release_packet_slots(1, generation);
        }
    }

    pub fn note_packet_sent(&self, n: u32) {
        self.packets_sent.fetch_add(n, Relaxed);
    }

    pub fn note_packet_recved(&self) {
        self.packets_recved.fetch_add(1, Relaxed);
    }

    pub fn packets_sent(&self) -> u32 {
        self.packets_sent.load(Relaxed)
    }

    pub fn packets_recved(&self) -> u32 {
        self.packets_recved.load(Relaxed)
    }

    pub fn mark_failed(&self) {
        self.failed_connection.store(true, Relaxed);
    }

    pub fn failed(&self) -> bool {
        self.failed_connection.load(Relaxed)
    }
}

impl AtomicRefCounted for ConnState {
    fn refcount(&self) -> u32 {
        self.refcount.load(Relaxed)
    }

    fn incref(&self) {
        self.refcount.fetch_add(1, Relaxed);
    }

    fn decref(&self) -> bool {
        self.refcount.fetch_sub(1, AcqRel) == 1
    }
}

impl Connection for ConnState {
    fn bind(&self, id: ConnectionId) {
        self.id.set(id).ok();
    }

    fn id(&self) -> ConnectionId {
        *self.id.get().unwrap_or(&ConnectionId::INVALID)
    }

    fn last_active(&self) -> u32 {
        self.last_active.load(Relaxed)
    }
}

impl std::fmt::Debug for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnState").field("id", &self.id()).field("flags", &self.disconnect_flags()).finish()
    }
}
