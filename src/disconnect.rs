use bitflags::bitflags;

bitflags! {
    /// Monotonic disconnect bits (spec §4.8). Once a bit is set for a given connection
    /// generation it is never cleared; cleanup runs exactly once, when the mask reaches
    /// [`DisconnectFlags::ALL`].
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct DisconnectFlags: u16 {
        const LOCAL_CLOSE      = 1 << 0;
        const REMOTE_CLOSE     = 1 << 1;
        const SOCKET           = 1 << 2;
        const SEND_THREAD      = 1 << 3;
        const RECV_THREAD      = 1 << 4;
        const THREAD_CLOSE     = 1 << 5;
        const SIGNAL_CLOSE     = 1 << 6;
        const CONNECT_FINISHED = 1 << 7;
        const MAIN_THREAD      = 1 << 8;
    }
}

impl DisconnectFlags {
    /// Both sides have requested a close (local app code and/or the protocol peer).
    pub const CLOSE_FLAGS: DisconnectFlags = DisconnectFlags::LOCAL_CLOSE.union(DisconnectFlags::REMOTE_CLOSE);

    /// The full set of bits that must all be set before cleanup runs. `SIGNAL_CLOSE` is
    /// deliberately excluded: it's a request to the close worker, not a completion signal
    /// (the close worker's own work completes via `THREAD_CLOSE`).
    pub const ALL: DisconnectFlags = DisconnectFlags::SOCKET
        .union(DisconnectFlags::LOCAL_CLOSE)
        .union(DisconnectFlags::REMOTE_CLOSE)
        .union(DisconnectFlags::SEND_THREAD)
        .union(DisconnectFlags::RECV_THREAD)
        .union(DisconnectFlags::THREAD_CLOSE)
        .union(DisconnectFlags::CONNECT_FINISHED)
        .union(DisconnectFlags::MAIN_THREAD);
}
