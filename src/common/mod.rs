mod ark;
mod coarse_clock;

pub use ark::{Ark, AtomicRefCounted};
pub use coarse_clock::{coarse_monotonic_now, coarse_monotonic_clock_updater};
