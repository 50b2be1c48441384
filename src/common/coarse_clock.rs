use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::Relaxed;

use tokio::time::{interval, Instant, Duration};

const COARSE_CLOCK_GRANULARITY_SECONDS: u64 = 1;

static COARSE_CLOCK: AtomicU32 = AtomicU32::new(0);

/// A coarse-grained monotonic clock, accurate to about a second, used for idle/timeout
/// bookkeeping where a precise `Instant` would cost more than it's worth on every read.
pub fn coarse_monotonic_now() -> u32 {
    COARSE_CLOCK.load(Relaxed)
}

fn update_coarse_monotonic_clock(start: Instant) {
    let now = start.elapsed().as_secs() as u32;
    COARSE_CLOCK.store(now, Relaxed);
}

/// Background task that advances the coarse clock. Spawn once on the runtime.
pub async fn coarse_monotonic_clock_updater() {
    let start = Instant::now();
    let mut interval = interval(Duration::from_secs(COARSE_CLOCK_GRANULARITY_SECONDS));
    loop {
        interval.tick().await;
        update_coarse_monotonic_clock(start);
    }
}
