//! Max Throughput Per Second
//!
//! Counts events in one-second windows and keeps the highest window count
//! seen since the last reset. Windows roll lazily on the next event.

use std::sync::atomic::{AtomicU64, Ordering};

const ONE_SECOND_MS: u64 = 1_000;

/// Lock-free per-second throughput maximum
#[derive(Debug)]
pub struct MaxThroughputPerSecondAccumulator {
    max_per_second: AtomicU64,
    window_events: AtomicU64,
    window_start_ms: AtomicU64,
}

impl MaxThroughputPerSecondAccumulator {
    /// Start the first window at `now_ms`
    pub fn new(now_ms: u64) -> Self {
        Self {
            max_per_second: AtomicU64::new(0),
            window_events: AtomicU64::new(0),
            window_start_ms: AtomicU64::new(now_ms),
        }
    }

    /// Add `events` at `now_ms`, closing the current window if a second has passed
    pub fn record(&self, now_ms: u64, events: u64) {
        self.window_events.fetch_add(events, Ordering::Relaxed);

        let start = self.window_start_ms.load(Ordering::Relaxed);
        if start + ONE_SECOND_MS <= now_ms
            && self
                .window_start_ms
                .compare_exchange(start, now_ms, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            let closed = self.window_events.swap(0, Ordering::Relaxed);
            self.max_per_second.fetch_max(closed, Ordering::Relaxed);
        }
    }

    /// Highest per-second count since the last call, including the open window.
    ///
    /// The open window is drained and a fresh one starts at `now_ms`, so no
    /// event counts toward two resets. Callers exclude concurrent `record`s.
    pub fn get_and_reset(&self, now_ms: u64) -> u64 {
        let open = self.window_events.swap(0, Ordering::Relaxed);
        self.window_start_ms.store(now_ms, Ordering::Relaxed);
        self.max_per_second.swap(0, Ordering::Relaxed).max(open)
    }
}

// =============================================================================
// Tests
// =============================================================================
