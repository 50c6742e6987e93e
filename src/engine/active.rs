//! Active Call Tracker
//!
//! Bounded registry of in-flight calls for one identity. Tracking is for
//! visibility (concurrency and the age of the oldest running call), not for
//! counting: calls that do not get a slot are still counted by the aggregate.
//!
//! # Bounds
//!
//! Every start registers a slot. Once the registry reaches twice the
//! configured capacity it is trimmed back to the `capacity` oldest calls, and
//! every snapshot trims it the same way. Once concurrent starts settle the
//! registry holds fewer than `2 * capacity` slots, and at least `capacity`
//! while that many calls are running.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

/// Registry of running calls keyed by call id
#[derive(Debug)]
pub struct ActiveCallTracker {
    capacity: Arc<AtomicUsize>,
    calls: DashMap<u64, Instant>,
    tracked: AtomicI64,
    trimming: AtomicBool,
    live: AtomicI64,
    live_max: AtomicI64,
}

impl ActiveCallTracker {
    /// `capacity` is shared with the profiler so it can be changed at runtime
    pub fn new(capacity: Arc<AtomicUsize>) -> Self {
        Self {
            capacity,
            calls: DashMap::new(),
            tracked: AtomicI64::new(0),
            trimming: AtomicBool::new(false),
            live: AtomicI64::new(0),
            live_max: AtomicI64::new(0),
        }
    }

    /// Register a started call
    pub fn start(&self, call_id: u64, started_at: Instant) {
        let live = self.live.fetch_add(1, Ordering::AcqRel) + 1;
        self.live_max.fetch_max(live, Ordering::AcqRel);

        let capacity = self.capacity.load(Ordering::Relaxed);
        if capacity == 0 {
            return;
        }

        if self.calls.insert(call_id, started_at).is_none() {
            let tracked = self.tracked.fetch_add(1, Ordering::SeqCst) + 1;
            if tracked >= capacity.saturating_mul(2) as i64 {
                self.trim_to(capacity);
            }
        }
    }

    /// Release a call's slot, whether it was stopped or closed
    pub fn finish(&self, call_id: u64) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        if self.calls.remove(&call_id).is_some() {
            self.tracked.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Number of calls currently holding a slot
    pub fn tracked(&self) -> usize {
        self.tracked.load(Ordering::Acquire).max(0) as usize
    }

    /// Calls started and not yet finished, tracked or not
    pub fn live(&self) -> i64 {
        self.live.load(Ordering::Acquire)
    }

    /// Maximum live count since the last snapshot; rebased to the current
    /// live count so the next window starts from an accurate baseline.
    pub fn take_live_max(&self) -> i64 {
        let live = self.live.load(Ordering::Acquire);
        self.live_max.swap(live, Ordering::AcqRel).max(live)
    }

    /// Age of the oldest tracked call, then keep only the oldest `capacity` calls
    pub fn take_longest_and_trim(&self, now: Instant) -> Duration {
        let capacity = self.capacity.load(Ordering::Relaxed);
        if capacity == 0 {
            if self.tracked() > 0 {
                self.trim_to(0);
            }
            return Duration::ZERO;
        }

        let oldest = self.calls.iter().map(|entry| *entry.value()).min();
        self.trim_to(capacity);

        oldest
            .map(|started_at| now.saturating_duration_since(started_at))
            .unwrap_or(Duration::ZERO)
    }

    /// Keep the `capacity` oldest calls. A start that finds a trim in
    /// progress skips trimming; the running trim re-checks the bound after
    /// releasing the flag, so the registry settles below `2 * capacity`.
    fn trim_to(&self, capacity: usize) {
        loop {
            if self
                .trimming
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }

            let mut calls: Vec<(u64, Instant)> = self
                .calls
                .iter()
                .map(|entry| (*entry.key(), *entry.value()))
                .collect();

            if calls.len() > capacity {
                calls.sort_unstable_by_key(|(id, started_at)| (*started_at, *id));
                let mut removed = 0;
                for (id, _) in &calls[capacity..] {
                    if self.calls.remove(id).is_some() {
                        self.tracked.fetch_sub(1, Ordering::AcqRel);
                        removed += 1;
                    }
                }
                debug!(removed, capacity, "Trimmed active call registry");
            }

            self.trimming.store(false, Ordering::SeqCst);

            let limit = capacity.saturating_mul(2) as i64;
            if capacity == 0 || self.tracked.load(Ordering::SeqCst) < limit {
                return;
            }
        }
    }

    /// True if the given call holds a slot
    pub fn is_tracked(&self, call_id: u64) -> bool {
        self.calls.contains_key(&call_id)
    }
}

// =============================================================================
// Tests
// =============================================================================
