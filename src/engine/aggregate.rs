//! Call Aggregate
//!
//! Per-identity counters updated by every profiled call.
//!
//! # Consistency
//!
//! Writers hold the aggregate's update lock in shared mode and touch only
//! atomics, so recording never waits on another writer. A snapshot takes the
//! same lock exclusively for the read-and-reset, so an event lands entirely in
//! one window: a stop never contributes its count to one report and its
//! latency to the next.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use super::active::ActiveCallTracker;
use super::percentile::{PercentileAccumulator, PercentileSettings};
use super::throughput::MaxThroughputPerSecondAccumulator;
use crate::identity::Identity;
use crate::labels::Labels;
use crate::report::ProfiledCallReport;

/// Mutable counters for one identity
#[derive(Debug)]
pub struct CallAggregate {
    identity: Identity,
    labels: Labels,

    update_lock: RwLock<()>,
    window_start: Mutex<Instant>,

    start_sum: AtomicU64,
    stop_sum: AtomicU64,

    latency_sum: AtomicU64,
    latency_min: AtomicU64,
    latency_max: AtomicU64,
    latency_percentile: PercentileAccumulator,

    payload_sum: AtomicI64,
    payload_min: AtomicI64,
    payload_max: AtomicI64,

    start_throughput: MaxThroughputPerSecondAccumulator,
    stop_throughput: MaxThroughputPerSecondAccumulator,

    active_calls: ActiveCallTracker,
}

impl CallAggregate {
    /// Create an empty aggregate whose reporting window starts now
    pub fn new(
        identity: Identity,
        labels: Labels,
        percentile_settings: &PercentileSettings,
        active_calls_to_track: Arc<AtomicUsize>,
        now: Instant,
        now_ms: u64,
    ) -> Self {
        Self {
            identity,
            labels,
            update_lock: RwLock::new(()),
            window_start: Mutex::new(now),
            start_sum: AtomicU64::new(0),
            stop_sum: AtomicU64::new(0),
            latency_sum: AtomicU64::new(0),
            latency_min: AtomicU64::new(u64::MAX),
            latency_max: AtomicU64::new(0),
            latency_percentile: PercentileAccumulator::new(percentile_settings),
            payload_sum: AtomicI64::new(0),
            payload_min: AtomicI64::new(i64::MAX),
            payload_max: AtomicI64::new(i64::MIN),
            start_throughput: MaxThroughputPerSecondAccumulator::new(now_ms),
            stop_throughput: MaxThroughputPerSecondAccumulator::new(now_ms),
            active_calls: ActiveCallTracker::new(active_calls_to_track),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Labels assigned when the aggregate was created
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn active_calls(&self) -> &ActiveCallTracker {
        &self.active_calls
    }

    /// Record a start of a call that will later be stopped or closed
    pub fn start(&self, call_id: u64, started_at: Instant, now_ms: u64) {
        let _guard = self.update_lock.read();
        self.start_sum.fetch_add(1, Ordering::Relaxed);
        self.start_throughput.record(now_ms, 1);
        self.active_calls.start(call_id, started_at);
    }

    /// Record a completed call that was started with [`CallAggregate::start`]
    pub fn stop(&self, call_id: u64, latency_ms: u64, payload: i64, now_ms: u64) {
        let _guard = self.update_lock.read();
        self.record_stop(latency_ms, payload, now_ms);
        self.active_calls.finish(call_id);
    }

    /// Release a started call without recording a stop
    pub fn close(&self, call_id: u64) {
        let _guard = self.update_lock.read();
        self.active_calls.finish(call_id);
    }

    /// Record a start and stop in one step
    pub fn call(&self, latency_ms: u64, payload: i64, now_ms: u64) {
        let _guard = self.update_lock.read();
        self.start_sum.fetch_add(1, Ordering::Relaxed);
        self.start_throughput.record(now_ms, 1);
        self.record_stop(latency_ms, payload, now_ms);
    }

    fn record_stop(&self, latency_ms: u64, payload: i64, now_ms: u64) {
        self.stop_sum.fetch_add(1, Ordering::Relaxed);
        self.stop_throughput.record(now_ms, 1);

        self.latency_sum.fetch_add(latency_ms, Ordering::Relaxed);
        self.latency_min.fetch_min(latency_ms, Ordering::Relaxed);
        self.latency_max.fetch_max(latency_ms, Ordering::Relaxed);
        self.latency_percentile.accumulate(latency_ms);

        self.payload_sum.fetch_add(payload, Ordering::Relaxed);
        self.payload_min.fetch_min(payload, Ordering::Relaxed);
        self.payload_max.fetch_max(payload, Ordering::Relaxed);
    }

    /// True if nothing was recorded since the last snapshot and no call is running
    pub fn is_idle(&self) -> bool {
        self.start_sum.load(Ordering::Acquire) == 0
            && self.stop_sum.load(Ordering::Acquire) == 0
            && self.active_calls.live() == 0
    }

    /// Extract the window's values and reset accumulators for the next window
    pub fn build_report_and_reset(&self, now: Instant, now_ms: u64) -> ProfiledCallReport {
        let _guard = self.update_lock.write();

        let elapsed_ms = {
            let mut window_start = self.window_start.lock();
            let elapsed = now.saturating_duration_since(*window_start);
            *window_start = now;
            elapsed.as_millis() as u64
        };
        let per_second = |value: f64| {
            if elapsed_ms == 0 {
                0.0
            } else {
                value * 1000.0 / elapsed_ms as f64
            }
        };

        let start_sum = self.start_sum.swap(0, Ordering::AcqRel);
        let stop_sum = self.stop_sum.swap(0, Ordering::AcqRel);

        let latency_sum = self.latency_sum.swap(0, Ordering::AcqRel);
        let latency_min = self.latency_min.swap(u64::MAX, Ordering::AcqRel);
        let latency_max = self.latency_max.swap(0, Ordering::AcqRel);
        let latency_percentile = self.latency_percentile.build_and_reset();

        let payload_sum = self.payload_sum.swap(0, Ordering::AcqRel);
        let payload_min = self.payload_min.swap(i64::MAX, Ordering::AcqRel);
        let payload_max = self.payload_max.swap(i64::MIN, Ordering::AcqRel);

        let mut report = ProfiledCallReport::new(self.identity.clone());
        report.reporting_time_avg = elapsed_ms;
        report.active_calls_count_max = self.active_calls.take_live_max().max(0) as u64;
        report.active_calls_latency_max =
            self.active_calls.take_longest_and_trim(now).as_millis() as u64;

        report.start_sum = start_sum;
        report.start_throughput_avg = per_second(start_sum as f64);
        report.start_throughput_per_second_max = self.start_throughput.get_and_reset(now_ms);
        report.stop_throughput_per_second_max = self.stop_throughput.get_and_reset(now_ms);

        if stop_sum == 0 {
            return report;
        }

        report.stop_sum = stop_sum;
        report.stop_throughput_avg = per_second(stop_sum as f64);

        report.latency_min = latency_min;
        report.latency_max = latency_max;
        report.latency_avg = latency_sum / stop_sum;
        report.latency_percentile = latency_percentile;

        report.payload_min = payload_min;
        report.payload_max = payload_max;
        report.payload_sum = payload_sum;
        report.payload_avg = payload_sum as f64 / stop_sum as f64;
        report.payload_throughput_avg = per_second(payload_sum as f64);

        report
    }
}

// =============================================================================
// Tests
// =============================================================================
