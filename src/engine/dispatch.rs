//! Aggregating Engine
//!
//! Shared state behind a profiler: registered reporters, indicators, the
//! process-wide label sticker and the monotonic clock. Every recorded event is
//! fanned out to each live reporter so independent reporters see the same
//! stream with independent reset cycles.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::debug;

use super::indicator::{IndicationProvider, IndicatorRegistry};
use super::percentile::PercentileSettings;
use super::reporter::{ProfilerReporter, ReporterState};
use crate::identity::Identity;
use crate::labels::{LabelSticker, NoopLabelSticker};

/// Engine shared by a profiler, its calls and its reporters
pub struct Engine {
    epoch: Instant,
    percentile_settings: PercentileSettings,
    active_calls_to_track: Arc<AtomicUsize>,

    reporters: RwLock<Vec<Arc<ReporterState>>>,
    indicators: IndicatorRegistry,
    label_sticker: RwLock<Arc<dyn LabelSticker>>,

    /// Shared sequence for call ids and reporter registration
    sequence: AtomicU64,
}

impl Engine {
    /// Create an engine with validated settings
    pub fn new(percentile_settings: PercentileSettings, active_calls_to_track: usize) -> Self {
        Self {
            epoch: Instant::now(),
            percentile_settings,
            active_calls_to_track: Arc::new(AtomicUsize::new(active_calls_to_track)),
            reporters: RwLock::new(Vec::new()),
            indicators: IndicatorRegistry::new(),
            label_sticker: RwLock::new(Arc::new(NoopLabelSticker)),
            sequence: AtomicU64::new(1),
        }
    }

    /// Milliseconds elapsed on the engine's monotonic clock
    pub fn millis_at(&self, instant: Instant) -> u64 {
        instant.saturating_duration_since(self.epoch).as_millis() as u64
    }

    pub fn percentile_settings(&self) -> &PercentileSettings {
        &self.percentile_settings
    }

    pub fn active_calls_to_track(&self) -> usize {
        self.active_calls_to_track.load(Ordering::Relaxed)
    }

    /// Change tracker capacity for all existing and future aggregates; 0 disables tracking
    pub fn set_active_calls_to_track(&self, capacity: usize) {
        self.active_calls_to_track.store(capacity, Ordering::Relaxed);
    }

    // =========================================================================
    // Recording
    // =========================================================================

    /// Register a started call with every reporter and return its id.
    ///
    /// The id is drawn while the reporter list is read-locked, so a reporter
    /// registered later always holds a larger sequence number than any call
    /// whose start it missed.
    pub fn record_start(&self, identity: &Identity) -> (u64, Instant) {
        let reporters = self.reporters.read();
        let call_id = self.sequence.fetch_add(1, Ordering::Relaxed);
        let started_at = Instant::now();
        let now_ms = self.millis_at(started_at);
        for reporter in reporters.iter() {
            reporter.update(identity, started_at, now_ms, |aggregate| {
                aggregate.start(call_id, started_at, now_ms)
            });
        }
        (call_id, started_at)
    }

    /// Record completion of a call started with [`Engine::record_start`]
    pub fn record_stop(&self, identity: &Identity, call_id: u64, started_at: Instant, payload: i64) {
        let now = Instant::now();
        let now_ms = self.millis_at(now);
        let latency_ms = now.saturating_duration_since(started_at).as_millis() as u64;
        for reporter in self.reporters.read().iter() {
            reporter.update(identity, now, now_ms, |aggregate| {
                if reporter.saw_call(call_id) {
                    aggregate.stop(call_id, latency_ms, payload, now_ms)
                } else {
                    aggregate.call(latency_ms, payload, now_ms)
                }
            });
        }
    }

    /// Release a started call without recording a stop
    pub fn record_close(&self, identity: &Identity, call_id: u64) {
        let now = Instant::now();
        let now_ms = self.millis_at(now);
        for reporter in self.reporters.read().iter() {
            if reporter.saw_call(call_id) {
                reporter.update(identity, now, now_ms, |aggregate| aggregate.close(call_id));
            }
        }
    }

    /// Record a start and stop in one step
    pub fn record_call(&self, identity: &Identity, latency_ms: u64, payload: i64) {
        let now = Instant::now();
        let now_ms = self.millis_at(now);
        for reporter in self.reporters.read().iter() {
            reporter.update(identity, now, now_ms, |aggregate| {
                aggregate.call(latency_ms, payload, now_ms)
            });
        }
    }

    // =========================================================================
    // Indicators and labels
    // =========================================================================

    pub fn attach_indicator(&self, identity: Identity, provider: Arc<dyn IndicationProvider>) {
        debug!(indicator = %identity, "Attaching indicator");
        self.indicators.attach(identity, provider);
    }

    pub fn detach_indicator(&self, identity: &Identity) -> bool {
        self.indicators.detach(identity)
    }

    pub fn indicators(&self) -> &IndicatorRegistry {
        &self.indicators
    }

    pub fn label_sticker(&self) -> Arc<dyn LabelSticker> {
        self.label_sticker.read().clone()
    }

    /// Replace the sticker for this engine and all its reporters.
    ///
    /// Existing aggregates keep their labels.
    pub fn set_label_sticker(&self, sticker: Arc<dyn LabelSticker>) {
        *self.label_sticker.write() = sticker.clone();
        for reporter in self.reporters.read().iter() {
            reporter.set_label_sticker(sticker.clone());
        }
    }

    // =========================================================================
    // Reporters
    // =========================================================================

    /// Register a new reporter that sees every call recorded from now on
    pub fn create_reporter(self: &Arc<Self>) -> ProfilerReporter {
        let state = {
            let mut reporters = self.reporters.write();
            let registered_at = self.sequence.fetch_add(1, Ordering::Relaxed);
            let state = Arc::new(ReporterState::new(
                registered_at,
                self.label_sticker(),
                self.percentile_settings.clone(),
                self.active_calls_to_track.clone(),
            ));
            reporters.push(state.clone());
            state
        };
        debug!(reporter = state.id(), "Registered reporter");
        ProfilerReporter::new(self.clone(), state)
    }

    pub(crate) fn unregister_reporter(&self, reporter_id: u64) {
        self.reporters.write().retain(|r| r.id() != reporter_id);
        debug!(reporter = reporter_id, "Unregistered reporter");
    }

    pub fn reporter_count(&self) -> usize {
        self.reporters.read().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
