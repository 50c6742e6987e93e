//! Profiler Reporter
//!
//! Each reporter owns a map of call aggregates fed by the engine and builds
//! snapshots on demand.
//!
//! # Pruning
//!
//! Writers keep the map shard read-locked for the whole update, and pruning
//! removes an aggregate only through `remove_if` re-checking that it is still
//! idle under the shard write lock. An update therefore either lands in the
//! aggregate before pruning looks at it (and keeps it alive) or runs after the
//! removal against a freshly created aggregate. No event is recorded into an
//! aggregate that is no longer reachable.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::aggregate::CallAggregate;
use super::dispatch::Engine;
use super::percentile::PercentileSettings;
use crate::identity::Identity;
use crate::labels::{LabelSticker, Labels, ReportFilter};
use crate::report::{ProfiledCallReport, ProfilerReport};

/// Aggregates and label sticker of one registered reporter
pub struct ReporterState {
    id: u64,
    aggregates: DashMap<Identity, Arc<CallAggregate>>,
    label_sticker: RwLock<Arc<dyn LabelSticker>>,
    percentile_settings: PercentileSettings,
    active_calls_to_track: Arc<AtomicUsize>,
}

impl ReporterState {
    pub(crate) fn new(
        id: u64,
        label_sticker: Arc<dyn LabelSticker>,
        percentile_settings: PercentileSettings,
        active_calls_to_track: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            id,
            aggregates: DashMap::new(),
            label_sticker: RwLock::new(label_sticker),
            percentile_settings,
            active_calls_to_track,
        }
    }

    /// Registration sequence number
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True if the call started after this reporter was registered
    pub fn saw_call(&self, call_id: u64) -> bool {
        call_id > self.id
    }

    pub fn label_sticker(&self) -> Arc<dyn LabelSticker> {
        self.label_sticker.read().clone()
    }

    pub fn set_label_sticker(&self, sticker: Arc<dyn LabelSticker>) {
        *self.label_sticker.write() = sticker;
    }

    pub fn aggregate_count(&self) -> usize {
        self.aggregates.len()
    }

    /// Apply `update` to the identity's aggregate, creating it on first use.
    ///
    /// Labels are computed before touching the map so a sticker never runs
    /// under a shard lock.
    pub(crate) fn update<F>(&self, identity: &Identity, now: Instant, now_ms: u64, update: F)
    where
        F: FnOnce(&CallAggregate),
    {
        if let Some(aggregate) = self.aggregates.get(identity) {
            update(aggregate.value().as_ref());
            return;
        }

        let labels = self.label_sticker().build_labels(identity);
        let aggregate = self
            .aggregates
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(self.new_aggregate(identity, labels, now, now_ms)))
            .downgrade();
        update(aggregate.value().as_ref());
    }

    fn new_aggregate(
        &self,
        identity: &Identity,
        labels: Labels,
        now: Instant,
        now_ms: u64,
    ) -> CallAggregate {
        trace!(reporter = self.id, identity = %identity, "Creating call aggregate");
        CallAggregate::new(
            identity.clone(),
            labels,
            &self.percentile_settings,
            self.active_calls_to_track.clone(),
            now,
            now_ms,
        )
    }

    /// Snapshot and reset every aggregate accepted by `filter`.
    ///
    /// Aggregates with nothing to report are dropped from the map.
    pub(crate) fn build_call_reports(
        &self,
        filter: Option<&ReportFilter>,
        now: Instant,
        now_ms: u64,
    ) -> Vec<ProfiledCallReport> {
        let selected: Vec<Arc<CallAggregate>> = self
            .aggregates
            .iter()
            .filter(|entry| filter.map_or(true, |f| f(entry.key(), entry.value().labels())))
            .map(|entry| entry.value().clone())
            .collect();

        let mut reports = Vec::with_capacity(selected.len());
        let mut pruned = 0usize;
        for aggregate in selected {
            let report = aggregate.build_report_and_reset(now, now_ms);
            if report.is_empty() {
                let removed = self.aggregates.remove_if(aggregate.identity(), |_, current| {
                    Arc::ptr_eq(current, &aggregate) && current.is_idle()
                });
                if removed.is_some() {
                    pruned += 1;
                }
                continue;
            }
            reports.push(report);
        }

        if pruned > 0 {
            debug!(reporter = self.id, pruned, "Pruned idle call aggregates");
        }

        reports.sort_by(|a, b| a.identity.cmp(&b.identity));
        reports
    }

    /// Tracked slot count of an identity's aggregate, if it exists
    pub fn tracked_active_calls(&self, identity: &Identity) -> Option<usize> {
        self.aggregates
            .get(identity)
            .map(|aggregate| aggregate.active_calls().tracked())
    }
}

// =============================================================================
// Public Handle
// =============================================================================

/// Handle for building reports from a profiler.
///
/// Dropping the handle closes it.
pub struct ProfilerReporter {
    engine: Arc<Engine>,
    state: Arc<ReporterState>,
    closed: AtomicBool,
}

impl ProfilerReporter {
    pub(crate) fn new(engine: Arc<Engine>, state: Arc<ReporterState>) -> Self {
        Self {
            engine,
            state,
            closed: AtomicBool::new(false),
        }
    }

    /// Snapshot every aggregate and indicator, resetting the aggregates
    pub fn build_report_and_reset(&self) -> ProfilerReport {
        self.build_report(None)
    }

    /// Snapshot only aggregates and indicators accepted by `filter`.
    ///
    /// Aggregates the filter rejects are left untouched.
    pub fn build_report_and_reset_with(&self, filter: &ReportFilter) -> ProfilerReport {
        self.build_report(Some(filter))
    }

    fn build_report(&self, filter: Option<&ReportFilter>) -> ProfilerReport {
        let now = Instant::now();
        let now_ms = self.engine.millis_at(now);

        let sticker = self.state.label_sticker();
        let indicators = self.engine.indicators().evaluate(sticker.as_ref(), filter);
        let profiler_call_reports = self.state.build_call_reports(filter, now, now_ms);

        ProfilerReport {
            timestamp: Utc::now(),
            indicators,
            profiler_call_reports,
        }
    }

    /// Replace the sticker for aggregates this reporter creates from now on
    pub fn set_label_sticker(&self, sticker: Arc<dyn LabelSticker>) {
        self.state.set_label_sticker(sticker);
    }

    /// Number of live aggregates in this reporter
    pub fn aggregate_count(&self) -> usize {
        self.state.aggregate_count()
    }

    /// Tracked active-call slots held for `identity`
    pub fn tracked_active_calls(&self, identity: &Identity) -> usize {
        self.state.tracked_active_calls(identity).unwrap_or(0)
    }

    /// Stop receiving events. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.engine.unregister_reporter(self.state.id());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for ProfilerReporter {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ProfilerReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfilerReporter")
            .field("id", &self.state.id())
            .field("aggregates", &self.state.aggregate_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{contains_label, not_contains_label_name};

    fn engine() -> Arc<Engine> {
        Arc::new(Engine::new(PercentileSettings::default(), 4))
    }

    fn rate_sticker() -> Arc<dyn LabelSticker> {
        Arc::new(|identity: &Identity| {
            let mut labels = Labels::new();
            if identity.name().starts_with("fast") {
                labels.insert("rate".to_string(), "1".to_string());
            }
            labels
        })
    }

    #[test]
    fn test_reports_are_sorted_by_identity() {
        let engine = engine();
        let reporter = engine.create_reporter();
        for name in ["zeta", "alpha", "mid"] {
            engine.record_call(&Identity::new(name), 1, 1);
        }

        let report = reporter.build_report_and_reset();
        let names: Vec<&str> = report
            .profiler_call_reports
            .iter()
            .map(|r| r.identity.name())
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_idle_aggregates_are_pruned() {
        let engine = engine();
        let reporter = engine.create_reporter();
        engine.record_call(&Identity::new("once"), 1, 1);

        assert_eq!(reporter.build_report_and_reset().profiler_call_reports.len(), 1);
        assert_eq!(reporter.aggregate_count(), 1);

        assert!(reporter.build_report_and_reset().profiler_call_reports.is_empty());
        assert_eq!(reporter.aggregate_count(), 0);
    }

    #[test]
    fn test_running_call_is_not_pruned() {
        let engine = engine();
        let reporter = engine.create_reporter();
        let identity = Identity::new("long");
        let (id, started_at) = engine.record_start(&identity);

        reporter.build_report_and_reset();
        let report = reporter.build_report_and_reset();
        assert_eq!(report.profiler_call_reports.len(), 1);
        assert_eq!(report.profiler_call_reports[0].active_calls_count_max, 1);
        assert_eq!(reporter.aggregate_count(), 1);

        engine.record_stop(&identity, id, started_at, 1);
        let report = reporter.build_report_and_reset();
        assert_eq!(report.profiler_call_reports[0].stop_sum, 1);
    }

    #[test]
    fn test_filter_leaves_other_aggregates_untouched() {
        let engine = engine();
        let reporter = engine.create_reporter();
        reporter.set_label_sticker(rate_sticker());

        engine.record_call(&Identity::new("fast.call"), 1, 1);
        engine.record_call(&Identity::new("slow.call"), 1, 1);

        let fast = reporter.build_report_and_reset_with(&contains_label("rate", "1"));
        assert_eq!(fast.profiler_call_reports.len(), 1);
        assert_eq!(fast.profiler_call_reports[0].identity.name(), "fast.call");

        let slow = reporter.build_report_and_reset_with(&not_contains_label_name("rate"));
        assert_eq!(slow.profiler_call_reports.len(), 1);
        assert_eq!(slow.profiler_call_reports[0].identity.name(), "slow.call");
        assert_eq!(slow.profiler_call_reports[0].stop_sum, 1);
    }

    #[test]
    fn test_sticker_change_does_not_relabel_existing_aggregates() {
        let engine = engine();
        let reporter = engine.create_reporter();
        engine.record_call(&Identity::new("fast.call"), 1, 1);

        reporter.set_label_sticker(rate_sticker());
        engine.record_call(&Identity::new("fast.call"), 1, 1);

        let report = reporter.build_report_and_reset_with(&contains_label("rate", "1"));
        assert!(report.profiler_call_reports.is_empty());
        let report = reporter.build_report_and_reset_with(&not_contains_label_name("rate"));
        assert_eq!(report.profiler_call_reports[0].stop_sum, 2);
    }

    #[test]
    fn test_indicators_follow_filter() {
        let engine = engine();
        let reporter = engine.create_reporter();
        reporter.set_label_sticker(rate_sticker());
        engine.attach_indicator(
            Identity::new("fast.gauge"),
            Arc::new(|| -> anyhow::Result<i64> { Ok(1) }),
        );
        engine.attach_indicator(
            Identity::new("slow.gauge"),
            Arc::new(|| -> anyhow::Result<i64> { Ok(2) }),
        );

        let report = reporter.build_report_and_reset_with(&contains_label("rate", "1"));
        assert_eq!(report.indicators.len(), 1);
        assert_eq!(report.indicators.get(&Identity::new("fast.gauge")), Some(&1));

        let report = reporter.build_report_and_reset();
        assert_eq!(report.indicators.len(), 2);
    }

    #[test]
    fn test_close_is_idempotent_and_unregisters() {
        let engine = engine();
        let reporter = engine.create_reporter();
        let other = engine.create_reporter();
        assert_eq!(engine.reporter_count(), 2);

        reporter.close();
        reporter.close();
        assert!(reporter.is_closed());
        assert_eq!(engine.reporter_count(), 1);

        engine.record_call(&Identity::new("after.close"), 1, 1);
        assert!(reporter.build_report_and_reset().profiler_call_reports.is_empty());

        drop(other);
        assert_eq!(engine.reporter_count(), 0);
    }
}
