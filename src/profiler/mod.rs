//! Profiler
//!
//! Entry point for instrumented code. A [`Profiler`] is a cheap cloneable
//! handle over one [`Engine`]; clones share aggregates, indicators and
//! reporters.
//!
//! # Usage
//!
//! ```rust,ignore
//! let profiler = Profiler::new();
//! let reporter = profiler.create_reporter();
//!
//! let query = profiler.profiled_call("db.query");
//! let rows = query.profile(|| run_query());
//!
//! profiler.attach_indicator("pool.idle", move || Ok(pool.idle() as i64));
//! let report = reporter.build_report_and_reset();
//! ```

mod call;
mod prefixed;

pub use call::{ActiveCall, ProfiledCall, DEFAULT_PAYLOAD};
pub use prefixed::PrefixedProfiler;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::{
    Engine, IndicationProvider, PercentileSettings, ProfilerReporter,
    DEFAULT_ACTIVE_CALLS_TO_TRACK,
};
use crate::error::Result;
use crate::identity::Identity;
use crate::labels::LabelSticker;

// =============================================================================
// Settings
// =============================================================================

/// Profiler construction settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfilerSettings {
    /// Latency percentiles and buckets applied to every identity
    pub percentile_settings: PercentileSettings,
    /// Running calls tracked per identity between reports; 0 disables tracking
    pub active_calls_to_track: usize,
}

impl Default for ProfilerSettings {
    fn default() -> Self {
        Self {
            percentile_settings: PercentileSettings::default(),
            active_calls_to_track: DEFAULT_ACTIVE_CALLS_TO_TRACK,
        }
    }
}

// =============================================================================
// Profiler
// =============================================================================

/// Aggregating profiler handle
#[derive(Clone)]
pub struct Profiler {
    engine: Arc<Engine>,
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Profiler {
    /// Profiler with default percentile settings
    pub fn new() -> Self {
        let settings = ProfilerSettings::default();
        Self {
            engine: Arc::new(Engine::new(
                settings.percentile_settings,
                settings.active_calls_to_track,
            )),
        }
    }

    /// Profiler with validated settings
    pub fn with_settings(settings: ProfilerSettings) -> Result<Self> {
        settings.percentile_settings.validate()?;
        info!(
            percentiles = ?settings.percentile_settings.percentiles,
            buckets = settings.percentile_settings.buckets.len(),
            active_calls_to_track = settings.active_calls_to_track,
            "Creating profiler"
        );
        Ok(Self {
            engine: Arc::new(Engine::new(
                settings.percentile_settings,
                settings.active_calls_to_track,
            )),
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Handle for the named operation
    pub fn profiled_call(&self, identity: impl Into<Identity>) -> ProfiledCall {
        ProfiledCall::new(self.engine.clone(), identity.into())
    }

    /// Start a call; shorthand for `profiled_call(identity).start()`
    pub fn start(&self, identity: impl Into<Identity>) -> ActiveCall {
        self.profiled_call(identity).start()
    }

    /// Record a completed zero-latency call
    pub fn call(&self, identity: impl Into<Identity>) {
        self.profiled_call(identity).call();
    }

    /// Run `f` as one call of `identity`
    pub fn profile<R>(&self, identity: impl Into<Identity>, f: impl FnOnce() -> R) -> R {
        self.profiled_call(identity).profile(f)
    }

    /// Attach a closure indicator, replacing any existing one with the same identity
    pub fn attach_indicator<F>(&self, identity: impl Into<Identity>, provider: F)
    where
        F: Fn() -> anyhow::Result<i64> + Send + Sync + 'static,
    {
        self.engine.attach_indicator(identity.into(), Arc::new(provider));
    }

    /// Attach an indicator implemented on a custom type
    pub fn attach_indicator_provider(
        &self,
        identity: impl Into<Identity>,
        provider: Arc<dyn IndicationProvider>,
    ) {
        self.engine.attach_indicator(identity.into(), provider);
    }

    /// Remove an indicator; returns false if none was attached
    pub fn detach_indicator(&self, identity: impl Into<Identity>) -> bool {
        self.engine.detach_indicator(&identity.into())
    }

    /// Replace the label sticker of this profiler and all its reporters.
    ///
    /// Aggregates that already exist keep their labels.
    pub fn set_label_sticker(&self, sticker: impl LabelSticker + 'static) {
        self.engine.set_label_sticker(Arc::new(sticker));
    }

    /// Register a reporter that sees every call recorded from now on
    pub fn create_reporter(&self) -> ProfilerReporter {
        self.engine.create_reporter()
    }

    /// Running calls tracked per identity between reports; 0 disables tracking
    pub fn set_number_of_active_calls_to_track(&self, count: usize) -> &Self {
        self.engine.set_active_calls_to_track(count);
        self
    }

    pub fn number_of_active_calls_to_track(&self) -> usize {
        self.engine.active_calls_to_track()
    }
}

impl std::fmt::Debug for Profiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profiler")
            .field("reporters", &self.engine.reporter_count())
            .field("indicators", &self.engine.indicators().len())
            .field(
                "active_calls_to_track",
                &self.engine.active_calls_to_track(),
            )
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::labels::{contains_label, Labels, RegexpLabelSticker};
    use assert_matches::assert_matches;

    #[test]
    fn test_settings_defaults_from_json() {
        let settings: ProfilerSettings =
            serde_json::from_str(r#"{"activeCallsToTrack": 5}"#).unwrap();
        assert_eq!(settings.active_calls_to_track, 5);
        assert_eq!(settings.percentile_settings, PercentileSettings::default());

        let profiler = Profiler::with_settings(settings).unwrap();
        assert_eq!(profiler.number_of_active_calls_to_track(), 5);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let settings = ProfilerSettings {
            percentile_settings: PercentileSettings {
                percentiles: vec![50],
                buckets: vec![10, 5],
            },
            ..ProfilerSettings::default()
        };
        assert_matches!(
            Profiler::with_settings(settings),
            Err(Error::InvalidPercentileSettings(_))
        );
    }

    #[test]
    fn test_clones_share_state() {
        let profiler = Profiler::new();
        let reporter = profiler.create_reporter();
        let clone = profiler.clone();

        profiler.call("shared");
        clone.call("shared");

        let report = reporter.build_report_and_reset();
        assert_eq!(report.profiler_call_reports[0].stop_sum, 2);
    }

    #[test]
    fn test_indicators() {
        let profiler = Profiler::new();
        let reporter = profiler.create_reporter();
        profiler.attach_indicator("gauge", || Ok(11));

        let report = reporter.build_report_and_reset();
        assert_eq!(report.indicators.get(&Identity::new("gauge")), Some(&11));

        assert!(profiler.detach_indicator("gauge"));
        assert!(reporter.build_report_and_reset().indicators.is_empty());
    }

    #[test]
    fn test_label_sticker_applies_to_new_aggregates() {
        let profiler = Profiler::new();
        let reporter = profiler.create_reporter();
        profiler.set_label_sticker(
            RegexpLabelSticker::new("logRate", vec![("80000", vec![".*HBase.*"])]).unwrap(),
        );

        profiler.call("HBase_scan");
        profiler.call("other");

        let report = reporter.build_report_and_reset_with(&contains_label("logRate", "80000"));
        assert_eq!(report.profiler_call_reports.len(), 1);
        assert_eq!(report.profiler_call_reports[0].identity.name(), "HBase_scan");
    }

    #[test]
    fn test_reporter_created_after_sticker_uses_it() {
        let profiler = Profiler::new();
        profiler.set_label_sticker(|_: &Identity| {
            Labels::from([("env".to_string(), "test".to_string())])
        });
        let reporter = profiler.create_reporter();
        profiler.call("op");

        let report = reporter.build_report_and_reset_with(&contains_label("env", "test"));
        assert_eq!(report.profiler_call_reports.len(), 1);
    }

    #[test]
    fn test_active_call_tracking_can_be_disabled() {
        let profiler = Profiler::new();
        let reporter = profiler.create_reporter();
        profiler.set_number_of_active_calls_to_track(0);

        let running: Vec<_> = (0..10).map(|_| profiler.start("op")).collect();
        assert_eq!(reporter.tracked_active_calls(&Identity::new("op")), 0);

        let report = reporter.build_report_and_reset();
        assert_eq!(report.profiler_call_reports[0].active_calls_count_max, 10);
        assert_eq!(report.profiler_call_reports[0].active_calls_latency_max, 0);
        running.into_iter().for_each(ActiveCall::stop);
    }
}
