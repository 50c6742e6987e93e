//! Report Sinks
//!
//! Destinations for scheduled reports. A sink error is logged by the
//! scheduler and never stops the next flush.

use tracing::info;

use crate::report::ProfilerReport;

/// Destination for a flushed report
pub trait ReportSink: Send + Sync {
    fn store(&self, report: ProfilerReport) -> anyhow::Result<()>;
}

impl<F> ReportSink for F
where
    F: Fn(ProfilerReport) -> anyhow::Result<()> + Send + Sync,
{
    fn store(&self, report: ProfilerReport) -> anyhow::Result<()> {
        self(report)
    }
}

/// Sink writing every call report and indicator as a structured log event
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl ReportSink for LoggingSink {
    fn store(&self, report: ProfilerReport) -> anyhow::Result<()> {
        for (identity, value) in &report.indicators {
            info!(indicator = %identity, value, "Indicator");
        }
        for call in &report.profiler_call_reports {
            info!(
                call = %call.identity,
                start_sum = call.start_sum,
                stop_sum = call.stop_sum,
                latency_min = call.latency_min,
                latency_avg = call.latency_avg,
                latency_max = call.latency_max,
                percentiles = ?call.latency_percentile,
                throughput = call.stop_throughput_avg,
                active_max = call.active_calls_count_max,
                active_latency_max = call.active_calls_latency_max,
                "Profiled call"
            );
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn empty_report() -> ProfilerReport {
        ProfilerReport {
            timestamp: Utc::now(),
            indicators: BTreeMap::new(),
            profiler_call_reports: Vec::new(),
        }
    }

    #[test]
    fn test_closure_sink() {
        let stored = Arc::new(Mutex::new(0));
        let counter = stored.clone();
        let sink = move |_report: ProfilerReport| -> anyhow::Result<()> {
            *counter.lock() += 1;
            Ok(())
        };

        sink.store(empty_report()).unwrap();
        sink.store(empty_report()).unwrap();
        assert_eq!(*stored.lock(), 2);
    }

    #[test]
    fn test_logging_sink_accepts_reports() {
        let mut report = empty_report();
        report
            .indicators
            .insert(crate::identity::Identity::new("gauge"), 1);
        assert!(LoggingSink.store(report).is_ok());
    }
}
