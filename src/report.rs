//! Report Values
//!
//! Immutable snapshots produced by a reporter. Encoders for monitoring
//! backends read call reports through [`ProfiledCallReport::FIELDS`] rather
//! than walking struct fields.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::identity::Identity;

/// Accessor returning one numeric field of a call report
pub type FieldAccessor = fn(&ProfiledCallReport) -> f64;

/// Snapshot of one identity's aggregate for a single reporting window
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfiledCallReport {
    pub identity: Identity,

    /// Length of the reporting window in milliseconds
    pub reporting_time_avg: u64,

    pub start_sum: u64,
    pub stop_sum: u64,

    /// Starts per second over the window
    pub start_throughput_avg: f64,
    /// Stops per second over the window
    pub stop_throughput_avg: f64,
    pub start_throughput_per_second_max: u64,
    pub stop_throughput_per_second_max: u64,

    pub latency_min: u64,
    pub latency_max: u64,
    pub latency_avg: u64,
    /// Percentile -> bucket upper boundary (or observed max past the last bucket)
    pub latency_percentile: BTreeMap<u8, u64>,

    pub payload_min: i64,
    pub payload_max: i64,
    pub payload_sum: i64,
    pub payload_avg: f64,
    /// Payload per second over the window
    pub payload_throughput_avg: f64,

    /// Highest number of concurrently running calls during the window
    pub active_calls_count_max: u64,
    /// Age in milliseconds of the oldest call still running at snapshot time
    pub active_calls_latency_max: u64,
}

impl ProfiledCallReport {
    /// Numeric fields in export order
    pub const FIELDS: &'static [(&'static str, FieldAccessor)] = &[
        ("reportingTimeAvg", |r: &Self| r.reporting_time_avg as f64),
        ("startSum", |r: &Self| r.start_sum as f64),
        ("stopSum", |r: &Self| r.stop_sum as f64),
        ("startThroughputAvg", |r: &Self| r.start_throughput_avg),
        ("stopThroughputAvg", |r: &Self| r.stop_throughput_avg),
        ("startThroughputPerSecondMax", |r: &Self| {
            r.start_throughput_per_second_max as f64
        }),
        ("stopThroughputPerSecondMax", |r: &Self| {
            r.stop_throughput_per_second_max as f64
        }),
        ("latencyMin", |r: &Self| r.latency_min as f64),
        ("latencyMax", |r: &Self| r.latency_max as f64),
        ("latencyAvg", |r: &Self| r.latency_avg as f64),
        ("payloadMin", |r: &Self| r.payload_min as f64),
        ("payloadMax", |r: &Self| r.payload_max as f64),
        ("payloadSum", |r: &Self| r.payload_sum as f64),
        ("payloadAvg", |r: &Self| r.payload_avg),
        ("payloadThroughputAvg", |r: &Self| r.payload_throughput_avg),
        ("activeCallsCountMax", |r: &Self| r.active_calls_count_max as f64),
        ("activeCallsLatencyMax", |r: &Self| r.active_calls_latency_max as f64),
    ];

    /// Zeroed report for an identity
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            reporting_time_avg: 0,
            start_sum: 0,
            stop_sum: 0,
            start_throughput_avg: 0.0,
            stop_throughput_avg: 0.0,
            start_throughput_per_second_max: 0,
            stop_throughput_per_second_max: 0,
            latency_min: 0,
            latency_max: 0,
            latency_avg: 0,
            latency_percentile: BTreeMap::new(),
            payload_min: 0,
            payload_max: 0,
            payload_sum: 0,
            payload_avg: 0.0,
            payload_throughput_avg: 0.0,
            active_calls_count_max: 0,
            active_calls_latency_max: 0,
        }
    }

    /// True if the window saw no starts, no stops and no running calls
    pub fn is_empty(&self) -> bool {
        self.start_sum == 0 && self.stop_sum == 0 && self.active_calls_count_max == 0
    }

    /// All numeric fields followed by `latencyPercentile{p}` entries
    pub fn metrics(&self) -> Vec<(String, f64)> {
        let mut metrics: Vec<(String, f64)> = Self::FIELDS
            .iter()
            .map(|(name, accessor)| (name.to_string(), accessor(self)))
            .collect();
        metrics.extend(
            self.latency_percentile
                .iter()
                .map(|(p, v)| (format!("latencyPercentile{}", p), *v as f64)),
        );
        metrics
    }
}

/// Result of one `build_report_and_reset`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilerReport {
    pub timestamp: DateTime<Utc>,
    /// Indicator values keyed by identity
    pub indicators: BTreeMap<Identity, i64>,
    /// Call reports ordered by identity
    pub profiler_call_reports: Vec<ProfiledCallReport>,
}

impl ProfilerReport {
    pub fn is_empty(&self) -> bool {
        self.indicators.is_empty() && self.profiler_call_reports.is_empty()
    }

    /// Find the call report for an identity
    pub fn call_report(&self, identity: &Identity) -> Option<&ProfiledCallReport> {
        self.profiler_call_reports
            .iter()
            .find(|r| r.identity == *identity)
    }
}

impl fmt::Display for ProfilerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ProfilerReport {}", self.timestamp.to_rfc3339())?;
        for (identity, value) in &self.indicators {
            writeln!(f, "  indicator {} = {}", identity, value)?;
        }
        for report in &self.profiler_call_reports {
            writeln!(
                f,
                "  call {} start={} stop={} latency[min={} avg={} max={}] percentiles={:?} active[max={} oldest={}ms]",
                report.identity,
                report.start_sum,
                report.stop_sum,
                report.latency_min,
                report.latency_avg,
                report.latency_max,
                report.latency_percentile,
                report.active_calls_count_max,
                report.active_calls_latency_max,
            )?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
