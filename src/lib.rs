//! Aggregating Profiler
//!
//! In-process instrumentation engine. Application code marks the start and
//! stop of named calls and publishes indicators; the engine aggregates them
//! concurrently and produces consistent snapshot reports on demand, resetting
//! its counters for the next interval.
//!
//! # Architecture
//!
//! ```text
//! instrumented code ──▶ Profiler ──▶ Engine ──▶ CallAggregate (per reporter, per identity)
//!                                                     │
//!            SelectiveRateReporter ── tick ──▶ build_report_and_reset(filter)
//!                                                     │
//!                                                     ▼
//!                                          ProfilerReport ──▶ ReportSink
//! ```
//!
//! # Modules
//!
//! - [`identity`] - Metric identity (name + ordered tags)
//! - [`labels`] - Label stickers and report filters
//! - [`engine`] - Aggregates, percentile histograms, active-call tracking, reporters
//! - [`profiler`] - Recording API: profiled calls, indicators, prefixed profiler
//! - [`report`] - Immutable report values
//! - [`scheduler`] - Selective-rate periodic reporting with hot reload
//! - [`error`] - Error types

pub mod engine;
pub mod error;
pub mod identity;
pub mod labels;
pub mod profiler;
pub mod report;
pub mod scheduler;

// Re-export commonly used types
pub use engine::{IndicationProvider, PercentileSettings, ProfilerReporter};
pub use error::{Error, Result};
pub use identity::{normalize_name, Identity};
pub use labels::{
    contains_label, not_contains_label, not_contains_label_name, LabelSticker, Labels,
    NoopLabelSticker, RegexpLabelSticker, ReportFilter,
};
pub use profiler::{ActiveCall, PrefixedProfiler, ProfiledCall, Profiler, ProfilerSettings};
pub use report::{ProfiledCallReport, ProfilerReport};
pub use scheduler::{LoggingSink, ReportSink, SelectiveRateConfig, SelectiveRateReporter};
