//! Selective-Rate Scheduling
//!
//! Periodic report extraction with per-identity flush rates and hot-reloadable
//! configuration.
//!
//! # Architecture
//!
//! ```text
//!  watch::Receiver<SelectiveRateConfig>
//!            │ changed()
//!            ▼
//!   ┌─────────────────┐   plan()    ┌──────────────────────────────────┐
//!   │   supervisor    │ ──────────▶ │ RegexpLabelSticker("logRate")    │
//!   └────────┬────────┘             │ groups: [(period, filter), ...]  │
//!            │ swap                 └──────────────────────────────────┘
//!            ▼
//!   ┌─────────────────┐  tick   ┌──────────────────────┐  store  ┌────────────┐
//!   │ task per period │ ──────▶ │ build_report_and_    │ ──────▶ │ ReportSink │
//!   │ + default task  │         │ reset_with(filter)   │         └────────────┘
//!   └─────────────────┘         └──────────────────────┘
//! ```

mod config;
mod selective;
mod sink;

pub use config::{
    ReportingSchedule, SelectiveRateConfig, DEFAULT_PERIOD_MS, MAX_PERIOD_MS, MIN_PERIOD_MS,
};
pub use selective::{plan, ReportingGroup, ReportingPlan, SelectiveRateReporter, RATE_LABEL};
pub use sink::{LoggingSink, ReportSink};
