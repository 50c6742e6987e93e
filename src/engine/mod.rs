//! Aggregating Engine
//!
//! Concurrent aggregation of profiled calls and indicators.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              Engine                                  │
//! │  reporters (RwLock<Vec>)   indicators (DashMap)   label sticker      │
//! └───────────────┬──────────────────────────────────────────────────────┘
//!                 │ every start / stop / close / call is fanned out
//!       ┌─────────┴─────────┐
//!       ▼                   ▼
//! ┌──────────────┐   ┌──────────────┐
//! │ ReporterState│   │ ReporterState│   DashMap<Identity, Arc<CallAggregate>>
//! └──────┬───────┘   └──────────────┘
//!        ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ CallAggregate: counters │ PercentileAccumulator │ ActiveCallTracker  │
//! │                         │ MaxThroughputPerSecondAccumulator ×2       │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Hot Path
//!
//! Recording touches only atomics and takes shared locks: the engine's
//! reporter list, the aggregate map shard, and the aggregate's update lock.
//! Exclusive locks are taken when registering a reporter, when creating a
//! new aggregate, and by a snapshot on the one aggregate it is resetting.

mod active;
mod aggregate;
mod dispatch;
mod indicator;
mod percentile;
mod reporter;
mod throughput;

pub use active::ActiveCallTracker;
pub use aggregate::CallAggregate;
pub use dispatch::Engine;
pub use indicator::{IndicationProvider, IndicatorRegistry};
pub use percentile::{PercentileAccumulator, PercentileSettings};
pub use reporter::{ProfilerReporter, ReporterState};
pub use throughput::MaxThroughputPerSecondAccumulator;

/// Default number of running calls tracked per identity between reports
pub const DEFAULT_ACTIVE_CALLS_TO_TRACK: usize = 32;
