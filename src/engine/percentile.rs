//! Bucketed Percentile Accumulator
//!
//! Fixed-threshold histogram with O(log B) recording and approximate
//! percentile extraction at snapshot time.
//!
//! # Estimation
//!
//! Snapshot walks the buckets in ascending order keeping a running total.
//! Percentile `p` is the upper boundary of the first bucket where
//! `running * 100 >= p * total`. Samples above the last threshold land in an
//! overflow bucket; a percentile resolved there reports the observed maximum.
//!
//! The reported value is always greater than or equal to the true percentile.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Percentiles to report and latency bucket thresholds (milliseconds)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PercentileSettings {
    /// Percentiles in `0..=100`; 50 is the median
    pub percentiles: Vec<u8>,
    /// Strictly ascending bucket thresholds
    pub buckets: Vec<u64>,
}

impl Default for PercentileSettings {
    fn default() -> Self {
        Self {
            percentiles: vec![90, 95, 99],
            buckets: vec![
                3, 5, 10, 25, 50, 100, 250, 375, 500, 750, 1_000, 1_500, 3_000, 6_000, 12_000,
                30_000, 60_000,
            ],
        }
    }
}

impl PercentileSettings {
    /// Build and validate settings
    pub fn new(percentiles: Vec<u8>, buckets: Vec<u64>) -> Result<Self> {
        let settings = Self {
            percentiles,
            buckets,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Check percentile range and bucket ordering
    pub fn validate(&self) -> Result<()> {
        if self.buckets.is_empty() {
            return Err(Error::InvalidPercentileSettings(
                "at least one bucket is required".to_string(),
            ));
        }
        if let Some(p) = self.percentiles.iter().find(|p| **p > 100) {
            return Err(Error::InvalidPercentileSettings(format!(
                "percentile {} is outside 0..=100",
                p
            )));
        }
        if self.buckets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidPercentileSettings(format!(
                "buckets must be strictly ascending: {:?}",
                self.buckets
            )));
        }
        Ok(())
    }
}

/// Concurrent bucketed histogram
#[derive(Debug)]
pub struct PercentileAccumulator {
    percentiles: Vec<u8>,
    thresholds: Vec<u64>,
    /// One counter per threshold plus the overflow bucket
    counts: Vec<AtomicU64>,
    max: AtomicU64,
}

impl PercentileAccumulator {
    /// Create from settings assumed valid
    pub fn new(settings: &PercentileSettings) -> Self {
        let mut percentiles = settings.percentiles.clone();
        percentiles.sort_unstable();
        percentiles.dedup();

        let thresholds = settings.buckets.clone();
        let counts = (0..=thresholds.len()).map(|_| AtomicU64::new(0)).collect();

        Self {
            percentiles,
            thresholds,
            counts,
            max: AtomicU64::new(0),
        }
    }

    /// Record one sample in the first bucket whose threshold is `>= value`
    pub fn accumulate(&self, value: u64) {
        let index = self.thresholds.partition_point(|&t| t < value);
        self.counts[index].fetch_add(1, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    /// Estimate the configured percentiles and clear all counts.
    ///
    /// Returns an empty map when nothing was recorded.
    pub fn build_and_reset(&self) -> BTreeMap<u8, u64> {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.swap(0, Ordering::Relaxed))
            .collect();
        let observed_max = self.max.swap(0, Ordering::Relaxed);

        let total: u64 = counts.iter().sum();
        let mut report = BTreeMap::new();
        if total == 0 {
            return report;
        }

        let mut running = 0u64;
        let mut pending = self.percentiles.iter().peekable();

        for (index, count) in counts.iter().enumerate() {
            running += count;
            let boundary = self.thresholds.get(index).copied().unwrap_or(observed_max);

            while let Some(&&p) = pending.peek() {
                if running * 100 < u64::from(p) * total {
                    break;
                }
                report.insert(p, boundary);
                pending.next();
            }
        }

        report
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn accumulator(percentiles: Vec<u8>, buckets: Vec<u64>) -> PercentileAccumulator {
        PercentileAccumulator::new(&PercentileSettings::new(percentiles, buckets).unwrap())
    }

    fn sample_latencies() -> Vec<u64> {
        let mut measurements = vec![600; 6];
        measurements.extend([1000; 5]);
        measurements.push(42_000);
        measurements
    }

    #[test]
    fn test_values_within_bucket_boundaries() {
        let acc = accumulator(
            vec![50, 90, 99],
            vec![250, 500, 750, 1000, 1500, 3000, 6000, 30000, 60000],
        );
        sample_latencies().into_iter().for_each(|v| acc.accumulate(v));

        let report = acc.build_and_reset();
        assert_eq!(report, BTreeMap::from([(50, 750), (90, 1000), (99, 60_000)]));
    }

    #[test]
    fn test_two_percentiles_share_one_bucket() {
        let acc = accumulator(vec![90, 94, 99], vec![10, 20, 30, 40, 50]);

        // total 200: p90 -> 180th, p94 -> 188th, p99 -> 198th measurement
        (0..140).for_each(|_| acc.accumulate(5));
        (0..50).for_each(|_| acc.accumulate(22));
        (0..10).for_each(|_| acc.accumulate(41));

        let report = acc.build_and_reset();
        assert_eq!(report, BTreeMap::from([(90, 30), (94, 30), (99, 50)]));
    }

    #[test]
    fn test_overflow_reports_observed_maximum() {
        let acc = accumulator(vec![50, 90, 99], vec![250, 500, 750, 1000, 1500, 3000]);
        sample_latencies().into_iter().for_each(|v| acc.accumulate(v));

        let report = acc.build_and_reset();
        assert_eq!(report, BTreeMap::from([(50, 750), (90, 1000), (99, 42_000)]));
    }

    #[test]
    fn test_value_equal_to_threshold_lands_in_that_bucket() {
        let acc = accumulator(vec![100], vec![10, 20]);
        acc.accumulate(10);
        assert_eq!(acc.build_and_reset(), BTreeMap::from([(100, 10)]));
    }

    #[test]
    fn test_reset_clears_counts() {
        let acc = accumulator(vec![50], vec![10, 20]);
        acc.accumulate(15);
        assert_eq!(acc.build_and_reset(), BTreeMap::from([(50, 20)]));
        assert!(acc.build_and_reset().is_empty());
    }

    #[test]
    fn test_zero_percentile_is_first_bucket() {
        let acc = accumulator(vec![0], vec![10, 20]);
        acc.accumulate(15);
        assert_eq!(acc.build_and_reset(), BTreeMap::from([(0, 10)]));
    }

    #[test]
    fn test_settings_validation() {
        assert_matches!(
            PercentileSettings::new(vec![101], vec![1]),
            Err(Error::InvalidPercentileSettings(_))
        );
        assert_matches!(
            PercentileSettings::new(vec![50], vec![]),
            Err(Error::InvalidPercentileSettings(_))
        );
        assert_matches!(
            PercentileSettings::new(vec![50], vec![10, 10]),
            Err(Error::InvalidPercentileSettings(_))
        );
        assert!(PercentileSettings::default().validate().is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Property: every reported value is an upper bound of the exact percentile.
        #[test]
        fn prop_reported_value_bounds_exact_percentile(
            samples in prop::collection::vec(0u64..100_000, 1..500),
            p in 1u8..=100,
        ) {
            let settings = PercentileSettings {
                percentiles: vec![p],
                ..PercentileSettings::default()
            };
            let acc = PercentileAccumulator::new(&settings);
            samples.iter().for_each(|v| acc.accumulate(*v));

            let mut sorted = samples.clone();
            sorted.sort_unstable();
            let rank = ((sorted.len() as u64 * u64::from(p)) + 99) / 100;
            let exact = sorted[(rank.max(1) - 1) as usize];

            let report = acc.build_and_reset();
            prop_assert!(report[&p] >= exact);
            prop_assert!(report[&p] <= settings.buckets.last().copied().unwrap().max(*sorted.last().unwrap()));
        }

        /// Property: percentiles are monotonic in p.
        #[test]
        fn prop_percentiles_monotonic(samples in prop::collection::vec(0u64..100_000, 1..300)) {
            let settings = PercentileSettings {
                percentiles: vec![10, 50, 90, 99, 100],
                ..PercentileSettings::default()
            };
            let acc = PercentileAccumulator::new(&settings);
            samples.iter().for_each(|v| acc.accumulate(*v));

            let report = acc.build_and_reset();
            let values: Vec<u64> = report.values().copied().collect();
            prop_assert_eq!(values.len(), 5);
            prop_assert!(values.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
