//! Selective Rate Configuration
//!
//! ```json
//! {
//!   "defaultPeriodMs": 60000,
//!   "reportingSchedule": {
//!     "80000": [".*HBase_scanHasNext.*"]
//!   },
//!   "enableReporting": true
//! }
//! ```
//!
//! Every identity is flushed each `defaultPeriodMs` unless its rendered name
//! fully matches a pattern in `reportingSchedule`, in which case it is
//! flushed at that entry's period instead. Entries are checked in the order
//! they are declared and the first matching entry wins.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::labels::compile_full_match;

/// Shortest accepted reporting period
pub const MIN_PERIOD_MS: u64 = 10;

/// Longest accepted reporting period (24 hours)
pub const MAX_PERIOD_MS: u64 = 24 * 60 * 60 * 1_000;

/// Default flush period for identities without a scheduled rate
pub const DEFAULT_PERIOD_MS: u64 = 60_000;

/// Hot-reloadable scheduling configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectiveRateConfig {
    /// Flush period for identities matched by no schedule entry
    pub default_period_ms: u64,
    /// Period in milliseconds -> identity name patterns, in declared order
    pub reporting_schedule: ReportingSchedule,
    /// When false, snapshots are still taken on schedule but discarded
    pub enable_reporting: bool,
}

impl Default for SelectiveRateConfig {
    fn default() -> Self {
        Self {
            default_period_ms: DEFAULT_PERIOD_MS,
            reporting_schedule: ReportingSchedule::default(),
            enable_reporting: true,
        }
    }
}

impl SelectiveRateConfig {
    /// Config with only a default period
    pub fn with_default_period(default_period: Duration) -> Self {
        Self {
            default_period_ms: default_period.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Add a schedule entry
    pub fn schedule<I, S>(mut self, period: Duration, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reporting_schedule.insert(
            period.as_millis() as u64,
            patterns.into_iter().map(Into::into),
        );
        self
    }

    pub fn default_period(&self) -> Duration {
        Duration::from_millis(self.default_period_ms)
    }

    /// Check period bounds and pattern syntax
    pub fn validate(&self) -> Result<()> {
        check_period("defaultPeriodMs", self.default_period_ms)?;
        for (period, patterns) in self.reporting_schedule.iter() {
            check_period("reportingSchedule", period)?;
            if patterns.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "reportingSchedule entry {} has no patterns",
                    period
                )));
            }
            for pattern in patterns {
                compile_full_match(pattern)?;
            }
        }
        Ok(())
    }

    /// Parse and validate JSON
    pub fn from_json_str(input: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate YAML
    pub fn from_yaml_str(input: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("json") => Self::from_json_str(&content),
            other => Err(Error::ConfigParse(format!(
                "unsupported config extension {:?} for {}",
                other,
                path.display()
            ))),
        }
    }
}

// =============================================================================
// Reporting Schedule
// =============================================================================

/// Period -> patterns mapping that keeps the order entries were declared in.
///
/// Serialized as a map keyed by period in milliseconds. Declaring the same
/// period twice appends to the first entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportingSchedule {
    entries: Vec<(u64, Vec<String>)>,
}

impl ReportingSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append patterns for `period_ms`
    pub fn insert<I, S>(&mut self, period_ms: u64, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns = patterns.into_iter().map(Into::into);
        match self.entries.iter_mut().find(|(period, _)| *period == period_ms) {
            Some((_, existing)) => existing.extend(patterns),
            None => self.entries.push((period_ms, patterns.collect())),
        }
    }

    pub fn get(&self, period_ms: u64) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(period, _)| *period == period_ms)
            .map(|(_, patterns)| patterns.as_slice())
    }

    /// Entries in declared order
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[String])> + '_ {
        self.entries
            .iter()
            .map(|(period, patterns)| (*period, patterns.as_slice()))
    }

    /// Periods in declared order
    pub fn periods(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|(period, _)| *period)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for ReportingSchedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (period, patterns) in &self.entries {
            map.serialize_entry(period, patterns)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ReportingSchedule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(ScheduleVisitor)
    }
}

struct ScheduleVisitor;

impl<'de> Visitor<'de> for ScheduleVisitor {
    type Value = ReportingSchedule;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of period in milliseconds to name patterns")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
        let mut schedule = ReportingSchedule::new();
        while let Some((period, patterns)) = map.next_entry::<u64, Vec<String>>()? {
            schedule.insert(period, patterns);
        }
        Ok(schedule)
    }
}

fn check_period(field: &str, period_ms: u64) -> Result<()> {
    if !(MIN_PERIOD_MS..=MAX_PERIOD_MS).contains(&period_ms) {
        return Err(Error::InvalidConfig(format!(
            "{} period {}ms is outside [{}ms, {}ms]",
            field, period_ms, MIN_PERIOD_MS, MAX_PERIOD_MS
        )));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = SelectiveRateConfig::default();
        assert_eq!(config.default_period(), Duration::from_secs(60));
        assert!(config.reporting_schedule.is_empty());
        assert!(config.enable_reporting);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_json() {
        let config = SelectiveRateConfig::from_json_str(
            r#"{"defaultPeriodMs": 60000, "reportingSchedule": {"80000": [".*HBase.*"]}}"#,
        )
        .unwrap();
        assert_eq!(
            config.reporting_schedule.get(80_000),
            Some(&[".*HBase.*".to_string()][..])
        );
        assert!(config.enable_reporting);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
defaultPeriodMs: 30000
enableReporting: false
reportingSchedule:
  5000:
    - "db\\..*"
    - "cache\\..*"
"#;
        let config = SelectiveRateConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.default_period_ms, 30_000);
        assert!(!config.enable_reporting);
        assert_eq!(config.reporting_schedule.get(5_000).map(<[String]>::len), Some(2));
    }

    #[test]
    fn test_schedule_keeps_declared_order() {
        let config = SelectiveRateConfig::from_json_str(
            r#"{"reportingSchedule": {"80000": ["HBase.*"], "20000": [".*scan"], "50000": ["db"]}}"#,
        )
        .unwrap();
        assert_eq!(
            config.reporting_schedule.periods().collect::<Vec<_>>(),
            vec![80_000, 20_000, 50_000]
        );

        let yaml = "reportingSchedule:\n  9000: [\"a\"]\n  3000: [\"b\"]\n";
        let config = SelectiveRateConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(
            config.reporting_schedule.periods().collect::<Vec<_>>(),
            vec![9_000, 3_000]
        );
    }

    #[test]
    fn test_schedule_round_trips_through_json() {
        let config = SelectiveRateConfig::default()
            .schedule(Duration::from_secs(80), ["HBase.*"])
            .schedule(Duration::from_secs(20), [".*scan"])
            .schedule(Duration::from_secs(80), ["other"]);
        assert_eq!(config.reporting_schedule.len(), 2);
        assert_eq!(
            config.reporting_schedule.get(80_000).map(<[String]>::len),
            Some(2)
        );

        let json = serde_json::to_string(&config).unwrap();
        let parsed = SelectiveRateConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_period_bounds() {
        assert_matches!(
            SelectiveRateConfig::with_default_period(Duration::from_millis(5)).validate(),
            Err(Error::InvalidConfig(_))
        );
        assert_matches!(
            SelectiveRateConfig::default()
                .schedule(Duration::from_secs(25 * 3600), ["x"])
                .validate(),
            Err(Error::InvalidConfig(_))
        );
        assert!(SelectiveRateConfig::with_default_period(Duration::from_millis(10))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_invalid_pattern() {
        assert_matches!(
            SelectiveRateConfig::from_json_str(r#"{"reportingSchedule": {"1000": ["(oops"]}}"#),
            Err(Error::InvalidPattern { .. })
        );
    }

    #[test]
    fn test_malformed_input() {
        assert_matches!(
            SelectiveRateConfig::from_json_str("{not json"),
            Err(Error::ConfigParse(_))
        );
    }

    #[test]
    fn test_from_file() {
        let dir = std::env::temp_dir().join(format!("selective-rate-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("profiler.json");
        std::fs::write(&path, r#"{"defaultPeriodMs": 1000}"#).unwrap();

        let config = SelectiveRateConfig::from_file(&path).unwrap();
        assert_eq!(config.default_period_ms, 1_000);

        assert_matches!(
            SelectiveRateConfig::from_file(dir.join("missing.json")),
            Err(Error::Io(_))
        );
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
