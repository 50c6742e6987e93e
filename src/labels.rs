//! Labels and Label Stickers
//!
//! A label sticker maps an [`Identity`] to a set of labels at the moment the
//! identity's aggregate is created. Reporters use those labels to decide which
//! aggregates a filtered snapshot covers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::error::{Error, Result};
use crate::identity::Identity;

/// Labels attached to an aggregate or indicator
pub type Labels = HashMap<String, String>;

/// Assigns labels to identities
pub trait LabelSticker: Send + Sync {
    /// Labels for the given identity; empty if none apply
    fn build_labels(&self, identity: &Identity) -> Labels;
}

/// Sticker that assigns no labels
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLabelSticker;

impl LabelSticker for NoopLabelSticker {
    fn build_labels(&self, _identity: &Identity) -> Labels {
        Labels::new()
    }
}

impl<F> LabelSticker for F
where
    F: Fn(&Identity) -> Labels + Send + Sync,
{
    fn build_labels(&self, identity: &Identity) -> Labels {
        self(identity)
    }
}

// =============================================================================
// Regexp Label Sticker
// =============================================================================

struct PatternGroup {
    value: String,
    patterns: Vec<Regex>,
}

/// Assigns `label_name = value` for the first group whose patterns fully
/// match the identity's rendered name. Groups are checked in the order given.
pub struct RegexpLabelSticker {
    label_name: String,
    groups: Vec<PatternGroup>,
}

impl RegexpLabelSticker {
    /// Compile `(label value, patterns)` groups.
    ///
    /// Patterns must match the whole identity string, so `HBase` alone does
    /// not match `HBase_scan` while `.*HBase.*` does.
    pub fn new<I, V, P, S>(label_name: impl Into<String>, groups: I) -> Result<Self>
    where
        I: IntoIterator<Item = (V, P)>,
        V: Into<String>,
        P: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut compiled = Vec::new();
        for (value, patterns) in groups {
            let patterns = patterns
                .into_iter()
                .map(|p| compile_full_match(p.as_ref()))
                .collect::<Result<Vec<_>>>()?;
            compiled.push(PatternGroup {
                value: value.into(),
                patterns,
            });
        }
        Ok(Self {
            label_name: label_name.into(),
            groups: compiled,
        })
    }

    /// Name of the label this sticker assigns
    pub fn label_name(&self) -> &str {
        &self.label_name
    }

    /// Label value for a rendered identity name, first match wins
    pub fn label_value(&self, identity_string: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|group| group.patterns.iter().any(|p| p.is_match(identity_string)))
            .map(|group| group.value.as_str())
    }
}

impl LabelSticker for RegexpLabelSticker {
    fn build_labels(&self, identity: &Identity) -> Labels {
        let mut labels = Labels::new();
        if let Some(value) = self.label_value(identity.identity_string()) {
            labels.insert(self.label_name.clone(), value.to_string());
        }
        labels
    }
}

impl fmt::Debug for RegexpLabelSticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups: Vec<(&str, Vec<&str>)> = self
            .groups
            .iter()
            .map(|g| (g.value.as_str(), g.patterns.iter().map(Regex::as_str).collect()))
            .collect();
        f.debug_struct("RegexpLabelSticker")
            .field("label_name", &self.label_name)
            .field("groups", &groups)
            .finish()
    }
}

pub(crate) fn compile_full_match(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|source| Error::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

// =============================================================================
// Report Filters
// =============================================================================

/// Predicate selecting which aggregates and indicators a snapshot covers
pub type ReportFilter = Arc<dyn Fn(&Identity, &Labels) -> bool + Send + Sync>;

/// Matches when `label_name` is present with exactly `label_value`
pub fn contains_label(label_name: impl Into<String>, label_value: impl Into<String>) -> ReportFilter {
    let (name, value) = (label_name.into(), label_value.into());
    Arc::new(move |_: &Identity, labels: &Labels| labels.get(&name).is_some_and(|v| *v == value))
}

/// Matches when `label_name` is absent or carries a different value
pub fn not_contains_label(
    label_name: impl Into<String>,
    label_value: impl Into<String>,
) -> ReportFilter {
    let (name, value) = (label_name.into(), label_value.into());
    Arc::new(move |_: &Identity, labels: &Labels| labels.get(&name).map_or(true, |v| *v != value))
}

/// Matches when `label_name` is absent
pub fn not_contains_label_name(label_name: impl Into<String>) -> ReportFilter {
    let name = label_name.into();
    Arc::new(move |_: &Identity, labels: &Labels| !labels.contains_key(&name))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn sticker() -> RegexpLabelSticker {
        RegexpLabelSticker::new(
            "logRate",
            vec![
                ("10000", vec![".*HBase.*"]),
                ("20000", vec![".*scan.*", "other"]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_first_matching_group_wins() {
        let sticker = sticker();
        assert_eq!(sticker.label_value("HBase_scan"), Some("10000"));
        assert_eq!(sticker.label_value("table_scan"), Some("20000"));
        assert_eq!(sticker.label_value("other"), Some("20000"));
        assert_eq!(sticker.label_value("unrelated"), None);
    }

    #[test]
    fn test_patterns_match_whole_name() {
        let sticker = RegexpLabelSticker::new("rate", vec![("1", vec!["HBase"])]).unwrap();
        assert_eq!(sticker.label_value("HBase"), Some("1"));
        assert_eq!(sticker.label_value("HBase_scan"), None);
    }

    #[test]
    fn test_build_labels_uses_identity_string() {
        let sticker = RegexpLabelSticker::new("rate", vec![("1", vec![r"db\{host=a\}"])]).unwrap();
        let identity = Identity::with_tag_map("db", [("host", "a")]);
        let labels = sticker.build_labels(&identity);
        assert_eq!(labels.get("rate").map(String::as_str), Some("1"));
        assert!(sticker.build_labels(&Identity::new("db")).is_empty());
    }

    #[test]
    fn test_invalid_pattern() {
        let result = RegexpLabelSticker::new("rate", vec![("1", vec!["(unclosed"])]);
        assert_matches!(result, Err(Error::InvalidPattern { .. }));
    }

    #[test]
    fn test_closure_sticker() {
        let sticker = |identity: &Identity| {
            let mut labels = Labels::new();
            labels.insert("len".to_string(), identity.name().len().to_string());
            labels
        };
        let labels = sticker.build_labels(&Identity::new("abc"));
        assert_eq!(labels.get("len").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_report_filters() {
        let identity = Identity::new("x");
        let mut labels = Labels::new();

        assert!(!contains_label("rate", "1")(&identity, &labels));
        assert!(not_contains_label("rate", "1")(&identity, &labels));
        assert!(not_contains_label_name("rate")(&identity, &labels));

        labels.insert("rate".to_string(), "1".to_string());
        assert!(contains_label("rate", "1")(&identity, &labels));
        assert!(!contains_label("rate", "2")(&identity, &labels));
        assert!(!not_contains_label("rate", "1")(&identity, &labels));
        assert!(not_contains_label("rate", "2")(&identity, &labels));
        assert!(!not_contains_label_name("rate")(&identity, &labels));
    }
}
