//! Metric Identity
//!
//! An immutable `(name, tags)` key identifying one metric stream.
//! Tags are kept ordered by key so the rendered form is deterministic:
//! `name` alone, or `name{k1=v1,k2=v2}`.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Serialize, Serializer};

use crate::error::{Error, Result};

/// Identity of a profiled call or indicator
#[derive(Debug, Clone)]
pub struct Identity {
    name: String,
    tags: BTreeMap<String, String>,
    rendered: String,
}

impl Identity {
    /// Identity without tags
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_parts(name.into(), BTreeMap::new())
    }

    /// Identity from a flat `[key, value, key, value, ...]` list.
    ///
    /// Fails with [`Error::InvalidTags`] if the list has odd length.
    pub fn with_tags<S: AsRef<str>>(name: impl Into<String>, tags: &[S]) -> Result<Self> {
        if tags.len() % 2 != 0 {
            return Err(Error::InvalidTags { size: tags.len() });
        }
        let tags = tags
            .chunks_exact(2)
            .map(|pair| (pair[0].as_ref().to_string(), pair[1].as_ref().to_string()))
            .collect();
        Ok(Self::from_parts(name.into(), tags))
    }

    /// Identity from an existing key/value mapping
    pub fn with_tag_map<K, V, I>(name: impl Into<String>, tags: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let tags = tags
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::from_parts(name.into(), tags)
    }

    fn from_parts(name: String, tags: BTreeMap<String, String>) -> Self {
        let rendered = render(&name, &tags);
        Self {
            name,
            tags,
            rendered,
        }
    }

    /// Metric name without tags
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tags ordered by key
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// True if the tag exists with exactly this value
    pub fn has_tag(&self, tag_name: &str, tag_value: &str) -> bool {
        self.tags.get(tag_name).is_some_and(|v| v == tag_value)
    }

    /// Canonical rendering used for ordering and display
    pub fn identity_string(&self) -> &str {
        &self.rendered
    }
}

fn render(name: &str, tags: &BTreeMap<String, String>) -> String {
    if tags.is_empty() {
        return name.to_string();
    }
    let body = tags
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");
    format!("{}{{{}}}", name, body)
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.tags == other.tags
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.tags.hash(state);
    }
}

impl Ord for Identity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rendered
            .cmp(&other.rendered)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.tags.cmp(&other.tags))
    }
}

impl PartialOrd for Identity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.rendered)
    }
}

impl From<&str> for Identity {
    fn from(name: &str) -> Self {
        Identity::new(name)
    }
}

impl From<String> for Identity {
    fn from(name: String) -> Self {
        Identity::new(name)
    }
}

impl From<&Identity> for Identity {
    fn from(identity: &Identity) -> Self {
        identity.clone()
    }
}

// =============================================================================
// Name Normalization
// =============================================================================

/// Trim surrounding whitespace and one leading and one trailing dot.
pub fn normalize_name(name: &str) -> &str {
    let name = name.trim();
    let name = name.strip_prefix('.').unwrap_or(name);
    name.strip_suffix('.').unwrap_or(name)
}

// =============================================================================
// Tests
// =============================================================================
