//! Prefixed Profiler
//!
//! Wraps a [`Profiler`] and prepends `prefix.` to every call and indicator
//! name. Tags are kept as given.

use super::{ActiveCall, ProfiledCall, Profiler};
use crate::engine::ProfilerReporter;
use crate::identity::{normalize_name, Identity};
use crate::labels::LabelSticker;

/// Profiler view that namespaces names under a fixed prefix
#[derive(Debug, Clone)]
pub struct PrefixedProfiler {
    profiler: Profiler,
    prefix: String,
}

impl PrefixedProfiler {
    pub fn new(profiler: Profiler, prefix: impl AsRef<str>) -> Self {
        Self {
            profiler,
            prefix: normalize_name(prefix.as_ref()).to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn prefixed(&self, identity: impl Into<Identity>) -> Identity {
        let identity = identity.into();
        let name = format!("{}.{}", self.prefix, normalize_name(identity.name()));
        Identity::with_tag_map(name, identity.tags().clone())
    }

    pub fn profiled_call(&self, identity: impl Into<Identity>) -> ProfiledCall {
        self.profiler.profiled_call(self.prefixed(identity))
    }

    pub fn start(&self, identity: impl Into<Identity>) -> ActiveCall {
        self.profiled_call(identity).start()
    }

    pub fn call(&self, identity: impl Into<Identity>) {
        self.profiled_call(identity).call();
    }

    pub fn attach_indicator<F>(&self, identity: impl Into<Identity>, provider: F)
    where
        F: Fn() -> anyhow::Result<i64> + Send + Sync + 'static,
    {
        self.profiler
            .attach_indicator(self.prefixed(identity), provider);
    }

    pub fn detach_indicator(&self, identity: impl Into<Identity>) -> bool {
        self.profiler.detach_indicator(self.prefixed(identity))
    }

    pub fn set_label_sticker(&self, sticker: impl LabelSticker + 'static) {
        self.profiler.set_label_sticker(sticker);
    }

    pub fn create_reporter(&self) -> ProfilerReporter {
        self.profiler.create_reporter()
    }
}

// =============================================================================
// Tests
// =============================================================================
