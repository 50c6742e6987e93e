//! Indicators
//!
//! Gauges polled at snapshot time. A failing or panicking provider is logged
//! and left out of that snapshot; it never aborts report building.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{error, warn};

use crate::identity::Identity;
use crate::labels::{LabelSticker, ReportFilter};

/// Source of an indicator value
pub trait IndicationProvider: Send + Sync {
    fn get(&self) -> anyhow::Result<i64>;
}

impl<F> IndicationProvider for F
where
    F: Fn() -> anyhow::Result<i64> + Send + Sync,
{
    fn get(&self) -> anyhow::Result<i64> {
        self()
    }
}

/// Registered indicators keyed by identity
#[derive(Default)]
pub struct IndicatorRegistry {
    providers: DashMap<Identity, Arc<dyn IndicationProvider>>,
}

impl IndicatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the provider for `identity`
    pub fn attach(&self, identity: Identity, provider: Arc<dyn IndicationProvider>) {
        self.providers.insert(identity, provider);
    }

    pub fn detach(&self, identity: &Identity) -> bool {
        self.providers.remove(identity).is_some()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Poll every provider accepted by `filter`.
    ///
    /// Labels come from `sticker` at call time. Providers are collected first
    /// and polled without holding any map lock, so a provider may itself
    /// attach or detach indicators.
    pub fn evaluate(
        &self,
        sticker: &dyn LabelSticker,
        filter: Option<&ReportFilter>,
    ) -> BTreeMap<Identity, i64> {
        let selected: Vec<(Identity, Arc<dyn IndicationProvider>)> = self
            .providers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut values = BTreeMap::new();
        for (identity, provider) in selected {
            if let Some(filter) = filter {
                let labels = sticker.build_labels(&identity);
                if !filter(&identity, &labels) {
                    continue;
                }
            }

            match catch_unwind(AssertUnwindSafe(|| provider.get())) {
                Ok(Ok(value)) => {
                    values.insert(identity, value);
                }
                Ok(Err(e)) => {
                    warn!(indicator = %identity, error = %e, "Indicator evaluation failed");
                }
                Err(_) => {
                    error!(indicator = %identity, "Indicator provider panicked");
                }
            }
        }
        values
    }
}

// =============================================================================
// Tests
// =============================================================================
