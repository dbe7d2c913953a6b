//! StatusAggregator - worst module health per button

use super::types::ButtonKey;
use crate::modules::{InstanceRegistry, Severity};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

#[derive(Debug, Default)]
pub struct StatusAggregator {
    cache: HashMap<ButtonKey, Severity>,
}

impl StatusAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute a button's severity from the modules it references
    ///
    /// Unknown health counts as ok. Returns true when the cached value changed.
    pub fn recompute(
        &mut self,
        key: ButtonKey,
        instance_ids: &BTreeSet<String>,
        registry: &dyn InstanceRegistry,
    ) -> bool {
        let severity = instance_ids
            .iter()
            .filter_map(|id| registry.get_health(id))
            .max()
            .unwrap_or_default();

        let previous = self.severity(key);
        if severity == Severity::Ok {
            self.cache.remove(&key);
        } else {
            self.cache.insert(key, severity);
        }

        if previous != severity {
            debug!(button = %key, from = %previous, to = %severity, "Button status changed");
            true
        } else {
            false
        }
    }

    pub fn severity(&self, key: ButtonKey) -> Severity {
        self.cache.get(&key).copied().unwrap_or_default()
    }
}
