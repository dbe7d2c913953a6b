//! Module host - registry of live module instances and their health

use super::{HealthCallback, InstanceRegistry, ModuleHandle, Severity};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Registry of live module handles
///
/// Lookups are synchronous so the engine actor can resolve handles without
/// yielding. Health changes are pushed to subscribers (the engine re-evaluates
/// every button status on each change).
#[derive(Default)]
pub struct ModuleHost {
    children: RwLock<HashMap<String, Arc<dyn ModuleHandle>>>,
    health: RwLock<HashMap<String, Severity>>,
    health_listeners: RwLock<Vec<HealthCallback>>,
}

impl ModuleHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under its own id, replacing any previous handle
    pub fn register(&self, handle: Arc<dyn ModuleHandle>) {
        let id = handle.id().to_string();
        if self.children.write().insert(id.clone(), handle).is_some() {
            debug!("Replaced module handle '{}'", id);
        } else {
            info!("Registered module '{}'", id);
        }
    }

    /// Remove a module and forget its health
    pub fn remove(&self, instance_id: &str) -> Option<Arc<dyn ModuleHandle>> {
        self.health.write().remove(instance_id);
        let removed = self.children.write().remove(instance_id);
        if removed.is_some() {
            info!("Removed module '{}'", instance_id);
        }
        removed
    }

    /// Record a module's health; listeners are notified only on change
    pub fn set_health(&self, instance_id: &str, severity: Severity) {
        let previous = self.health.write().insert(instance_id.to_string(), severity);
        if previous == Some(severity) {
            return;
        }

        debug!(instance = instance_id, %severity, "Module health changed");

        // Snapshot listeners so a callback can't deadlock by subscribing
        let listeners: Vec<HealthCallback> = self.health_listeners.read().clone();
        for listener in listeners {
            listener(instance_id, severity);
        }
    }

    /// Subscribe to health changes
    pub fn subscribe_health(&self, callback: HealthCallback) {
        self.health_listeners.write().push(callback);
    }
}

impl InstanceRegistry for ModuleHost {
    fn get_child(&self, instance_id: &str) -> Option<Arc<dyn ModuleHandle>> {
        self.children.read().get(instance_id).cloned()
    }

    fn get_health(&self, instance_id: &str) -> Option<Severity> {
        self.health.read().get(instance_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::ConsoleModule;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_register_and_lookup() {
        let host = ModuleHost::new();
        host.register(Arc::new(ConsoleModule::new("console")));

        assert!(host.get_child("console").is_some());
        assert!(host.get_child("missing").is_none());

        assert!(host.remove("console").is_some());
        assert!(host.get_child("console").is_none());
    }

    #[test]
    fn test_health_listeners_fire_on_change_only() {
        let host = ModuleHost::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        host.subscribe_health(Arc::new(move |_: &str, _: Severity| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(host.get_health("obs"), None);
        host.set_health("obs", Severity::Warning);
        host.set_health("obs", Severity::Warning);
        host.set_health("obs", Severity::Error);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(host.get_health("obs"), Some(Severity::Error));
    }

    #[test]
    fn test_remove_forgets_health() {
        let host = ModuleHost::new();
        host.register(Arc::new(ConsoleModule::new("console")));
        host.set_health("console", Severity::Error);
        host.remove("console");
        assert_eq!(host.get_health("console"), None);
    }
}
