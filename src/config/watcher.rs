//! Configuration file watcher for hot-reload support
//!
//! The notify callback only raises a flag; the watcher then debounces, loads
//! the file and compares it with the running configuration so callers only
//! see real changes.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{AppConfig, ModuleConfig};

/// Wait for editors to finish writing before reading the file
const DEBOUNCE: Duration = Duration::from_millis(100);

/// A configuration that differs from the running one
#[derive(Debug)]
pub struct ConfigReload {
    pub config: AppConfig,
    pub modules: ModuleChanges,
    /// Surface geometry or storage changed; those apply on restart
    pub needs_restart: bool,
}

impl ConfigReload {
    /// None when `new` is identical to `old`
    pub fn between(old: &AppConfig, new: AppConfig) -> Option<Self> {
        if *old == new {
            return None;
        }
        Some(Self {
            modules: ModuleChanges::between(old, &new),
            needs_restart: old.engine != new.engine || old.storage != new.storage,
            config: new,
        })
    }
}

/// Watches the configuration file and yields reloads that change something
pub struct ConfigWatcher {
    path: String,
    current: AppConfig,
    _watcher: RecommendedWatcher,
    modified: mpsc::Receiver<()>,
}

impl ConfigWatcher {
    /// Load the file and start watching it
    pub async fn new(config_path: String) -> Result<(Self, Arc<AppConfig>)> {
        let initial_config = AppConfig::load(&config_path)
            .await
            .context("Failed to load initial config")?;

        // One pending flag is enough: bursts of modify events coalesce
        let (tx, modified) = mpsc::channel(1);
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) if matches!(event.kind, EventKind::Modify(_)) => {
                debug!("Config file modified: {:?}", event.paths);
                let _ = tx.try_send(());
            }
            Ok(_) => {}
            Err(e) => error!("Watch error: {}", e),
        })?;

        watcher
            .watch(Path::new(&config_path), RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch config file: {}", config_path))?;

        info!("Config file watcher started for: {}", config_path);

        Ok((
            Self {
                path: config_path,
                current: initial_config.clone(),
                _watcher: watcher,
                modified,
            },
            Arc::new(initial_config),
        ))
    }

    /// Wait for the next change to the configuration
    ///
    /// Unreadable or unchanged files are skipped. Returns None once the
    /// watcher has been closed.
    pub async fn next_reload(&mut self) -> Option<ConfigReload> {
        loop {
            self.modified.recv().await?;
            tokio::time::sleep(DEBOUNCE).await;
            while self.modified.try_recv().is_ok() {}

            let config = match AppConfig::load(&self.path).await {
                Ok(config) => config,
                Err(e) => {
                    warn!("Failed to reload config (keeping old config): {:#}", e);
                    continue;
                }
            };
            match ConfigReload::between(&self.current, config) {
                Some(reload) => {
                    self.current = reload.config.clone();
                    return Some(reload);
                }
                None => debug!("Config file rewritten without changes"),
            }
        }
    }
}

/// Module-level difference between two configurations
#[derive(Debug, Default, PartialEq)]
pub struct ModuleChanges {
    pub added: Vec<ModuleConfig>,
    pub removed: Vec<String>,
    /// Same id, different settings
    pub changed: Vec<ModuleConfig>,
}

impl ModuleChanges {
    pub fn between(old: &AppConfig, new: &AppConfig) -> Self {
        let old_modules: HashMap<&str, &ModuleConfig> =
            old.modules.iter().map(|m| (m.id.as_str(), m)).collect();
        let new_ids: std::collections::HashSet<&str> =
            new.modules.iter().map(|m| m.id.as_str()).collect();

        let mut changes = Self::default();
        for module in &new.modules {
            match old_modules.get(module.id.as_str()) {
                None => changes.added.push(module.clone()),
                Some(previous) if *previous != module => changes.changed.push(module.clone()),
                Some(_) => {}
            }
        }
        changes.removed = old
            .modules
            .iter()
            .filter(|m| !new_ids.contains(m.id.as_str()))
            .map(|m| m.id.clone())
            .collect();
        changes
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}
