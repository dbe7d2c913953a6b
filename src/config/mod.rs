//! Configuration management for the deck action engine
//!
//! Handles loading, parsing, and hot-reloading of YAML configuration files.

pub mod watcher;

use crate::engine::{EngineSettings, MAX_PAGES};
use crate::modules::{ActionDefinitions, Severity};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tokio::fs;

pub use watcher::{ConfigReload, ConfigWatcher, ModuleChanges};

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

/// Surface geometry
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_pages")]
    pub pages: u32,
    #[serde(default = "default_buttons_per_page")]
    pub buttons_per_page: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pages: default_pages(),
            buttons_per_page: default_buttons_per_page(),
        }
    }
}

/// Where the action store lives
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Database directory; defaults to the application state directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Kind of module implementation to start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Console,
}

/// One module instance
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ModuleConfig {
    pub id: String,
    #[serde(default = "default_module_kind")]
    pub kind: ModuleKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Health reported right after the module starts
    #[serde(default)]
    pub health: Severity,
    /// Action kinds the module offers
    #[serde(default)]
    pub actions: ActionDefinitions,
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path))?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, path: &str) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;

        fs::write(path, yaml)
            .await
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        if self.engine.pages == 0 || self.engine.pages > MAX_PAGES {
            anyhow::bail!(
                "engine.pages is {} (must be 1-{})",
                self.engine.pages,
                MAX_PAGES
            );
        }
        if self.engine.buttons_per_page == 0 {
            anyhow::bail!("engine.buttons_per_page must be at least 1");
        }

        let mut seen = HashSet::new();
        for (idx, module) in self.modules.iter().enumerate() {
            if module.id.trim().is_empty() {
                anyhow::bail!("Module {} id cannot be empty", idx);
            }
            if module.id.contains(':') {
                anyhow::bail!("Module id '{}' cannot contain ':'", module.id);
            }
            if !seen.insert(module.id.as_str()) {
                anyhow::bail!("Module id '{}' is defined more than once", module.id);
            }
            for (kind, definition) in &module.actions {
                if kind.is_empty() {
                    anyhow::bail!("Module '{}' has an action with an empty name", module.id);
                }
                let mut options = HashSet::new();
                for option in &definition.options {
                    if !options.insert(option.id.as_str()) {
                        anyhow::bail!(
                            "Action '{}:{}' declares option '{}' twice",
                            module.id,
                            kind,
                            option.id
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Ids of every configured module
    pub fn module_ids(&self) -> HashSet<String> {
        self.modules.iter().map(|m| m.id.clone()).collect()
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            pages: self.engine.pages,
            buttons_per_page: self.engine.buttons_per_page,
        }
    }
}

fn default_pages() -> u32 {
    MAX_PAGES
}

fn default_buttons_per_page() -> u32 {
    32
}

fn default_module_kind() -> ModuleKind {
    ModuleKind::Console
}
