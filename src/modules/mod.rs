//! Device-control modules
//!
//! A module instance is an independently owned unit (a connection to OBS, a
//! lighting desk, a video router...) that the engine asks to run, update or
//! delete actions. The engine never owns module lifecycles; it only looks
//! handles up through an [`InstanceRegistry`].

use crate::engine::types::{ActionInstance, ButtonKey};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub mod console;
pub mod host;

pub use console::ConsoleModule;
pub use host::ModuleHost;

/// Health of a module instance, ordered `Ok < Warning < Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Ok,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Ok => f.write_str("ok"),
            Severity::Warning => f.write_str("warning"),
            Severity::Error => f.write_str("error"),
        }
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ok" | "good" => Ok(Severity::Ok),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" | "err" => Ok(Severity::Error),
            other => anyhow::bail!("unknown severity '{}'", other),
        }
    }
}

/// Context handed to a module when one of its actions runs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunContext {
    /// Surface that triggered the press, if known
    pub device_id: Option<String>,
    pub page: u32,
    pub button: u32,
}

impl RunContext {
    pub fn new(key: ButtonKey, device_id: Option<String>) -> Self {
        Self {
            device_id,
            page: key.page,
            button: key.button,
        }
    }
}

/// Option exposed by an action kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub default: Value,
}

/// Action kind exposed by a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub label: String,
    #[serde(default)]
    pub options: Vec<OptionDefinition>,
}

/// Action kinds of one module, keyed by action kind
pub type ActionDefinitions = BTreeMap<String, ActionDefinition>;

/// Callback invoked when a module's health changes
pub type HealthCallback = Arc<dyn Fn(&str, Severity) + Send + Sync>;

/// Capabilities every device-control module exposes
///
/// Note: All methods take &self so handles can be shared as `Arc<dyn ModuleHandle>`.
/// Implementations use interior mutability for their own state.
#[async_trait]
pub trait ModuleHandle: Send + Sync {
    /// Instance id (e.g., "obs1", "console")
    fn id(&self) -> &str;

    /// Execute an action
    async fn run(&self, action: &ActionInstance, ctx: &RunContext) -> Result<()>;

    /// (Re)register an action on a button, replacing any previous registration
    /// for the same action id
    async fn update(&self, action: &ActionInstance, key: ButtonKey) -> Result<()>;

    /// Drop the registration of an action
    async fn delete(&self, action: &ActionInstance) -> Result<()>;

    /// Action kinds offered by this module
    ///
    /// Default implementation: none
    fn action_definitions(&self) -> ActionDefinitions {
        ActionDefinitions::new()
    }
}

/// Lookup of live module handles and their health
pub trait InstanceRegistry: Send + Sync {
    fn get_child(&self, instance_id: &str) -> Option<Arc<dyn ModuleHandle>>;

    fn get_health(&self, instance_id: &str) -> Option<Severity>;
}
