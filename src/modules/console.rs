//! Console module - logs every action for testing and debugging

use super::{ActionDefinitions, ModuleHandle, RunContext};
use crate::engine::types::{ActionInstance, ButtonKey};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// ConsoleModule logs all actions it receives
///
/// This is useful for:
/// - Exercising button configurations without real devices
/// - Watching delay timing and abort behavior
/// - Development without hardware dependencies
pub struct ConsoleModule {
    id: String,
    definitions: ActionDefinitions,
    /// Actions currently registered, keyed by action id
    subscriptions: Arc<RwLock<HashMap<String, (ButtonKey, ActionInstance)>>>,
    /// Execution counter for debugging
    execution_count: Arc<RwLock<u64>>,
}

impl ConsoleModule {
    /// Create a new ConsoleModule with a given instance id
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_definitions(id, ActionDefinitions::new())
    }

    /// Create a ConsoleModule that advertises the given action kinds
    pub fn with_definitions(id: impl Into<String>, definitions: ActionDefinitions) -> Self {
        Self {
            id: id.into(),
            definitions,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            execution_count: Arc::new(RwLock::new(0)),
        }
    }

    /// Number of actions executed so far
    pub async fn execution_count(&self) -> u64 {
        *self.execution_count.read().await
    }

    /// Number of actions currently registered
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}

#[async_trait]
impl ModuleHandle for ConsoleModule {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, action: &ActionInstance, ctx: &RunContext) -> Result<()> {
        let mut count = self.execution_count.write().await;
        *count += 1;
        let exec_num = *count;
        drop(count);

        let options = if action.options.is_empty() {
            "(no options)".to_string()
        } else {
            action
                .options
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let device = ctx
            .device_id
            .as_ref()
            .map(|d| format!(" [device: {}]", d))
            .unwrap_or_default();

        info!(
            "🎮 [{}] Module '{}' → {} ({}) from {}.{}{} [exec #{}]",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            self.id,
            action.action_kind,
            options,
            ctx.page,
            ctx.button,
            device,
            exec_num
        );

        debug!(
            module = self.id,
            action_id = action.id,
            delay = action.delay,
            exec_count = exec_num,
            "ConsoleModule execution"
        );

        Ok(())
    }

    async fn update(&self, action: &ActionInstance, key: ButtonKey) -> Result<()> {
        let replaced = self
            .subscriptions
            .write()
            .await
            .insert(action.id.clone(), (key, action.clone()))
            .is_some();
        debug!(
            module = self.id,
            action_id = action.id,
            button = %key,
            replaced,
            "ConsoleModule action registered"
        );
        Ok(())
    }

    async fn delete(&self, action: &ActionInstance) -> Result<()> {
        if self.subscriptions.write().await.remove(&action.id).is_some() {
            debug!(module = self.id, action_id = action.id, "ConsoleModule action unregistered");
        }
        Ok(())
    }

    fn action_definitions(&self) -> ActionDefinitions {
        self.definitions.clone()
    }
}
