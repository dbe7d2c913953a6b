//! EngineHandle - public async API of the engine actor
//!
//! Presses and health notifications are fire-and-forget. Every other call
//! waits for the actor's acknowledgement, so once it returns the command has
//! been applied (and persisted, for edits).

use super::commands::EngineCommand;
use super::types::{ActionInstance, ActionReference, ButtonKey, ButtonStyle, SetId};
use super::{ButtonState, StepPosition};
use crate::error::EngineError;
use crate::modules::ActionDefinitions;
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashSet;
use tokio::sync::{mpsc, oneshot};

#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    pub fn new(cmd_tx: mpsc::UnboundedSender<EngineCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Send a command and wait for its response
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).map_err(|_| EngineError::ActorClosed)?;
        rx.await.map_err(|_| EngineError::ActorClosed)
    }

    // =========================================================================
    // Hot path (fire-and-forget)
    // =========================================================================

    /// Report a press (`direction = true`) or release edge
    pub fn press(&self, key: ButtonKey, direction: bool, device_id: Option<String>) {
        let _ = self.cmd_tx.send(EngineCommand::Press {
            key,
            direction,
            device_id,
        });
    }

    /// Report that a module's health changed
    pub fn health_changed(&self, instance_id: impl Into<String>) {
        let _ = self.cmd_tx.send(EngineCommand::HealthChanged {
            instance_id: instance_id.into(),
        });
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    pub async fn abort_button(&self, key: ButtonKey, skip_up: bool) -> Result<bool> {
        Ok(self
            .request(|respond_to| EngineCommand::AbortButton { key, skip_up, respond_to })
            .await?)
    }

    pub async fn abort_all(&self) -> Result<usize> {
        Ok(self.request(|respond_to| EngineCommand::AbortAll { respond_to }).await?)
    }

    // =========================================================================
    // Button configuration
    // =========================================================================

    pub async fn set_button_style(&self, key: ButtonKey, style: ButtonStyle) -> Result<bool> {
        self.request(|respond_to| EngineCommand::SetButtonStyle { key, style, respond_to })
            .await?
            .with_context(|| format!("Failed to set style of {}", key))
    }

    pub async fn reset_button(&self, key: ButtonKey) -> Result<bool> {
        self.request(|respond_to| EngineCommand::ResetButton { key, respond_to })
            .await?
            .with_context(|| format!("Failed to reset {}", key))
    }

    pub async fn set_relative_delay(&self, key: ButtonKey, relative: bool) -> Result<bool> {
        self.request(|respond_to| EngineCommand::SetRelativeDelay { key, relative, respond_to })
            .await?
            .with_context(|| format!("Failed to update delay mode of {}", key))
    }

    pub async fn set_step_auto_progress(&self, key: ButtonKey, enabled: bool) -> Result<bool> {
        self.request(|respond_to| EngineCommand::SetStepAutoProgress { key, enabled, respond_to })
            .await?
            .with_context(|| format!("Failed to update auto-progress of {}", key))
    }

    // =========================================================================
    // Sets and cursor
    // =========================================================================

    pub async fn add_set(&self, key: ButtonKey) -> Result<Option<SetId>> {
        self.request(|respond_to| EngineCommand::AddSet { key, respond_to })
            .await?
            .with_context(|| format!("Failed to add a set to {}", key))
    }

    pub async fn remove_set(&self, key: ButtonKey, set: SetId) -> Result<bool> {
        self.request(|respond_to| EngineCommand::RemoveSet { key, set, respond_to })
            .await?
            .with_context(|| format!("Failed to remove set {} of {}", set, key))
    }

    pub async fn swap_sets(&self, key: ButtonKey, a: SetId, b: SetId) -> Result<bool> {
        self.request(|respond_to| EngineCommand::SwapSets { key, a, b, respond_to })
            .await?
            .with_context(|| format!("Failed to swap sets {} and {} of {}", a, b, key))
    }

    pub async fn set_step(&self, key: ButtonKey, set: SetId) -> Result<bool> {
        Ok(self
            .request(|respond_to| EngineCommand::SetStep { key, set, respond_to })
            .await?)
    }

    pub async fn step_delta(&self, key: ButtonKey, amount: i64) -> Result<bool> {
        Ok(self
            .request(|respond_to| EngineCommand::StepDelta { key, amount, respond_to })
            .await?)
    }

    pub async fn step_to(&self, key: ButtonKey, n: usize) -> Result<bool> {
        Ok(self
            .request(|respond_to| EngineCommand::StepTo { key, n, respond_to })
            .await?)
    }

    // =========================================================================
    // Actions
    // =========================================================================

    pub async fn add_action(&self, key: ButtonKey, set: SetId, reference: ActionReference) -> Result<Option<String>> {
        let label = reference.to_string();
        self.request(|respond_to| EngineCommand::AddAction {
            key,
            set,
            reference,
            respond_to,
        })
        .await?
        .with_context(|| format!("Failed to add {} to {}:{}", label, key, set))
    }

    pub async fn delete_action(&self, key: ButtonKey, set: SetId, action_id: impl Into<String>) -> Result<bool> {
        let action_id = action_id.into();
        self.request(|respond_to| EngineCommand::DeleteAction {
            key,
            set,
            action_id,
            respond_to,
        })
        .await?
        .with_context(|| format!("Failed to delete action from {}:{}", key, set))
    }

    pub async fn reorder_actions(&self, key: ButtonKey, set: SetId, from: usize, to: usize) -> Result<bool> {
        self.request(|respond_to| EngineCommand::ReorderActions {
            key,
            set,
            from,
            to,
            respond_to,
        })
        .await?
        .with_context(|| format!("Failed to reorder actions of {}:{}", key, set))
    }

    pub async fn update_action_option(
        &self,
        key: ButtonKey,
        set: SetId,
        action_id: impl Into<String>,
        option: impl Into<String>,
        value: Value,
    ) -> Result<bool> {
        let action_id = action_id.into();
        let option = option.into();
        self.request(|respond_to| EngineCommand::UpdateActionOption {
            key,
            set,
            action_id,
            option,
            value,
            respond_to,
        })
        .await?
        .with_context(|| format!("Failed to update an action option on {}:{}", key, set))
    }

    pub async fn update_action_delay(
        &self,
        key: ButtonKey,
        set: SetId,
        action_id: impl Into<String>,
        delay: u64,
    ) -> Result<bool> {
        let action_id = action_id.into();
        self.request(|respond_to| EngineCommand::UpdateActionDelay {
            key,
            set,
            action_id,
            delay,
            respond_to,
        })
        .await?
        .with_context(|| format!("Failed to update an action delay on {}:{}", key, set))
    }

    // =========================================================================
    // Module instances
    // =========================================================================

    pub async fn set_action_definitions(
        &self,
        instance_id: impl Into<String>,
        definitions: Option<ActionDefinitions>,
    ) -> Result<()> {
        let instance_id = instance_id.into();
        Ok(self
            .request(|respond_to| EngineCommand::SetActionDefinitions {
                instance_id,
                definitions,
                respond_to,
            })
            .await?)
    }

    pub async fn delete_instance(&self, instance_id: impl Into<String>) -> Result<()> {
        let instance_id = instance_id.into();
        let label = instance_id.clone();
        self.request(|respond_to| EngineCommand::DeleteInstance { instance_id, respond_to })
            .await?
            .with_context(|| format!("Failed to remove actions of '{}'", label))
    }

    pub async fn retain_instances(&self, instances: HashSet<String>) -> Result<usize> {
        self.request(|respond_to| EngineCommand::RetainInstances { instances, respond_to })
            .await?
            .context("Failed to prune actions of unknown instances")
    }

    pub async fn subscribe_all(&self) -> Result<usize> {
        Ok(self.request(|respond_to| EngineCommand::SubscribeAll { respond_to }).await?)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn set_ids(&self, key: ButtonKey) -> Result<Vec<SetId>> {
        Ok(self.request(|respond_to| EngineCommand::GetSetIds { key, respond_to }).await?)
    }

    pub async fn actions(&self, key: ButtonKey, set: SetId) -> Result<Vec<ActionInstance>> {
        Ok(self
            .request(|respond_to| EngineCommand::GetActions { key, set, respond_to })
            .await?)
    }

    pub async fn current_step(&self, key: ButtonKey) -> Result<Option<StepPosition>> {
        Ok(self
            .request(|respond_to| EngineCommand::GetCurrentStep { key, respond_to })
            .await?)
    }

    pub async fn button_state(&self, key: ButtonKey) -> Result<ButtonState> {
        Ok(self
            .request(|respond_to| EngineCommand::GetButtonState { key, respond_to })
            .await?)
    }

    pub async fn action_defaults(&self, reference: ActionReference) -> Result<ActionInstance> {
        Ok(self
            .request(|respond_to| EngineCommand::GetActionDefaults { reference, respond_to })
            .await?)
    }
}
