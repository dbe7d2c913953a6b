//! Commands processed by the engine actor
//!
//! Hot-path commands (presses, health notifications) are fire-and-forget.
//! Everything else carries a oneshot responder so the caller knows the command
//! was applied; for aborts this means no cancelled action fires afterwards.

use super::types::{ActionInstance, ActionReference, ButtonKey, ButtonStyle, SetId};
use super::{ButtonState, StepPosition};
use crate::error::Result;
use crate::modules::ActionDefinitions;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use tokio::sync::oneshot;

pub type Responder<T> = oneshot::Sender<T>;

pub enum EngineCommand {
    // -------------------------------------------------------------------------
    // Hot path (no response)
    // -------------------------------------------------------------------------
    Press {
        key: ButtonKey,
        direction: bool,
        device_id: Option<String>,
    },
    HealthChanged {
        instance_id: String,
    },

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------
    AbortButton {
        key: ButtonKey,
        skip_up: bool,
        respond_to: Responder<bool>,
    },
    AbortAll {
        respond_to: Responder<usize>,
    },

    // -------------------------------------------------------------------------
    // Button configuration
    // -------------------------------------------------------------------------
    SetButtonStyle {
        key: ButtonKey,
        style: ButtonStyle,
        respond_to: Responder<Result<bool>>,
    },
    ResetButton {
        key: ButtonKey,
        respond_to: Responder<Result<bool>>,
    },
    SetRelativeDelay {
        key: ButtonKey,
        relative: bool,
        respond_to: Responder<Result<bool>>,
    },
    SetStepAutoProgress {
        key: ButtonKey,
        enabled: bool,
        respond_to: Responder<Result<bool>>,
    },

    // -------------------------------------------------------------------------
    // Sets and cursor
    // -------------------------------------------------------------------------
    AddSet {
        key: ButtonKey,
        respond_to: Responder<Result<Option<SetId>>>,
    },
    RemoveSet {
        key: ButtonKey,
        set: SetId,
        respond_to: Responder<Result<bool>>,
    },
    SwapSets {
        key: ButtonKey,
        a: SetId,
        b: SetId,
        respond_to: Responder<Result<bool>>,
    },
    SetStep {
        key: ButtonKey,
        set: SetId,
        respond_to: Responder<bool>,
    },
    StepDelta {
        key: ButtonKey,
        amount: i64,
        respond_to: Responder<bool>,
    },
    StepTo {
        key: ButtonKey,
        n: usize,
        respond_to: Responder<bool>,
    },

    // -------------------------------------------------------------------------
    // Actions
    // -------------------------------------------------------------------------
    AddAction {
        key: ButtonKey,
        set: SetId,
        reference: ActionReference,
        respond_to: Responder<Result<Option<String>>>,
    },
    DeleteAction {
        key: ButtonKey,
        set: SetId,
        action_id: String,
        respond_to: Responder<Result<bool>>,
    },
    ReorderActions {
        key: ButtonKey,
        set: SetId,
        from: usize,
        to: usize,
        respond_to: Responder<Result<bool>>,
    },
    UpdateActionOption {
        key: ButtonKey,
        set: SetId,
        action_id: String,
        option: String,
        value: Value,
        respond_to: Responder<Result<bool>>,
    },
    UpdateActionDelay {
        key: ButtonKey,
        set: SetId,
        action_id: String,
        delay: u64,
        respond_to: Responder<Result<bool>>,
    },

    // -------------------------------------------------------------------------
    // Module instances
    // -------------------------------------------------------------------------
    SetActionDefinitions {
        instance_id: String,
        definitions: Option<ActionDefinitions>,
        respond_to: Responder<()>,
    },
    DeleteInstance {
        instance_id: String,
        respond_to: Responder<Result<()>>,
    },
    RetainInstances {
        instances: HashSet<String>,
        respond_to: Responder<Result<usize>>,
    },
    SubscribeAll {
        respond_to: Responder<usize>,
    },

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------
    GetSetIds {
        key: ButtonKey,
        respond_to: Responder<Vec<SetId>>,
    },
    GetActions {
        key: ButtonKey,
        set: SetId,
        respond_to: Responder<Vec<ActionInstance>>,
    },
    GetCurrentStep {
        key: ButtonKey,
        respond_to: Responder<Option<StepPosition>>,
    },
    GetButtonState {
        key: ButtonKey,
        respond_to: Responder<ButtonState>,
    },
    GetActionDefaults {
        reference: ActionReference,
        respond_to: Responder<ActionInstance>,
    },
}

impl fmt::Debug for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineCommand::Press { key, direction, .. } => {
                write!(f, "Press({}, {})", key, if *direction { "down" } else { "up" })
            }
            EngineCommand::HealthChanged { instance_id } => write!(f, "HealthChanged({})", instance_id),
            EngineCommand::AbortButton { key, .. } => write!(f, "AbortButton({})", key),
            EngineCommand::AbortAll { .. } => f.write_str("AbortAll"),
            EngineCommand::SetButtonStyle { key, style, .. } => write!(f, "SetButtonStyle({}, {})", key, style),
            EngineCommand::ResetButton { key, .. } => write!(f, "ResetButton({})", key),
            EngineCommand::SetRelativeDelay { key, .. } => write!(f, "SetRelativeDelay({})", key),
            EngineCommand::SetStepAutoProgress { key, .. } => write!(f, "SetStepAutoProgress({})", key),
            EngineCommand::AddSet { key, .. } => write!(f, "AddSet({})", key),
            EngineCommand::RemoveSet { key, set, .. } => write!(f, "RemoveSet({}:{})", key, set),
            EngineCommand::SwapSets { key, a, b, .. } => write!(f, "SwapSets({}:{}<->{})", key, a, b),
            EngineCommand::SetStep { key, set, .. } => write!(f, "SetStep({}:{})", key, set),
            EngineCommand::StepDelta { key, amount, .. } => write!(f, "StepDelta({}, {})", key, amount),
            EngineCommand::StepTo { key, n, .. } => write!(f, "StepTo({}, {})", key, n),
            EngineCommand::AddAction { key, set, reference, .. } => {
                write!(f, "AddAction({}:{}, {})", key, set, reference)
            }
            EngineCommand::DeleteAction { key, action_id, .. } => write!(f, "DeleteAction({}, {})", key, action_id),
            EngineCommand::ReorderActions { key, set, from, to, .. } => {
                write!(f, "ReorderActions({}:{}, {}->{})", key, set, from, to)
            }
            EngineCommand::UpdateActionOption { key, action_id, option, .. } => {
                write!(f, "UpdateActionOption({}, {}.{})", key, action_id, option)
            }
            EngineCommand::UpdateActionDelay { key, action_id, delay, .. } => {
                write!(f, "UpdateActionDelay({}, {}={}ms)", key, action_id, delay)
            }
            EngineCommand::SetActionDefinitions { instance_id, .. } => {
                write!(f, "SetActionDefinitions({})", instance_id)
            }
            EngineCommand::DeleteInstance { instance_id, .. } => write!(f, "DeleteInstance({})", instance_id),
            EngineCommand::RetainInstances { instances, .. } => write!(f, "RetainInstances({})", instances.len()),
            EngineCommand::SubscribeAll { .. } => f.write_str("SubscribeAll"),
            EngineCommand::GetSetIds { key, .. } => write!(f, "GetSetIds({})", key),
            EngineCommand::GetActions { key, set, .. } => write!(f, "GetActions({}:{})", key, set),
            EngineCommand::GetCurrentStep { key, .. } => write!(f, "GetCurrentStep({})", key),
            EngineCommand::GetButtonState { key, .. } => write!(f, "GetButtonState({})", key),
            EngineCommand::GetActionDefaults { reference, .. } => write!(f, "GetActionDefaults({})", reference),
        }
    }
}
