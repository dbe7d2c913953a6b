//! Outbound engine events consumed by surface and UI adapters

use super::types::{ButtonKey, SetId};
use crate::modules::ActionDefinitions;
use serde::Serialize;

/// Page change requested by a navigation button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PageNavigation {
    Up,
    Down,
    Set(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The list of set ids of a button changed
    SetsChanged { key: ButtonKey, set_ids: Vec<SetId> },
    /// Set contents were replaced wholesale (swap, style change)
    SetsReloaded { key: ButtonKey, set_ids: Vec<SetId> },
    /// The step cursor moved
    StepChanged { key: ButtonKey, set_id: SetId, index: usize },
    /// The button needs redrawing
    Redraw { key: ButtonKey },
    Pushed {
        key: ButtonKey,
        pushed: bool,
        device_id: Option<String>,
    },
    PageNavigation {
        device_id: Option<String>,
        navigation: PageNavigation,
    },
    /// A module published (or withdrew) its action definitions
    ModuleDefinitionsChanged {
        instance_id: String,
        definitions: Option<ActionDefinitions>,
    },
}
