//! Engine type definitions
//!
//! Button addressing, styles, action-set ids and the persisted action record.

use crate::error::EngineError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Highest addressable page number
pub const MAX_PAGES: u32 = 99;

/// Address of one control-surface slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ButtonKey {
    /// Page number (1-99)
    pub page: u32,
    /// Button position on the page (1-N)
    pub button: u32,
}

impl ButtonKey {
    pub fn new(page: u32, button: u32) -> Self {
        Self { page, button }
    }
}

impl fmt::Display for ButtonKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.page, self.button)
    }
}

/// Button style - fixes the set-id key space and press/release semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonStyle {
    /// Unconfigured button
    #[default]
    None,
    /// "down" set on press, "up" set on release
    Press,
    /// Numbered sets cycled by a cursor
    Step,
    /// Navigate to the next page
    PageUp,
    /// Navigate to the previous page
    PageDown,
    /// Navigate to the home page
    PageNum,
}

impl ButtonStyle {
    /// Page navigation buttons never dispatch and have no pushed indication
    pub fn is_page_navigation(&self) -> bool {
        matches!(self, ButtonStyle::PageUp | ButtonStyle::PageDown | ButtonStyle::PageNum)
    }
}

impl fmt::Display for ButtonStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ButtonStyle::None => "none",
            ButtonStyle::Press => "press",
            ButtonStyle::Step => "step",
            ButtonStyle::PageUp => "pageup",
            ButtonStyle::PageDown => "pagedown",
            ButtonStyle::PageNum => "pagenum",
        };
        f.write_str(s)
    }
}

impl FromStr for ButtonStyle {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(ButtonStyle::None),
            "press" => Ok(ButtonStyle::Press),
            "step" => Ok(ButtonStyle::Step),
            "pageup" => Ok(ButtonStyle::PageUp),
            "pagedown" => Ok(ButtonStyle::PageDown),
            "pagenum" => Ok(ButtonStyle::PageNum),
            other => Err(EngineError::Configuration(format!("unknown button style '{}'", other))),
        }
    }
}

/// Identifier of an action set within one button
///
/// Press buttons use `down`/`up`; step buttons use numeric ids. Numeric ids
/// order numerically, so `Step(2) < Step(10)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SetId {
    Down,
    Up,
    Step(u32),
}

impl SetId {
    pub fn is_step(&self) -> bool {
        matches!(self, SetId::Step(_))
    }
}

impl fmt::Display for SetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetId::Down => f.write_str("down"),
            SetId::Up => f.write_str("up"),
            SetId::Step(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for SetId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "down" => Ok(SetId::Down),
            "up" => Ok(SetId::Up),
            other => other
                .parse::<u32>()
                .map(SetId::Step)
                .map_err(|_| EngineError::Configuration(format!("invalid action set id '{}'", other))),
        }
    }
}

impl TryFrom<String> for SetId {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SetId> for String {
    fn from(value: SetId) -> Self {
        value.to_string()
    }
}

/// Typed reference to an action kind offered by a module instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionReference {
    pub instance_id: String,
    pub action_kind: String,
}

impl ActionReference {
    pub fn new(instance_id: impl Into<String>, action_kind: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            action_kind: action_kind.into(),
        }
    }
}

impl fmt::Display for ActionReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instance_id, self.action_kind)
    }
}

/// Parses the `instance:action` form typed at the console
impl FromStr for ActionReference {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((instance, action)) if !instance.is_empty() && !action.is_empty() => {
                Ok(Self::new(instance, action))
            }
            _ => Err(EngineError::Configuration(format!(
                "action reference '{}' must look like instance:action",
                s
            ))),
        }
    }
}

/// One configured action bound to its owning module instance
///
/// The order index is the position inside the owning set's list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionInstance {
    /// Globally unique id, stable across reorders
    pub id: String,
    /// Owning module instance
    #[serde(rename = "instance")]
    pub instance_id: String,
    /// Action kind within the module
    #[serde(rename = "action")]
    pub action_kind: String,
    #[serde(default)]
    pub options: Map<String, Value>,
    /// Declared delay in milliseconds
    #[serde(default, deserialize_with = "lenient_delay")]
    pub delay: u64,
}

impl ActionInstance {
    /// Create a new action with a fresh id and no delay
    pub fn new(reference: &ActionReference, options: Map<String, Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            instance_id: reference.instance_id.clone(),
            action_kind: reference.action_kind.clone(),
            options,
            delay: 0,
        }
    }

    pub fn reference(&self) -> ActionReference {
        ActionReference::new(self.instance_id.clone(), self.action_kind.clone())
    }
}

/// Per-button configuration persisted alongside the action sets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonConfig {
    #[serde(default)]
    pub style: ButtonStyle,
    /// Delays accumulate along the set instead of being absolute
    #[serde(default)]
    pub relative_delay: bool,
    /// Step cursor advances after every press
    #[serde(default = "default_true")]
    pub step_auto_progress: bool,
}

impl Default for ButtonConfig {
    fn default() -> Self {
        Self {
            style: ButtonStyle::None,
            relative_delay: false,
            step_auto_progress: true,
        }
    }
}

impl ButtonConfig {
    pub fn with_style(style: ButtonStyle) -> Self {
        Self {
            style,
            ..Self::default()
        }
    }
}

fn default_true() -> bool {
    true
}

/// Action sets of one button, ordered by set id
pub type ActionSets = BTreeMap<SetId, Vec<ActionInstance>>;

/// `page -> button -> set -> actions`
pub type ActionSetMap = BTreeMap<u32, BTreeMap<u32, ActionSets>>;

/// `page -> button -> config`
pub type ButtonConfigMap = BTreeMap<u32, BTreeMap<u32, ButtonConfig>>;

/// Interpret a declared delay the way the editor stores it
///
/// Numbers are truncated to whole milliseconds, strings use their leading
/// digits. Anything else (missing, empty, negative, non-numeric) is 0.
pub fn parse_delay(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Value::String(s) => {
            let digits: String = s.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().unwrap_or(0)
        }
        _ => 0,
    }
}

fn lenient_delay<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(parse_delay(&value))
}
