//! ButtonStateMachine - maps press/release edges to the active action set
//!
//! Press buttons track a pushed flag (Released/Pressed). Step buttons keep a
//! cursor on one of their set ids; the cursor is transient and falls back to
//! the first set when unset or pointing at a removed id. Page-navigation
//! styles only produce a navigation signal.

use super::events::PageNavigation;
use super::types::{ButtonConfig, ButtonKey, ButtonStyle, SetId};
use std::collections::{HashMap, HashSet};
use tracing::trace;

/// Cursor position: the set id and its index among the sorted ids
pub type StepPosition = (SetId, usize);

/// What a press/release edge resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PressOutcome {
    /// New pushed value, when the edge changed it
    pub pushed: Option<bool>,
    pub action: PressAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PressAction {
    /// Nothing to dispatch
    None,
    /// Page-navigation style pressed
    Navigate(PageNavigation),
    /// Run the actions of `set`
    Run {
        set: SetId,
        /// Cursor position after auto-progress, when it moved
        advanced: Option<StepPosition>,
    },
}

#[derive(Debug, Default)]
pub struct ButtonStateMachine {
    pushed: HashSet<ButtonKey>,
    cursors: HashMap<ButtonKey, SetId>,
}

impl ButtonStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve one edge; `set_ids` must be the button's ids in ascending order
    pub fn resolve(
        &mut self,
        key: ButtonKey,
        config: &ButtonConfig,
        set_ids: &[SetId],
        direction: bool,
    ) -> PressOutcome {
        let outcome = match config.style {
            ButtonStyle::PageUp | ButtonStyle::PageDown | ButtonStyle::PageNum => {
                let action = if direction {
                    PressAction::Navigate(match config.style {
                        ButtonStyle::PageUp => PageNavigation::Up,
                        ButtonStyle::PageDown => PageNavigation::Down,
                        _ => PageNavigation::Set(1),
                    })
                } else {
                    PressAction::None
                };
                PressOutcome { pushed: None, action }
            }
            ButtonStyle::None => PressOutcome {
                pushed: None,
                action: PressAction::None,
            },
            ButtonStyle::Press => self.resolve_press(key, direction),
            ButtonStyle::Step => self.resolve_step(key, config, set_ids, direction),
        };

        trace!(button = %key, direction, ?outcome, "Edge resolved");
        outcome
    }

    fn resolve_press(&mut self, key: ButtonKey, direction: bool) -> PressOutcome {
        if direction {
            let changed = self.pushed.insert(key);
            PressOutcome {
                pushed: changed.then_some(true),
                action: PressAction::Run {
                    set: SetId::Down,
                    advanced: None,
                },
            }
        } else if self.pushed.remove(&key) {
            PressOutcome {
                pushed: Some(false),
                action: PressAction::Run {
                    set: SetId::Up,
                    advanced: None,
                },
            }
        } else {
            PressOutcome {
                pushed: None,
                action: PressAction::None,
            }
        }
    }

    fn resolve_step(
        &mut self,
        key: ButtonKey,
        config: &ButtonConfig,
        set_ids: &[SetId],
        direction: bool,
    ) -> PressOutcome {
        let pushed = if direction {
            self.pushed.insert(key).then_some(true)
        } else {
            self.pushed.remove(&key).then_some(false)
        };

        if !direction {
            return PressOutcome {
                pushed,
                action: PressAction::None,
            };
        }

        let Some((set, index)) = self.current(key, set_ids) else {
            return PressOutcome {
                pushed,
                action: PressAction::None,
            };
        };

        let advanced = if config.step_auto_progress {
            let next_index = (index + 1) % set_ids.len();
            let next = set_ids[next_index];
            let previous = self.cursors.insert(key, next);
            (previous != Some(next)).then_some((next, next_index))
        } else {
            None
        };

        PressOutcome {
            pushed,
            action: PressAction::Run { set, advanced },
        }
    }

    // =========================================================================
    // Step cursor
    // =========================================================================

    /// Effective cursor position, or `None` when there are no sets
    pub fn current(&self, key: ButtonKey, set_ids: &[SetId]) -> Option<StepPosition> {
        let first = *set_ids.first()?;
        let position = self
            .cursors
            .get(&key)
            .and_then(|cursor| set_ids.iter().position(|id| id == cursor).map(|i| (*cursor, i)))
            .unwrap_or((first, 0));
        Some(position)
    }

    /// Point the cursor at an existing id
    pub fn set_cursor(&mut self, key: ButtonKey, set: SetId, set_ids: &[SetId]) -> Option<StepPosition> {
        let index = set_ids.iter().position(|id| *id == set)?;
        self.cursors.insert(key, set);
        Some((set, index))
    }

    /// Move the cursor by `amount`, wrapping in both directions
    pub fn step_delta(&mut self, key: ButtonKey, set_ids: &[SetId], amount: i64) -> Option<StepPosition> {
        if amount == 0 {
            return None;
        }
        let (_, index) = self.current(key, set_ids)?;
        let len = set_ids.len() as i64;
        let next_index = (index as i64 + amount).rem_euclid(len) as usize;
        let next = set_ids[next_index];
        self.cursors.insert(key, next);
        Some((next, next_index))
    }

    /// Move the cursor to the 1-based position `n`
    pub fn step_to(&mut self, key: ButtonKey, set_ids: &[SetId], n: usize) -> Option<StepPosition> {
        let index = n.checked_sub(1)?;
        let set = *set_ids.get(index)?;
        self.cursors.insert(key, set);
        Some((set, index))
    }

    /// Relocate the cursor after `removed` was deleted
    ///
    /// Only moves when the effective cursor was on `removed`; the cursor goes
    /// to the next id in sorted order, wrapping to the first.
    pub fn relocate_after_removal(
        &mut self,
        key: ButtonKey,
        removed: SetId,
        remaining: &[SetId],
    ) -> Option<StepPosition> {
        let first_remaining = *remaining.first()?;
        let effective = match self.cursors.get(&key) {
            Some(cursor) if *cursor == removed || remaining.contains(cursor) => *cursor,
            _ => removed.min(first_remaining),
        };
        if effective != removed {
            return None;
        }

        let (next, index) = remaining
            .iter()
            .enumerate()
            .find(|(_, id)| **id > removed)
            .map(|(i, id)| (*id, i))
            .unwrap_or((first_remaining, 0));
        self.cursors.insert(key, next);
        Some((next, index))
    }

    // =========================================================================
    // Pushed indicator
    // =========================================================================

    pub fn is_pushed(&self, key: ButtonKey) -> bool {
        self.pushed.contains(&key)
    }

    /// Force the released state; returns whether the button was pushed
    pub fn force_release(&mut self, key: ButtonKey) -> bool {
        self.pushed.remove(&key)
    }

    /// Forget all transient state of a button
    pub fn forget(&mut self, key: ButtonKey) {
        self.pushed.remove(&key);
        self.cursors.remove(&key);
    }
}
