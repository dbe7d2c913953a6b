//! ActionSetStore - persistent `page -> button -> set -> actions` table
//!
//! Owns the action sets and per-button configuration. Every mutation is
//! applied to a copy and written through to the persistence backend; the live
//! tables only change once the write succeeded. Missing buttons, sets
//! or actions are configuration misses: logged at debug level and reported as
//! `Ok(false)` / `Ok(None)` rather than errors.

use super::persistence::{MemoryPersistence, SetPersistence};
use super::types::{
    ActionInstance, ActionSetMap, ActionSets, ButtonConfig, ButtonConfigMap, ButtonKey,
    ButtonStyle, SetId,
};
use crate::error::Result;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info};

pub struct ActionSetStore {
    sets: ActionSetMap,
    buttons: ButtonConfigMap,
    persistence: Box<dyn SetPersistence>,
}

impl ActionSetStore {
    /// Load both tables from `persistence`
    pub fn open(persistence: Box<dyn SetPersistence>) -> Result<Self> {
        let sets = persistence.load_action_sets()?;
        let buttons = persistence.load_buttons()?;

        let action_count: usize = sets
            .values()
            .flat_map(|page| page.values())
            .flat_map(|button| button.values())
            .map(Vec::len)
            .sum();
        info!(
            "Loaded {} configured buttons with {} actions",
            buttons.values().map(|page| page.len()).sum::<usize>(),
            action_count
        );

        Ok(Self {
            sets,
            buttons,
            persistence,
        })
    }

    /// Empty store backed by memory
    pub fn in_memory() -> Self {
        Self {
            sets: ActionSetMap::new(),
            buttons: ButtonConfigMap::new(),
            persistence: Box::new(MemoryPersistence::new()),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Configuration of a button, defaulting to an unconfigured one
    pub fn button_config(&self, key: ButtonKey) -> ButtonConfig {
        self.buttons
            .get(&key.page)
            .and_then(|page| page.get(&key.button))
            .cloned()
            .unwrap_or_default()
    }

    pub fn style(&self, key: ButtonKey) -> ButtonStyle {
        self.button_config(key).style
    }

    pub fn sets(&self, key: ButtonKey) -> Option<&ActionSets> {
        self.sets.get(&key.page).and_then(|page| page.get(&key.button))
    }

    /// Set ids of a button in ascending order
    pub fn set_ids(&self, key: ButtonKey) -> Vec<SetId> {
        self.sets(key)
            .map(|sets| sets.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn actions(&self, key: ButtonKey, set: SetId) -> Option<&[ActionInstance]> {
        self.sets(key)
            .and_then(|sets| sets.get(&set))
            .map(Vec::as_slice)
    }

    /// Distinct module instances referenced across every set of a button
    pub fn instance_ids(&self, key: ButtonKey) -> BTreeSet<String> {
        self.sets(key)
            .map(|sets| {
                sets.values()
                    .flatten()
                    .map(|action| action.instance_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every button that has sets or configuration
    pub fn button_keys(&self) -> BTreeSet<ButtonKey> {
        let from_sets = self.sets.iter().flat_map(|(page, buttons)| {
            buttons.keys().map(move |button| ButtonKey::new(*page, *button))
        });
        let from_config = self.buttons.iter().flat_map(|(page, buttons)| {
            buttons.keys().map(move |button| ButtonKey::new(*page, *button))
        });
        from_sets.chain(from_config).collect()
    }

    /// Every stored action with the button that owns it
    pub fn all_actions(&self) -> Vec<(ButtonKey, ActionInstance)> {
        let mut out = Vec::new();
        for (page, buttons) in &self.sets {
            for (button, sets) in buttons {
                let key = ButtonKey::new(*page, *button);
                for action in sets.values().flatten() {
                    out.push((key, action.clone()));
                }
            }
        }
        out
    }

    // =========================================================================
    // Button lifecycle
    // =========================================================================

    /// Assign a style, replacing every set with the style's initial layout
    ///
    /// Returns the actions that were dropped so the caller can unsubscribe them.
    pub fn setup_button(&mut self, key: ButtonKey, style: ButtonStyle) -> Result<Vec<ActionInstance>> {
        let removed = self.edit_all(|sets, buttons| {
            let removed = take_sets(sets, key);

            let mut initial = ActionSets::new();
            match style {
                ButtonStyle::Press => {
                    initial.insert(SetId::Down, Vec::new());
                    initial.insert(SetId::Up, Vec::new());
                }
                ButtonStyle::Step => {
                    initial.insert(SetId::Step(0), Vec::new());
                }
                _ => {}
            }
            if !initial.is_empty() {
                sets.entry(key.page).or_default().insert(key.button, initial);
            }
            config_entry(buttons, key).style = style;
            removed
        })?;

        debug!(button = %key, %style, dropped = removed.len(), "Button style assigned");
        Ok(removed)
    }

    /// Drop every set and the style of a button
    pub fn reset_button(&mut self, key: ButtonKey) -> Result<Vec<ActionInstance>> {
        let removed = self.edit_all(|sets, buttons| {
            let removed = take_sets(sets, key);
            if let Some(page) = buttons.get_mut(&key.page) {
                page.remove(&key.button);
                if page.is_empty() {
                    buttons.remove(&key.page);
                }
            }
            removed
        })?;

        debug!(button = %key, dropped = removed.len(), "Button reset");
        Ok(removed)
    }

    pub fn set_relative_delay(&mut self, key: ButtonKey, relative: bool) -> Result<bool> {
        if !self.is_configured(key) {
            debug!(button = %key, "Relative delay change on unconfigured button ignored");
            return Ok(false);
        }
        self.edit_buttons(|buttons| config_entry(buttons, key).relative_delay = relative)?;
        Ok(true)
    }

    pub fn set_step_auto_progress(&mut self, key: ButtonKey, enabled: bool) -> Result<bool> {
        if !self.is_configured(key) {
            debug!(button = %key, "Auto-progress change on unconfigured button ignored");
            return Ok(false);
        }
        self.edit_buttons(|buttons| config_entry(buttons, key).step_auto_progress = enabled)?;
        Ok(true)
    }

    // =========================================================================
    // Sets
    // =========================================================================

    /// Append a numeric set to a step button
    ///
    /// The new id is one past the highest existing id, or 0 when none exist.
    pub fn add_set(&mut self, key: ButtonKey) -> Result<Option<SetId>> {
        if self.style(key) != ButtonStyle::Step {
            debug!(button = %key, "Adding a set to a non-step button is a no-op");
            return Ok(None);
        }

        self.edit_sets(|all| {
            let sets = all.entry(key.page).or_default().entry(key.button).or_default();
            let next = sets
                .keys()
                .filter_map(|id| match id {
                    SetId::Step(n) => Some(n + 1),
                    _ => None,
                })
                .max()
                .unwrap_or(0);
            let id = SetId::Step(next);
            sets.insert(id, Vec::new());
            Some(id)
        })
    }

    /// Remove a numeric set, refusing to remove the last one
    pub fn remove_set(&mut self, key: ButtonKey, set: SetId) -> Result<Option<Vec<ActionInstance>>> {
        if self.style(key) != ButtonStyle::Step || !set.is_step() {
            debug!(button = %key, %set, "Only step sets can be removed");
            return Ok(None);
        }

        self.edit_sets(|all| {
            let Some(sets) = button_sets(all, key) else {
                debug!(button = %key, "No sets to remove from");
                return None;
            };
            if sets.len() <= 1 {
                debug!(button = %key, %set, "Refusing to remove the last set");
                return None;
            }
            let removed = sets.remove(&set);
            if removed.is_none() {
                debug!(button = %key, %set, "Set not found");
            }
            removed
        })
    }

    /// Exchange the action lists of two step sets
    pub fn swap_sets(&mut self, key: ButtonKey, a: SetId, b: SetId) -> Result<bool> {
        if self.style(key) != ButtonStyle::Step {
            debug!(button = %key, "Swapping sets on a non-step button is a no-op");
            return Ok(false);
        }

        let swapped = self.edit_sets(|all| {
            let sets = button_sets(all, key)?;
            if a == b || !sets.contains_key(&a) || !sets.contains_key(&b) {
                debug!(button = %key, %a, %b, "Cannot swap missing sets");
                return None;
            }
            let first = sets.remove(&a).unwrap_or_default();
            let second = sets.insert(b, first).unwrap_or_default();
            sets.insert(a, second);
            Some(())
        })?;
        Ok(swapped.is_some())
    }

    // =========================================================================
    // Actions
    // =========================================================================

    /// Move an action inside its set; `to` past the end moves it last
    pub fn reorder_actions(&mut self, key: ButtonKey, set: SetId, from: usize, to: usize) -> Result<bool> {
        let moved = self.edit_sets(|all| {
            let Some(actions) = set_actions(all, key, set) else {
                debug!(button = %key, %set, "Reorder on missing set ignored");
                return None;
            };
            if from >= actions.len() {
                debug!(button = %key, %set, from, "Reorder index out of range");
                return None;
            }
            let action = actions.remove(from);
            let to = to.min(actions.len());
            actions.insert(to, action);
            Some(())
        })?;
        Ok(moved.is_some())
    }

    /// Append an action to an existing set
    pub fn add_action(&mut self, key: ButtonKey, set: SetId, action: ActionInstance) -> Result<bool> {
        let added = self.edit_sets(|all| {
            let Some(actions) = set_actions(all, key, set) else {
                debug!(button = %key, %set, "Add action on missing set ignored");
                return None;
            };
            actions.push(action);
            Some(())
        })?;
        Ok(added.is_some())
    }

    pub fn delete_action(&mut self, key: ButtonKey, set: SetId, action_id: &str) -> Result<Option<ActionInstance>> {
        self.edit_sets(|all| {
            let Some(actions) = set_actions(all, key, set) else {
                debug!(button = %key, %set, "Delete action on missing set ignored");
                return None;
            };
            let Some(pos) = actions.iter().position(|a| a.id == action_id) else {
                debug!(button = %key, %set, action_id, "Action not found");
                return None;
            };
            Some(actions.remove(pos))
        })
    }

    /// Set one option of an action, returning the updated action
    pub fn update_action_option(
        &mut self,
        key: ButtonKey,
        set: SetId,
        action_id: &str,
        option: &str,
        value: Value,
    ) -> Result<Option<ActionInstance>> {
        self.edit_sets(|all| {
            let action = find_action(all, key, set, action_id)?;
            action.options.insert(option.to_string(), value);
            Some(action.clone())
        })
    }

    /// Set the declared delay of an action, returning the updated action
    pub fn update_action_delay(
        &mut self,
        key: ButtonKey,
        set: SetId,
        action_id: &str,
        delay: u64,
    ) -> Result<Option<ActionInstance>> {
        self.edit_sets(|all| {
            let action = find_action(all, key, set, action_id)?;
            action.delay = delay;
            Some(action.clone())
        })
    }

    // =========================================================================
    // Instance-wide edits
    // =========================================================================

    /// Remove every action bound to `instance_id`, returning the buttons touched
    pub fn remove_instance_actions(&mut self, instance_id: &str) -> Result<Vec<ButtonKey>> {
        let touched = self
            .edit_sets(|all| non_empty(prune(all, |action| action.instance_id != instance_id)))?
            .unwrap_or_default();
        if !touched.is_empty() {
            info!("Removed actions of '{}' from {} buttons", instance_id, touched.len());
        }
        Ok(touched)
    }

    /// Keep only actions bound to one of `instances`, returning the buttons touched
    pub fn retain_instances(&mut self, instances: &HashSet<String>) -> Result<Vec<ButtonKey>> {
        let touched = self
            .edit_sets(|all| non_empty(prune(all, |action| instances.contains(&action.instance_id))))?
            .unwrap_or_default();
        if !touched.is_empty() {
            info!("Pruned actions of unknown instances from {} buttons", touched.len());
        }
        Ok(touched)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Apply `edit` to a copy of the set table; the copy replaces the live
    /// table only once it has been saved. `None` from `edit` is a miss and
    /// writes nothing.
    fn edit_sets<T>(&mut self, edit: impl FnOnce(&mut ActionSetMap) -> Option<T>) -> Result<Option<T>> {
        let mut sets = self.sets.clone();
        let Some(out) = edit(&mut sets) else {
            return Ok(None);
        };
        self.persistence.save_action_sets(&sets)?;
        self.sets = sets;
        Ok(Some(out))
    }

    fn edit_buttons<T>(&mut self, edit: impl FnOnce(&mut ButtonConfigMap) -> T) -> Result<T> {
        let mut buttons = self.buttons.clone();
        let out = edit(&mut buttons);
        self.persistence.save_buttons(&buttons)?;
        self.buttons = buttons;
        Ok(out)
    }

    /// Both tables, saved in one write
    fn edit_all<T>(&mut self, edit: impl FnOnce(&mut ActionSetMap, &mut ButtonConfigMap) -> T) -> Result<T> {
        let mut sets = self.sets.clone();
        let mut buttons = self.buttons.clone();
        let out = edit(&mut sets, &mut buttons);
        self.persistence.save_all(&sets, &buttons)?;
        self.sets = sets;
        self.buttons = buttons;
        Ok(out)
    }

    fn is_configured(&self, key: ButtonKey) -> bool {
        self.buttons
            .get(&key.page)
            .is_some_and(|page| page.contains_key(&key.button))
    }
}

fn config_entry(buttons: &mut ButtonConfigMap, key: ButtonKey) -> &mut ButtonConfig {
    buttons.entry(key.page).or_default().entry(key.button).or_default()
}

fn button_sets(all: &mut ActionSetMap, key: ButtonKey) -> Option<&mut ActionSets> {
    all.get_mut(&key.page).and_then(|page| page.get_mut(&key.button))
}

fn set_actions(all: &mut ActionSetMap, key: ButtonKey, set: SetId) -> Option<&mut Vec<ActionInstance>> {
    button_sets(all, key).and_then(|sets| sets.get_mut(&set))
}

fn find_action<'a>(
    all: &'a mut ActionSetMap,
    key: ButtonKey,
    set: SetId,
    action_id: &str,
) -> Option<&'a mut ActionInstance> {
    let found = set_actions(all, key, set).and_then(|actions| actions.iter_mut().find(|a| a.id == action_id));
    if found.is_none() {
        debug!(button = %key, %set, action_id, "Action not found");
    }
    found
}

/// Remove a button's sets, returning every action they held
fn take_sets(all: &mut ActionSetMap, key: ButtonKey) -> Vec<ActionInstance> {
    let Some(page) = all.get_mut(&key.page) else {
        return Vec::new();
    };
    let removed = page
        .remove(&key.button)
        .map(|sets| sets.into_values().flatten().collect())
        .unwrap_or_default();
    if page.is_empty() {
        all.remove(&key.page);
    }
    removed
}

fn prune(all: &mut ActionSetMap, mut keep: impl FnMut(&ActionInstance) -> bool) -> Vec<ButtonKey> {
    let mut touched = Vec::new();
    for (page, buttons) in all.iter_mut() {
        for (button, sets) in buttons.iter_mut() {
            let mut changed = false;
            for actions in sets.values_mut() {
                let before = actions.len();
                actions.retain(&mut keep);
                changed |= actions.len() != before;
            }
            if changed {
                touched.push(ButtonKey::new(*page, *button));
            }
        }
    }
    touched
}

fn non_empty(touched: Vec<ButtonKey>) -> Option<Vec<ButtonKey>> {
    (!touched.is_empty()).then_some(touched)
}
