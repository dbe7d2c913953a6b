//! Action scheduling & button state engine
//!
//! [`Engine`] composes the store, the per-button state machine, the delay
//! scheduler, the dispatcher and the status aggregator. It is a plain owned
//! value with synchronous methods; [`EngineActor`] wraps it in a single task
//! so every edit, press, timer and status change is processed sequentially.
//!
//! Time is always passed in (`now`) so the scheduling logic can be driven
//! deterministically in tests.

pub mod actor;
pub mod actor_handle;
pub mod buttons;
pub mod commands;
pub mod dispatch;
pub mod events;
pub mod persistence;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod timers;
pub mod types;

#[cfg(test)]
mod tests;

pub use actor::EngineActor;
pub use actor_handle::EngineHandle;
pub use buttons::{ButtonStateMachine, PressAction, PressOutcome, StepPosition};
pub use dispatch::Dispatcher;
pub use events::{EngineEvent, PageNavigation};
pub use persistence::{MemoryPersistence, SetPersistence, SledPersistence};
pub use scheduler::{effective_delays, DelayScheduler};
pub use status::StatusAggregator;
pub use store::ActionSetStore;
pub use types::{
    ActionInstance, ActionReference, ButtonConfig, ButtonKey, ButtonStyle, SetId, MAX_PAGES,
};

use crate::error::Result;
use crate::modules::{ActionDefinitions, InstanceRegistry, RunContext, Severity};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Addressable surface size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub pages: u32,
    pub buttons_per_page: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pages: MAX_PAGES,
            buttons_per_page: 32,
        }
    }
}

/// Snapshot of everything the engine knows about one button
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ButtonState {
    pub key: ButtonKey,
    pub config: ButtonConfig,
    pub sets: Vec<SetId>,
    pub step: Option<StepPosition>,
    pub pushed: bool,
    pub running: bool,
    pub severity: Severity,
}

pub struct Engine {
    settings: EngineSettings,
    store: ActionSetStore,
    buttons: ButtonStateMachine,
    scheduler: DelayScheduler,
    dispatcher: Dispatcher,
    status: StatusAggregator,
    registry: Arc<dyn InstanceRegistry>,
    definitions: HashMap<String, ActionDefinitions>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        store: ActionSetStore,
        registry: Arc<dyn InstanceRegistry>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        info!(
            pages = settings.pages,
            buttons_per_page = settings.buttons_per_page,
            "Engine created"
        );
        Self {
            settings,
            store,
            buttons: ButtonStateMachine::new(),
            scheduler: DelayScheduler::new(),
            dispatcher: Dispatcher::new(registry.clone()),
            status: StatusAggregator::new(),
            registry,
            definitions: HashMap::new(),
            events,
        }
    }

    // =========================================================================
    // Input
    // =========================================================================

    /// Handle a press (`direction = true`) or release edge
    pub fn press(&mut self, key: ButtonKey, direction: bool, device_id: Option<String>, now: Instant) {
        if !self.in_range(key) {
            return;
        }

        let config = self.store.button_config(key);
        let set_ids = self.store.set_ids(key);
        let outcome = self.buttons.resolve(key, &config, &set_ids, direction);

        if let Some(pushed) = outcome.pushed {
            self.emit(EngineEvent::Pushed {
                key,
                pushed,
                device_id: device_id.clone(),
            });
            self.emit(EngineEvent::Redraw { key });
        }

        match outcome.action {
            PressAction::None => {}
            PressAction::Navigate(navigation) => {
                self.emit(EngineEvent::PageNavigation { device_id, navigation });
            }
            PressAction::Run { set, advanced } => {
                if let Some((set_id, index)) = advanced {
                    self.emit(EngineEvent::StepChanged { key, set_id, index });
                    self.emit(EngineEvent::Redraw { key });
                }

                let Some(actions) = self.store.actions(key, set) else {
                    debug!(button = %key, %set, "Resolved set has no entry");
                    return;
                };
                if actions.is_empty() {
                    return;
                }

                let ctx = RunContext::new(key, device_id);
                let has_delayed = self.scheduler.run_actions(
                    key,
                    actions,
                    config.relative_delay,
                    ctx,
                    now,
                    &self.dispatcher,
                );
                if has_delayed {
                    self.emit(EngineEvent::Redraw { key });
                }
            }
        }
    }

    /// Dispatch every delayed action due at `now`
    pub fn fire_due(&mut self, now: Instant) {
        for key in self.scheduler.fire_due(now, &self.dispatcher) {
            self.emit(EngineEvent::Redraw { key });
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Cancel a button's pending delayed actions
    ///
    /// With `skip_up` the pushed indicator is forced released so a later
    /// release edge does not fire the "up" set.
    pub fn abort_button(&mut self, key: ButtonKey, skip_up: bool) -> bool {
        let was_running = self.scheduler.abort_button(key);
        let released = skip_up && self.buttons.force_release(key);

        if released {
            self.emit(EngineEvent::Pushed {
                key,
                pushed: false,
                device_id: None,
            });
        }
        if was_running || released {
            self.emit(EngineEvent::Redraw { key });
        }
        was_running
    }

    /// Cancel every pending delayed action
    pub fn abort_all(&mut self) -> usize {
        let affected = self.scheduler.abort_all();
        for key in &affected {
            self.emit(EngineEvent::Redraw { key: *key });
        }
        affected.len()
    }

    // =========================================================================
    // Button configuration
    // =========================================================================

    /// Assign a style, replacing the button's sets with the style's layout
    pub fn set_button_style(&mut self, key: ButtonKey, style: ButtonStyle) -> Result<bool> {
        if !self.in_range(key) {
            return Ok(false);
        }
        if style.is_page_navigation() {
            self.reset_button(key)?;
        }

        let removed = self.store.setup_button(key, style)?;
        self.scheduler.abort_button(key);
        for action in &removed {
            self.dispatcher.unsubscribe(action);
        }
        self.buttons.forget(key);

        info!(button = %key, %style, "Button style set");
        self.emit(EngineEvent::SetsChanged {
            key,
            set_ids: self.store.set_ids(key),
        });
        self.refresh_status(key);
        self.emit(EngineEvent::Redraw { key });
        Ok(true)
    }

    /// Remove every set, action and setting of a button
    pub fn reset_button(&mut self, key: ButtonKey) -> Result<bool> {
        if !self.in_range(key) {
            return Ok(false);
        }

        let removed = self.store.reset_button(key)?;
        self.scheduler.abort_button(key);
        for action in &removed {
            self.dispatcher.unsubscribe(action);
        }
        self.buttons.forget(key);

        self.emit(EngineEvent::SetsChanged {
            key,
            set_ids: Vec::new(),
        });
        self.refresh_status(key);
        self.emit(EngineEvent::Redraw { key });
        Ok(true)
    }

    pub fn set_relative_delay(&mut self, key: ButtonKey, relative: bool) -> Result<bool> {
        if !self.in_range(key) {
            return Ok(false);
        }
        self.store.set_relative_delay(key, relative)
    }

    pub fn set_step_auto_progress(&mut self, key: ButtonKey, enabled: bool) -> Result<bool> {
        if !self.in_range(key) {
            return Ok(false);
        }
        self.store.set_step_auto_progress(key, enabled)
    }

    // =========================================================================
    // Sets
    // =========================================================================

    pub fn add_set(&mut self, key: ButtonKey) -> Result<Option<SetId>> {
        if !self.in_range(key) {
            return Ok(None);
        }
        let added = self.store.add_set(key)?;
        if added.is_some() {
            self.emit_set_list(key);
        }
        Ok(added)
    }

    pub fn remove_set(&mut self, key: ButtonKey, set: SetId) -> Result<bool> {
        if !self.in_range(key) {
            return Ok(false);
        }
        let Some(removed) = self.store.remove_set(key, set)? else {
            return Ok(false);
        };
        for action in &removed {
            self.dispatcher.unsubscribe(action);
        }

        let remaining = self.store.set_ids(key);
        if let Some((set_id, index)) = self.buttons.relocate_after_removal(key, set, &remaining) {
            self.emit(EngineEvent::StepChanged { key, set_id, index });
            self.emit(EngineEvent::Redraw { key });
        }
        self.emit_set_list(key);
        self.refresh_status(key);
        Ok(true)
    }

    pub fn swap_sets(&mut self, key: ButtonKey, a: SetId, b: SetId) -> Result<bool> {
        if !self.in_range(key) || !self.store.swap_sets(key, a, b)? {
            return Ok(false);
        }
        self.emit(EngineEvent::SetsReloaded {
            key,
            set_ids: self.store.set_ids(key),
        });
        self.emit(EngineEvent::Redraw { key });
        Ok(true)
    }

    // =========================================================================
    // Step cursor
    // =========================================================================

    /// Point the cursor of a step button at an existing set
    pub fn set_step(&mut self, key: ButtonKey, set: SetId) -> bool {
        let Some(set_ids) = self.step_ids(key) else {
            return false;
        };
        let moved = self.buttons.set_cursor(key, set, &set_ids);
        self.emit_step(key, moved)
    }

    /// Move the cursor by `amount` sets, wrapping around
    pub fn step_delta(&mut self, key: ButtonKey, amount: i64) -> bool {
        let Some(set_ids) = self.step_ids(key) else {
            return false;
        };
        let moved = self.buttons.step_delta(key, &set_ids, amount);
        self.emit_step(key, moved)
    }

    /// Move the cursor to the `n`th set, counting from 1
    pub fn step_to(&mut self, key: ButtonKey, n: usize) -> bool {
        let Some(set_ids) = self.step_ids(key) else {
            return false;
        };
        let moved = self.buttons.step_to(key, &set_ids, n);
        self.emit_step(key, moved)
    }

    // =========================================================================
    // Actions
    // =========================================================================

    /// Build a new action for `reference` with its definition's option defaults
    pub fn action_defaults(&self, reference: &ActionReference) -> ActionInstance {
        let options: Map<String, Value> = self
            .definitions
            .get(&reference.instance_id)
            .and_then(|defs| defs.get(&reference.action_kind))
            .map(|def| {
                def.options
                    .iter()
                    .map(|opt| (opt.id.clone(), opt.default.clone()))
                    .collect()
            })
            .unwrap_or_default();
        ActionInstance::new(reference, options)
    }

    /// Append a new action to an existing set, returning its id
    pub fn add_action(&mut self, key: ButtonKey, set: SetId, reference: &ActionReference) -> Result<Option<String>> {
        if !self.in_range(key) {
            return Ok(None);
        }
        let action = self.action_defaults(reference);
        let id = action.id.clone();
        if !self.store.add_action(key, set, action.clone())? {
            return Ok(None);
        }

        self.dispatcher.subscribe(&action, key);
        self.emit_set_contents(key);
        self.refresh_status(key);
        Ok(Some(id))
    }

    pub fn delete_action(&mut self, key: ButtonKey, set: SetId, action_id: &str) -> Result<bool> {
        if !self.in_range(key) {
            return Ok(false);
        }
        let Some(removed) = self.store.delete_action(key, set, action_id)? else {
            return Ok(false);
        };

        self.dispatcher.unsubscribe(&removed);
        self.emit_set_contents(key);
        self.refresh_status(key);
        Ok(true)
    }

    pub fn reorder_actions(&mut self, key: ButtonKey, set: SetId, from: usize, to: usize) -> Result<bool> {
        if !self.in_range(key) || !self.store.reorder_actions(key, set, from, to)? {
            return Ok(false);
        }
        self.emit_set_contents(key);
        Ok(true)
    }

    pub fn update_action_option(
        &mut self,
        key: ButtonKey,
        set: SetId,
        action_id: &str,
        option: &str,
        value: Value,
    ) -> Result<bool> {
        if !self.in_range(key) {
            return Ok(false);
        }
        let Some(updated) = self.store.update_action_option(key, set, action_id, option, value)? else {
            return Ok(false);
        };
        self.dispatcher.subscribe(&updated, key);
        self.refresh_status(key);
        Ok(true)
    }

    pub fn update_action_delay(&mut self, key: ButtonKey, set: SetId, action_id: &str, delay: u64) -> Result<bool> {
        if !self.in_range(key) {
            return Ok(false);
        }
        let Some(updated) = self.store.update_action_delay(key, set, action_id, delay)? else {
            return Ok(false);
        };
        self.dispatcher.subscribe(&updated, key);
        self.refresh_status(key);
        Ok(true)
    }

    // =========================================================================
    // Module instances
    // =========================================================================

    /// Publish (or withdraw, with `None`) the action kinds of a module
    pub fn set_action_definitions(&mut self, instance_id: &str, definitions: Option<ActionDefinitions>) {
        match &definitions {
            Some(defs) => {
                self.definitions.insert(instance_id.to_string(), defs.clone());
            }
            None => {
                self.definitions.remove(instance_id);
            }
        }
        self.emit(EngineEvent::ModuleDefinitionsChanged {
            instance_id: instance_id.to_string(),
            definitions,
        });
    }

    pub fn action_definitions(&self, instance_id: &str) -> Option<&ActionDefinitions> {
        self.definitions.get(instance_id)
    }

    /// Remove every trace of a deleted module
    pub fn delete_instance(&mut self, instance_id: &str) -> Result<()> {
        let touched = self.store.remove_instance_actions(instance_id)?;
        if self.definitions.contains_key(instance_id) {
            self.set_action_definitions(instance_id, None);
        }
        for key in self.scheduler.cancel_instance(instance_id) {
            self.emit(EngineEvent::Redraw { key });
        }
        for key in touched {
            self.emit_set_contents(key);
            self.refresh_status(key);
        }
        Ok(())
    }

    /// Drop actions of modules that are not configured, returning how many
    /// buttons changed
    pub fn retain_instances(&mut self, instances: &HashSet<String>) -> Result<usize> {
        let touched = self.store.retain_instances(instances)?;
        for key in &touched {
            self.emit_set_contents(*key);
        }
        Ok(touched.len())
    }

    /// Register every stored action with its module
    pub fn subscribe_all(&self) -> usize {
        let actions = self.store.all_actions();
        for (key, action) in &actions {
            self.dispatcher.subscribe(action, *key);
        }
        debug!("Subscribed {} stored actions", actions.len());
        actions.len()
    }

    /// A module's health changed: re-evaluate every button
    pub fn health_changed(&mut self, instance_id: &str) {
        debug!(instance = instance_id, "Re-evaluating button status");
        self.check_all_status();
    }

    pub fn check_all_status(&mut self) {
        for key in self.store.button_keys() {
            self.refresh_status(key);
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn set_ids(&self, key: ButtonKey) -> Vec<SetId> {
        self.store.set_ids(key)
    }

    pub fn actions(&self, key: ButtonKey, set: SetId) -> Vec<ActionInstance> {
        self.store
            .actions(key, set)
            .map(<[ActionInstance]>::to_vec)
            .unwrap_or_default()
    }

    /// Cursor position of a step button
    pub fn current_step(&self, key: ButtonKey) -> Option<StepPosition> {
        let set_ids = self.step_ids(key)?;
        self.buttons.current(key, &set_ids)
    }

    pub fn button_state(&self, key: ButtonKey) -> ButtonState {
        ButtonState {
            key,
            config: self.store.button_config(key),
            sets: self.store.set_ids(key),
            step: self.current_step(key),
            pushed: self.buttons.is_pushed(key),
            running: self.scheduler.is_running(key),
            severity: self.status.severity(key),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn in_range(&self, key: ButtonKey) -> bool {
        let ok = (1..=self.settings.pages).contains(&key.page)
            && (1..=self.settings.buttons_per_page).contains(&key.button);
        if !ok {
            debug!(button = %key, "Button outside the surface, ignoring");
        }
        ok
    }

    fn step_ids(&self, key: ButtonKey) -> Option<Vec<SetId>> {
        if !self.in_range(key) || self.store.style(key) != ButtonStyle::Step {
            return None;
        }
        Some(self.store.set_ids(key))
    }

    fn refresh_status(&mut self, key: ButtonKey) {
        let instance_ids = self.store.instance_ids(key);
        if self.status.recompute(key, &instance_ids, self.registry.as_ref()) {
            self.emit(EngineEvent::Redraw { key });
        }
    }

    fn emit_step(&self, key: ButtonKey, moved: Option<StepPosition>) -> bool {
        let Some((set_id, index)) = moved else {
            return false;
        };
        self.emit(EngineEvent::StepChanged { key, set_id, index });
        self.emit(EngineEvent::Redraw { key });
        true
    }

    fn emit_set_list(&self, key: ButtonKey) {
        self.emit(EngineEvent::SetsChanged {
            key,
            set_ids: self.store.set_ids(key),
        });
    }

    fn emit_set_contents(&self, key: ButtonKey) {
        self.emit(EngineEvent::SetsReloaded {
            key,
            set_ids: self.store.set_ids(key),
        });
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}
