//! DelayScheduler - immediate and delayed execution of one action set
//!
//! Zero-delay actions are dispatched inline in list order. Delayed actions get
//! one timer each in the ordered queue, grouped per button so a button's
//! pending work can be cancelled as a unit. A button is "running" exactly while
//! its group has pending timers.

use super::dispatch::Dispatcher;
use super::timers::TimerQueue;
use super::types::{ActionInstance, ButtonKey};
use crate::modules::RunContext;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Work waiting for its deadline
struct PendingRun {
    action: ActionInstance,
    ctx: RunContext,
}

/// Effective delay of every action in a set
///
/// Relative delays accumulate along the list; absolute delays are each
/// action's own declared delay.
pub fn effective_delays(actions: &[ActionInstance], relative: bool) -> Vec<u64> {
    if relative {
        actions
            .iter()
            .scan(0u64, |total, action| {
                *total = total.saturating_add(action.delay);
                Some(*total)
            })
            .collect()
    } else {
        actions.iter().map(|action| action.delay).collect()
    }
}

#[derive(Default)]
pub struct DelayScheduler {
    timers: TimerQueue<ButtonKey, PendingRun>,
    running: BTreeSet<ButtonKey>,
}

impl DelayScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute one resolved set
    ///
    /// Returns true when anything was scheduled with a delay, in which case the
    /// button is already marked running.
    pub fn run_actions(
        &mut self,
        key: ButtonKey,
        actions: &[ActionInstance],
        relative: bool,
        ctx: RunContext,
        now: Instant,
        dispatcher: &Dispatcher,
    ) -> bool {
        let delays = effective_delays(actions, relative);
        let mut has_delayed = false;

        for (action, delay) in actions.iter().zip(delays) {
            if delay == 0 {
                dispatcher.run(action, ctx.clone());
                continue;
            }

            let deadline = now + Duration::from_millis(delay);
            let id = self.timers.schedule(
                key,
                deadline,
                PendingRun {
                    action: action.clone(),
                    ctx: ctx.clone(),
                },
            );
            trace!(button = %key, %id, delay, action_id = %action.id, "Scheduled delayed action");
            has_delayed = true;
        }

        if has_delayed {
            self.running.insert(key);
        }
        self.check_invariants();
        has_delayed
    }

    /// Dispatch every timer due at `now`
    ///
    /// Returns the buttons whose last pending timer just fired.
    pub fn fire_due(&mut self, now: Instant, dispatcher: &Dispatcher) -> Vec<ButtonKey> {
        let mut finished = Vec::new();

        while let Some((id, key, pending)) = self.timers.pop_due(now) {
            trace!(button = %key, %id, action_id = %pending.action.id, "Timer fired");
            dispatcher.run(&pending.action, pending.ctx);

            if !self.timers.has_group(key) && self.running.remove(&key) {
                finished.push(key);
            }
        }

        self.check_invariants();
        finished
    }

    /// Cancel every pending timer of a button; returns whether it was running
    pub fn abort_button(&mut self, key: ButtonKey) -> bool {
        let cancelled = self.timers.cancel_group(key);
        let was_running = self.running.remove(&key);
        if cancelled > 0 {
            debug!(button = %key, cancelled, "Aborted delayed actions");
        }
        self.check_invariants();
        was_running
    }

    /// Cancel everything; returns the buttons that were running
    pub fn abort_all(&mut self) -> Vec<ButtonKey> {
        let pending = self.timers.len();
        let mut affected = self.timers.cancel_all();
        affected.append(&mut self.running);
        if pending > 0 {
            debug!(cancelled = pending, buttons = affected.len(), "Aborted all delayed actions");
        }
        affected.into_iter().collect()
    }

    /// Drop pending runs of a module's actions
    ///
    /// Returns the buttons that stopped running because nothing else is pending.
    pub fn cancel_instance(&mut self, instance_id: &str) -> Vec<ButtonKey> {
        let emptied = self
            .timers
            .cancel_matching(|pending| pending.action.instance_id == instance_id);
        let finished: Vec<ButtonKey> = emptied
            .into_iter()
            .filter(|key| self.running.remove(key))
            .collect();
        if !finished.is_empty() {
            debug!(instance = instance_id, buttons = finished.len(), "Dropped delayed actions of removed module");
        }
        self.check_invariants();
        finished
    }

    pub fn is_running(&self, key: ButtonKey) -> bool {
        self.running.contains(&key)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    fn check_invariants(&self) {
        debug_assert!(
            self.running.iter().all(|key| self.timers.has_group(*key)),
            "running button without pending timers"
        );
    }
}
