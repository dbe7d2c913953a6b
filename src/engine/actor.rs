//! EngineActor - single owner task for the engine
//!
//! The actor owns the [`Engine`] and interleaves two event sources: commands
//! from the channel and the earliest timer deadline. Both are handled on the
//! same task, so timer callbacks never race edits or presses.

use super::actor_handle::EngineHandle;
use super::commands::EngineCommand;
use super::Engine;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace};

/// Sleep used when no timer is pending; the branch is disabled anyway
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

pub struct EngineActor {
    engine: Engine,
    command_rx: mpsc::UnboundedReceiver<EngineCommand>,
}

impl EngineActor {
    /// Spawn the actor loop and return a handle to it
    pub fn spawn(engine: Engine) -> EngineHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = EngineActor {
            engine,
            command_rx: cmd_rx,
        };

        tokio::spawn(actor.run());
        info!("EngineActor spawned");

        EngineHandle::new(cmd_tx)
    }

    async fn run(mut self) {
        debug!("EngineActor run loop started");

        loop {
            let deadline = self.engine.next_deadline();
            let wake_at = deadline.unwrap_or_else(|| Instant::now() + IDLE_SLEEP);

            tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = sleep_until(wake_at), if deadline.is_some() => {
                    self.engine.fire_due(Instant::now());
                }
            }
        }

        let aborted = self.engine.abort_all();
        info!("EngineActor stopped ({} buttons had pending actions)", aborted);
    }

    fn handle(&mut self, cmd: EngineCommand) {
        trace!(?cmd, "Processing command");
        let engine = &mut self.engine;

        match cmd {
            EngineCommand::Press { key, direction, device_id } => {
                engine.press(key, direction, device_id, Instant::now());
            }
            EngineCommand::HealthChanged { instance_id } => {
                engine.health_changed(&instance_id);
            }

            EngineCommand::AbortButton { key, skip_up, respond_to } => {
                let _ = respond_to.send(engine.abort_button(key, skip_up));
            }
            EngineCommand::AbortAll { respond_to } => {
                let _ = respond_to.send(engine.abort_all());
            }

            EngineCommand::SetButtonStyle { key, style, respond_to } => {
                let _ = respond_to.send(engine.set_button_style(key, style));
            }
            EngineCommand::ResetButton { key, respond_to } => {
                let _ = respond_to.send(engine.reset_button(key));
            }
            EngineCommand::SetRelativeDelay { key, relative, respond_to } => {
                let _ = respond_to.send(engine.set_relative_delay(key, relative));
            }
            EngineCommand::SetStepAutoProgress { key, enabled, respond_to } => {
                let _ = respond_to.send(engine.set_step_auto_progress(key, enabled));
            }

            EngineCommand::AddSet { key, respond_to } => {
                let _ = respond_to.send(engine.add_set(key));
            }
            EngineCommand::RemoveSet { key, set, respond_to } => {
                let _ = respond_to.send(engine.remove_set(key, set));
            }
            EngineCommand::SwapSets { key, a, b, respond_to } => {
                let _ = respond_to.send(engine.swap_sets(key, a, b));
            }
            EngineCommand::SetStep { key, set, respond_to } => {
                let _ = respond_to.send(engine.set_step(key, set));
            }
            EngineCommand::StepDelta { key, amount, respond_to } => {
                let _ = respond_to.send(engine.step_delta(key, amount));
            }
            EngineCommand::StepTo { key, n, respond_to } => {
                let _ = respond_to.send(engine.step_to(key, n));
            }

            EngineCommand::AddAction { key, set, reference, respond_to } => {
                let _ = respond_to.send(engine.add_action(key, set, &reference));
            }
            EngineCommand::DeleteAction { key, set, action_id, respond_to } => {
                let _ = respond_to.send(engine.delete_action(key, set, &action_id));
            }
            EngineCommand::ReorderActions { key, set, from, to, respond_to } => {
                let _ = respond_to.send(engine.reorder_actions(key, set, from, to));
            }
            EngineCommand::UpdateActionOption {
                key,
                set,
                action_id,
                option,
                value,
                respond_to,
            } => {
                let _ = respond_to.send(engine.update_action_option(key, set, &action_id, &option, value));
            }
            EngineCommand::UpdateActionDelay {
                key,
                set,
                action_id,
                delay,
                respond_to,
            } => {
                let _ = respond_to.send(engine.update_action_delay(key, set, &action_id, delay));
            }

            EngineCommand::SetActionDefinitions {
                instance_id,
                definitions,
                respond_to,
            } => {
                engine.set_action_definitions(&instance_id, definitions);
                let _ = respond_to.send(());
            }
            EngineCommand::DeleteInstance { instance_id, respond_to } => {
                let _ = respond_to.send(engine.delete_instance(&instance_id));
            }
            EngineCommand::RetainInstances { instances, respond_to } => {
                let _ = respond_to.send(engine.retain_instances(&instances));
            }
            EngineCommand::SubscribeAll { respond_to } => {
                let _ = respond_to.send(engine.subscribe_all());
            }

            EngineCommand::GetSetIds { key, respond_to } => {
                let _ = respond_to.send(engine.set_ids(key));
            }
            EngineCommand::GetActions { key, set, respond_to } => {
                let _ = respond_to.send(engine.actions(key, set));
            }
            EngineCommand::GetCurrentStep { key, respond_to } => {
                let _ = respond_to.send(engine.current_step(key));
            }
            EngineCommand::GetButtonState { key, respond_to } => {
                let _ = respond_to.send(engine.button_state(key));
            }
            EngineCommand::GetActionDefaults { reference, respond_to } => {
                let _ = respond_to.send(engine.action_defaults(&reference));
            }
        }
    }
}
