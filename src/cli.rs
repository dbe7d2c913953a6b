//! Interactive console
//!
//! Lines are read with rustyline on a blocking thread, parsed into
//! [`ConsoleCommand`]s and forwarded to the main loop, which executes them
//! against the engine handle.

use crate::engine::{ActionReference, ButtonKey, ButtonStyle, EngineHandle, SetId};
use crate::modules::{ModuleHost, Severity};
use anyhow::{anyhow, bail, Context, Result};
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

const HELP: &str = "\
press <p.b> [device]            press edge
release <p.b> [device]          release edge
tap <p.b> [device]              press then release
style <p.b> <style>             none|press|step|pageup|pagedown|pagenum
reset <p.b>                     clear the button
add-set <p.b>                   append a step set
remove-set <p.b> <set>          remove a step set
swap <p.b> <set> <set>          swap two step sets
step <p.b> <set>                move the step cursor
step-delta <p.b> <n>            move the cursor by n (wraps)
step-to <p.b> <n>               move the cursor to the nth set
add <p.b> <set> <inst:action>   append an action
delete <p.b> <set> <id>         remove an action
option <p.b> <set> <id> <k> <v> set an option (JSON or text)
delay <p.b> <set> <id> <ms>     set an action delay
move <p.b> <set> <from> <to>    reorder an action
relative <p.b> on|off           relative delays
autoprogress <p.b> on|off       step auto-progress
show <p.b>                      button state and actions
abort <p.b> [skip-up]           cancel delayed actions
abort-all                       cancel every delayed action
health <instance> <severity>    ok|warning|error
quit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Press { key: ButtonKey, device: Option<String> },
    Release { key: ButtonKey, device: Option<String> },
    Tap { key: ButtonKey, device: Option<String> },
    Style { key: ButtonKey, style: ButtonStyle },
    Reset { key: ButtonKey },
    AddSet { key: ButtonKey },
    RemoveSet { key: ButtonKey, set: SetId },
    Swap { key: ButtonKey, a: SetId, b: SetId },
    Step { key: ButtonKey, set: SetId },
    StepDelta { key: ButtonKey, amount: i64 },
    StepTo { key: ButtonKey, n: usize },
    Add { key: ButtonKey, set: SetId, reference: ActionReference },
    Delete { key: ButtonKey, set: SetId, action_id: String },
    SetOption { key: ButtonKey, set: SetId, action_id: String, option: String, value: Value },
    Delay { key: ButtonKey, set: SetId, action_id: String, delay: u64 },
    Move { key: ButtonKey, set: SetId, from: usize, to: usize },
    Relative { key: ButtonKey, enabled: bool },
    AutoProgress { key: ButtonKey, enabled: bool },
    Show { key: ButtonKey },
    Abort { key: ButtonKey, skip_up: bool },
    AbortAll,
    Health { instance_id: String, severity: Severity },
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parse one console line; `Ok(None)` for blank lines
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&verb, args)) = words.split_first() else {
            return Ok(None);
        };

        let args = Args { verb, words: args };
        let key = || args.key();
        let set = |i: usize| args.set(i);
        let arg = |i: usize, what: &'static str| args.get(i, what);
        let device = || args.words.get(1).map(|d| d.to_string());

        let cmd = match verb.to_ascii_lowercase().as_str() {
            "press" => Self::Press { key: key()?, device: device() },
            "release" => Self::Release { key: key()?, device: device() },
            "tap" => Self::Tap { key: key()?, device: device() },
            "style" => Self::Style {
                key: key()?,
                style: arg(1, "style")?.parse()?,
            },
            "reset" => Self::Reset { key: key()? },
            "add-set" => Self::AddSet { key: key()? },
            "remove-set" => Self::RemoveSet { key: key()?, set: set(1)? },
            "swap" => Self::Swap {
                key: key()?,
                a: set(1)?,
                b: set(2)?,
            },
            "step" => Self::Step { key: key()?, set: set(1)? },
            "step-delta" => Self::StepDelta {
                key: key()?,
                amount: arg(1, "n")?.parse().context("step delta must be an integer")?,
            },
            "step-to" => Self::StepTo {
                key: key()?,
                n: arg(1, "n")?.parse().context("step position must be a positive integer")?,
            },
            "add" => Self::Add {
                key: key()?,
                set: set(1)?,
                reference: arg(2, "instance:action")?.parse()?,
            },
            "delete" => Self::Delete {
                key: key()?,
                set: set(1)?,
                action_id: arg(2, "id")?.to_string(),
            },
            "option" => {
                let raw = args.words.get(4..).filter(|rest| !rest.is_empty()).map(|rest| rest.join(" "));
                let raw = raw.ok_or_else(|| anyhow!("'option' needs <value>"))?;
                Self::SetOption {
                    key: key()?,
                    set: set(1)?,
                    action_id: arg(2, "id")?.to_string(),
                    option: arg(3, "option")?.to_string(),
                    value: serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
                }
            }
            "delay" => Self::Delay {
                key: key()?,
                set: set(1)?,
                action_id: arg(2, "id")?.to_string(),
                delay: arg(3, "ms")?.parse().context("delay must be whole milliseconds")?,
            },
            "move" => Self::Move {
                key: key()?,
                set: set(1)?,
                from: arg(2, "from")?.parse().context("from must be an index")?,
                to: arg(3, "to")?.parse().context("to must be an index")?,
            },
            "relative" => Self::Relative {
                key: key()?,
                enabled: parse_switch(arg(1, "on|off")?)?,
            },
            "autoprogress" => Self::AutoProgress {
                key: key()?,
                enabled: parse_switch(arg(1, "on|off")?)?,
            },
            "show" => Self::Show { key: key()? },
            "abort" => Self::Abort {
                key: key()?,
                skip_up: args.words.get(1).is_some_and(|a| *a == "skip-up"),
            },
            "abort-all" => Self::AbortAll,
            "health" => Self::Health {
                instance_id: arg(0, "instance")?.to_string(),
                severity: arg(1, "severity")?.parse()?,
            },
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command '{}' (try 'help')", other),
        };
        Ok(Some(cmd))
    }
}

struct Args<'a> {
    verb: &'a str,
    words: &'a [&'a str],
}

impl<'a> Args<'a> {
    fn get(&self, i: usize, what: &str) -> Result<&'a str> {
        self.words
            .get(i)
            .copied()
            .ok_or_else(|| anyhow!("'{}' needs <{}>", self.verb, what))
    }

    fn key(&self) -> Result<ButtonKey> {
        parse_key(self.get(0, "page.button")?)
    }

    fn set(&self, i: usize) -> Result<SetId> {
        Ok(self.get(i, "set")?.parse::<SetId>()?)
    }
}

fn parse_key(s: &str) -> Result<ButtonKey> {
    let (page, button) = s
        .split_once('.')
        .ok_or_else(|| anyhow!("button must look like page.button, got '{}'", s))?;
    Ok(ButtonKey::new(
        page.parse().with_context(|| format!("invalid page '{}'", page))?,
        button.parse().with_context(|| format!("invalid button '{}'", button))?,
    ))
}

fn parse_switch(s: &str) -> Result<bool> {
    match s.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        other => bail!("expected on/off, got '{}'", other),
    }
}

/// Read console lines on a blocking thread and forward parsed commands
///
/// The returned receiver closes when the user quits or input ends.
pub fn spawn_repl() -> mpsc::UnboundedReceiver<ConsoleCommand> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::task::spawn_blocking(move || {
        let mut rl = match DefaultEditor::new() {
            Ok(rl) => rl,
            Err(e) => {
                eprintln!("{} {}", "console unavailable:".red(), e);
                return;
            }
        };

        loop {
            match rl.readline("deck> ") {
                Ok(line) => {
                    let _ = rl.add_history_entry(line.as_str());
                    match ConsoleCommand::parse(&line) {
                        Ok(Some(ConsoleCommand::Quit)) => break,
                        Ok(Some(cmd)) => {
                            if tx.send(cmd).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => eprintln!("{} {:#}", "error:".red(), e),
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(e) => {
                    eprintln!("{} {}", "console error:".red(), e);
                    break;
                }
            }
        }
        debug!("Console input closed");
    });

    rx
}

/// Run one command against the engine
pub async fn execute(cmd: ConsoleCommand, engine: &EngineHandle, host: &ModuleHost) -> Result<()> {
    match cmd {
        ConsoleCommand::Press { key, device } => engine.press(key, true, device),
        ConsoleCommand::Release { key, device } => engine.press(key, false, device),
        ConsoleCommand::Tap { key, device } => {
            engine.press(key, true, device.clone());
            engine.press(key, false, device);
        }
        ConsoleCommand::Style { key, style } => report(engine.set_button_style(key, style).await?),
        ConsoleCommand::Reset { key } => report(engine.reset_button(key).await?),
        ConsoleCommand::AddSet { key } => match engine.add_set(key).await? {
            Some(set) => println!("{} set {}", "added".green(), set.to_string().bold()),
            None => report(false),
        },
        ConsoleCommand::RemoveSet { key, set } => report(engine.remove_set(key, set).await?),
        ConsoleCommand::Swap { key, a, b } => report(engine.swap_sets(key, a, b).await?),
        ConsoleCommand::Step { key, set } => report(engine.set_step(key, set).await?),
        ConsoleCommand::StepDelta { key, amount } => report(engine.step_delta(key, amount).await?),
        ConsoleCommand::StepTo { key, n } => report(engine.step_to(key, n).await?),
        ConsoleCommand::Add { key, set, reference } => match engine.add_action(key, set, reference).await? {
            Some(id) => println!("{} action {}", "added".green(), id.bold()),
            None => report(false),
        },
        ConsoleCommand::Delete { key, set, action_id } => {
            report(engine.delete_action(key, set, action_id).await?)
        }
        ConsoleCommand::SetOption {
            key,
            set,
            action_id,
            option,
            value,
        } => report(engine.update_action_option(key, set, action_id, option, value).await?),
        ConsoleCommand::Delay {
            key,
            set,
            action_id,
            delay,
        } => report(engine.update_action_delay(key, set, action_id, delay).await?),
        ConsoleCommand::Move { key, set, from, to } => report(engine.reorder_actions(key, set, from, to).await?),
        ConsoleCommand::Relative { key, enabled } => report(engine.set_relative_delay(key, enabled).await?),
        ConsoleCommand::AutoProgress { key, enabled } => {
            report(engine.set_step_auto_progress(key, enabled).await?)
        }
        ConsoleCommand::Show { key } => show(engine, key).await?,
        ConsoleCommand::Abort { key, skip_up } => {
            let was_running = engine.abort_button(key, skip_up).await?;
            println!(
                "{}",
                if was_running { "aborted".yellow() } else { "nothing pending".dimmed() }
            );
        }
        ConsoleCommand::AbortAll => {
            let n = engine.abort_all().await?;
            println!("{} {} buttons", "aborted".yellow(), n);
        }
        ConsoleCommand::Health { instance_id, severity } => host.set_health(&instance_id, severity),
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

fn report(applied: bool) {
    if applied {
        println!("{}", "ok".green());
    } else {
        println!("{}", "ignored".dimmed());
    }
}

fn severity_label(severity: Severity) -> ColoredString {
    match severity {
        Severity::Ok => "ok".green(),
        Severity::Warning => "warning".yellow(),
        Severity::Error => "error".red(),
    }
}

async fn show(engine: &EngineHandle, key: ButtonKey) -> Result<()> {
    let state = engine.button_state(key).await?;

    println!(
        "{} style={} relative={} autoprogress={} pushed={} running={} status={}",
        key.to_string().bold().cyan(),
        state.config.style.to_string().bold(),
        state.config.relative_delay,
        state.config.step_auto_progress,
        state.pushed,
        state.running,
        severity_label(state.severity)
    );

    for set in &state.sets {
        let marker = match state.step {
            Some((current, _)) if current == *set => "▶".green(),
            _ => " ".normal(),
        };
        println!("  {} set {}", marker, set.to_string().bold());
        for (idx, action) in engine.actions(key, *set).await?.iter().enumerate() {
            println!(
                "      {}. {} {} delay={}ms {}",
                idx,
                action.reference().to_string().yellow(),
                action.id.dimmed(),
                action.delay,
                Value::Object(action.options.clone())
            );
        }
    }
    Ok(())
}
