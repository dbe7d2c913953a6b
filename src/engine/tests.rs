use super::*;
use crate::engine::persistence::FlakyPersistence;
use crate::modules::{ActionDefinition, ModuleHandle, ModuleHost, OptionDefinition};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc::UnboundedReceiver;

const KEY: ButtonKey = ButtonKey { page: 1, button: 1 };
const OTHER: ButtonKey = ButtonKey { page: 1, button: 2 };

/// Module that records every call it receives
struct RecordingModule {
    id: String,
    fail_runs: bool,
    runs: Mutex<Vec<(ButtonKey, String)>>,
    updates: AtomicUsize,
    deletes: AtomicUsize,
}

impl RecordingModule {
    fn build(id: &str, fail_runs: bool) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            fail_runs,
            runs: Mutex::new(Vec::new()),
            updates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        })
    }

    fn new(id: &str) -> Arc<Self> {
        Self::build(id, false)
    }

    fn failing(id: &str) -> Arc<Self> {
        Self::build(id, true)
    }

    fn kinds(&self) -> Vec<String> {
        self.runs.lock().iter().map(|(_, kind)| kind.clone()).collect()
    }

    fn runs_for(&self, key: ButtonKey) -> usize {
        self.runs.lock().iter().filter(|(k, _)| *k == key).count()
    }
}

#[async_trait]
impl ModuleHandle for RecordingModule {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, action: &ActionInstance, ctx: &RunContext) -> anyhow::Result<()> {
        self.runs
            .lock()
            .push((ButtonKey::new(ctx.page, ctx.button), action.action_kind.clone()));
        if self.fail_runs {
            anyhow::bail!("device offline");
        }
        Ok(())
    }

    async fn update(&self, _action: &ActionInstance, _key: ButtonKey) -> anyhow::Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, _action: &ActionInstance) -> anyhow::Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    engine: Engine,
    host: Arc<ModuleHost>,
    module: Arc<RecordingModule>,
    events: UnboundedReceiver<EngineEvent>,
}

impl Harness {
    fn new() -> Self {
        Self::with_store(ActionSetStore::in_memory())
    }

    fn with_store(store: ActionSetStore) -> Self {
        let host = Arc::new(ModuleHost::new());
        let module = RecordingModule::new("rec");
        host.register(module.clone());
        let (tx, events) = mpsc::unbounded_channel();
        let engine = Engine::new(EngineSettings::default(), store, host.clone(), tx);
        Self {
            engine,
            host,
            module,
            events,
        }
    }

    /// Add an action of module "rec" and give it a delay
    fn add(&mut self, key: ButtonKey, set: SetId, kind: &str, delay: u64) -> String {
        self.add_for("rec", key, set, kind, delay)
    }

    fn add_for(&mut self, instance: &str, key: ButtonKey, set: SetId, kind: &str, delay: u64) -> String {
        let id = self
            .engine
            .add_action(key, set, &ActionReference::new(instance, kind))
            .unwrap()
            .unwrap();
        if delay > 0 {
            assert!(self.engine.update_action_delay(key, set, &id, delay).unwrap());
        }
        id
    }

    fn drain(&mut self) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Wait in real time until the module saw `count` runs
async fn wait_for_runs(module: &RecordingModule, count: usize) {
    for _ in 0..200 {
        if module.runs.lock().len() >= count {
            return;
        }
        tokio::time::sleep(ms(5)).await;
    }
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn redraws(events: &[EngineEvent], key: ButtonKey) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, EngineEvent::Redraw { key: k } if *k == key))
        .count()
}

// ============================================================================
// Press style
// ============================================================================

#[tokio::test]
async fn test_press_then_release_fires_down_then_up() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    h.add(KEY, SetId::Down, "down", 0);
    h.add(KEY, SetId::Up, "up", 0);
    h.drain();

    let now = Instant::now();
    h.engine.press(KEY, true, Some("deck".into()), now);
    h.engine.press(KEY, false, Some("deck".into()), now);
    settle().await;

    assert_eq!(h.module.kinds(), vec!["down", "up"]);

    let events = h.drain();
    assert!(events.contains(&EngineEvent::Pushed {
        key: KEY,
        pushed: true,
        device_id: Some("deck".into())
    }));
    assert!(events.contains(&EngineEvent::Pushed {
        key: KEY,
        pushed: false,
        device_id: Some("deck".into())
    }));
}

#[tokio::test]
async fn test_second_press_without_release_fires_down_again() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    h.add(KEY, SetId::Down, "down", 0);
    h.add(KEY, SetId::Up, "up", 0);

    let now = Instant::now();
    h.engine.press(KEY, true, None, now);
    h.engine.press(KEY, true, None, now);
    h.engine.press(KEY, false, None, now);
    h.engine.press(KEY, false, None, now);
    settle().await;

    assert_eq!(h.module.kinds(), vec!["down", "down", "up"]);
}

#[tokio::test]
async fn test_page_navigation_never_dispatches() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::PageUp).unwrap();
    h.drain();

    h.engine.press(KEY, true, Some("deck".into()), Instant::now());
    let events = h.drain();
    assert_eq!(
        events,
        vec![EngineEvent::PageNavigation {
            device_id: Some("deck".into()),
            navigation: PageNavigation::Up
        }]
    );
    assert!(!h.engine.button_state(KEY).pushed);
}

// ============================================================================
// Step style
// ============================================================================

#[tokio::test]
async fn test_step_cycles_regardless_of_timing() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Step).unwrap();
    h.engine.add_set(KEY).unwrap();
    h.engine.add_set(KEY).unwrap();
    for n in 0..3 {
        h.add(KEY, SetId::Step(n), &format!("s{}", n), 0);
    }

    let start = Instant::now();
    for (i, gap) in [0u64, 5, 1000, 1, 60_000].iter().enumerate() {
        let at = start + ms(*gap) + ms(i as u64);
        h.engine.press(KEY, true, None, at);
        h.engine.press(KEY, false, None, at);
    }
    settle().await;

    assert_eq!(h.module.kinds(), vec!["s0", "s1", "s2", "s0", "s1"]);
}

#[tokio::test]
async fn test_step_example_two_sets() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Step).unwrap();
    h.engine.add_set(KEY).unwrap();
    h.drain();

    h.engine.press(KEY, true, None, Instant::now());
    assert_eq!(h.engine.current_step(KEY), Some((SetId::Step(1), 1)));
    assert!(h.drain().contains(&EngineEvent::StepChanged {
        key: KEY,
        set_id: SetId::Step(1),
        index: 1
    }));

    h.engine.press(KEY, true, None, Instant::now());
    assert_eq!(h.engine.current_step(KEY), Some((SetId::Step(0), 0)));
}

#[tokio::test]
async fn test_removing_cursored_set_relocates_cursor() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Step).unwrap();
    h.engine.add_set(KEY).unwrap();
    h.engine.add_set(KEY).unwrap();

    assert!(h.engine.set_step(KEY, SetId::Step(1)));
    h.drain();

    assert!(h.engine.remove_set(KEY, SetId::Step(1)).unwrap());
    assert_eq!(h.engine.current_step(KEY), Some((SetId::Step(2), 1)));
    let events = h.drain();
    assert!(events.contains(&EngineEvent::StepChanged {
        key: KEY,
        set_id: SetId::Step(2),
        index: 1
    }));
    assert!(events.contains(&EngineEvent::SetsChanged {
        key: KEY,
        set_ids: vec![SetId::Step(0), SetId::Step(2)]
    }));

    // Removing the last id wraps to the first
    assert!(h.engine.remove_set(KEY, SetId::Step(2)).unwrap());
    assert_eq!(h.engine.current_step(KEY), Some((SetId::Step(0), 0)));

    // The last remaining set stays
    assert!(!h.engine.remove_set(KEY, SetId::Step(0)).unwrap());
}

#[tokio::test]
async fn test_zero_set_step_button_is_silent() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Step).unwrap();
    h.engine.press(KEY, true, None, Instant::now());
    h.engine.press(KEY, false, None, Instant::now());
    settle().await;
    assert!(h.module.kinds().is_empty());
}

#[tokio::test]
async fn test_step_delta_and_step_to() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Step).unwrap();
    h.engine.add_set(KEY).unwrap();
    h.engine.add_set(KEY).unwrap();

    assert!(h.engine.step_delta(KEY, -1));
    assert_eq!(h.engine.current_step(KEY), Some((SetId::Step(2), 2)));
    assert!(!h.engine.step_delta(KEY, 0));
    assert!(h.engine.step_to(KEY, 2));
    assert_eq!(h.engine.current_step(KEY), Some((SetId::Step(1), 1)));
    assert!(!h.engine.step_to(KEY, 9));

    // Press buttons have no cursor
    h.engine.set_button_style(OTHER, ButtonStyle::Press).unwrap();
    assert!(!h.engine.step_delta(OTHER, 1));
    assert_eq!(h.engine.current_step(OTHER), None);
}

// ============================================================================
// Delays and cancellation
// ============================================================================

#[tokio::test]
async fn test_relative_delays_accumulate() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    h.engine.set_relative_delay(KEY, true).unwrap();
    h.add(KEY, SetId::Down, "a", 100);
    h.add(KEY, SetId::Down, "b", 50);

    let t0 = Instant::now();
    h.engine.press(KEY, true, None, t0);
    assert!(h.engine.button_state(KEY).running);

    h.engine.fire_due(t0 + ms(120));
    settle().await;
    assert_eq!(h.module.kinds(), vec!["a"]);

    h.engine.fire_due(t0 + ms(150));
    settle().await;
    assert_eq!(h.module.kinds(), vec!["a", "b"]);
    assert!(!h.engine.button_state(KEY).running);
}

#[tokio::test]
async fn test_absolute_delays_are_independent() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    h.add(KEY, SetId::Down, "a", 100);
    h.add(KEY, SetId::Down, "b", 50);

    let t0 = Instant::now();
    h.engine.press(KEY, true, None, t0);
    h.engine.fire_due(t0 + ms(60));
    settle().await;
    assert_eq!(h.module.kinds(), vec!["b"]);
}

#[tokio::test]
async fn test_immediate_actions_run_before_delayed() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    h.add(KEY, SetId::Down, "later", 10);
    h.add(KEY, SetId::Down, "now1", 0);
    h.add(KEY, SetId::Down, "now2", 0);
    h.add(KEY, SetId::Down, "tie1", 30);
    h.add(KEY, SetId::Down, "tie2", 30);
    h.drain();

    let t0 = Instant::now();
    h.engine.press(KEY, true, None, t0);
    settle().await;
    assert_eq!(h.module.kinds(), vec!["now1", "now2"]);
    assert!(redraws(&h.drain(), KEY) >= 1);

    h.engine.fire_due(t0 + ms(30));
    settle().await;
    assert_eq!(h.module.kinds(), vec!["now1", "now2", "later", "tie1", "tie2"]);

    // Finishing the group emits a redraw
    assert_eq!(redraws(&h.drain(), KEY), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_inline_actions_keep_order_across_worker_threads() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    let kinds = ["a", "b", "c", "d", "e", "f"];
    for kind in kinds {
        h.add(KEY, SetId::Down, kind, 0);
    }

    h.engine.press(KEY, true, None, Instant::now());
    wait_for_runs(&h.module, kinds.len()).await;
    assert_eq!(h.module.kinds(), kinds);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tied_timers_keep_order_across_worker_threads() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    let kinds = ["t1", "t2", "t3", "t4"];
    for kind in kinds {
        h.add(KEY, SetId::Down, kind, 30);
    }

    let t0 = Instant::now();
    h.engine.press(KEY, true, None, t0);
    h.engine.fire_due(t0 + ms(30));
    wait_for_runs(&h.module, kinds.len()).await;
    assert_eq!(h.module.kinds(), kinds);
    assert!(!h.engine.button_state(KEY).running);
}

#[tokio::test]
async fn test_abort_button_prevents_dispatch() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    h.engine.set_button_style(OTHER, ButtonStyle::Press).unwrap();
    h.add(KEY, SetId::Down, "a", 100);
    h.add(KEY, SetId::Down, "b", 200);
    h.add(OTHER, SetId::Down, "c", 100);

    let t0 = Instant::now();
    h.engine.press(KEY, true, None, t0);
    h.engine.press(OTHER, true, None, t0);

    assert!(h.engine.abort_button(KEY, false));
    assert!(!h.engine.button_state(KEY).running);

    h.engine.fire_due(t0 + ms(1000));
    settle().await;
    assert_eq!(h.module.runs_for(KEY), 0);
    assert_eq!(h.module.runs_for(OTHER), 1);
}

#[tokio::test]
async fn test_abort_all_prevents_every_dispatch() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    h.engine.set_button_style(OTHER, ButtonStyle::Press).unwrap();
    h.add(KEY, SetId::Down, "a", 100);
    h.add(OTHER, SetId::Down, "b", 100);

    let t0 = Instant::now();
    h.engine.press(KEY, true, None, t0);
    h.engine.press(OTHER, true, None, t0);
    h.drain();

    assert_eq!(h.engine.abort_all(), 2);
    let events = h.drain();
    assert_eq!(redraws(&events, KEY), 1);
    assert_eq!(redraws(&events, OTHER), 1);

    h.engine.fire_due(t0 + ms(1000));
    settle().await;
    assert!(h.module.kinds().is_empty());
    assert_eq!(h.engine.next_deadline(), None);
}

#[tokio::test]
async fn test_abort_with_skip_up_suppresses_release() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    h.add(KEY, SetId::Up, "up", 0);

    h.engine.press(KEY, true, None, Instant::now());
    h.engine.abort_button(KEY, true);
    assert!(!h.engine.button_state(KEY).pushed);

    h.engine.press(KEY, false, None, Instant::now());
    settle().await;
    assert!(h.module.kinds().is_empty());
}

#[tokio::test]
async fn test_reset_cancels_pending_timers() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    h.add(KEY, SetId::Down, "a", 100);

    let t0 = Instant::now();
    h.engine.press(KEY, true, None, t0);
    h.engine.reset_button(KEY).unwrap();
    assert_eq!(h.engine.next_deadline(), None);

    h.engine.fire_due(t0 + ms(500));
    settle().await;
    assert!(h.module.kinds().is_empty());
    assert_eq!(h.module.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failing_action_does_not_stop_siblings() {
    let mut h = Harness::new();
    let flaky = RecordingModule::failing("flaky");
    h.host.register(flaky.clone());

    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    h.add_for("flaky", KEY, SetId::Down, "boom", 0);
    h.add(KEY, SetId::Down, "fine", 0);
    h.add_for("flaky", KEY, SetId::Down, "boom-later", 10);
    h.add(KEY, SetId::Down, "fine-later", 20);

    let t0 = Instant::now();
    h.engine.press(KEY, true, None, t0);
    h.engine.fire_due(t0 + ms(20));
    settle().await;

    assert_eq!(flaky.kinds(), vec!["boom", "boom-later"]);
    assert_eq!(h.module.kinds(), vec!["fine", "fine-later"]);
}

#[tokio::test]
async fn test_unknown_instance_is_ignored() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    h.add_for("ghost", KEY, SetId::Down, "noop", 0);
    h.add(KEY, SetId::Down, "real", 0);

    h.engine.press(KEY, true, None, Instant::now());
    settle().await;
    assert_eq!(h.module.kinds(), vec!["real"]);
}

// ============================================================================
// Status
// ============================================================================

#[tokio::test]
async fn test_status_takes_worst_severity() {
    let mut h = Harness::new();
    h.host.set_health("ok-mod", Severity::Ok);
    h.host.set_health("warn-mod", Severity::Warning);

    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    h.add_for("ok-mod", KEY, SetId::Down, "x", 0);
    h.add_for("warn-mod", KEY, SetId::Up, "y", 0);
    assert_eq!(h.engine.button_state(KEY).severity, Severity::Warning);
    h.drain();

    h.host.set_health("warn-mod", Severity::Error);
    h.engine.health_changed("warn-mod");
    assert_eq!(h.engine.button_state(KEY).severity, Severity::Error);
    assert_eq!(redraws(&h.drain(), KEY), 1);

    // Same health again: no redraw
    h.engine.health_changed("warn-mod");
    assert_eq!(redraws(&h.drain(), KEY), 0);
}

#[tokio::test]
async fn test_deleting_action_recomputes_status() {
    let mut h = Harness::new();
    h.host.set_health("bad", Severity::Error);
    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    let id = h.add_for("bad", KEY, SetId::Down, "x", 0);
    assert_eq!(h.engine.button_state(KEY).severity, Severity::Error);

    assert!(h.engine.delete_action(KEY, SetId::Down, &id).unwrap());
    assert_eq!(h.engine.button_state(KEY).severity, Severity::Ok);
}

// ============================================================================
// Module lifecycle
// ============================================================================

#[tokio::test]
async fn test_action_defaults_from_definitions() {
    let mut h = Harness::new();
    let mut defs = ActionDefinitions::new();
    defs.insert(
        "scene".to_string(),
        ActionDefinition {
            label: "Switch scene".to_string(),
            options: vec![OptionDefinition {
                id: "scene".to_string(),
                label: None,
                default: json!("Main"),
            }],
        },
    );
    h.engine.set_action_definitions("rec", Some(defs.clone()));
    assert!(h.drain().contains(&EngineEvent::ModuleDefinitionsChanged {
        instance_id: "rec".to_string(),
        definitions: Some(defs)
    }));

    let action = h.engine.action_defaults(&ActionReference::new("rec", "scene"));
    assert_eq!(action.options["scene"], json!("Main"));
    assert_eq!(action.delay, 0);

    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    let id = h.add(KEY, SetId::Down, "scene", 0);
    let stored = h.engine.actions(KEY, SetId::Down);
    assert_eq!(stored[0].id, id);
    assert_eq!(stored[0].options["scene"], json!("Main"));
}

#[tokio::test]
async fn test_add_action_to_missing_set_is_noop() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Step).unwrap();
    let added = h
        .engine
        .add_action(KEY, SetId::Step(5), &ActionReference::new("rec", "x"))
        .unwrap();
    assert_eq!(added, None);
    assert_eq!(h.engine.set_ids(KEY), vec![SetId::Step(0)]);
}

#[tokio::test]
async fn test_edits_resubscribe_actions() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    let id = h.add(KEY, SetId::Down, "x", 0);
    h.engine
        .update_action_option(KEY, SetId::Down, &id, "level", json!(7))
        .unwrap();
    h.engine.update_action_delay(KEY, SetId::Down, &id, 20).unwrap();
    settle().await;
    assert_eq!(h.module.updates.load(Ordering::SeqCst), 3);

    // Restyling tears the old actions down
    h.engine.set_button_style(KEY, ButtonStyle::Step).unwrap();
    settle().await;
    assert_eq!(h.module.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_delete_instance_cascades() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    h.engine.set_button_style(OTHER, ButtonStyle::Step).unwrap();
    h.add_for("obs", KEY, SetId::Down, "scene", 0);
    h.add(KEY, SetId::Up, "keep", 0);
    h.add_for("obs", OTHER, SetId::Step(0), "scene", 0);
    h.engine.set_action_definitions("obs", Some(ActionDefinitions::new()));
    h.drain();

    h.engine.delete_instance("obs").unwrap();

    assert!(h.engine.actions(KEY, SetId::Down).is_empty());
    assert_eq!(h.engine.actions(KEY, SetId::Up).len(), 1);
    assert!(h.engine.actions(OTHER, SetId::Step(0)).is_empty());
    assert!(h.engine.action_definitions("obs").is_none());
    assert!(h.drain().contains(&EngineEvent::ModuleDefinitionsChanged {
        instance_id: "obs".to_string(),
        definitions: None
    }));
}

#[tokio::test]
async fn test_delete_instance_drops_its_pending_timers() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    h.engine.set_button_style(OTHER, ButtonStyle::Press).unwrap();
    h.add_for("obs", KEY, SetId::Down, "scene", 100);
    h.add_for("obs", OTHER, SetId::Down, "scene", 100);
    h.add(OTHER, SetId::Down, "keep", 100);

    let t0 = Instant::now();
    h.engine.press(KEY, true, None, t0);
    h.engine.press(OTHER, true, None, t0);
    h.drain();

    h.engine.delete_instance("obs").unwrap();
    assert!(!h.engine.button_state(KEY).running);
    assert!(h.engine.button_state(OTHER).running);
    assert!(redraws(&h.drain(), KEY) >= 1);

    // Re-adding the module must not resurrect the cancelled runs
    let obs = RecordingModule::new("obs");
    h.host.register(obs.clone());
    h.engine.fire_due(t0 + ms(200));
    settle().await;
    assert!(obs.kinds().is_empty());
    assert_eq!(h.module.kinds(), vec!["keep"]);
    assert_eq!(h.engine.next_deadline(), None);
}

#[tokio::test]
async fn test_startup_reconciliation() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Press).unwrap();
    h.add_for("stale", KEY, SetId::Down, "x", 0);
    h.add(KEY, SetId::Down, "y", 0);
    settle().await;
    let before = h.module.updates.load(Ordering::SeqCst);

    let known = HashSet::from(["rec".to_string()]);
    assert_eq!(h.engine.retain_instances(&known).unwrap(), 1);
    assert_eq!(h.engine.subscribe_all(), 1);
    settle().await;
    assert_eq!(h.module.updates.load(Ordering::SeqCst), before + 1);
}

// ============================================================================
// Misc
// ============================================================================

#[tokio::test]
async fn test_buttons_outside_surface_are_ignored() {
    let mut h = Harness::new();
    let off = ButtonKey::new(MAX_PAGES + 1, 1);
    assert!(!h.engine.set_button_style(off, ButtonStyle::Press).unwrap());
    assert!(!h.engine.set_button_style(ButtonKey::new(1, 0), ButtonStyle::Press).unwrap());
    h.engine.press(off, true, None, Instant::now());
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_swap_sets_moves_contents() {
    let mut h = Harness::new();
    h.engine.set_button_style(KEY, ButtonStyle::Step).unwrap();
    h.engine.add_set(KEY).unwrap();
    h.add(KEY, SetId::Step(1), "second", 0);

    assert!(h.engine.swap_sets(KEY, SetId::Step(0), SetId::Step(1)).unwrap());
    h.engine.press(KEY, true, None, Instant::now());
    settle().await;
    assert_eq!(h.module.kinds(), vec!["second"]);
}

#[tokio::test]
async fn test_store_survives_restart_but_cursor_does_not() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("engine.sled");

    {
        let store = ActionSetStore::open(Box::new(SledPersistence::open(&path).unwrap())).unwrap();
        let mut h = Harness::with_store(store);
        h.engine.set_button_style(KEY, ButtonStyle::Step).unwrap();
        h.engine.add_set(KEY).unwrap();
        h.engine.set_relative_delay(KEY, true).unwrap();
        h.add(KEY, SetId::Step(1), "x", 250);
        assert!(h.engine.set_step(KEY, SetId::Step(1)));
    }

    let store = ActionSetStore::open(Box::new(SledPersistence::open(&path).unwrap())).unwrap();
    let h = Harness::with_store(store);
    let state = h.engine.button_state(KEY);
    assert_eq!(state.sets, vec![SetId::Step(0), SetId::Step(1)]);
    assert!(state.config.relative_delay);
    assert_eq!(state.step, Some((SetId::Step(0), 0)));
    assert_eq!(h.engine.actions(KEY, SetId::Step(1))[0].delay, 250);
}

// ============================================================================
// Actor
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_actor_fires_timers_and_honors_abort() {
    let h = Harness::new();
    let module = h.module.clone();
    let mut events = h.events;
    let handle = EngineActor::spawn(h.engine);

    handle.set_button_style(KEY, ButtonStyle::Press).await.unwrap();
    let id = handle
        .add_action(KEY, SetId::Down, ActionReference::new("rec", "late"))
        .await
        .unwrap()
        .unwrap();
    handle.update_action_delay(KEY, SetId::Down, &id, 100).await.unwrap();

    handle.press(KEY, true, None);
    tokio::time::sleep(ms(50)).await;
    assert!(module.kinds().is_empty());
    assert!(handle.button_state(KEY).await.unwrap().running);

    tokio::time::sleep(ms(100)).await;
    assert_eq!(module.kinds(), vec!["late"]);
    assert!(!handle.button_state(KEY).await.unwrap().running);

    handle.press(KEY, true, None);
    assert!(handle.abort_button(KEY, false).await.unwrap());
    tokio::time::sleep(ms(500)).await;
    assert_eq!(module.kinds(), vec!["late"]);

    let mut saw_step_or_redraw = false;
    while let Ok(event) = events.try_recv() {
        saw_step_or_redraw |= matches!(event, EngineEvent::Redraw { .. });
    }
    assert!(saw_step_or_redraw);
}

// ============================================================================
// Persistence failures
// ============================================================================

#[tokio::test]
async fn test_failed_save_leaves_button_untouched() {
    let flaky = FlakyPersistence::default();
    let mut h = Harness::with_store(ActionSetStore::open(Box::new(flaky.clone())).unwrap());
    h.engine.set_button_style(KEY, ButtonStyle::Step).unwrap();
    h.engine.add_set(KEY).unwrap();
    h.add(KEY, SetId::Step(1), "second", 0);
    assert!(h.engine.set_step(KEY, SetId::Step(1)));
    settle().await;
    h.drain();

    flaky.fail_writes(true);
    assert!(h.engine.remove_set(KEY, SetId::Step(1)).is_err());
    assert!(h.engine.set_button_style(KEY, ButtonStyle::Press).is_err());
    assert!(h.engine.reset_button(KEY).is_err());
    settle().await;

    assert_eq!(h.engine.set_ids(KEY), vec![SetId::Step(0), SetId::Step(1)]);
    assert_eq!(h.engine.current_step(KEY), Some((SetId::Step(1), 1)));
    assert_eq!(h.module.deletes.load(Ordering::SeqCst), 0);
    assert!(h.drain().is_empty());

    flaky.fail_writes(false);
    assert!(h.engine.remove_set(KEY, SetId::Step(1)).unwrap());
    settle().await;
    assert_eq!(h.module.deletes.load(Ordering::SeqCst), 1);
}
