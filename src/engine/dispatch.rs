//! Dispatcher - fire-and-forget calls into module instances
//!
//! Each module instance gets one ordered call queue drained by its own task.
//! The engine only enqueues, so a slow or failing module never blocks it, and
//! calls reach a module in the order the engine issued them. Failures are
//! logged and scoped to the one action.

use super::types::{ActionInstance, ButtonKey};
use crate::error::EngineError;
use crate::modules::{InstanceRegistry, ModuleHandle, RunContext};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

enum ModuleCall {
    Run { action: ActionInstance, ctx: RunContext },
    Update { action: ActionInstance, key: ButtonKey },
    Delete { action: ActionInstance },
}

impl ModuleCall {
    fn name(&self) -> &'static str {
        match self {
            ModuleCall::Run { .. } => "run",
            ModuleCall::Update { .. } => "update",
            ModuleCall::Delete { .. } => "delete",
        }
    }

    fn action(&self) -> &ActionInstance {
        match self {
            ModuleCall::Run { action, .. } | ModuleCall::Update { action, .. } | ModuleCall::Delete { action } => {
                action
            }
        }
    }

    async fn execute(&self, handle: &dyn ModuleHandle) -> anyhow::Result<()> {
        match self {
            ModuleCall::Run { action, ctx } => handle.run(action, ctx).await,
            ModuleCall::Update { action, key } => handle.update(action, *key).await,
            ModuleCall::Delete { action } => handle.delete(action).await,
        }
    }
}

/// Call queue of one module handle
struct Queue {
    handle: Arc<dyn ModuleHandle>,
    tx: mpsc::UnboundedSender<ModuleCall>,
}

impl Queue {
    fn spawn(handle: Arc<dyn ModuleHandle>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain(handle.clone(), rx));
        Self { handle, tx }
    }

    /// Still bound to `handle` with a live worker
    fn serves(&self, handle: &Arc<dyn ModuleHandle>) -> bool {
        Arc::as_ptr(&self.handle) as *const () == Arc::as_ptr(handle) as *const () && !self.tx.is_closed()
    }
}

async fn drain(handle: Arc<dyn ModuleHandle>, mut rx: mpsc::UnboundedReceiver<ModuleCall>) {
    while let Some(call) = rx.recv().await {
        if let Err(source) = call.execute(handle.as_ref()).await {
            log_failure(call.name(), call.action(), source);
        }
    }
    trace!(instance = handle.id(), "Module call queue closed");
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<dyn InstanceRegistry>,
    queues: Arc<Mutex<HashMap<String, Queue>>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<dyn InstanceRegistry>) -> Self {
        Self {
            registry,
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run an action on its module
    pub fn run(&self, action: &ActionInstance, ctx: RunContext) {
        trace!(instance = %action.instance_id, action = %action.action_kind, "Dispatching run");
        self.enqueue(ModuleCall::Run {
            action: action.clone(),
            ctx,
        });
    }

    /// (Re)establish the module-side registration of an action
    pub fn subscribe(&self, action: &ActionInstance, key: ButtonKey) {
        self.enqueue(ModuleCall::Update {
            action: action.clone(),
            key,
        });
    }

    /// Tear down the module-side registration of an action
    pub fn unsubscribe(&self, action: &ActionInstance) {
        self.enqueue(ModuleCall::Delete { action: action.clone() });
    }

    fn enqueue(&self, call: ModuleCall) {
        let instance_id = call.action().instance_id.clone();
        let mut queues = self.queues.lock();

        let Some(handle) = self.registry.get_child(&instance_id) else {
            let err = EngineError::UnknownInstance(instance_id.clone());
            debug!(call = call.name(), action_id = %call.action().id, "Skipping {}", err);
            // Closing the sender lets the old worker finish and exit
            queues.remove(&instance_id);
            return;
        };

        let queue = queues
            .entry(instance_id)
            .or_insert_with(|| Queue::spawn(handle.clone()));
        if !queue.serves(&handle) {
            // Replaced module: the previous worker drains what it already has
            *queue = Queue::spawn(handle);
        }

        if let Err(mpsc::error::SendError(call)) = queue.tx.send(call) {
            warn!(call = call.name(), action_id = %call.action().id, "Module call queue is closed");
        }
    }
}

fn log_failure(call: &str, action: &ActionInstance, source: anyhow::Error) {
    let err = EngineError::Dispatch {
        instance: action.instance_id.clone(),
        source,
    };
    warn!(call, action_id = %action.id, action = %action.action_kind, "{:#}", err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::ActionReference;
    use crate::modules::{ConsoleModule, ModuleHost};
    use async_trait::async_trait;
    use serde_json::Map;
    use std::time::Duration;

    /// Records action kinds and yields inside every call
    struct SlowModule {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ModuleHandle for SlowModule {
        fn id(&self) -> &str {
            "slow"
        }

        async fn run(&self, action: &ActionInstance, _ctx: &RunContext) -> anyhow::Result<()> {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            self.calls.lock().push(format!("run:{}", action.action_kind));
            Ok(())
        }

        async fn update(&self, action: &ActionInstance, _key: ButtonKey) -> anyhow::Result<()> {
            tokio::task::yield_now().await;
            self.calls.lock().push(format!("update:{}", action.action_kind));
            Ok(())
        }

        async fn delete(&self, action: &ActionInstance) -> anyhow::Result<()> {
            self.calls.lock().push(format!("delete:{}", action.action_kind));
            Ok(())
        }
    }

    fn action(instance: &str, kind: &str) -> ActionInstance {
        ActionInstance::new(&ActionReference::new(instance, kind), Map::new())
    }

    #[tokio::test]
    async fn test_unknown_instance_is_a_noop() {
        let host = Arc::new(ModuleHost::new());
        let dispatcher = Dispatcher::new(host);
        let action = action("ghost", "boo");

        dispatcher.run(&action, RunContext::new(ButtonKey::new(1, 1), None));
        dispatcher.subscribe(&action, ButtonKey::new(1, 1));
        dispatcher.unsubscribe(&action);
        assert!(dispatcher.queues.lock().is_empty());
    }

    #[tokio::test]
    async fn test_run_reaches_module() {
        let host = Arc::new(ModuleHost::new());
        let console = Arc::new(ConsoleModule::new("console"));
        host.register(console.clone());
        let dispatcher = Dispatcher::new(host);

        dispatcher.run(&action("console", "log"), RunContext::new(ButtonKey::new(1, 1), None));

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(console.execution_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_calls_reach_module_in_issue_order() {
        let host = Arc::new(ModuleHost::new());
        let slow = Arc::new(SlowModule {
            calls: Mutex::new(Vec::new()),
        });
        host.register(slow.clone());
        let dispatcher = Dispatcher::new(host);
        let key = ButtonKey::new(1, 1);

        let mut expected = Vec::new();
        for kind in ["a", "b", "c", "d", "e"] {
            let action = action("slow", kind);
            dispatcher.subscribe(&action, key);
            dispatcher.run(&action, RunContext::new(key, None));
            dispatcher.unsubscribe(&action);
            expected.extend([format!("update:{kind}"), format!("run:{kind}"), format!("delete:{kind}")]);
        }

        for _ in 0..200 {
            if slow.calls.lock().len() == expected.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*slow.calls.lock(), expected);
    }

    #[tokio::test]
    async fn test_replaced_module_gets_new_queue() {
        let host = Arc::new(ModuleHost::new());
        let first = Arc::new(ConsoleModule::new("console"));
        host.register(first.clone());
        let dispatcher = Dispatcher::new(host.clone());
        let ctx = RunContext::new(ButtonKey::new(1, 1), None);

        dispatcher.run(&action("console", "log"), ctx.clone());
        let second = Arc::new(ConsoleModule::new("console"));
        host.register(second.clone());
        dispatcher.run(&action("console", "log"), ctx);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(first.execution_count().await, 1);
        assert_eq!(second.execution_count().await, 1);

        host.remove("console");
        dispatcher.unsubscribe(&action("console", "log"));
        assert!(dispatcher.queues.lock().is_empty());
    }
}
