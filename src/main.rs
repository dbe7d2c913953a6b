//! Deck Actions - action scheduling and button state engine
//!
//! Runs the engine with console modules, an interactive REPL and a
//! hot-reloaded YAML configuration.

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use deck_actions::cli::{self, ConsoleCommand};
use deck_actions::config::{AppConfig, ConfigReload, ConfigWatcher, ModuleConfig, ModuleKind};
use deck_actions::engine::{
    ActionSetStore, Engine, EngineActor, EngineEvent, EngineHandle, MemoryPersistence, SetPersistence,
    SledPersistence,
};
use deck_actions::modules::{ConsoleModule, ModuleHandle, ModuleHost, Severity};
use deck_actions::paths::AppPaths;
use tokio::sync::mpsc;

/// Deck Actions - run button actions with delays, steps and module health
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults to the application directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Write the log file as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Action store database directory (overrides storage.path)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Keep the action store in memory only
    #[arg(long, conflicts_with = "database")]
    ephemeral: bool,

    /// Run without the interactive console
    #[arg(long)]
    no_console: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let paths = AppPaths::detect();
    paths.ensure_directories()?;

    let _log_guard = init_logging(&args.log_level, &paths.logs_dir, args.log_json)?;

    info!("Starting Deck Actions v{}...", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.clone().unwrap_or_else(|| paths.config.clone());
    if !config_path.exists() {
        info!("No configuration at {}, writing defaults", config_path.display());
        AppConfig::default().save(&config_path.to_string_lossy()).await?;
    }
    info!("Configuration file: {}", config_path.display());

    let (config_watcher, initial_config) = ConfigWatcher::new(config_path.to_string_lossy().to_string()).await?;
    info!("Configuration loaded successfully with hot-reload enabled");

    let persistence: Box<dyn SetPersistence> = if args.ephemeral {
        info!("Action store is in memory only");
        Box::new(MemoryPersistence::new())
    } else {
        let db_path = args
            .database
            .clone()
            .or_else(|| initial_config.storage.path.clone())
            .unwrap_or_else(|| paths.database_path());
        info!("Action store: {}", db_path.display());
        Box::new(SledPersistence::open(&db_path).with_context(|| format!("Failed to open {}", db_path.display()))?)
    };
    let store = ActionSetStore::open(persistence).context("Failed to load the action store")?;

    let host = Arc::new(ModuleHost::new());
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let engine = Engine::new(initial_config.engine_settings(), store, host.clone(), events_tx);
    let handle = EngineActor::spawn(engine);

    // Module health feeds button status
    let health_handle = handle.clone();
    host.subscribe_health(Arc::new(move |instance_id: &str, _severity: Severity| {
        health_handle.health_changed(instance_id);
    }));

    for module in &initial_config.modules {
        start_module(&host, &handle, module).await?;
    }

    let pruned = handle.retain_instances(initial_config.module_ids()).await?;
    if pruned > 0 {
        info!("Dropped actions of unconfigured modules from {} buttons", pruned);
    }
    let subscribed = handle.subscribe_all().await?;
    info!("Subscribed {} stored actions", subscribed);

    run_app(
        &args,
        handle,
        host,
        config_watcher,
        events_rx,
        shutdown_signal(),
    )
    .await?;

    info!("Deck Actions shutdown complete");
    Ok(())
}

async fn run_app(
    args: &Args,
    handle: EngineHandle,
    host: Arc<ModuleHost>,
    mut config_watcher: ConfigWatcher,
    mut events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let mut console_rx = if args.no_console {
        None
    } else {
        println!("{} (type 'help')", "Deck Actions console".bold().cyan());
        Some(cli::spawn_repl())
    };

    info!("Ready");

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(event) = events_rx.recv() => log_event(&event),

            cmd = next_console_command(&mut console_rx) => {
                match cmd {
                    Some(cmd) => {
                        if let Err(e) = cli::execute(cmd, &handle, &host).await {
                            eprintln!("{} {:#}", "error:".red(), e);
                        }
                    }
                    None => {
                        info!("Console closed, stopping");
                        break;
                    }
                }
            }

            Some(reload) = config_watcher.next_reload() => {
                info!("Configuration file changed, reloading...");
                match apply_reload(&handle, &host, &reload).await {
                    Ok(()) => info!("Configuration reloaded"),
                    Err(e) => warn!("Failed to apply new configuration: {:#}", e),
                }
            }

            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping event loop");
                break;
            }
        }
    }

    info!("Shutting down...");
    let aborted = handle.abort_all().await?;
    if aborted > 0 {
        info!("Cancelled delayed actions on {} buttons", aborted);
    }
    Ok(())
}

async fn next_console_command(rx: &mut Option<mpsc::UnboundedReceiver<ConsoleCommand>>) -> Option<ConsoleCommand> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Register a configured module and publish the action kinds it offers
async fn start_module(host: &ModuleHost, handle: &EngineHandle, module: &ModuleConfig) -> Result<()> {
    let instance: Arc<dyn ModuleHandle> = match module.kind {
        ModuleKind::Console => Arc::new(ConsoleModule::with_definitions(
            module.id.clone(),
            module.actions.clone(),
        )),
    };
    let definitions = instance.action_definitions();
    host.register(instance);
    info!(
        "Started {:?} module '{}'{}",
        module.kind,
        module.id,
        module.label.as_ref().map(|l| format!(" ({})", l)).unwrap_or_default()
    );

    host.set_health(&module.id, module.health);
    handle.set_action_definitions(module.id.clone(), Some(definitions)).await
}

/// Bring modules in line with a reloaded configuration
async fn apply_reload(handle: &EngineHandle, host: &ModuleHost, reload: &ConfigReload) -> Result<()> {
    if reload.needs_restart {
        warn!("Surface geometry and storage changes take effect after a restart");
    }

    let changes = &reload.modules;
    if changes.is_empty() {
        debug!("No module changes");
        return Ok(());
    }

    for id in &changes.removed {
        host.remove(id);
        handle.delete_instance(id.clone()).await?;
    }
    for module in changes.added.iter().chain(changes.changed.iter()) {
        start_module(host, handle, module).await?;
    }

    if !changes.changed.is_empty() {
        // Replaced handles start without subscriptions
        handle.subscribe_all().await?;
    }

    info!(
        "Modules: {} added, {} removed, {} changed",
        changes.added.len(),
        changes.removed.len(),
        changes.changed.len()
    );
    Ok(())
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::PageNavigation { device_id, navigation } => {
            info!(device = ?device_id, ?navigation, "Page navigation requested");
        }
        EngineEvent::ModuleDefinitionsChanged { instance_id, definitions } => {
            info!(
                instance = %instance_id,
                actions = definitions.as_ref().map(|d| d.len()).unwrap_or(0),
                "Module definitions changed"
            );
        }
        other => match serde_json::to_string(other) {
            Ok(json) => debug!(target: "deck_actions::events", "{}", json),
            Err(e) => warn!("Failed to serialize engine event: {}", e),
        },
    }
}

fn init_logging(level: &str, logs_dir: &Path, json: bool) -> Result<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::daily(logs_dir, "deck-actions.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(file_writer)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_writer)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_writer(std::io::stderr),
        )
        .init();

    Ok(guard)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install CTRL+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
