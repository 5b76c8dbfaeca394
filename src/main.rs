use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use sysup::config::{CliOverrides, Config, ConfigFile};
use sysup::controller::PhaseController;
use sysup::errors::ScheduleError;
use sysup::events::EventQueue;
use sysup::executor::{ExecutorDeps, PluginExecutor};
use sysup::metrics::MetricsStore;
use sysup::mutex::MutexManager;
use sysup::plugin::PluginKind;
use sysup::pty::ElevationCoordinator;
use sysup::resources::ResourceController;
use sysup::sched::PhaseScheduler;
use sysup::state::{PluginStatus, RunState, StateManager};
use sysup::ui::App;
use sysup::util::{format_bytes, format_duration};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "sysup")]
#[command(version, about = "Parallel system-update orchestrator with per-plugin terminal tabs")]
pub struct Cli {
    /// Pause at phase boundaries until resumed from the UI
    #[arg(short = 'P', long)]
    pub pause_phases: bool,

    /// Maximum concurrent plugin executions (1..=32)
    #[arg(short = 'j', long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Ask plugins to simulate instead of applying changes
    #[arg(long)]
    pub dry_run: bool,

    /// Keep running other plugins after one fails
    #[arg(long)]
    pub continue_on_error: bool,

    /// Restrict the run to a comma-separated plugin subset
    #[arg(long, value_delimiter = ',', value_name = "a,b,c")]
    pub plugins: Option<Vec<String>>,

    /// Path to sysup.toml (default: ~/.config/sysup/sysup.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory for log files and saved terminal dumps
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Resume the previous interrupted run
    #[arg(long)]
    pub resume: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(success) => {
            if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(err) => {
            eprintln!("{} {err:#}", style("error:").red().bold());
            ExitCode::from(2)
        }
    }
}

/// Startup and configuration errors bubble out of here (exit 2); plugin
/// failures come back as `Ok(false)` (exit 1).
fn run(cli: Cli) -> Result<bool> {
    let config_file = match Config::find_config_file(cli.config.as_deref()) {
        Some(path) => ConfigFile::load(&path)?,
        None => anyhow::bail!("no configuration found; create ~/.config/sysup/sysup.toml"),
    };
    let overrides = CliOverrides {
        concurrency: cli.concurrency,
        pause_between_phases: cli.pause_phases,
        dry_run: cli.dry_run,
        continue_on_error: cli.continue_on_error,
        plugins: cli.plugins.clone(),
        log_dir: cli.log_dir.clone(),
        verbose: cli.verbose,
    };
    let (config, registry) = Config::resolve(config_file, &overrides)?;

    let _log_guard = init_logging(&config)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "sysup starting");

    // A schedule cycle is a configuration error: report it before any UI.
    PhaseController::validate(registry.plugins()).map_err(|err: ScheduleError| {
        anyhow::anyhow!(err)
    })?;

    if !console::Term::stdout().is_term() {
        anyhow::bail!("sysup needs an interactive terminal");
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(run_async(cli, config, registry))
}

async fn run_async(
    cli: Cli,
    config: Config,
    mut registry: sysup::plugin::PluginRegistry,
) -> Result<bool> {
    // Finish registration: ask external plugins for their capabilities and
    // sudo program lists before anything is scheduled.
    registry.probe_external().await;
    let registry = Arc::new(registry);
    let state_manager = StateManager::new(config.state_file.clone());

    let run_state = if cli.resume {
        let previous = state_manager
            .load()?
            .context("nothing to resume: no saved run state")?;
        if !previous.matches_plugins(registry.plugins().iter().map(|p| p.name.as_str())) {
            anyhow::bail!("saved run state does not match the configured plugin set");
        }
        previous
    } else {
        RunState::new(registry.plugins().iter().map(|p| p.name.clone()))
    };
    let run_state = Arc::new(Mutex::new(run_state));
    state_manager.save(&run_state.lock().expect("run state poisoned"))?;

    let elevation = Arc::new(ElevationCoordinator::new());
    // Authenticate before the TUI owns the terminal; the prompt happens at
    // most once per run.
    if registry_needs_elevation(&registry) {
        for plugin in registry.plugins() {
            if !plugin.sudo_programs.is_empty() {
                tracing::debug!(
                    plugin = %plugin.name,
                    programs = ?plugin.sudo_programs,
                    "plugin runs programs under sudo"
                );
            }
        }
        elevation
            .ensure_authenticated()
            .await
            .context("elevation pre-authentication failed")?;
    }

    let deps = ExecutorDeps {
        queue: Arc::new(EventQueue::new(sysup::events::DEFAULT_CAPACITY)),
        mutexes: Arc::new(MutexManager::new()),
        resources: Arc::new(ResourceController::new(config.limits.clone())),
        metrics: Arc::new(MetricsStore::new()),
        registry: registry.clone(),
        elevation,
    };

    let executor = Arc::new(PluginExecutor::new(deps.clone(), config.executor.clone()));
    let scheduler = PhaseScheduler::new(
        executor,
        config.controller.continue_on_error,
        config.limits.tasks,
    );
    let (controller, state_rx, command_tx) =
        PhaseController::new(deps.clone(), scheduler, config.controller.clone());

    let cancel = CancellationToken::new();
    let plugin_names: Vec<String> = registry.plugins().iter().map(|p| p.name.clone()).collect();
    let app = App::new(
        &plugin_names,
        deps.queue.clone(),
        deps.metrics.clone(),
        state_rx,
        command_tx,
        cancel.clone(),
        config.bindings.clone(),
        config.log_dir.clone(),
        config.max_scrollback,
    );
    let surfaces = app.surfaces();

    let controller_task = tokio::spawn(controller.run(
        surfaces,
        run_state.clone(),
        state_manager,
        cancel.clone(),
    ));

    let ui_result = app.run().await;
    // UI gone (quit or run finished): make sure the controller winds down.
    cancel.cancel();
    let outcome = controller_task
        .await
        .context("controller task panicked")?
        .map_err(|err| anyhow::anyhow!(err))?;
    ui_result?;

    deps.elevation.shutdown();
    print_summary(&deps.metrics, &run_state);

    Ok(outcome.success)
}

fn registry_needs_elevation(registry: &sysup::plugin::PluginRegistry) -> bool {
    registry.plugins().iter().any(|p| {
        p.capabilities.requires_elevation
            || !p.sudo_programs.is_empty()
            || match &p.kind {
                PluginKind::Declared { commands } => {
                    commands.values().flatten().any(|c| c.elevate)
                }
                PluginKind::External { .. } => false,
            }
    })
}

fn init_logging(config: &Config) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(&config.log_dir).context("Failed to create log directory")?;
    let appender = tracing_appender::rolling::never(&config.log_dir, "sysup.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let default_level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    // The TUI owns stdout; all diagnostics go to the file sink.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(guard)
}

fn print_summary(metrics: &MetricsStore, run_state: &Arc<Mutex<RunState>>) {
    let state = run_state.lock().expect("run state poisoned");
    let snapshots = metrics.snapshot_all();

    println!();
    println!("{}", style("run summary").bold());
    for (name, record) in &state.plugins {
        let (symbol, styled_status) = match record.status {
            PluginStatus::Completed => ("✔", style("completed").green()),
            PluginStatus::Failed => ("✖", style("failed").red()),
            PluginStatus::Skipped => ("-", style("skipped").dim()),
            PluginStatus::Running => ("●", style("interrupted").yellow()),
            PluginStatus::Pending => ("○", style("pending").dim()),
        };
        let rollup = snapshots.get(name).map(|m| m.rollup()).unwrap_or_default();
        let mut details = vec![
            format!("{} packages", rollup.packages),
            format_duration(rollup.duration),
            format!("peak {}", format_bytes(rollup.peak_rss_mb * 1024 * 1024)),
        ];
        if let Some(error) = &record.error {
            details.push(error.clone());
        }
        println!(
            "  {} {:<12} {:<11} {}",
            symbol,
            name,
            styled_status,
            style(details.join(" · ")).dim()
        );
    }

    let total = metrics.rollup();
    println!(
        "  {} {} packages · cpu {:.1}s · net {} · disk {}",
        style("total:").bold(),
        total.packages,
        total.cpu_secs,
        format_bytes(total.net_rx_bytes + total.net_tx_bytes),
        format_bytes(total.read_bytes + total.write_bytes),
    );
}
