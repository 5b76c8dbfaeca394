//! Global phase controller.
//!
//! Drives the whole run through CHECK → DOWNLOAD → EXECUTE. Each global
//! phase is handed to the DAG scheduler; between phases the controller
//! performs dynamic mutex discovery and, when configured, blocks on a
//! pause gate until the UI sends a resume. The state machine is observable
//! through a watch channel so the status bar always knows where the run
//! stands.

use crate::errors::ScheduleError;
use crate::executor::{ExecutorDeps, SessionSurface};
use crate::plugin::{Phase, PluginDescriptor};
use crate::sched::{PhaseScheduler, PluginGraph};
use crate::state::{PluginStatus, RunState, StateManager};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Global run states, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Init,
    Checking,
    WaitingForDownload,
    Downloading,
    WaitingForExecute,
    Executing,
    Completed,
    Failed,
}

impl ControllerState {
    /// Label shown in the status bar. Phase names are display-renamed:
    /// CHECK shows as "Update", EXECUTE as "Upgrade".
    pub fn display_label(&self) -> &'static str {
        match self {
            Self::Init => "Starting",
            Self::Checking => "Update",
            Self::WaitingForDownload => "Paused (before Download)",
            Self::Downloading => "Download",
            Self::WaitingForExecute => "Paused (before Upgrade)",
            Self::Executing => "Upgrade",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, Self::WaitingForDownload | Self::WaitingForExecute)
    }
}

/// Commands the UI can send into the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerCommand {
    /// Release the current pause gate.
    Resume,
    /// Re-run the failed phase of one plugin; only honored at a pause gate
    /// or after the run finished.
    Retry(String),
}

/// Final outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub success: bool,
    pub failed_plugins: Vec<String>,
    pub cancelled: bool,
}

/// Controller configuration.
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    pub pause_between_phases: bool,
    pub continue_on_error: bool,
}

pub struct PhaseController {
    deps: ExecutorDeps,
    scheduler: PhaseScheduler,
    config: ControllerConfig,
    state_tx: watch::Sender<ControllerState>,
    commands: mpsc::Receiver<ControllerCommand>,
}

impl PhaseController {
    pub fn new(
        deps: ExecutorDeps,
        scheduler: PhaseScheduler,
        config: ControllerConfig,
    ) -> (Self, watch::Receiver<ControllerState>, mpsc::Sender<ControllerCommand>) {
        let (state_tx, state_rx) = watch::channel(ControllerState::Init);
        let (command_tx, commands) = mpsc::channel(16);
        (
            Self {
                deps,
                scheduler,
                config,
                state_tx,
                commands,
            },
            state_rx,
            command_tx,
        )
    }

    /// Validate the full plugin graph up front. A cycle aborts the run
    /// with a configuration error before anything executes.
    pub fn validate(plugins: &[Arc<PluginDescriptor>]) -> Result<(), ScheduleError> {
        PluginGraph::build(plugins).map(|_| ())
    }

    /// Drive the run to completion.
    pub async fn run(
        mut self,
        surfaces: HashMap<String, SessionSurface>,
        run_state: Arc<Mutex<RunState>>,
        state_manager: StateManager,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, ScheduleError> {
        // Applicability probing decides participation for the whole run.
        let mut participants: Vec<Arc<PluginDescriptor>> = Vec::new();
        for plugin in self.deps.registry.plugins() {
            if plugin.is_applicable().await {
                participants.push(plugin.clone());
            } else {
                tracing::info!(plugin = %plugin.name, "not applicable on this host, skipping");
                let mut state = run_state.lock().expect("run state poisoned");
                state.mark_skipped(&plugin.name);
                let _ = state_manager.save(&state);
            }
        }

        for (index, phase) in Phase::ALL.iter().enumerate() {
            let phase = *phase;
            if cancel.is_cancelled() {
                break;
            }

            if index > 0 && self.config.pause_between_phases {
                self.set_state(match phase {
                    Phase::Download => ControllerState::WaitingForDownload,
                    _ => ControllerState::WaitingForExecute,
                });
                if !self.wait_for_resume(&surfaces, &run_state, &state_manager, &cancel).await {
                    break;
                }
            }

            let entrants: Vec<Arc<PluginDescriptor>> = participants
                .iter()
                .filter(|p| self.enters(p, phase, &run_state))
                .cloned()
                .collect();
            if entrants.is_empty() {
                continue;
            }

            // The graph is rebuilt at every phase boundary so admission
            // sees the current effective mutex sets and any ordering
            // constraints discovered after CHECK.
            let dynamic_deps = self.deps.registry.dynamic_runs_after_for(phase);
            let graph = PluginGraph::build_with_edges(&entrants, &dynamic_deps)?;

            self.set_state(match phase {
                Phase::Check => ControllerState::Checking,
                Phase::Download => ControllerState::Downloading,
                Phase::Execute => ControllerState::Executing,
            });
            {
                let mut state = run_state.lock().expect("run state poisoned");
                state.set_phase(phase);
                let _ = state_manager.save(&state);
            }

            let summary = self
                .scheduler
                .run_phase(phase, &graph, &surfaces, &run_state, &state_manager, &cancel)
                .await;

            if !summary.all_success() && !self.config.continue_on_error {
                tracing::warn!(failed = ?summary.failed, "phase had failures, aborting run");
                break;
            }

            if phase == Phase::Check {
                self.discover_dynamic_constraints(&participants, &run_state).await;
            }
        }

        let failed_plugins: Vec<String> = {
            let state = run_state.lock().expect("run state poisoned");
            state
                .plugins
                .iter()
                .filter(|(_, r)| r.status == PluginStatus::Failed)
                .map(|(name, _)| name.clone())
                .collect()
        };

        let cancelled = cancel.is_cancelled();
        let success = failed_plugins.is_empty() && !cancelled;
        self.set_state(if success {
            ControllerState::Completed
        } else {
            ControllerState::Failed
        });

        Ok(RunOutcome {
            success,
            failed_plugins,
            cancelled,
        })
    }

    fn enters(&self, plugin: &Arc<PluginDescriptor>, phase: Phase, run_state: &Arc<Mutex<RunState>>) -> bool {
        let state = run_state.lock().expect("run state poisoned");
        match state.status(&plugin.name) {
            PluginStatus::Failed | PluginStatus::Skipped => return false,
            _ => {}
        }
        // Resume support: already-completed phases are not re-run.
        if state.phase_completed(&plugin.name, phase) {
            return false;
        }
        drop(state);
        plugin.enters_phase(phase)
    }

    /// Query each surviving plugin for its dynamic mutex sets and ordering
    /// constraints, extending the effective sets used by later phases.
    async fn discover_dynamic_constraints(
        &self,
        participants: &[Arc<PluginDescriptor>],
        run_state: &Arc<Mutex<RunState>>,
    ) {
        for plugin in participants {
            let failed = {
                let state = run_state.lock().expect("run state poisoned");
                state.status(&plugin.name) == PluginStatus::Failed
            };
            if failed {
                continue;
            }
            for phase in [Phase::Download, Phase::Execute] {
                let dynamic = plugin.dynamic_mutexes(phase).await;
                if !dynamic.is_empty() {
                    tracing::debug!(
                        plugin = %plugin.name,
                        %phase,
                        mutexes = ?dynamic.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
                        "discovered dynamic mutexes"
                    );
                    self.deps
                        .registry
                        .set_dynamic_mutexes(&plugin.name, phase, dynamic);
                }
                let deps = plugin.dynamic_dependencies(phase).await;
                if !deps.is_empty() {
                    tracing::debug!(
                        plugin = %plugin.name,
                        %phase,
                        dependencies = ?deps,
                        "discovered dynamic ordering constraints"
                    );
                    self.deps
                        .registry
                        .set_dynamic_runs_after(&plugin.name, phase, deps);
                }
            }
        }
    }

    /// Block at a pause gate until Resume arrives. Returns false on
    /// cancellation. Retry commands are honored while gated.
    async fn wait_for_resume(
        &mut self,
        surfaces: &HashMap<String, SessionSurface>,
        run_state: &Arc<Mutex<RunState>>,
        state_manager: &StateManager,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                command = self.commands.recv() => match command {
                    Some(ControllerCommand::Resume) => return true,
                    Some(ControllerCommand::Retry(plugin)) => {
                        self.retry_plugin(&plugin, surfaces, run_state, state_manager, cancel).await;
                    }
                    None => return false,
                },
            }
        }
    }

    /// Re-run the failed phase of one plugin as a single-node schedule.
    async fn retry_plugin(
        &self,
        name: &str,
        surfaces: &HashMap<String, SessionSurface>,
        run_state: &Arc<Mutex<RunState>>,
        state_manager: &StateManager,
        cancel: &CancellationToken,
    ) {
        let (phase, failed) = {
            let state = run_state.lock().expect("run state poisoned");
            let Some(record) = state.plugins.get(name) else {
                return;
            };
            (record.phase, record.status == PluginStatus::Failed)
        };
        if !failed {
            tracing::warn!(plugin = name, "retry requested for a plugin that has not failed");
            return;
        }
        let Some(plugin) = self.deps.registry.get(name) else {
            return;
        };
        tracing::info!(plugin = name, %phase, "retrying failed phase");
        {
            let mut state = run_state.lock().expect("run state poisoned");
            if let Some(record) = state.plugins.get_mut(name) {
                record.status = PluginStatus::Pending;
                record.error = None;
                record.completed_at = None;
            }
            let _ = state_manager.save(&state);
        }
        if let Ok(graph) = PluginGraph::build(std::slice::from_ref(&plugin)) {
            self.scheduler
                .run_phase(phase, &graph, surfaces, run_state, state_manager, cancel)
                .await;
        }
    }

    fn set_state(&self, state: ControllerState) {
        tracing::info!(?state, "controller transition");
        let _ = self.state_tx.send(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, EventQueue};
    use crate::executor::{ExecutorConfig, PluginExecutor};
    use crate::metrics::MetricsStore;
    use crate::mutex::MutexManager;
    use crate::plugin::{Capabilities, PluginRegistry, UpdateCommand};
    use crate::pty::ElevationCoordinator;
    use crate::resources::{ResourceController, ResourceLimits};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn check_exec_plugin(name: &str) -> PluginDescriptor {
        let mut commands = BTreeMap::new();
        commands.insert(
            Phase::Check,
            vec![UpdateCommand::new(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("echo {name}-check"),
            ])],
        );
        commands.insert(
            Phase::Execute,
            vec![UpdateCommand::new(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("echo {name}-execute"),
            ])],
        );
        PluginDescriptor::declared(name, commands)
    }

    struct Fixture {
        controller: PhaseController,
        state_rx: watch::Receiver<ControllerState>,
        command_tx: mpsc::Sender<ControllerCommand>,
        surfaces: HashMap<String, SessionSurface>,
        run_state: Arc<Mutex<RunState>>,
        state_manager: StateManager,
        queue: Arc<EventQueue>,
        _dir: tempfile::TempDir,
        _size_txs: Vec<watch::Sender<(u16, u16)>>,
    }

    fn fixture(plugins: Vec<PluginDescriptor>, config: ControllerConfig) -> Fixture {
        let mut registry = PluginRegistry::new();
        for plugin in plugins {
            registry.register(plugin).unwrap();
        }
        let registry = Arc::new(registry);
        let queue = Arc::new(EventQueue::new(4096));
        let deps = ExecutorDeps {
            queue: queue.clone(),
            mutexes: Arc::new(MutexManager::new()),
            resources: Arc::new(ResourceController::new(ResourceLimits::default())),
            metrics: Arc::new(MetricsStore::new()),
            registry: registry.clone(),
            elevation: Arc::new(ElevationCoordinator::new()),
        };
        let executor = Arc::new(PluginExecutor::new(deps.clone(), ExecutorConfig::default()));
        let scheduler = PhaseScheduler::new(executor, config.continue_on_error, 4);
        let (controller, state_rx, command_tx) = PhaseController::new(deps, scheduler, config);

        let mut surfaces = HashMap::new();
        let mut size_txs = Vec::new();
        for plugin in registry.plugins() {
            let (surface, tx) = SessionSurface::detached(80, 24);
            surfaces.insert(plugin.name.clone(), surface);
            size_txs.push(tx);
        }
        let dir = tempfile::tempdir().unwrap();
        let state_manager = StateManager::new(dir.path().join("state.json"));
        let run_state = Arc::new(Mutex::new(RunState::new(
            registry.plugins().iter().map(|p| p.name.clone()),
        )));

        Fixture {
            controller,
            state_rx,
            command_tx,
            surfaces,
            run_state,
            state_manager,
            queue,
            _dir: dir,
            _size_txs: size_txs,
        }
    }

    #[tokio::test]
    async fn test_happy_path_two_plugins() {
        let fx = fixture(
            vec![check_exec_plugin("alpha"), check_exec_plugin("beta")],
            ControllerConfig::default(),
        );
        let cancel = CancellationToken::new();
        let outcome = fx
            .controller
            .run(fx.surfaces, fx.run_state.clone(), fx.state_manager, cancel)
            .await
            .unwrap();

        assert!(outcome.success);
        assert!(outcome.failed_plugins.is_empty());
        assert_eq!(*fx.state_rx.borrow(), ControllerState::Completed);

        // Both plugins: PhaseStart/End for CHECK and EXECUTE, one
        // Completion each, with success=true.
        let mut events = Vec::new();
        loop {
            let batch = fx.queue.drain_batched(256, Duration::from_millis(10)).await;
            if batch.is_empty() {
                break;
            }
            events.extend(batch);
        }
        for plugin in ["alpha", "beta"] {
            for phase in [Phase::Check, Phase::Execute] {
                let starts = events
                    .iter()
                    .filter(|e| {
                        e.plugin == plugin
                            && matches!(e.kind, EventKind::PhaseStart { phase: p } if p == phase)
                    })
                    .count();
                assert_eq!(starts, 1, "{plugin} {phase} starts");
            }
            let completions = events
                .iter()
                .filter(|e| {
                    e.plugin == plugin
                        && matches!(e.kind, EventKind::Completion { success: true, .. })
                })
                .count();
            assert_eq!(completions, 1, "{plugin} completions");
        }

        let state = fx.run_state.lock().unwrap();
        assert_eq!(state.status("alpha"), PluginStatus::Completed);
        assert_eq!(state.status("beta"), PluginStatus::Completed);
    }

    #[tokio::test]
    async fn test_pause_gate_blocks_until_resume() {
        let fx = fixture(
            vec![check_exec_plugin("alpha")],
            ControllerConfig {
                pause_between_phases: true,
                continue_on_error: false,
            },
        );
        let cancel = CancellationToken::new();
        let mut state_rx = fx.state_rx.clone();
        let command_tx = fx.command_tx.clone();

        // Resume each gate shortly after it is reached.
        let gatekeeper = tokio::spawn(async move {
            let mut resumes = 0;
            while state_rx.changed().await.is_ok() {
                if state_rx.borrow().is_paused() {
                    // The gate really holds: nothing else transitions while
                    // we sit here.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    command_tx.send(ControllerCommand::Resume).await.unwrap();
                    resumes += 1;
                }
                if matches!(
                    *state_rx.borrow(),
                    ControllerState::Completed | ControllerState::Failed
                ) {
                    break;
                }
            }
            resumes
        });

        let outcome = fx
            .controller
            .run(fx.surfaces, fx.run_state, fx.state_manager, cancel)
            .await
            .unwrap();
        assert!(outcome.success);
        // alpha has no DOWNLOAD phase, but the gates still sit before the
        // DOWNLOAD and EXECUTE transitions.
        let resumes = gatekeeper.await.unwrap();
        assert_eq!(resumes, 2);
    }

    #[tokio::test]
    async fn test_cycle_rejected_at_validation() {
        let alpha = check_exec_plugin("alpha").with_runs_after(vec!["beta".to_string()]);
        let beta = check_exec_plugin("beta").with_runs_after(vec!["alpha".to_string()]);
        let err =
            PhaseController::validate(&[Arc::new(alpha), Arc::new(beta)]).unwrap_err();
        match err {
            ScheduleError::Cycle { participants } => {
                assert!(participants.contains(&"alpha".to_string()));
                assert!(participants.contains(&"beta".to_string()));
            }
            other => panic!("expected Cycle, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_check_blocks_later_phases() {
        let mut commands = BTreeMap::new();
        commands.insert(
            Phase::Check,
            vec![UpdateCommand::new(vec![
                "sh".to_string(),
                "-c".to_string(),
                "exit 1".to_string(),
            ])],
        );
        commands.insert(
            Phase::Execute,
            vec![UpdateCommand::new(vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo should-not-run".to_string(),
            ])],
        );
        let fx = fixture(
            vec![PluginDescriptor::declared("broken", commands)],
            ControllerConfig {
                pause_between_phases: false,
                continue_on_error: true,
            },
        );
        let cancel = CancellationToken::new();
        let outcome = fx
            .controller
            .run(fx.surfaces, fx.run_state.clone(), fx.state_manager, cancel)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.failed_plugins, vec!["broken"]);

        // EXECUTE never started for the failed plugin.
        let mut events = Vec::new();
        loop {
            let batch = fx.queue.drain_batched(256, Duration::from_millis(10)).await;
            if batch.is_empty() {
                break;
            }
            events.extend(batch);
        }
        assert!(!events.iter().any(|e| matches!(
            e.kind,
            EventKind::PhaseStart { phase: Phase::Execute }
        )));
    }

    #[tokio::test]
    async fn test_resume_skips_completed_phases() {
        let fx = fixture(vec![check_exec_plugin("alpha")], ControllerConfig::default());
        // Pretend CHECK already completed in a previous run.
        fx.run_state
            .lock()
            .unwrap()
            .mark_phase_done("alpha", Phase::Check, true, false, None);
        let cancel = CancellationToken::new();
        let outcome = fx
            .controller
            .run(fx.surfaces, fx.run_state, fx.state_manager, cancel)
            .await
            .unwrap();
        assert!(outcome.success);

        let mut events = Vec::new();
        loop {
            let batch = fx.queue.drain_batched(256, Duration::from_millis(10)).await;
            if batch.is_empty() {
                break;
            }
            events.extend(batch);
        }
        // No CHECK events on resume, but EXECUTE ran.
        assert!(!events
            .iter()
            .any(|e| matches!(e.kind, EventKind::PhaseStart { phase: Phase::Check })));
        assert!(events
            .iter()
            .any(|e| matches!(e.kind, EventKind::PhaseStart { phase: Phase::Execute })));
    }

    #[tokio::test]
    async fn test_download_phase_gated_on_capability() {
        let mut commands = BTreeMap::new();
        commands.insert(
            Phase::Download,
            vec![UpdateCommand::new(vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo downloading".to_string(),
            ])],
        );
        let with_dl = PluginDescriptor::declared("downloader", commands).with_capabilities(
            Capabilities {
                separate_download: true,
                ..Default::default()
            },
        );
        let fx = fixture(vec![with_dl], ControllerConfig::default());
        let cancel = CancellationToken::new();
        let outcome = fx
            .controller
            .run(fx.surfaces, fx.run_state, fx.state_manager, cancel)
            .await
            .unwrap();
        assert!(outcome.success);

        let mut saw_download = false;
        loop {
            let batch = fx.queue.drain_batched(256, Duration::from_millis(10)).await;
            if batch.is_empty() {
                break;
            }
            saw_download |= batch
                .iter()
                .any(|e| matches!(e.kind, EventKind::PhaseStart { phase: Phase::Download }));
        }
        assert!(saw_download);
    }
}
