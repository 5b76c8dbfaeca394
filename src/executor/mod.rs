//! Plugin executor: runs one plugin through one phase.
//!
//! The executor owns the admission sequence (task → download → memory
//! permits, then mutexes), the PTY session, the byte pump, the resource
//! sampler, and the outcome classification. Everything it acquires is
//! released on scope exit, including under cancellation; the terminal
//! screen and metrics it writes into are owned elsewhere and survive it.

mod patterns;
mod progress;
mod pump;

pub use patterns::OutputClassifier;
pub use progress::{decode as decode_progress_frame, ProtocolEvent, FRAME_PREFIX};
pub use pump::{OutputPump, PumpOutput};

use crate::errors::{ExecutorError, MutexError};
use crate::events::{EventKind, EventQueue, OutputStream, ProgressUpdate, StreamEvent};
use crate::metrics::{MetricsStore, PhaseOutcome, ProcSampler};
use crate::mutex::MutexManager;
use crate::plugin::{Phase, PluginDescriptor, PluginRegistry, UpdateCommand};
use crate::pty::{ElevationCoordinator, PtySession, PtyWriter};
use crate::resources::ResourceController;
use crate::term::TerminalScreen;
use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Sampling cadence for the per-child resource probe.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Shared subsystem handles, constructed once at startup and passed down
/// the call tree.
#[derive(Clone)]
pub struct ExecutorDeps {
    pub queue: Arc<EventQueue>,
    pub mutexes: Arc<MutexManager>,
    pub resources: Arc<ResourceController>,
    pub metrics: Arc<MetricsStore>,
    pub registry: Arc<PluginRegistry>,
    pub elevation: Arc<ElevationCoordinator>,
}

/// Per-run executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Ceiling for mutex waits and commands without their own timeout.
    pub phase_timeout: Duration,
    /// SIGTERM-to-SIGKILL grace when terminating a child.
    pub grace_period: Duration,
    pub dry_run: bool,
    /// Admission estimate per plugin for the memory gate.
    pub estimated_memory_mb: u64,
    /// Base backoff after a detected mutex deadlock.
    pub deadlock_backoff: Duration,
    pub max_deadlock_retries: u32,
    /// Directory for per-plugin output capture; disabled when `None`.
    pub plugin_log_dir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            phase_timeout: Duration::from_secs(3600),
            grace_period: Duration::from_secs(5),
            dry_run: false,
            estimated_memory_mb: 512,
            deadlock_backoff: Duration::from_millis(250),
            max_deadlock_retries: 3,
            plugin_log_dir: None,
        }
    }
}

/// The terminal surface a running session writes into. The UI tab owns the
/// screen and the stdin handle; the executor is a guest. The watch channel
/// carries viewport size changes into the live PTY.
#[derive(Clone)]
pub struct SessionSurface {
    pub screen: Arc<Mutex<TerminalScreen>>,
    pub writer: PtyWriter,
    pub size_rx: watch::Receiver<(u16, u16)>,
}

impl SessionSurface {
    /// A detached surface for headless use and tests.
    pub fn detached(cols: u16, rows: u16) -> (Self, watch::Sender<(u16, u16)>) {
        let (tx, rx) = watch::channel((cols, rows));
        (
            Self {
                screen: Arc::new(Mutex::new(TerminalScreen::new(
                    cols as usize,
                    rows as usize,
                ))),
                writer: PtyWriter::default(),
                size_rx: rx,
            },
            tx,
        )
    }
}

/// Outcome of one plugin-phase run.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseRunResult {
    /// False when the phase had no commands and was skipped entirely.
    pub ran: bool,
    pub success: bool,
    pub error: Option<String>,
    pub packages: u64,
}

impl PhaseRunResult {
    fn noop() -> Self {
        Self {
            ran: false,
            success: true,
            error: None,
            packages: 0,
        }
    }
}

pub struct PluginExecutor {
    deps: ExecutorDeps,
    config: ExecutorConfig,
}

impl PluginExecutor {
    pub fn new(deps: ExecutorDeps, config: ExecutorConfig) -> Self {
        Self { deps, config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `plugin` through `phase`.
    ///
    /// Publishes exactly one PhaseStart and one PhaseEnd when the phase has
    /// commands, and a Completion after the plugin's last phase or on
    /// failure. Failures never propagate as errors; they surface in the
    /// returned result and the published events.
    pub async fn run_phase(
        &self,
        plugin: &Arc<PluginDescriptor>,
        phase: Phase,
        surface: &SessionSurface,
        cancel: &CancellationToken,
    ) -> PhaseRunResult {
        let commands = plugin.commands_for(phase, self.config.dry_run).await;
        if commands.is_empty() {
            return PhaseRunResult::noop();
        }

        // Announce admission so the tab can show a Locked state while the
        // plugin waits for permits and mutexes.
        self.publish(
            plugin,
            EventKind::Progress {
                phase,
                update: ProgressUpdate {
                    message: Some("waiting for admission".to_string()),
                    ..Default::default()
                },
            },
        )
        .await;

        // Admission order is fixed: task -> download -> memory -> mutexes.
        let permits = match self
            .deps
            .resources
            .admit(phase, self.config.estimated_memory_mb)
            .await
        {
            Ok(permits) => permits,
            Err(err) => {
                return self
                    .fail_without_session(plugin, phase, ExecutorError::from(err))
                    .await;
            }
        };

        let mutex_set = self.deps.registry.effective_mutexes(&plugin.name, phase);
        if let Err(err) = self.acquire_mutexes(&plugin.name, &mutex_set, cancel).await {
            return self.fail_without_session(plugin, phase, err).await;
        }

        self.deps.metrics.begin_phase(&plugin.name, phase);
        self.publish(plugin, EventKind::PhaseStart { phase }).await;

        let mut log_file = self.open_plugin_log(&plugin.name);
        let mut packages = 0u64;
        let mut failure: Option<ExecutorError> = None;

        for command in &commands {
            match self
                .run_command(plugin, phase, command, surface, cancel, &mut log_file)
                .await
            {
                Ok(step_packages) => packages += step_packages,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let (success, error) = match &failure {
            None => (true, None),
            Some(err) => (false, Some(err.status_label())),
        };

        self.deps.metrics.end_phase(
            &plugin.name,
            phase,
            PhaseOutcome {
                success,
                exit_code: match &failure {
                    Some(ExecutorError::NonZeroExit { code }) => Some(*code),
                    None => Some(0),
                    _ => None,
                },
                error: error.clone(),
                packages,
            },
        );

        // Reverse of acquisition: mutexes first, permits on drop.
        self.deps.mutexes.release(&plugin.name, &mutex_set);

        self.publish(
            plugin,
            EventKind::PhaseEnd {
                phase,
                success,
                error: error.clone(),
            },
        )
        .await;

        if !success || phase == plugin.final_phase() {
            self.publish_completion(plugin, success, error.clone()).await;
        }

        drop(permits);
        PhaseRunResult {
            ran: true,
            success,
            error,
            packages,
        }
    }

    /// Acquire the mutex set, retrying after detected deadlocks with a
    /// linear backoff.
    async fn acquire_mutexes(
        &self,
        owner: &str,
        mutex_set: &[crate::mutex::MutexId],
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ExecutorError::Cancelled);
            }
            match self
                .deps
                .mutexes
                .acquire(owner, mutex_set, self.config.phase_timeout)
                .await
            {
                Ok(()) => return Ok(()),
                Err(MutexError::Deadlock { participants }) => {
                    attempt += 1;
                    if attempt > self.config.max_deadlock_retries {
                        tracing::error!(owner, ?participants, "mutex deadlock persisted, giving up");
                        return Err(ExecutorError::MutexDeadlock);
                    }
                    let backoff = self.config.deadlock_backoff * attempt;
                    tracing::warn!(owner, attempt, ?backoff, "mutex deadlock, backing off");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Emit the full failing event sequence for a phase that never got a
    /// session. Start/End stay paired so consumers can rely on the pairing
    /// invariant.
    async fn fail_without_session(
        &self,
        plugin: &Arc<PluginDescriptor>,
        phase: Phase,
        err: ExecutorError,
    ) -> PhaseRunResult {
        let label = err.status_label();
        self.deps.metrics.begin_phase(&plugin.name, phase);
        self.publish(plugin, EventKind::PhaseStart { phase }).await;
        self.deps.metrics.end_phase(
            &plugin.name,
            phase,
            PhaseOutcome {
                success: false,
                exit_code: None,
                error: Some(label.clone()),
                packages: 0,
            },
        );
        self.publish(
            plugin,
            EventKind::PhaseEnd {
                phase,
                success: false,
                error: Some(label.clone()),
            },
        )
        .await;
        self.publish_completion(plugin, false, Some(label.clone()))
            .await;
        PhaseRunResult {
            ran: true,
            success: false,
            error: Some(label),
            packages: 0,
        }
    }

    /// Run one command step on a fresh PTY session.
    async fn run_command(
        &self,
        plugin: &Arc<PluginDescriptor>,
        phase: Phase,
        command: &UpdateCommand,
        surface: &SessionSurface,
        cancel: &CancellationToken,
        log_file: &mut Option<std::fs::File>,
    ) -> Result<u64, ExecutorError> {
        self.deps.metrics.begin_command(&plugin.name, phase);

        let mut classifier =
            OutputClassifier::compile(command, plugin.package_count_pattern.as_deref());

        let mut argv = Vec::with_capacity(command.argv.len() + 1);
        if command.elevate {
            self.deps
                .elevation
                .ensure_authenticated()
                .await
                .map_err(ExecutorError::Spawn)?;
            argv.push("sudo".to_string());
        }
        argv.extend(command.argv.iter().cloned());

        let mut env = HashMap::new();
        env.insert("SYSUP_PHASE".to_string(), phase.as_str().to_string());
        if self.config.dry_run {
            env.insert("SYSUP_DRY_RUN".to_string(), "1".to_string());
        }

        let (cols, rows) = {
            let screen = surface.screen.lock().expect("screen poisoned");
            (screen.cols() as u16, screen.rows() as u16)
        };

        let mut session = PtySession::spawn(
            &argv,
            &env,
            None,
            cols,
            rows,
            surface.writer.clone(),
        )?;

        // Announce the step so the UI can show "k of n" before any output.
        self.publish(
            plugin,
            EventKind::Progress {
                phase,
                update: ProgressUpdate {
                    message: Some(format!(
                        "step {}/{}: {}",
                        command.step,
                        command.of,
                        command.display()
                    )),
                    ..Default::default()
                },
            },
        )
        .await;

        let sampler_cancel = CancellationToken::new();
        let sampler = session.pid().map(|pid| {
            self.spawn_sampler(plugin.name.clone(), phase, pid, sampler_cancel.clone())
        });

        let timeout = command.timeout().unwrap_or(self.config.phase_timeout);
        let result = self
            .pump_session(
                plugin,
                phase,
                &mut session,
                surface,
                &mut classifier,
                cancel,
                timeout,
                log_file,
            )
            .await;

        sampler_cancel.cancel();
        if let Some(handle) = sampler {
            handle.await.ok();
        }
        session.close_stdin();

        result.map(|_| classifier.packages())
    }

    /// Pump PTY output until exit, timeout, or cancellation, then classify.
    #[allow(clippy::too_many_arguments)]
    async fn pump_session(
        &self,
        plugin: &Arc<PluginDescriptor>,
        phase: Phase,
        session: &mut PtySession,
        surface: &SessionSurface,
        classifier: &mut OutputClassifier,
        cancel: &CancellationToken,
        timeout: Duration,
        log_file: &mut Option<std::fs::File>,
    ) -> Result<(), ExecutorError> {
        enum Step {
            Chunk(Option<Vec<u8>>),
            Cancelled,
            TimedOut,
            Resized(bool),
        }

        let mut pump = OutputPump::new();
        let mut size_rx = surface.size_rx.clone();
        // Stop polling the size channel once its sender is gone.
        let mut size_alive = true;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let step = tokio::select! {
                chunk = session.read() => Step::Chunk(chunk),
                _ = cancel.cancelled() => Step::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Step::TimedOut,
                changed = size_rx.changed(), if size_alive => Step::Resized(changed.is_ok()),
            };
            match step {
                Step::Chunk(Some(chunk)) => {
                    let out = pump.feed(&chunk);
                    self.dispatch(plugin, phase, out, surface, classifier, log_file)
                        .await;
                }
                Step::Chunk(None) => break,
                Step::Cancelled => {
                    session.terminate(self.config.grace_period).await.ok();
                    return Err(ExecutorError::Cancelled);
                }
                Step::TimedOut => {
                    tracing::warn!(plugin = %plugin.name, %phase, "command timed out, terminating");
                    session.terminate(self.config.grace_period).await.ok();
                    return Err(ExecutorError::Timeout);
                }
                Step::Resized(true) => {
                    let (cols, rows) = *size_rx.borrow();
                    session.resize(cols, rows).ok();
                }
                Step::Resized(false) => size_alive = false,
            }
        }

        let out = pump.finish();
        self.dispatch(plugin, phase, out, surface, classifier, log_file)
            .await;

        let exit = session.wait().await?;
        classifier.classify(exit.code)
    }

    /// Route pump output: screen bytes to the tab, lines to events and the
    /// classifier, frames to the protocol decoder.
    async fn dispatch(
        &self,
        plugin: &Arc<PluginDescriptor>,
        phase: Phase,
        out: PumpOutput,
        surface: &SessionSurface,
        classifier: &mut OutputClassifier,
        log_file: &mut Option<std::fs::File>,
    ) {
        if !out.screen_bytes.is_empty() {
            surface
                .screen
                .lock()
                .expect("screen poisoned")
                .feed(&out.screen_bytes);
        }

        for line in out.lines {
            let text = String::from_utf8_lossy(&line).into_owned();
            classifier.observe(&text);
            if let Some(file) = log_file {
                let _ = writeln!(file, "{text}");
            }
            self.publish(
                plugin,
                EventKind::Output {
                    stream: OutputStream::Stdout,
                    line,
                },
            )
            .await;
        }

        for frame in out.frames {
            match progress::decode(&frame) {
                Some(ProtocolEvent::Progress {
                    phase: frame_phase,
                    update,
                }) => {
                    let target = frame_phase.unwrap_or(phase);
                    if let Some(rx) = update.bytes_done {
                        self.deps
                            .metrics
                            .record_network(&plugin.name, target, rx, 0);
                    }
                    self.deps.metrics.record_items(
                        &plugin.name,
                        target,
                        update.items_done,
                        update.items_total,
                    );
                    self.publish(
                        plugin,
                        EventKind::Progress {
                            phase: target,
                            update,
                        },
                    )
                    .await;
                }
                Some(ProtocolEvent::PhaseStart { .. }) | Some(ProtocolEvent::PhaseEnd { .. }) => {
                    // Phase lifecycle is owned by this executor; a plugin's
                    // own markers are informational only.
                    tracing::debug!(plugin = %plugin.name, "plugin-reported phase marker ignored");
                }
                None => {
                    tracing::warn!(plugin = %plugin.name, "undecodable progress frame dropped");
                }
            }
        }
    }

    fn spawn_sampler(
        &self,
        plugin: String,
        phase: Phase,
        pid: u32,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let metrics = self.deps.metrics.clone();
        let resources = self.deps.resources.clone();
        tokio::spawn(async move {
            let probe = ProcSampler::new(pid);
            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match probe.sample() {
                    Some(sample) => {
                        metrics.record_sample(&plugin, phase, &sample);
                        resources.update_sampled_memory(metrics.total_current_rss_mb());
                    }
                    None => break,
                }
            }
        })
    }

    async fn publish(&self, plugin: &Arc<PluginDescriptor>, kind: EventKind) {
        self.deps
            .queue
            .publish(StreamEvent::now(&plugin.name, kind))
            .await;
    }

    async fn publish_completion(
        &self,
        plugin: &Arc<PluginDescriptor>,
        success: bool,
        error: Option<String>,
    ) {
        let rollup = self
            .deps
            .metrics
            .snapshot(&plugin.name)
            .map(|m| m.rollup())
            .unwrap_or_default();
        self.publish(
            plugin,
            EventKind::Completion {
                success,
                packages_updated: rollup.packages,
                duration: rollup.duration,
                error,
            },
        )
        .await;
    }

    fn open_plugin_log(&self, plugin: &str) -> Option<std::fs::File> {
        let dir = self.config.plugin_log_dir.as_ref()?;
        if let Err(err) = std::fs::create_dir_all(dir) {
            tracing::warn!(%err, "cannot create plugin log directory");
            return None;
        }
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{plugin}.log")))
        {
            Ok(file) => Some(file),
            Err(err) => {
                tracing::warn!(%err, plugin, "cannot open plugin log file");
                None
            }
        }
    }
}
