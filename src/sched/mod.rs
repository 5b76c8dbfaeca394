//! DAG scheduler: admits plugins for one global phase in parallel waves.
//!
//! The scheduler owns no process state, only admission decisions. Within a
//! wave it spawns executor tasks in declaration order, which also fixes
//! the FIFO order in which contending plugins reach the mutex manager, so
//! a rerun of the same configuration serializes identically.

mod builder;

pub use builder::{NodeIndex, PluginGraph};

use crate::executor::{PhaseRunResult, PluginExecutor, SessionSurface};
use crate::plugin::Phase;
use crate::state::{RunState, StateManager};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Node status while a phase is being driven.
#[derive(Debug, Clone, PartialEq)]
enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Result of driving one global phase.
#[derive(Debug, Default)]
pub struct PhaseRunSummary {
    pub results: HashMap<String, PhaseRunResult>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

impl PhaseRunSummary {
    pub fn all_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Drives all participants of one phase through the executor, respecting
/// dependency edges and the continue-on-error policy.
pub struct PhaseScheduler {
    executor: Arc<PluginExecutor>,
    continue_on_error: bool,
    /// Spawn ceiling, mirroring the task permit count. Keeping unspawned
    /// work out of executor queues lets a failure actually stop admissions.
    max_parallel: usize,
}

impl PhaseScheduler {
    pub fn new(executor: Arc<PluginExecutor>, continue_on_error: bool, max_parallel: usize) -> Self {
        Self {
            executor,
            continue_on_error,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Run `phase` for every participant.
    ///
    /// On a plugin failure without continue-on-error, no further plugins
    /// are admitted; already-running ones complete. Dependents of a failed
    /// or skipped plugin are skipped either way.
    pub async fn run_phase(
        &self,
        phase: Phase,
        graph: &PluginGraph,
        surfaces: &HashMap<String, SessionSurface>,
        run_state: &Arc<Mutex<RunState>>,
        state_manager: &StateManager,
        cancel: &CancellationToken,
    ) -> PhaseRunSummary {
        let mut summary = PhaseRunSummary::default();
        if graph.is_empty() {
            return summary;
        }

        let mut status: Vec<NodeStatus> = vec![NodeStatus::Pending; graph.len()];
        let mut done: HashSet<NodeIndex> = HashSet::new();
        let mut stop_admitting = false;
        let mut active = 0usize;
        let (result_tx, mut result_rx) = mpsc::channel::<(NodeIndex, PhaseRunResult)>(graph.len());

        loop {
            if cancel.is_cancelled() {
                stop_admitting = true;
            }

            if !stop_admitting {
                // Declaration order within the ready set is the tie-break.
                for index in 0..graph.len() {
                    if active >= self.max_parallel {
                        break;
                    }
                    if status[index] != NodeStatus::Pending
                        || !graph.dependencies_satisfied(index, &done)
                    {
                        continue;
                    }
                    let plugin = graph.plugins()[index].clone();
                    let Some(surface) = surfaces.get(&plugin.name).cloned() else {
                        tracing::warn!(plugin = %plugin.name, "no surface for plugin, skipping");
                        status[index] = NodeStatus::Skipped;
                        done.insert(index);
                        summary.skipped.push(plugin.name.clone());
                        continue;
                    };

                    status[index] = NodeStatus::Running;
                    active += 1;
                    self.persist(run_state, state_manager, |state| {
                        state.mark_running(&plugin.name, phase);
                    });

                    let executor = self.executor.clone();
                    let tx = result_tx.clone();
                    let task_cancel = cancel.clone();
                    tokio::spawn(async move {
                        let result = executor
                            .run_phase(&plugin, phase, &surface, &task_cancel)
                            .await;
                        tx.send((index, result)).await.ok();
                    });
                }
            }

            // Mark pending plugins whose dependencies can no longer succeed.
            for index in 0..graph.len() {
                if status[index] != NodeStatus::Pending {
                    continue;
                }
                let blocked_forever = graph.dependencies(index).iter().any(|d| {
                    matches!(status[*d], NodeStatus::Failed | NodeStatus::Skipped)
                });
                if blocked_forever || (stop_admitting && active == 0) {
                    let name = graph.plugins()[index].name.clone();
                    status[index] = NodeStatus::Skipped;
                    done.insert(index);
                    summary.skipped.push(name.clone());
                    self.persist(run_state, state_manager, |state| {
                        state.mark_skipped(&name);
                    });
                }
            }

            if active == 0 {
                if status.iter().all(NodeStatus::is_terminal) {
                    break;
                }
                // Nothing running and nothing newly admittable: the rest
                // were just skipped above, loop once more to finalize.
                if stop_admitting || status.iter().all(|s| *s != NodeStatus::Pending) {
                    continue;
                }
            }

            let Some((index, result)) = result_rx.recv().await else {
                break;
            };
            active -= 1;
            done.insert(index);
            let plugin = graph.plugins()[index].clone();
            let succeeded = result.success;
            status[index] = if succeeded {
                NodeStatus::Succeeded
            } else {
                NodeStatus::Failed
            };

            let final_phase = phase == plugin.final_phase();
            let error = result.error.clone();
            self.persist(run_state, state_manager, |state| {
                state.mark_phase_done(&plugin.name, phase, succeeded, final_phase, error.clone());
            });

            if !succeeded {
                summary.failed.push(plugin.name.clone());
                if !self.continue_on_error {
                    tracing::warn!(plugin = %plugin.name, "plugin failed, stopping new admissions");
                    stop_admitting = true;
                }
            }
            summary.results.insert(plugin.name.clone(), result);
        }

        summary
    }

    fn persist(
        &self,
        run_state: &Arc<Mutex<RunState>>,
        state_manager: &StateManager,
        update: impl FnOnce(&mut RunState),
    ) {
        let mut state = run_state.lock().expect("run state poisoned");
        update(&mut state);
        if let Err(err) = state_manager.save(&state) {
            tracing::warn!(%err, "failed to persist run state");
        }
    }
}
