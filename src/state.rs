//! Persistent run state for resume support.
//!
//! A single JSON document is rewritten atomically (write-to-temp + rename)
//! after every per-plugin phase transition, so an interrupted run can be
//! resumed: plugins whose phases are already recorded as completed are not
//! re-run.

use crate::plugin::Phase;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Lifecycle status of one plugin within the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl PluginStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Per-plugin lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRunRecord {
    /// The furthest phase the plugin has entered.
    pub phase: Phase,
    pub status: PluginStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Phases this plugin has finished successfully.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_phases: Vec<Phase>,
}

impl PluginRunRecord {
    fn new() -> Self {
        Self {
            phase: Phase::Check,
            status: PluginStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            completed_phases: Vec::new(),
        }
    }
}

/// The whole-run document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    /// Current global phase.
    pub phase: Phase,
    pub plugins: BTreeMap<String, PluginRunRecord>,
}

impl RunState {
    pub fn new(plugin_names: impl IntoIterator<Item = String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            phase: Phase::Check,
            plugins: plugin_names
                .into_iter()
                .map(|name| (name, PluginRunRecord::new()))
                .collect(),
        }
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub fn mark_running(&mut self, plugin: &str, phase: Phase) {
        if let Some(record) = self.plugins.get_mut(plugin) {
            record.phase = phase;
            record.status = PluginStatus::Running;
            if record.started_at.is_none() {
                record.started_at = Some(Utc::now());
            }
        }
    }

    /// Record a finished phase. `final_phase` closes the plugin record.
    pub fn mark_phase_done(&mut self, plugin: &str, phase: Phase, success: bool, final_phase: bool, error: Option<String>) {
        if let Some(record) = self.plugins.get_mut(plugin) {
            record.phase = phase;
            if success {
                if !record.completed_phases.contains(&phase) {
                    record.completed_phases.push(phase);
                }
                if final_phase {
                    record.status = PluginStatus::Completed;
                    record.completed_at = Some(Utc::now());
                } else {
                    record.status = PluginStatus::Pending;
                }
            } else {
                record.status = PluginStatus::Failed;
                record.completed_at = Some(Utc::now());
                record.error = error;
            }
        }
    }

    pub fn mark_skipped(&mut self, plugin: &str) {
        if let Some(record) = self.plugins.get_mut(plugin) {
            record.status = PluginStatus::Skipped;
            record.completed_at = Some(Utc::now());
        }
    }

    pub fn phase_completed(&self, plugin: &str, phase: Phase) -> bool {
        self.plugins
            .get(plugin)
            .map(|r| r.completed_phases.contains(&phase))
            .unwrap_or(false)
    }

    pub fn status(&self, plugin: &str) -> PluginStatus {
        self.plugins
            .get(plugin)
            .map(|r| r.status)
            .unwrap_or_default()
    }

    /// Whether the recorded plugin set matches; resume refuses otherwise.
    pub fn matches_plugins<'a>(&self, names: impl Iterator<Item = &'a str>) -> bool {
        let expected: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        let mut actual: Vec<&str> = names.collect();
        actual.sort_unstable();
        expected == actual
    }
}

/// Reads and atomically rewrites the run-state document.
pub struct StateManager {
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: PathBuf) -> Self {
        Self { state_file }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.state_file
    }

    /// Serialize and atomically replace the document.
    pub fn save(&self, state: &RunState) -> Result<()> {
        if let Some(parent) = self.state_file.parent() {
            std::fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        let json = serde_json::to_string_pretty(state).context("Failed to serialize run state")?;
        let tmp = self.state_file.with_extension("json.tmp");
        std::fs::write(&tmp, json).context("Failed to write temporary state file")?;
        std::fs::rename(&tmp, &self.state_file).context("Failed to replace state file")?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<RunState>> {
        if !self.state_file.exists() {
            return Ok(None);
        }
        let content =
            std::fs::read_to_string(&self.state_file).context("Failed to read state file")?;
        let state = serde_json::from_str(&content).context("Failed to parse state file")?;
        Ok(Some(state))
    }

    pub fn reset(&self) -> Result<()> {
        if self.state_file.exists() {
            std::fs::remove_file(&self.state_file).context("Failed to remove state file")?;
        }
        Ok(())
    }
}
