//! Per-plugin, per-phase metrics, independent of session lifetime.
//!
//! The store is process-wide and owned by the composition root, never by a
//! PTY session or an executor: the CHECK record keeps its numbers after the
//! CHECK PTY is gone, and the status bar never resets to zero between
//! phases. Executors and samplers write only their own plugin's records;
//! the UI reads deep-copied snapshots.

mod sampler;

pub use sampler::ProcSampler;

use crate::plugin::Phase;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// One periodic reading from the system probe bound to a child pid.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub rss_mb: u64,
    /// High-water mark of the resident set.
    pub hwm_mb: u64,
    pub cpu_user_secs: f64,
    pub cpu_sys_secs: f64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Terminal outcome of a phase, written by `end_phase`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub packages: u64,
}

/// Accumulated metrics for one (plugin, phase). Append-only after the
/// phase ends.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub peak_rss_mb: u64,
    /// Most recent resident set, for the live status bar.
    pub current_rss_mb: u64,
    pub cpu_user_secs: f64,
    pub cpu_sys_secs: f64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub items_done: Option<u64>,
    pub items_total: Option<u64>,
    pub packages: u64,
    pub exit_code: Option<i32>,
    pub success: Option<bool>,
    pub error: Option<String>,
    /// Totals carried over from earlier commands within the same phase;
    /// per-pid counters restart with every spawned command.
    cpu_user_base: f64,
    cpu_sys_base: f64,
    read_base: u64,
    write_base: u64,
}

impl PhaseRecord {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            started_at: Utc::now(),
            ended_at: None,
            duration: None,
            peak_rss_mb: 0,
            current_rss_mb: 0,
            cpu_user_secs: 0.0,
            cpu_sys_secs: 0.0,
            read_bytes: 0,
            write_bytes: 0,
            net_rx_bytes: 0,
            net_tx_bytes: 0,
            items_done: None,
            items_total: None,
            packages: 0,
            exit_code: None,
            success: None,
            error: None,
            cpu_user_base: 0.0,
            cpu_sys_base: 0.0,
            read_base: 0,
            write_base: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn cpu_total_secs(&self) -> f64 {
        self.cpu_user_secs + self.cpu_sys_secs
    }

    fn apply_sample(&mut self, sample: &ResourceSample) {
        self.current_rss_mb = sample.rss_mb;
        self.peak_rss_mb = self.peak_rss_mb.max(sample.hwm_mb).max(sample.rss_mb);
        // Cumulative counters must be monotone across snapshot calls; the
        // max() guards against a probe briefly reading a recycled pid.
        self.cpu_user_secs = self
            .cpu_user_secs
            .max(self.cpu_user_base + sample.cpu_user_secs);
        self.cpu_sys_secs = self
            .cpu_sys_secs
            .max(self.cpu_sys_base + sample.cpu_sys_secs);
        self.read_bytes = self.read_bytes.max(self.read_base + sample.read_bytes);
        self.write_bytes = self.write_bytes.max(self.write_base + sample.write_bytes);
    }

    fn roll_command(&mut self) {
        self.cpu_user_base = self.cpu_user_secs;
        self.cpu_sys_base = self.cpu_sys_secs;
        self.read_base = self.read_bytes;
        self.write_base = self.write_bytes;
        self.current_rss_mb = 0;
    }
}

/// All phase records for one plugin.
#[derive(Debug, Clone, Default)]
pub struct PluginMetrics {
    pub phases: Vec<PhaseRecord>,
}

impl PluginMetrics {
    pub fn record_for(&self, phase: Phase) -> Option<&PhaseRecord> {
        self.phases.iter().rev().find(|r| r.phase == phase)
    }

    fn record_mut(&mut self, phase: Phase) -> Option<&mut PhaseRecord> {
        self.phases.iter_mut().rev().find(|r| r.phase == phase)
    }

    /// Plugin-level rollup across phases.
    pub fn rollup(&self) -> MetricsRollup {
        let mut rollup = MetricsRollup::default();
        for record in &self.phases {
            rollup.peak_rss_mb = rollup.peak_rss_mb.max(record.peak_rss_mb);
            rollup.cpu_secs += record.cpu_total_secs();
            rollup.read_bytes += record.read_bytes;
            rollup.write_bytes += record.write_bytes;
            rollup.net_rx_bytes += record.net_rx_bytes;
            rollup.net_tx_bytes += record.net_tx_bytes;
            rollup.packages += record.packages;
            if let Some(d) = record.duration {
                rollup.duration += d;
            }
        }
        rollup
    }
}

/// Aggregate numbers, either per plugin or run-wide.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsRollup {
    pub peak_rss_mb: u64,
    pub cpu_secs: f64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub packages: u64,
    pub duration: Duration,
}

impl MetricsRollup {
    fn merge(&mut self, other: &MetricsRollup) {
        self.peak_rss_mb = self.peak_rss_mb.max(other.peak_rss_mb);
        self.cpu_secs += other.cpu_secs;
        self.read_bytes += other.read_bytes;
        self.write_bytes += other.write_bytes;
        self.net_rx_bytes += other.net_rx_bytes;
        self.net_tx_bytes += other.net_tx_bytes;
        self.packages += other.packages;
        self.duration += other.duration;
    }
}

/// Process-wide metrics store.
pub struct MetricsStore {
    inner: Mutex<HashMap<String, PluginMetrics>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Open a new record for (plugin, phase).
    pub fn begin_phase(&self, plugin: &str, phase: Phase) {
        let mut inner = self.inner.lock().expect("metrics store poisoned");
        inner
            .entry(plugin.to_string())
            .or_default()
            .phases
            .push(PhaseRecord::new(phase));
    }

    /// Fold the finished command's counters into the phase base so the next
    /// command's per-pid counters extend them instead of replacing them.
    pub fn begin_command(&self, plugin: &str, phase: Phase) {
        let mut inner = self.inner.lock().expect("metrics store poisoned");
        if let Some(record) = inner
            .get_mut(plugin)
            .and_then(|m| m.record_mut(phase))
            .filter(|r| r.is_open())
        {
            record.roll_command();
        }
    }

    /// Feed one probe reading into the open record.
    pub fn record_sample(&self, plugin: &str, phase: Phase, sample: &ResourceSample) {
        let mut inner = self.inner.lock().expect("metrics store poisoned");
        if let Some(record) = inner
            .get_mut(plugin)
            .and_then(|m| m.record_mut(phase))
            .filter(|r| r.is_open())
        {
            record.apply_sample(sample);
        }
    }

    /// Update network byte totals, derived from plugin progress frames.
    pub fn record_network(&self, plugin: &str, phase: Phase, rx_bytes: u64, tx_bytes: u64) {
        let mut inner = self.inner.lock().expect("metrics store poisoned");
        if let Some(record) = inner.get_mut(plugin).and_then(|m| m.record_mut(phase)) {
            record.net_rx_bytes = record.net_rx_bytes.max(rx_bytes);
            record.net_tx_bytes = record.net_tx_bytes.max(tx_bytes);
        }
    }

    /// Update item progress counters.
    pub fn record_items(&self, plugin: &str, phase: Phase, done: Option<u64>, total: Option<u64>) {
        let mut inner = self.inner.lock().expect("metrics store poisoned");
        if let Some(record) = inner.get_mut(plugin).and_then(|m| m.record_mut(phase)) {
            if done.is_some() {
                record.items_done = done;
            }
            if total.is_some() {
                record.items_total = total;
            }
        }
    }

    /// Close the record for (plugin, phase).
    pub fn end_phase(&self, plugin: &str, phase: Phase, outcome: PhaseOutcome) {
        let mut inner = self.inner.lock().expect("metrics store poisoned");
        if let Some(record) = inner
            .get_mut(plugin)
            .and_then(|m| m.record_mut(phase))
            .filter(|r| r.is_open())
        {
            let ended = Utc::now();
            record.duration = (ended - record.started_at).to_std().ok();
            record.ended_at = Some(ended);
            record.success = Some(outcome.success);
            record.exit_code = outcome.exit_code;
            record.error = outcome.error;
            record.packages = outcome.packages;
            record.current_rss_mb = 0;
        }
    }

    /// Deep copy of one plugin's records for UI rendering.
    pub fn snapshot(&self, plugin: &str) -> Option<PluginMetrics> {
        let inner = self.inner.lock().expect("metrics store poisoned");
        inner.get(plugin).cloned()
    }

    /// Deep copy of everything.
    pub fn snapshot_all(&self) -> HashMap<String, PluginMetrics> {
        self.inner.lock().expect("metrics store poisoned").clone()
    }

    /// Run-level rollup across all plugins.
    pub fn rollup(&self) -> MetricsRollup {
        let inner = self.inner.lock().expect("metrics store poisoned");
        let mut total = MetricsRollup::default();
        for metrics in inner.values() {
            total.merge(&metrics.rollup());
        }
        total
    }

    /// Sum of the current resident sets of all open records; feeds the
    /// resource controller's memory gate.
    pub fn total_current_rss_mb(&self) -> u64 {
        let inner = self.inner.lock().expect("metrics store poisoned");
        inner
            .values()
            .flat_map(|m| m.phases.iter())
            .filter(|r| r.is_open())
            .map(|r| r.current_rss_mb)
            .sum()
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}
