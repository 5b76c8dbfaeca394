//! Plugin model: phases, update commands, and plugin descriptors.
//!
//! A plugin is either *declared* (its commands come straight from the
//! configuration file) or *external* (a standalone executable speaking the
//! verb protocol: `<plugin> is-applicable`, `<plugin> estimate-update`,
//! `<plugin> download`, `<plugin> update`, plus capability and mutex
//! discovery verbs). Both are driven through the same descriptor interface;
//! capability probes default to "not supported" so a simple plugin only
//! needs a name and a command list.

mod external;
mod registry;

pub use external::{probe_exit_ok, ProbedCapabilities};
pub use registry::PluginRegistry;

use crate::mutex::MutexId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// The three stages every applicable plugin passes through, in order.
/// DOWNLOAD is skipped for plugins without separate-download support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Check,
    Download,
    Execute,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Check, Phase::Download, Phase::Execute];

    /// Wire name used by the external verb protocol and the run-state file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Check => "check",
            Phase::Download => "download",
            Phase::Execute => "execute",
        }
    }

    /// Label shown in the UI. The rename is display-only.
    pub fn display_label(&self) -> &'static str {
        match self {
            Phase::Check => "Update",
            Phase::Download => "Download",
            Phase::Execute => "Upgrade",
        }
    }

    pub fn parse(s: &str) -> Option<Phase> {
        match s {
            "check" => Some(Phase::Check),
            "download" => Some(Phase::Download),
            "execute" => Some(Phase::Execute),
            _ => None,
        }
    }

    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Check => Some(Phase::Download),
            Phase::Download => Some(Phase::Execute),
            Phase::Execute => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step within a phase: an argument vector plus the classification
/// overrides applied to its output and exit status. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCommand {
    /// Program and arguments.
    pub argv: Vec<String>,
    /// Run under elevation (sudo).
    #[serde(default)]
    pub elevate: bool,
    /// Per-command timeout in seconds; falls back to the phase timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Output patterns that force the step to fail regardless of exit code.
    #[serde(default)]
    pub error_patterns: Vec<String>,
    /// Output patterns that force the step to succeed.
    #[serde(default)]
    pub success_patterns: Vec<String>,
    /// Exit codes treated as success in addition to zero.
    #[serde(default)]
    pub ignore_exit_codes: Vec<i32>,
    /// Step counter: this is step `step` of `of`.
    #[serde(default = "default_step")]
    pub step: u32,
    #[serde(default = "default_step")]
    pub of: u32,
}

fn default_step() -> u32 {
    1
}

impl UpdateCommand {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            elevate: false,
            timeout_secs: None,
            error_patterns: Vec::new(),
            success_patterns: Vec::new(),
            ignore_exit_codes: Vec::new(),
            step: 1,
            of: 1,
        }
    }

    pub fn with_elevation(mut self, elevate: bool) -> Self {
        self.elevate = elevate;
        self
    }

    pub fn with_step(mut self, step: u32, of: u32) -> Self {
        self.step = step;
        self.of = of;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Capability flags declared at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// The plugin can fetch artifacts in a DOWNLOAD phase separate from
    /// EXECUTE.
    #[serde(default)]
    pub separate_download: bool,
    /// The plugin's commands need elevation.
    #[serde(default)]
    pub requires_elevation: bool,
    /// The plugin may prompt on its terminal and expects keystrokes.
    #[serde(default)]
    pub interactive: bool,
}

/// Where a plugin's behavior comes from.
#[derive(Debug, Clone)]
pub enum PluginKind {
    /// Commands are declared in the configuration file.
    Declared {
        commands: BTreeMap<Phase, Vec<UpdateCommand>>,
    },
    /// A standalone executable speaking the verb protocol.
    External { program: PathBuf },
}

/// Immutable identity and declared behavior of one plugin. Created at
/// startup by the registry; lives for the whole run.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub name: String,
    /// Static mutex sets per phase. The effective set for a phase is this
    /// union the dynamic set discovered after CHECK.
    pub static_mutexes: BTreeMap<Phase, Vec<MutexId>>,
    /// Plugins that must reach a terminal state before this one starts.
    pub runs_after: Vec<String>,
    pub capabilities: Capabilities,
    /// Binaries the plugin runs under elevation, answered by the
    /// `sudo-programs-paths` verb at registration. Empty for declared
    /// plugins.
    pub sudo_programs: Vec<PathBuf>,
    /// Regex counting rule for "packages updated" over collected output.
    pub package_count_pattern: Option<String>,
    pub kind: PluginKind,
}

impl PluginDescriptor {
    /// Build a declared plugin from per-phase command lists.
    pub fn declared(name: &str, commands: BTreeMap<Phase, Vec<UpdateCommand>>) -> Self {
        Self {
            name: name.to_string(),
            static_mutexes: BTreeMap::new(),
            runs_after: Vec::new(),
            capabilities: Capabilities::default(),
            sudo_programs: Vec::new(),
            package_count_pattern: None,
            kind: PluginKind::Declared { commands },
        }
    }

    /// Build an external plugin around an executable path. Capabilities
    /// start at "not supported"; the registry's registration probe fills
    /// them in from the plugin's own answers.
    pub fn external(name: &str, program: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            static_mutexes: BTreeMap::new(),
            runs_after: Vec::new(),
            capabilities: Capabilities::default(),
            sudo_programs: Vec::new(),
            package_count_pattern: None,
            kind: PluginKind::External { program },
        }
    }

    pub fn with_mutexes(mut self, phase: Phase, mutexes: Vec<MutexId>) -> Self {
        self.static_mutexes.insert(phase, mutexes);
        self
    }

    pub fn with_runs_after(mut self, runs_after: Vec<String>) -> Self {
        self.runs_after = runs_after;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn static_mutexes_for(&self, phase: Phase) -> &[MutexId] {
        self.static_mutexes
            .get(&phase)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether the plugin participates in a given phase at all.
    pub fn enters_phase(&self, phase: Phase) -> bool {
        if phase == Phase::Download && !self.capabilities.separate_download {
            return false;
        }
        match &self.kind {
            PluginKind::Declared { commands } => {
                commands.get(&phase).map(|c| !c.is_empty()).unwrap_or(false)
            }
            PluginKind::External { .. } => true,
        }
    }

    /// The plugin's last phase; Completion is published after it ends.
    pub fn final_phase(&self) -> Phase {
        for phase in Phase::ALL.iter().rev() {
            if self.enters_phase(*phase) {
                return *phase;
            }
        }
        Phase::Check
    }

    /// Command vector for one phase. Empty means the phase is a no-op.
    pub async fn commands_for(&self, phase: Phase, dry_run: bool) -> Vec<UpdateCommand> {
        if phase == Phase::Download && !self.capabilities.separate_download {
            return Vec::new();
        }
        let mut commands = match &self.kind {
            PluginKind::Declared { commands } => commands.get(&phase).cloned().unwrap_or_default(),
            PluginKind::External { program } => {
                external::commands_for(program, phase, &self.capabilities)
            }
        };
        if dry_run {
            for cmd in &mut commands {
                cmd.argv.push("--dry-run".to_string());
            }
        }
        let total = commands.len() as u32;
        for (i, cmd) in commands.iter_mut().enumerate() {
            cmd.step = i as u32 + 1;
            cmd.of = total.max(1);
        }
        commands
    }

    /// Probe whether the plugin applies on this host. Declared plugins are
    /// applicable iff their program exists on PATH.
    pub async fn is_applicable(&self) -> bool {
        match &self.kind {
            PluginKind::Declared { commands } => commands
                .values()
                .flatten()
                .next()
                .map(|c| which(c.program()))
                .unwrap_or(false),
            PluginKind::External { program } => {
                probe_exit_ok(program, &["is-applicable"]).await
            }
        }
    }

    /// Dynamic mutex discovery, invoked after CHECK completes. Declared
    /// plugins have no dynamic set.
    pub async fn dynamic_mutexes(&self, phase: Phase) -> Vec<MutexId> {
        match &self.kind {
            PluginKind::Declared { .. } => Vec::new(),
            PluginKind::External { program } => {
                external::query_mutexes(program, phase).await
            }
        }
    }

    /// Dynamic ordering discovery (`<phase>-dependency`), invoked after
    /// CHECK alongside the mutex query. Declared plugins only order
    /// through their static `runs_after` list.
    pub async fn dynamic_dependencies(&self, phase: Phase) -> Vec<String> {
        match &self.kind {
            PluginKind::Declared { .. } => Vec::new(),
            PluginKind::External { program } => {
                external::query_dependencies(program, phase).await
            }
        }
    }
}

/// Minimal PATH lookup for declared-plugin applicability.
fn which(program: &str) -> bool {
    if program.is_empty() {
        return false;
    }
    if program.contains('/') {
        return std::path::Path::new(program).exists();
    }
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(program).is_file())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declared_with(phase: Phase, argv: &[&str]) -> PluginDescriptor {
        let mut commands = BTreeMap::new();
        commands.insert(
            phase,
            vec![UpdateCommand::new(
                argv.iter().map(|s| s.to_string()).collect(),
            )],
        );
        PluginDescriptor::declared("test", commands)
    }

    #[test]
    fn test_phase_order_and_labels() {
        assert!(Phase::Check < Phase::Download);
        assert!(Phase::Download < Phase::Execute);
        assert_eq!(Phase::Check.display_label(), "Update");
        assert_eq!(Phase::Download.display_label(), "Download");
        assert_eq!(Phase::Execute.display_label(), "Upgrade");
        assert_eq!(Phase::parse("download"), Some(Phase::Download));
        assert_eq!(Phase::parse("upgrade"), None);
    }

    #[test]
    fn test_phase_sequence() {
        assert_eq!(Phase::Check.next(), Some(Phase::Download));
        assert_eq!(Phase::Execute.next(), None);
    }

    #[tokio::test]
    async fn test_download_skipped_without_separate_download() {
        let mut commands = BTreeMap::new();
        commands.insert(
            Phase::Download,
            vec![UpdateCommand::new(vec!["fetch".into()])],
        );
        let plugin = PluginDescriptor::declared("apt", commands);
        // separate_download is false by default, so DOWNLOAD is a no-op even
        // with declared commands.
        assert!(!plugin.enters_phase(Phase::Download));
        assert!(plugin.commands_for(Phase::Download, false).await.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_appends_flag() {
        let plugin = declared_with(Phase::Execute, &["apt-get", "upgrade"]);
        let commands = plugin.commands_for(Phase::Execute, true).await;
        assert_eq!(commands[0].argv.last().map(String::as_str), Some("--dry-run"));
    }

    #[tokio::test]
    async fn test_step_counters_assigned() {
        let mut commands = BTreeMap::new();
        commands.insert(
            Phase::Execute,
            vec![
                UpdateCommand::new(vec!["a".into()]),
                UpdateCommand::new(vec!["b".into()]),
            ],
        );
        let plugin = PluginDescriptor::declared("multi", commands);
        let cmds = plugin.commands_for(Phase::Execute, false).await;
        assert_eq!((cmds[0].step, cmds[0].of), (1, 2));
        assert_eq!((cmds[1].step, cmds[1].of), (2, 2));
    }

    #[test]
    fn test_final_phase() {
        let plugin = declared_with(Phase::Check, &["true"]);
        assert_eq!(plugin.final_phase(), Phase::Check);

        let mut commands = BTreeMap::new();
        commands.insert(Phase::Check, vec![UpdateCommand::new(vec!["a".into()])]);
        commands.insert(Phase::Execute, vec![UpdateCommand::new(vec!["b".into()])]);
        let plugin = PluginDescriptor::declared("both", commands);
        assert_eq!(plugin.final_phase(), Phase::Execute);
    }

    #[test]
    fn test_which_finds_shell() {
        assert!(which("sh"));
        assert!(!which("definitely-not-a-real-binary-name"));
    }
}
