//! Runtime configuration.
//!
//! Bridges the `sysup.toml` configuration file with the command line.
//! Precedence: CLI flag > config file > built-in default. Plugin
//! definitions live in the file; resource caps, timeouts, key bindings and
//! paths may come from either side.

use crate::controller::ControllerConfig;
use crate::errors::ScheduleError;
use crate::executor::ExecutorConfig;
use crate::mutex::MutexId;
use crate::plugin::{Capabilities, Phase, PluginDescriptor, PluginRegistry, UpdateCommand};
use crate::resources::ResourceLimits;
use crate::term::DEFAULT_SCROLLBACK;
use crate::ui::KeyBindings;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// `[settings]` table of sysup.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub concurrency: Option<usize>,
    pub downloads: Option<usize>,
    pub memory_mb: Option<u64>,
    pub phase_timeout_secs: Option<u64>,
    pub grace_period_secs: Option<u64>,
    pub estimated_memory_mb: Option<u64>,
    pub max_scrollback: Option<usize>,
    pub pause_between_phases: Option<bool>,
    pub continue_on_error: Option<bool>,
    pub log_dir: Option<PathBuf>,
}

/// One command entry under a plugin's phase list.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    #[serde(default)]
    pub elevate: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub error_patterns: Vec<String>,
    #[serde(default)]
    pub success_patterns: Vec<String>,
    #[serde(default)]
    pub ignore_exit_codes: Vec<i32>,
}

impl CommandSpec {
    fn into_command(self) -> UpdateCommand {
        let mut cmd = UpdateCommand::new(self.argv);
        cmd.elevate = self.elevate;
        cmd.timeout_secs = self.timeout_secs;
        cmd.error_patterns = self.error_patterns;
        cmd.success_patterns = self.success_patterns;
        cmd.ignore_exit_codes = self.ignore_exit_codes;
        cmd
    }
}

/// One `[[plugin]]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginSpec {
    pub name: String,
    /// External executable plugin; mutually exclusive with command lists.
    #[serde(default)]
    pub program: Option<PathBuf>,
    #[serde(default)]
    pub check: Vec<CommandSpec>,
    #[serde(default)]
    pub download: Vec<CommandSpec>,
    #[serde(default)]
    pub execute: Vec<CommandSpec>,
    /// Static mutexes applied to every phase.
    #[serde(default)]
    pub mutexes: Vec<String>,
    /// Per-phase additions.
    #[serde(default)]
    pub check_mutexes: Vec<String>,
    #[serde(default)]
    pub download_mutexes: Vec<String>,
    #[serde(default)]
    pub execute_mutexes: Vec<String>,
    #[serde(default)]
    pub runs_after: Vec<String>,
    #[serde(default)]
    pub separate_download: bool,
    #[serde(default)]
    pub requires_elevation: bool,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub package_count_pattern: Option<String>,
}

impl PluginSpec {
    fn into_descriptor(self) -> Result<PluginDescriptor> {
        let parse_set = |specs: &[String]| -> Result<Vec<MutexId>> {
            specs
                .iter()
                .map(|s| {
                    MutexId::new(s)
                        .with_context(|| format!("plugin '{}' declares invalid mutex '{s}'", self.name))
                })
                .collect()
        };

        let shared = parse_set(&self.mutexes)?;
        let mut per_phase: BTreeMap<Phase, Vec<MutexId>> = BTreeMap::new();
        for (phase, extra) in [
            (Phase::Check, &self.check_mutexes),
            (Phase::Download, &self.download_mutexes),
            (Phase::Execute, &self.execute_mutexes),
        ] {
            let mut set = shared.clone();
            for id in parse_set(extra)? {
                if !set.contains(&id) {
                    set.push(id);
                }
            }
            if !set.is_empty() {
                per_phase.insert(phase, set);
            }
        }

        let capabilities = Capabilities {
            separate_download: self.separate_download,
            requires_elevation: self.requires_elevation,
            interactive: self.interactive,
        };

        let mut descriptor = match self.program {
            Some(program) => {
                if !(self.check.is_empty() && self.download.is_empty() && self.execute.is_empty()) {
                    anyhow::bail!(
                        "plugin '{}' declares both a program and command lists",
                        self.name
                    );
                }
                PluginDescriptor::external(&self.name, program)
            }
            None => {
                let mut commands = BTreeMap::new();
                for (phase, specs) in [
                    (Phase::Check, self.check),
                    (Phase::Download, self.download),
                    (Phase::Execute, self.execute),
                ] {
                    if !specs.is_empty() {
                        commands.insert(
                            phase,
                            specs.into_iter().map(CommandSpec::into_command).collect(),
                        );
                    }
                }
                if commands.is_empty() {
                    anyhow::bail!("plugin '{}' declares no commands and no program", self.name);
                }
                PluginDescriptor::declared(&self.name, commands)
            }
        };
        descriptor.static_mutexes = per_phase;
        descriptor.runs_after = self.runs_after;
        descriptor.capabilities = capabilities;
        descriptor.package_count_pattern = self.package_count_pattern;
        Ok(descriptor)
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub settings: Settings,
    /// Key-binding overrides: action name -> combo list.
    #[serde(default)]
    pub keys: BTreeMap<String, Vec<String>>,
    #[serde(default, rename = "plugin")]
    pub plugins: Vec<PluginSpec>,
}

impl ConfigFile {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

/// CLI-side options that override the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub concurrency: Option<usize>,
    pub pause_between_phases: bool,
    pub dry_run: bool,
    pub continue_on_error: bool,
    pub plugins: Option<Vec<String>>,
    pub log_dir: Option<PathBuf>,
    pub verbose: bool,
}

/// Fully-resolved runtime configuration.
#[derive(Debug)]
pub struct Config {
    pub log_dir: PathBuf,
    pub plugin_log_dir: PathBuf,
    pub state_file: PathBuf,
    pub limits: ResourceLimits,
    pub executor: ExecutorConfig,
    pub controller: ControllerConfig,
    pub bindings: KeyBindings,
    pub max_scrollback: usize,
    pub verbose: bool,
}

impl Config {
    /// Merge the config file and CLI into the runtime configuration plus
    /// the populated plugin registry.
    pub fn resolve(file: ConfigFile, cli: &CliOverrides) -> Result<(Self, PluginRegistry)> {
        let settings = &file.settings;

        let log_dir = cli
            .log_dir
            .clone()
            .or_else(|| settings.log_dir.clone())
            .unwrap_or_else(default_log_dir);
        let state_file = default_state_dir().join("run-state.json");

        let mut limits = ResourceLimits::default();
        if let Some(n) = cli.concurrency.or(settings.concurrency) {
            limits = limits.with_tasks(n);
        }
        if let Some(n) = settings.downloads {
            limits = limits.with_downloads(n);
        }
        if let Some(n) = settings.memory_mb {
            limits = limits.with_memory_mb(n);
        }

        let mut executor = ExecutorConfig {
            dry_run: cli.dry_run,
            plugin_log_dir: Some(log_dir.join("plugins")),
            ..Default::default()
        };
        if let Some(secs) = settings.phase_timeout_secs {
            executor.phase_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = settings.grace_period_secs {
            executor.grace_period = Duration::from_secs(secs);
        }
        if let Some(mb) = settings.estimated_memory_mb {
            executor.estimated_memory_mb = mb;
        }

        let controller = ControllerConfig {
            pause_between_phases: cli.pause_between_phases
                || settings.pause_between_phases.unwrap_or(false),
            continue_on_error: cli.continue_on_error
                || settings.continue_on_error.unwrap_or(false),
        };

        let bindings = KeyBindings::default().with_overrides(&file.keys);
        let max_scrollback = settings.max_scrollback.unwrap_or(DEFAULT_SCROLLBACK);

        let mut registry = PluginRegistry::new();
        if file.plugins.is_empty() {
            anyhow::bail!("no plugins configured; add [[plugin]] tables to sysup.toml");
        }
        for spec in file.plugins {
            let descriptor = spec.into_descriptor()?;
            registry
                .register(descriptor)
                .map_err(|e| anyhow::anyhow!(e))?;
        }
        if let Some(subset) = &cli.plugins {
            registry.restrict(subset).map_err(|e: ScheduleError| anyhow::anyhow!(e))?;
        }

        Ok((
            Self {
                plugin_log_dir: log_dir.join("plugins"),
                log_dir,
                state_file,
                limits,
                executor,
                controller,
                bindings,
                max_scrollback,
                verbose: cli.verbose,
            },
            registry,
        ))
    }

    /// Locate the configuration file: explicit path, then
    /// `~/.config/sysup/sysup.toml`, then `./sysup.toml`.
    pub fn find_config_file(explicit: Option<&std::path::Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Some(config_dir) = dirs::config_dir() {
            let candidate = config_dir.join("sysup/sysup.toml");
            if candidate.exists() {
                return Some(candidate);
            }
        }
        let local = PathBuf::from("sysup.toml");
        local.exists().then_some(local)
    }
}

fn default_log_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("sysup/logs")
}

fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("sysup")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[settings]
concurrency = 4
downloads = 1
memory_mb = 2048
phase_timeout_secs = 600
pause_between_phases = true
max_scrollback = 500

[keys]
quit = ["ctrl+x"]

[[plugin]]
name = "apt"
mutexes = ["pkgmgr:apt"]
execute_mutexes = ["system:dpkg"]
requires_elevation = true
package_count_pattern = '(\d+) upgraded'

[[plugin.check]]
argv = ["apt-get", "update"]
elevate = true

[[plugin.execute]]
argv = ["apt-get", "-y", "upgrade"]
elevate = true
error_patterns = ["E: "]

[[plugin]]
name = "flatpak"
runs_after = ["apt"]
separate_download = true

[[plugin.download]]
argv = ["flatpak", "update", "--no-deploy", "-y"]

[[plugin.execute]]
argv = ["flatpak", "update", "-y"]

[[plugin]]
name = "firmware"
program = "/usr/lib/sysup/firmware-plugin"
"#;

    fn parse_sample() -> ConfigFile {
        toml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_parse_sample_config() {
        let file = parse_sample();
        assert_eq!(file.settings.concurrency, Some(4));
        assert_eq!(file.plugins.len(), 3);
        assert_eq!(file.keys["quit"], vec!["ctrl+x"]);
    }

    #[test]
    fn test_resolve_builds_registry_in_order() {
        let (config, registry) = Config::resolve(parse_sample(), &CliOverrides::default()).unwrap();
        assert_eq!(config.limits.tasks, 4);
        assert_eq!(config.limits.downloads, 1);
        assert!(config.controller.pause_between_phases);
        assert_eq!(config.max_scrollback, 500);
        assert_eq!(config.executor.phase_timeout, Duration::from_secs(600));

        let names: Vec<&str> = registry.plugins().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["apt", "flatpak", "firmware"]);

        let apt = registry.get("apt").unwrap();
        assert!(apt.capabilities.requires_elevation);
        // Execute phase carries the shared mutex plus the phase addition.
        let mutexes: Vec<&str> = apt
            .static_mutexes_for(Phase::Execute)
            .iter()
            .map(|m| m.as_str())
            .collect();
        assert_eq!(mutexes, vec!["pkgmgr:apt", "system:dpkg"]);
    }

    #[test]
    fn test_cli_overrides_win() {
        let cli = CliOverrides {
            concurrency: Some(2),
            dry_run: true,
            continue_on_error: true,
            ..Default::default()
        };
        let (config, _) = Config::resolve(parse_sample(), &cli).unwrap();
        assert_eq!(config.limits.tasks, 2);
        assert!(config.executor.dry_run);
        assert!(config.controller.continue_on_error);
    }

    #[test]
    fn test_subset_restriction() {
        let cli = CliOverrides {
            plugins: Some(vec!["flatpak".to_string()]),
            ..Default::default()
        };
        let (_, registry) = Config::resolve(parse_sample(), &cli).unwrap();
        assert_eq!(registry.len(), 1);

        let cli = CliOverrides {
            plugins: Some(vec!["nope".to_string()]),
            ..Default::default()
        };
        assert!(Config::resolve(parse_sample(), &cli).is_err());
    }

    #[test]
    fn test_invalid_mutex_name_is_config_error() {
        let bad = r#"
[[plugin]]
name = "apt"
mutexes = ["NOT VALID"]

[[plugin.execute]]
argv = ["true"]
"#;
        let file: ConfigFile = toml::from_str(bad).unwrap();
        let err = Config::resolve(file, &CliOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("invalid mutex") || format!("{err:#}").contains("NOT VALID"));
    }

    #[test]
    fn test_plugin_without_commands_rejected() {
        let bad = r#"
[[plugin]]
name = "empty"
"#;
        let file: ConfigFile = toml::from_str(bad).unwrap();
        assert!(Config::resolve(file, &CliOverrides::default()).is_err());
    }

    #[test]
    fn test_program_and_commands_are_exclusive() {
        let bad = r#"
[[plugin]]
name = "both"
program = "/bin/true"

[[plugin.execute]]
argv = ["true"]
"#;
        let file: ConfigFile = toml::from_str(bad).unwrap();
        assert!(Config::resolve(file, &CliOverrides::default()).is_err());
    }

    #[test]
    fn test_no_plugins_is_an_error() {
        let err = Config::resolve(ConfigFile::default(), &CliOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("no plugins configured"));
    }

    #[test]
    fn test_key_override_applies() {
        let (config, _) = Config::resolve(parse_sample(), &CliOverrides::default()).unwrap();
        use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
        let quit = KeyEvent::new(KeyCode::Char('x'), KeyModifiers::CONTROL);
        assert_eq!(config.bindings.lookup(&quit), Some(crate::ui::UiAction::Quit));
    }
}
