//! Plugin registry: declaration-ordered descriptor storage.
//!
//! The registry owns every descriptor for the lifetime of the process and
//! preserves configuration declaration order, which the scheduler uses as
//! its deterministic tie-break. Registration ends with a capability probe
//! of every external plugin; after that descriptors are immutable. The
//! registry also tracks the dynamic mutex and ordering sets discovered
//! after CHECK.

use super::{external, Phase, PluginDescriptor, PluginKind};
use crate::errors::ScheduleError;
use crate::mutex::MutexId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug)]
pub struct PluginRegistry {
    plugins: Vec<Arc<PluginDescriptor>>,
    by_name: HashMap<String, usize>,
    /// Dynamic mutex sets keyed by (plugin, phase), discovered after CHECK.
    dynamic_mutexes: RwLock<HashMap<(String, Phase), Vec<MutexId>>>,
    /// Dynamic ordering constraints keyed by (plugin, phase), discovered
    /// after CHECK via the `<phase>-dependency` verb.
    dynamic_runs_after: RwLock<HashMap<(String, Phase), Vec<String>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
            by_name: HashMap::new(),
            dynamic_mutexes: RwLock::new(HashMap::new()),
            dynamic_runs_after: RwLock::new(HashMap::new()),
        }
    }

    /// Complete registration: ask every external plugin for its
    /// capabilities (`can-separate-download`, `does-require-sudo`) and its
    /// `sudo-programs-paths`. Probe answers extend what the configuration
    /// declares; a config flag can force a capability on, never off.
    pub async fn probe_external(&mut self) {
        for index in 0..self.plugins.len() {
            let PluginKind::External { program } = &self.plugins[index].kind else {
                continue;
            };
            let program = program.clone();
            let probed = external::probe_capabilities(&program).await;
            let sudo_programs = external::query_sudo_programs(&program).await;

            let mut descriptor = (*self.plugins[index]).clone();
            descriptor.capabilities.separate_download |= probed.separate_download;
            descriptor.capabilities.requires_elevation |= probed.requires_sudo;
            descriptor.sudo_programs = sudo_programs;
            tracing::debug!(
                plugin = %descriptor.name,
                separate_download = descriptor.capabilities.separate_download,
                requires_elevation = descriptor.capabilities.requires_elevation,
                sudo_programs = ?descriptor.sudo_programs,
                "external plugin probed"
            );
            self.plugins[index] = Arc::new(descriptor);
        }
    }

    /// Register a descriptor, preserving declaration order.
    pub fn register(&mut self, descriptor: PluginDescriptor) -> Result<(), ScheduleError> {
        if self.by_name.contains_key(&descriptor.name) {
            return Err(ScheduleError::DuplicatePlugin(descriptor.name));
        }
        self.by_name
            .insert(descriptor.name.clone(), self.plugins.len());
        self.plugins.push(Arc::new(descriptor));
        Ok(())
    }

    /// Restrict the registry to a named subset, keeping declaration order.
    /// Unknown names fail so a typo does not silently run everything else.
    pub fn restrict(&mut self, names: &[String]) -> Result<(), ScheduleError> {
        for name in names {
            if !self.by_name.contains_key(name) {
                return Err(ScheduleError::UnknownPlugin(name.clone()));
            }
        }
        self.plugins.retain(|p| names.contains(&p.name));
        self.by_name = self
            .plugins
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<PluginDescriptor>> {
        self.by_name.get(name).map(|&i| self.plugins[i].clone())
    }

    /// All plugins in declaration order.
    pub fn plugins(&self) -> &[Arc<PluginDescriptor>] {
        &self.plugins
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Declaration index of a plugin, used as the scheduler tie-break.
    pub fn declaration_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Record the dynamic mutex set discovered for a plugin and phase.
    pub fn set_dynamic_mutexes(&self, plugin: &str, phase: Phase, mutexes: Vec<MutexId>) {
        let mut map = self
            .dynamic_mutexes
            .write()
            .expect("dynamic mutex map poisoned");
        map.insert((plugin.to_string(), phase), mutexes);
    }

    /// Record the dynamic ordering constraints discovered for a plugin and
    /// phase.
    pub fn set_dynamic_runs_after(&self, plugin: &str, phase: Phase, deps: Vec<String>) {
        let mut map = self
            .dynamic_runs_after
            .write()
            .expect("dynamic dependency map poisoned");
        map.insert((plugin.to_string(), phase), deps);
    }

    /// Dynamic ordering constraints for one phase, keyed by plugin. The
    /// graph builder merges these with each descriptor's static
    /// `runs_after` list.
    pub fn dynamic_runs_after_for(&self, phase: Phase) -> HashMap<String, Vec<String>> {
        let map = self
            .dynamic_runs_after
            .read()
            .expect("dynamic dependency map poisoned");
        map.iter()
            .filter(|((_, p), _)| *p == phase)
            .map(|((name, _), deps)| (name.clone(), deps.clone()))
            .collect()
    }

    /// Effective mutex set for a phase: static ∪ dynamic, deduplicated.
    pub fn effective_mutexes(&self, plugin: &str, phase: Phase) -> Vec<MutexId> {
        let Some(descriptor) = self.get(plugin) else {
            return Vec::new();
        };
        let mut set: Vec<MutexId> = descriptor.static_mutexes_for(phase).to_vec();
        let map = self
            .dynamic_mutexes
            .read()
            .expect("dynamic mutex map poisoned");
        if let Some(dynamic) = map.get(&(plugin.to_string(), phase)) {
            for m in dynamic {
                if !set.contains(m) {
                    set.push(m.clone());
                }
            }
        }
        set
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::UpdateCommand;
    use std::collections::BTreeMap;

    fn plugin(name: &str) -> PluginDescriptor {
        let mut commands = BTreeMap::new();
        commands.insert(
            Phase::Execute,
            vec![UpdateCommand::new(vec!["true".to_string()])],
        );
        PluginDescriptor::declared(name, commands)
    }

    #[test]
    fn test_registration_preserves_declaration_order() {
        let mut registry = PluginRegistry::new();
        registry.register(plugin("apt")).unwrap();
        registry.register(plugin("flatpak")).unwrap();
        registry.register(plugin("snap")).unwrap();

        let names: Vec<&str> = registry.plugins().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["apt", "flatpak", "snap"]);
        assert_eq!(registry.declaration_index("flatpak"), Some(1));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = PluginRegistry::new();
        registry.register(plugin("apt")).unwrap();
        let err = registry.register(plugin("apt")).unwrap_err();
        assert!(matches!(err, ScheduleError::DuplicatePlugin(name) if name == "apt"));
    }

    #[test]
    fn test_restrict_keeps_order_and_rejects_unknown() {
        let mut registry = PluginRegistry::new();
        registry.register(plugin("apt")).unwrap();
        registry.register(plugin("flatpak")).unwrap();
        registry.register(plugin("snap")).unwrap();

        registry
            .restrict(&["snap".to_string(), "apt".to_string()])
            .unwrap();
        let names: Vec<&str> = registry.plugins().iter().map(|p| p.name.as_str()).collect();
        // Declaration order wins, not the order given on the command line.
        assert_eq!(names, vec!["apt", "snap"]);

        assert!(registry.restrict(&["nope".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_probe_external_fills_capabilities() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firmware-plugin");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"#!/bin/sh
case "$1" in
  does-require-sudo) exit 0 ;;
  can-separate-download) exit 0 ;;
  sudo-programs-paths) echo /usr/bin/fwupdmgr; exit 0 ;;
  *) exit 1 ;;
esac"#
        )
        .unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();

        let mut registry = PluginRegistry::new();
        registry
            .register(PluginDescriptor::external("firmware", path))
            .unwrap();
        // Declared plugins are left alone by the probe.
        registry.register(plugin("apt")).unwrap();
        registry.probe_external().await;

        let firmware = registry.get("firmware").unwrap();
        assert!(firmware.capabilities.requires_elevation);
        assert!(firmware.capabilities.separate_download);
        assert_eq!(
            firmware.sudo_programs,
            vec![std::path::PathBuf::from("/usr/bin/fwupdmgr")]
        );

        let apt = registry.get("apt").unwrap();
        assert!(!apt.capabilities.requires_elevation);
        assert!(apt.sudo_programs.is_empty());
    }

    #[test]
    fn test_dynamic_runs_after_overlay() {
        let mut registry = PluginRegistry::new();
        registry.register(plugin("apt")).unwrap();
        registry.register(plugin("flatpak")).unwrap();

        registry.set_dynamic_runs_after("flatpak", Phase::Execute, vec!["apt".to_string()]);

        let execute = registry.dynamic_runs_after_for(Phase::Execute);
        assert_eq!(execute.get("flatpak"), Some(&vec!["apt".to_string()]));
        assert!(registry.dynamic_runs_after_for(Phase::Download).is_empty());
    }

    #[test]
    fn test_effective_mutexes_union() {
        let mut registry = PluginRegistry::new();
        let descriptor = plugin("apt").with_mutexes(
            Phase::Execute,
            vec![MutexId::new("pkgmgr:apt").unwrap()],
        );
        registry.register(descriptor).unwrap();

        registry.set_dynamic_mutexes(
            "apt",
            Phase::Execute,
            vec![
                MutexId::new("pkgmgr:apt").unwrap(),
                MutexId::new("system:dpkg").unwrap(),
            ],
        );

        let effective = registry.effective_mutexes("apt", Phase::Execute);
        let names: Vec<&str> = effective.iter().map(|m| m.as_str()).collect();
        assert_eq!(names, vec!["pkgmgr:apt", "system:dpkg"]);
    }
}
