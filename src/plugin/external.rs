//! Verb protocol for external executable plugins.
//!
//! An external plugin is invoked as `<program> <verb>`. Exit code 0 means
//! "yes"/success; anything else means "no"/error. Discovery verbs print
//! their answer on stdout, one item per line.

use super::{Capabilities, Phase, UpdateCommand};
use crate::mutex::MutexId;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// How long a capability probe may run before it is treated as "no".
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `<program> <verbs...>` and report whether it exited 0.
pub async fn probe_exit_ok(program: &Path, verbs: &[&str]) -> bool {
    let result = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new(program)
            .args(verbs)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status(),
    )
    .await;
    match result {
        Ok(Ok(status)) => status.success(),
        Ok(Err(err)) => {
            tracing::warn!(program = %program.display(), ?verbs, %err, "plugin probe failed");
            false
        }
        Err(_) => {
            tracing::warn!(program = %program.display(), ?verbs, "plugin probe timed out");
            false
        }
    }
}

/// Run `<program> <verb>` and collect stdout lines.
async fn probe_lines(program: &Path, verb: &str) -> Vec<String> {
    let result = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new(program)
            .arg(verb)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output(),
    )
    .await;
    match result {
        Ok(Ok(output)) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        Ok(Ok(_)) => Vec::new(),
        Ok(Err(err)) => {
            tracing::warn!(program = %program.display(), verb, %err, "plugin query failed");
            Vec::new()
        }
        Err(_) => {
            tracing::warn!(program = %program.display(), verb, "plugin query timed out");
            Vec::new()
        }
    }
}

/// Capability answers from the yes/no probe verbs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbedCapabilities {
    /// `can-separate-download` exited 0.
    pub separate_download: bool,
    /// `does-require-sudo` exited 0.
    pub requires_sudo: bool,
}

/// Ask the plugin for its capabilities. A missing or failing verb means
/// "not supported", so simple plugins need not implement any of them.
pub async fn probe_capabilities(program: &Path) -> ProbedCapabilities {
    ProbedCapabilities {
        separate_download: probe_exit_ok(program, &["can-separate-download"]).await,
        requires_sudo: probe_exit_ok(program, &["does-require-sudo"]).await,
    }
}

/// Query `<program> sudo-programs-paths`: the binaries the plugin will run
/// under elevation, one path per line. Used to decide whether credentials
/// must be pre-authenticated before the UI takes the terminal.
pub async fn query_sudo_programs(program: &Path) -> Vec<std::path::PathBuf> {
    probe_lines(program, "sudo-programs-paths")
        .await
        .into_iter()
        .map(std::path::PathBuf::from)
        .collect()
}

/// Query `<program> <phase>-mutexes` for the dynamic mutex set. Lines that
/// do not parse under the mutex grammar are logged and skipped.
pub async fn query_mutexes(program: &Path, phase: Phase) -> Vec<MutexId> {
    let verb = format!("{}-mutexes", phase.as_str());
    probe_lines(program, &verb)
        .await
        .into_iter()
        .filter_map(|line| match MutexId::new(&line) {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!(program = %program.display(), %line, "ignoring invalid mutex name");
                None
            }
        })
        .collect()
}

/// Query `<program> <phase>-dependency` for plugins this one must run
/// after, one name per line. Names not participating in the run are
/// ignored by the graph builder.
pub async fn query_dependencies(program: &Path, phase: Phase) -> Vec<String> {
    let verb = format!("{}-dependency", phase.as_str());
    probe_lines(program, &verb).await
}

/// The command vector an external plugin runs for a phase.
///
/// CHECK maps to `estimate-update`, DOWNLOAD to `download`, EXECUTE to
/// `update`. Elevation comes from the effective capabilities: the
/// `does-require-sudo` probe at registration, or a config declaration.
pub fn commands_for(program: &Path, phase: Phase, caps: &Capabilities) -> Vec<UpdateCommand> {
    let verb = match phase {
        Phase::Check => "estimate-update",
        Phase::Download => "download",
        Phase::Execute => "update",
    };
    let argv = vec![program.display().to_string(), verb.to_string()];
    let elevate = caps.requires_elevation && phase != Phase::Check;
    vec![UpdateCommand::new(argv).with_elevation(elevate)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n{body}").unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn test_probe_exit_ok_true_and_false() {
        let dir = tempfile::tempdir().unwrap();
        let yes = write_script(dir.path(), "yes-plugin", "exit 0");
        let no = write_script(dir.path(), "no-plugin", "exit 1");
        assert!(probe_exit_ok(&yes, &["is-applicable"]).await);
        assert!(!probe_exit_ok(&no, &["is-applicable"]).await);
    }

    #[tokio::test]
    async fn test_probe_missing_program_is_no() {
        assert!(!probe_exit_ok(Path::new("/nonexistent/plugin"), &["is-applicable"]).await);
    }

    #[tokio::test]
    async fn test_probe_capabilities_per_verb() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = write_script(
            dir.path(),
            "capable-plugin",
            r#"case "$1" in
  does-require-sudo) exit 0 ;;
  can-separate-download) exit 1 ;;
  *) exit 1 ;;
esac"#,
        );
        let caps = probe_capabilities(&plugin).await;
        assert!(caps.requires_sudo);
        assert!(!caps.separate_download);
    }

    #[tokio::test]
    async fn test_probe_capabilities_default_not_supported() {
        // A plugin that knows no verbs answers "no" to everything.
        let dir = tempfile::tempdir().unwrap();
        let plugin = write_script(dir.path(), "plain-plugin", "exit 1");
        assert_eq!(probe_capabilities(&plugin).await, ProbedCapabilities::default());
    }

    #[tokio::test]
    async fn test_query_sudo_programs() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = write_script(
            dir.path(),
            "sudo-plugin",
            r#"case "$1" in
  sudo-programs-paths) echo /usr/bin/apt-get; echo /usr/bin/dpkg; exit 0 ;;
  *) exit 1 ;;
esac"#,
        );
        let programs = query_sudo_programs(&plugin).await;
        assert_eq!(
            programs,
            vec![
                std::path::PathBuf::from("/usr/bin/apt-get"),
                std::path::PathBuf::from("/usr/bin/dpkg"),
            ]
        );
    }

    #[tokio::test]
    async fn test_query_dependencies_per_phase() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = write_script(
            dir.path(),
            "dependent-plugin",
            r#"case "$1" in
  execute-dependency) echo apt; exit 0 ;;
  *) exit 1 ;;
esac"#,
        );
        assert_eq!(query_dependencies(&plugin, Phase::Execute).await, vec!["apt"]);
        assert!(query_dependencies(&plugin, Phase::Download).await.is_empty());
    }

    #[tokio::test]
    async fn test_query_mutexes_parses_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = write_script(
            dir.path(),
            "mutex-plugin",
            "echo pkgmgr:apt\necho 'NOT A MUTEX'\necho system:dpkg",
        );
        let mutexes = query_mutexes(&plugin, Phase::Execute).await;
        let names: Vec<&str> = mutexes.iter().map(|m| m.as_str()).collect();
        assert_eq!(names, vec!["pkgmgr:apt", "system:dpkg"]);
    }

    #[test]
    fn test_commands_for_phase_verbs() {
        let caps = Capabilities {
            separate_download: true,
            requires_elevation: true,
            interactive: false,
        };
        let program = Path::new("/usr/lib/sysup/apt-plugin");
        let check = commands_for(program, Phase::Check, &caps);
        assert_eq!(check[0].argv[1], "estimate-update");
        assert!(!check[0].elevate);

        let execute = commands_for(program, Phase::Execute, &caps);
        assert_eq!(execute[0].argv[1], "update");
        assert!(execute[0].elevate);
    }
}
