//! Integration tests for the sysup CLI surface.
//!
//! These run the real binary headless, so they exercise configuration
//! loading, validation, and the startup error paths. Exit code contract:
//! 0 all success, 1 plugin failures, 2 startup/configuration errors.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

fn sysup() -> Command {
    Command::cargo_bin("sysup").unwrap()
}

fn write_config(dir: &Path, content: &str) -> std::path::PathBuf {
    let path = dir.join("sysup.toml");
    std::fs::write(&path, content).unwrap();
    path
}

const VALID_CONFIG: &str = r#"
[[plugin]]
name = "alpha"

[[plugin.execute]]
argv = ["sh", "-c", "echo alpha"]

[[plugin]]
name = "beta"

[[plugin.execute]]
argv = ["sh", "-c", "echo beta"]
"#;

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        sysup()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("--pause-phases").or(predicate::str::contains("-P")))
            .stdout(predicate::str::contains("--concurrency"))
            .stdout(predicate::str::contains("--dry-run"))
            .stdout(predicate::str::contains("--continue-on-error"))
            .stdout(predicate::str::contains("--plugins"));
    }

    #[test]
    fn test_version() {
        sysup().arg("--version").assert().success();
    }

    #[test]
    fn test_missing_config_is_exit_2() {
        let dir = TempDir::new().unwrap();
        sysup()
            .current_dir(dir.path())
            .env("XDG_CONFIG_HOME", dir.path().join("nonexistent-config"))
            .arg("--log-dir")
            .arg(dir.path().join("logs"))
            .assert()
            .code(2)
            .stderr(predicate::str::contains("no configuration found"));
    }

    #[test]
    fn test_unreadable_config_is_exit_2() {
        let dir = TempDir::new().unwrap();
        sysup()
            .arg("--config")
            .arg(dir.path().join("missing.toml"))
            .arg("--log-dir")
            .arg(dir.path().join("logs"))
            .assert()
            .code(2)
            .stderr(predicate::str::contains("Failed to read config file"));
    }
}

mod configuration_errors {
    use super::*;

    #[test]
    fn test_schedule_cycle_is_exit_2_and_names_participants() {
        let dir = TempDir::new().unwrap();
        let config = write_config(
            dir.path(),
            r#"
[[plugin]]
name = "alpha"
runs_after = ["beta"]

[[plugin.execute]]
argv = ["true"]

[[plugin]]
name = "beta"
runs_after = ["alpha"]

[[plugin.execute]]
argv = ["true"]
"#,
        );
        sysup()
            .arg("--config")
            .arg(&config)
            .arg("--log-dir")
            .arg(dir.path().join("logs"))
            .assert()
            .code(2)
            .stderr(predicate::str::contains("cycle"))
            .stderr(predicate::str::contains("alpha"))
            .stderr(predicate::str::contains("beta"));
    }

    #[test]
    fn test_invalid_mutex_name_is_exit_2() {
        let dir = TempDir::new().unwrap();
        let config = write_config(
            dir.path(),
            r#"
[[plugin]]
name = "alpha"
mutexes = ["Not A Mutex"]

[[plugin.execute]]
argv = ["true"]
"#,
        );
        sysup()
            .arg("--config")
            .arg(&config)
            .arg("--log-dir")
            .arg(dir.path().join("logs"))
            .assert()
            .code(2);
    }

    #[test]
    fn test_unknown_plugin_subset_is_exit_2() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path(), VALID_CONFIG);
        sysup()
            .arg("--config")
            .arg(&config)
            .arg("--plugins")
            .arg("gamma")
            .arg("--log-dir")
            .arg(dir.path().join("logs"))
            .assert()
            .code(2)
            .stderr(predicate::str::contains("gamma"));
    }

    #[test]
    fn test_duplicate_plugin_is_exit_2() {
        let dir = TempDir::new().unwrap();
        let config = write_config(
            dir.path(),
            r#"
[[plugin]]
name = "alpha"

[[plugin.execute]]
argv = ["true"]

[[plugin]]
name = "alpha"

[[plugin.execute]]
argv = ["true"]
"#,
        );
        sysup()
            .arg("--config")
            .arg(&config)
            .arg("--log-dir")
            .arg(dir.path().join("logs"))
            .assert()
            .code(2)
            .stderr(predicate::str::contains("alpha"));
    }

    #[test]
    fn test_plugin_without_commands_is_exit_2() {
        let dir = TempDir::new().unwrap();
        let config = write_config(
            dir.path(),
            r#"
[[plugin]]
name = "empty"
"#,
        );
        sysup()
            .arg("--config")
            .arg(&config)
            .arg("--log-dir")
            .arg(dir.path().join("logs"))
            .assert()
            .code(2)
            .stderr(predicate::str::contains("empty"));
    }

    #[test]
    fn test_resume_without_state_is_exit_2() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path(), VALID_CONFIG);
        sysup()
            .arg("--config")
            .arg(&config)
            .arg("--resume")
            .arg("--log-dir")
            .arg(dir.path().join("logs"))
            .env("XDG_STATE_HOME", dir.path().join("state"))
            .assert()
            .code(2);
    }
}

mod headless_behavior {
    use super::*;

    // Valid configuration but no TTY: startup must refuse cleanly rather
    // than garble a pipe with the alternate screen.
    #[test]
    fn test_valid_config_without_tty_is_exit_2() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path(), VALID_CONFIG);
        sysup()
            .arg("--config")
            .arg(&config)
            .arg("--log-dir")
            .arg(dir.path().join("logs"))
            .env("XDG_STATE_HOME", dir.path().join("state"))
            .assert()
            .code(2)
            .stderr(predicate::str::contains("interactive terminal"));
    }

    #[test]
    fn test_log_directory_is_created() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path(), VALID_CONFIG);
        let log_dir = dir.path().join("logs/nested");
        sysup()
            .arg("--config")
            .arg(&config)
            .arg("--log-dir")
            .arg(&log_dir)
            .env("XDG_STATE_HOME", dir.path().join("state"))
            .assert()
            .code(2); // no TTY, but logging is initialized first
        assert!(log_dir.join("sysup.log").exists());
    }
}
