//! Elevation pre-authentication.
//!
//! Plugins that declare elevation need `sudo` credentials before their
//! first elevated spawn; prompting inside a plugin tab mid-run would stall
//! the whole wave. A process-wide coordinator authenticates once, before
//! the UI takes over the terminal, and keeps the timestamp fresh with a
//! background heartbeat until shutdown.

use anyhow::{Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Refresh interval; comfortably under sudo's default 15-minute timeout.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Process-wide sudo credential coordinator. The prompt happens at most
/// once per run regardless of how many plugins require elevation.
pub struct ElevationCoordinator {
    authenticated: OnceCell<()>,
    cancel: CancellationToken,
    sudo_cmd: String,
}

impl ElevationCoordinator {
    pub fn new() -> Self {
        Self {
            authenticated: OnceCell::new(),
            cancel: CancellationToken::new(),
            sudo_cmd: std::env::var("SYSUP_SUDO").unwrap_or_else(|_| "sudo".to_string()),
        }
    }

    /// Authenticate interactively (inherited stdio) if not yet done, then
    /// start the refresh heartbeat. Must be called before the TUI owns the
    /// terminal.
    pub async fn ensure_authenticated(&self) -> Result<()> {
        self.authenticated
            .get_or_try_init(|| async {
                let status = tokio::process::Command::new(&self.sudo_cmd)
                    .arg("-v")
                    .status()
                    .await
                    .context("failed to run sudo for pre-authentication")?;
                if !status.success() {
                    anyhow::bail!("sudo pre-authentication failed");
                }
                self.spawn_heartbeat();
                Ok(())
            })
            .await
            .map(|_| ())
    }

    fn spawn_heartbeat(&self) {
        let cancel = self.cancel.clone();
        let sudo_cmd = self.sudo_cmd.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                // -n: never prompt from the background; a failure here just
                // means the next elevated command may prompt in its tab.
                let result = tokio::process::Command::new(&sudo_cmd)
                    .args(["-n", "-v"])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                if let Ok(status) = result {
                    if !status.success() {
                        tracing::warn!("sudo credential refresh failed");
                    }
                }
            }
        });
    }

    /// Stop the heartbeat. Called once on shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Default for ElevationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
