//! Pseudo-terminal sessions for plugin subprocesses.
//!
//! Each running plugin command gets its own PTY so interactive tools (sudo
//! prompts, progress bars, pagers) behave exactly as they would in a real
//! terminal. A blocking reader thread bridges the master fd into an async
//! channel; a single reader and a single writer exist per session.
//!
//! POSIX only. When PTY allocation fails the caller falls back to a
//! non-interactive path.

mod elevation;

pub use elevation::ElevationCoordinator;

use crate::errors::PtyError;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Read chunk size for the master fd.
const READ_BUF_SIZE: usize = 8192;

/// How often `terminate` polls for child exit during the grace period.
const REAP_POLL: Duration = Duration::from_millis(50);

/// Exit information for a finished child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: i32,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Shared handle for writing to a session's stdin. The input router holds
/// one of these per tab; it outlives the session and turns into a no-op
/// once the session closes.
#[derive(Clone, Default)]
pub struct PtyWriter {
    inner: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
}

impl PtyWriter {
    /// Write bytes to the child's stdin. Returns false when no session is
    /// attached.
    pub fn write(&self, bytes: &[u8]) -> bool {
        let mut guard = self.inner.lock().expect("pty writer poisoned");
        match guard.as_mut() {
            Some(writer) => {
                if let Err(err) = writer.write_all(bytes).and_then(|_| writer.flush()) {
                    tracing::warn!(%err, "pty stdin write failed");
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().expect("pty writer poisoned").is_some()
    }

    fn attach(&self, writer: Box<dyn Write + Send>) {
        *self.inner.lock().expect("pty writer poisoned") = Some(writer);
    }

    fn detach(&self) {
        *self.inner.lock().expect("pty writer poisoned") = None;
    }
}

/// One spawned child bound to a pseudo-terminal.
///
/// Owned exclusively by the plugin executor running the phase; closed on
/// phase end. The terminal screen and metrics live elsewhere and survive
/// the session.
pub struct PtySession {
    master: Box<dyn MasterPty + Send>,
    child: Option<Box<dyn Child + Send + Sync>>,
    child_pid: Option<u32>,
    read_rx: mpsc::Receiver<Vec<u8>>,
    writer: PtyWriter,
}

impl PtySession {
    /// Allocate a PTY and spawn `argv` on its slave end.
    pub fn spawn(
        argv: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&std::path::Path>,
        cols: u16,
        rows: u16,
        writer: PtyWriter,
    ) -> Result<Self, PtyError> {
        let program = argv.first().ok_or_else(|| {
            PtyError::Spawn {
                command: String::new(),
                source: anyhow::anyhow!("empty argument vector"),
            }
        })?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Allocation(e.to_string()))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(&argv[1..]);
        if let Some(dir) = cwd {
            cmd.cwd(dir);
        }
        // Present a modern terminal to the child so package managers keep
        // their progress output enabled.
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        for (k, v) in env {
            cmd.env(k, v);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn {
                command: argv.join(" "),
                source: e,
            })?;
        let child_pid = child.process_id();
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Allocation(e.to_string()))?;
        let (read_tx, read_rx) = mpsc::channel::<Vec<u8>>(64);
        // Dedicated blocking thread: reads never miss bytes across yields
        // and the channel bound applies backpressure to a flooding child.
        std::thread::Builder::new()
            .name("pty-reader".to_string())
            .spawn(move || {
                let mut buf = [0u8; READ_BUF_SIZE];
                loop {
                    match std::io::Read::read(&mut reader, &mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if read_tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                    }
                }
            })
            .map_err(PtyError::Io)?;

        let stdin = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Allocation(e.to_string()))?;
        writer.attach(stdin);

        Ok(Self {
            master: pair.master,
            child: Some(child),
            child_pid,
            read_rx,
            writer,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child_pid
    }

    /// Next chunk of output from the child. `None` means the stream closed.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.read_rx.recv().await
    }

    /// Write to the child's stdin.
    pub fn write(&self, bytes: &[u8]) -> bool {
        self.writer.write(bytes)
    }

    /// Update the PTY window size; the kernel delivers SIGWINCH.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Io(std::io::Error::other(e.to_string())))
    }

    /// Send a signal to the child's process group.
    pub fn signal(&self, sig: i32) {
        let Some(pid) = self.child_pid else { return };
        // The child is the session leader on its PTY, so its pid names the
        // process group.
        unsafe {
            if libc::killpg(pid as libc::pid_t, sig) != 0 {
                libc::kill(pid as libc::pid_t, sig);
            }
        }
    }

    /// Poll for exit without blocking.
    pub fn try_wait(&mut self) -> Result<Option<ExitInfo>, PtyError> {
        let child = self.child.as_mut().ok_or(PtyError::ChildGone)?;
        match child.try_wait() {
            Ok(Some(status)) => Ok(Some(ExitInfo {
                code: status.exit_code() as i32,
            })),
            Ok(None) => Ok(None),
            Err(err) => Err(PtyError::Io(err)),
        }
    }

    /// Wait for the child to exit.
    pub async fn wait(&mut self) -> Result<ExitInfo, PtyError> {
        let mut child = self.child.take().ok_or(PtyError::ChildGone)?;
        let status = tokio::task::spawn_blocking(move || child.wait())
            .await
            .map_err(|e| PtyError::Io(std::io::Error::other(e.to_string())))?
            .map_err(PtyError::Io)?;
        Ok(ExitInfo {
            code: status.exit_code() as i32,
        })
    }

    /// Terminate the child: SIGTERM, wait up to `grace`, then SIGKILL.
    pub async fn terminate(&mut self, grace: Duration) -> Result<ExitInfo, PtyError> {
        self.signal(libc::SIGTERM);
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            match self.try_wait() {
                Ok(Some(info)) => {
                    self.child = None;
                    return Ok(info);
                }
                Ok(None) => {}
                Err(PtyError::ChildGone) => return Err(PtyError::ChildGone),
                Err(err) => return Err(err),
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(REAP_POLL).await;
        }
        tracing::warn!(pid = ?self.child_pid, "grace period expired, sending SIGKILL");
        self.signal(libc::SIGKILL);
        self.wait().await
    }

    /// Detach the shared stdin handle. Called on session end so stray
    /// keystrokes cannot reach a reused fd.
    pub fn close_stdin(&self) {
        self.writer.detach();
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.writer.detach();
        if self.child.is_some() {
            // Scope exit without wait(): make sure nothing lingers.
            self.signal(libc::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    async fn collect_output(session: &mut PtySession) -> String {
        let mut out = Vec::new();
        while let Some(chunk) = session.read().await {
            out.extend_from_slice(&chunk);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn test_spawn_echo_and_wait() {
        let mut session = PtySession::spawn(
            &argv(&["sh", "-c", "echo hello-pty"]),
            &HashMap::new(),
            None,
            80,
            24,
            PtyWriter::default(),
        )
        .unwrap();
        let output = collect_output(&mut session).await;
        assert!(output.contains("hello-pty"));
        let info = session.wait().await.unwrap();
        assert!(info.success());
    }

    #[tokio::test]
    async fn test_exit_code_propagates() {
        let mut session = PtySession::spawn(
            &argv(&["sh", "-c", "exit 3"]),
            &HashMap::new(),
            None,
            80,
            24,
            PtyWriter::default(),
        )
        .unwrap();
        let _ = collect_output(&mut session).await;
        let info = session.wait().await.unwrap();
        assert_eq!(info.code, 3);
        assert!(!info.success());
    }

    #[tokio::test]
    async fn test_stdin_roundtrip_through_cat() {
        let writer = PtyWriter::default();
        let mut session = PtySession::spawn(
            &argv(&["cat"]),
            &HashMap::new(),
            None,
            80,
            24,
            writer.clone(),
        )
        .unwrap();
        assert!(writer.is_attached());
        assert!(writer.write(b"ping\n"));

        let mut seen = String::new();
        while let Some(chunk) = session.read().await {
            seen.push_str(&String::from_utf8_lossy(&chunk));
            if seen.contains("ping") {
                break;
            }
        }
        assert!(seen.contains("ping"));

        session.terminate(Duration::from_secs(2)).await.unwrap();
        session.close_stdin();
        assert!(!writer.is_attached());
        assert!(!writer.write(b"late\n"));
    }

    #[tokio::test]
    async fn test_terminate_kills_sleeping_child() {
        let mut session = PtySession::spawn(
            &argv(&["sleep", "300"]),
            &HashMap::new(),
            None,
            80,
            24,
            PtyWriter::default(),
        )
        .unwrap();
        let start = std::time::Instant::now();
        let info = session.terminate(Duration::from_millis(500)).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!info.success());
    }

    #[tokio::test]
    async fn test_env_reaches_child() {
        let mut env = HashMap::new();
        env.insert("SYSUP_TEST_VAR".to_string(), "marker-42".to_string());
        let mut session = PtySession::spawn(
            &argv(&["sh", "-c", "echo $SYSUP_TEST_VAR"]),
            &env,
            None,
            80,
            24,
            PtyWriter::default(),
        )
        .unwrap();
        let output = collect_output(&mut session).await;
        assert!(output.contains("marker-42"));
        session.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let result = PtySession::spawn(
            &argv(&["/definitely/not/a/real/program"]),
            &HashMap::new(),
            None,
            80,
            24,
            PtyWriter::default(),
        );
        // portable-pty reports the failure either at spawn or as an
        // immediate abnormal exit, depending on the platform path.
        if let Ok(mut session) = result {
            let _ = collect_output(&mut session).await;
            let info = session.wait().await.unwrap();
            assert!(!info.success());
        }
    }

    #[tokio::test]
    async fn test_resize_is_accepted() {
        let mut session = PtySession::spawn(
            &argv(&["sleep", "1"]),
            &HashMap::new(),
            None,
            80,
            24,
            PtyWriter::default(),
        )
        .unwrap();
        session.resize(120, 40).unwrap();
        session.terminate(Duration::from_millis(200)).await.unwrap();
    }
}
