//! Typed error hierarchy for the sysup orchestrator.
//!
//! Top-level enums cover the subsystems that can fail independently:
//! - `MutexError` - named-lock acquisition failures
//! - `ResourceError` - admission permit failures
//! - `PtyError` - pseudo-terminal allocation and child process failures
//! - `ExecutorError` - per-plugin per-phase execution failures
//! - `ScheduleError` - DAG construction failures (these abort the run)

use thiserror::Error;

/// Errors from the mutex manager.
#[derive(Debug, Error)]
pub enum MutexError {
    #[error("mutex '{0}' is not a valid name (expected category:resource, lowercase, <= 64 chars)")]
    InvalidName(String),

    #[error("timed out after {timeout_secs}s waiting for mutexes {mutexes:?}")]
    Timeout {
        mutexes: Vec<String>,
        timeout_secs: u64,
    },

    #[error("deadlock detected; wait cycle involves {participants:?}")]
    Deadlock { participants: Vec<String> },
}

/// Errors from the resource controller.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("timed out after {timeout_secs}s waiting for a {kind} permit")]
    PermitTimeout { kind: &'static str, timeout_secs: u64 },

    #[error("resource controller is shut down")]
    Closed,
}

/// Errors from the PTY subsystem.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to allocate a pseudo-terminal: {0}")]
    Allocation(String),

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("child process already reaped")]
    ChildGone,
}

/// Errors from a single plugin-phase execution.
///
/// All of these surface as a failing `PhaseEnd` event; the run continues
/// when `--continue-on-error` is set.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("spawn failed: {0}")]
    Spawn(#[source] anyhow::Error),

    #[error("timeout")]
    Timeout,

    #[error("error pattern matched: {pattern}")]
    PatternMatched { pattern: String },

    #[error("exit {code}")]
    NonZeroExit { code: i32 },

    #[error("mutex deadlock")]
    MutexDeadlock,

    #[error("mutex timeout")]
    MutexTimeout,

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("cancelled")]
    Cancelled,
}

impl ExecutorError {
    /// Short canonical string shown in the tab status bar.
    pub fn status_label(&self) -> String {
        match self {
            Self::Spawn(_) => "spawn failed".to_string(),
            Self::Timeout => "timeout".to_string(),
            Self::PatternMatched { pattern } => pattern.clone(),
            Self::NonZeroExit { code } => format!("exit {code}"),
            Self::MutexDeadlock => "mutex deadlock".to_string(),
            Self::MutexTimeout => "mutex timeout".to_string(),
            Self::Resource(_) => "resource timeout".to_string(),
            Self::Pty(_) => "pty failure".to_string(),
            Self::Cancelled => "cancelled".to_string(),
        }
    }
}

impl From<MutexError> for ExecutorError {
    fn from(err: MutexError) -> Self {
        match err {
            MutexError::Deadlock { .. } => Self::MutexDeadlock,
            MutexError::Timeout { .. } => Self::MutexTimeout,
            MutexError::InvalidName(name) => {
                Self::Spawn(anyhow::anyhow!("invalid mutex name '{name}'"))
            }
        }
    }
}

/// Errors detected while building the execution DAG. Fatal: the run aborts
/// with exit code 2 before any plugin starts.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("dependency cycle detected between plugins: {participants:?}")]
    Cycle { participants: Vec<String> },

    #[error("plugin '{plugin}' runs after unknown plugin '{dependency}'")]
    UnknownDependency { plugin: String, dependency: String },

    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("duplicate plugin name: {0}")]
    DuplicatePlugin(String),
}
