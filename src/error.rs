//! Error taxonomy for terminal sessions and command execution.

use thiserror::Error;

/// Every failure the dispatcher or an executor can report.
///
/// None of these escape the request handlers: they are folded into a
/// `CommandResult` (non-zero exit code) or into a request-level rejection.
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("No command provided")]
    InvalidCommand,

    #[error("cd: {path}: Permission denied (outside project root)")]
    SandboxViolation { path: String },

    #[error("cd: {path}: No such file or directory")]
    NoSuchDirectory { path: String },

    #[error("open: {path}: No such file or directory")]
    NoSuchFile { path: String },

    #[error("open: {path}: Is a directory (use 'cd {path}' instead)")]
    IsADirectory { path: String },

    #[error("Command blocked for security reasons (matched '{pattern}')")]
    DangerousCommand { pattern: &'static str },

    #[error("Command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Command output exceeded the {limit} byte limit")]
    OutputTooLarge { limit: usize },

    /// `output` holds whatever the command wrote before it failed.
    #[error("{message}")]
    SpawnFailure {
        message: String,
        exit_code: i32,
        output: String,
    },

    #[error("SSH connection failed: {0}")]
    RemoteConnectionFailure(String),

    #[error("No SSH connection for session '{0}'")]
    RemoteSessionNotFound(String),
}

impl TerminalError {
    /// Exit code reported to the terminal UI for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            TerminalError::SpawnFailure { exit_code, .. } => *exit_code,
            _ => 1,
        }
    }

    /// Build a spawn failure from an I/O error, keeping the OS error code.
    pub fn spawn(context: &str, err: std::io::Error) -> Self {
        TerminalError::SpawnFailure {
            message: format!("{}: {}", context, err),
            exit_code: err.raw_os_error().filter(|code| *code != 0).unwrap_or(1),
            output: String::new(),
        }
    }

    /// Attach output captured before an execution-level failure. Other
    /// variants are returned unchanged.
    pub fn with_partial_output(self, captured: String) -> Self {
        match self {
            TerminalError::SpawnFailure {
                message, exit_code, ..
            } => TerminalError::SpawnFailure {
                message,
                exit_code,
                output: captured,
            },
            other => other,
        }
    }

    /// Output captured before the failure, empty when there was none.
    pub fn partial_output(&self) -> &str {
        match self {
            TerminalError::SpawnFailure { output, .. } => output,
            _ => "",
        }
    }
}
