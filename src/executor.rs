//! Command execution backends.

use crate::error::TerminalError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Configuration for running one command line.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub session_id: String,
    pub command: String,
    pub cwd: PathBuf,
    pub env: Arc<HashMap<String, String>>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

/// Captured output of a command that ran to completion.
///
/// A non-zero `exit_code` is still a successful run from the backend's
/// point of view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RunResult {
    /// Stdout followed by stderr, the way a terminal would show them.
    pub fn combined_output(&self) -> String {
        let mut output = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&self.stderr);
        }
        output
    }
}

/// Something that can run a command line for a session.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, config: RunConfig) -> Result<RunResult, TerminalError>;
}

/// Runs commands through the host shell.
#[derive(Debug, Default, Clone)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn run(&self, config: RunConfig) -> Result<RunResult, TerminalError> {
        info!(
            session = %config.session_id,
            command = %config.command,
            cwd = ?config.cwd,
            "Running command"
        );

        let mut cmd = shell_command(&config.command);
        cmd.current_dir(&config.cwd)
            .env_clear()
            .envs(config.env.iter());

        let result = run_process(cmd, config.timeout, config.max_output_bytes).await;
        match &result {
            Ok(r) => info!(
                session = %config.session_id,
                exit_code = r.exit_code,
                stdout_len = r.stdout.len(),
                stderr_len = r.stderr.len(),
                "Command finished"
            ),
            Err(e) => warn!(session = %config.session_id, error = %e, "Command failed"),
        }
        result
    }
}

/// The host command interpreter invoked with a full command line.
pub fn shell_command(command_line: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command_line);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command_line);
        cmd
    }
}

/// Spawn `cmd`, capture its output and enforce the wall-clock timeout and
/// combined output cap. The whole process group is killed on either limit.
pub async fn run_process(
    mut cmd: Command,
    timeout: Duration,
    max_output_bytes: usize,
) -> Result<RunResult, TerminalError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| TerminalError::spawn("spawn", e))?;
    debug!(pid = ?child.id(), "Child spawned");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let mut out = Vec::new();
    let mut err = Vec::new();
    let outcome = {
        let run = async {
            collect_output(stdout, stderr, max_output_bytes, &mut out, &mut err).await?;
            child
                .wait()
                .await
                .map_err(|e| TerminalError::spawn("wait", e))
        };
        tokio::time::timeout(timeout, run).await
    };

    match outcome {
        Ok(Ok(status)) => Ok(RunResult {
            stdout: String::from_utf8_lossy(&out).into_owned(),
            stderr: String::from_utf8_lossy(&err).into_owned(),
            exit_code: exit_code_of(status),
        }),
        Ok(Err(e)) => {
            terminate(&mut child).await;
            let partial = RunResult {
                stdout: String::from_utf8_lossy(&out).into_owned(),
                stderr: String::from_utf8_lossy(&err).into_owned(),
                exit_code: e.exit_code(),
            };
            Err(e.with_partial_output(partial.combined_output()))
        }
        Err(_) => {
            let timeout_ms = timeout.as_millis() as u64;
            warn!(timeout_ms, "Command timed out, killing process group");
            terminate(&mut child).await;
            Err(TerminalError::Timeout { timeout_ms })
        }
    }
}

/// Drain both pipes until EOF into `out` and `err`, failing as soon as the
/// combined size passes the cap. Whatever was read stays in the buffers.
async fn collect_output<O, E>(
    stdout: Option<O>,
    stderr: Option<E>,
    max_output_bytes: usize,
    out: &mut Vec<u8>,
    err: &mut Vec<u8>,
) -> Result<(), TerminalError>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];
    let mut out_done = stdout.is_none();
    let mut err_done = stderr.is_none();
    let mut stdout = stdout;
    let mut stderr = stderr;

    while !(out_done && err_done) {
        tokio::select! {
            read = read_some(&mut stdout, &mut out_buf), if !out_done => {
                let n = read.map_err(|e| TerminalError::spawn("read stdout", e))?;
                if n == 0 { out_done = true } else { out.extend_from_slice(&out_buf[..n]) }
            }
            read = read_some(&mut stderr, &mut err_buf), if !err_done => {
                let n = read.map_err(|e| TerminalError::spawn("read stderr", e))?;
                if n == 0 { err_done = true } else { err.extend_from_slice(&err_buf[..n]) }
            }
        }
        if out.len() + err.len() > max_output_bytes {
            return Err(TerminalError::OutputTooLarge {
                limit: max_output_bytes,
            });
        }
    }
    Ok(())
}

async fn read_some<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => Ok(0),
    }
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
    let _ = child.kill().await;
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
