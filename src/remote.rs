//! SSH-backed execution, keyed by the same session ids as local terminals.

use crate::error::TerminalError;
use crate::executor::{run_process, Executor, RunConfig, RunResult};
use crate::sandbox::dangerous_pattern;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const PASSWORD_ENV: &str = "DEVSHELL_SSH_PASSWORD";

/// Connection state of one session's SSH link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Absent,
    Pending,
    Connected,
    Disconnected,
}

#[derive(Clone)]
pub enum SshAuth {
    Password(String),
    PrivateKey(String),
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::Password(_) => f.write_str("Password(<redacted>)"),
            SshAuth::PrivateKey(_) => f.write_str("PrivateKey(<redacted>)"),
        }
    }
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
}

impl SshTarget {
    /// `user@host`, refusing anything the ssh client would read as an option.
    pub fn destination(&self) -> Result<String, TerminalError> {
        let valid = |s: &str| {
            !s.is_empty() && !s.starts_with('-') && !s.chars().any(char::is_whitespace)
        };
        if !valid(&self.host) || !valid(&self.username) || self.username.contains('@') {
            return Err(TerminalError::RemoteConnectionFailure(format!(
                "invalid destination {}@{}",
                self.username, self.host
            )));
        }
        Ok(format!("{}@{}", self.username, self.host))
    }
}

/// Opens shared connections to remote hosts.
#[async_trait]
pub trait SshTransport: Send + Sync {
    async fn connect(
        &self,
        session_id: &str,
        target: &SshTarget,
    ) -> Result<Arc<dyn SshLink>, TerminalError>;
}

/// An established connection. Each `exec` runs on its own channel.
#[async_trait]
pub trait SshLink: Send + Sync {
    async fn exec(
        &self,
        command: &str,
        timeout: Duration,
        max_output_bytes: usize,
    ) -> Result<RunResult, TerminalError>;

    async fn close(&self);
}

enum Connection {
    /// Tagged with the attempt that owns it; only that attempt may install
    /// its link.
    Pending(u64),
    Connected(Arc<dyn SshLink>),
    Disconnected,
}

impl Connection {
    fn status(&self) -> ConnectionStatus {
        match self {
            Connection::Pending(_) => ConnectionStatus::Pending,
            Connection::Connected(_) => ConnectionStatus::Connected,
            Connection::Disconnected => ConnectionStatus::Disconnected,
        }
    }
}

/// Per-session SSH connections with the
/// absent → pending → connected → disconnected life cycle.
pub struct RemoteExecutor {
    transport: Arc<dyn SshTransport>,
    connections: Mutex<HashMap<String, Connection>>,
    attempts: AtomicU64,
}

impl RemoteExecutor {
    pub fn new(transport: Arc<dyn SshTransport>) -> Self {
        Self {
            transport,
            connections: Mutex::new(HashMap::new()),
            attempts: AtomicU64::new(0),
        }
    }

    /// Backed by the system OpenSSH client.
    pub fn openssh() -> Self {
        Self::new(Arc::new(OpenSshTransport::default()))
    }

    /// Connect the session, replacing any previous connection.
    ///
    /// When another `connect` or a `disconnect` lands while this one is
    /// pending, this attempt closes its own link and fails.
    pub async fn connect(
        &self,
        session_id: &str,
        target: SshTarget,
    ) -> Result<ConnectionStatus, TerminalError> {
        let (attempt, previous) = {
            let mut connections = self.connections.lock().await;
            let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
            let previous = connections.insert(session_id.to_string(), Connection::Pending(attempt));
            (attempt, previous)
        };
        if let Some(Connection::Connected(link)) = previous {
            info!(session = %session_id, "Replacing existing SSH connection");
            link.close().await;
        }

        info!(
            session = %session_id,
            host = %target.host,
            port = target.port,
            user = %target.username,
            "Connecting over SSH"
        );
        let connected = self.transport.connect(session_id, &target).await;

        let mut connections = self.connections.lock().await;
        let current = matches!(
            connections.get(session_id),
            Some(Connection::Pending(owner)) if *owner == attempt
        );
        match connected {
            Ok(link) if current => {
                connections.insert(session_id.to_string(), Connection::Connected(link));
                info!(session = %session_id, "SSH connected");
                Ok(ConnectionStatus::Connected)
            }
            Ok(link) => {
                drop(connections);
                warn!(session = %session_id, "SSH connect superseded, closing its link");
                link.close().await;
                Err(TerminalError::RemoteConnectionFailure(
                    "connection attempt was superseded".to_string(),
                ))
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "SSH connection failed");
                if current {
                    connections.insert(session_id.to_string(), Connection::Disconnected);
                }
                Err(e)
            }
        }
    }

    /// Run a command over the session's connection. Commands are not queued.
    pub async fn execute(
        &self,
        session_id: &str,
        command: &str,
        timeout: Duration,
        max_output_bytes: usize,
    ) -> Result<RunResult, TerminalError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(TerminalError::InvalidCommand);
        }
        if let Some(pattern) = dangerous_pattern(command) {
            warn!(
                session = %session_id,
                command = %command,
                pattern,
                "Blocked dangerous remote command"
            );
            return Err(TerminalError::DangerousCommand { pattern });
        }

        let link = match self.connections.lock().await.get(session_id) {
            Some(Connection::Connected(link)) => link.clone(),
            Some(Connection::Pending(_)) => {
                return Err(TerminalError::RemoteConnectionFailure(
                    "connection is still being established".to_string(),
                ))
            }
            _ => return Err(TerminalError::RemoteSessionNotFound(session_id.to_string())),
        };

        info!(session = %session_id, command = %command, "Executing over SSH");
        link.exec(command, timeout, max_output_bytes).await
    }

    pub async fn disconnect(&self, session_id: &str) -> Result<ConnectionStatus, TerminalError> {
        let link = {
            let mut connections = self.connections.lock().await;
            if !connections.contains_key(session_id) {
                return Err(TerminalError::RemoteSessionNotFound(session_id.to_string()));
            }
            match connections.insert(session_id.to_string(), Connection::Disconnected) {
                Some(Connection::Connected(link)) => Some(link),
                _ => None,
            }
        };
        if let Some(link) = link {
            link.close().await;
            info!(session = %session_id, "SSH disconnected");
        }
        Ok(ConnectionStatus::Disconnected)
    }

    pub async fn status(&self, session_id: &str) -> ConnectionStatus {
        self.connections
            .lock()
            .await
            .get(session_id)
            .map(Connection::status)
            .unwrap_or(ConnectionStatus::Absent)
    }
}

/// Remote runs ignore the local cwd and environment.
#[async_trait]
impl Executor for RemoteExecutor {
    async fn run(&self, config: RunConfig) -> Result<RunResult, TerminalError> {
        self.execute(
            &config.session_id,
            &config.command,
            config.timeout,
            config.max_output_bytes,
        )
        .await
    }
}

/// Drives the system `ssh` client through a per-session control master.
#[derive(Debug, Clone)]
pub struct OpenSshTransport {
    program: PathBuf,
    connect_timeout: Duration,
}

impl Default for OpenSshTransport {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ssh"),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Options shared by every invocation against one control socket.
fn common_args(target: &SshTarget, socket: &Path) -> Vec<String> {
    vec![
        "-S".to_string(),
        socket.to_string_lossy().into_owned(),
        "-p".to_string(),
        target.port.to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", CONNECT_TIMEOUT.as_secs()),
    ]
}

#[async_trait]
impl SshTransport for OpenSshTransport {
    async fn connect(
        &self,
        session_id: &str,
        target: &SshTarget,
    ) -> Result<Arc<dyn SshLink>, TerminalError> {
        let destination = target.destination()?;
        let failure = |e: std::io::Error| TerminalError::RemoteConnectionFailure(e.to_string());

        let dir = tempfile::Builder::new()
            .prefix("devshell-ssh-")
            .tempdir()
            .map_err(failure)?;
        let socket = dir.path().join("control.sock");
        let log_path = dir.path().join("connect.log");

        let mut cmd = Command::new(&self.program);
        cmd.args(["-M", "-f", "-N", "-o", "ControlPersist=yes"])
            .args(common_args(target, &socket));

        match &target.auth {
            SshAuth::PrivateKey(key) => {
                let key_path = dir.path().join("id_key");
                let contents = key.trim_end().to_string() + "\n";
                write_private(&key_path, contents, 0o600).map_err(failure)?;
                cmd.arg("-i")
                    .arg(&key_path)
                    .args(["-o", "IdentitiesOnly=yes", "-o", "BatchMode=yes"]);
            }
            SshAuth::Password(password) => {
                let askpass = dir.path().join("askpass.sh");
                write_private(
                    &askpass,
                    format!("#!/bin/sh\nprintf '%s\\n' \"${}\"\n", PASSWORD_ENV),
                    0o700,
                )
                .map_err(failure)?;
                cmd.env("SSH_ASKPASS", &askpass)
                    .env("SSH_ASKPASS_REQUIRE", "force")
                    .env(PASSWORD_ENV, password)
                    .args([
                        "-o",
                        "PreferredAuthentications=password,keyboard-interactive",
                        "-o",
                        "NumberOfPasswordPrompts=1",
                    ]);
            }
        }
        cmd.arg(&destination);

        let log = std::fs::File::create(&log_path).map_err(failure)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log));

        // With -f the client forks once authenticated; the parent exit
        // status tells us whether the master came up.
        let mut child = cmd.spawn().map_err(failure)?;
        let status = match tokio::time::timeout(self.connect_timeout, child.wait()).await {
            Ok(status) => status.map_err(failure)?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(TerminalError::RemoteConnectionFailure(format!(
                    "timed out after {}s",
                    self.connect_timeout.as_secs()
                )));
            }
        };
        if !status.success() {
            let log = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
            let message = log.trim();
            return Err(TerminalError::RemoteConnectionFailure(if message.is_empty() {
                format!("ssh exited with {}", status)
            } else {
                message.to_string()
            }));
        }

        info!(session = %session_id, socket = ?socket, "SSH control master started");
        Ok(Arc::new(OpenSshLink {
            program: self.program.clone(),
            destination,
            common: common_args(target, &socket),
            _dir: dir,
        }))
    }
}

struct OpenSshLink {
    program: PathBuf,
    destination: String,
    common: Vec<String>,
    /// Holds the control socket and credentials; removed on drop.
    _dir: TempDir,
}

#[async_trait]
impl SshLink for OpenSshLink {
    async fn exec(
        &self,
        command: &str,
        timeout: Duration,
        max_output_bytes: usize,
    ) -> Result<RunResult, TerminalError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.common)
            .args(["-o", "ControlMaster=no", "-o", "BatchMode=yes"])
            .arg(&self.destination)
            .arg("--")
            .arg(command);
        run_process(cmd, timeout, max_output_bytes).await
    }

    async fn close(&self) {
        let result = Command::new(&self.program)
            .args(&self.common)
            .args(["-O", "exit"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Failed to stop SSH control master");
        }
    }
}

fn write_private(path: &Path, contents: String, mode: u32) -> std::io::Result<()> {
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}
