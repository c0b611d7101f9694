//! Command dispatch: built-ins (`cd`, `pwd`, `open`) and shell forwarding.

use crate::config::Config;
use crate::error::TerminalError;
use crate::executor::{Executor, RunConfig};
use crate::open::{companion_app, launch_command};
use crate::paths::PathTranslator;
use crate::sandbox::{dangerous_pattern, SandboxGuard};
use crate::state::{Session, SessionStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One command line submitted by a terminal client.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub session_id: String,
    pub command: String,
    /// Virtual cwd to run this one command in.
    pub cwd: Option<String>,
}

/// Uniform result for built-ins and forwarded commands alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub output: String,
    pub exit_code: i32,
    /// Virtual cwd after the command.
    pub cwd: String,
}

/// A command refused before anything ran: empty or denylisted.
#[derive(Debug)]
pub struct Rejection {
    pub error: TerminalError,
    pub cwd: String,
}

enum Builtin<'a> {
    Cd(&'a str),
    Pwd,
    Open(&'a str),
    Shell,
}

fn parse_builtin(command: &str) -> Builtin<'_> {
    if command == "pwd" {
        Builtin::Pwd
    } else if command == "cd" {
        Builtin::Cd("")
    } else if let Some(target) = command.strip_prefix("cd ") {
        Builtin::Cd(unquote(target.trim()))
    } else if let Some(target) = command.strip_prefix("open ") {
        Builtin::Open(unquote(target.trim()))
    } else {
        Builtin::Shell
    }
}

fn unquote(s: &str) -> &str {
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

pub struct Dispatcher {
    config: Arc<Config>,
    sessions: Arc<SessionStore>,
    translator: PathTranslator,
    guard: SandboxGuard,
    executor: Arc<dyn Executor>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        sessions: Arc<SessionStore>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let guard = SandboxGuard::new(config.project_root.clone());
        Self {
            translator: PathTranslator::new(guard.clone()),
            guard,
            config,
            sessions,
            executor,
        }
    }

    pub fn translator(&self) -> &PathTranslator {
        &self.translator
    }

    /// Run one command line for a session.
    ///
    /// Only empty and denylisted commands are rejected; every other failure
    /// comes back as a `CommandResult` with a non-zero exit code.
    pub async fn dispatch(&self, req: CommandRequest) -> Result<CommandResult, Rejection> {
        let session = self.sessions.get(&req.session_id).await;
        let cwd = self.effective_cwd(&session, req.cwd.as_deref()).await;
        let virtual_cwd = self.translator.to_virtual(&cwd);

        let command = req.command.trim();
        if command.is_empty() {
            return Err(Rejection {
                error: TerminalError::InvalidCommand,
                cwd: virtual_cwd,
            });
        }
        if let Some(pattern) = dangerous_pattern(command) {
            warn!(session = %session.id, command = %command, pattern, "Blocked dangerous command");
            return Err(Rejection {
                error: TerminalError::DangerousCommand { pattern },
                cwd: virtual_cwd,
            });
        }

        let outcome = match parse_builtin(command) {
            Builtin::Cd(target) => self.change_directory(&session.id, &cwd, target).await,
            Builtin::Pwd => Ok(CommandResult {
                output: virtual_cwd.clone(),
                exit_code: 0,
                cwd: virtual_cwd.clone(),
            }),
            Builtin::Open(target) => self.open(&session, &cwd, target).await,
            Builtin::Shell => self.forward(&session, &cwd, command).await,
        };

        Ok(outcome.unwrap_or_else(|e| {
            debug!(session = %session.id, error = %e, "Command failed");
            let mut output = e.partial_output().to_string();
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&e.to_string());
            CommandResult {
                output,
                exit_code: e.exit_code(),
                cwd: virtual_cwd,
            }
        }))
    }

    /// The per-request override when it names a directory inside the root,
    /// otherwise the session's own cwd.
    async fn effective_cwd(&self, session: &Session, cwd_override: Option<&str>) -> PathBuf {
        let Some(virtual_cwd) = cwd_override.filter(|v| !v.trim().is_empty()) else {
            return session.cwd.clone();
        };
        let real = self.translator.to_real(virtual_cwd);
        match tokio::fs::canonicalize(&real).await {
            Ok(resolved) if resolved.is_dir() && self.guard.is_within_root(&resolved) => resolved,
            _ => {
                warn!(
                    session = %session.id,
                    cwd = %virtual_cwd,
                    "Ignoring cwd override outside the project"
                );
                session.cwd.clone()
            }
        }
    }

    async fn change_directory(
        &self,
        session_id: &str,
        cwd: &Path,
        target: &str,
    ) -> Result<CommandResult, TerminalError> {
        let candidate = self.resolve_cd_target(cwd, target);
        let resolved = match tokio::fs::canonicalize(&candidate).await {
            Ok(p) if p.is_dir() => p,
            _ => {
                return Err(TerminalError::NoSuchDirectory {
                    path: target.to_string(),
                })
            }
        };
        if !self.guard.is_within_root(&resolved) {
            warn!(session = %session_id, target = ?resolved, "cd outside project root refused");
            return Err(TerminalError::SandboxViolation {
                path: target.to_string(),
            });
        }

        let virtual_cwd = self.translator.to_virtual(&resolved);
        info!(session = %session_id, cwd = %virtual_cwd, "Changed directory");
        self.sessions.update(session_id, resolved).await;
        Ok(CommandResult {
            output: String::new(),
            exit_code: 0,
            cwd: virtual_cwd,
        })
    }

    fn resolve_cd_target(&self, cwd: &Path, target: &str) -> PathBuf {
        let root = self.translator.root();
        if target.is_empty() || target == "~" {
            return root.to_path_buf();
        }
        if let Some(rest) = target.strip_prefix("~/") {
            return root.join(rest);
        }
        let target = Path::new(target);
        if target.is_absolute() {
            target.to_path_buf()
        } else {
            cwd.join(target)
        }
    }

    async fn open(
        &self,
        session: &Session,
        cwd: &Path,
        target: &str,
    ) -> Result<CommandResult, TerminalError> {
        let path = cwd.join(target);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| TerminalError::NoSuchFile {
                path: target.to_string(),
            })?;
        if metadata.is_dir() {
            return Err(TerminalError::IsADirectory {
                path: target.to_string(),
            });
        }

        let app = companion_app(&path);
        let virtual_path = self.translator.to_virtual(&path);
        info!(session = %session.id, file = %virtual_path, app, "Opening file");

        let result = self
            .executor
            .run(RunConfig {
                session_id: session.id.clone(),
                command: launch_command(app, &path),
                cwd: cwd.to_path_buf(),
                env: session.env.clone(),
                timeout: self.config.open_timeout,
                max_output_bytes: self.config.max_output_bytes,
            })
            .await?;

        let output = if result.exit_code == 0 {
            format!("Opened {} with {}", virtual_path, app)
        } else {
            let output = result.combined_output();
            if output.trim().is_empty() {
                format!("open: could not launch {} for {}", app, virtual_path)
            } else {
                output
            }
        };
        Ok(CommandResult {
            output,
            exit_code: result.exit_code,
            cwd: self.translator.to_virtual(cwd),
        })
    }

    async fn forward(
        &self,
        session: &Session,
        cwd: &Path,
        command: &str,
    ) -> Result<CommandResult, TerminalError> {
        let result = self
            .executor
            .run(RunConfig {
                session_id: session.id.clone(),
                command: command.to_string(),
                cwd: cwd.to_path_buf(),
                env: session.env.clone(),
                timeout: self.config.command_timeout,
                max_output_bytes: self.config.max_output_bytes,
            })
            .await?;
        Ok(CommandResult {
            output: result.combined_output(),
            exit_code: result.exit_code,
            cwd: self.translator.to_virtual(cwd),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RunResult;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records every call and answers with a canned result.
    struct RecordingExecutor {
        calls: Mutex<Vec<RunConfig>>,
        reply: Result<RunResult, fn() -> TerminalError>,
    }

    impl RecordingExecutor {
        fn replying(reply: RunResult) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                reply: Ok(reply),
            }
        }

        fn failing(err: fn() -> TerminalError) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                reply: Err(err),
            }
        }

        fn calls(&self) -> Vec<RunConfig> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Executor for RecordingExecutor {
        async fn run(&self, config: RunConfig) -> Result<RunResult, TerminalError> {
            self.calls.lock().unwrap().push(config);
            match &self.reply {
                Ok(result) => Ok(result.clone()),
                Err(make) => Err(make()),
            }
        }
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        executor: Arc<RecordingExecutor>,
        dispatcher: Dispatcher,
    }

    fn fixture_with(executor: RecordingExecutor) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap().join("proj");
        std::fs::create_dir_all(root.join("src/components")).unwrap();
        std::fs::write(root.join("README.md"), "# readme").unwrap();
        std::fs::write(root.join("src/index.ts"), "export {}").unwrap();

        let config = Arc::new(Config::new(&root).unwrap());
        let sessions = Arc::new(SessionStore::new(root.clone()));
        let executor = Arc::new(executor);
        let dispatcher = Dispatcher::new(config, sessions, executor.clone());
        Fixture {
            _dir: dir,
            root,
            executor,
            dispatcher,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RecordingExecutor::replying(RunResult {
            stdout: "listing\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
        }))
    }

    async fn run(f: &Fixture, session: &str, command: &str) -> CommandResult {
        f.dispatcher
            .dispatch(CommandRequest {
                session_id: session.to_string(),
                command: command.to_string(),
                cwd: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pwd_starts_at_root() {
        let f = fixture();
        let result = run(&f, "default", "pwd").await;
        assert_eq!(result.output, "/");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.cwd, "/");
        assert!(f.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn pwd_reflects_cd_and_is_idempotent() {
        let f = fixture();
        let cd = run(&f, "default", "cd src").await;
        let expected = CommandResult {
            output: String::new(),
            exit_code: 0,
            cwd: "/src".to_string(),
        };
        assert_eq!(cd, expected);

        let first = run(&f, "default", "pwd").await;
        let second = run(&f, "default", "  pwd  ").await;
        assert_eq!(first.output, "/src");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cd_cannot_leave_the_project() {
        let f = fixture();
        run(&f, "default", "cd src").await;

        let escape = run(&f, "default", "cd ../..").await;
        assert_eq!(escape.exit_code, 1);
        assert!(escape.output.contains("outside project root"), "{}", escape.output);
        assert_eq!(escape.cwd, "/src");

        let etc = run(&f, "default", "cd ../../etc").await;
        assert_eq!(etc.exit_code, 1);
        assert_eq!(run(&f, "default", "pwd").await.output, "/src");
    }

    #[tokio::test]
    async fn cd_to_absolute_path_outside_root_is_refused() {
        let f = fixture();
        let outside = f.root.parent().unwrap().display().to_string();
        let result = run(&f, "default", &format!("cd {}", outside)).await;
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("Permission denied"));
        assert_eq!(result.cwd, "/");
    }

    #[tokio::test]
    async fn cd_missing_directory_fails() {
        let f = fixture();
        let result = run(&f, "default", "cd nope").await;
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.output, "cd: nope: No such file or directory");

        let file = run(&f, "default", "cd README.md").await;
        assert_eq!(file.exit_code, 1);
        assert_eq!(file.cwd, "/");
    }

    #[tokio::test]
    async fn cd_home_forms_resolve_under_root() {
        let f = fixture();
        run(&f, "default", "cd src/components").await;
        assert_eq!(run(&f, "default", "cd ~").await.cwd, "/");
        assert_eq!(run(&f, "default", "cd ~/src/components").await.cwd, "/src/components");
        assert_eq!(run(&f, "default", "cd").await.cwd, "/");
        assert_eq!(run(&f, "default", "cd \"src\"").await.cwd, "/src");
        let absolute = format!("cd {}", f.root.join("src/components").display());
        assert_eq!(run(&f, "default", &absolute).await.cwd, "/src/components");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cd_through_symlink_out_of_root_is_refused() {
        let f = fixture();
        let outside = f.root.parent().unwrap().join("elsewhere");
        std::fs::create_dir(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, f.root.join("link")).unwrap();

        let result = run(&f, "default", "cd link").await;
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("outside project root"));
    }

    #[tokio::test]
    async fn sessions_do_not_share_cwd() {
        let f = fixture();
        run(&f, "a", "cd src").await;
        assert_eq!(run(&f, "a", "pwd").await.output, "/src");
        assert_eq!(run(&f, "b", "pwd").await.output, "/");
    }

    #[tokio::test]
    async fn dangerous_commands_never_reach_the_backend() {
        let f = fixture();
        for command in ["sudo rm -rf /", "SUDO ls", "killall node", "echo x && passwd"] {
            let rejection = f
                .dispatcher
                .dispatch(CommandRequest {
                    session_id: "default".to_string(),
                    command: command.to_string(),
                    cwd: None,
                })
                .await
                .unwrap_err();
            assert!(matches!(rejection.error, TerminalError::DangerousCommand { .. }));
            assert_eq!(rejection.error.exit_code(), 1);
            assert_eq!(rejection.cwd, "/");
        }
        assert!(f.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let f = fixture();
        let rejection = f
            .dispatcher
            .dispatch(CommandRequest {
                session_id: "default".to_string(),
                command: "   ".to_string(),
                cwd: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(rejection.error, TerminalError::InvalidCommand));
        assert!(f.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn other_commands_are_forwarded_with_session_state() {
        let f = fixture();
        run(&f, "default", "cd src").await;
        let result = run(&f, "default", "ls -la").await;
        assert_eq!(result.output, "listing\n");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.cwd, "/src");

        let calls = f.executor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].command, "ls -la");
        assert_eq!(calls[0].cwd, f.root.join("src"));
        assert_eq!(calls[0].timeout, f.dispatcher.config.command_timeout);
    }

    #[tokio::test]
    async fn cwd_override_applies_to_one_request_only() {
        let f = fixture();
        let result = f
            .dispatcher
            .dispatch(CommandRequest {
                session_id: "default".to_string(),
                command: "ls".to_string(),
                cwd: Some("/src/components".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(result.cwd, "/src/components");
        assert_eq!(f.executor.calls()[0].cwd, f.root.join("src/components"));
        assert_eq!(run(&f, "default", "pwd").await.output, "/");
    }

    #[tokio::test]
    async fn cwd_override_escaping_root_is_ignored() {
        let f = fixture();
        let result = f
            .dispatcher
            .dispatch(CommandRequest {
                session_id: "default".to_string(),
                command: "pwd".to_string(),
                cwd: Some("/../..".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(result.output, "/");
    }

    #[tokio::test]
    async fn open_rejects_missing_files_and_directories() {
        let f = fixture();
        let missing = run(&f, "default", "open nope.txt").await;
        assert_eq!(missing.exit_code, 1);
        assert_eq!(missing.output, "open: nope.txt: No such file or directory");

        let dir = run(&f, "default", "open src").await;
        assert_eq!(dir.exit_code, 1);
        assert!(dir.output.contains("use 'cd src'"));
        assert!(f.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn open_launches_companion_app() {
        let f = fixture();
        let result = run(&f, "default", "open README.md").await;
        let app = companion_app(Path::new("README.md"));
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, format!("Opened /README.md with {}", app));

        let calls = f.executor.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].command.contains(app));
        assert!(calls[0].command.contains("README.md"));
        assert_eq!(calls[0].timeout, f.dispatcher.config.open_timeout);
    }

    #[tokio::test]
    async fn backend_failures_become_results() {
        let f = fixture_with(RecordingExecutor::failing(|| TerminalError::Timeout {
            timeout_ms: 30_000,
        }));
        let result = run(&f, "default", "sleep 100").await;
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.output, "Command timed out after 30000ms");
        assert_eq!(result.cwd, "/");
    }

    #[tokio::test]
    async fn execution_failures_keep_partial_output() {
        let f = fixture_with(RecordingExecutor::failing(|| TerminalError::SpawnFailure {
            message: "read stdout: Input/output error".to_string(),
            exit_code: 5,
            output: "first half".to_string(),
        }));
        let result = run(&f, "default", "cat big.log").await;
        assert_eq!(result.exit_code, 5);
        assert_eq!(result.output, "first half\nread stdout: Input/output error");
    }

    #[tokio::test]
    async fn non_zero_exit_is_passed_through() {
        let f = fixture_with(RecordingExecutor::replying(RunResult {
            stdout: String::new(),
            stderr: "boom\n".to_string(),
            exit_code: 2,
        }));
        let result = run(&f, "default", "make").await;
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.output, "boom\n");
    }
}
