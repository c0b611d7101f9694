//! Runtime configuration shared by every request.

use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_OPEN_TIMEOUT_MS: u64 = 5_000;

/// Immutable process-wide settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Canonical directory every sandboxed operation is bounded by.
    pub project_root: PathBuf,
    pub command_timeout: Duration,
    pub max_output_bytes: usize,
    /// Timeout for launching a companion application from `open`.
    pub open_timeout: Duration,
    /// Idle sessions older than this are evicted. `None` keeps them forever.
    pub session_ttl: Option<Duration>,
}

impl Config {
    /// Build a config with default limits for an existing project root.
    pub fn new(project_root: &Path) -> Result<Self, String> {
        let project_root = project_root
            .canonicalize()
            .map_err(|e| format!("project root {}: {}", project_root.display(), e))?;
        if !project_root.is_dir() {
            return Err(format!(
                "project root {} is not a directory",
                project_root.display()
            ));
        }
        Ok(Self {
            project_root,
            command_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            open_timeout: Duration::from_millis(DEFAULT_OPEN_TIMEOUT_MS),
            session_ttl: None,
        })
    }

    pub fn with_limits(mut self, timeout_ms: u64, max_output_bytes: usize) -> Self {
        self.command_timeout = Duration::from_millis(timeout_ms);
        self.max_output_bytes = max_output_bytes;
        self
    }

    pub fn with_open_timeout(mut self, timeout_ms: u64) -> Self {
        self.open_timeout = Duration::from_millis(timeout_ms);
        self
    }

    /// A TTL of zero disables eviction.
    pub fn with_session_ttl(mut self, ttl_secs: u64) -> Self {
        self.session_ttl = (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs));
        self
    }
}
