//! Project-root sandbox and the dangerous-command denylist.

use std::path::{Component, Path, PathBuf};

/// Substrings that get a command rejected before it reaches a shell.
///
/// Matching is case-insensitive substring containment. This is a first line
/// of defense only: it blocks harmless commands that happen to contain a
/// pattern, and misses dangerous ones phrased differently.
const DANGEROUS_PATTERNS: &[&str] = &[
    // full-filesystem recursive delete
    "rm -rf /",
    "rm -fr /",
    "rm -r -f /",
    "rm --recursive --force /",
    // privilege escalation
    "sudo ",
    "su -",
    "su root",
    "doas ",
    // ownership / permission changes on system paths
    "chmod 777 /",
    "chmod -r 777 /",
    "chown root",
    "chown -r root",
    "chmod u+s",
    // password and account manipulation
    "passwd",
    "useradd",
    "userdel",
    "usermod",
    "adduser",
    "deluser",
    // mass process termination
    "killall",
    "pkill -9",
    "kill -9 -1",
    "kill -9 0",
];

/// Return the denylist entry a command matches, if any.
pub fn dangerous_pattern(command: &str) -> Option<&'static str> {
    let lowered = command.to_lowercase();
    DANGEROUS_PATTERNS
        .iter()
        .copied()
        .find(|pattern| lowered.contains(pattern))
}

/// Decides whether real filesystem paths lie inside the project root.
#[derive(Debug, Clone)]
pub struct SandboxGuard {
    root: PathBuf,
}

impl SandboxGuard {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: lexical_normalize(&root.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True when `path`, relative to the root, neither climbs out through
    /// `..` nor lands on another root or volume. Relative inputs are taken
    /// relative to the root itself.
    pub fn is_within_root(&self, path: &Path) -> bool {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        self.relative_to_root(&absolute).is_some()
    }

    /// Path relative to the root, or `None` when it escapes the sandbox.
    pub fn relative_to_root(&self, path: &Path) -> Option<PathBuf> {
        let normalized = lexical_normalize(path);
        normalized
            .strip_prefix(&self.root)
            .ok()
            .map(Path::to_path_buf)
    }
}

/// Resolve `.` and `..` without touching the filesystem.
///
/// `..` never climbs above the path's root, matching how the kernel treats
/// `/..`.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            Component::Normal(segment) => out.push(segment),
        }
    }
    out
}
