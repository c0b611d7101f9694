//! Mapping between the IDE's virtual `/`-rooted namespace and real paths.

use crate::sandbox::SandboxGuard;
use std::path::{Component, Path, PathBuf};

/// Pure, stateless translator between virtual and real paths.
#[derive(Debug, Clone)]
pub struct PathTranslator {
    guard: SandboxGuard,
}

impl PathTranslator {
    pub fn new(guard: SandboxGuard) -> Self {
        Self { guard }
    }

    pub fn root(&self) -> &Path {
        self.guard.root()
    }

    /// Virtual path to real path.
    ///
    /// Anything carrying a drive designator is already a real path and is
    /// returned as is. Empty input maps to the project root.
    pub fn to_real(&self, virtual_path: &str) -> PathBuf {
        if has_drive_designator(virtual_path) {
            return PathBuf::from(virtual_path);
        }
        let mut real = self.root().to_path_buf();
        for segment in virtual_path.split('/').filter(|s| !s.is_empty()) {
            real.push(segment);
        }
        real
    }

    /// Real path to virtual path.
    ///
    /// Paths outside the sandbox come back unchanged so they can still be
    /// displayed.
    pub fn to_virtual(&self, real: &Path) -> String {
        let Some(relative) = self.guard.relative_to_root(real) else {
            return real.to_string_lossy().into_owned();
        };
        let segments: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        format!("/{}", segments.join("/"))
    }
}

/// `C:` style prefix, as found on Windows paths.
fn has_drive_designator(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
