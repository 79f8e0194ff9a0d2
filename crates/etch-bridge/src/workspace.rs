//! Workspace root resolution.
//!
//! The debuggee executable lives at `<workspace-root>/etch`. Which roots exist is
//! the host's business; the session only asks through [`WorkspaceResolver`].

use std::path::{Path, PathBuf};

/// Maps a program path to the project root that owns it.
pub trait WorkspaceResolver: Send + Sync {
    /// Root containing `path`, if any.
    fn owning_root(&self, path: &Path) -> Option<PathBuf>;

    /// First known root, used when no root owns the program.
    fn first_root(&self) -> Option<PathBuf>;

    fn resolve(&self, path: &Path) -> Option<PathBuf> {
        self.owning_root(path).or_else(|| self.first_root())
    }
}

/// Fixed list of workspace roots, in priority order.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceRoots {
    roots: Vec<PathBuf>,
}

impl WorkspaceRoots {
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            roots: roots.into_iter().collect(),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

impl WorkspaceResolver for WorkspaceRoots {
    /// Deepest root that is a prefix of `path` (nested roots win).
    fn owning_root(&self, path: &Path) -> Option<PathBuf> {
        self.roots
            .iter()
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| root.components().count())
            .cloned()
    }

    fn first_root(&self) -> Option<PathBuf> {
        self.roots.first().cloned()
    }
}
