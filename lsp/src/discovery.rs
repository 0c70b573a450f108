//! Locating analyzer executables.
//!
//! Editors and version managers install language servers into per-user
//! toolchain directories that are often missing from a non-login `PATH`.
//! [`SearchPath`] widens the lookup without touching the process
//! environment; resolved absolute paths are what gets spawned, and the
//! widened list becomes the child's `PATH` so the analyzer's own helpers
//! (`cargo`, `node`, ...) resolve too.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::types::ServerDescriptor;

/// Ordered list of directories searched for analyzer commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPath {
    dirs: Vec<PathBuf>,
}

impl SearchPath {
    /// `PATH`, then the well-known toolchain directories that exist, then
    /// `extra`.
    #[must_use]
    pub fn from_env(extra: &[PathBuf]) -> Self {
        let mut dirs: Vec<PathBuf> = env::var_os("PATH")
            .map(|path| env::split_paths(&path).collect())
            .unwrap_or_default();

        for dir in toolchain_dirs() {
            if dir.is_dir() && !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
        for dir in extra {
            if !dirs.contains(dir) {
                dirs.push(dir.clone());
            }
        }

        Self { dirs }
    }

    /// Search exactly `dirs`, in order.
    #[must_use]
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    #[must_use]
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    fn joined(&self) -> Option<OsString> {
        env::join_paths(&self.dirs).ok()
    }

    /// Value for a child's `PATH`. `None` when there is nothing to search,
    /// in which case the child inherits ours.
    #[must_use]
    pub fn env_value(&self) -> Option<OsString> {
        if self.dirs.is_empty() {
            return None;
        }
        self.joined()
    }

    /// Absolute path of `command`, or `None` if it cannot be run.
    ///
    /// Commands containing a path separator are resolved relative to `cwd`
    /// and not searched for.
    #[must_use]
    pub fn resolve(&self, command: &Path, cwd: &Path) -> Option<PathBuf> {
        match which::which_in(command, self.joined(), cwd) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::trace!("{} not resolvable: {e}", command.display());
                None
            }
        }
    }
}

fn toolchain_dirs() -> Vec<PathBuf> {
    let mut found = Vec::new();
    if let Some(home) = dirs::home_dir() {
        found.push(home.join("go").join("bin"));
        found.push(home.join(".cargo").join("bin"));
        found.push(home.join(".local").join("bin"));
    }
    if let Some(gopath) = env::var_os("GOPATH").filter(|p| !p.is_empty()) {
        found.push(PathBuf::from(gopath).join("bin"));
    }
    if cfg!(target_os = "macos") {
        found.push(PathBuf::from("/opt/homebrew/bin"));
        found.push(PathBuf::from("/usr/local/bin"));
    }
    found
}

/// Built-in analyzers, tried in this order.
#[must_use]
pub fn known_servers() -> Vec<ServerDescriptor> {
    vec![
        ServerDescriptor::new("gopls", "gopls", ["serve"], &["go"]),
        ServerDescriptor::new(
            "typescript-language-server",
            "typescript-language-server",
            ["--stdio"],
            &["ts", "tsx", "js", "jsx"],
        ),
        ServerDescriptor::new(
            "pyright",
            "pyright-langserver",
            ["--stdio"],
            &["py"],
        ),
        ServerDescriptor::new(
            "rust-analyzer",
            "rust-analyzer",
            Vec::<String>::new(),
            &["rs"],
        ),
    ]
}
