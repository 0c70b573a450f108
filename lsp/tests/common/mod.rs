//! Shared test utilities and fixtures
//!
//! Every test gets a scratch workspace and an event log the stub appends
//! to, so assertions can see which processes started and what they saw.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use kiln_lsp::{LspManager, LspTimeouts, SearchPath, ServerDescriptor};
use tempfile::TempDir;

/// Path to the stub language server built alongside these tests.
pub const STUB: &str = env!("CARGO_BIN_EXE_stub-analyzer");

/// Generous bounds for tests where the stub answers immediately.
pub fn timeouts() -> LspTimeouts {
    LspTimeouts {
        diagnostics: Duration::from_secs(5),
        request: Duration::from_secs(5),
        shutdown: Duration::from_secs(2),
    }
}

/// Like [`timeouts`], but gives up on diagnostics quickly. For tests that
/// expect silence.
pub fn short_timeouts() -> LspTimeouts {
    LspTimeouts {
        diagnostics: Duration::from_millis(300),
        ..timeouts()
    }
}

pub struct Workspace {
    dir: TempDir,
    log: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("stub-events.log");
        Self { dir, log }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// A stub descriptor named `name` that logs to this workspace.
    pub fn stub(&self, name: &str, extensions: &[&str], flags: &[&str]) -> ServerDescriptor {
        let mut args: Vec<String> = flags.iter().map(ToString::to_string).collect();
        args.push("--log".to_string());
        args.push(self.log.display().to_string());
        ServerDescriptor::new(name, STUB, args, extensions)
    }

    /// Like [`Workspace::stub`], launched through `command` instead of the
    /// stub binary itself.
    pub fn stub_via(
        &self,
        name: &str,
        command: &str,
        extensions: &[&str],
        flags: &[&str],
    ) -> ServerDescriptor {
        let stub = self.stub(name, extensions, flags);
        ServerDescriptor::new(name, command, stub.args().to_vec(), extensions)
    }

    pub fn manager(&self, descriptors: Vec<ServerDescriptor>, timeouts: LspTimeouts) -> LspManager {
        self.manager_with_search(descriptors, &SearchPath::new(Vec::new()), timeouts)
    }

    pub fn manager_with_search(
        &self,
        descriptors: Vec<ServerDescriptor>,
        search: &SearchPath,
        timeouts: LspTimeouts,
    ) -> LspManager {
        LspManager::new(self.root(), descriptors, search, timeouts)
    }

    /// Write an executable shell script `name` into `dir`.
    #[cfg(unix)]
    pub fn script(&self, dir: &str, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let dir = self.path(dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Logged events, without the pid prefix.
    pub fn events(&self) -> Vec<String> {
        self.pid_events().into_iter().map(|(_, e)| e).collect()
    }

    /// Logged events as `(pid, event)`.
    pub fn pid_events(&self) -> Vec<(u32, String)> {
        let Ok(text) = std::fs::read_to_string(&self.log) else {
            return Vec::new();
        };
        text.lines()
            .filter_map(|line| {
                let (pid, event) = line.split_once(' ')?;
                Some((pid.parse().ok()?, event.to_string()))
            })
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    /// Pids of every stub process that started.
    pub fn started_pids(&self) -> Vec<u32> {
        self.pid_events()
            .into_iter()
            .filter(|(_, e)| e == "start")
            .map(|(pid, _)| pid)
            .collect()
    }

    /// Poll the log until `pid` logs `event`.
    pub async fn wait_for_pid_event(&self, pid: u32, event: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.pid_events().iter().any(|(p, e)| *p == pid && e == event) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Poll the log until an event starting with `prefix` shows up.
    pub async fn wait_for_event(&self, prefix: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.events().iter().any(|e| e.starts_with(prefix)) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}
