//! `LspManager` facade, the public API consumed by callers.
//!
//! Callers interact with language servers through this single type. It
//! decides which analyzers are available, starts them lazily on the first
//! file of a matching extension, and restarts them after a crash.
//!
//! The registry lock is held only around map access. Starting a process,
//! checking a document and stopping a process all happen outside it.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::discovery::{SearchPath, known_servers};
use crate::protocol;
use crate::server::RunningServer;
use crate::types::{Diagnostic, LspConfig, LspTimeouts, ServerDescriptor, normalize_extension};

/// Index descriptors by every extension they claim.
///
/// Descriptors are visited in name order; the first claim on an extension
/// wins.
fn build_extension_map(
    descriptors: &[Arc<ServerDescriptor>],
) -> HashMap<String, Arc<ServerDescriptor>> {
    let mut sorted: Vec<&Arc<ServerDescriptor>> = descriptors.iter().collect();
    sorted.sort_by(|a, b| a.name().cmp(b.name()));

    let mut extension_map: HashMap<String, Arc<ServerDescriptor>> = HashMap::new();
    for descriptor in sorted {
        for ext in descriptor.extensions() {
            if let Some(existing) = extension_map.get(ext) {
                tracing::warn!(
                    "Multiple LSP servers configured for extension '{ext}': '{}' and '{}'. Using '{}'.",
                    existing.name(),
                    descriptor.name(),
                    existing.name()
                );
                continue;
            }
            extension_map.insert(ext.clone(), descriptor.clone());
        }
    }
    extension_map
}

/// Built-in analyzers merged with configured ones, minus disabled names.
fn configured_descriptors(config: &LspConfig) -> Vec<ServerDescriptor> {
    let mut by_name: BTreeMap<String, ServerDescriptor> = known_servers()
        .into_iter()
        .map(|d| (d.name().to_string(), d))
        .collect();
    for (name, server) in &config.servers {
        by_name.insert(name.clone(), ServerDescriptor::from_config(name, server));
    }
    for name in &config.disabled {
        if by_name.remove(name).is_some() {
            tracing::debug!("LSP server '{name}' disabled by config");
        }
    }
    by_name.into_values().collect()
}

/// Public facade for the LSP client subsystem.
///
/// One manager per working directory. Construction only probes for
/// executables; nothing is spawned until a file needs checking.
pub struct LspManager {
    workspace_root: PathBuf,
    timeouts: LspTimeouts,
    /// Where commands were resolved; also the started processes' `PATH`.
    search: SearchPath,
    /// Descriptors whose command resolved, with resolved program paths.
    available: Vec<Arc<ServerDescriptor>>,
    /// Maps a lowercase extension (e.g. "tsx") to the descriptor serving it.
    extension_map: HashMap<String, Arc<ServerDescriptor>>,
    /// Live instances keyed by extension. One instance appears under every
    /// extension its descriptor claims.
    servers: Mutex<HashMap<String, Arc<RunningServer>>>,
}

impl LspManager {
    /// Build a manager from `descriptors`, keeping those whose command
    /// resolves on `search`.
    ///
    /// With nothing available the manager is still valid and every check
    /// returns no diagnostics.
    #[must_use]
    pub fn new(
        workspace_root: &Path,
        descriptors: Vec<ServerDescriptor>,
        search: &SearchPath,
        timeouts: LspTimeouts,
    ) -> Self {
        let workspace_root = protocol::normalize_path(
            &std::path::absolute(workspace_root).unwrap_or_else(|_| workspace_root.to_path_buf()),
        );

        let mut available = Vec::new();
        for descriptor in descriptors {
            match search.resolve(descriptor.command(), &workspace_root) {
                Some(program) => {
                    tracing::info!(
                        "LSP: found {} at {}",
                        descriptor.name(),
                        program.display()
                    );
                    available.push(Arc::new(descriptor.with_command(program)));
                }
                None => {
                    tracing::info!(
                        "LSP: {} not found on search path, skipping",
                        descriptor.command().display()
                    );
                }
            }
        }

        let extension_map = build_extension_map(&available);
        Self {
            workspace_root,
            timeouts,
            search: search.clone(),
            available,
            extension_map,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Build a manager from user configuration.
    ///
    /// A disabled config yields a manager with no analyzers.
    #[must_use]
    pub fn from_config(workspace_root: &Path, config: &LspConfig) -> Self {
        let search = SearchPath::from_env(&config.extra_search_paths);
        let descriptors = if config.enabled() {
            configured_descriptors(config)
        } else {
            tracing::info!("LSP diagnostics disabled by config");
            Vec::new()
        };
        Self::new(workspace_root, descriptors, &search, config.timeouts())
    }

    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Whether any analyzer is available.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.available.is_empty()
    }

    /// Available analyzers, in discovery order.
    pub fn servers(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.available.iter().map(AsRef::as_ref)
    }

    /// Names of the analyzers with a live process, sorted.
    pub async fn running_servers(&self) -> Vec<String> {
        let servers = self.servers.lock().await;
        let mut names: Vec<String> = servers
            .values()
            .filter(|s| s.is_alive())
            .map(|s| s.name().to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Diagnostics for `path` with the given in-memory `content`.
    ///
    /// Never fails: unsupported files, missing analyzers, start failures,
    /// crashes and silent servers all yield an empty list. Relative paths
    /// are taken relative to the workspace root.
    pub async fn check_file(&self, path: &Path, content: &str) -> Vec<Diagnostic> {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return Vec::new();
        };
        let ext = normalize_extension(ext);
        let Some(descriptor) = self.extension_map.get(&ext) else {
            return Vec::new();
        };

        let path = self.workspace_root.join(path);
        let Some(server) = self.server_for(&ext, descriptor).await else {
            return Vec::new();
        };

        match server.check_file(&path, content).await {
            Ok(diagnostics) => {
                tracing::debug!(
                    "LSP '{}': {} diagnostic(s) for {}",
                    server.name(),
                    diagnostics.len(),
                    path.display()
                );
                diagnostics
            }
            Err(e) if e.is_fatal() => {
                tracing::warn!(
                    "LSP '{}' failed checking {}: {e}; evicting",
                    server.name(),
                    path.display()
                );
                self.evict(&server).await;
                server.stop().await;
                Vec::new()
            }
            Err(e) => {
                tracing::warn!("LSP check of {} skipped: {e}", path.display());
                Vec::new()
            }
        }
    }

    /// The live instance for `ext`, starting one if needed.
    async fn server_for(
        &self,
        ext: &str,
        descriptor: &Arc<ServerDescriptor>,
    ) -> Option<Arc<RunningServer>> {
        let registered = self.servers.lock().await.get(ext).cloned();
        if let Some(server) = registered {
            if server.is_alive() {
                return Some(server);
            }
            tracing::warn!("LSP '{}' is no longer running, restarting", server.name());
            self.evict(&server).await;
            // Reaps the process; the read loop already marked it stopped.
            server.stop().await;
        }

        tracing::info!("Starting LSP server '{}'...", descriptor.name());
        let server = match RunningServer::start(
            descriptor.clone(),
            &self.workspace_root,
            &self.search,
            self.timeouts,
        )
        .await
        {
            Ok(server) => Arc::new(server),
            Err(e) => {
                tracing::warn!("Failed to start LSP server '{}': {e}", descriptor.name());
                return None;
            }
        };

        let mut servers = self.servers.lock().await;
        if let Some(existing) = servers.get(ext).filter(|s| s.is_alive()).cloned() {
            drop(servers);
            tracing::debug!(
                "LSP '{}' was started concurrently, discarding duplicate",
                descriptor.name()
            );
            tokio::spawn(async move { server.stop().await });
            return Some(existing);
        }

        for claimed in descriptor.extensions() {
            if self
                .extension_map
                .get(claimed)
                .is_some_and(|d| Arc::ptr_eq(d, descriptor))
            {
                servers.insert(claimed.clone(), server.clone());
            }
        }
        tracing::info!("LSP server '{}' started successfully", descriptor.name());
        Some(server)
    }

    /// Remove `server` from every extension it is registered under.
    async fn evict(&self, server: &Arc<RunningServer>) {
        self.servers
            .lock()
            .await
            .retain(|_, registered| !Arc::ptr_eq(registered, server));
    }

    /// Gracefully shut down all servers. Each process is stopped once,
    /// however many extensions it served.
    pub async fn shutdown(&self) {
        let registered = std::mem::take(&mut *self.servers.lock().await);

        let mut distinct: Vec<Arc<RunningServer>> = Vec::new();
        for server in registered.into_values() {
            if !distinct.iter().any(|s| Arc::ptr_eq(s, &server)) {
                distinct.push(server);
            }
        }

        for server in distinct {
            tracing::info!("Shutting down LSP server '{}'...", server.name());
            server.stop().await;
        }
    }
}
