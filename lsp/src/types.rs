//! Public types consumed by the rest of kiln.
//!
//! These types define the interface between `kiln-lsp` and its callers.
//! Callers build an [`LspConfig`] (usually via `kiln-config`), hand it to
//! the manager, and receive [`Diagnostic`]s back from each check.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_DIAGNOSTICS_WAIT_MS: u64 = 5_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 2_000;

fn default_enabled() -> bool {
    true
}

/// Configuration for the LSP client subsystem.
#[derive(Debug, Clone, Deserialize)]
pub struct LspConfig {
    /// Whether diagnostics are collected at all. Default: true.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Extra or overriding server definitions, keyed by name (e.g. "gopls").
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    /// Names of servers that must never be started.
    #[serde(default)]
    pub disabled: Vec<String>,
    /// Directories searched after `PATH` and the well-known toolchain dirs.
    #[serde(default)]
    pub extra_search_paths: Vec<PathBuf>,
    #[serde(default)]
    pub diagnostics_wait_ms: Option<u64>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub shutdown_timeout_ms: Option<u64>,
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            servers: HashMap::new(),
            disabled: Vec::new(),
            extra_search_paths: Vec::new(),
            diagnostics_wait_ms: None,
            request_timeout_ms: None,
            shutdown_timeout_ms: None,
        }
    }
}

impl LspConfig {
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Timeouts with unset fields filled from the defaults.
    #[must_use]
    pub fn timeouts(&self) -> LspTimeouts {
        let defaults = LspTimeouts::default();
        LspTimeouts {
            diagnostics: self
                .diagnostics_wait_ms
                .map_or(defaults.diagnostics, Duration::from_millis),
            request: self
                .request_timeout_ms
                .map_or(defaults.request, Duration::from_millis),
            shutdown: self
                .shutdown_timeout_ms
                .map_or(defaults.shutdown, Duration::from_millis),
        }
    }
}

/// Configuration for a single language server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Executable command (e.g. "gopls"), bare name or path.
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// File extensions this server handles, with or without the dot.
    #[serde(default)]
    pub extensions: Vec<String>,
}

/// Bounds on every blocking LSP operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LspTimeouts {
    /// How long a check waits for a `publishDiagnostics` push.
    pub diagnostics: Duration,
    /// How long a request waits for its response.
    pub request: Duration,
    /// How long `shutdown` may take before the process is killed.
    pub shutdown: Duration,
}

impl Default for LspTimeouts {
    fn default() -> Self {
        Self {
            diagnostics: Duration::from_millis(DEFAULT_DIAGNOSTICS_WAIT_MS),
            request: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            shutdown: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        }
    }
}

/// Static launch configuration for one external analyzer.
///
/// Plain data: the manager indexes descriptors by extension and never
/// mutates them after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    name: String,
    command: PathBuf,
    args: Vec<String>,
    /// Lowercase, without the leading dot.
    extensions: Vec<String>,
}

impl ServerDescriptor {
    pub fn new<I, S>(
        name: impl Into<String>,
        command: impl Into<PathBuf>,
        args: I,
        extensions: &[&str],
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            extensions: extensions.iter().map(|e| normalize_extension(e)).collect(),
        }
    }

    /// Build a descriptor from a config entry named `name`.
    #[must_use]
    pub fn from_config(name: &str, config: &ServerConfig) -> Self {
        Self {
            name: name.to_string(),
            command: PathBuf::from(&config.command),
            args: config.args.clone(),
            extensions: config
                .extensions
                .iter()
                .map(|e| normalize_extension(e))
                .collect(),
        }
    }

    /// Copy of this descriptor launching `program` instead of the bare command.
    #[must_use]
    pub fn with_command(&self, program: PathBuf) -> Self {
        Self {
            command: program,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn command(&self) -> &Path {
        &self.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    #[must_use]
    pub fn handles(&self, extension: &str) -> bool {
        let extension = normalize_extension(extension);
        self.extensions.iter().any(|e| *e == extension)
    }
}

/// Lowercase an extension and strip a leading dot: `".TSX"` → `"tsx"`.
#[must_use]
pub fn normalize_extension(extension: &str) -> String {
    extension.trim_start_matches('.').to_ascii_lowercase()
}

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    ///
    /// Returns `None` for values outside the LSP-defined range.
    /// Callers (boundary code) decide the fallback policy.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// A 0-indexed position in a text document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

/// A half-open range between two positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    #[must_use]
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }
}

/// A single diagnostic from a language server.
///
/// Fields are private; external consumers read via accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    range: Range,
    severity: DiagnosticSeverity,
    message: String,
    /// Source of the diagnostic (e.g. "rustc", "Pyright").
    source: Option<String>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(
        range: Range,
        severity: DiagnosticSeverity,
        message: String,
        source: Option<String>,
    ) -> Self {
        Self {
            range,
            severity,
            message,
            source,
        }
    }

    #[must_use]
    pub fn range(&self) -> Range {
        self.range
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// 0-indexed start line.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.range.start.line
    }

    /// 0-indexed start column.
    #[must_use]
    pub fn col(&self) -> u32 {
        self.range.start.character
    }
}

/// Lifecycle of one analyzer process. No transition leaves `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Spawned, handshake in flight.
    Starting,
    /// Handshake complete, accepting documents.
    Running,
    /// Shut down, killed, or the connection dropped.
    Stopped,
}
