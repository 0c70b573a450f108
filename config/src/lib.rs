//! Configuration loading for kiln.
//!
//! Settings live in `~/.kiln/config.toml`. A missing file means defaults;
//! a broken one is reported and also means defaults, so a typo never takes
//! diagnostics down with it.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use kiln_lsp::LspConfig;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct KilnConfig {
    /// LSP client configuration for language server diagnostics.
    pub lsp: Option<LspConfig>,
}

impl KilnConfig {
    /// Load from the default location, falling back to defaults on any
    /// problem.
    #[must_use]
    pub fn load() -> Self {
        let Some(path) = config_path() else {
            return Self::default();
        };
        match Self::load_from(&path) {
            Ok(Some(config)) => config,
            Ok(None) => Self::default(),
            Err(err) => {
                tracing::warn!("Ignoring config at {}: {err:#}", path.display());
                Self::default()
            }
        }
    }

    /// Load from `path`. `Ok(None)` when the file does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("parsing {}", path.display()))
            .map(Some)
    }

    /// Parse TOML text and expand `${VAR}` references in server launch
    /// settings.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        if let Some(lsp) = config.lsp.as_mut() {
            for server in lsp.servers.values_mut() {
                server.command = expand_env_vars(&server.command);
                for arg in &mut server.args {
                    *arg = expand_env_vars(arg);
                }
            }
            for dir in &mut lsp.extra_search_paths {
                if let Some(text) = dir.to_str() {
                    *dir = PathBuf::from(expand_env_vars(text));
                }
            }
        }
        Ok(config)
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// The LSP section, or its defaults when absent.
    #[must_use]
    pub fn lsp(&self) -> LspConfig {
        self.lsp.clone().unwrap_or_default()
    }
}

/// Replace `${VAR}` with the value of `VAR`, or nothing when unset.
/// An unclosed `${` is kept literally.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".kiln").join("config.toml"))
}
