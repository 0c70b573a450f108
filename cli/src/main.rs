//! kiln CLI - binary entry point.
//!
//! ```text
//! kiln check <FILE>... [--root DIR]   one digest line per file
//! kiln servers [--root DIR]           analyzers found on this machine
//! ```
//!
//! Logs go to `~/.kiln/logs/kiln.log`; stdout carries only results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{
    env,
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Mutex,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use kiln_config::KilnConfig;
use kiln_lsp::{LspManager, format_diagnostics};

#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(about = "Language server diagnostics for edited files")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check files and print a diagnostics digest for each.
    Check {
        /// Files to check. Their current on-disk content is sent.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Workspace root handed to the analyzers (default: current directory).
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// List the analyzers found on this machine and the extensions they serve.
    Servers {
        /// Workspace root used to resolve relative commands.
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_kiln_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // No log file: prefer no logs over mixing them into the digest output.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_kiln_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in kiln_log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn kiln_log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.kiln/logs/kiln.log
    if let Some(config_path) = KilnConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("kiln.log"));
    }

    // Fallback: ./.kiln/logs/kiln.log
    candidates.push(PathBuf::from(".kiln").join("logs").join("kiln.log"));

    candidates
}

fn workspace_root(root: Option<PathBuf>) -> Result<PathBuf> {
    match root {
        Some(root) => Ok(root),
        None => env::current_dir().context("determining the current directory"),
    }
}

/// `file` as given on the command line, anchored to the current directory.
///
/// The same absolute path is read and reported to the analyzer, whatever
/// `--root` says.
fn input_path(file: &Path) -> Result<PathBuf> {
    std::path::absolute(file).with_context(|| format!("resolving {}", file.display()))
}

/// One output line for `path`.
fn digest_line(path: &Path, digest: &str) -> String {
    if digest.is_empty() {
        format!("{}: no diagnostics", path.display())
    } else {
        digest.to_string()
    }
}

async fn run_check(manager: &LspManager, files: &[PathBuf]) -> ExitCode {
    let mut status = ExitCode::SUCCESS;

    for file in files {
        let path = match input_path(file) {
            Ok(path) => path,
            Err(e) => {
                eprintln!("{e:#}");
                status = ExitCode::FAILURE;
                continue;
            }
        };
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                eprintln!("{}: {e}", file.display());
                status = ExitCode::FAILURE;
                continue;
            }
        };

        let diagnostics = manager.check_file(&path, &content).await;
        if diagnostics.iter().any(|d| d.severity().is_error()) {
            status = ExitCode::FAILURE;
        }
        println!(
            "{}",
            digest_line(file, &format_diagnostics(file, &diagnostics))
        );
    }

    status
}

fn list_servers(manager: &LspManager) {
    if !manager.is_enabled() {
        println!("No language servers found.");
        return;
    }
    for server in manager.servers() {
        let extensions: Vec<String> = server
            .extensions()
            .iter()
            .map(|e| format!(".{e}"))
            .collect();
        println!(
            "{:<28} {:<20} {}",
            server.name(),
            extensions.join(" "),
            server.command().display()
        );
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing();

    let config = KilnConfig::load();

    match args.command {
        Command::Check { files, root } => {
            let root = workspace_root(root)?;
            let manager = LspManager::from_config(&root, &config.lsp());
            let status = run_check(&manager, &files).await;
            manager.shutdown().await;
            Ok(status)
        }
        Command::Servers { root } => {
            let root = workspace_root(root)?;
            let manager = LspManager::from_config(&root, &config.lsp());
            list_servers(&manager);
            Ok(ExitCode::SUCCESS)
        }
    }
}
