//! Extension routing and diagnostics collection

use std::path::Path;
use std::time::Instant;

use kiln_lsp::{DiagnosticSeverity, format_diagnostics};

use crate::common::{Workspace, short_timeouts, timeouts};

#[tokio::test]
async fn unsupported_extension_starts_nothing() {
    let ws = Workspace::new();
    let manager = ws.manager(vec![ws.stub("stub", &["go"], &[])], timeouts());

    assert!(manager.check_file(&ws.path("notes.md"), "# notes").await.is_empty());
    assert!(manager.check_file(&ws.path("Makefile"), "all:").await.is_empty());

    assert!(manager.running_servers().await.is_empty());
    assert!(ws.started_pids().is_empty());
}

#[tokio::test]
async fn diagnostics_are_returned_for_opened_file() {
    let ws = Workspace::new();
    let manager = ws.manager(
        vec![ws.stub("stub", &["go"], &["--publish", "2"])],
        timeouts(),
    );
    let file = ws.path("main.go");

    let diagnostics = manager.check_file(&file, "package main\n").await;
    assert_eq!(diagnostics.len(), 2);
    assert_eq!(diagnostics[0].severity(), DiagnosticSeverity::Error);
    assert_eq!(diagnostics[0].line(), 0);
    assert_eq!(diagnostics[0].col(), 2);
    assert_eq!(diagnostics[0].message(), "stub problem 0");
    assert_eq!(diagnostics[0].source(), Some("stub"));
    assert_eq!(diagnostics[1].severity(), DiagnosticSeverity::Warning);

    assert_eq!(
        format_diagnostics(&file, &diagnostics),
        "main.go:1:3: error: stub problem 0; main.go:2:3: warning: stub problem 1"
    );

    assert!(ws.wait_for_event("close ").await, "document closed after check");
    manager.shutdown().await;
}

#[tokio::test]
async fn digest_truncates_large_batches() {
    let ws = Workspace::new();
    let manager = ws.manager(
        vec![ws.stub("stub", &["py"], &["--publish", "5"])],
        timeouts(),
    );
    let file = ws.path("app.py");

    let diagnostics = manager.check_file(&file, "import os\n").await;
    assert_eq!(diagnostics.len(), 5);
    let digest = format_diagnostics(&file, &diagnostics);
    assert!(digest.ends_with("; ... and 2 more"), "{digest}");
    assert_eq!(digest.matches("app.py:").count(), 3);

    manager.shutdown().await;
}

#[tokio::test]
async fn silent_server_yields_empty_after_wait() {
    let ws = Workspace::new();
    let manager = ws.manager(
        vec![ws.stub("stub", &["go"], &["--silent"])],
        short_timeouts(),
    );

    let started = Instant::now();
    let diagnostics = manager.check_file(&ws.path("quiet.go"), "package quiet\n").await;
    assert!(diagnostics.is_empty());
    assert!(started.elapsed() >= short_timeouts().diagnostics);

    // Silence is not a failure: the instance stays registered.
    assert_eq!(manager.running_servers().await, ["stub"]);
    manager.shutdown().await;
}

#[tokio::test]
async fn foreign_document_push_is_skipped() {
    let ws = Workspace::new();
    let manager = ws.manager(
        vec![ws.stub("stub", &["ts"], &["--foreign-first", "--publish", "2"])],
        timeouts(),
    );

    let diagnostics = manager.check_file(&ws.path("index.ts"), "export {}\n").await;
    assert_eq!(diagnostics.len(), 2, "pushes for other documents are ignored");

    manager.shutdown().await;
}

#[tokio::test]
async fn extension_lookup_is_case_insensitive() {
    let ws = Workspace::new();
    let manager = ws.manager(vec![ws.stub("stub", &["go"], &[])], timeouts());

    let diagnostics = manager.check_file(&ws.path("LOUD.GO"), "package loud\n").await;
    assert_eq!(diagnostics.len(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn relative_paths_resolve_against_workspace_root() {
    let ws = Workspace::new();
    let manager = ws.manager(vec![ws.stub("stub", &["go"], &[])], timeouts());

    let diagnostics = manager.check_file(Path::new("pkg/util.go"), "package pkg\n").await;
    assert_eq!(diagnostics.len(), 1);

    let opened: Vec<_> = ws
        .events()
        .into_iter()
        .filter(|e| e.starts_with("open "))
        .collect();
    assert_eq!(opened.len(), 1);
    assert!(opened[0].starts_with("open file:///"), "{}", opened[0]);
    assert!(opened[0].ends_with("/pkg/util.go"), "{}", opened[0]);

    manager.shutdown().await;
}

#[tokio::test]
async fn server_requests_are_refused_not_ignored() {
    let ws = Workspace::new();
    let manager = ws.manager(
        vec![ws.stub("stub", &["go"], &["--request-config"])],
        timeouts(),
    );

    let diagnostics = manager.check_file(&ws.path("main.go"), "package main\n").await;
    assert_eq!(diagnostics.len(), 1);
    assert!(ws.wait_for_event("reply -32601").await);

    manager.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn analyzer_helpers_resolve_through_search_path() {
    use kiln_lsp::SearchPath;

    use crate::common::STUB;

    let ws = Workspace::new();
    // Only the search path knows `tools`; the wrapper finds its runtime by
    // bare name, the way a `#!/usr/bin/env node` script would.
    ws.script("tools", "inner-runtime", &format!("exec '{STUB}' \"$@\""));
    ws.script("tools", "wrapper-ls", "exec inner-runtime \"$@\"");
    let search = SearchPath::new(vec![ws.path("tools")]);
    let manager = ws.manager_with_search(
        vec![ws.stub_via("wrapped", "wrapper-ls", &["go"], &[])],
        &search,
        timeouts(),
    );

    assert!(manager.is_enabled());
    let diagnostics = manager.check_file(&ws.path("main.go"), "package main\n").await;
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(manager.running_servers().await, ["wrapped"]);

    manager.shutdown().await;
    assert_eq!(ws.count("exit"), 1);
}
