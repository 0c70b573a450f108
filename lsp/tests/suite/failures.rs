//! Degraded paths: every failure collapses to "no diagnostics"

use std::time::{Duration, Instant};

use kiln_lsp::{LspTimeouts, ServerDescriptor};

use crate::common::{Workspace, timeouts};

#[tokio::test]
async fn missing_command_is_skipped() {
    let ws = Workspace::new();
    let manager = ws.manager(
        vec![ServerDescriptor::new(
            "ghost",
            "definitely-not-an-analyzer",
            Vec::<String>::new(),
            &["go"],
        )],
        timeouts(),
    );

    assert!(!manager.is_enabled());
    assert!(manager.check_file(&ws.path("main.go"), "package main\n").await.is_empty());
}

#[tokio::test]
async fn failed_initialize_yields_empty() {
    let ws = Workspace::new();
    let manager = ws.manager(
        vec![ws.stub("stub", &["go"], &["--fail-initialize"])],
        timeouts(),
    );

    assert!(manager.check_file(&ws.path("main.go"), "package main\n").await.is_empty());
    assert_eq!(ws.count("initialize"), 1);
    assert_eq!(ws.count("initialized"), 0);
    assert!(manager.running_servers().await.is_empty());

    // Start failures are per call; the next check tries again.
    assert!(manager.check_file(&ws.path("main.go"), "package main\n").await.is_empty());
    assert_eq!(ws.count("initialize"), 2);
}

#[tokio::test]
async fn hanging_initialize_times_out() {
    let ws = Workspace::new();
    let bounds = LspTimeouts {
        request: Duration::from_millis(300),
        ..timeouts()
    };
    let manager = ws.manager(
        vec![ws.stub("stub", &["go"], &["--hang-on", "initialize"])],
        bounds,
    );

    let started = Instant::now();
    assert!(manager.check_file(&ws.path("main.go"), "package main\n").await.is_empty());
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(manager.running_servers().await.is_empty());
}

#[tokio::test]
async fn undecodable_frame_is_tolerated() {
    let ws = Workspace::new();
    let manager = ws.manager(
        vec![ws.stub("stub", &["go"], &["--garbage-before-init"])],
        timeouts(),
    );

    let diagnostics = manager.check_file(&ws.path("main.go"), "package main\n").await;
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(manager.running_servers().await, ["stub"]);

    manager.shutdown().await;
}

#[tokio::test]
async fn crash_on_every_open_never_errors() {
    let ws = Workspace::new();
    let manager = ws.manager(
        vec![ws.stub("stub", &["go"], &["--crash-on-open"])],
        timeouts(),
    );

    for _ in 0..2 {
        let started = Instant::now();
        assert!(manager.check_file(&ws.path("main.go"), "package main\n").await.is_empty());
        assert!(
            started.elapsed() < timeouts().diagnostics,
            "a crash ends the wait early"
        );
    }
    assert_eq!(ws.count("crash"), 2);
    assert!(manager.running_servers().await.is_empty());
}

#[tokio::test]
async fn hanging_shutdown_falls_back_to_kill() {
    let ws = Workspace::new();
    let bounds = LspTimeouts {
        shutdown: Duration::from_millis(300),
        ..timeouts()
    };
    let manager = ws.manager(
        vec![ws.stub("stub", &["go"], &["--hang-on", "shutdown"])],
        bounds,
    );

    assert_eq!(manager.check_file(&ws.path("main.go"), "package main\n").await.len(), 1);

    let started = Instant::now();
    manager.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(ws.wait_for_event("hang shutdown").await);
    assert_eq!(ws.count("exit"), 0, "never reached the exit notification");
}
