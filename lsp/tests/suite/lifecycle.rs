//! Start, reuse, restart and shutdown of analyzer processes

use std::time::{Duration, Instant};

use kiln_lsp::LspTimeouts;

use crate::common::{Workspace, short_timeouts, timeouts};

#[tokio::test]
async fn instance_is_reused_across_checks() {
    let ws = Workspace::new();
    let manager = ws.manager(vec![ws.stub("stub", &["go"], &[])], timeouts());

    for name in ["a.go", "b.go", "c.go"] {
        assert_eq!(manager.check_file(&ws.path(name), "package x\n").await.len(), 1);
    }
    assert_eq!(ws.started_pids().len(), 1);
    assert_eq!(ws.count("initialize"), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn shared_instance_is_stopped_exactly_once() {
    let ws = Workspace::new();
    let manager = ws.manager(
        vec![ws.stub("typescript", &["ts", "tsx"], &[])],
        timeouts(),
    );

    assert_eq!(manager.check_file(&ws.path("a.ts"), "let a = 1;\n").await.len(), 1);
    assert_eq!(manager.check_file(&ws.path("b.tsx"), "<div />\n").await.len(), 1);
    assert_eq!(ws.started_pids().len(), 1, ".ts and .tsx share one process");
    assert_eq!(manager.running_servers().await, ["typescript"]);

    manager.shutdown().await;
    assert_eq!(ws.count("shutdown"), 1);
    assert_eq!(ws.count("exit"), 1);
    assert!(manager.running_servers().await.is_empty());

    // A second shutdown has nothing left to stop.
    manager.shutdown().await;
    assert_eq!(ws.count("shutdown"), 1);
}

#[tokio::test]
async fn distinct_descriptors_get_distinct_processes() {
    let ws = Workspace::new();
    let manager = ws.manager(
        vec![ws.stub("go-stub", &["go"], &[]), ws.stub("py-stub", &["py"], &[])],
        timeouts(),
    );

    let go_file = ws.path("main.go");
    let py_file = ws.path("main.py");
    let (go, py) = tokio::join!(
        manager.check_file(&go_file, "package main\n"),
        manager.check_file(&py_file, "print()\n"),
    );
    assert_eq!(go.len(), 1);
    assert_eq!(py.len(), 1);
    assert_eq!(manager.running_servers().await, ["go-stub", "py-stub"]);

    manager.shutdown().await;
    assert_eq!(ws.count("exit"), 2);
}

#[tokio::test]
async fn concurrent_first_checks_register_one_instance() {
    let ws = Workspace::new();
    let manager = ws.manager(vec![ws.stub("stub", &["go"], &[])], timeouts());
    let file = ws.path("main.go");

    // Both calls find nothing registered and start a process; the later
    // registration is discarded in favor of the earlier one.
    let (first, second) = tokio::join!(
        manager.check_file(&file, "package main\n"),
        manager.check_file(&file, "package main\n"),
    );
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(manager.running_servers().await, ["stub"]);

    manager.shutdown().await;

    let pids = ws.started_pids();
    assert!(!pids.is_empty());
    for pid in pids {
        assert!(
            ws.wait_for_pid_event(pid, "exit").await,
            "process {pid} was left running"
        );
    }
}

#[tokio::test]
async fn crash_during_check_restarts_on_next_check() {
    let ws = Workspace::new();
    let marker = ws.path("crashed-once");
    let marker_arg = marker.display().to_string();
    let manager = ws.manager(
        vec![ws.stub("stub", &["go"], &["--crash-once", &marker_arg])],
        timeouts(),
    );
    let file = ws.path("main.go");

    let first = manager.check_file(&file, "package main\n").await;
    assert!(first.is_empty(), "crash yields no diagnostics, not an error");
    assert!(marker.exists());
    assert!(manager.running_servers().await.is_empty(), "crashed instance evicted");

    let second = manager.check_file(&file, "package main\n").await;
    assert_eq!(second.len(), 1);

    let pids = ws.started_pids();
    assert_eq!(pids.len(), 2, "a fresh process serves the second check");
    assert_ne!(pids[0], pids[1]);

    manager.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn dead_instance_is_replaced_at_lookup() {
    let ws = Workspace::new();
    let manager = ws.manager(vec![ws.stub("stub", &["rs"], &[])], timeouts());
    let file = ws.path("lib.rs");

    assert_eq!(manager.check_file(&file, "fn main() {}\n").await.len(), 1);
    let pid = ws.started_pids()[0];

    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    // Wait for the read loop to notice.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !manager.running_servers().await.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "death not observed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(manager.check_file(&file, "fn main() {}\n").await.len(), 1);
    let pids = ws.started_pids();
    assert_eq!(pids.len(), 2);
    assert_ne!(pids[1], pid);

    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_without_any_check_is_a_no_op() {
    let ws = Workspace::new();
    let manager = ws.manager(vec![ws.stub("stub", &["go"], &[])], timeouts());
    manager.shutdown().await;
    assert!(ws.started_pids().is_empty());
}

#[tokio::test]
async fn shutdown_is_bounded_when_stdin_stalls() {
    let ws = Workspace::new();
    let bounds = LspTimeouts {
        shutdown: Duration::from_millis(300),
        ..short_timeouts()
    };
    let manager = ws.manager(vec![ws.stub("stub", &["go"], &["--stall-on-open"])], bounds);
    let file = ws.path("main.go");

    assert!(manager.check_file(&file, "package main\n").await.is_empty());
    assert!(ws.wait_for_event("stall").await);

    // Far larger than a pipe buffer: the write can never finish.
    let large = "// filler\n".repeat(200_000);
    assert!(manager.check_file(&file, &large).await.is_empty());

    let started = Instant::now();
    manager.shutdown().await;
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "shutdown took {:?}",
        started.elapsed()
    );
    assert_eq!(ws.count("exit"), 0);
}
