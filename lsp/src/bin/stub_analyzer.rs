//! A scriptable language server for integration tests.
//!
//! Speaks Content-Length framed JSON-RPC over stdin/stdout and answers just
//! enough of the protocol for diagnostics: `initialize`, `didOpen`,
//! `didClose`, `shutdown`, `exit`. CLI flags select failure modes.
//! Blocking std I/O only.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::Duration;

use clap::Parser;
use serde_json::{Value, json};

/// Stub language server for kiln integration tests.
#[derive(Parser, Debug)]
#[command(name = "stub-analyzer")]
#[allow(
    clippy::struct_excessive_bools,
    reason = "CLI flags are inherently boolean"
)]
struct Args {
    /// Never publish diagnostics.
    #[arg(long)]
    silent: bool,

    /// Diagnostics published per opened document.
    #[arg(long, default_value_t = 1)]
    publish: u32,

    /// Exit without a word when a document is opened.
    #[arg(long)]
    crash_on_open: bool,

    /// Crash on open unless MARKER exists; create it before crashing.
    #[arg(long, value_name = "MARKER")]
    crash_once: Option<PathBuf>,

    /// Stop reading stdin for good once a document is opened.
    #[arg(long)]
    stall_on_open: bool,

    /// Answer `initialize` with an error.
    #[arg(long)]
    fail_initialize: bool,

    /// Never respond to this method (repeatable).
    #[arg(long)]
    hang_on: Vec<String>,

    /// Publish diagnostics for an unrelated document before the real ones.
    #[arg(long)]
    foreign_first: bool,

    /// Emit a frame with an undecodable body before the initialize response.
    #[arg(long)]
    garbage_before_init: bool,

    /// Ask the client for `workspace/configuration` after `initialized`.
    #[arg(long)]
    request_config: bool,

    /// Append one line per lifecycle event to this file.
    #[arg(long, value_name = "FILE")]
    log: Option<PathBuf>,
}

struct Stub {
    args: Args,
    out: io::Stdout,
    shutdown_requested: bool,
}

impl Stub {
    fn log(&self, event: &str) {
        let Some(path) = &self.args.log else { return };
        if let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{} {event}", process::id());
        }
    }

    fn write_frame(&mut self, body: &[u8]) {
        let mut lock = self.out.lock();
        let _ = write!(lock, "Content-Length: {}\r\n\r\n", body.len());
        let _ = lock.write_all(body);
        let _ = lock.flush();
    }

    fn send(&mut self, message: &Value) {
        if let Ok(body) = serde_json::to_vec(message) {
            self.write_frame(&body);
        }
    }

    fn respond(&mut self, id: Value, result: Value) {
        self.send(&json!({ "jsonrpc": "2.0", "id": id, "result": result }));
    }

    fn respond_error(&mut self, id: Value, code: i64, message: &str) {
        self.send(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message }
        }));
    }

    fn publish(&mut self, uri: &str, count: u32) {
        let diagnostics: Vec<Value> = (0..count)
            .map(|i| {
                json!({
                    "range": {
                        "start": { "line": i, "character": 2 },
                        "end": { "line": i, "character": 6 }
                    },
                    "severity": (i % 4) + 1,
                    "source": "stub",
                    "message": format!("stub problem {i}")
                })
            })
            .collect();
        self.send(&json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": { "uri": uri, "diagnostics": diagnostics }
        }));
    }

    fn handle(&mut self, message: Value) {
        let method = message.get("method").and_then(Value::as_str).map(str::to_owned);
        let id = message.get("id").cloned();

        let Some(method) = method else {
            // A response to our own request.
            let code = message
                .pointer("/error/code")
                .and_then(Value::as_i64)
                .map_or_else(|| "ok".to_string(), |c| c.to_string());
            self.log(&format!("reply {code}"));
            return;
        };

        if self.args.hang_on.iter().any(|m| *m == method) {
            self.log(&format!("hang {method}"));
            return;
        }

        match (method.as_str(), id) {
            ("initialize", Some(id)) => {
                self.log("initialize");
                if self.args.garbage_before_init {
                    self.write_frame(b"{ this is not json");
                }
                if self.args.fail_initialize {
                    self.respond_error(id, -32603, "stub refuses to initialize");
                } else {
                    self.respond(
                        id,
                        json!({
                            "capabilities": { "textDocumentSync": 1 },
                            "serverInfo": { "name": "stub-analyzer" }
                        }),
                    );
                }
            }
            ("initialized", None) => {
                self.log("initialized");
                if self.args.request_config {
                    self.send(&json!({
                        "jsonrpc": "2.0",
                        "id": "cfg-1",
                        "method": "workspace/configuration",
                        "params": { "items": [{ "section": "stub" }] }
                    }));
                }
            }
            ("textDocument/didOpen", None) => {
                let uri = message
                    .pointer("/params/textDocument/uri")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.log(&format!("open {uri}"));
                self.maybe_crash();
                if self.args.stall_on_open {
                    self.log("stall");
                    loop {
                        thread::sleep(Duration::from_secs(60));
                    }
                }
                if self.args.foreign_first {
                    self.publish("file:///elsewhere/unrelated.txt", 7);
                }
                if !self.args.silent {
                    self.publish(&uri, self.args.publish);
                }
            }
            ("textDocument/didClose", None) => {
                let uri = message
                    .pointer("/params/textDocument/uri")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.log(&format!("close {uri}"));
            }
            ("shutdown", Some(id)) => {
                self.log("shutdown");
                self.shutdown_requested = true;
                self.respond(id, Value::Null);
            }
            ("exit", None) => {
                self.log("exit");
                process::exit(i32::from(!self.shutdown_requested));
            }
            (other, Some(id)) => self.respond_error(id, -32601, &format!("unhandled {other}")),
            (_, None) => {}
        }
    }

    fn maybe_crash(&self) {
        if self.args.crash_on_open {
            self.log("crash");
            process::exit(3);
        }
        if let Some(marker) = &self.args.crash_once
            && !marker.exists()
        {
            let _ = fs::write(marker, b"crashed");
            self.log("crash");
            process::exit(3);
        }
    }
}

/// Read one frame body; `None` on EOF or a malformed header.
fn read_frame(reader: &mut impl BufRead) -> Option<Vec<u8>> {
    let mut length = None;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).ok()? == 0 {
            return None;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }
        if let Some((key, value)) = trimmed.split_once(':')
            && key.trim().eq_ignore_ascii_case("content-length")
        {
            length = value.trim().parse::<usize>().ok();
        }
    }
    let mut body = vec![0; length?];
    reader.read_exact(&mut body).ok()?;
    Some(body)
}

fn main() {
    let args = Args::parse();
    if let Some(dir) = args.log.as_deref().and_then(Path::parent) {
        let _ = fs::create_dir_all(dir);
    }

    let mut stub = Stub {
        args,
        out: io::stdout(),
        shutdown_requested: false,
    };
    stub.log("start");

    let mut input = BufReader::new(io::stdin());
    while let Some(body) = read_frame(&mut input) {
        match serde_json::from_slice::<Value>(&body) {
            Ok(message) => stub.handle(message),
            Err(_) => stub.log("undecodable"),
        }
    }
    stub.log("eof");
}
