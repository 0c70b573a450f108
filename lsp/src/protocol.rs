//! Internal LSP message serde types for JSON-RPC communication.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::LspError;
use crate::types::{Diagnostic, DiagnosticSeverity, Range};

pub(crate) const INITIALIZE: &str = "initialize";
pub(crate) const INITIALIZED: &str = "initialized";
pub(crate) const DID_OPEN: &str = "textDocument/didOpen";
pub(crate) const DID_CLOSE: &str = "textDocument/didClose";
pub(crate) const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";
pub(crate) const SHUTDOWN: &str = "shutdown";
pub(crate) const EXIT: &str = "exit";

const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Outgoing response. Only used to refuse server→client requests.
#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    pub jsonrpc: &'static str,
    pub id: serde_json::Value,
    pub error: ResponseError,
}

impl ErrorResponse {
    pub fn method_not_found(id: serde_json::Value, method: &str) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            error: ResponseError {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {method}"),
                data: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Any message read off the wire, before classification.
///
/// `null` and absent fields both decode to `None`.
#[derive(Debug, Deserialize)]
pub(crate) struct IncomingMessage {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<ResponseError>,
}

/// A response delivered to the waiter registered for its id.
#[derive(Debug)]
pub(crate) struct RpcResponse {
    pub result: serde_json::Value,
    pub error: Option<ResponseError>,
}

impl RpcResponse {
    pub fn into_result(self, method: &str) -> Result<serde_json::Value, LspError> {
        match self.error {
            Some(error) => Err(LspError::Rpc {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            }),
            None => Ok(self.result),
        }
    }
}

pub(crate) enum Incoming {
    Response {
        id: u64,
        response: RpcResponse,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

impl IncomingMessage {
    /// Sort a decoded message into response / server request / notification.
    ///
    /// Responses with a non-numeric or null id cannot belong to us and
    /// yield `None`.
    pub fn classify(self) -> Option<Incoming> {
        match (self.id, self.method) {
            (Some(id), None) => Some(Incoming::Response {
                id: id.as_u64()?,
                response: RpcResponse {
                    result: self.result.unwrap_or(serde_json::Value::Null),
                    error: self.error,
                },
            }),
            (Some(id), Some(method)) => Some(Incoming::ServerRequest { id, method }),
            (None, Some(method)) => Some(Incoming::Notification {
                method,
                params: self.params,
            }),
            (None, None) => None,
        }
    }
}

pub(crate) fn initialize_params(root_uri: &str) -> serde_json::Value {
    serde_json::json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "publishDiagnostics": {
                    "relatedInformation": true
                }
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    })
}

pub(crate) fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_close_params(uri: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri
        }
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    #[serde(default)]
    pub diagnostics: Vec<LspDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspDiagnostic {
    pub range: Range,
    #[serde(default)]
    pub severity: Option<u64>,
    #[serde(default)]
    pub source: Option<String>,
    pub message: String,
}

impl LspDiagnostic {
    /// Missing or unknown severities are reported as errors.
    pub fn into_diagnostic(self) -> Diagnostic {
        Diagnostic::new(
            self.range,
            self.severity
                .and_then(DiagnosticSeverity::from_lsp)
                .unwrap_or(DiagnosticSeverity::Error),
            self.message,
            self.source,
        )
    }
}

/// LSP language identifier for a file extension (with or without the dot).
#[must_use]
pub fn language_id(extension: &str) -> &'static str {
    match crate::types::normalize_extension(extension).as_str() {
        "go" => "go",
        "py" => "python",
        "ts" => "typescript",
        "tsx" => "typescriptreact",
        "js" => "javascript",
        "jsx" => "javascriptreact",
        "rs" => "rust",
        _ => "plaintext",
    }
}

/// Lexically resolve `.` and `..` components.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut out = Vec::new();
    for c in path.components() {
        match c {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out.iter().collect()
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(normalize_path(path)).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

pub(crate) fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}

/// Whether a URI reported by a server names the same file as `ours`.
///
/// Servers are free to re-encode URIs (drive letter case, escaping), so
/// fall back to comparing the decoded paths.
pub(crate) fn same_document(reported: &str, ours: &url::Url) -> bool {
    if reported == ours.as_str() {
        return true;
    }
    match (file_uri_to_path(reported), ours.to_file_path().ok()) {
        (Some(a), Some(b)) => normalize_path(&a) == normalize_path(&b),
        _ => false,
    }
}
