//! Error taxonomy for the LSP layer.
//!
//! None of these escape [`crate::LspManager`]: the manager logs them and
//! degrades to "no diagnostics". They exist so the server layer can tell a
//! dead transport from a slow one.

use std::time::Duration;

use crate::codec::FrameError;
use crate::protocol::PathToUriError;

#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("spawning {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("LSP server '{server}' failed to initialize: {source}")]
    Handshake {
        server: String,
        #[source]
        source: Box<LspError>,
    },
    #[error("child process has no {0} pipe")]
    MissingPipe(&'static str),
    #[error("transport: {0}")]
    Transport(#[from] FrameError),
    #[error("LSP server '{server}' closed the connection")]
    ConnectionClosed { server: String },
    #[error("LSP request '{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },
    #[error("LSP error {code} from '{method}': {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },
    #[error("LSP server '{server}' is stopped")]
    Stopped { server: String },
    #[error(transparent)]
    InvalidPath(#[from] PathToUriError),
}

impl LspError {
    /// Whether the error means the analyzer process can no longer be used.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::ConnectionClosed { .. } | Self::Stopped { .. }
        )
    }
}
