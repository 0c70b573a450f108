//! LSP client for collecting language server diagnostics.
//!
//! [`LspManager::check_file`] opens a document in the matching analyzer,
//! waits for its diagnostics and closes it again. [`format_diagnostics`]
//! turns the result into a compact digest.

pub mod codec;
pub mod types;

pub(crate) mod diagnostics;
pub(crate) mod discovery;
pub(crate) mod protocol;
pub(crate) mod server;

mod error;
mod manager;

pub use diagnostics::format_diagnostics;
pub use discovery::{SearchPath, known_servers};
pub use error::LspError;
pub use manager::LspManager;
pub use protocol::{PathToUriError, language_id};
pub use types::{
    Diagnostic, DiagnosticSeverity, LspConfig, LspTimeouts, Position, Range, ServerConfig,
    ServerDescriptor, ServerState,
};
