//! Compact text digest of a file's diagnostics.

use std::fmt::Write as _;
use std::path::Path;

use crate::types::Diagnostic;

/// How many diagnostics a digest lists before summarizing the rest.
const MAX_SHOWN: usize = 3;

/// Render `diagnostics` for `path` as one line suitable for feeding back to
/// an agent.
///
/// Each entry is `<basename>:<line>:<col>: <severity>: <message>` with
/// 1-based positions. At most three are listed; the remainder is counted.
/// No diagnostics yields an empty string.
#[must_use]
pub fn format_diagnostics(path: &Path, diagnostics: &[Diagnostic]) -> String {
    if diagnostics.is_empty() {
        return String::new();
    }

    let base = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned());

    let mut out = String::new();
    for (i, diag) in diagnostics.iter().take(MAX_SHOWN).enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        let _ = write!(
            out,
            "{base}:{}:{}: {}: {}",
            diag.line().saturating_add(1),
            diag.col().saturating_add(1),
            diag.severity().label(),
            diag.message()
        );
    }

    if diagnostics.len() > MAX_SHOWN {
        let _ = write!(out, "; ... and {} more", diagnostics.len() - MAX_SHOWN);
    }
    out
}
