//! Error types for the pdf-toolkit library.
//!
//! Errors are contained at the smallest scope that can absorb them:
//!
//! * [`PageError`]: **Non-fatal**: one page failed to rasterise. The backend
//!   keeps going and the page is simply missing from the output.
//!
//! * [`BackendError`]: **Non-fatal to the engine**: one rasterisation backend
//!   could not run or produced nothing. The engine moves on to the next one.
//!
//! * [`ToolkitError`]: **Fatal to the operation**: the operation record is
//!   sealed as failed and the error is mapped to an [`OperationError`] for the
//!   serving layer.
//!
//! [`OperationError`] is the only shape that leaves the crate towards callers
//! of [`crate::toolkit::Toolkit`]: a stable `{kind, message}` pair plus
//! optional diagnostic detail for non-production configurations.

use crate::tracker::OperationKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors raised while running an operation.
#[derive(Debug, Error)]
pub enum ToolkitError {
    // ── Caller errors ─────────────────────────────────────────────────────
    /// Caller-supplied parameters are structurally invalid.
    #[error("{0}")]
    Validation(String),

    /// The input bytes do not start with the `%PDF` marker.
    #[error("File '{name}' is not a valid PDF (first bytes: {magic:?})")]
    NotAPdf { name: String, magic: Vec<u8> },

    // ── Document errors ───────────────────────────────────────────────────
    /// An assembler function was called with nothing to work on.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// lopdf could not parse the document structure.
    #[error("PDF '{name}' is corrupt: {detail}")]
    CorruptPdf { name: String, detail: String },

    /// A document could not be serialised back to bytes.
    #[error("Failed to serialise PDF '{name}': {detail}")]
    SaveFailed { name: String, detail: String },

    // ── Rasterisation ─────────────────────────────────────────────────────
    /// Every rasterisation backend failed; nothing was rendered.
    #[error("All {} rasterization backends failed ({category})", attempts.len())]
    ConversionExhausted {
        category: FailureCategory,
        attempts: Vec<BackendFailure>,
    },

    // ── I/O ───────────────────────────────────────────────────────────────
    /// Reading or writing an operation artifact failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The caller-configured operation timeout elapsed.
    #[error("Operation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (panicked blocking task, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ToolkitError {
    /// Shorthand for wrapping an [`std::io::Error`] with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ToolkitError::Io {
            path: path.into(),
            source,
        }
    }
}

/// A non-fatal error for a single page.
///
/// Collected alongside the pages a backend did render so callers can see
/// exactly which pages were skipped and why.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum PageError {
    /// The backend failed to draw this page.
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: u32, detail: String },

    /// The page was drawn but could not be encoded or written.
    #[error("Page {page}: image encoding failed: {detail}")]
    EncodeFailed { page: u32, detail: String },
}

impl PageError {
    pub fn page(&self) -> u32 {
        match self {
            PageError::RenderFailed { page, .. } | PageError::EncodeFailed { page, .. } => *page,
        }
    }
}

/// Why a single rasterisation backend gave up on a document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The backend cannot run in this environment (library or binary missing).
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend started but crashed or rejected the document.
    #[error("backend failed: {0}")]
    Failed(String),

    /// The backend ran to completion but not a single page rendered.
    #[error("no pages rendered ({page_errors} page errors)")]
    NoPages { page_errors: usize },
}

impl BackendError {
    pub fn category(&self) -> FailureCategory {
        match self {
            BackendError::Unavailable(_) => FailureCategory::MissingCapability,
            BackendError::Failed(_) => FailureCategory::TransientFailure,
            BackendError::NoPages { .. } => FailureCategory::Unsupported,
        }
    }
}

/// One backend's failure, as recorded by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendFailure {
    pub backend: String,
    pub category: FailureCategory,
    pub message: String,
}

/// Coarse classification used to pick the user-facing exhaustion message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// A required library or executable is missing.
    MissingCapability,
    /// The backend is present but failed while running.
    TransientFailure,
    /// Backends ran but the document could not be rendered here.
    Unsupported,
}

impl FailureCategory {
    /// Pick the category that occurs most often.
    ///
    /// Ties, and an empty list, resolve to [`FailureCategory::Unsupported`].
    pub fn dominant(failures: &[BackendFailure]) -> FailureCategory {
        let count = |c: FailureCategory| failures.iter().filter(|f| f.category == c).count();
        let missing = count(FailureCategory::MissingCapability);
        let transient = count(FailureCategory::TransientFailure);
        let unsupported = count(FailureCategory::Unsupported);

        if missing > transient && missing > unsupported {
            FailureCategory::MissingCapability
        } else if transient > missing && transient > unsupported {
            FailureCategory::TransientFailure
        } else {
            FailureCategory::Unsupported
        }
    }

    /// Stable headline shown to the user.
    pub fn message(self) -> &'static str {
        match self {
            FailureCategory::MissingCapability => {
                "PDF conversion failed due to missing system dependencies"
            }
            FailureCategory::TransientFailure => "PDF conversion service temporarily unavailable",
            FailureCategory::Unsupported => "PDF conversion not supported in current environment",
        }
    }

    /// Actionable hint that accompanies [`FailureCategory::message`].
    pub fn hint(self) -> &'static str {
        match self {
            FailureCategory::MissingCapability => {
                "The server environment is missing required graphics libraries. Please contact support."
            }
            FailureCategory::TransientFailure => {
                "The PDF to image conversion service is experiencing issues. Please try again later."
            }
            FailureCategory::Unsupported => {
                "The server cannot process PDF to image conversion at this time. Please try a different operation."
            }
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureCategory::MissingCapability => "missing capability",
            FailureCategory::TransientFailure => "transient failure",
            FailureCategory::Unsupported => "unsupported",
        };
        f.write_str(s)
    }
}

// ── Surfaced errors ──────────────────────────────────────────────────────

/// Error kinds visible to the serving layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    ConversionExhausted,
    Io,
    Timeout,
    Internal,
}

/// The structured `{kind, message}` failure handed to the serving layer.
///
/// `detail` carries the original error text and is only populated when
/// diagnostics are enabled in [`crate::config::ToolkitConfig`].
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("{message}")]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl OperationError {
    /// Build a validation failure. These never reach the tracker.
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            message: message.into(),
            detail: None,
        }
    }

    /// Map a fatal [`ToolkitError`] to the stable message for `operation`.
    pub fn from_toolkit(operation: OperationKind, err: &ToolkitError, diagnostics: bool) -> Self {
        let (kind, message, hint) = match err {
            ToolkitError::Validation(msg) => (ErrorKind::Validation, msg.clone(), None),
            ToolkitError::NotAPdf { .. } => (ErrorKind::Validation, err.to_string(), None),
            ToolkitError::ConversionExhausted { category, .. } => (
                ErrorKind::ConversionExhausted,
                category.message().to_string(),
                Some(category.hint().to_string()),
            ),
            ToolkitError::Io { .. } => (ErrorKind::Io, failure_headline(operation), None),
            ToolkitError::Timeout { .. } => (
                ErrorKind::Timeout,
                format!("{} (timed out)", failure_headline(operation)),
                None,
            ),
            _ => (ErrorKind::Internal, failure_headline(operation), None),
        };

        let detail = if diagnostics {
            Some(match hint {
                Some(h) => format!("{h} ({err})"),
                None => err.to_string(),
            })
        } else {
            hint
        };

        Self {
            kind,
            message,
            detail,
        }
    }
}

impl OperationError {
    /// Map an error raised while inspecting a document, outside any tracked
    /// operation.
    pub fn from_inspect(err: &ToolkitError, diagnostics: bool) -> Self {
        let kind = match err {
            ToolkitError::Validation(_) | ToolkitError::NotAPdf { .. } => {
                return Self::validation(err.to_string())
            }
            ToolkitError::Io { .. } => ErrorKind::Io,
            _ => ErrorKind::Internal,
        };
        Self {
            kind,
            message: "Failed to get PDF info".to_string(),
            detail: diagnostics.then(|| err.to_string()),
        }
    }
}

fn failure_headline(operation: OperationKind) -> String {
    match operation {
        OperationKind::Merge => "Failed to merge PDFs",
        OperationKind::Split => "Failed to split PDF",
        OperationKind::Compress => "Failed to compress PDF",
        OperationKind::Convert => "Failed to convert PDF",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(category: FailureCategory) -> BackendFailure {
        BackendFailure {
            backend: "x".into(),
            category,
            message: "boom".into(),
        }
    }

    #[test]
    fn dominant_category_prefers_majority() {
        let failures = vec![
            failure(FailureCategory::MissingCapability),
            failure(FailureCategory::MissingCapability),
            failure(FailureCategory::TransientFailure),
        ];
        assert_eq!(
            FailureCategory::dominant(&failures),
            FailureCategory::MissingCapability
        );
    }

    #[test]
    fn dominant_category_tie_is_unsupported() {
        let failures = vec![
            failure(FailureCategory::MissingCapability),
            failure(FailureCategory::TransientFailure),
        ];
        assert_eq!(FailureCategory::dominant(&failures), FailureCategory::Unsupported);
        assert_eq!(FailureCategory::dominant(&[]), FailureCategory::Unsupported);
    }

    #[test]
    fn exhausted_maps_to_category_message() {
        let err = ToolkitError::ConversionExhausted {
            category: FailureCategory::TransientFailure,
            attempts: vec![failure(FailureCategory::TransientFailure)],
        };
        let surfaced = OperationError::from_toolkit(OperationKind::Convert, &err, false);
        assert_eq!(surfaced.kind, ErrorKind::ConversionExhausted);
        assert_eq!(surfaced.message, "PDF conversion service temporarily unavailable");
        assert!(surfaced.detail.as_deref().unwrap_or("").contains("try again later"));
    }

    #[test]
    fn diagnostics_gate_original_error_text() {
        let err = ToolkitError::io(
            "/tmp/x.pdf",
            std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"),
        );
        let quiet = OperationError::from_toolkit(OperationKind::Merge, &err, false);
        assert_eq!(quiet.message, "Failed to merge PDFs");
        assert!(quiet.detail.is_none());

        let loud = OperationError::from_toolkit(OperationKind::Merge, &err, true);
        assert_eq!(loud.message, "Failed to merge PDFs");
        assert!(loud.detail.unwrap().contains("disk on fire"));
    }

    #[test]
    fn page_error_display() {
        let e = PageError::RenderFailed {
            page: 2,
            detail: "bad xref".into(),
        };
        assert!(e.to_string().contains("Page 2"));
        assert_eq!(e.page(), 2);
    }
}
