//! Value types shared by every stage of the execution pipeline: diagnostics,
//! severities, and the outcome returned by `ExecutionEngine::execute`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Severity of a `DiagnosticRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A single diagnostic produced by the static analyzer or the compiler.
///
/// `line`/`column` are 1-based, clamped to a minimum of 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    /// Stable code such as `FORBIDDEN_API`, `COMPILE_ERROR`, or a compiler
    /// code like `CS0103`.
    pub code: String,
    pub message: String,
    pub severity: Severity,
    pub line: u32,
    pub column: u32,
}

impl DiagnosticRecord {
    #[must_use]
    pub fn error(code: impl Into<String>, message: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            severity: Severity::Error,
            line: line.max(1),
            column: column.max(1),
        }
    }
}

/// Result of `ExecutionEngine::execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    /// Implicit return value of the snippet: the invocation's own return
    /// value, or the trimmed stdout when the invocation returned nothing.
    pub return_value: Option<String>,
    pub stdout: String,
    pub diagnostics: Vec<DiagnosticRecord>,
    pub warnings: Vec<String>,
    pub elapsed: Duration,
    pub session_id: String,
}

impl ExecutionOutcome {
    #[must_use]
    pub fn failure(session_id: impl Into<String>, diagnostic: DiagnosticRecord, elapsed: Duration) -> Self {
        Self {
            success: false,
            return_value: None,
            stdout: String::new(),
            diagnostics: vec![diagnostic],
            warnings: Vec::new(),
            elapsed,
            session_id: session_id.into(),
        }
    }
}

/// Failure codes that appear in `diagnostics[0].code`. Kept
/// as an enum of `&'static str` constants rather than a Rust enum so they
/// serialize identically to the compiler's own free-form codes (e.g.
/// `CS0103`) in the same field.
pub mod codes {
    pub const FORBIDDEN_API: &str = "FORBIDDEN_API";
    pub const COMPILE_ERROR: &str = "COMPILE_ERROR";
    pub const NO_ENTRY_POINT: &str = "NO_ENTRY_POINT";
    pub const EXECUTION_TIMEOUT: &str = "EXECUTION_TIMEOUT";
    pub const MEMORY_LIMIT_EXCEEDED: &str = "MEMORY_LIMIT_EXCEEDED";
    pub const RUNTIME_ERROR: &str = "RUNTIME_ERROR";
    pub const SESSION_BUSY: &str = "SESSION_BUSY";
    pub const EXECUTION_ERROR: &str = "EXECUTION_ERROR";
    pub const PACKAGE_NOT_FOUND: &str = "PACKAGE_NOT_FOUND";
    pub const PACKAGE_INCOMPATIBLE: &str = "PACKAGE_INCOMPATIBLE";
    pub const PACKAGE_DOWNLOAD_FAILED: &str = "PACKAGE_DOWNLOAD_FAILED";
}
