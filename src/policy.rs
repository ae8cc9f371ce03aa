//! Immutable execution policy: timeouts, memory ceilings, and API blocklists.
//!
//! A `SecurityPolicy` never changes once built; the engine clones an
//! `Arc<SecurityPolicy>` into every execution instead of sharing mutable
//! config state.

use std::collections::HashSet;
use std::time::Duration;

/// Forbidden identifiers every policy starts from, regardless of preset.
///
/// These name APIs the engine statically rejects before compiling: arbitrary
/// file I/O, process spawning, network clients, native interop, and
/// process-wide termination. Presets may add to this set; nothing removes
/// from it.
const BASELINE_FORBIDDEN_IDENTIFIERS: &[&str] = &[
    // File I/O
    "File",
    "Directory",
    "FileInfo",
    "DirectoryInfo",
    "DriveInfo",
    "FileStream",
    "StreamWriter",
    "StreamReader",
    // Child-process creation
    "Process",
    "ProcessStartInfo",
    // Network clients
    "Socket",
    "TcpClient",
    "TcpListener",
    "UdpClient",
    "HttpClient",
    "HttpWebRequest",
    "WebClient",
    // Native interop
    "DllImportAttribute",
    "Marshal",
    // Process-wide termination
    "Environment",
];

/// Runtime module name prefixes every policy blocks by default.
///
/// Matched case-insensitively with prefix-on-`.` semantics: blocking
/// `"System.IO"` also blocks `"System.IO.Compression"`.
const BASELINE_BLOCKED_MODULES: &[&str] = &[
    "System.IO",
    "System.Diagnostics.Process",
    "System.Net.Sockets",
    "System.Net.Http",
    "System.Runtime.InteropServices",
];

/// Immutable configuration consumed by every component in the execution
/// pipeline.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    /// Wall-clock budget for a single execution. `None` means no timeout.
    pub execution_timeout: Option<Duration>,
    /// Heap growth ceiling for a single execution, in bytes. `None` means
    /// unlimited.
    pub max_memory_bytes: Option<u64>,
    /// Identifiers the static analyzer rejects wherever they appear lexically
    /// in rewritten source.
    pub forbidden_identifiers: HashSet<String>,
    /// Runtime module name prefixes the sandbox loader refuses to resolve.
    pub blocked_modules: Vec<String>,
    /// Whether the static analyzer runs at all.
    pub restrict_apis: bool,
    /// Whether the engine enforces `execution_timeout`.
    pub enforce_timeout: bool,
    /// Whether the engine enforces `max_memory_bytes`.
    pub enforce_memory: bool,
    /// Whether session ids are masked before being written to logs.
    pub mask_session_ids_in_logs: bool,
}

impl SecurityPolicy {
    /// Permissive preset for local iteration: analyzer off, generous timeout,
    /// no memory ceiling.
    #[must_use]
    pub fn development() -> Self {
        Self {
            execution_timeout: Some(Duration::from_secs(60)),
            max_memory_bytes: None,
            forbidden_identifiers: baseline_forbidden_identifiers(),
            blocked_modules: baseline_blocked_modules(),
            restrict_apis: false,
            enforce_timeout: true,
            enforce_memory: false,
            mask_session_ids_in_logs: false,
        }
    }

    /// Strict preset for untrusted callers: analyzer on, 30s timeout, 512MB
    /// memory ceiling, full blocklists.
    #[must_use]
    pub fn production() -> Self {
        Self {
            execution_timeout: Some(Duration::from_secs(30)),
            max_memory_bytes: Some(512 * 1024 * 1024),
            forbidden_identifiers: baseline_forbidden_identifiers(),
            blocked_modules: baseline_blocked_modules(),
            restrict_apis: true,
            enforce_timeout: true,
            enforce_memory: true,
            mask_session_ids_in_logs: true,
        }
    }

    /// Returns true when `identifier` names a forbidden API, compared
    /// case-insensitively as the analyzer requires.
    #[must_use]
    pub fn is_forbidden_identifier(&self, identifier: &str) -> bool {
        self.forbidden_identifiers
            .iter()
            .any(|f| f.eq_ignore_ascii_case(identifier))
    }

    /// Returns true when `module_name` is blocked, using case-insensitive
    /// prefix matching on `.` boundaries: blocking `System.IO`
    /// also blocks `System.IO.Compression` but not `System.IOStuff`.
    #[must_use]
    pub fn is_blocked_module(&self, module_name: &str) -> bool {
        self.blocked_modules.iter().any(|blocked| {
            module_name.eq_ignore_ascii_case(blocked)
                || module_name
                    .get(..blocked.len())
                    .is_some_and(|prefix| prefix.eq_ignore_ascii_case(blocked))
                    && module_name[blocked.len()..].starts_with('.')
        })
    }
}

fn baseline_forbidden_identifiers() -> HashSet<String> {
    BASELINE_FORBIDDEN_IDENTIFIERS
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

fn baseline_blocked_modules() -> Vec<String> {
    BASELINE_BLOCKED_MODULES.iter().map(|s| (*s).to_string()).collect()
}

impl Default for SecurityPolicy {
    /// `production()` is the safe default; callers must opt into
    /// `development()` explicitly.
    fn default() -> Self {
        Self::production()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn development_disables_analyzer() {
        let policy = SecurityPolicy::development();
        assert!(!policy.restrict_apis);
        assert!(policy.max_memory_bytes.is_none());
        assert_eq!(policy.execution_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn production_is_strict() {
        let policy = SecurityPolicy::production();
        assert!(policy.restrict_apis);
        assert!(policy.enforce_timeout);
        assert!(policy.enforce_memory);
        assert_eq!(policy.execution_timeout, Some(Duration::from_secs(30)));
        assert_eq!(policy.max_memory_bytes, Some(512 * 1024 * 1024));
    }

    #[test]
    fn forbidden_identifier_is_case_insensitive() {
        let policy = SecurityPolicy::production();
        assert!(policy.is_forbidden_identifier("File"));
        assert!(policy.is_forbidden_identifier("file"));
        assert!(policy.is_forbidden_identifier("FILE"));
        assert!(!policy.is_forbidden_identifier("MyFile"));
    }

    #[test]
    fn blocked_module_matches_prefix_on_dot_boundary() {
        let policy = SecurityPolicy::production();
        assert!(policy.is_blocked_module("System.IO"));
        assert!(policy.is_blocked_module("System.IO.Compression"));
        assert!(policy.is_blocked_module("system.io.compression"));
        assert!(!policy.is_blocked_module("System.IOStuff"));
        assert!(!policy.is_blocked_module("System.Text"));
    }
}
