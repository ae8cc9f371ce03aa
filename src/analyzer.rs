//! Static rejection of forbidden APIs.
//!
//! Runs on the *rewritten* source, after `SourceRewriter`, so injected
//! imports and print calls are covered by the same check as user code.

use crate::diagnostics::{codes, DiagnosticRecord, Severity};
use crate::policy::SecurityPolicy;
use crate::syntax::ParsedSource;

pub struct StaticAnalyzer;

/// Outcome of an analysis pass.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub diagnostics: Vec<DiagnosticRecord>,
}

impl AnalysisResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity == Severity::Error)
    }
}

impl StaticAnalyzer {
    /// Walk `source`'s syntax tree and flag every identifier-name node whose
    /// text equals (case-insensitively) a forbidden identifier. Skipped
    /// entirely when `policy.restrict_apis` is false.
    #[must_use]
    pub fn analyze(source: &str, policy: &SecurityPolicy) -> AnalysisResult {
        if !policy.restrict_apis {
            return AnalysisResult { diagnostics: Vec::new() };
        }

        let Ok(parsed) = ParsedSource::parse(source) else {
            return AnalysisResult { diagnostics: Vec::new() };
        };

        let mut diagnostics = Vec::new();
        for node in parsed.identifiers() {
            let text = parsed.text(node);
            if policy.is_forbidden_identifier(text) {
                let (line, column) = parsed.position_of(node);
                diagnostics.push(DiagnosticRecord::error(
                    codes::FORBIDDEN_API,
                    format!("use of forbidden identifier '{text}'"),
                    line,
                    column,
                ));
            }
        }

        AnalysisResult { diagnostics }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipped_when_restrict_apis_false() {
        let policy = SecurityPolicy::development();
        let result = StaticAnalyzer::analyze("File.ReadAllText(\"x\");", &policy);
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn flags_forbidden_identifier() {
        let policy = SecurityPolicy::production();
        let result = StaticAnalyzer::analyze("File.ReadAllText(\"/etc/hostname\");", &policy);
        assert!(result.has_errors());
        assert_eq!(result.diagnostics[0].code, codes::FORBIDDEN_API);
    }

    #[test]
    fn is_defeated_neither_by_comments_nor_strings() {
        // The identifier itself must appear as a node; inside a string or
        // comment it is not a syntax-tree identifier at all, so it is
        // correctly *not* flagged — this demonstrates why string search
        // would be wrong in the other direction (false negatives on
        // obfuscated access), which the tree walk avoids for the real case.
        let policy = SecurityPolicy::production();
        let result = StaticAnalyzer::analyze("// File.ReadAllText(\"x\");\nvar s = \"File\";", &policy);
        assert!(!result.has_errors());
    }

    #[test]
    fn allows_benign_snippet() {
        let policy = SecurityPolicy::production();
        let result = StaticAnalyzer::analyze("int x = 10;", &policy);
        assert!(!result.has_errors());
    }
}
