//! Turns REPL-style snippets into self-contained top-level programs.
//!
//! Decisions about *what* to rewrite are made by walking the parsed tree
//! (`crate::syntax`); the actual text transformation is a set of byte-range
//! splices computed from node boundaries, applied back-to-front so earlier
//! offsets stay valid. This keeps every surviving byte of the original
//! snippet — including whitespace and comments — untouched, satisfying the
//! "preserve all trivia" rule without needing a full mutable CST.

use crate::syntax::{ParsedSource, SyntaxError};

/// Output of a rewrite pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteResult {
    /// The program text to hand to the compiler.
    pub source: String,
    /// Whether `source` differs from the input snippet.
    pub changed: bool,
}

pub struct SourceRewriter;

struct Edit {
    start: usize,
    end: usize,
    replacement: String,
}

impl SourceRewriter {
    /// Apply the rewrite rules (trailing-expression capture, bare-return
    /// no-op, return-expression print, implicit imports). On syntactic
    /// ambiguity (the snippet does not parse cleanly), the input is returned
    /// unchanged so the downstream compiler reports its own diagnostic.
    #[must_use]
    pub fn rewrite(snippet: &str) -> RewriteResult {
        let parsed = match ParsedSource::parse(snippet) {
            Ok(parsed) => parsed,
            Err(SyntaxError::GrammarUnavailable | SyntaxError::ParseFailed) => {
                return RewriteResult {
                    source: snippet.to_string(),
                    changed: false,
                };
            }
        };

        if parsed.has_syntax_errors() {
            return RewriteResult {
                source: snippet.to_string(),
                changed: false,
            };
        }

        let mut edits = Vec::new();

        // Rule 1 & 2: rewrite every `return` statement.
        for stmt in parsed.return_statements() {
            let expr = stmt.named_child(0);
            let replacement = match expr {
                // Rule 1: `return;` -> no-op statement.
                None => ";".to_string(),
                // Rule 2: `return <expr>;` -> print `<expr>` to stdout.
                Some(expr_node) => format!("System.Console.WriteLine({});", parsed.text(expr_node)),
            };
            edits.push(Edit {
                start: stmt.start_byte(),
                end: stmt.end_byte(),
                replacement,
            });
        }

        // Rule 3: implicit REPL result — fires at most once, only when no
        // `return` appears anywhere in the snippet.
        if !parsed.contains_return() {
            if let Some(expr_stmt) = parsed.trailing_expression_statement() {
                if let Some(expr_node) = expr_stmt.named_child(0) {
                    edits.push(Edit {
                        start: expr_stmt.start_byte(),
                        end: expr_stmt.end_byte(),
                        replacement: format!("System.Console.WriteLine({});", parsed.text(expr_node)),
                    });
                }
            }
        }

        let mut source = apply_edits(parsed.source(), edits);

        // Rule 4: await anywhere -> ensure System.Threading.Tasks is visible.
        if parsed.contains_await() && !has_using(parsed.source(), "System.Threading.Tasks") {
            source = prepend_using(&source, "System.Threading.Tasks");
        }

        // Rule 5: always ensure System is imported (needed for the print call).
        if !has_using(parsed.source(), "System") {
            source = prepend_using(&source, "System");
        }

        let changed = source != snippet;
        RewriteResult { source, changed }
    }
}

fn apply_edits(source: &str, mut edits: Vec<Edit>) -> String {
    edits.sort_by(|a, b| b.start.cmp(&a.start));
    let mut out = source.to_string();
    for edit in edits {
        out.replace_range(edit.start..edit.end, &edit.replacement);
    }
    out
}

/// Whether `source` already has a top-level `using <namespace>;` directive
/// for exactly `namespace` (not a sub-namespace of it).
fn has_using(source: &str, namespace: &str) -> bool {
    let Ok(parsed) = ParsedSource::parse(source) else {
        return false;
    };
    let mut cursor = parsed.root_node().walk();
    parsed.root_node().children(&mut cursor).any(|node| {
        node.kind() == "using_directive"
            && parsed
                .text(node)
                .trim_start_matches("using")
                .trim()
                .trim_end_matches(';')
                .trim()
                == namespace
    })
}

fn prepend_using(source: &str, namespace: &str) -> String {
    format!("using {namespace};\n{source}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_when_no_return_or_trailing_expression() {
        let result = SourceRewriter::rewrite("int x = 10;");
        assert!(result.source.contains("int x = 10;"));
        assert!(result.source.contains("using System;"));
    }

    #[test]
    fn trailing_expression_is_printed() {
        let result = SourceRewriter::rewrite("2 + 3");
        assert!(result.changed);
        assert!(result.source.contains("System.Console.WriteLine(2 + 3)"));
    }

    #[test]
    fn bare_return_becomes_noop() {
        let result = SourceRewriter::rewrite("return;");
        assert!(!result.source.contains("return;"));
    }

    #[test]
    fn return_expression_is_printed_not_returned() {
        let result = SourceRewriter::rewrite("return 5;");
        assert!(result.source.contains("System.Console.WriteLine(5)"));
        assert!(!result.source.contains("return 5;"));
    }

    #[test]
    fn await_pulls_in_tasks_namespace() {
        let result = SourceRewriter::rewrite("await System.Threading.Tasks.Task.Delay(1);");
        assert!(result.source.contains("using System.Threading.Tasks;"));
    }

    #[test]
    fn syntactically_broken_snippet_is_unchanged() {
        let result = SourceRewriter::rewrite("int x =");
        assert_eq!(result.source, "int x =");
        assert!(!result.changed);
    }
}
