//! Thin wrapper over `tree-sitter-c-sharp`: parse snippet text into a
//! concrete syntax tree and expose the handful of tree-shaped queries the
//! rewriter and static analyzer need.
//!
//! Everything here operates on the parsed tree, never on the source text by
//! string search: lexical/string-level checks are defeated by comments and
//! string interpolation.

use tree_sitter::{Node, Parser, Tree};

/// Node kinds from the `tree-sitter-c-sharp` grammar this module depends on.
mod kind {
    pub const IDENTIFIER: &str = "identifier";
    pub const RETURN_STATEMENT: &str = "return_statement";
    pub const EXPRESSION_STATEMENT: &str = "expression_statement";
    pub const AWAIT_EXPRESSION: &str = "await_expression";
    pub const GLOBAL_STATEMENT: &str = "global_statement";
    pub const COMPILATION_UNIT: &str = "compilation_unit";
    pub const CLASS_DECLARATION: &str = "class_declaration";
    pub const METHOD_DECLARATION: &str = "method_declaration";
    pub const MODIFIER: &str = "modifier";
}

#[derive(Debug, thiserror::Error)]
pub enum SyntaxError {
    #[error("tree-sitter-c-sharp grammar failed to load")]
    GrammarUnavailable,
    #[error("parser produced no tree for input")]
    ParseFailed,
}

/// A parsed snippet: the owned source text plus its syntax tree.
///
/// The tree borrows byte ranges into `source`, so the two travel together.
pub struct ParsedSource {
    source: String,
    tree: Tree,
}

impl ParsedSource {
    /// Parse `source` with the latest supported C# grammar.
    pub fn parse(source: &str) -> Result<Self, SyntaxError> {
        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_c_sharp::LANGUAGE.into())
            .map_err(|_| SyntaxError::GrammarUnavailable)?;
        let tree = parser.parse(source, None).ok_or(SyntaxError::ParseFailed)?;
        Ok(Self {
            source: source.to_string(),
            tree,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn root_node(&self) -> Node<'_> {
        self.tree.root_node()
    }

    /// True when the parser had to insert error-recovery nodes. The rewriter
    /// treats this as syntactic ambiguity and returns the input unchanged,
    /// deferring to the compiler's own diagnostics.
    #[must_use]
    pub fn has_syntax_errors(&self) -> bool {
        self.tree.root_node().has_error()
    }

    /// Text covered by `node`.
    #[must_use]
    pub fn text(&self, node: Node<'_>) -> &str {
        node.utf8_text(self.source.as_bytes()).unwrap_or_default()
    }

    /// 1-based (line, column) of the start of `node`, matching
    /// `DiagnosticRecord`'s convention.
    #[must_use]
    pub fn position_of(&self, node: Node<'_>) -> (u32, u32) {
        let point = node.start_position();
        (u32::try_from(point.row).unwrap_or(u32::MAX) + 1, u32::try_from(point.column).unwrap_or(u32::MAX) + 1)
    }

    /// Every `identifier` leaf node in the tree, depth-first, paired with its
    /// text. Used by the static analyzer.
    #[must_use]
    pub fn identifiers(&self) -> Vec<Node<'_>> {
        let mut out = Vec::new();
        walk(self.root_node(), &mut |node| {
            if node.kind() == kind::IDENTIFIER {
                out.push(node);
            }
        });
        out
    }

    /// True when any subtree contains an `await` expression.
    #[must_use]
    pub fn contains_await(&self) -> bool {
        let mut found = false;
        walk(self.root_node(), &mut |node| {
            if node.kind() == kind::AWAIT_EXPRESSION {
                found = true;
            }
        });
        found
    }

    /// True when any subtree contains a `return` statement (bare or with an
    /// expression). Used by the rewriter to decide whether rule 3 (implicit
    /// trailing-expression wrap) still applies.
    #[must_use]
    pub fn contains_return(&self) -> bool {
        let mut found = false;
        walk(self.root_node(), &mut |node| {
            if node.kind() == kind::RETURN_STATEMENT {
                found = true;
            }
        });
        found
    }

    /// The top-level statements of the snippet, in source order. In a
    /// top-level-statement compilation unit these are the direct
    /// `global_statement` children of `compilation_unit`; scripts written as
    /// a bare statement list are handled the same way since the grammar
    /// wraps each top-level statement uniformly.
    #[must_use]
    pub fn top_level_statements(&self) -> Vec<Node<'_>> {
        let root = self.root_node();
        if root.kind() != kind::COMPILATION_UNIT {
            return Vec::new();
        }
        let mut cursor = root.walk();
        root.children(&mut cursor)
            .filter(|n| n.kind() == kind::GLOBAL_STATEMENT)
            .collect()
    }

    /// The last top-level statement, if it is a bare expression statement.
    #[must_use]
    pub fn trailing_expression_statement(&self) -> Option<Node<'_>> {
        let last = self.top_level_statements().into_iter().next_back()?;
        let mut cursor = last.walk();
        last.children(&mut cursor)
            .find(|n| n.kind() == kind::EXPRESSION_STATEMENT)
    }

    /// Every `return` statement node, depth first.
    #[must_use]
    pub fn return_statements(&self) -> Vec<Node<'_>> {
        let mut out = Vec::new();
        walk(self.root_node(), &mut |node| {
            if node.kind() == kind::RETURN_STATEMENT {
                out.push(node);
            }
        });
        out
    }

    /// Whether this source has a runnable entry point:
    /// either top-level statements, or a static `Main` method on a type
    /// whose name contains "Program". Runs against the rewritten source,
    /// since the rewriter already normalizes any trailing expression into
    /// a top-level statement.
    #[must_use]
    pub fn has_entry_point(&self) -> bool {
        if !self.top_level_statements().is_empty() {
            return true;
        }

        let mut found = false;
        walk(self.root_node(), &mut |node| {
            if found || node.kind() != kind::CLASS_DECLARATION {
                return;
            }
            let mut cursor = node.walk();
            let name_matches = node
                .children(&mut cursor)
                .find(|c| c.kind() == kind::IDENTIFIER)
                .is_some_and(|name| self.text(name).contains("Program"));
            if name_matches && self.class_has_static_main(node) {
                found = true;
            }
        });
        found
    }

    fn class_has_static_main(&self, class_node: Node<'_>) -> bool {
        let mut found = false;
        walk(class_node, &mut |node| {
            if found || node.kind() != kind::METHOD_DECLARATION {
                return;
            }
            let mut cursor = node.walk();
            let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
            let is_main = children
                .iter()
                .any(|c| c.kind() == kind::IDENTIFIER && self.text(*c) == "Main");
            let is_static = children
                .iter()
                .any(|c| c.kind() == kind::MODIFIER && self.text(*c) == "static");
            if is_main && is_static {
                found = true;
            }
        });
        found
    }
}

fn walk<'a>(node: Node<'a>, visit: &mut impl FnMut(Node<'a>)) {
    visit(node);
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        walk(child, visit);
    }
}
