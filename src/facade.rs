//! `ToolFacade`: the surface the MCP layer calls directly. Each method
//! corresponds 1:1 to an MCP tool and owns the translation from
//! `EngineError`/domain types into the flat response shapes those tools
//! return.

use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use crate::compiler::Compiler;
use crate::diagnostics::{codes, DiagnosticRecord, ExecutionOutcome};
use crate::engine::{EngineError, ExecutionEngine, ExtraDependency};
use crate::resolver::PackageRepository;
use crate::session::{SessionManager, SessionMetadata};

/// Static usage tips surfaced by `GetReplInfo`.
const USAGE_TIPS: &[&str] = &[
    "Variables and using-directives declared in one Evaluate call persist into the next call on the same contextId.",
    "Omit contextId on the first call to have one created automatically; it is returned in every response.",
    "Call ValidateCsharp first when iterating on a snippet — it runs the same analyzer and compiler without executing anything.",
    "ResetRepl without a contextId clears every session in this process; with one, it clears only that session.",
];

const EXAMPLE_SNIPPETS: &[&str] = &[
    "int total = 0;\nfor (int i = 1; i <= 5; i++) { total += i; }\ntotal",
    "var numbers = new[] { 3, 1, 4, 1, 5 };\nArray.Sort(numbers);\nstring.Join(\",\", numbers)",
];

const DEFAULT_IMPORTS: &[&str] = &["System", "System.Linq", "System.Collections.Generic", "System.Threading.Tasks"];

/// Response shape for `Evaluate`.
pub struct EvaluateResponse {
    pub outcome: ExecutionOutcome,
    pub session_id: String,
}

/// Response shape for `Validate`.
pub struct ValidateResponse {
    pub valid: bool,
    pub diagnostics: Vec<DiagnosticRecord>,
}

/// Response shape for `Reset`.
pub struct ResetResponse {
    pub cleared_count: usize,
}

/// Response shape for `GetInfo`.
pub struct InfoResponse {
    pub runtime_version: &'static str,
    pub capabilities: Vec<&'static str>,
    pub active_session_count: usize,
    pub default_imports: Vec<&'static str>,
    pub tips: Vec<&'static str>,
    pub examples: Vec<&'static str>,
    pub session_metadata: Option<SessionMetadata>,
}

/// Response shape for `LoadPackage`.
pub struct LoadPackageResponse {
    pub success: bool,
    pub attached_paths: Vec<String>,
    pub diagnostic: Option<DiagnosticRecord>,
}

pub struct ToolFacade<C, R> {
    sessions: Arc<SessionManager>,
    engine: ExecutionEngine<C, R>,
}

impl<C: Compiler, R: PackageRepository> ToolFacade<C, R> {
    #[must_use]
    pub fn new(sessions: Arc<SessionManager>, engine: ExecutionEngine<C, R>) -> Self {
        Self { sessions, engine }
    }

    /// Resolve `session_id` to a live session, creating a fresh one when
    /// none was supplied or the supplied id is unknown.
    async fn resolve_session(&self, session_id: Option<&str>) -> String {
        self.resolve_session_tracked(session_id).await.0
    }

    /// Like `resolve_session`, but also reports whether a session was minted
    /// just now rather than reused, so `evaluate` can decide whether to keep
    /// it around on a trivial failure.
    async fn resolve_session_tracked(&self, session_id: Option<&str>) -> (String, bool) {
        match session_id {
            Some(id) if self.sessions.exists(id).await => (id.to_string(), false),
            // An unknown id does not error; it simply gets a freshly minted
            // session rather than reusing the caller-supplied name.
            Some(_) | None => (self.sessions.create().await, true),
        }
    }

    /// Runs the full evaluation pipeline. When no session was supplied, one
    /// is minted to run the call against; it is kept only if `create_context`
    /// was requested or the call itself succeeded, so a snippet that never
    /// compiles doesn't leave an orphan session for the next caller to stumble
    /// into.
    pub async fn evaluate(
        &self,
        code: &str,
        session_id: Option<&str>,
        create_context: bool,
        extra_deps: &[ExtraDependency],
    ) -> EvaluateResponse {
        let (session_id, newly_created) = self.resolve_session_tracked(session_id).await;

        let outcome = match self.engine.execute(&session_id, code, extra_deps).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let diagnostic = engine_error_diagnostic(&e);
                error!(error = %e, "evaluate failed");
                ExecutionOutcome::failure(session_id.clone(), diagnostic, Duration::ZERO)
            }
        };

        if newly_created && !create_context && !outcome.success {
            self.sessions.remove(&session_id).await;
        }

        EvaluateResponse { outcome, session_id }
    }

    pub async fn validate(&self, code: &str, session_id: Option<&str>) -> ValidateResponse {
        let session_id = self.resolve_session(session_id).await;
        let (valid, diagnostics) = self.engine.validate(&session_id, code).await;
        ValidateResponse { valid, diagnostics }
    }

    pub async fn reset(&self, session_id: Option<&str>) -> ResetResponse {
        let cleared_count = match session_id {
            Some(id) => usize::from(self.sessions.remove(id).await),
            None => self.sessions.remove_all().await,
        };
        ResetResponse { cleared_count }
    }

    pub async fn get_info(&self, session_id: Option<&str>) -> InfoResponse {
        let active_session_count = self.sessions.active_ids().await.len();
        let session_metadata = match session_id {
            Some(id) => self.sessions.metadata(id).await,
            None => None,
        };

        InfoResponse {
            runtime_version: env!("CARGO_PKG_VERSION"),
            capabilities: vec!["session-persistence", "nuget-package-loading", "static-api-restriction"],
            active_session_count,
            default_imports: DEFAULT_IMPORTS.to_vec(),
            tips: USAGE_TIPS.to_vec(),
            examples: EXAMPLE_SNIPPETS.to_vec(),
            session_metadata,
        }
    }

    pub async fn load_package(
        &self,
        session_id: Option<&str>,
        package_id: &str,
        version: Option<&str>,
    ) -> LoadPackageResponse {
        let session_id = self.resolve_session(session_id).await;
        let Some(session) = self.sessions.get(&session_id).await else {
            return LoadPackageResponse {
                success: false,
                attached_paths: Vec::new(),
                diagnostic: Some(DiagnosticRecord::error(codes::EXECUTION_ERROR, "session vanished", 1, 1)),
            };
        };

        match self.engine.load_package(&session, package_id, version).await {
            Ok(paths) => LoadPackageResponse {
                success: true,
                attached_paths: paths.iter().map(|p| p.display().to_string()).collect(),
                diagnostic: None,
            },
            Err(e) => LoadPackageResponse {
                success: false,
                attached_paths: Vec::new(),
                diagnostic: Some(engine_error_diagnostic(&e)),
            },
        }
    }
}

fn engine_error_diagnostic(e: &EngineError) -> DiagnosticRecord {
    DiagnosticRecord::error(e.code(), e.to_string(), 1, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use async_trait::async_trait;

    use crate::compiler::FakeCompiler;
    use crate::policy::SecurityPolicy;
    use crate::resolver::{DependencyResolver, HostRuntime, PackageMetadata};
    use crate::session::SessionManagerConfig;

    struct EmptyRepository;

    #[async_trait]
    impl PackageRepository for EmptyRepository {
        async fn latest_stable_version(&self, _package_id: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
        async fn metadata(&self, _package_id: &str, _version: &str) -> anyhow::Result<Option<PackageMetadata>> {
            Ok(None)
        }
        async fn download(&self, _package_id: &str, _artifact_url: &str) -> anyhow::Result<PathBuf> {
            anyhow::bail!("not used")
        }
    }

    fn facade() -> ToolFacade<FakeCompiler, EmptyRepository> {
        let sessions = Arc::new(SessionManager::new(SessionManagerConfig::default()));
        let resolver = DependencyResolver::new(EmptyRepository, HostRuntime { major: 8, minor: 0 });
        let engine = ExecutionEngine::new(
            Arc::clone(&sessions),
            FakeCompiler,
            resolver,
            Arc::new(SecurityPolicy::development()),
            PathBuf::from("/nonexistent/sandbox-host"),
            Duration::from_secs(1),
        );
        ToolFacade::new(sessions, engine)
    }

    #[tokio::test]
    async fn evaluate_without_session_id_creates_one() {
        let facade = facade();
        let response = facade.evaluate("int x = 10;", None, true, &[]).await;
        assert!(!response.session_id.is_empty());
    }

    #[tokio::test]
    async fn evaluate_without_create_context_discards_session_on_failure() {
        let facade = facade();
        let response = facade.evaluate("int x = 10;", None, false, &[]).await;
        assert!(!response.outcome.success);
        assert_eq!(facade.get_info(None).await.active_session_count, 0);
    }

    #[tokio::test]
    async fn evaluate_with_create_context_keeps_session_despite_failure() {
        let facade = facade();
        let response = facade.evaluate("int x = 10;", None, true, &[]).await;
        assert!(!response.outcome.success);
        assert_eq!(facade.get_info(None).await.active_session_count, 1);
    }

    #[tokio::test]
    async fn validate_reports_diagnostics_without_creating_a_sandbox() {
        let facade = facade();
        let response = facade.validate("int x = 10;", None).await;
        assert!(response.valid);
        assert!(response.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn reset_without_id_clears_every_session() {
        let facade = facade();
        let a = facade.evaluate("int x = 10;", None, true, &[]).await.session_id;
        let b = facade.evaluate("int y = 20;", None, true, &[]).await.session_id;
        assert_ne!(a, b);

        let response = facade.reset(None).await;
        assert_eq!(response.cleared_count, 2);
    }

    #[tokio::test]
    async fn reset_with_id_clears_only_that_session() {
        let facade = facade();
        let a = facade.evaluate("int x = 10;", None, true, &[]).await.session_id;
        let _b = facade.evaluate("int y = 20;", None, true, &[]).await.session_id;

        let response = facade.reset(Some(&a)).await;
        assert_eq!(response.cleared_count, 1);
        assert_eq!(facade.get_info(None).await.active_session_count, 1);
    }

    #[tokio::test]
    async fn get_info_reports_active_session_count() {
        let facade = facade();
        assert_eq!(facade.get_info(None).await.active_session_count, 0);
        facade.evaluate("int x = 10;", None, true, &[]).await;
        assert_eq!(facade.get_info(None).await.active_session_count, 1);
    }

    #[tokio::test]
    async fn load_package_surfaces_not_found_as_a_diagnostic() {
        let facade = facade();
        let response = facade.load_package(None, "DoesNotExist", None).await;
        assert!(!response.success);
        assert_eq!(response.diagnostic.unwrap().code, codes::PACKAGE_NOT_FOUND);
    }
}
