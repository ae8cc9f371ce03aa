//! The execution pipeline: acquire → resolve deps → rewrite →
//! analyze → compile → load → locate entry point → invoke under
//! timeout/memory guards → derive the outcome.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sysinfo::{Pid, System};
use thiserror::Error;
use tracing::{instrument, warn};

use crate::analyzer::StaticAnalyzer;
use crate::compiler::{CompileRequest, Compiler};
use crate::diagnostics::{codes, DiagnosticRecord, ExecutionOutcome, Severity};
use crate::policy::SecurityPolicy;
use crate::resolver::{DependencyResolver, PackageRepository, ResolveError};
use crate::rewriter::SourceRewriter;
use crate::sandbox::{InvokeOutcome, ProcessSandbox, Sandbox, SandboxLoader};
use crate::session::{Session, SessionManager};
use crate::syntax::ParsedSource;

/// Default platform reference assemblies every compile is seeded with,
/// independent of anything a session has attached. The compiler host resolves these against its own
/// installed runtime; this crate only names them.
const DEFAULT_REFERENCES: &[&str] = &["System.Private.CoreLib", "System.Console", "System.Runtime"];

/// Engine-internal errors.
/// Each variant names enough structured data to build a `DiagnosticRecord`
/// without string-parsing.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session '{0}' is busy with another execution")]
    SessionBusy(String),
    #[error("failed to spawn sandbox host: {0}")]
    SandboxUnavailable(#[source] anyhow::Error),
    #[error("sandbox rejected module: {0}")]
    BlockedModule(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("internal execution error: {0}")]
    Internal(#[source] anyhow::Error),
}

impl EngineError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionBusy(_) => codes::SESSION_BUSY,
            Self::Resolve(ResolveError::PackageNotFound { .. }) => codes::PACKAGE_NOT_FOUND,
            Self::Resolve(ResolveError::Incompatible { .. }) => codes::PACKAGE_INCOMPATIBLE,
            Self::Resolve(ResolveError::DownloadFailed { .. }) => codes::PACKAGE_DOWNLOAD_FAILED,
            Self::SandboxUnavailable(_) | Self::BlockedModule(_) | Self::Internal(_) => codes::EXECUTION_ERROR,
        }
    }
}

/// One dependency requested alongside an `Evaluate`/`LoadPackage` call.
#[derive(Debug, Clone)]
pub struct ExtraDependency {
    pub package_id: String,
    pub version: Option<String>,
}

/// Wires together every stage of the pipeline. Holds no per-session state
/// itself — all of that lives on `Session`, reached through `SessionManager`.
pub struct ExecutionEngine<C, R> {
    sessions: Arc<SessionManager>,
    compiler: C,
    resolver: DependencyResolver<R>,
    policy: Arc<SecurityPolicy>,
    sandbox_host_path: PathBuf,
    sandbox_ready_timeout: Duration,
}

impl<C: Compiler, R: PackageRepository> ExecutionEngine<C, R> {
    #[must_use]
    pub fn new(
        sessions: Arc<SessionManager>,
        compiler: C,
        resolver: DependencyResolver<R>,
        policy: Arc<SecurityPolicy>,
        sandbox_host_path: PathBuf,
        sandbox_ready_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            compiler,
            resolver,
            policy,
            sandbox_host_path,
            sandbox_ready_timeout,
        }
    }

    /// Resolve dependencies and attach them to `session`. Returns the attached artifact paths so
    /// `LoadPackage` can report them directly.
    pub async fn load_package(
        &self,
        session: &Session,
        package_id: &str,
        version: Option<&str>,
    ) -> Result<Vec<PathBuf>, EngineError> {
        let paths = self.resolver.resolve(package_id, version).await?;
        let mut artifacts = session.attached_artifacts.lock().await;
        for path in &paths {
            artifacts.push_unique(path.clone());
        }
        Ok(paths)
    }

    async fn resolve_extra_deps(&self, session: &Session, deps: &[ExtraDependency]) -> Result<(), EngineError> {
        for dep in deps {
            self.load_package(session, &dep.package_id, dep.version.as_deref()).await?;
        }
        Ok(())
    }

    async fn ensure_sandbox(&self, session: &Session) -> Result<Arc<SandboxLoader>, EngineError> {
        let mut slot = session.sandbox.lock().await;
        if let Some(sandbox) = slot.as_ref() {
            return Ok(Arc::clone(sandbox));
        }
        let process = ProcessSandbox::spawn(&self.sandbox_host_path, self.sandbox_ready_timeout)
            .await
            .map_err(EngineError::SandboxUnavailable)?;
        let loader = Arc::new(SandboxLoader::new(Box::new(process), Arc::clone(&self.policy)));
        *slot = Some(Arc::clone(&loader));
        Ok(loader)
    }

    /// Runs validation only: rewrite + analyze + a diagnostics-only compile.
    /// Never touches the sandbox.
    #[instrument(skip(self), fields(session = %crate::session::mask(session_id, self.policy.mask_session_ids_in_logs)))]
    pub async fn validate(&self, session_id: &str, code: &str) -> (bool, Vec<DiagnosticRecord>) {
        let history = match self.sessions.get(session_id).await {
            Some(session) => session.accumulated_state.lock().await.clone().unwrap_or_default(),
            None => String::new(),
        };
        let rewritten = SourceRewriter::rewrite(&with_history(&history, code));
        let analysis = StaticAnalyzer::analyze(&rewritten.source, &self.policy);
        if analysis.has_errors() {
            return (false, analysis.diagnostics);
        }

        let outcome = self
            .compiler
            .compile(CompileRequest {
                source: rewritten.source,
                references: DEFAULT_REFERENCES.iter().map(PathBuf::from).collect(),
                emit: false,
            })
            .await;

        match outcome {
            Ok(result) => (result.success, result.diagnostics),
            Err(e) => {
                warn!(error = %e, "validate: compiler host unreachable");
                (
                    false,
                    vec![DiagnosticRecord::error(codes::EXECUTION_ERROR, e.to_string(), 1, 1)],
                )
            }
        }
    }

    /// The full pipeline.
    #[instrument(skip(self, code, extra_deps), fields(session = %crate::session::mask(session_id, self.policy.mask_session_ids_in_logs)))]
    pub async fn execute(
        &self,
        session_id: &str,
        code: &str,
        extra_deps: &[ExtraDependency],
    ) -> Result<ExecutionOutcome, EngineError> {
        let started = Instant::now();

        // Step 1: acquire exclusive right to run on this session.
        let _guard = self
            .sessions
            .try_acquire(session_id)
            .await
            .ok_or_else(|| EngineError::SessionBusy(session_id.to_string()))?;

        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("session '{session_id}' vanished under its own lock")))?;

        // Step 2: resolve and attach extra dependencies before compile.
        self.resolve_extra_deps(&session, extra_deps).await?;

        // Step 3: rewrite. The session's accumulated source is prepended
        // first, so the compile in step 5 sees every prior call's
        // declarations in scope — this is what makes `x + 1` resolve an `x`
        // bound by an earlier call on the same session.
        let history = session.accumulated_state.lock().await.clone().unwrap_or_default();
        let rewritten = SourceRewriter::rewrite(&with_history(&history, code));

        // Step 4: analyze; short-circuit on Errors.
        let analysis = StaticAnalyzer::analyze(&rewritten.source, &self.policy);
        if analysis.has_errors() {
            return Ok(ExecutionOutcome {
                success: false,
                return_value: None,
                stdout: String::new(),
                diagnostics: analysis.diagnostics,
                warnings: Vec::new(),
                elapsed: started.elapsed(),
                session_id: session_id.to_string(),
            });
        }

        // Entry point check against the rewritten source. The compiler's
        // artifact is an opaque byte blob, so this crate locates
        // the entry point before compiling rather than after loading —
        // equivalent information, available earlier.
        if !has_entry_point(&rewritten.source) {
            return Ok(ExecutionOutcome {
                success: false,
                return_value: None,
                stdout: String::new(),
                diagnostics: vec![DiagnosticRecord::error(codes::NO_ENTRY_POINT, "no runnable entry point found", 1, 1)],
                warnings: Vec::new(),
                elapsed: started.elapsed(),
                session_id: session_id.to_string(),
            });
        }

        // Step 5: compile with the union of default + session-attached references.
        let references = {
            let mut refs: Vec<PathBuf> = DEFAULT_REFERENCES.iter().map(PathBuf::from).collect();
            refs.extend(session.attached_artifacts.lock().await.0.clone());
            refs
        };

        let executed_source = rewritten.source.clone();

        let compiled = self
            .compiler
            .compile(CompileRequest {
                source: rewritten.source,
                references,
                emit: true,
            })
            .await
            .map_err(EngineError::Internal)?;

        if !compiled.success {
            return Ok(ExecutionOutcome {
                success: false,
                return_value: None,
                stdout: String::new(),
                diagnostics: compiled.diagnostics,
                warnings: Vec::new(),
                elapsed: started.elapsed(),
                session_id: session_id.to_string(),
            });
        }

        let artifact = compiled
            .artifact_bytes
            .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("compiler reported success with no artifact bytes")))?;

        // Step 6: load into the session's sandbox. `SandboxLoader` itself
        // checks each dependency's module name against the blocklist before
        // it ever reaches the host process; a refusal surfaces here as an
        // ordinary error whose message names the blocked module.
        let sandbox = self.ensure_sandbox(&session).await?;
        for dep in session.attached_artifacts.lock().await.0.clone() {
            sandbox.attach_dependency(&dep).await.map_err(|e| {
                let message = e.to_string();
                message
                    .strip_prefix("blocked module: ")
                    .map_or_else(|| EngineError::Internal(e), |name| EngineError::BlockedModule(name.to_string()))
            })?;
        }
        sandbox.load_artifact(&artifact).await.map_err(EngineError::Internal)?;

        // Steps 7-13: invoke under timeout/memory guards; the sandbox host
        // itself performs stdout/stderr capture (step 8) and any task-like
        // await (step 12) since both happen inside its own process.
        let invocation = self.invoke_guarded(&sandbox, session_id).await;

        match invocation {
            InvocationResult::Completed {
                stdout,
                stderr,
                return_value,
            } => {
                let warnings = compiled
                    .diagnostics
                    .iter()
                    .filter(|d| d.severity == Severity::Warning)
                    .map(|d| d.message.clone())
                    .collect();

                // Step 13: derive return value.
                let derived = return_value.or_else(|| {
                    let trimmed = stdout.trim();
                    (!trimmed.is_empty()).then(|| trimmed.to_string())
                });

                // Step 14: update session state on success. The full
                // rewritten concatenation (history + this call) becomes the
                // next call's history.
                session.record_execution(Some(executed_source)).await;

                if !stderr.is_empty() {
                    warn!(stderr_len = stderr.len(), "execution produced stderr output");
                }

                Ok(ExecutionOutcome {
                    success: true,
                    return_value: derived,
                    stdout,
                    diagnostics: Vec::new(),
                    warnings,
                    elapsed: started.elapsed(),
                    session_id: session_id.to_string(),
                })
            }
            InvocationResult::UserException { message } => Ok(ExecutionOutcome {
                success: false,
                return_value: None,
                stdout: String::new(),
                diagnostics: vec![DiagnosticRecord::error(codes::RUNTIME_ERROR, message, 1, 1)],
                warnings: Vec::new(),
                elapsed: started.elapsed(),
                session_id: session_id.to_string(),
            }),
            InvocationResult::TimedOut => {
                warn!("execution exceeded timeout, disposing sandbox");
                self.retire_sandbox(&session).await;
                Ok(ExecutionOutcome {
                    success: false,
                    return_value: None,
                    stdout: String::new(),
                    diagnostics: vec![DiagnosticRecord::error(codes::EXECUTION_TIMEOUT, "execution timed out", 1, 1)],
                    warnings: Vec::new(),
                    elapsed: self.policy.execution_timeout.unwrap_or(started.elapsed()),
                    session_id: session_id.to_string(),
                })
            }
            InvocationResult::MemoryExceeded => {
                warn!("execution exceeded memory ceiling, disposing sandbox");
                self.retire_sandbox(&session).await;
                Ok(ExecutionOutcome {
                    success: false,
                    return_value: None,
                    stdout: String::new(),
                    diagnostics: vec![DiagnosticRecord::error(
                        codes::MEMORY_LIMIT_EXCEEDED,
                        "execution exceeded the memory ceiling",
                        1,
                        1,
                    )],
                    warnings: Vec::new(),
                    elapsed: started.elapsed(),
                    session_id: session_id.to_string(),
                })
            }
            InvocationResult::Failed(e) => Err(EngineError::Internal(e)),
        }
    }

    /// Steps 9-11: invoke on the sandbox, racing it against a timeout sleep
    /// and a memory-ceiling breach signal. Cancellation is cooperative: a
    /// timeout or breach just stops *waiting*, it does not stop the sandbox
    /// host's own invocation — `retire_sandbox` discards and replaces that
    /// host on the caller's next execution.
    async fn invoke_guarded(&self, sandbox: &Arc<SandboxLoader>, session_id: &str) -> InvocationResult {
        let invoke_future = {
            let sandbox = Arc::clone(sandbox);
            async move { sandbox.invoke().await }
        };
        tokio::pin!(invoke_future);

        let memory_breach = self.memory_sampler(sandbox, session_id);
        tokio::pin!(memory_breach);

        let timeout = self.policy.enforce_timeout.then_some(self.policy.execution_timeout).flatten();

        let result = match timeout {
            Some(duration) => {
                let sleep = tokio::time::sleep(duration);
                tokio::pin!(sleep);
                tokio::select! {
                    res = &mut invoke_future => Some(res),
                    () = &mut sleep => None,
                    () = &mut memory_breach, if self.policy.enforce_memory => return InvocationResult::MemoryExceeded,
                }
            }
            None => {
                tokio::select! {
                    res = &mut invoke_future => Some(res),
                    () = &mut memory_breach, if self.policy.enforce_memory => return InvocationResult::MemoryExceeded,
                }
            }
        };

        match result {
            None => InvocationResult::TimedOut,
            Some(Ok(InvokeOutcome::Completed {
                stdout,
                stderr,
                return_value,
            })) => InvocationResult::Completed {
                stdout,
                stderr,
                return_value,
            },
            Some(Ok(InvokeOutcome::UserException { message })) => InvocationResult::UserException { message },
            Some(Err(e)) => InvocationResult::Failed(e),
        }
    }

    /// Samples the sandbox's resident memory at a fixed cadence. Resolves once `sample - baseline` exceeds the
    /// policy's ceiling; never resolves otherwise (including when memory
    /// enforcement is off or the pid can't be read, since the caller only
    /// polls this branch when `enforce_memory` is set).
    async fn memory_sampler(&self, sandbox: &Arc<SandboxLoader>, session_id: &str) {
        let Some(max_bytes) = self.policy.max_memory_bytes else {
            std::future::pending::<()>().await;
            unreachable!();
        };
        let Some(pid) = sandbox.pid().await else {
            std::future::pending::<()>().await;
            unreachable!();
        };

        let mut system = System::new();
        let pid = Pid::from_u32(pid);
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        let baseline = system.process(pid).map_or(0, sysinfo::Process::memory);

        let mut ticker = tokio::time::interval(Duration::from_millis(50));
        loop {
            ticker.tick().await;
            system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
            let Some(process) = system.process(pid) else {
                // Process already exited; nothing left to breach.
                std::future::pending::<()>().await;
                unreachable!();
            };
            let current = process.memory();
            if current.saturating_sub(baseline) > max_bytes {
                warn!(session = %session_id, current, baseline, max_bytes, "memory ceiling exceeded");
                return;
            }
        }
    }

    async fn retire_sandbox(&self, session: &Session) {
        let sandbox = session.sandbox.lock().await.take();
        if let Some(sandbox) = sandbox {
            if let Err(e) = sandbox.dispose().await {
                warn!(error = %e, "error disposing retired sandbox");
            }
        }
    }
}

enum InvocationResult {
    Completed {
        stdout: String,
        stderr: String,
        return_value: Option<String>,
    },
    UserException { message: String },
    TimedOut,
    MemoryExceeded,
    Failed(anyhow::Error),
}

fn has_entry_point(source: &str) -> bool {
    ParsedSource::parse(source).is_ok_and(|parsed| parsed.has_entry_point())
}

/// Prepends a session's accumulated source history to a freshly submitted
/// snippet, raw (pre-rewrite). Rewriting the combined text afterward is
/// idempotent over the history half — its `return`s are already gone and its
/// required `using`s are already present — so only the new snippet's tail is
/// actually transformed.
fn with_history(history: &str, snippet: &str) -> String {
    if history.is_empty() {
        snippet.to_string()
    } else {
        format!("{history}\n{snippet}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use crate::compiler::FakeCompiler;
    use crate::resolver::{Compartment, HostRuntime, PackageMetadata, PackageVariant};
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
            anyhow::bail!("not used in these tests")
        }
    }

    struct FakeSandbox {
        alive: Arc<AtomicBool>,
        outcome: InvokeOutcome,
    }

    impl FakeSandbox {
        fn completed(stdout: impl Into<String>, return_value: Option<String>) -> Self {
            Self {
                alive: Arc::new(AtomicBool::new(true)),
                outcome: InvokeOutcome::Completed {
                    stdout: stdout.into(),
                    stderr: String::new(),
                    return_value,
                },
            }
        }
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        async fn load_from_bytes(&self, _artifact_bytes: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn attach_dependency(&self, _artifact_path: &std::path::Path) -> anyhow::Result<()> {
            Ok(())
        }
        async fn invoke_entry(&self) -> anyhow::Result<InvokeOutcome> {
            Ok(self.outcome.clone())
        }
        async fn dispose(&self) -> anyhow::Result<()> {
            self.alive.store(false, Ordering::Release);
            Ok(())
        }
        fn liveness(&self) -> Arc<AtomicBool> {
            Arc::clone(&self.alive)
        }
        async fn pid(&self) -> Option<u32> {
            None
        }
    }

    fn engine_with_fake_compiler() -> ExecutionEngine<FakeCompiler, EmptyRepository> {
        let sessions = Arc::new(SessionManager::new(SessionManagerConfig::default()));
        let resolver = DependencyResolver::new(EmptyRepository, HostRuntime { major: 8, minor: 0 });
        ExecutionEngine::new(
            sessions,
            FakeCompiler,
            resolver,
            Arc::new(SecurityPolicy::development()),
            PathBuf::from("/nonexistent/sandbox-host"),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn validate_reports_forbidden_identifier_without_compiling() {
        let engine = engine_with_fake_compiler();
        let (valid, diagnostics) = engine.validate("s1", "int x = 10;").await;
        assert!(valid);
        assert!(diagnostics.is_empty());
    }

    #[tokio::test]
    async fn validate_short_circuits_on_forbidden_api() {
        let sessions = Arc::new(SessionManager::new(SessionManagerConfig::default()));
        let resolver = DependencyResolver::new(EmptyRepository, HostRuntime { major: 8, minor: 0 });
        let engine = ExecutionEngine::new(
            sessions,
            FakeCompiler,
            resolver,
            Arc::new(SecurityPolicy::production()),
            PathBuf::from("/nonexistent/sandbox-host"),
            Duration::from_secs(1),
        );
        let (valid, diagnostics) = engine.validate("s1", "File.ReadAllText(\"x\");").await;
        assert!(!valid);
        assert_eq!(diagnostics[0].code, codes::FORBIDDEN_API);
    }

    #[tokio::test]
    async fn execute_short_circuits_on_compile_failure_without_touching_sandbox() {
        let sessions = Arc::new(SessionManager::new(SessionManagerConfig::default()));
        let id = sessions.create().await;
        let resolver = DependencyResolver::new(EmptyRepository, HostRuntime { major: 8, minor: 0 });
        let engine = ExecutionEngine::new(
            Arc::clone(&sessions),
            FakeCompiler,
            resolver,
            Arc::new(SecurityPolicy::development()),
            PathBuf::from("/nonexistent/sandbox-host"),
            Duration::from_secs(1),
        );
        let outcome = engine.execute(&id, "COMPILE_ERROR_TRIGGER", &[]).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.diagnostics[0].code, "CS9999");
    }

    #[tokio::test]
    async fn busy_session_fails_fast() {
        let engine = engine_with_fake_compiler();
        let id = engine.sessions.create().await;
        let _guard = engine.sessions.acquire(&id).await;
        let result = engine.execute(&id, "int x = 10;", &[]).await;
        assert!(matches!(result, Err(EngineError::SessionBusy(_))));
    }

    #[test]
    fn with_history_prefixes_and_separates_with_a_newline() {
        assert_eq!(with_history("", "x + 5"), "x + 5");
        assert_eq!(with_history("int x = 10;", "x + 5"), "int x = 10;\nx + 5");
    }

    #[tokio::test]
    async fn validate_recompiles_session_history_alongside_the_new_snippet() {
        let engine = engine_with_fake_compiler();
        let id = engine.sessions.create().await;
        let session = engine.sessions.get(&id).await.unwrap();
        session.record_execution(Some("COMPILE_ERROR_TRIGGER".to_string())).await;

        let (valid, diagnostics) = engine.validate(&id, "1 + 1").await;
        assert!(!valid, "history must be part of what gets compiled, not just the new snippet");
        assert_eq!(diagnostics[0].code, "CS9999");
    }

    #[tokio::test]
    async fn execute_recompiles_session_history_before_analysis_and_sandboxing() {
        let sessions = Arc::new(SessionManager::new(SessionManagerConfig::default()));
        let id = sessions.create().await;
        let session = sessions.get(&id).await.unwrap();
        session.record_execution(Some("File.ReadAllText(\"x\");".to_string())).await;

        let resolver = DependencyResolver::new(EmptyRepository, HostRuntime { major: 8, minor: 0 });
        let engine = ExecutionEngine::new(
            Arc::clone(&sessions),
            FakeCompiler,
            resolver,
            Arc::new(SecurityPolicy::production()),
            PathBuf::from("/nonexistent/sandbox-host"),
            Duration::from_secs(1),
        );

        // The new snippet alone contains no forbidden identifier; it is only
        // present in the session's prior history, so seeing it here proves
        // that history was prepended before the analyzer ran.
        let outcome = engine.execute(&id, "1 + 1", &[]).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.diagnostics[0].code, codes::FORBIDDEN_API);
    }
}
