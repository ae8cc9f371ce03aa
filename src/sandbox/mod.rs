//! Per-session isolated execution unit.
//!
//! A collectible, reflection-based assembly loader is modeled here as a
//! narrow `Sandbox` capability (`load_from_bytes`, `attach_dependency`,
//! `invoke_entry`, `dispose`) backed, in this process-oriented
//! implementation, by a single long-lived child "sandbox host" process per
//! session. Disposing a session's sandbox means killing and reaping that
//! process — the host's entire address space, and everything loaded into
//! it, is reclaimed atomically by the OS, which stands in for the managed
//! runtime's collectible `AssemblyLoadContext`.

pub mod process;
pub mod protocol;

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

pub use process::ProcessSandbox;

use crate::policy::SecurityPolicy;

/// Result of invoking a sandbox's loaded entry point.
#[derive(Debug, Clone)]
pub enum InvokeOutcome {
    Completed {
        stdout: String,
        stderr: String,
        return_value: Option<String>,
    },
    /// The user's code raised an exception; the engine unwraps a reflected
    /// invocation exception to expose it as-is.
    UserException { message: String },
}

/// Capability surface every sandbox backend must provide.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Load the compiled artifact into the sandbox, replacing any
    /// previously loaded entry artifact.
    async fn load_from_bytes(&self, artifact_bytes: &[u8]) -> anyhow::Result<()>;

    /// Make an already-on-disk dependency artifact resolvable for the next
    /// invocation.
    async fn attach_dependency(&self, artifact_path: &std::path::Path) -> anyhow::Result<()>;

    /// Run the loaded artifact's entry point.
    async fn invoke_entry(&self) -> anyhow::Result<InvokeOutcome>;

    /// Tear the sandbox down. Idempotent.
    async fn dispose(&self) -> anyhow::Result<()>;

    /// A weak, non-owning liveness flag: `true` until `dispose` completes.
    /// Used only by the collectibility test, never by normal operation.
    fn liveness(&self) -> Arc<AtomicBool>;

    /// OS process id hosting this sandbox, when the backend is process-based.
    /// The engine's memory sampler polls this out of
    /// band, since the wire protocol's stdin/stdout are busy for the
    /// duration of `invoke_entry`.
    async fn pid(&self) -> Option<u32>;
}

/// Wraps a single session's `Sandbox`, enforcing the blocklist before any
/// module (the entry artifact's own declared references, or an attached
/// dependency) is allowed to load.
pub struct SandboxLoader {
    sandbox: Box<dyn Sandbox>,
    policy: Arc<SecurityPolicy>,
}

impl SandboxLoader {
    #[must_use]
    pub fn new(sandbox: Box<dyn Sandbox>, policy: Arc<SecurityPolicy>) -> Self {
        Self { sandbox, policy }
    }

    /// Check a module name against `policy.blocked_modules` before any load
    /// attempt. Refusals are logged at Warning by the caller;
    /// this function only decides, so logging can carry session context.
    #[must_use]
    pub fn is_module_blocked(policy: &SecurityPolicy, module_name: &str) -> bool {
        policy.is_blocked_module(module_name)
    }

    pub async fn load_artifact(&self, bytes: &[u8]) -> anyhow::Result<()> {
        self.sandbox.load_from_bytes(bytes).await
    }

    /// Refuses to attach a dependency whose module name (its file stem, e.g.
    /// `System.IO` for `System.IO.dll`) matches `policy.blocked_modules`,
    /// without ever handing the path to the underlying sandbox.
    pub async fn attach_dependency(&self, path: &Path) -> anyhow::Result<()> {
        let module_name = module_name_from_path(path);
        if Self::is_module_blocked(&self.policy, &module_name) {
            warn!(module = %module_name, path = %path.display(), "refusing to attach blocked module");
            anyhow::bail!("blocked module: {module_name}");
        }
        self.sandbox.attach_dependency(path).await
    }

    pub async fn invoke(&self) -> anyhow::Result<InvokeOutcome> {
        self.sandbox.invoke_entry().await
    }

    pub async fn dispose(&self) -> anyhow::Result<()> {
        self.sandbox.dispose().await
    }

    #[must_use]
    pub fn liveness(&self) -> Arc<AtomicBool> {
        self.sandbox.liveness()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.sandbox.pid().await
    }
}

/// Derives the module name a blocklist check runs against from an attached
/// artifact's path: the file stem, e.g. `System.IO` for `.../System.IO.dll`.
fn module_name_from_path(path: &Path) -> String {
    path.file_stem().map_or_else(|| path.display().to_string(), |s| s.to_string_lossy().into_owned())
}

/// Dependency artifacts a sandbox needs attached before the next invocation,
/// in attachment order.
#[derive(Debug, Clone, Default)]
pub struct AttachedArtifacts(pub Vec<PathBuf>);

impl AttachedArtifacts {
    pub fn push_unique(&mut self, path: PathBuf) {
        if !self.0.contains(&path) {
            self.0.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;

    #[test]
    fn attached_artifacts_dedupe_by_path() {
        let mut artifacts = AttachedArtifacts::default();
        artifacts.push_unique(PathBuf::from("/tmp/a.dll"));
        artifacts.push_unique(PathBuf::from("/tmp/a.dll"));
        artifacts.push_unique(PathBuf::from("/tmp/b.dll"));
        assert_eq!(artifacts.0.len(), 2);
    }

    #[test]
    fn module_blocklist_check_delegates_to_policy() {
        let policy = SecurityPolicy::production();
        assert!(SandboxLoader::is_module_blocked(&policy, "System.IO"));
        assert!(!SandboxLoader::is_module_blocked(&policy, "System.Text"));
    }

    /// A bare-bones `Sandbox` whose only job is to flip its liveness flag on
    /// `dispose`, for exercising the collectibility contract in isolation
    /// from any real subprocess.
    struct StubSandbox {
        alive: Arc<AtomicBool>,
        attach_calls: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Sandbox for StubSandbox {
        async fn load_from_bytes(&self, _artifact_bytes: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn attach_dependency(&self, _artifact_path: &std::path::Path) -> anyhow::Result<()> {
            self.attach_calls.store(true, Ordering::Release);
            Ok(())
        }
        async fn invoke_entry(&self) -> anyhow::Result<InvokeOutcome> {
            Ok(InvokeOutcome::Completed {
                stdout: String::new(),
                stderr: String::new(),
                return_value: None,
            })
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

    fn stub_loader(attach_calls: Arc<AtomicBool>) -> SandboxLoader {
        let alive = Arc::new(AtomicBool::new(true));
        SandboxLoader::new(
            Box::new(StubSandbox { alive, attach_calls }),
            Arc::new(SecurityPolicy::production()),
        )
    }

    #[tokio::test]
    async fn weak_liveness_handle_observes_reclamation_after_dispose() {
        let alive = Arc::new(AtomicBool::new(true));
        let attach_calls = Arc::new(AtomicBool::new(false));
        let loader =
            SandboxLoader::new(Box::new(StubSandbox { alive: Arc::clone(&alive), attach_calls }), Arc::new(SecurityPolicy::production()));

        let weak_handle = loader.liveness();
        assert!(weak_handle.load(Ordering::Acquire));

        loader.dispose().await.unwrap();

        assert!(!weak_handle.load(Ordering::Acquire), "liveness handle must flip after dispose");
    }

    #[tokio::test]
    async fn attach_dependency_refuses_a_blocked_module_without_touching_the_sandbox() {
        let attach_calls = Arc::new(AtomicBool::new(false));
        let loader = stub_loader(Arc::clone(&attach_calls));

        let err = loader
            .attach_dependency(std::path::Path::new("/tmp/packages/System.IO.dll"))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "blocked module: System.IO");
        assert!(!attach_calls.load(Ordering::Acquire), "blocked attach must never reach the sandbox");
    }

    #[tokio::test]
    async fn attach_dependency_allows_a_module_not_on_the_blocklist() {
        let attach_calls = Arc::new(AtomicBool::new(false));
        let loader = stub_loader(Arc::clone(&attach_calls));

        loader
            .attach_dependency(std::path::Path::new("/tmp/packages/Newtonsoft.Json.dll"))
            .await
            .unwrap();

        assert!(attach_calls.load(Ordering::Acquire));
    }
}
