//! Subprocess-backed `Sandbox`: a persistent "host" process per session,
//! communicating over the length-prefixed JSON protocol in
//! `crate::sandbox::protocol`.
//!
//! Spawn once, wait for a `Ready` handshake, then serialize all subsequent
//! requests through mutex-guarded stdin/stdout halves so concurrent callers
//! never interleave a send with someone else's receive. The process stays
//! alive and accretes state (loaded artifact, attached dependencies) across
//! many calls, which is exactly the "collectible sandbox" the session needs
//! for REPL continuation.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::protocol::{SandboxRequest, SandboxResponse};
use super::{InvokeOutcome, Sandbox};
use crate::wire::{recv_message, send_message};

/// A session's sandbox host process.
pub struct ProcessSandbox {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<ChildStdout>,
    alive: Arc<AtomicBool>,
}

impl ProcessSandbox {
    /// Spawn the sandbox host and wait for its `Ready` handshake.
    ///
    /// `host_path` is the executable that implements the sandbox protocol
    /// for the target runtime, long-lived instead of one-shot.
    pub async fn spawn(host_path: &Path, ready_timeout: Duration) -> anyhow::Result<Self> {
        debug!(host = %host_path.display(), "spawning sandbox host");

        let mut child = tokio::process::Command::new(host_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| anyhow::anyhow!("no stdin on sandbox host"))?;
        let mut stdout = child.stdout.take().ok_or_else(|| anyhow::anyhow!("no stdout on sandbox host"))?;

        let ready_bytes = tokio::time::timeout(ready_timeout, recv_message(&mut stdout))
            .await
            .map_err(|_| anyhow::anyhow!("sandbox host did not report ready within {ready_timeout:?}"))??;

        let ready: SandboxResponse = serde_json::from_slice(&ready_bytes)?;
        match ready {
            SandboxResponse::Ready => debug!("sandbox host ready"),
            other => anyhow::bail!("expected Ready from sandbox host, got: {other:?}"),
        }

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(stdout),
            alive: Arc::new(AtomicBool::new(true)),
        })
    }

    async fn request(&self, req: &SandboxRequest) -> anyhow::Result<SandboxResponse> {
        if !self.alive.load(Ordering::Acquire) {
            anyhow::bail!("sandbox host is not alive");
        }

        let mut stdin = self.stdin.lock().await;
        let mut stdout = self.stdout.lock().await;

        let payload = serde_json::to_vec(req)?;
        send_message(&mut *stdin, &payload).await?;
        let response = recv_message(&mut *stdout).await?;
        Ok(serde_json::from_slice(&response)?)
    }

}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn load_from_bytes(&self, artifact_bytes: &[u8]) -> anyhow::Result<()> {
        match self
            .request(&SandboxRequest::LoadArtifact {
                bytes: artifact_bytes.to_vec(),
            })
            .await?
        {
            SandboxResponse::Loaded => Ok(()),
            SandboxResponse::BlockedModule { module_name } => {
                warn!(module = %module_name, "sandbox refused blocked module on load");
                anyhow::bail!("blocked module: {module_name}")
            }
            SandboxResponse::Error { message } => anyhow::bail!("sandbox load failed: {message}"),
            other => anyhow::bail!("unexpected sandbox response to LoadArtifact: {other:?}"),
        }
    }

    async fn attach_dependency(&self, artifact_path: &Path) -> anyhow::Result<()> {
        let path = artifact_path.to_string_lossy().into_owned();
        match self.request(&SandboxRequest::AttachDependency { path }).await? {
            SandboxResponse::Attached => Ok(()),
            SandboxResponse::BlockedModule { module_name } => {
                warn!(module = %module_name, "sandbox refused blocked dependency");
                anyhow::bail!("blocked module: {module_name}")
            }
            SandboxResponse::Error { message } => anyhow::bail!("sandbox attach failed: {message}"),
            other => anyhow::bail!("unexpected sandbox response to AttachDependency: {other:?}"),
        }
    }

    async fn invoke_entry(&self) -> anyhow::Result<InvokeOutcome> {
        match self.request(&SandboxRequest::InvokeEntry).await? {
            SandboxResponse::Invoked {
                stdout,
                stderr,
                return_value,
            } => Ok(InvokeOutcome::Completed {
                stdout,
                stderr,
                return_value,
            }),
            SandboxResponse::InvokedWithException { message } => Ok(InvokeOutcome::UserException { message }),
            SandboxResponse::Error { message } => anyhow::bail!("sandbox invocation failed: {message}"),
            other => anyhow::bail!("unexpected sandbox response to InvokeEntry: {other:?}"),
        }
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        if !self.alive.load(Ordering::Acquire) {
            return Ok(());
        }

        if let Err(e) = self.request(&SandboxRequest::Shutdown).await {
            warn!(error = %e, "graceful sandbox shutdown failed, killing host");
        }

        self.alive.store(false, Ordering::Release);

        let mut child = self.child.lock().await;
        let _ = child.kill().await;
        let _ = child.wait().await;

        debug!("sandbox host disposed");
        Ok(())
    }

    fn liveness(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.alive)
    }

    async fn pid(&self) -> Option<u32> {
        self.child.lock().await.id()
    }
}
