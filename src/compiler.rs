//! The compiler is an external collaborator: this crate only
//! defines its contract and a process-boundary implementation that shells
//! out to a configured compiler host. The engine never inspects the
//! compiler's internals.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::diagnostics::DiagnosticRecord;
use crate::wire::{recv_message, send_message};

/// A compile request: source text plus the reference assemblies to compile
/// against (default platform references unioned with session-attached
/// dependency artifacts).
#[derive(Debug, Clone, Serialize)]
pub struct CompileRequest {
    pub source: String,
    pub references: Vec<PathBuf>,
    /// Diagnostics-only compile (used by `Validate`): skips emitting
    /// artifact bytes.
    pub emit: bool,
}

/// Result of a compile.
#[derive(Debug, Clone, Deserialize)]
pub struct CompileOutcome {
    pub success: bool,
    pub artifact_bytes: Option<Vec<u8>>,
    pub symbol_bytes: Option<Vec<u8>>,
    pub diagnostics: Vec<DiagnosticRecord>,
}

/// The compiler contract: source text + references in, artifact bytes or
/// diagnostics out. Console-application output, optimizations enabled,
/// unsafe constructs disabled are compiler-host configuration,
/// not something this trait's caller controls per-call.
#[async_trait]
pub trait Compiler: Send + Sync {
    async fn compile(&self, request: CompileRequest) -> anyhow::Result<CompileOutcome>;
}

/// Compiler reached over a one-shot subprocess boundary: the host process is
/// spawned fresh per compile, fed a length-prefixed JSON request on stdin,
/// and expected to reply with exactly one length-prefixed JSON response on
/// stdout before exiting. The protocol is structured rather than plain text
/// because the compiler's response carries binary artifact bytes.
pub struct ProcessCompiler {
    host_path: PathBuf,
}

impl ProcessCompiler {
    #[must_use]
    pub fn new(host_path: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host_path.into(),
        }
    }
}

#[async_trait]
impl Compiler for ProcessCompiler {
    async fn compile(&self, request: CompileRequest) -> anyhow::Result<CompileOutcome> {
        debug!(source_len = request.source.len(), refs = request.references.len(), "compiling");

        let mut child: Child = Command::new(&self.host_path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;

        let mut stdin = child.stdin.take().ok_or_else(|| anyhow::anyhow!("no stdin on compiler host"))?;
        let mut stdout = child.stdout.take().ok_or_else(|| anyhow::anyhow!("no stdout on compiler host"))?;

        let payload = serde_json::to_vec(&request)?;
        send_message(&mut stdin, &payload).await?;
        stdin.shutdown().await.ok();

        let response = recv_message(&mut stdout).await?;
        let outcome: CompileOutcome = serde_json::from_slice(&response)?;

        let _ = child.wait().await;
        Ok(outcome)
    }
}

/// In-memory fake used by tests and by `Validate` flows that do not have a
/// real compiler host configured. Accepts everything whose source does not
/// contain the literal string `COMPILE_ERROR_TRIGGER`, purely as a test seam.
#[derive(Default)]
pub struct FakeCompiler;

#[async_trait]
impl Compiler for FakeCompiler {
    async fn compile(&self, request: CompileRequest) -> anyhow::Result<CompileOutcome> {
        if request.source.contains("COMPILE_ERROR_TRIGGER") {
            return Ok(CompileOutcome {
                success: false,
                artifact_bytes: None,
                symbol_bytes: None,
                diagnostics: vec![DiagnosticRecord::error("CS9999", "simulated compile failure", 1, 1)],
            });
        }
        Ok(CompileOutcome {
            success: true,
            artifact_bytes: request.emit.then(|| request.source.clone().into_bytes()),
            symbol_bytes: None,
            diagnostics: Vec::new(),
        })
    }
}
