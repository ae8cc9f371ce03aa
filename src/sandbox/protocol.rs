//! Wire protocol between the daemon and a session's sandbox host process.
//!
//! The contract a collectible, incrementally-loaded sandbox needs: load the
//! compiled artifact, attach dependency artifacts one at a time as
//! `LoadPackage` resolves them, invoke the entry point, and report live
//! memory usage for the engine's sampling loop.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxRequest {
    /// Load the compiled program artifact. Replaces any previously loaded
    /// entry artifact (a fresh `Sandbox` only ever loads one).
    LoadArtifact { bytes: Vec<u8> },
    /// Make a dependency artifact available for the next invocation's
    /// reference resolution.
    AttachDependency { path: String },
    /// Run the loaded artifact's entry point and capture stdout/stderr.
    InvokeEntry,
    /// Report current resident memory in bytes, for the engine's sampler.
    MemoryUsage,
    /// Health check.
    Ping,
    /// Graceful shutdown.
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxResponse {
    /// Host is ready to accept requests (sent on startup).
    Ready,
    Loaded,
    Attached,
    /// Result of `InvokeEntry`.
    Invoked {
        stdout: String,
        stderr: String,
        /// The invocation's own return value, when non-null and
        /// non-task-like. `None` means the engine
        /// should fall back to captured stdout.
        return_value: Option<String>,
    },
    /// The invocation raised a user exception; message is the unwrapped
    /// reflected exception's message.
    InvokedWithException { message: String },
    MemoryUsage { bytes: u64 },
    Pong,
    /// A requested module matched `blocked_modules` and was refused.
    BlockedModule { module_name: String },
    Error { message: String },
}
