//! Daemon configuration.
//!
//! Env-first `Config::load`, with an optional TOML file for deployments
//! that prefer one. A value present in the TOML overlay wins over the
//! corresponding env var; both fall back to the built-in preset defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::policy::SecurityPolicy;
use crate::resolver::HostRuntime;
use crate::session::SessionManagerConfig;

/// Fully resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub policy: SecurityPolicy,
    pub session: SessionManagerConfig,
    /// Executable implementing the sandbox host protocol.
    pub sandbox_host_path: PathBuf,
    /// How long to wait for a freshly spawned sandbox host's `Ready` handshake.
    pub sandbox_ready_timeout: Duration,
    /// Executable implementing the compiler host protocol.
    pub compiler_host_path: PathBuf,
    /// Base URL of the package repository. `None` means
    /// `LoadPackage`/`nugetPackages` resolution always fails with
    /// `PACKAGE_NOT_FOUND` rather than contacting nothing.
    pub package_repository_url: Option<String>,
    /// Local directory downloaded package artifacts are cached under.
    pub package_cache_dir: PathBuf,
    /// Host runtime version dependency variants are matched against.
    pub host_runtime: HostRuntime,
}

/// Optional TOML override file, covering the same knobs as the env vars.
/// Every field is optional; absent fields fall through to the environment,
/// then to built-in defaults.
#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    execution_timeout_secs: Option<u64>,
    max_memory_mb: Option<u64>,
    restrict_apis: Option<bool>,
    session_timeout_minutes: Option<u64>,
    package_repository_url: Option<String>,
    policy_preset: Option<String>,
    sandbox_host_path: Option<String>,
    compiler_host_path: Option<String>,
    package_cache_dir: Option<String>,
    host_runtime_major: Option<u32>,
    host_runtime_minor: Option<u32>,
}

impl Config {
    /// Load configuration from environment variables, optionally overlaid by
    /// a TOML file at `toml_path`.
    pub fn load(toml_path: Option<&std::path::Path>) -> Result<Self> {
        let overlay = match toml_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file: {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("failed to parse config file: {}", path.display()))?
            }
            None => ConfigToml::default(),
        };

        let preset = overlay
            .policy_preset
            .clone()
            .or_else(|| std::env::var("POLICY_PRESET").ok())
            .unwrap_or_else(|| "production".to_string());
        let mut policy = match preset.as_str() {
            "development" => SecurityPolicy::development(),
            _ => SecurityPolicy::production(),
        };

        if let Some(secs) = overlay.execution_timeout_secs.or_else(|| env_u64("EXECUTION_TIMEOUT_SECS")) {
            policy.execution_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(mb) = overlay.max_memory_mb.or_else(|| env_u64("MAX_MEMORY_MB")) {
            policy.max_memory_bytes = (mb > 0).then_some(mb * 1024 * 1024);
            policy.enforce_memory = mb > 0;
        }
        if let Some(restrict) = overlay.restrict_apis.or_else(|| env_bool("RESTRICT_APIS")) {
            policy.restrict_apis = restrict;
        }

        let session = SessionManagerConfig {
            idle_timeout: Duration::from_secs(
                60 * overlay.session_timeout_minutes.or_else(|| env_u64("SESSION_TIMEOUT_MINUTES")).unwrap_or(5),
            ),
            ..SessionManagerConfig::default()
        };

        let sandbox_host_path = overlay
            .sandbox_host_path
            .or_else(|| std::env::var("SANDBOX_HOST_PATH").ok())
            .map_or_else(|| PathBuf::from("sandbox-host"), PathBuf::from);

        let compiler_host_path = overlay
            .compiler_host_path
            .or_else(|| std::env::var("COMPILER_HOST_PATH").ok())
            .map_or_else(|| PathBuf::from("compiler-host"), PathBuf::from);

        let package_repository_url = overlay.package_repository_url.or_else(|| std::env::var("PACKAGE_REPOSITORY_URL").ok());

        let package_cache_dir = overlay
            .package_cache_dir
            .or_else(|| std::env::var("PACKAGE_CACHE_DIR").ok())
            .map_or_else(std::env::temp_dir, PathBuf::from);

        let host_runtime = HostRuntime {
            major: overlay.host_runtime_major.or_else(|| env_u32("HOST_RUNTIME_MAJOR")).unwrap_or(8),
            minor: overlay.host_runtime_minor.or_else(|| env_u32("HOST_RUNTIME_MINOR")).unwrap_or(0),
        };

        Ok(Self {
            policy,
            session,
            sandbox_host_path,
            sandbox_ready_timeout: Duration::from_secs(10),
            compiler_host_path,
            package_repository_url,
            package_cache_dir,
            host_runtime,
        })
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
