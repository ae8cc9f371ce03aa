//! roslyn-stone daemon
//!
//! MCP server exposing a stateful, session-isolated C# scripting sandbox.
//! Wires `SessionManager`, `ExecutionEngine`, `ToolFacade`, and the `rmcp`
//! transport together; everything else lives in the library.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roslyn_stone_daemon::compiler::{Compiler, ProcessCompiler};
use roslyn_stone_daemon::config::Config;
use roslyn_stone_daemon::engine::ExecutionEngine;
use roslyn_stone_daemon::facade::ToolFacade;
use roslyn_stone_daemon::mcp;
use roslyn_stone_daemon::resolver::{DependencyResolver, HttpPackageRepository, NullPackageRepository, PackageRepository};
use roslyn_stone_daemon::session::SessionManager;

#[derive(Parser, Debug)]
#[command(name = "roslyn-stone-daemon")]
#[command(about = "MCP server for a stateful C# scripting sandbox")]
struct Args {
    /// Serve over stdio (one JSON-RPC message per line).
    #[arg(long)]
    stdio: bool,

    /// Serve over HTTP. Not yet implemented: transport framing beyond stdio
    /// is out of scope for this crate; the flag exists for CLI-surface
    /// parity with other deployments' transport modes.
    #[arg(long)]
    http: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Optional TOML config file overriding env-derived settings.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stderr so stdout stays free for stdio JSON-RPC framing.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with_writer(std::io::stderr)
        .init();

    if args.http {
        anyhow::bail!("HTTP transport is not implemented; run with --stdio");
    }
    if !args.stdio {
        anyhow::bail!("no transport selected; pass --stdio");
    }

    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    info!(
        restrict_apis = config.policy.restrict_apis,
        session_timeout_secs = config.session.idle_timeout.as_secs(),
        "loaded configuration"
    );

    let sessions = Arc::new(SessionManager::new(config.session.clone()));
    let _sweeper = sessions.start_sweeper();
    let compiler = ProcessCompiler::new(config.compiler_host_path.clone());

    match config.package_repository_url.clone() {
        Some(url) => {
            let repository = HttpPackageRepository::new(url, config.package_cache_dir.clone());
            let resolver = DependencyResolver::new(repository, config.host_runtime);
            let engine = build_engine(&config, Arc::clone(&sessions), compiler, resolver);
            run(engine, Arc::clone(&sessions)).await
        }
        None => {
            let resolver = DependencyResolver::new(NullPackageRepository, config.host_runtime);
            let engine = build_engine(&config, Arc::clone(&sessions), compiler, resolver);
            run(engine, Arc::clone(&sessions)).await
        }
    }
}

fn build_engine<C, R>(
    config: &Config,
    sessions: Arc<SessionManager>,
    compiler: C,
    resolver: DependencyResolver<R>,
) -> ExecutionEngine<C, R>
where
    C: Compiler,
    R: PackageRepository,
{
    ExecutionEngine::new(
        sessions,
        compiler,
        resolver,
        Arc::new(config.policy.clone()),
        config.sandbox_host_path.clone(),
        config.sandbox_ready_timeout,
    )
}

/// Serves the MCP tool surface over stdio until the client disconnects or
/// the process receives a shutdown signal, then sweeps every session.
async fn run<C, R>(engine: ExecutionEngine<C, R>, sessions: Arc<SessionManager>) -> Result<()>
where
    C: Compiler + Send + Sync + 'static,
    R: PackageRepository + Send + Sync + 'static,
{
    let facade = ToolFacade::new(Arc::clone(&sessions), engine);

    let result = tokio::select! {
        result = mcp::serve_stdio(facade) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            Ok(())
        }
    };

    sessions.shutdown().await;
    result
}
