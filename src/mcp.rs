//! MCP server implementation using `rmcp`.
//!
//! Transport framing and JSON-RPC dispatch are `rmcp`'s job; this module only
//! declares the five-tool surface and translates each call into a
//! `ToolFacade` method.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::compiler::Compiler;
use crate::engine::ExtraDependency;
use crate::facade::ToolFacade;
use crate::resolver::PackageRepository;

/// One entry of `EvaluateCsharp`'s `nugetPackages` array.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NugetPackageRef {
    pub package_name: String,
    pub version: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateParams {
    /// The C# snippet to run. Variables and using-directives persist across
    /// calls that share a `contextId`.
    pub code: String,
    pub context_id: Option<String>,
    pub create_context: Option<bool>,
    #[serde(default)]
    pub nuget_packages: Vec<NugetPackageRef>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidateParams {
    pub code: String,
    pub context_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResetParams {
    pub context_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetInfoParams {
    pub context_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadPackageParams {
    pub package_name: String,
    pub version: Option<String>,
}

/// Field names are camelCase (via serde's rename) to match the documented
/// JSON-RPC contract.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateResult {
    success: bool,
    return_value: Option<String>,
    output: String,
    errors: Vec<crate::diagnostics::DiagnosticRecord>,
    warnings: Vec<String>,
    execution_time_ms: u128,
    context_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidateResult {
    is_valid: bool,
    issues: Vec<crate::diagnostics::DiagnosticRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResetResult {
    success: bool,
    message: String,
    sessions_cleared: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoResult {
    framework_version: &'static str,
    language: &'static str,
    state: &'static str,
    active_session_count: usize,
    context_id: Option<String>,
    default_imports: Vec<&'static str>,
    capabilities: Vec<&'static str>,
    tips: Vec<&'static str>,
    examples: Vec<&'static str>,
    session_metadata: Option<SessionMetadataView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionMetadataView {
    session_id: String,
    execution_count: u64,
    initialized: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadPackageResult {
    success: bool,
    attached_paths: Vec<String>,
    error: Option<crate::diagnostics::DiagnosticRecord>,
}

fn json_result(value: &impl Serialize) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string(value)
        .map_err(|e| McpError::internal_error(format!("failed to serialize tool result: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

/// MCP server exposing the Roslyn-Stone REPL tool surface.
#[derive(Clone)]
pub struct SandboxServer<C, R> {
    facade: Arc<ToolFacade<C, R>>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl<C: Compiler + Send + Sync + 'static, R: PackageRepository + Send + Sync + 'static> SandboxServer<C, R> {
    #[must_use]
    pub fn new(facade: ToolFacade<C, R>) -> Self {
        Self {
            facade: Arc::new(facade),
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Evaluate a C# snippet in a persistent REPL session, returning its result")]
    async fn evaluate_csharp(&self, Parameters(params): Parameters<EvaluateParams>) -> Result<CallToolResult, McpError> {
        let extra_deps: Vec<ExtraDependency> = params
            .nuget_packages
            .into_iter()
            .map(|p| ExtraDependency {
                package_id: p.package_name,
                version: p.version,
            })
            .collect();

        let response = self
            .facade
            .evaluate(&params.code, params.context_id.as_deref(), params.create_context.unwrap_or(false), &extra_deps)
            .await;
        let outcome = response.outcome;

        json_result(&EvaluateResult {
            success: outcome.success,
            return_value: outcome.return_value,
            output: outcome.stdout,
            errors: outcome.diagnostics,
            warnings: outcome.warnings,
            execution_time_ms: outcome.elapsed.as_millis(),
            context_id: response.session_id,
        })
    }

    #[tool(description = "Check a C# snippet for syntax/compile errors and forbidden APIs without executing it")]
    async fn validate_csharp(&self, Parameters(params): Parameters<ValidateParams>) -> Result<CallToolResult, McpError> {
        let response = self.facade.validate(&params.code, params.context_id.as_deref()).await;
        json_result(&ValidateResult {
            is_valid: response.valid,
            issues: response.diagnostics,
        })
    }

    #[tool(description = "Clear one REPL session's state, or every session if none is given")]
    async fn reset_repl(&self, Parameters(params): Parameters<ResetParams>) -> Result<CallToolResult, McpError> {
        let response = self.facade.reset(params.context_id.as_deref()).await;
        let message = match &params.context_id {
            Some(id) if response.cleared_count > 0 => format!("session '{id}' cleared"),
            Some(id) => format!("session '{id}' was not found"),
            None => format!("cleared {} session(s)", response.cleared_count),
        };
        json_result(&ResetResult {
            success: true,
            message,
            sessions_cleared: response.cleared_count,
        })
    }

    #[tool(description = "Report server capabilities, usage tips, and (optionally) one session's metadata")]
    async fn get_repl_info(&self, Parameters(params): Parameters<GetInfoParams>) -> Result<CallToolResult, McpError> {
        let response = self.facade.get_info(params.context_id.as_deref()).await;
        json_result(&InfoResult {
            framework_version: response.runtime_version,
            language: "C#",
            state: "ready",
            active_session_count: response.active_session_count,
            context_id: params.context_id,
            default_imports: response.default_imports,
            capabilities: response.capabilities,
            tips: response.tips,
            examples: response.examples,
            session_metadata: response.session_metadata.map(|m| SessionMetadataView {
                session_id: m.session_id,
                execution_count: m.execution_count,
                initialized: m.initialized,
            }),
        })
    }

    #[tool(description = "Resolve and attach a NuGet package's runtime artifacts to a session's sandbox")]
    async fn load_nu_get_package(&self, Parameters(params): Parameters<LoadPackageParams>) -> Result<CallToolResult, McpError> {
        let response = self.facade.load_package(None, &params.package_name, params.version.as_deref()).await;
        json_result(&LoadPackageResult {
            success: response.success,
            attached_paths: response.attached_paths,
            error: response.diagnostic,
        })
    }
}

#[tool_handler]
impl<C: Compiler + Send + Sync + 'static, R: PackageRepository + Send + Sync + 'static> ServerHandler for SandboxServer<C, R> {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "roslyn-stone".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Stateful C# scripting sandbox. Call EvaluateCsharp to run a snippet; omit contextId on \
                 the first call and reuse the one returned in every response to keep variables alive \
                 across calls. ValidateCsharp checks a snippet without running it. LoadNuGetPackage \
                 attaches a package's compiled artifacts to a session before the next EvaluateCsharp call."
                    .to_string(),
            ),
        }
    }
}

/// Serve the sandbox server over stdio.
pub async fn serve_stdio<C, R>(facade: ToolFacade<C, R>) -> anyhow::Result<()>
where
    C: Compiler + Send + Sync + 'static,
    R: PackageRepository + Send + Sync + 'static,
{
    let server = SandboxServer::new(facade);

    info!("starting MCP server on stdio");

    let service = server.serve(stdio()).await.map_err(|e| anyhow::anyhow!("failed to start MCP server: {e}"))?;

    service.waiting().await.map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::compiler::FakeCompiler;
    use crate::engine::ExecutionEngine;
    use crate::policy::SecurityPolicy;
    use crate::resolver::{DependencyResolver, HostRuntime, PackageMetadata};
    use crate::session::{SessionManager, SessionManagerConfig};

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

    fn server() -> SandboxServer<FakeCompiler, EmptyRepository> {
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
        SandboxServer::new(ToolFacade::new(sessions, engine))
    }

    #[tokio::test]
    async fn evaluate_tool_returns_success_payload() {
        let server = server();
        let result = server
            .evaluate_csharp(Parameters(EvaluateParams {
                code: "int x = 10;".to_string(),
                context_id: None,
                create_context: None,
                nuget_packages: Vec::new(),
            }))
            .await
            .unwrap();
        assert_ne!(result.is_error, Some(true));
    }

    #[tokio::test]
    async fn validate_tool_reports_valid_snippet() {
        let server = server();
        let result = server
            .validate_csharp(Parameters(ValidateParams {
                code: "int x = 10;".to_string(),
                context_id: None,
            }))
            .await
            .unwrap();
        assert_ne!(result.is_error, Some(true));
    }

    #[tokio::test]
    async fn reset_tool_without_context_reports_zero_sessions_initially() {
        let server = server();
        let result = server.reset_repl(Parameters(ResetParams { context_id: None })).await.unwrap();
        assert_ne!(result.is_error, Some(true));
    }

    #[tokio::test]
    async fn get_info_tool_reports_capabilities() {
        let server = server();
        let result = server.get_repl_info(Parameters(GetInfoParams { context_id: None })).await.unwrap();
        assert_ne!(result.is_error, Some(true));
    }

    #[tokio::test]
    async fn load_package_tool_surfaces_not_found() {
        let server = server();
        let result = server
            .load_nu_get_package(Parameters(LoadPackageParams {
                package_name: "DoesNotExist".to_string(),
                version: None,
            }))
            .await
            .unwrap();
        assert_ne!(result.is_error, Some(true));
    }
}
