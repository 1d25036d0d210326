//! MCP server implementation using rmcp.
//!
//! Exposes the execution pipeline as a single `execute` tool over stdio.

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{error, info};

use crate::backend::ProcessRunner;
use crate::coordinator::{ExecuteRequest, JobCoordinator};
use crate::error::FaultClass;
use crate::normalize::ExecutionResult;
use crate::toolchain::Language;

/// MCP server backed by a [`JobCoordinator`].
pub struct CodeRunnerServer<R> {
    coordinator: JobCoordinator<R>,
    tool_router: ToolRouter<Self>,
}

impl<R> Clone for CodeRunnerServer<R> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            tool_router: self.tool_router.clone(),
        }
    }
}

/// Parameters for the execute tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteParams {
    #[schemars(description = "Program language: javascript, python, typescript, java or cpp")]
    pub language: String,

    #[schemars(description = "Complete program source. Java programs must declare class Solution")]
    pub code: String,
}

#[tool_router]
impl<R: ProcessRunner + 'static> CodeRunnerServer<R> {
    pub fn new(coordinator: JobCoordinator<R>) -> Self {
        Self {
            coordinator,
            tool_router: Self::tool_router(),
        }
    }

    /// Compile (if needed) and run a program, returning its output.
    #[tool(description = "Compile and run a program, returning its stdout and stderr")]
    async fn execute(
        &self,
        Parameters(params): Parameters<ExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        let request = ExecuteRequest::new(params.language, params.code);

        match self.coordinator.execute(request).await {
            Ok(result) => Ok(tool_result(result)),
            Err(e) => match e.class() {
                FaultClass::Client => Err(McpError::invalid_params(e.to_string(), None)),
                FaultClass::Overload => {
                    Ok(CallToolResult::error(vec![Content::text(e.to_string())]))
                }
                FaultClass::Server => {
                    error!(error = %e, "Execution failed");
                    Ok(CallToolResult::error(vec![Content::text(format!(
                        "Execution error: {e}"
                    ))]))
                }
            },
        }
    }
}

/// Timeouts and failures with no output are reported as tool errors.
fn tool_result(result: ExecutionResult) -> CallToolResult {
    let is_error = result.timed_out || (result.output.is_empty() && !result.error.is_empty());

    let text = if result.error.is_empty() {
        result.output
    } else if result.output.is_empty() {
        result.error
    } else {
        format!("{}\n--- stderr ---\n{}", result.output, result.error)
    };

    if is_error {
        CallToolResult::error(vec![Content::text(text)])
    } else {
        CallToolResult::success(vec![Content::text(text)])
    }
}

#[tool_handler]
impl<R: ProcessRunner + 'static> ServerHandler for CodeRunnerServer<R> {
    fn get_info(&self) -> ServerInfo {
        let languages: Vec<_> = self
            .coordinator
            .registry()
            .languages()
            .map(Language::as_str)
            .collect();

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Compile and run short programs in per-job workspaces.\n\
                 Supported languages: {languages:?}\n\
                 \n\
                 Use the 'execute' tool with:\n\
                 - language: one of {languages:?}\n\
                 - code: the program source"
            )),
        }
    }
}

/// Serve the coordinator over stdio.
pub async fn serve_stdio<R: ProcessRunner + 'static>(
    coordinator: JobCoordinator<R>,
) -> anyhow::Result<()> {
    let server = CodeRunnerServer::new(coordinator);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}
