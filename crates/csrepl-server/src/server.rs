//! MCP server handler.
//!
//! Tools map one-to-one onto [`Repl`] operations. Resources expose the REPL
//! description and the context registry as JSON under `repl://`.

use std::time::Duration;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    Annotated, CallToolResult, Content, Implementation, ListResourceTemplatesResult,
    ListResourcesResult, PaginatedRequestParams, ProtocolVersion, RawResource,
    RawResourceTemplate, ReadResourceRequestParams, ReadResourceResult, ResourceContents,
    ServerCapabilities, ServerInfo,
};
use rmcp::schemars;
use rmcp::service::{RequestContext, RoleServer};
use rmcp::transport::io::stdio;
use rmcp::{ErrorData as McpError, ServerHandler, ServiceExt, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use csrepl::{Diagnostic, ExecuteRequest, Repl, Severity};

/// Longest timeout a caller may ask for.
pub const MAX_TIMEOUT_SECONDS: u64 = 300;

const STATE_URI: &str = "repl://state";
const SESSIONS_URI: &str = "repl://sessions";
const SESSION_PREFIX: &str = "repl://sessions/";
const SESSION_SUFFIX: &str = "/state";
const JSON_MIME: &str = "application/json";

/// Parameters for `EvaluateCsharp`.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateParams {
    /// C# source to compile and run.
    #[schemars(
        description = "C# code to compile and run. Top-level statements or a class with Main. System, System.Collections.Generic, System.Linq, System.Text, System.Threading and System.Threading.Tasks are imported."
    )]
    pub code: String,

    /// Context to attribute the run to.
    #[serde(default)]
    #[schemars(
        description = "Optional context id for bookkeeping. Must be non-empty and must not contain '/'. Executions never share state, even within one context."
    )]
    pub context_id: Option<String>,

    /// Timeout in seconds.
    #[serde(default)]
    #[schemars(description = "Optional timeout in seconds (1-300). Defaults to the server setting.")]
    pub timeout_seconds: Option<u64>,
}

/// Parameters for `ValidateCsharp`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ValidateParams {
    /// C# source to check.
    #[schemars(description = "C# code to compile without running")]
    pub code: String,
}

/// Parameters for `ResetRepl`.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResetParams {
    /// Context to forget; all contexts when omitted.
    #[serde(default)]
    #[schemars(description = "Context id to reset. Omit to reset every context.")]
    pub context_id: Option<String>,
}

/// Structured result of `ValidateCsharp`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    /// No Error diagnostics were reported.
    pub is_valid: bool,
    /// Error and Warning diagnostics, in compiler order.
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationReport {
    fn new(diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            is_valid: !diagnostics.iter().any(Diagnostic::is_error),
            diagnostics,
        }
    }

    fn to_text(&self) -> String {
        if self.diagnostics.is_empty() {
            return "Code is valid.".to_string();
        }
        let errors = self.diagnostics.iter().filter(|d| d.is_error()).count();
        let warnings = self
            .diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
            .count();
        let mut text = if self.is_valid {
            format!("Code is valid with {warnings} warning(s):")
        } else {
            format!("Found {errors} error(s) and {warnings} warning(s):")
        };
        for diagnostic in &self.diagnostics {
            text.push_str("\n- ");
            text.push_str(&diagnostic.summary());
        }
        text
    }
}

fn to_json(value: &impl Serialize) -> Result<serde_json::Value, McpError> {
    serde_json::to_value(value).map_err(|e| McpError::internal_error(e.to_string(), None))
}

fn text_resource(uri: &str, value: &impl Serialize) -> Result<ReadResourceResult, McpError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(ReadResourceResult {
        contents: vec![ResourceContents::TextResourceContents {
            uri: uri.to_string(),
            mime_type: Some(JSON_MIME.to_string()),
            text,
            meta: None,
        }],
    })
}

fn json_resource(uri: String, name: String, description: String) -> Annotated<RawResource> {
    Annotated {
        raw: RawResource {
            uri,
            name,
            title: None,
            description: Some(description),
            mime_type: Some(JSON_MIME.to_string()),
            size: None,
            icons: None,
            meta: None,
        },
        annotations: None,
    }
}

/// Context id named by a `repl://sessions/{id}/state` URI.
fn session_id(uri: &str) -> Option<&str> {
    let id = uri.strip_prefix(SESSION_PREFIX)?.strip_suffix(SESSION_SUFFIX)?;
    (!id.is_empty() && !id.contains('/')).then_some(id)
}

/// The C# REPL MCP server.
#[derive(Clone)]
pub struct CsReplServer {
    repl: Repl,
    tool_router: ToolRouter<Self>,
}

impl std::fmt::Debug for CsReplServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsReplServer")
            .field("repl", &self.repl)
            .finish_non_exhaustive()
    }
}

#[tool_router]
impl CsReplServer {
    /// Server backed by `repl`.
    #[must_use]
    pub fn new(repl: Repl) -> Self {
        Self {
            repl,
            tool_router: Self::tool_router(),
        }
    }

    /// Compile and run C# code.
    #[tool(
        name = "EvaluateCsharp",
        description = "Compile and run C# code in a fresh, isolated process. Returns captured console output, or compile diagnostics / the runtime error. Each call starts from a clean state."
    )]
    async fn evaluate_csharp(
        &self,
        Parameters(params): Parameters<EvaluateParams>,
    ) -> Result<CallToolResult, McpError> {
        let timeout = match params.timeout_seconds {
            Some(secs) if !(1..=MAX_TIMEOUT_SECONDS).contains(&secs) => {
                return Err(McpError::invalid_params(
                    format!("timeoutSeconds must be between 1 and {MAX_TIMEOUT_SECONDS}, got {secs}"),
                    None,
                ));
            }
            other => other.map(Duration::from_secs),
        };

        if let Some(id) = params.context_id.as_deref()
            && (id.is_empty() || id.contains('/'))
        {
            return Err(McpError::invalid_params(
                format!("contextId must be non-empty and must not contain '/', got {id:?}"),
                None,
            ));
        }

        info!(
            code_len = params.code.len(),
            context_id = ?params.context_id,
            ?timeout,
            "EvaluateCsharp"
        );

        let request = ExecuteRequest {
            code: params.code,
            context_id: params.context_id,
            timeout,
        };
        let result = self.repl.execute_code(request).await;

        let content = vec![Content::text(result.to_text())];
        let mut response = if result.success {
            CallToolResult::success(content)
        } else {
            CallToolResult::error(content)
        };
        response.structured_content = Some(to_json(&result)?);
        Ok(response)
    }

    /// Compile C# code without running it.
    #[tool(
        name = "ValidateCsharp",
        description = "Check C# code for compile errors and warnings without running it."
    )]
    async fn validate_csharp(
        &self,
        Parameters(params): Parameters<ValidateParams>,
    ) -> Result<CallToolResult, McpError> {
        let report = ValidationReport::new(self.repl.validate_code(&params.code).await);
        let mut response = CallToolResult::success(vec![Content::text(report.to_text())]);
        response.structured_content = Some(to_json(&report)?);
        Ok(response)
    }

    /// Drop context bookkeeping.
    #[tool(
        name = "ResetRepl",
        description = "Forget one execution context, or all of them. Executions are stateless, so this only clears bookkeeping."
    )]
    async fn reset_repl(
        &self,
        Parameters(params): Parameters<ResetParams>,
    ) -> Result<CallToolResult, McpError> {
        let dropped = self.repl.reset(params.context_id.as_deref());
        let text = match params.context_id {
            Some(id) if dropped == 0 => format!("Context '{id}' was not found."),
            Some(id) => format!("Context '{id}' was reset."),
            None => format!("Reset {dropped} context(s)."),
        };
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    /// Describe the REPL.
    #[tool(
        name = "GetReplInfo",
        description = "Describe the C# REPL: SDK and runtime versions, target framework, implicit usings, limits and active contexts."
    )]
    async fn get_repl_info(&self) -> Result<CallToolResult, McpError> {
        let info = to_json(&self.repl.info())?;
        let text = serde_json::to_string_pretty(&info)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        let mut response = CallToolResult::success(vec![Content::text(text)]);
        response.structured_content = Some(info);
        Ok(response)
    }
}

impl CsReplServer {
    fn resources(&self) -> Vec<Annotated<RawResource>> {
        let mut resources = vec![
            json_resource(
                STATE_URI.to_string(),
                "REPL state".to_string(),
                "Compiler, runtime, limits and active context count".to_string(),
            ),
            json_resource(
                SESSIONS_URI.to_string(),
                "Sessions".to_string(),
                "Metadata for every known context, most recently used first".to_string(),
            ),
        ];
        resources.extend(self.repl.contexts().into_iter().map(|context| {
            json_resource(
                format!("{SESSION_PREFIX}{}{SESSION_SUFFIX}", context.context_id),
                format!("Session {}", context.context_id),
                format!("{} execution(s)", context.execution_count),
            )
        }));
        resources
    }

    fn read(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        match uri {
            STATE_URI => text_resource(uri, &self.repl.info()),
            SESSIONS_URI => text_resource(uri, &self.repl.contexts()),
            _ => {
                let id = session_id(uri).ok_or_else(|| {
                    McpError::resource_not_found(format!("Unknown resource: {uri}"), None)
                })?;
                let context = self.repl.context(id).ok_or_else(|| {
                    McpError::resource_not_found(format!("Unknown session: {id}"), None)
                })?;
                text_resource(uri, &context)
            }
        }
    }

    /// Serve over stdio until the client disconnects.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    pub async fn serve_stdio(self) -> anyhow::Result<()> {
        info!("Serving MCP on stdio");
        let service = self
            .serve(stdio())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;
        service
            .waiting()
            .await
            .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;
        info!("MCP client disconnected");
        Ok(())
    }
}

#[tool_handler]
impl ServerHandler for CsReplServer {
    fn get_info(&self) -> ServerInfo {
        let mut server_info = Implementation::from_build_env();
        server_info.name = "csrepl".to_string();
        server_info.version = env!("CARGO_PKG_VERSION").to_string();

        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
            server_info,
            instructions: Some(
                "C# REPL backed by the .NET SDK.\n\n\
                 Tools:\n\
                 - EvaluateCsharp: compile and run code, returns output or errors\n\
                 - ValidateCsharp: compile only, returns diagnostics\n\
                 - ResetRepl: clear context bookkeeping\n\
                 - GetReplInfo: versions, usings and limits\n\n\
                 Every execution runs in a fresh process; variables do not carry over \
                 between calls. Resources: repl://state, repl://sessions, \
                 repl://sessions/{contextId}/state."
                    .to_string(),
            ),
        }
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        Ok(ListResourcesResult {
            resources: self.resources(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        Ok(ListResourceTemplatesResult {
            resource_templates: vec![Annotated {
                raw: RawResourceTemplate {
                    uri_template: format!("{SESSION_PREFIX}{{contextId}}{SESSION_SUFFIX}"),
                    name: "Session state".to_string(),
                    title: None,
                    description: Some("Metadata for one execution context".to_string()),
                    mime_type: Some(JSON_MIME.to_string()),
                    icons: None,
                },
                annotations: None,
            }],
            next_cursor: None,
            meta: None,
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        self.read(request.uri.as_str())
    }
}
