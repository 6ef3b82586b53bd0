//! The request-level API: execute, validate, reset, describe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::compiler::{
    Compile, CompilationUnit, CompilerInfo, CsharpCompiler, DEFAULT_COMPILE_TIMEOUT, Diagnostic,
    ToolchainConfig,
};
use crate::error::Error;
use crate::executor::{ErrorKind, Execute, IsolatedExecutor, ResourceLimits};
use crate::session::{ContextMetadata, ContextRegistry};

/// One "run this code" request.
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    /// C# source.
    pub code: String,
    /// Context to attribute the run to. A fresh id is generated when `None`.
    pub context_id: Option<String>,
    /// Wall-clock limit. The executor default applies when `None`.
    pub timeout: Option<Duration>,
}

impl ExecuteRequest {
    /// Request with default context and timeout.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }

    /// Attribute the run to a context.
    #[must_use]
    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Override the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Uniform result of an execute request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Whether the code compiled and ran without an unhandled exception.
    pub success: bool,
    /// Captured program output.
    pub output: String,
    /// What went wrong, on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Compiler diagnostics, when compilation failed.
    #[serde(default)]
    pub compilation_errors: Vec<Diagnostic>,
    /// Non-zero exit code returned by the program.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<i32>,
    /// Context the run was attributed to.
    pub context_id: String,
    /// Compile plus run time in milliseconds.
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    /// Plain-text rendering for humans and LLM clients.
    #[must_use]
    pub fn to_text(&self) -> String {
        if self.success {
            let mut text = if self.output.is_empty() {
                "(no output)".to_string()
            } else {
                self.output.clone()
            };
            if let Some(value) = self.return_value {
                text.push_str(&format!("\n[return value: {value}]"));
            }
            return text;
        }

        let mut text = format!(
            "Error: {}",
            self.error_message.as_deref().unwrap_or("unknown error")
        );
        if !self.compilation_errors.is_empty() {
            text.push_str("\n\nCompilation errors:");
            for diagnostic in &self.compilation_errors {
                text.push_str("\n- ");
                text.push_str(&diagnostic.summary());
            }
        }
        if !self.output.is_empty() {
            text.push_str("\n\nOutput:\n");
            text.push_str(&self.output);
        }
        text
    }
}

/// Static and live facts about the REPL.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplInfo {
    /// Crate version.
    pub version: String,
    /// Compiler and runtime description.
    #[serde(flatten)]
    pub compiler: CompilerInfo,
    /// Timeout applied when a request doesn't name one.
    pub default_timeout_seconds: u64,
    /// Output capture limit.
    pub max_output_bytes: usize,
    /// Contexts currently known.
    pub active_contexts: usize,
    /// Executions never share state, whatever context they name.
    pub stateless: bool,
}

/// Compiler + executor + context bookkeeping behind one façade.
#[derive(Clone)]
pub struct Repl {
    compiler: Arc<dyn Compile>,
    executor: Arc<dyn Execute>,
    registry: Arc<ContextRegistry>,
}

impl std::fmt::Debug for Repl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repl")
            .field("contexts", &self.registry.len())
            .field("limits", self.executor.limits())
            .finish_non_exhaustive()
    }
}

impl Repl {
    /// Builder for a REPL on the local .NET SDK.
    #[must_use]
    pub fn builder() -> ReplBuilder {
        ReplBuilder::new()
    }

    /// Assemble a REPL from parts.
    #[must_use]
    pub fn new(compiler: Arc<dyn Compile>, executor: Arc<dyn Execute>) -> Self {
        Self {
            compiler,
            executor,
            registry: Arc::new(ContextRegistry::new()),
        }
    }

    /// Compile and run `request.code`.
    ///
    /// Every failure (compile errors, missing entry point, timeout, unhandled
    /// exception) is reported in the result rather than as an error.
    #[instrument(skip(self, request), fields(code_len = request.code.len(), context_id = tracing::field::Empty))]
    pub async fn execute_code(&self, request: ExecuteRequest) -> ExecutionResult {
        let start = Instant::now();
        let context_id = request
            .context_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        tracing::Span::current().record("context_id", context_id.as_str());
        let context = self.registry.touch(&context_id);

        let compilation = self.compiler.compile(CompilationUnit::new(request.code)).await;
        let outcome = self.executor.run(compilation, request.timeout).await;

        let result = ExecutionResult {
            success: outcome.success,
            output: outcome.output,
            error_message: outcome.error_message,
            compilation_errors: if outcome.error_kind == Some(ErrorKind::CompilationFailed) {
                outcome.diagnostics
            } else {
                Vec::new()
            },
            return_value: outcome.return_value,
            context_id,
            execution_time_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        info!(
            success = result.success,
            executions = context.execution_count,
            elapsed_ms = result.execution_time_ms,
            "Executed code"
        );
        result
    }

    /// Compile without running and return the diagnostics as the compiler
    /// reported them. Doesn't touch any context.
    #[instrument(skip(self, code), fields(code_len = code.len()))]
    pub async fn validate_code(&self, code: &str) -> Vec<Diagnostic> {
        self.compiler.validate(code).await
    }

    /// Forget one context, or all of them. Returns how many were dropped.
    pub fn reset(&self, context_id: Option<&str>) -> usize {
        let dropped = match context_id {
            Some(id) => usize::from(self.registry.remove(id)),
            None => self.registry.clear(),
        };
        info!(context_id, dropped, "Reset contexts");
        dropped
    }

    /// Describe the REPL.
    #[must_use]
    pub fn info(&self) -> ReplInfo {
        let limits = self.executor.limits();
        ReplInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            compiler: self.compiler.describe(),
            default_timeout_seconds: limits.execution_timeout.as_secs(),
            max_output_bytes: limits.max_output_bytes,
            active_contexts: self.registry.len(),
            stateless: true,
        }
    }

    /// Metadata for one context.
    #[must_use]
    pub fn context(&self, context_id: &str) -> Option<ContextMetadata> {
        self.registry.get(context_id)
    }

    /// Metadata for every context, most recently used first.
    #[must_use]
    pub fn contexts(&self) -> Vec<ContextMetadata> {
        self.registry.snapshot()
    }

    /// The context registry.
    #[must_use]
    pub fn registry(&self) -> &ContextRegistry {
        &self.registry
    }
}

/// Builder for a [`Repl`] on the local .NET SDK.
#[derive(Debug, Clone)]
pub struct ReplBuilder {
    toolchain: ToolchainConfig,
    limits: ResourceLimits,
    compile_timeout: Duration,
}

impl Default for ReplBuilder {
    fn default() -> Self {
        Self {
            toolchain: ToolchainConfig::default(),
            limits: ResourceLimits::default(),
            compile_timeout: DEFAULT_COMPILE_TIMEOUT,
        }
    }
}

impl ReplBuilder {
    /// Builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Where to find the .NET toolchain.
    #[must_use]
    pub fn with_toolchain(mut self, toolchain: ToolchainConfig) -> Self {
        self.toolchain = toolchain;
        self
    }

    /// Limits for every execution.
    #[must_use]
    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Wall-clock limit for one compiler invocation.
    #[must_use]
    pub const fn with_compile_timeout(mut self, timeout: Duration) -> Self {
        self.compile_timeout = timeout;
        self
    }

    /// Discover the toolchain and build the REPL.
    ///
    /// # Errors
    ///
    /// Returns an error if a limit is zero or the toolchain can't be resolved.
    pub async fn build(self) -> Result<Repl, Error> {
        if self.limits.execution_timeout.is_zero() {
            return Err(Error::Config("execution timeout must be positive".to_string()));
        }
        if self.compile_timeout.is_zero() {
            return Err(Error::Config("compile timeout must be positive".to_string()));
        }
        if self.limits.max_output_bytes == 0 {
            return Err(Error::Config("max output bytes must be positive".to_string()));
        }
        if self.limits.max_concurrent_executions == 0 {
            return Err(Error::Config(
                "max concurrent executions must be positive".to_string(),
            ));
        }

        let compiler = CsharpCompiler::discover(&self.toolchain)
            .await?
            .with_timeout(self.compile_timeout);
        let executor = IsolatedExecutor::dotnet(compiler.toolchain(), self.limits);
        Ok(Repl::new(Arc::new(compiler), Arc::new(executor)))
    }
}
