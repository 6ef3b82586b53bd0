//! Running compiled images in throwaway execution domains.
//!
//! Every run gets its own [`domain`] (a scratch directory and a child process)
//! and its own capture buffer. Nothing is shared between runs except the
//! concurrency permits, so two runs can never see each other's output.
//!
//! Timeouts are hard: when the deadline passes the domain process is killed,
//! so CPU-bound loops are stopped rather than abandoned.

mod capture;
pub mod domain;
pub mod image;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::compiler::{
    CompilationResult, CompiledImage, Diagnostic, Toolchain, is_valid_assembly_name,
};
use capture::{Capture, Stream};
use domain::{ExecutionDomain, UnloadReport};

/// How long pipes may keep draining after the process is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Resource limits for one execution.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Wall-clock limit used when a run doesn't name its own.
    pub execution_timeout: Duration,
    /// Maximum captured output in bytes. Excess is dropped and marked.
    pub max_output_bytes: usize,
    /// GC heap hard limit for the domain process.
    pub max_memory_bytes: Option<u64>,
    /// Maximum number of domains running at once.
    pub max_concurrent_executions: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(30),
            max_output_bytes: 1024 * 1024,              // 1 MiB
            max_memory_bytes: Some(512 * 1024 * 1024), // 512 MiB
            max_concurrent_executions: 4,
        }
    }
}

/// Why a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// The source didn't compile; nothing ran.
    CompilationFailed,
    /// The image designates no entry point.
    EntryPointNotFound,
    /// The deadline passed and the process was killed.
    Timeout,
    /// The program ended with an unhandled exception.
    RuntimeException,
    /// The program ran out of memory.
    OutOfMemory,
    /// The domain itself could not be set up.
    Internal,
}

impl ErrorKind {
    /// Stable lowercase label, used for metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CompilationFailed => "compilation_failed",
            Self::EntryPointNotFound => "entry_point_not_found",
            Self::Timeout => "timeout",
            Self::RuntimeException => "runtime_exception",
            Self::OutOfMemory => "out_of_memory",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running one compilation.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Whether the program ran to completion without an unhandled exception.
    pub success: bool,
    /// Captured stdout and stderr, merged in arrival order.
    pub output: String,
    /// The program's exit code, when it returned a non-zero one.
    pub return_value: Option<i32>,
    /// Failure classification.
    pub error_kind: Option<ErrorKind>,
    /// Failure description.
    pub error_message: Option<String>,
    /// Compiler diagnostics, when compilation failed.
    pub diagnostics: Vec<Diagnostic>,
    /// Time from the start of the run to the end of unloading.
    pub duration: Duration,
    /// How the domain was torn down, if one was created.
    pub unload: Option<UnloadReport>,
}

impl ExecutionOutcome {
    /// A failed outcome with no output.
    #[must_use]
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            return_value: None,
            error_kind: Some(kind),
            error_message: Some(message.into()),
            diagnostics: Vec::new(),
            duration: Duration::ZERO,
            unload: None,
        }
    }

    /// Outcome for a compilation that produced no image.
    #[must_use]
    pub fn compilation_failed(diagnostics: Vec<Diagnostic>) -> Self {
        let errors = diagnostics.iter().filter(|d| d.is_error()).count();
        Self {
            diagnostics,
            ..Self::failure(
                ErrorKind::CompilationFailed,
                format!("Compilation failed with {errors} error(s)"),
            )
        }
    }

    /// A program that ran to completion.
    #[must_use]
    pub fn completed(output: String, return_value: Option<i32>) -> Self {
        Self {
            success: true,
            output,
            return_value,
            error_kind: None,
            error_message: None,
            diagnostics: Vec::new(),
            duration: Duration::ZERO,
            unload: None,
        }
    }
}

/// Knows how to host an image in a domain.
///
/// [`DotnetLauncher`] is the real implementation. Anything that can check an
/// image for an entry point and produce a command to run it will do.
pub trait Launcher: Send + Sync + fmt::Debug {
    /// Resolve the image's designated entry point.
    ///
    /// # Errors
    ///
    /// Returns a description of why there is no entry point.
    fn entry_point(&self, image: &CompiledImage) -> Result<u32, String>;

    /// Materialize the image inside `domain` and build the command that runs it.
    ///
    /// # Errors
    ///
    /// Returns an error if files can't be written into the domain.
    fn prepare(
        &self,
        domain: &Path,
        image: &CompiledImage,
        limits: &ResourceLimits,
    ) -> std::io::Result<Command>;
}

/// Hosts images with `dotnet exec` on the toolchain's shared framework.
#[derive(Debug, Clone)]
pub struct DotnetLauncher {
    toolchain: Arc<Toolchain>,
}

impl DotnetLauncher {
    /// Launcher for the given toolchain.
    #[must_use]
    pub const fn new(toolchain: Arc<Toolchain>) -> Self {
        Self { toolchain }
    }
}

impl Launcher for DotnetLauncher {
    fn entry_point(&self, image: &CompiledImage) -> Result<u32, String> {
        image::entry_point_token(image.binary()).map_err(|e| e.to_string())
    }

    fn prepare(
        &self,
        domain: &Path,
        image: &CompiledImage,
        limits: &ResourceLimits,
    ) -> std::io::Result<Command> {
        let name = image.assembly_name();
        let assembly = domain.join(format!("{name}.dll"));
        let runtime_config = domain.join(format!("{name}.runtimeconfig.json"));

        std::fs::write(&assembly, image.binary())?;
        if let Some(symbols) = image.symbols() {
            std::fs::write(domain.join(format!("{name}.pdb")), symbols)?;
        }
        std::fs::write(
            &runtime_config,
            serde_json::to_vec_pretty(&self.toolchain.runtime_config())?,
        )?;

        let mut command = Command::new(self.toolchain.dotnet());
        command
            .arg("exec")
            .arg("--runtimeconfig")
            .arg(&runtime_config)
            .arg(&assembly)
            .envs(crate::compiler::toolchain::QUIET_ENV.iter().copied())
            .env("DOTNET_gcServer", "0");
        if let Some(bytes) = limits.max_memory_bytes {
            command.env("DOTNET_GCHeapHardLimit", format!("{bytes:#x}"));
        }
        Ok(command)
    }
}

/// Something that runs compilations.
#[async_trait]
pub trait Execute: Send + Sync {
    /// Run a compilation, consuming it. Never fails; every failure is data.
    async fn run(&self, compilation: CompilationResult, timeout: Option<Duration>) -> ExecutionOutcome;

    /// Limits applied to every run.
    fn limits(&self) -> &ResourceLimits;
}

/// Runs each image in a fresh domain with hard timeouts.
#[derive(Debug, Clone)]
pub struct IsolatedExecutor {
    launcher: Arc<dyn Launcher>,
    limits: ResourceLimits,
    permits: Arc<Semaphore>,
}

impl IsolatedExecutor {
    /// Executor using a custom launcher.
    #[must_use]
    pub fn new(launcher: impl Launcher + 'static, limits: ResourceLimits) -> Self {
        let permits = Arc::new(Semaphore::new(limits.max_concurrent_executions.max(1)));
        Self {
            launcher: Arc::new(launcher),
            limits,
            permits,
        }
    }

    /// Executor hosting images on the given toolchain.
    #[must_use]
    pub fn dotnet(toolchain: Arc<Toolchain>, limits: ResourceLimits) -> Self {
        Self::new(DotnetLauncher::new(toolchain), limits)
    }

    async fn run_image(&self, image: CompiledImage, timeout: Duration) -> ExecutionOutcome {
        if !is_valid_assembly_name(image.assembly_name()) {
            return ExecutionOutcome::failure(
                ErrorKind::Internal,
                format!("invalid assembly name {:?}", image.assembly_name()),
            );
        }
        if let Err(reason) = self.launcher.entry_point(&image) {
            return ExecutionOutcome::failure(
                ErrorKind::EntryPointNotFound,
                format!("No entry point found in compiled assembly: {reason}"),
            );
        }

        let Ok(_permit) = self.permits.acquire().await else {
            return ExecutionOutcome::failure(ErrorKind::Internal, "executor is shut down");
        };

        let mut domain = match ExecutionDomain::create(image.assembly_name()) {
            Ok(domain) => domain,
            Err(e) => {
                return ExecutionOutcome::failure(
                    ErrorKind::Internal,
                    format!("failed to create execution domain: {e}"),
                );
            }
        };

        let mut outcome = self.drive(&mut domain, &image, timeout).await;
        outcome.unload = Some(domain.unload().await);
        drop(image);
        outcome
    }

    async fn drive(
        &self,
        domain: &mut ExecutionDomain,
        image: &CompiledImage,
        timeout: Duration,
    ) -> ExecutionOutcome {
        let command = match self.launcher.prepare(domain.path(), image, &self.limits) {
            Ok(command) => command,
            Err(e) => {
                return ExecutionOutcome::failure(
                    ErrorKind::Internal,
                    format!("failed to load image into execution domain: {e}"),
                );
            }
        };

        let (stdout, stderr) = match domain.spawn(command) {
            Ok(pipes) => pipes,
            Err(e) => {
                return ExecutionOutcome::failure(
                    ErrorKind::Internal,
                    format!("failed to start execution domain: {e}"),
                );
            }
        };

        let capture = Capture::new(self.limits.max_output_bytes);
        let mut pumps = vec![
            capture.pump(stdout, Stream::Stdout),
            capture.pump(stderr, Stream::Stderr),
        ];

        let waited = tokio::time::timeout(timeout, domain.wait()).await;
        if waited.is_err() {
            domain.kill();
        }

        let drain = async {
            for pump in &mut pumps {
                let _ = pump.await;
            }
        };
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            debug!("Output pipes still open after exit, abandoning");
            for pump in &pumps {
                pump.abort();
            }
        }
        let captured = capture.finish().await;

        let mut outcome = match waited {
            Err(_) => {
                warn!(?timeout, "Execution timed out, domain killed");
                ExecutionOutcome::failure(
                    ErrorKind::Timeout,
                    format!("Execution timed out after {timeout:?}"),
                )
            }
            Ok(Err(e)) => ExecutionOutcome::failure(
                ErrorKind::Internal,
                format!("failed to wait for execution domain: {e}"),
            ),
            Ok(Ok(status)) => classify(status.code(), killed_by_sigkill(&status), &captured.stderr),
        };
        outcome.output = captured.output;
        outcome
    }
}

#[async_trait]
impl Execute for IsolatedExecutor {
    #[instrument(skip(self, compilation), fields(assembly = %compilation.assembly_name()))]
    async fn run(&self, compilation: CompilationResult, timeout: Option<Duration>) -> ExecutionOutcome {
        let start = Instant::now();
        let timeout = timeout.unwrap_or(self.limits.execution_timeout);

        let (image, diagnostics) = compilation.into_parts();
        let mut outcome = match image {
            Some(image) => self.run_image(image, timeout).await,
            None => ExecutionOutcome::compilation_failed(diagnostics),
        };
        outcome.duration = start.elapsed();

        let label = outcome.error_kind.map_or("success", ErrorKind::as_str);
        metrics::counter!("csrepl_executions_total", "outcome" => label).increment(1);
        metrics::histogram!("csrepl_execution_duration_seconds").record(outcome.duration.as_secs_f64());
        info!(
            outcome = label,
            return_value = ?outcome.return_value,
            duration = ?outcome.duration,
            output_len = outcome.output.len(),
            "Execution finished"
        );

        outcome
    }

    fn limits(&self) -> &ResourceLimits {
        &self.limits
    }
}

#[cfg(unix)]
fn killed_by_sigkill(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(9)
}

#[cfg(not(unix))]
fn killed_by_sigkill(_status: &std::process::ExitStatus) -> bool {
    false
}

/// Lines the `dotnet` host prints when it can't start the program at all.
const HOST_FAILURES: &[&str] = &[
    "You must install or update .NET",
    "You must install .NET",
    "Failed to run as a self-contained app",
    "A fatal error occurred",
    "The library 'libhostfxr",
    "Failed to resolve libhostfxr",
    "Cannot use file stream for",
    "Invalid runtimeconfig.json",
    "The application to execute does not exist",
];

/// Decide how a finished program ended from its exit code and stderr.
///
/// A clean exit is always a success, whatever the program wrote to stderr.
fn classify(code: Option<i32>, sigkill: bool, stderr: &str) -> ExecutionOutcome {
    if code == Some(0) {
        return ExecutionOutcome::completed(String::new(), None);
    }

    let exception = unhandled_exception(stderr);

    let out_of_memory = exception
        .as_deref()
        .is_some_and(|line| line.contains("OutOfMemoryException"))
        || stderr.lines().any(|line| line.trim() == "Out of memory.");
    if out_of_memory || sigkill {
        return ExecutionOutcome::failure(
            ErrorKind::OutOfMemory,
            exception.unwrap_or_else(|| "Out of memory".to_string()),
        );
    }

    if let Some(line) = exception {
        return ExecutionOutcome::failure(ErrorKind::RuntimeException, line);
    }

    if let Some(reason) = host_failure(code, stderr) {
        return ExecutionOutcome::failure(
            ErrorKind::Internal,
            format!("dotnet host could not start the program: {reason}"),
        );
    }

    match code {
        Some(code) => ExecutionOutcome::completed(String::new(), Some(code)),
        None => ExecutionOutcome::failure(
            ErrorKind::RuntimeException,
            "Program was terminated by a signal",
        ),
    }
}

/// Why the host failed, if stderr or the exit code says it did.
///
/// Host error codes are `0x8000_8xxx`; unix truncates them to the low byte,
/// so there only the message identifies them.
fn host_failure(code: Option<i32>, stderr: &str) -> Option<String> {
    let line = stderr
        .lines()
        .map(str::trim)
        .find(|line| HOST_FAILURES.iter().any(|sig| line.starts_with(sig)));
    if let Some(line) = line {
        return Some(line.to_string());
    }
    #[allow(clippy::cast_sign_loss)]
    let host_code = code.filter(|&c| (c as u32) & 0xFFFF_F000 == 0x8000_8000);
    host_code.map(|c| format!("exit code {:#x}", c as u32))
}

/// The exception line of the runtime's unhandled-exception report, e.g.
/// `System.Exception: boom`.
fn unhandled_exception(stderr: &str) -> Option<String> {
    const MARKER: &str = "Unhandled exception.";

    let mut lines = stderr.lines();
    while let Some(line) = lines.next() {
        let Some(rest) = line.trim().strip_prefix(MARKER) else {
            continue;
        };
        let rest = rest.trim();
        if !rest.is_empty() {
            return Some(rest.to_string());
        }
        return Some(
            lines
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("unknown exception")
                .to_string(),
        );
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_exit_is_success() {
        let outcome = classify(Some(0), false, "");
        assert!(outcome.success);
        assert_eq!(outcome.return_value, None);
    }

    #[test]
    fn non_zero_exit_is_a_return_value() {
        let outcome = classify(Some(3), false, "");
        assert!(outcome.success);
        assert_eq!(outcome.return_value, Some(3));
    }

    #[test]
    fn unhandled_exception_is_a_runtime_exception() {
        let stderr = "\
Unhandled exception. System.Exception: boom
   at Program.<Main>$(String[] args) in Program.cs:line 1
";
        let outcome = classify(Some(134), false, stderr);
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::RuntimeException));
        assert_eq!(outcome.error_message.as_deref(), Some("System.Exception: boom"));
    }

    #[test]
    fn exception_on_following_line() {
        let stderr = "Unhandled exception.\n\nSystem.InvalidOperationException: nope\n";
        assert_eq!(
            unhandled_exception(stderr).as_deref(),
            Some("System.InvalidOperationException: nope")
        );
    }

    #[test]
    fn out_of_memory_is_recognized() {
        let stderr = "Unhandled exception. System.OutOfMemoryException: Exception of type 'System.OutOfMemoryException' was thrown.\n";
        let outcome = classify(Some(134), false, stderr);
        assert_eq!(outcome.error_kind, Some(ErrorKind::OutOfMemory));

        let outcome = classify(Some(134), false, "Out of memory.\n");
        assert_eq!(outcome.error_kind, Some(ErrorKind::OutOfMemory));

        let outcome = classify(None, true, "");
        assert_eq!(outcome.error_kind, Some(ErrorKind::OutOfMemory));
    }

    #[test]
    fn ordinary_stderr_is_not_an_exception() {
        let outcome = classify(Some(0), false, "warning: something\n");
        assert!(outcome.success);
    }

    #[test]
    fn clean_exit_ignores_exception_text() {
        let outcome = classify(Some(0), false, "Unhandled exception. System.Exception: printed\n");
        assert!(outcome.success);
        assert_eq!(outcome.error_kind, None);
    }

    #[test]
    fn host_failures_are_internal() {
        let stderr = "\
You must install or update .NET to run this application.

App: /tmp/csrepl-domain-x/app.dll
";
        let outcome = classify(Some(150), false, stderr);
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Internal));
        assert_eq!(outcome.return_value, None);
        assert!(
            outcome
                .error_message
                .as_deref()
                .is_some_and(|m| m.contains("You must install or update .NET"))
        );

        #[allow(clippy::cast_possible_wrap)]
        let code = 0x8000_8096_u32 as i32;
        let outcome = classify(Some(code), false, "");
        assert_eq!(outcome.error_kind, Some(ErrorKind::Internal));
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("dotnet host could not start the program: exit code 0x80008096")
        );
    }

    #[test]
    fn compilation_failure_counts_errors_only() {
        let diagnostics = vec![
            Diagnostic::error("CS1002", "; expected"),
            Diagnostic {
                severity: crate::compiler::Severity::Warning,
                ..Diagnostic::error("CS0168", "unused")
            },
        ];
        let outcome = ExecutionOutcome::compilation_failed(diagnostics);
        assert_eq!(outcome.error_kind, Some(ErrorKind::CompilationFailed));
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("Compilation failed with 1 error(s)")
        );
        assert_eq!(outcome.diagnostics.len(), 2);
    }

    #[test]
    fn default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.execution_timeout, Duration::from_secs(30));
        assert_eq!(limits.max_output_bytes, 1 << 20);
        assert_eq!(limits.max_memory_bytes, Some(512 << 20));
        assert_eq!(limits.max_concurrent_executions, 4);
    }
}
