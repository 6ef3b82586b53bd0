//! Turning C# source text into an in-memory executable image.
//!
//! [`CsharpCompiler`] drives the SDK's `csc.dll` in a scratch directory per
//! call. Both [`Compile::compile`] and [`Compile::validate`] go through the same
//! invocation and the same diagnostic mapping, so the two can never disagree
//! about whether a piece of source is valid.

pub mod diagnostics;
pub mod toolchain;

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;

use crate::error::Error;

pub use diagnostics::{Diagnostic, Severity, VALIDATION_ERROR};
pub use toolchain::{DotnetVersion, Toolchain, ToolchainConfig};

/// Namespaces imported into every compilation.
pub const IMPLICIT_USINGS: &[&str] = &[
    "System",
    "System.Collections.Generic",
    "System.Linq",
    "System.Text",
    "System.Threading",
    "System.Threading.Tasks",
];

/// Default wall-clock limit for one compiler invocation.
pub const DEFAULT_COMPILE_TIMEOUT: Duration = Duration::from_secs(60);

const SOURCE_FILE: &str = "Program.cs";
const USINGS_FILE: &str = "GlobalUsings.g.cs";

/// Source text to compile.
#[derive(Debug, Clone)]
pub struct CompilationUnit {
    /// C# source. Top-level statements and an explicit `Main` both work.
    pub source: String,
    /// Assembly name. A fresh unique name is used when `None`.
    pub assembly_name: Option<String>,
}

impl CompilationUnit {
    /// A unit with a generated assembly name.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            assembly_name: None,
        }
    }

    /// Use a fixed assembly name. See [`is_valid_assembly_name`]; an invalid
    /// name fails compilation with a `VALIDATION_ERROR` diagnostic.
    #[must_use]
    pub fn with_assembly_name(mut self, name: impl Into<String>) -> Self {
        self.assembly_name = Some(name.into());
        self
    }
}

/// Whether `name` can be used as an assembly name.
///
/// Names become file names inside scratch directories, so they are limited to
/// `[A-Za-z_][A-Za-z0-9_.]*`.
#[must_use]
pub fn is_valid_assembly_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// A fresh assembly name, unique per call.
#[must_use]
pub fn unique_assembly_name() -> String {
    format!("csrepl_{}", uuid::Uuid::new_v4().simple())
}

/// An emitted executable image and its portable PDB.
#[derive(Clone)]
pub struct CompiledImage {
    assembly_name: String,
    binary: Vec<u8>,
    symbols: Option<Vec<u8>>,
}

impl std::fmt::Debug for CompiledImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledImage")
            .field("assembly_name", &self.assembly_name)
            .field("binary_len", &self.binary.len())
            .field("symbols_len", &self.symbols.as_ref().map(Vec::len))
            .finish()
    }
}

impl CompiledImage {
    /// Wrap already emitted bytes.
    #[must_use]
    pub fn new(assembly_name: impl Into<String>, binary: Vec<u8>, symbols: Option<Vec<u8>>) -> Self {
        Self {
            assembly_name: assembly_name.into(),
            binary,
            symbols,
        }
    }

    /// Name the image was compiled under.
    #[must_use]
    pub fn assembly_name(&self) -> &str {
        &self.assembly_name
    }

    /// The executable image.
    #[must_use]
    pub fn binary(&self) -> &[u8] {
        &self.binary
    }

    /// The debug-symbol image, if one was emitted.
    #[must_use]
    pub fn symbols(&self) -> Option<&[u8]> {
        self.symbols.as_deref()
    }
}

/// Output of a compilation.
///
/// The image is present iff the compilation succeeded. Diagnostics only ever
/// contain Error and Warning entries, in the order the compiler emitted them.
#[derive(Debug, Clone)]
pub struct CompilationResult {
    assembly_name: String,
    image: Option<CompiledImage>,
    diagnostics: Vec<Diagnostic>,
}

impl CompilationResult {
    /// A successful compilation, possibly with warnings.
    #[must_use]
    pub fn succeeded(image: CompiledImage, warnings: Vec<Diagnostic>) -> Self {
        Self {
            assembly_name: image.assembly_name.clone(),
            image: Some(image),
            diagnostics: warnings,
        }
    }

    /// A failed compilation. Always carries at least one error.
    #[must_use]
    pub fn failed(assembly_name: impl Into<String>, mut diagnostics: Vec<Diagnostic>) -> Self {
        if !diagnostics.iter().any(Diagnostic::is_error) {
            diagnostics.push(Diagnostic::internal("compilation failed without diagnostics"));
        }
        Self {
            assembly_name: assembly_name.into(),
            image: None,
            diagnostics,
        }
    }

    /// Whether an image was emitted.
    #[must_use]
    pub fn success(&self) -> bool {
        self.image.is_some()
    }

    /// Assembly name used for this compilation.
    #[must_use]
    pub fn assembly_name(&self) -> &str {
        &self.assembly_name
    }

    /// The emitted image, if any.
    #[must_use]
    pub fn image(&self) -> Option<&CompiledImage> {
        self.image.as_ref()
    }

    /// Surfaced diagnostics.
    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Number of Error diagnostics.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.is_error()).count()
    }

    /// Split into image and diagnostics, transferring ownership of the buffers.
    #[must_use]
    pub fn into_parts(self) -> (Option<CompiledImage>, Vec<Diagnostic>) {
        (self.image, self.diagnostics)
    }
}

/// Static description of a compiler, for REPL info queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilerInfo {
    /// SDK version the compiler ships with.
    pub sdk_version: String,
    /// Runtime version programs execute on.
    pub runtime_version: String,
    /// Target framework moniker.
    pub target_framework: String,
    /// Namespaces imported implicitly.
    pub implicit_usings: Vec<String>,
    /// Referenced assembly file names.
    pub references: Vec<String>,
}

/// Something that can compile and validate C# source.
///
/// Implementations must never fail: every problem, including faults of the
/// compiler machinery, comes back as diagnostics.
#[async_trait]
pub trait Compile: Send + Sync {
    /// Compile to an executable image.
    async fn compile(&self, unit: CompilationUnit) -> CompilationResult;

    /// Compile without keeping any output and return the surfaced diagnostics.
    async fn validate(&self, source: &str) -> Vec<Diagnostic>;

    /// Describe the compiler and runtime.
    fn describe(&self) -> CompilerInfo;
}

/// Outcome of one compiler invocation, shared by compile and validate.
struct Invocation {
    image: Option<CompiledImage>,
    diagnostics: Vec<Diagnostic>,
}

impl Invocation {
    fn fault(message: impl Into<String>) -> Self {
        Self {
            image: None,
            diagnostics: vec![Diagnostic::internal(message)],
        }
    }
}

/// The SDK's C# compiler.
#[derive(Debug, Clone)]
pub struct CsharpCompiler {
    toolchain: Arc<Toolchain>,
    timeout: Duration,
    usings_source: String,
}

impl CsharpCompiler {
    /// Discover the toolchain and build a compiler for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the toolchain cannot be resolved.
    pub async fn discover(config: &ToolchainConfig) -> Result<Self, Error> {
        Ok(Self::new(Toolchain::discover(config).await?))
    }

    /// Build a compiler for an already resolved toolchain.
    #[must_use]
    pub fn new(toolchain: Toolchain) -> Self {
        let usings_source = IMPLICIT_USINGS
            .iter()
            .map(|ns| format!("global using {ns};\n"))
            .collect();
        Self {
            toolchain: Arc::new(toolchain),
            timeout: DEFAULT_COMPILE_TIMEOUT,
            usings_source,
        }
    }

    /// Set the per-invocation wall-clock limit.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The toolchain, shared with the executor that hosts compiled images.
    #[must_use]
    pub fn toolchain(&self) -> Arc<Toolchain> {
        Arc::clone(&self.toolchain)
    }

    fn arguments(&self, dir: &Path, assembly_name: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "exec".into(),
            self.toolchain.compiler().into(),
            "-nologo".into(),
            "-noconfig".into(),
            "-nostdlib+".into(),
            "-target:exe".into(),
            "-optimize+".into(),
            "-unsafe-".into(),
            "-langversion:latest".into(),
            "-debug:portable".into(),
            "-deterministic+".into(),
            "-utf8output".into(),
        ];

        let mut out = OsString::from("-out:");
        out.push(dir.join(format!("{assembly_name}.dll")));
        args.push(out);

        let mut pdb = OsString::from("-pdb:");
        pdb.push(dir.join(format!("{assembly_name}.pdb")));
        args.push(pdb);

        for reference in self.toolchain.references() {
            let mut arg = OsString::from("-reference:");
            arg.push(reference);
            args.push(arg);
        }

        args.push(dir.join(SOURCE_FILE).into());
        args.push(dir.join(USINGS_FILE).into());
        args
    }

    async fn invoke(&self, source: &str, assembly_name: &str, keep_image: bool) -> Invocation {
        let dir = match tempfile::Builder::new().prefix("csrepl-compile-").tempdir() {
            Ok(dir) => dir,
            Err(e) => return Invocation::fault(format!("failed to create scratch directory: {e}")),
        };

        if let Err(e) = tokio::fs::write(dir.path().join(SOURCE_FILE), source).await {
            return Invocation::fault(format!("failed to write source: {e}"));
        }
        if let Err(e) = tokio::fs::write(dir.path().join(USINGS_FILE), &self.usings_source).await {
            return Invocation::fault(format!("failed to write implicit usings: {e}"));
        }

        let child = Command::new(self.toolchain.dotnet())
            .args(self.arguments(dir.path(), assembly_name))
            .envs(toolchain::QUIET_ENV.iter().copied())
            .current_dir(dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => return Invocation::fault(format!("failed to start compiler: {e}")),
        };

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Invocation::fault(format!("compiler I/O error: {e}")),
            Err(_) => {
                return Invocation::fault(format!("compiler timed out after {:?}", self.timeout));
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push('\n');
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        let mut diagnostics = diagnostics::surfaced(diagnostics::parse_compiler_output(&text));
        let has_errors = diagnostics.iter().any(Diagnostic::is_error);

        if !output.status.success() {
            if !has_errors {
                let excerpt: String = text.trim().chars().take(500).collect();
                diagnostics.push(Diagnostic::internal(format!(
                    "compiler exited with {}: {excerpt}",
                    output.status
                )));
            }
            return Invocation {
                image: None,
                diagnostics,
            };
        }

        if has_errors || !keep_image {
            return Invocation {
                image: None,
                diagnostics,
            };
        }

        let binary = match tokio::fs::read(dir.path().join(format!("{assembly_name}.dll"))).await {
            Ok(bytes) => bytes,
            Err(e) => {
                diagnostics.push(Diagnostic::internal(format!("failed to read emitted image: {e}")));
                return Invocation {
                    image: None,
                    diagnostics,
                };
            }
        };
        let symbols = tokio::fs::read(dir.path().join(format!("{assembly_name}.pdb")))
            .await
            .ok();

        Invocation {
            image: Some(CompiledImage::new(assembly_name, binary, symbols)),
            diagnostics,
        }
    }
}

#[async_trait]
impl Compile for CsharpCompiler {
    #[tracing::instrument(skip(self, unit), fields(code_len = unit.source.len()))]
    async fn compile(&self, unit: CompilationUnit) -> CompilationResult {
        let start = Instant::now();
        let assembly_name = unit.assembly_name.unwrap_or_else(unique_assembly_name);
        let invocation = if is_valid_assembly_name(&assembly_name) {
            self.invoke(&unit.source, &assembly_name, true).await
        } else {
            Invocation::fault(format!(
                "invalid assembly name {assembly_name:?}: expected [A-Za-z_][A-Za-z0-9_.]*"
            ))
        };

        let result = match invocation.image {
            Some(image) => CompilationResult::succeeded(image, invocation.diagnostics),
            None => CompilationResult::failed(&assembly_name, invocation.diagnostics),
        };

        let label = if result.success() { "success" } else { "failure" };
        metrics::counter!("csrepl_compilations_total", "result" => label).increment(1);
        metrics::histogram!("csrepl_compile_duration_seconds").record(start.elapsed().as_secs_f64());
        tracing::debug!(
            assembly = %assembly_name,
            success = result.success(),
            diagnostics = result.diagnostics().len(),
            elapsed = ?start.elapsed(),
            "Compiled"
        );

        result
    }

    #[tracing::instrument(skip(self, source), fields(code_len = source.len()))]
    async fn validate(&self, source: &str) -> Vec<Diagnostic> {
        let invocation = self.invoke(source, &unique_assembly_name(), false).await;
        metrics::counter!("csrepl_validations_total").increment(1);
        invocation.diagnostics
    }

    fn describe(&self) -> CompilerInfo {
        CompilerInfo {
            sdk_version: self.toolchain.sdk_version().to_string(),
            runtime_version: self.toolchain.runtime_version().to_string(),
            target_framework: self.toolchain.target_framework(),
            implicit_usings: IMPLICIT_USINGS.iter().map(ToString::to_string).collect(),
            references: self
                .toolchain
                .references()
                .iter()
                .filter_map(|path| path.file_name())
                .map(|name| name.to_string_lossy().into_owned())
                .collect(),
        }
    }
}
