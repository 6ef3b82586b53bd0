//! # csrepl
//!
//! Compile and run untrusted C# snippets in disposable execution domains.
//!
//! The C# compiler and runtime are the local .NET SDK's own. Each run gets:
//!
//! - **A fresh execution domain** - a scratch directory and a dedicated child process
//! - **Execution-local output capture** - stdout and stderr merged, capped, never shared
//! - **A hard timeout** - the domain process is killed when the deadline passes
//! - **Guaranteed cleanup** - the process is reaped and the directory removed on every path
//!
//! Context ids are bookkeeping only; runs never share state.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use csrepl::{ExecuteRequest, Repl};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), csrepl::Error> {
//!     let repl = Repl::builder().build().await?;
//!
//!     let result = repl
//!         .execute_code(ExecuteRequest::new(r#"Console.WriteLine("Hello from C#!");"#))
//!         .await;
//!
//!     println!("{}", result.to_text());
//!     Ok(())
//! }
//! ```

pub mod compiler;
mod error;
pub mod executor;
mod repl;
pub mod session;

pub use compiler::{
    Compile, CompilationResult, CompilationUnit, CompiledImage, CompilerInfo, CsharpCompiler,
    Diagnostic, Severity, Toolchain, ToolchainConfig, VALIDATION_ERROR,
};
pub use error::Error;
pub use executor::{
    DotnetLauncher, ErrorKind, Execute, ExecutionOutcome, IsolatedExecutor, Launcher,
    ResourceLimits,
};
pub use repl::{ExecuteRequest, ExecutionResult, Repl, ReplBuilder, ReplInfo};
pub use session::{ContextMetadata, ContextRegistry};
