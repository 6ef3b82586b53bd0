//! Infrastructure errors.
//!
//! Compilation failures and runtime faults of user code are never errors: they
//! are reported as data through [`CompilationResult`](crate::CompilationResult)
//! and [`ExecutionOutcome`](crate::ExecutionOutcome). This type covers the
//! things that stop the REPL from being set up at all.

use std::path::PathBuf;

/// Errors raised while locating the .NET toolchain or preparing the REPL.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No usable `dotnet` host was found.
    #[error("dotnet host not found: {0}")]
    ToolchainNotFound(String),

    /// The toolchain was found but is missing a required component.
    #[error("incomplete .NET toolchain: {0}")]
    ToolchainIncomplete(String),

    /// A path that the toolchain reported does not exist.
    #[error("missing toolchain file: {}", .0.display())]
    MissingFile(PathBuf),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
