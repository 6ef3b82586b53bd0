//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use csrepl::{Repl, ResourceLimits, ToolchainConfig};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// `key=value` lines.
    Logfmt,
}

/// MCP server exposing a sandboxed C# REPL over stdio.
#[derive(Parser, Debug, Clone)]
#[command(name = "csrepl-server")]
#[command(version, about, long_about = None)]
pub struct ServerArgs {
    /// Path to the `dotnet` host (default: $DOTNET_ROOT, then PATH)
    #[arg(long, env = "CSREPL_DOTNET")]
    pub dotnet: Option<PathBuf>,

    /// Pin an installed SDK version instead of using the newest
    #[arg(long, env = "CSREPL_SDK_VERSION")]
    pub sdk_version: Option<String>,

    /// Default execution timeout in seconds
    #[arg(long, env = "CSREPL_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    /// Compiler timeout in seconds
    #[arg(long, env = "CSREPL_COMPILE_TIMEOUT_SECS", default_value_t = 60)]
    pub compile_timeout_secs: u64,

    /// Maximum captured output per execution, in bytes
    #[arg(long, env = "CSREPL_MAX_OUTPUT_BYTES", default_value_t = 1024 * 1024)]
    pub max_output_bytes: usize,

    /// GC heap limit per execution, in MiB (0 disables the limit)
    #[arg(long, env = "CSREPL_MAX_MEMORY_MB", default_value_t = 512)]
    pub max_memory_mb: u64,

    /// Maximum concurrently running executions
    #[arg(long, env = "CSREPL_MAX_CONCURRENT", default_value_t = 4)]
    pub max_concurrent: usize,

    /// Log format written to stderr
    #[arg(long, env = "CSREPL_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "CSREPL_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

impl ServerArgs {
    /// Where to find the .NET toolchain.
    #[must_use]
    pub fn toolchain(&self) -> ToolchainConfig {
        ToolchainConfig {
            dotnet: self.dotnet.clone(),
            sdk_version: self.sdk_version.clone(),
        }
    }

    /// Per-execution limits.
    ///
    /// # Errors
    ///
    /// Returns [`csrepl::Error::Config`] if the memory limit doesn't fit in bytes.
    pub fn resource_limits(&self) -> Result<ResourceLimits, csrepl::Error> {
        let max_memory_bytes = match self.max_memory_mb {
            0 => None,
            mb => Some(mb.checked_mul(1024 * 1024).ok_or_else(|| {
                csrepl::Error::Config(format!("max memory of {mb} MiB is too large"))
            })?),
        };
        Ok(ResourceLimits {
            execution_timeout: Duration::from_secs(self.timeout_secs),
            max_output_bytes: self.max_output_bytes,
            max_memory_bytes,
            max_concurrent_executions: self.max_concurrent,
        })
    }

    /// Discover the toolchain and build the REPL.
    ///
    /// # Errors
    ///
    /// Returns an error if a limit is invalid or no usable .NET SDK is found.
    pub async fn build_repl(&self) -> Result<Repl, csrepl::Error> {
        Repl::builder()
            .with_toolchain(self.toolchain())
            .with_resource_limits(self.resource_limits()?)
            .with_compile_timeout(Duration::from_secs(self.compile_timeout_secs))
            .build()
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = ServerArgs::try_parse_from(["csrepl-server"]).unwrap();
        assert_eq!(args.timeout_secs, 30);
        assert_eq!(args.log_format, LogFormat::Text);
        assert!(args.metrics_addr.is_none());

        let limits = args.resource_limits().unwrap();
        assert_eq!(limits.execution_timeout, Duration::from_secs(30));
        assert_eq!(limits.max_memory_bytes, Some(512 * 1024 * 1024));
        assert_eq!(limits.max_output_bytes, 1024 * 1024);
    }

    #[test]
    fn zero_memory_disables_heap_limit() {
        let args = ServerArgs::try_parse_from(["csrepl-server", "--max-memory-mb", "0"]).unwrap();
        assert_eq!(args.resource_limits().unwrap().max_memory_bytes, None);
    }

    #[test]
    fn oversized_memory_limit_is_a_config_error() {
        let huge = u64::MAX.to_string();
        let args = ServerArgs::try_parse_from(["csrepl-server", "--max-memory-mb", huge.as_str()]).unwrap();
        assert!(matches!(args.resource_limits(), Err(csrepl::Error::Config(_))));
    }

    #[test]
    fn flags_map_onto_config() {
        let args = ServerArgs::try_parse_from([
            "csrepl-server",
            "--dotnet",
            "/opt/dotnet/dotnet",
            "--sdk-version",
            "8.0.404",
            "--timeout-secs",
            "5",
            "--log-format",
            "logfmt",
            "--metrics-addr",
            "127.0.0.1:9000",
        ])
        .unwrap();

        let toolchain = args.toolchain();
        assert_eq!(toolchain.dotnet, Some(PathBuf::from("/opt/dotnet/dotnet")));
        assert_eq!(toolchain.sdk_version.as_deref(), Some("8.0.404"));
        assert_eq!(args.resource_limits().unwrap().execution_timeout, Duration::from_secs(5));
        assert_eq!(args.log_format, LogFormat::Logfmt);
        assert_eq!(args.metrics_addr, Some("127.0.0.1:9000".parse().unwrap()));
    }
}
