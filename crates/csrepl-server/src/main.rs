//! csrepl-server: MCP server binary for the C# REPL.
//!
//! Speaks MCP over stdio; all logging goes to stderr.
//!
//! # Usage
//!
//! ```bash
//! csrepl-server --timeout-secs 10 --log-format logfmt
//! RUST_LOG=csrepl=debug csrepl-server
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

use csrepl_server::{CsReplServer, LogFormat, ServerArgs};

fn init_tracing(format: LogFormat) -> Result<Option<SdkTracerProvider>> {
    // Export spans only when an OTLP endpoint is configured.
    let provider = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .build()
            .context("Failed to build OTLP exporter")?;
        let resource = Resource::builder()
            .with_attributes([
                KeyValue::new("service.name", "csrepl-server"),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ])
            .build();
        let provider = SdkTracerProvider::builder()
            .with_resource(resource)
            .with_batch_exporter(exporter)
            .build();
        opentelemetry::global::set_tracer_provider(provider.clone());
        Some(provider)
    } else {
        None
    };

    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("csrepl-server")));

    let fmt_layer = match format {
        LogFormat::Text => fmt::layer().with_writer(std::io::stderr).boxed(),
        LogFormat::Logfmt => fmt::layer()
            .event_format(tracing_logfmt::EventsFormatter::default())
            .fmt_fields(tracing_logfmt::FieldsFormatter::default())
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("csrepl=info,csrepl_server=info"))
        .context("Invalid log filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    Ok(provider)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    let provider = init_tracing(args.log_format)?;

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to start Prometheus exporter")?;
        tracing::info!(%addr, "Serving metrics");
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting csrepl MCP server");

    let repl = args
        .build_repl()
        .await
        .context("Failed to set up the C# toolchain")?;
    tracing::info!(info = ?repl.info(), "REPL ready");

    CsReplServer::new(repl).serve_stdio().await?;

    tracing::info!("Server shutdown complete");

    if let Some(provider) = provider {
        // Shutdown errors are non-fatal at process exit.
        let _ = provider.shutdown();
    }

    Ok(())
}
