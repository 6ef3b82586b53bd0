//! MCP server exposing the [`csrepl`] C# sandbox over stdio.
//!
//! ```rust,no_run
//! use clap::Parser;
//! use csrepl_server::{CsReplServer, ServerArgs};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = ServerArgs::parse();
//!     let repl = args.build_repl().await?;
//!     CsReplServer::new(repl).serve_stdio().await
//! }
//! ```

pub mod config;
pub mod server;

pub use config::{LogFormat, ServerArgs};
pub use server::CsReplServer;
