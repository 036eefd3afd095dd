//! mcp-lite: a minimal MCP tool-invocation engine.
//!
//! Client and server speak JSON-RPC 2.0 over stdio (or any async byte
//! stream). The server exposes tools registered by name with a JSON input
//! schema; the client performs the handshake, lists tools and calls them.
//!
//! # Modules
//!
//! - [`config`]: Configuration loading and validation
//! - [`error`]: Configuration error types
//! - [`mcp`]: Protocol engine (codec, session, registries, facades)
//! - [`echo`]: The `swift_echo` example tool
//!
//! # Example
//!
//! ```no_run
//! use mcp_lite::echo::EchoToolbox;
//! use mcp_lite::mcp::types::Implementation;
//! use mcp_lite::mcp::{McpServer, Transport};
//!
//! # async fn run() -> mcp_lite::mcp::McpResult<()> {
//! let mut server = McpServer::new(Implementation::new("demo", "1.0")).with_toolbox(&EchoToolbox);
//! server.serve(Transport::stdio()).await
//! # }
//! ```

pub mod config;
pub mod echo;
pub mod error;
pub mod mcp;
