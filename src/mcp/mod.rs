//! Model Context Protocol (MCP) engine.
//!
//! A minimal implementation of the MCP tool-invocation protocol: JSON-RPC 2.0
//! messages, one per line, over any ordered byte stream (stdio by default).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │     McpClient                                 McpServer      │
//! │   (initialize,                              (start, stop,    │
//! │  list/call tools)                          wait_until_...)   │
//! │         │                                        │           │
//! │         ▼                                        ▼           │
//! │   ┌──────────────────────────────────────────────────────┐   │
//! │   │                  Session engine                      │   │
//! │   │  lifecycle · outstanding requests · handler tasks    │   │
//! │   └──────────────────────────────────────────────────────┘   │
//! │         │                  │                     │           │
//! │         ▼                  ▼                     ▼           │
//! │   ┌───────────┐    ┌───────────────┐    ┌────────────────┐   │
//! │   │  Codec    │    │MethodRegistry │    │  ToolRegistry  │   │
//! │   │(protocol) │    │  (registry)   │    │ (tools/schema) │   │
//! │   └───────────┘    └───────────────┘    └────────────────┘   │
//! │         │                                                    │
//! │         ▼                                                    │
//! │   ┌───────────┐                                              │
//! │   │ Transport │  newline-delimited frames                    │
//! │   └───────────┘                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol Version
//!
//! Speaks MCP `2025-03-26` and `2024-11-05`.

pub mod client;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod server;
pub mod session;
pub mod tools;
pub mod transport;
pub mod types;

pub use client::{ClientOptions, McpClient};
pub use error::{McpError, McpResult};
pub use protocol::{Message, RequestId, LATEST_PROTOCOL_VERSION};
pub use server::McpServer;
pub use session::{RequestContext, SessionOptions, SessionState};
pub use tools::{ToolError, ToolRegistry, Toolbox};
pub use transport::Transport;
