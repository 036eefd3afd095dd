//! Tool registry and the `tools/list` / `tools/call` semantics.
//!
//! Tools are registered before the server starts. Listing returns them in
//! registration order. Calling a tool validates its arguments against the
//! declared input schema before the handler runs, so handlers only see
//! arguments of the expected shape.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::mcp::error::{McpError, McpResult};
use crate::mcp::schema::{self, ROOT_FIELD};
use crate::mcp::session::RequestContext;
use crate::mcp::types::{CallToolResult, Content, ToolDescriptor};

/// Failure reported by a tool handler.
///
/// Unlike [`McpError`], a tool error is not a protocol failure. It is sent
/// back as a successful `tools/call` response with `isError` set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ToolError(pub String);

impl ToolError {
    /// Creates a tool error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Future returned by a tool handler.
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Vec<Content>, ToolError>> + Send>>;

/// A tool handler. Receives the validated arguments object.
pub type ToolHandler = Arc<dyn Fn(Map<String, Value>, RequestContext) -> ToolFuture + Send + Sync>;

#[derive(Clone)]
struct RegisteredTool {
    descriptor: ToolDescriptor,
    handler: ToolHandler,
}

/// A group of related tools that registers itself in one go.
pub trait Toolbox: Send + Sync {
    /// Adds this toolbox's tools to `registry`.
    fn register(&self, registry: &mut ToolRegistry);
}

/// Ordered set of tools served by one server.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: IndexMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool. A second registration under the same name replaces
    /// the first and keeps its position in the listing.
    pub fn register<F, Fut>(&mut self, descriptor: ToolDescriptor, handler: F)
    where
        F: Fn(Map<String, Value>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Content>, ToolError>> + Send + 'static,
    {
        let name = descriptor.name.clone();
        let handler: ToolHandler =
            Arc::new(move |args: Map<String, Value>, ctx: RequestContext| -> ToolFuture {
                Box::pin(handler(args, ctx))
            });

        let previous = self
            .tools
            .insert(name.clone(), RegisteredTool { descriptor, handler });
        if previous.is_some() {
            tracing::warn!(tool = %name, "Tool registered twice, keeping the last one");
        } else {
            tracing::debug!(tool = %name, "Registered tool");
        }
    }

    /// Registers every tool of a toolbox.
    pub fn add_toolbox(&mut self, toolbox: &dyn Toolbox) {
        toolbox.register(self);
    }

    /// Returns the tool descriptors in registration order.
    #[must_use]
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.values().map(|t| t.descriptor.clone()).collect()
    }

    /// Returns `true` if a tool named `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Returns the number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns `true` if no tools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Invokes a tool by name.
    ///
    /// Missing or `null` arguments are treated as an empty object.
    ///
    /// # Errors
    ///
    /// - [`McpError::ToolNotFound`] if no tool has that name
    /// - [`McpError::InvalidArguments`] if the arguments are not an object or
    ///   violate the tool's input schema
    ///
    /// A failing handler is not an error here. Its message comes back as a
    /// result with `is_error` set.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        ctx: RequestContext,
    ) -> McpResult<CallToolResult> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| McpError::ToolNotFound(name.to_string()))?;

        let arguments = match arguments {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(McpError::InvalidArguments {
                    field: ROOT_FIELD.to_string(),
                    reason: "expected an object".to_string(),
                })
            }
        };

        schema::validate_arguments(&tool.descriptor.input_schema, &arguments)?;

        tracing::debug!(tool = %name, request_id = %ctx.request_id(), "Calling tool");

        match (*tool.handler)(arguments, ctx).await {
            Ok(content) => Ok(CallToolResult::success(content)),
            Err(e) => {
                tracing::debug!(tool = %name, error = %e, "Tool reported an error");
                Ok(CallToolResult::error(e.0))
            }
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}
