//! The `swift_echo` example tool.

use serde_json::{json, Map, Value};

use crate::mcp::session::RequestContext;
use crate::mcp::tools::{ToolError, ToolRegistry, Toolbox};
use crate::mcp::types::{Content, ToolDescriptor};

/// Name of the echo tool.
pub const ECHO_TOOL: &str = "swift_echo";

/// Toolbox providing [`ECHO_TOOL`], which returns its `message` argument unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoToolbox;

impl EchoToolbox {
    /// Descriptor advertised for the echo tool.
    #[must_use]
    pub fn descriptor() -> ToolDescriptor {
        ToolDescriptor {
            name: ECHO_TOOL.to_string(),
            description: "A simple tool that echoes back its input arguments.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "The text to echo back"
                    }
                }
            }),
        }
    }
}

impl Toolbox for EchoToolbox {
    fn register(&self, registry: &mut ToolRegistry) {
        registry.register(Self::descriptor(), echo);
    }
}

async fn echo(arguments: Map<String, Value>, _ctx: RequestContext) -> Result<Vec<Content>, ToolError> {
    let Some(message) = arguments.get("message").and_then(Value::as_str) else {
        return Err(ToolError::new("Missing or invalid 'message' parameter"));
    };
    Ok(vec![Content::text(message)])
}
