//! JSON-RPC 2.0 message codec for the MCP protocol.
//!
//! This module defines the protocol [`Message`] and the functions that turn it
//! into transport frames and back.
//!
//! # Message Types
//!
//! - **Request**: A message expecting a response (has `id`)
//! - **Response**: A reply to a request (result or error, never both)
//! - **Notification**: A one-way message (no `id`, no response expected)
//!
//! # MCP-Specific Constraints
//!
//! - Request IDs must be strings or integers (never `null`)
//! - A response ID may be `null` only when the request ID could not be read
//! - Frames never contain embedded newlines

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::mcp::error::McpError;

/// The JSON-RPC version string carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// The newest MCP protocol version this implementation speaks.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-03-26";

/// Every MCP protocol version this implementation accepts, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[LATEST_PROTOCOL_VERSION, "2024-11-05"];

/// Handshake request.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Liveness check, answered with `{}`.
pub const METHOD_PING: &str = "ping";
/// Lists the server's tools.
pub const METHOD_TOOLS_LIST: &str = "tools/list";
/// Invokes a tool.
pub const METHOD_TOOLS_CALL: &str = "tools/call";
/// Sent by the client once it accepted the initialize result.
pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
/// Sent by either peer when it abandons a request.
pub const NOTIFICATION_CANCELLED: &str = "notifications/cancelled";

/// Returns `true` if `version` is one this implementation can speak.
#[must_use]
pub fn is_supported_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

/// A JSON-RPC 2.0 request ID.
///
/// Per the MCP specification, IDs must be strings or integers, never `null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric request ID.
    Number(i64),
    /// String request ID.
    String(String),
}

impl RequestId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Number),
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::from(*n),
            Self::String(s) => Value::from(s.as_str()),
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// Standard JSON-RPC 2.0 error codes plus the MCP server-defined ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Invalid JSON was received.
    ParseError,
    /// The JSON sent is not a valid message.
    InvalidRequest,
    /// The method does not exist or is not available.
    MethodNotFound,
    /// Invalid method parameters.
    InvalidParams,
    /// Internal JSON-RPC error.
    InternalError,
    /// The named tool is not registered.
    ToolNotFound,
    /// A request arrived before the handshake completed.
    NotInitialized,
    /// Server-defined error.
    ServerError(i32),
}

impl ErrorCode {
    /// Returns the numeric code for this error.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ToolNotFound => -32001,
            Self::NotInitialized => -32002,
            Self::ServerError(code) => code,
        }
    }

    /// Maps a numeric code back to its variant.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            -32001 => Self::ToolNotFound,
            -32002 => Self::NotInitialized,
            other => Self::ServerError(other),
        }
    }

    /// Returns the default message for this error code.
    #[must_use]
    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::ToolNotFound => "Tool not found",
            Self::NotInitialized => "Not initialized",
            Self::ServerError(_) => "Server error",
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// The error code.
    pub code: i32,

    /// A short description of the error.
    pub message: String,

    /// Additional information about the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Creates a new error from an error code.
    #[must_use]
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.default_message().to_string(),
            data: None,
        }
    }

    /// Creates a new error with a custom message.
    #[must_use]
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Adds additional data to the error.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A request expecting exactly one response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Unique request identifier.
    pub id: RequestId,
    /// The method to invoke.
    pub method: String,
    /// Optional parameters for the method.
    pub params: Option<Value>,
}

/// A one-way message.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// The notification method.
    pub method: String,
    /// Optional parameters for the notification.
    pub params: Option<Value>,
}

/// The outcome carried by a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The method succeeded.
    Result(Value),
    /// The method failed.
    Error(ErrorObject),
}

/// A reply to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// The request ID this response corresponds to, `None` if it was unreadable.
    pub id: Option<RequestId>,
    /// Result or error payload.
    pub outcome: Outcome,
}

impl Response {
    /// Creates a success response.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Value is not const-compatible
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            outcome: Outcome::Result(result),
        }
    }

    /// Creates an error response.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // ErrorObject contains String
    pub fn error(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self {
            id,
            outcome: Outcome::Error(error),
        }
    }
}

/// Any protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A request expecting a response.
    Request(Request),
    /// A reply to an earlier request.
    Response(Response),
    /// A notification (no response expected).
    Notification(Notification),
}

impl Message {
    /// Builds a request message.
    ///
    /// `params` should be an object or an array; `Some(Value::Null)` is sent
    /// as no params, other scalars are rejected by the receiving [`decode`].
    #[must_use]
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(Request {
            id,
            method: method.into(),
            params,
        })
    }

    /// Builds a notification message. `params` follow the rules of [`Message::request`].
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    /// Returns the method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.method),
            Self::Notification(notif) => Some(&notif.method),
            Self::Response(_) => None,
        }
    }
}

/// `null` params are written as absent params.
fn wire_params(params: Option<&Value>) -> Option<&Value> {
    params.filter(|params| !params.is_null())
}

/// Serialises a message into a single frame (no trailing newline).
///
/// Never fails: every [`Message`] maps onto a JSON object.
#[must_use]
pub fn encode(message: &Message) -> String {
    let mut obj = Map::new();
    obj.insert("jsonrpc".into(), json!(JSONRPC_VERSION));

    match message {
        Message::Request(req) => {
            obj.insert("id".into(), req.id.to_value());
            obj.insert("method".into(), json!(req.method));
            if let Some(params) = wire_params(req.params.as_ref()) {
                obj.insert("params".into(), params.clone());
            }
        }
        Message::Notification(notif) => {
            obj.insert("method".into(), json!(notif.method));
            if let Some(params) = wire_params(notif.params.as_ref()) {
                obj.insert("params".into(), params.clone());
            }
        }
        Message::Response(resp) => {
            obj.insert(
                "id".into(),
                resp.id.as_ref().map_or(Value::Null, RequestId::to_value),
            );
            match &resp.outcome {
                Outcome::Result(result) => {
                    obj.insert("result".into(), result.clone());
                }
                Outcome::Error(error) => {
                    let mut err = Map::new();
                    err.insert("code".into(), json!(error.code));
                    err.insert("message".into(), json!(error.message));
                    if let Some(data) = &error.data {
                        err.insert("data".into(), data.clone());
                    }
                    obj.insert("error".into(), Value::Object(err));
                }
            }
        }
    }

    // serde_json's compact writer escapes control characters, so no raw newlines
    Value::Object(obj).to_string()
}

/// Parses one frame into a message.
///
/// # Errors
///
/// - [`McpError::MalformedMessage`] if the bytes are not valid UTF-8 JSON
/// - [`McpError::UnknownMessageShape`] if the JSON is not a request, response or notification
pub fn decode(frame: &[u8]) -> Result<Message, McpError> {
    let value: Value =
        serde_json::from_slice(frame).map_err(|e| McpError::MalformedMessage(e.to_string()))?;

    let Value::Object(mut obj) = value else {
        return Err(shape("message is not a JSON object"));
    };

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        Some(_) => return Err(shape("jsonrpc field must be \"2.0\"")),
        None => return Err(shape("missing jsonrpc field")),
    }

    let id = obj.remove("id");
    let params = obj.remove("params");

    if let Some(method) = obj.remove("method") {
        let Value::String(method) = method else {
            return Err(shape("method field must be a string"));
        };
        if method.is_empty() {
            return Err(shape("method field cannot be empty"));
        }
        if params
            .as_ref()
            .is_some_and(|p| !(p.is_object() || p.is_array()))
        {
            return Err(shape("params must be an object or an array"));
        }

        return match id {
            None => Ok(Message::Notification(Notification { method, params })),
            Some(id) => {
                let id = RequestId::from_value(&id)
                    .ok_or_else(|| shape("request id must be a string or an integer"))?;
                Ok(Message::Request(Request { id, method, params }))
            }
        };
    }

    let Some(id) = id else {
        return Err(shape("message has neither method nor id"));
    };
    let id = match id {
        Value::Null => None,
        other => Some(
            RequestId::from_value(&other)
                .ok_or_else(|| shape("response id must be a string, an integer or null"))?,
        ),
    };

    let outcome = match (obj.remove("result"), obj.remove("error")) {
        (Some(result), None) => Outcome::Result(result),
        (None, Some(error)) => Outcome::Error(
            serde_json::from_value(error).map_err(|e| shape(format!("invalid error object: {e}")))?,
        ),
        (Some(_), Some(_)) => return Err(shape("response carries both result and error")),
        (None, None) => return Err(shape("response carries neither result nor error")),
    };

    Ok(Message::Response(Response { id, outcome }))
}

fn shape(reason: impl Into<String>) -> McpError {
    McpError::UnknownMessageShape(reason.into())
}
