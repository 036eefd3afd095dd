//! Protocol-level error taxonomy.
//!
//! Codec errors are recoverable and only reported. Protocol errors travel back
//! to the peer as error responses. Handshake and transport errors end the session.

use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

use crate::mcp::protocol::{ErrorCode, ErrorObject};

/// Result alias used across the engine.
pub type McpResult<T> = Result<T, McpError>;

/// Errors produced by the codec, registries, session engine and facades.
#[derive(Error, Debug)]
pub enum McpError {
    /// The frame is not syntactically valid JSON.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The frame is valid JSON but not a request, response or notification.
    #[error("unknown message shape: {0}")]
    UnknownMessageShape(String),

    /// No handler is registered for the method.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// A non-initialization request arrived before the handshake completed.
    #[error("session not initialized")]
    NotInitialized,

    /// No tool with this name is registered.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Tool arguments do not match the tool's input schema.
    #[error("invalid argument '{field}': {reason}")]
    InvalidArguments {
        /// Path of the offending argument (`arguments` for the whole object).
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Method parameters could not be read.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The request is not valid in the current session state.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Protocol version or capability negotiation failed.
    #[error("handshake failed: {0}")]
    HandshakeError(String),

    /// The session stopped before (or while) the request was in flight.
    #[error("session closed")]
    SessionClosed,

    /// The caller's deadline expired before a response arrived.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The peer did not advertise a capability the call needs.
    #[error("peer does not support the '{0}' capability")]
    CapabilityNotSupported(String),

    /// Reading from or writing to the transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The peer answered with an error this taxonomy has no variant for.
    #[error("remote error {code}: {message}")]
    Remote {
        /// JSON-RPC error code.
        code: i32,
        /// Error message from the peer.
        message: String,
    },

    /// Unexpected failure inside the engine or a handler.
    #[error("internal error: {0}")]
    Internal(String),
}

impl McpError {
    /// Returns the JSON-RPC code this error is reported with.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::MalformedMessage(_) => ErrorCode::ParseError,
            Self::UnknownMessageShape(_) | Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::MethodNotFound(_) => ErrorCode::MethodNotFound,
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::ToolNotFound(_) => ErrorCode::ToolNotFound,
            Self::InvalidArguments { .. } | Self::InvalidParams(_) => ErrorCode::InvalidParams,
            Self::Remote { code, .. } => ErrorCode::from_code(*code),
            Self::HandshakeError(_)
            | Self::SessionClosed
            | Self::Timeout(_)
            | Self::CapabilityNotSupported(_)
            | Self::Transport(_)
            | Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Returns `true` if this error ends the session it occurred in.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::HandshakeError(_) | Self::SessionClosed | Self::Transport(_)
        )
    }

    /// Builds the error object sent to the peer.
    #[must_use]
    pub fn to_error_object(&self) -> ErrorObject {
        let object = ErrorObject::with_message(self.code(), self.to_string());
        match self {
            Self::MethodNotFound(name) | Self::ToolNotFound(name) => {
                object.with_data(json!({ "name": name }))
            }
            Self::InvalidArguments { field, reason } => {
                object.with_data(json!({ "field": field, "reason": reason }))
            }
            _ => object,
        }
    }

    /// Rebuilds a typed error from an error object received from the peer.
    #[must_use]
    pub fn from_error_object(error: &ErrorObject) -> Self {
        let data_str = |key: &str| {
            error
                .data
                .as_ref()
                .and_then(|d| d.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        match ErrorCode::from_code(error.code) {
            ErrorCode::MethodNotFound => {
                Self::MethodNotFound(data_str("name").unwrap_or_else(|| error.message.clone()))
            }
            ErrorCode::ToolNotFound => {
                Self::ToolNotFound(data_str("name").unwrap_or_else(|| error.message.clone()))
            }
            ErrorCode::NotInitialized => Self::NotInitialized,
            ErrorCode::InvalidParams => match data_str("field") {
                Some(field) => Self::InvalidArguments {
                    field,
                    reason: data_str("reason").unwrap_or_else(|| error.message.clone()),
                },
                None => Self::InvalidParams(error.message.clone()),
            },
            _ => Self::Remote {
                code: error.code,
                message: error.message.clone(),
            },
        }
    }
}
