//! MCP client facade.
//!
//! Wraps a [`Session`] in the client role and exposes the handshake and the
//! tools methods as plain async calls. Calls take `&self`, so independent
//! calls may be in flight at the same time and are matched to their
//! responses by request ID.

use std::sync::OnceLock;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::mcp::error::{McpError, McpResult};
use crate::mcp::protocol::{
    is_supported_version, LATEST_PROTOCOL_VERSION, METHOD_INITIALIZE, METHOD_PING,
    METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, NOTIFICATION_INITIALIZED,
};
use crate::mcp::registry::{MethodRegistry, NotificationRegistry};
use crate::mcp::session::{Role, Session, SessionOptions, SessionState};
use crate::mcp::transport::Transport;
use crate::mcp::types::{
    CallToolParams, CallToolResult, ClientCapabilities, Implementation, InitializeParams,
    InitializeResult, ListToolsResult, ToolDescriptor,
};

/// Settings for a client connection.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Session tunables.
    pub session: SessionOptions,
    /// Deadline applied to every request. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Capabilities declared in `initialize`.
    pub capabilities: ClientCapabilities,
}

/// An MCP client bound to one transport.
#[derive(Debug)]
pub struct McpClient {
    info: Implementation,
    options: ClientOptions,
    session: Session,
    server: OnceLock<InitializeResult>,
}

impl McpClient {
    /// Starts a client session over `transport`. No messages are sent until
    /// [`initialize`](Self::initialize).
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn connect(info: Implementation, transport: Transport, options: ClientOptions) -> Self {
        let mut methods = MethodRegistry::new();
        methods.register(METHOD_PING, |_, _| async { Ok(json!({})) });

        let session = Session::start(
            Role::Client,
            transport,
            methods,
            NotificationRegistry::new(),
            options.session,
        );

        Self {
            info,
            options,
            session,
            server: OnceLock::new(),
        }
    }

    /// Performs the handshake.
    ///
    /// # Errors
    ///
    /// - [`McpError::HandshakeError`] if the server rejects `initialize` or
    ///   answers with a protocol version this client does not speak. The
    ///   session is stopped.
    /// - [`McpError::SessionClosed`] if the session is or becomes stopped
    /// - [`McpError::InvalidRequest`] if the handshake was already started
    pub async fn initialize(&self) -> McpResult<InitializeResult> {
        if self.session.is_stopped() {
            return Err(McpError::SessionClosed);
        }
        if !self
            .session
            .transition(SessionState::Unconnected, SessionState::Initializing)
        {
            return Err(McpError::InvalidRequest("session already initialised".to_string()));
        }

        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: self.options.capabilities.clone(),
            client_info: self.info.clone(),
        };

        let result = match self.exchange::<_, InitializeResult>(METHOD_INITIALIZE, &params).await {
            Ok(result) => result,
            Err(McpError::SessionClosed) => return Err(McpError::SessionClosed),
            Err(e) => return Err(self.fail_handshake(e.to_string()).await),
        };

        if !is_supported_version(&result.protocol_version) {
            let reason = format!(
                "server answered with unsupported protocol version '{}'",
                result.protocol_version
            );
            return Err(self.fail_handshake(reason).await);
        }

        if !self
            .session
            .transition(SessionState::Initializing, SessionState::Ready)
        {
            return Err(McpError::SessionClosed);
        }

        tracing::info!(
            server = %result.server_info.name,
            server_version = %result.server_info.version,
            protocol_version = %result.protocol_version,
            "Connected to MCP server"
        );

        self.session.notify(NOTIFICATION_INITIALIZED, None).await?;

        // The transitions above guarantee this runs at most once
        let _ = self.server.set(result.clone());
        Ok(result)
    }

    /// Lists the server's tools in the order the server registered them.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::CapabilityNotSupported`] if the server did not
    /// advertise tools, or any request error.
    pub async fn list_tools(&self) -> McpResult<Vec<ToolDescriptor>> {
        self.require_tools()?;
        let result: ListToolsResult = self.exchange(METHOD_TOOLS_LIST, &json!({})).await?;
        Ok(result.tools)
    }

    /// Calls a tool.
    ///
    /// A tool that ran but failed comes back as `Ok` with `is_error` set.
    ///
    /// # Errors
    ///
    /// - [`McpError::ToolNotFound`] for an unknown tool name
    /// - [`McpError::InvalidArguments`] if the server rejected the arguments
    /// - [`McpError::CapabilityNotSupported`] if the server has no tools
    /// - [`McpError::SessionClosed`] or [`McpError::Timeout`]
    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<CallToolResult> {
        self.require_tools()?;
        let params = CallToolParams {
            name: name.to_string(),
            arguments: Some(arguments),
        };
        self.exchange(METHOD_TOOLS_CALL, &params).await
    }

    /// Checks that the server is responsive.
    ///
    /// # Errors
    ///
    /// Returns any request error.
    pub async fn ping(&self) -> McpResult<()> {
        self.session
            .request(METHOD_PING, None, self.options.request_timeout)
            .await
            .map(|_| ())
    }

    /// The server's handshake answer, once initialised.
    #[must_use]
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server.get()
    }

    /// Returns the session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Closes the connection. Does nothing if already closed.
    pub async fn disconnect(&self) {
        self.session.stop().await;
    }

    /// Waits until the session stopped.
    pub async fn wait_until_completed(&self) {
        self.session.wait_until_stopped().await;
    }

    fn require_tools(&self) -> McpResult<()> {
        if self.session.is_stopped() {
            return Err(McpError::SessionClosed);
        }
        match self.server.get() {
            None => Err(McpError::NotInitialized),
            Some(server) if !server.capabilities.supports_tools() => {
                Err(McpError::CapabilityNotSupported("tools".to_string()))
            }
            Some(_) => Ok(()),
        }
    }

    async fn exchange<P, R>(&self, method: &str, params: &P) -> McpResult<R>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)
            .map_err(|e| McpError::Internal(format!("failed to serialise {method} params: {e}")))?;
        let result = self
            .session
            .request(method, Some(params), self.options.request_timeout)
            .await?;
        serde_json::from_value(result).map_err(|e| {
            tracing::warn!(method = %method, error = %e, "Server sent an unreadable result");
            McpError::Internal(format!("invalid {method} result: {e}"))
        })
    }

    async fn fail_handshake(&self, reason: String) -> McpError {
        tracing::error!(reason = %reason, "Handshake failed, stopping session");
        self.session.stop().await;
        McpError::HandshakeError(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{decode, encode, Message, Response};
    use crate::mcp::transport::{FrameReader, FrameWriter};

    const WAIT: Duration = Duration::from_secs(5);

    fn client(options: ClientOptions) -> (McpClient, FrameReader, FrameWriter) {
        let (ours, theirs) = Transport::pair(64 * 1024);
        let client = McpClient::connect(Implementation::new("test-client", "0.1"), ours, options);
        let (reader, writer) = theirs.into_parts();
        (client, reader, writer)
    }

    async fn next(reader: &mut FrameReader) -> Message {
        let frame = tokio::time::timeout(WAIT, reader.read_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        decode(&frame).unwrap()
    }

    /// Answers the initialize request the client sends with `result`.
    async fn answer_initialize(reader: &mut FrameReader, writer: &mut FrameWriter, result: Value) {
        let Message::Request(req) = next(reader).await else {
            panic!("expected initialize");
        };
        assert_eq!(req.method, METHOD_INITIALIZE);
        assert_eq!(req.params.as_ref().unwrap()["clientInfo"]["name"], "test-client");

        let reply = Message::Response(Response::success(req.id, result));
        writer.write_frame(&encode(&reply)).await.unwrap();
    }

    #[tokio::test]
    async fn calls_before_initialize_fail_locally() {
        let (client, _reader, _writer) = client(ClientOptions::default());

        assert!(matches!(client.list_tools().await, Err(McpError::NotInitialized)));
        assert!(matches!(
            client.call_tool("swift_echo", json!({})).await,
            Err(McpError::NotInitialized)
        ));
        assert!(matches!(client.ping().await, Err(McpError::NotInitialized)));
        assert_eq!(client.state(), SessionState::Unconnected);
    }

    #[tokio::test]
    async fn handshake_reaches_ready_and_confirms() {
        let (client, mut reader, mut writer) = client(ClientOptions::default());

        let server = tokio::spawn(async move {
            answer_initialize(
                &mut reader,
                &mut writer,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "scripted", "version": "9"}
                }),
            )
            .await;
            let Message::Notification(notif) = next(&mut reader).await else {
                panic!("expected initialized notification");
            };
            assert_eq!(notif.method, NOTIFICATION_INITIALIZED);
            (reader, writer)
        });

        let result = client.initialize().await.unwrap();
        assert_eq!(result.server_info.name, "scripted");
        assert_eq!(client.state(), SessionState::Ready);
        assert!(client.server_info().is_some());

        let _peer = server.await.unwrap();
        assert!(matches!(
            client.initialize().await,
            Err(McpError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn version_mismatch_stops_the_session() {
        let (client, mut reader, mut writer) = client(ClientOptions::default());

        let server = tokio::spawn(async move {
            answer_initialize(
                &mut reader,
                &mut writer,
                json!({
                    "protocolVersion": "1999-01-01",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "ancient", "version": "0"}
                }),
            )
            .await;
            (reader, writer)
        });

        let err = client.initialize().await.unwrap_err();
        assert!(matches!(err, McpError::HandshakeError(ref m) if m.contains("1999-01-01")));
        assert!(err.is_fatal());
        assert_eq!(client.state(), SessionState::Stopped);
        assert!(matches!(client.list_tools().await, Err(McpError::SessionClosed)));

        let _peer = server.await.unwrap();
    }

    #[tokio::test]
    async fn tools_capability_is_required() {
        let (client, mut reader, mut writer) = client(ClientOptions::default());

        let server = tokio::spawn(async move {
            answer_initialize(
                &mut reader,
                &mut writer,
                json!({
                    "protocolVersion": "2025-03-26",
                    "capabilities": {},
                    "serverInfo": {"name": "toolless", "version": "1"}
                }),
            )
            .await;
            (reader, writer)
        });

        client.initialize().await.unwrap();
        assert!(matches!(
            client.list_tools().await,
            Err(McpError::CapabilityNotSupported(ref c)) if c == "tools"
        ));

        let _peer = server.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_timeout_is_a_handshake_error() {
        let options = ClientOptions {
            request_timeout: Some(Duration::from_millis(50)),
            ..ClientOptions::default()
        };
        let (client, _reader, _writer) = client(options);

        let err = client.initialize().await.unwrap_err();
        assert!(matches!(err, McpError::HandshakeError(_)));
        assert_eq!(client.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (client, mut reader, _writer) = client(ClientOptions::default());

        client.disconnect().await;
        client.disconnect().await;
        tokio::time::timeout(WAIT, client.wait_until_completed())
            .await
            .unwrap();

        assert!(matches!(client.initialize().await, Err(McpError::SessionClosed)));
        assert!(reader.read_frame().await.unwrap().is_none());
    }
}
