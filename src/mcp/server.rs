//! MCP server facade.
//!
//! This module implements the server lifecycle:
//!
//! 1. **Setup**: Register tools and toolboxes
//! 2. **Start**: Bind a session to a transport and answer `initialize`
//! 3. **Operation**: Dispatch `ping`, `tools/list` and `tools/call`
//! 4. **Shutdown**: Stop on request, on signal, or when the client goes away

use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::config::Config;
use crate::mcp::error::{McpError, McpResult};
use crate::mcp::protocol::{
    METHOD_PING, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, NOTIFICATION_INITIALIZED,
};
use crate::mcp::registry::{MethodRegistry, NotificationRegistry};
use crate::mcp::session::{
    RequestContext, Role, ServerIdentity, Session, SessionOptions, SessionState,
};
use crate::mcp::tools::{ToolError, ToolRegistry, Toolbox};
use crate::mcp::transport::Transport;
use crate::mcp::types::{
    CallToolParams, Content, Implementation, ListToolsResult, ServerCapabilities, ToolDescriptor,
};

/// An MCP server serving a fixed set of tools over one transport.
#[derive(Debug)]
pub struct McpServer {
    identity: ServerIdentity,
    options: SessionOptions,
    tools: Arc<ToolRegistry>,
    session: Option<Session>,
}

impl McpServer {
    /// Creates a server announcing itself as `info`, with no tools yet.
    #[must_use]
    pub fn new(info: Implementation) -> Self {
        Self {
            identity: ServerIdentity {
                info,
                capabilities: ServerCapabilities::with_tools(),
                instructions: None,
            },
            options: SessionOptions::default(),
            tools: Arc::new(ToolRegistry::new()),
            session: None,
        }
    }

    /// Creates a server from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let mut server = Self::new(config.server.implementation());
        server.identity.instructions.clone_from(&config.server.instructions);
        server.options = config.session.options();
        server
    }

    /// Sets the usage hints returned from `initialize`.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.identity.instructions = Some(instructions.into());
        self
    }

    /// Sets the session tunables.
    #[must_use]
    pub const fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Adds every tool of `toolbox`.
    #[must_use]
    pub fn with_toolbox(mut self, toolbox: &dyn Toolbox) -> Self {
        Arc::make_mut(&mut self.tools).add_toolbox(toolbox);
        self
    }

    /// Registers a single tool.
    ///
    /// Tools registered after [`start`](Self::start) are not visible to the
    /// running session.
    pub fn register_tool<F, Fut>(&mut self, descriptor: ToolDescriptor, handler: F)
    where
        F: Fn(Map<String, Value>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Content>, ToolError>> + Send + 'static,
    {
        Arc::make_mut(&mut self.tools).register(descriptor, handler);
    }

    /// The registered tools.
    #[must_use]
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Returns the session state, or [`SessionState::Unconnected`] before start.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Unconnected, Session::state)
    }

    /// Name and version of the connected client, once it has initialised.
    #[must_use]
    pub fn client_info(&self) -> Option<Implementation> {
        self.session
            .as_ref()
            .and_then(Session::client_params)
            .map(|params| params.client_info)
    }

    /// Binds the server to `transport` and starts processing messages.
    ///
    /// Returns immediately. Use [`wait_until_completed`](Self::wait_until_completed)
    /// to wait for the session to end.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::InvalidRequest`] if the server was already started.
    pub fn start(&mut self, transport: Transport) -> McpResult<()> {
        if self.session.is_some() {
            return Err(McpError::InvalidRequest("server already started".to_string()));
        }

        let session = Session::start(
            Role::Server(self.identity.clone()),
            transport,
            self.methods(),
            Self::notifications(),
            self.options,
        );

        tracing::info!(
            server = %self.identity.info.name,
            tools = self.tools.len(),
            "MCP server started, waiting for client"
        );
        self.session = Some(session);
        Ok(())
    }

    /// Waits until the session stopped. Returns at once if never started.
    pub async fn wait_until_completed(&self) {
        if let Some(session) = &self.session {
            session.wait_until_stopped().await;
        }
    }

    /// Stops the session. Does nothing if already stopped or never started.
    pub async fn stop(&self) {
        if let Some(session) = &self.session {
            session.stop().await;
        }
    }

    /// Starts the server and runs until the client disconnects or the
    /// process receives a shutdown signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the server was already started or the signal
    /// handlers cannot be installed.
    pub async fn serve(&mut self, transport: Transport) -> McpResult<()> {
        self.start(transport)?;
        self.run_until_shutdown().await
    }

    /// Waits for the session to end or for a shutdown signal.
    #[cfg(unix)]
    async fn run_until_shutdown(&self) -> McpResult<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
                self.stop().await;
            }

            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
                self.stop().await;
            }

            () = self.wait_until_completed() => {
                tracing::info!("Client disconnected");
            }
        }

        Ok(())
    }

    /// Waits for the session to end or for a shutdown signal.
    #[cfg(windows)]
    async fn run_until_shutdown(&self) -> McpResult<()> {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                self.stop().await;
            }

            () = self.wait_until_completed() => {
                tracing::info!("Client disconnected");
            }
        }

        Ok(())
    }

    fn methods(&self) -> MethodRegistry {
        let mut methods = MethodRegistry::new();

        methods.register(METHOD_PING, |_, _| async { Ok(json!({})) });

        let tools = Arc::clone(&self.tools);
        methods.register_typed(METHOD_TOOLS_LIST, move |_: Value, _ctx| {
            let tools = Arc::clone(&tools);
            async move {
                Ok(ListToolsResult {
                    tools: tools.list_tools(),
                })
            }
        });

        let tools = Arc::clone(&self.tools);
        methods.register_typed(METHOD_TOOLS_CALL, move |params: CallToolParams, ctx| {
            let tools = Arc::clone(&tools);
            async move { tools.call_tool(&params.name, params.arguments, ctx).await }
        });

        methods
    }

    fn notifications() -> NotificationRegistry {
        let mut notifications = NotificationRegistry::new();
        notifications.register(NOTIFICATION_INITIALIZED, |_| {
            tracing::info!("Client confirmed initialisation");
            Ok(())
        });
        notifications
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::echo::EchoToolbox;
    use crate::mcp::protocol::{decode, ErrorCode, Message, Outcome, Response};
    use crate::mcp::transport::{FrameReader, FrameWriter};

    const WAIT: Duration = Duration::from_secs(5);

    fn server() -> McpServer {
        McpServer::new(Implementation::new("test-server", "1.0.0")).with_toolbox(&EchoToolbox)
    }

    #[test]
    fn registers_the_core_methods() {
        let methods = server().methods();
        for method in [METHOD_PING, METHOD_TOOLS_LIST, METHOD_TOOLS_CALL] {
            assert!(methods.contains(method), "{method}");
        }
        assert!(!methods.contains("resources/list"));
    }

    fn started(mut server: McpServer) -> (McpServer, FrameReader, FrameWriter) {
        let (ours, theirs) = Transport::pair(64 * 1024);
        server.start(ours).unwrap();
        let (reader, writer) = theirs.into_parts();
        (server, reader, writer)
    }

    async fn exchange(reader: &mut FrameReader, writer: &mut FrameWriter, frame: &str) -> Response {
        writer.write_frame(frame).await.unwrap();
        let frame = tokio::time::timeout(WAIT, reader.read_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match decode(&frame).unwrap() {
            Message::Response(resp) => resp,
            other => panic!("expected response, got {other:?}"),
        }
    }

    async fn initialize(reader: &mut FrameReader, writer: &mut FrameWriter) {
        exchange(
            reader,
            writer,
            r#"{"jsonrpc":"2.0","id":0,"method":"initialize","params":{"protocolVersion":"2025-03-26","capabilities":{},"clientInfo":{"name":"raw-client","version":"0.1"}}}"#,
        )
        .await;
        writer
            .write_frame(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await
            .unwrap();
    }

    fn result_of(resp: Response) -> Value {
        match resp.outcome {
            Outcome::Result(result) => result,
            Outcome::Error(error) => panic!("unexpected error: {}", error.message),
        }
    }

    #[test]
    fn from_config_applies_settings() {
        let config: Config = serde_json::from_str(
            r#"{"server": {"name": "configured", "instructions": "hello"}, "session": {"max_consecutive_decode_errors": 2}}"#,
        )
        .unwrap();
        let server = McpServer::from_config(&config);

        assert_eq!(server.identity.info.name, "configured");
        assert_eq!(server.identity.instructions.as_deref(), Some("hello"));
        assert_eq!(server.options.max_consecutive_decode_errors, 2);
        assert_eq!(server.state(), SessionState::Unconnected);
    }

    #[tokio::test]
    async fn answers_the_handshake_and_records_the_client() {
        let (server, mut reader, mut writer) = started(server().with_instructions("Use swift_echo"));

        let resp = exchange(
            &mut reader,
            &mut writer,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-03-26","capabilities":{},"clientInfo":{"name":"raw-client","version":"0.1"}}}"#,
        )
        .await;
        let result = result_of(resp);

        assert_eq!(result["protocolVersion"], "2025-03-26");
        assert_eq!(result["serverInfo"], json!({"name": "test-server", "version": "1.0.0"}));
        assert_eq!(result["instructions"], "Use swift_echo");
        assert_eq!(server.state(), SessionState::Ready);
        assert_eq!(
            server.client_info(),
            Some(Implementation::new("raw-client", "0.1"))
        );
    }

    #[tokio::test]
    async fn lists_and_calls_tools() {
        let (_server, mut reader, mut writer) = started(server());
        initialize(&mut reader, &mut writer).await;

        let result = result_of(
            exchange(&mut reader, &mut writer, r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#).await,
        );
        assert_eq!(result["tools"][0]["name"], "swift_echo");
        assert!(result["tools"][0]["inputSchema"].is_object());

        let result = result_of(
            exchange(
                &mut reader,
                &mut writer,
                r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"swift_echo","arguments":{"message":"hi"}}}"#,
            )
            .await,
        );
        assert_eq!(result, json!({"content": [{"type": "text", "text": "hi"}]}));
    }

    #[tokio::test]
    async fn protocol_errors_carry_codes() {
        let (_server, mut reader, mut writer) = started(server());
        initialize(&mut reader, &mut writer).await;

        let cases = [
            (
                r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"nonexistent","arguments":{}}}"#,
                ErrorCode::ToolNotFound,
            ),
            (
                r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"swift_echo","arguments":{"message":5}}}"#,
                ErrorCode::InvalidParams,
            ),
            (r#"{"jsonrpc":"2.0","id":6,"method":"tools/call"}"#, ErrorCode::InvalidParams),
        ];

        for (frame, expected) in cases {
            let resp = exchange(&mut reader, &mut writer, frame).await;
            let Outcome::Error(error) = resp.outcome else {
                panic!("expected an error for {frame}");
            };
            assert_eq!(error.code, expected.code(), "{frame}");
        }
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let (mut server, _reader, _writer) = started(server());
        let (again, _peer) = Transport::pair(1024);
        assert!(matches!(server.start(again), Err(McpError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (server, _reader, _writer) = started(server());

        server.stop().await;
        server.stop().await;
        tokio::time::timeout(WAIT, server.wait_until_completed())
            .await
            .unwrap();
        assert_eq!(server.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn client_disconnect_completes_the_server() {
        let (server, reader, writer) = started(server());
        drop(reader);
        drop(writer);

        tokio::time::timeout(WAIT, server.wait_until_completed())
            .await
            .unwrap();
        assert_eq!(server.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn unstarted_server_completes_immediately() {
        let server = server();
        server.wait_until_completed().await;
        server.stop().await;
        assert_eq!(server.state(), SessionState::Unconnected);
        assert!(server.client_info().is_none());
    }
}
