//! Session engine shared by the client and server facades.
//!
//! A session owns one transport, one outstanding-request table and one
//! method registry, and moves through the MCP lifecycle:
//!
//! ```text
//! Unconnected ──▶ Initializing ──▶ Ready ──▶ Stopped
//!      │                │                        ▲
//!      └────────────────┴────────────────────────┘
//! ```
//!
//! # Concurrency
//!
//! A single reader task decodes inbound frames in arrival order. Each inbound
//! request runs in its own task, so handlers for different request IDs may
//! overlap. Outbound frames go through one writer lock. The outstanding table
//! is shared between the reader task and callers of [`Session::request`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::AbortHandle;

use crate::mcp::error::{McpError, McpResult};
use crate::mcp::protocol::{
    self, is_supported_version, Message, Notification, Outcome, Request, RequestId, Response,
    LATEST_PROTOCOL_VERSION, METHOD_INITIALIZE, NOTIFICATION_CANCELLED,
};
use crate::mcp::registry::{MethodRegistry, NotificationRegistry};
use crate::mcp::transport::{FrameReader, FrameWriter, Transport};
use crate::mcp::types::{
    CancelledParams, Implementation, InitializeParams, InitializeResult, ServerCapabilities,
};

/// Session state in the MCP lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No handshake yet.
    Unconnected,
    /// Client sent initialize and waits for the result.
    Initializing,
    /// Ready for normal operation.
    Ready,
    /// Terminal. Nothing is read or written any more.
    Stopped,
}

/// What a server announces about itself during the handshake.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    /// Server name and version.
    pub info: Implementation,
    /// Advertised capabilities.
    pub capabilities: ServerCapabilities,
    /// Optional usage hints.
    pub instructions: Option<String>,
}

/// Which side of the handshake this session plays.
#[derive(Debug, Clone)]
pub enum Role {
    /// Sends initialize.
    Client,
    /// Answers initialize.
    Server(ServerIdentity),
}

/// Tunables for a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Consecutive undecodable frames tolerated before the stream is treated
    /// as desynchronised and the session stops.
    pub max_consecutive_decode_errors: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_consecutive_decode_errors: 8,
        }
    }
}

/// How long a stopping session waits for the transport to flush and close.
const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

type Completion = oneshot::Sender<McpResult<Value>>;

#[derive(Default)]
struct Outstanding {
    closed: bool,
    waiting: HashMap<RequestId, Completion>,
}

impl Outstanding {
    fn insert(&mut self, id: RequestId, completion: Completion) -> McpResult<()> {
        if self.closed {
            return Err(McpError::SessionClosed);
        }
        self.waiting.insert(id, completion);
        Ok(())
    }

    fn close(&mut self) -> Vec<(RequestId, Completion)> {
        self.closed = true;
        self.waiting.drain().collect()
    }
}

struct Shared {
    role: Role,
    options: SessionOptions,
    methods: MethodRegistry,
    notifications: NotificationRegistry,
    writer: Mutex<Option<FrameWriter>>,
    outstanding: StdMutex<Outstanding>,
    in_flight: StdMutex<HashMap<RequestId, AbortHandle>>,
    state: watch::Sender<SessionState>,
    next_id: AtomicI64,
    client_params: StdMutex<Option<InitializeParams>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn outstanding(&self) -> MutexGuard<'_, Outstanding> {
        lock(&self.outstanding)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<RequestId, AbortHandle>> {
        lock(&self.in_flight)
    }
}

/// Removes an outstanding entry when the waiting caller goes away.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.outstanding().waiting.remove(&self.id);
    }
}

/// A running protocol session. Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Starts a session over `transport` and spawns its reader task.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(
        role: Role,
        transport: Transport,
        methods: MethodRegistry,
        notifications: NotificationRegistry,
        options: SessionOptions,
    ) -> Self {
        let (reader, writer) = transport.into_parts();
        let (state, _) = watch::channel(SessionState::Unconnected);

        let session = Self {
            shared: Arc::new(Shared {
                role,
                options,
                methods,
                notifications,
                writer: Mutex::new(Some(writer)),
                outstanding: StdMutex::new(Outstanding::default()),
                in_flight: StdMutex::new(HashMap::new()),
                state,
                next_id: AtomicI64::new(1),
                client_params: StdMutex::new(None),
            }),
        };

        tokio::spawn(session.clone().read_loop(reader));
        session
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Returns `true` once the session reached [`SessionState::Stopped`].
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state() == SessionState::Stopped
    }

    /// The initialize parameters a client sent to this server session.
    #[must_use]
    pub fn client_params(&self) -> Option<InitializeParams> {
        lock(&self.shared.client_params).clone()
    }

    /// Moves from `from` to `to` if the session is currently in `from`.
    pub(crate) fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.shared.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Sends a request and waits for its response.
    ///
    /// Only `initialize` may be sent before the session is ready. Without a
    /// `timeout` the call waits until the response arrives or the session stops.
    ///
    /// # Errors
    ///
    /// - [`McpError::SessionClosed`] if the session is or becomes stopped
    /// - [`McpError::NotInitialized`] if the handshake has not completed
    /// - [`McpError::Timeout`] if the deadline passes first
    /// - the error carried by the peer's error response
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> McpResult<Value> {
        match self.state() {
            SessionState::Stopped => return Err(McpError::SessionClosed),
            SessionState::Ready => {}
            _ if method == METHOD_INITIALIZE => {}
            _ => return Err(McpError::NotInitialized),
        }

        let id = RequestId::Number(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.shared.outstanding().insert(id.clone(), tx)?;
        let _guard = PendingGuard {
            shared: &self.shared,
            id: id.clone(),
        };

        tracing::debug!(request_id = %id, method = %method, "Sending request");
        self.send(&Message::request(id.clone(), method, params))
            .await?;

        let received = match timeout {
            None => rx.await,
            Some(limit) => {
                if let Ok(received) = tokio::time::timeout(limit, rx).await {
                    received
                } else {
                    tracing::warn!(request_id = %id, method = %method, ?limit, "Request timed out");
                    self.cancel_remote(&id, "request timed out").await;
                    return Err(McpError::Timeout(limit));
                }
            }
        };

        received.unwrap_or(Err(McpError::SessionClosed))
    }

    /// Sends a notification.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::SessionClosed`] if the session stopped, or a
    /// transport error if the write failed.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        if self.is_stopped() {
            return Err(McpError::SessionClosed);
        }
        self.send(&Message::notification(method, params)).await
    }

    /// Stops the session. Calling it on a stopped session does nothing.
    pub async fn stop(&self) {
        self.teardown().await;
    }

    /// Waits until the session reached [`SessionState::Stopped`].
    pub async fn wait_until_stopped(&self) {
        let mut rx = self.shared.state.subscribe();
        // The sender lives in `shared`, so this only returns once stopped
        let _ = rx.wait_for(|state| *state == SessionState::Stopped).await;
    }

    /// Returns a handle handlers use to talk back to the peer.
    #[must_use]
    pub fn peer(&self) -> Peer {
        Peer {
            session: Some(self.clone()),
        }
    }

    async fn cancel_remote(&self, id: &RequestId, reason: &str) {
        let params = CancelledParams {
            request_id: id.clone(),
            reason: Some(reason.to_string()),
        };
        let Ok(params) = serde_json::to_value(params) else {
            return;
        };
        if let Err(e) = self.notify(NOTIFICATION_CANCELLED, Some(params)).await {
            tracing::debug!(request_id = %id, error = %e, "Could not send cancellation");
        }
    }

    /// Writes one message. A failed write stops the session.
    ///
    /// A write blocked on a peer that stopped reading is abandoned once the
    /// session stops.
    async fn send(&self, message: &Message) -> McpResult<()> {
        let frame = protocol::encode(message);

        let written = tokio::select! {
            biased;
            () = self.wait_until_stopped() => Err(McpError::SessionClosed),
            result = self.write_frame(&frame) => result,
        };

        // Whoever held the writer while the session stopped closes it
        if self.is_stopped() {
            self.close_writer().await;
        }

        if let Err(McpError::Transport(e)) = &written {
            tracing::error!(error = %e, "Transport write failed, stopping session");
            self.teardown().await;
        }

        written
    }

    async fn write_frame(&self, frame: &str) -> McpResult<()> {
        let mut writer = self.shared.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => writer.write_frame(frame).await.map_err(McpError::from),
            None => Err(McpError::SessionClosed),
        }
    }

    /// Takes the writer and shuts it down, unless a sender currently holds it.
    async fn close_writer(&self) {
        let Ok(mut slot) = self.shared.writer.try_lock() else {
            return;
        };
        let Some(mut writer) = slot.take() else {
            return;
        };
        drop(slot);

        match tokio::time::timeout(WRITER_SHUTDOWN_GRACE, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Transport shutdown failed"),
            Err(_) => tracing::debug!("Transport shutdown timed out, dropping writer"),
        }
    }

    async fn teardown(&self) {
        if self.shared.state.send_replace(SessionState::Stopped) == SessionState::Stopped {
            return;
        }

        let pending = self.shared.outstanding().close();
        for (id, completion) in pending {
            tracing::debug!(request_id = %id, "Failing pending request, session closed");
            let _ = completion.send(Err(McpError::SessionClosed));
        }

        let handlers: Vec<_> = self.shared.in_flight().drain().collect();
        for (id, handle) in handlers {
            tracing::debug!(request_id = %id, "Aborting in-flight handler");
            handle.abort();
        }

        self.close_writer().await;

        tracing::info!("Session stopped");
    }

    async fn read_loop(self, mut reader: FrameReader) {
        let mut decode_failures = 0u32;

        loop {
            let frame = tokio::select! {
                () = self.wait_until_stopped() => break,
                frame = reader.read_frame() => frame,
            };

            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!("Transport closed by peer");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Transport read failed");
                    break;
                }
            };

            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match protocol::decode(&frame) {
                Ok(message) => {
                    decode_failures = 0;
                    tracing::trace!(
                        method = message.method().unwrap_or("<response>"),
                        "Decoded frame"
                    );
                    self.handle_message(message).await;
                }
                Err(e) => {
                    decode_failures += 1;
                    tracing::warn!(error = %e, consecutive = decode_failures, "Dropping undecodable frame");

                    let reply = Response::error(None, e.to_error_object());
                    if self.send(&Message::Response(reply)).await.is_err() {
                        break;
                    }
                    if decode_failures >= self.shared.options.max_consecutive_decode_errors {
                        tracing::error!(
                            failures = decode_failures,
                            "Inbound stream looks desynchronised, stopping session"
                        );
                        break;
                    }
                }
            }
        }

        self.teardown().await;
    }

    async fn handle_message(&self, message: Message) {
        match message {
            Message::Request(req) => self.handle_request(req).await,
            Message::Response(resp) => self.handle_response(resp),
            Message::Notification(notif) => self.handle_notification(notif),
        }
    }

    async fn handle_request(&self, req: Request) {
        tracing::debug!(request_id = %req.id, method = %req.method, "Received request");

        if req.method == METHOD_INITIALIZE {
            let outcome = self.handle_initialize(req.params);
            self.respond(req.id, outcome).await;
            return;
        }

        if self.state() != SessionState::Ready {
            self.respond(req.id, Err(McpError::NotInitialized)).await;
            return;
        }

        if self.shared.in_flight().contains_key(&req.id) {
            let error = McpError::InvalidRequest(format!("request id {} is already in flight", req.id));
            self.respond(req.id, Err(error)).await;
            return;
        }

        self.spawn_handler(req);
    }

    fn spawn_handler(&self, req: Request) {
        let Request { id, method, params } = req;
        let ctx = RequestContext::new(id.clone(), self.peer());

        let task = {
            let mut in_flight = self.shared.in_flight();
            let task = tokio::spawn(self.shared.methods.dispatch(&method, params, ctx));
            in_flight.insert(id.clone(), task.abort_handle());
            task
        };

        let session = self.clone();
        tokio::spawn(async move {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => {
                    tracing::debug!(request_id = %id, method = %method, "Handler cancelled, no response sent");
                    return;
                }
                Err(e) => {
                    tracing::error!(request_id = %id, method = %method, error = %e, "Handler panicked");
                    Err(McpError::Internal(format!("handler for '{method}' panicked")))
                }
            };

            session.shared.in_flight().remove(&id);
            session.respond(id, outcome).await;
        });
    }

    async fn respond(&self, id: RequestId, outcome: McpResult<Value>) {
        let response = match outcome {
            Ok(result) => Response::success(id, result),
            Err(e) => {
                tracing::debug!(request_id = %id, error = %e, "Request failed");
                Response::error(Some(id), e.to_error_object())
            }
        };

        if let Err(e) = self.send(&Message::Response(response)).await {
            tracing::debug!(error = %e, "Response not delivered");
        }
    }

    fn handle_response(&self, resp: Response) {
        let Some(id) = resp.id else {
            if let Outcome::Error(error) = &resp.outcome {
                tracing::warn!(
                    code = error.code,
                    message = %error.message,
                    "Peer rejected a message it could not read"
                );
            }
            return;
        };

        let completion = self.shared.outstanding().waiting.remove(&id);
        let Some(completion) = completion else {
            // Late responses after a local timeout end up here
            tracing::warn!(request_id = %id, "Dropping response for unknown request id");
            return;
        };

        let outcome = match resp.outcome {
            Outcome::Result(result) => Ok(result),
            Outcome::Error(error) => Err(McpError::from_error_object(&error)),
        };

        if completion.send(outcome).is_err() {
            tracing::debug!(request_id = %id, "Caller stopped waiting for response");
        }
    }

    fn handle_notification(&self, notif: Notification) {
        tracing::debug!(method = %notif.method, "Received notification");

        if notif.method == NOTIFICATION_CANCELLED {
            self.handle_cancelled(notif.params);
        } else {
            self.shared.notifications.deliver(&notif.method, notif.params);
        }
    }

    fn handle_cancelled(&self, params: Option<Value>) {
        let params: CancelledParams =
            match serde_json::from_value(params.unwrap_or(Value::Null)) {
                Ok(params) => params,
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring malformed cancellation");
                    return;
                }
            };

        let handle = self.shared.in_flight().remove(&params.request_id);
        match handle {
            Some(handle) => {
                handle.abort();
                tracing::info!(
                    request_id = %params.request_id,
                    reason = params.reason.as_deref().unwrap_or("unspecified"),
                    "Cancelled in-flight request"
                );
            }
            None => {
                tracing::debug!(request_id = %params.request_id, "Cancellation for a request not in flight");
            }
        }
    }

    fn handle_initialize(&self, params: Option<Value>) -> McpResult<Value> {
        let Role::Server(identity) = &self.shared.role else {
            return Err(McpError::MethodNotFound(METHOD_INITIALIZE.to_string()));
        };

        let params: InitializeParams = params
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| McpError::InvalidParams(format!("Invalid initialize params: {e}")))?
            .ok_or_else(|| McpError::InvalidParams("Missing initialize params".to_string()))?;

        let protocol_version = if is_supported_version(&params.protocol_version) {
            params.protocol_version.clone()
        } else {
            tracing::warn!(
                requested = %params.protocol_version,
                offered = LATEST_PROTOCOL_VERSION,
                "Client requested an unsupported protocol version"
            );
            LATEST_PROTOCOL_VERSION.to_string()
        };

        let result = serde_json::to_value(InitializeResult {
            protocol_version: protocol_version.clone(),
            capabilities: identity.capabilities.clone(),
            server_info: identity.info.clone(),
            instructions: identity.instructions.clone(),
        })
        .map_err(|e| McpError::Internal(format!("failed to serialise initialize result: {e}")))?;

        if !self.transition(SessionState::Unconnected, SessionState::Ready) {
            return Err(McpError::InvalidRequest("Session already initialised".to_string()));
        }

        tracing::info!(
            client = %params.client_info.name,
            client_version = %params.client_info.version,
            protocol_version = %protocol_version,
            "Client initialised"
        );
        *lock(&self.shared.client_params) = Some(params);

        Ok(result)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Handle to the remote peer, given to handlers.
#[derive(Clone, Debug)]
pub struct Peer {
    session: Option<Session>,
}

impl Peer {
    /// Sends a notification to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::SessionClosed`] once the session stopped.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        match &self.session {
            Some(session) => session.notify(method, params).await,
            None => Err(McpError::SessionClosed),
        }
    }

    /// Returns `true` once the session this handler runs in has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.session.as_ref().map_or(true, Session::is_stopped)
    }
}

/// Per-request context passed to method and tool handlers.
#[derive(Clone, Debug)]
pub struct RequestContext {
    request_id: RequestId,
    peer: Peer,
}

impl RequestContext {
    pub(crate) const fn new(request_id: RequestId, peer: Peer) -> Self {
        Self { request_id, peer }
    }

    /// A context that is not attached to any session.
    #[must_use]
    pub const fn detached(request_id: RequestId) -> Self {
        Self {
            request_id,
            peer: Peer { session: None },
        }
    }

    /// ID of the request being handled.
    #[must_use]
    pub const fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Handle to the peer that sent the request.
    #[must_use]
    pub const fn peer(&self) -> &Peer {
        &self.peer
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::mcp::protocol::{decode, ErrorCode, METHOD_PING};

    const WAIT: Duration = Duration::from_secs(5);

    fn identity() -> ServerIdentity {
        ServerIdentity {
            info: Implementation::new("test-server", "0.0.1"),
            capabilities: ServerCapabilities::with_tools(),
            instructions: None,
        }
    }

    fn methods() -> MethodRegistry {
        let mut methods = MethodRegistry::new();
        methods.register(METHOD_PING, |_, _| async { Ok(json!({})) });
        methods.register("slow", |_, _| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!("late"))
        });
        methods.register("boom", exploding);
        methods
    }

    async fn exploding(_: Option<Value>, _: RequestContext) -> McpResult<Value> {
        panic!("handler exploded")
    }

    fn start(role: Role, options: SessionOptions) -> (Session, FrameReader, FrameWriter) {
        let (ours, theirs) = Transport::pair(64 * 1024);
        let session = Session::start(role, ours, methods(), NotificationRegistry::new(), options);
        let (reader, writer) = theirs.into_parts();
        (session, reader, writer)
    }

    async fn next(reader: &mut FrameReader) -> Message {
        let frame = tokio::time::timeout(WAIT, reader.read_frame())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("stream closed");
        decode(&frame).unwrap()
    }

    fn into_response(message: Message) -> Response {
        match message {
            Message::Response(resp) => resp,
            other => panic!("expected response, got {other:?}"),
        }
    }

    fn error_code(resp: &Response) -> i32 {
        match &resp.outcome {
            Outcome::Error(error) => error.code,
            Outcome::Result(result) => panic!("expected error, got {result}"),
        }
    }

    async fn initialize(reader: &mut FrameReader, writer: &mut FrameWriter) -> Response {
        writer
            .write_frame(
                r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"raw","version":"1"}}}"#,
            )
            .await
            .unwrap();
        into_response(next(reader).await)
    }

    #[tokio::test]
    async fn server_session_starts_unconnected() {
        let (session, _reader, _writer) = start(Role::Server(identity()), SessionOptions::default());
        assert_eq!(session.state(), SessionState::Unconnected);
    }

    #[tokio::test]
    async fn requests_before_initialize_are_rejected() {
        let (session, mut reader, mut writer) =
            start(Role::Server(identity()), SessionOptions::default());

        writer
            .write_frame(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
            .await
            .unwrap();
        let resp = into_response(next(&mut reader).await);

        assert_eq!(resp.id, Some(RequestId::Number(1)));
        assert_eq!(error_code(&resp), ErrorCode::NotInitialized.code());
        assert_eq!(session.state(), SessionState::Unconnected);
    }

    #[tokio::test]
    async fn initialize_makes_the_server_ready() {
        let (session, mut reader, mut writer) =
            start(Role::Server(identity()), SessionOptions::default());

        let resp = initialize(&mut reader, &mut writer).await;
        let Outcome::Result(result) = resp.outcome else {
            panic!("initialize failed");
        };
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], "test-server");
        assert_eq!(result["capabilities"], json!({"tools": {}}));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.client_params().unwrap().client_info.name, "raw");

        writer
            .write_frame(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#)
            .await
            .unwrap();
        let resp = into_response(next(&mut reader).await);
        assert_eq!(resp, Response::success(RequestId::Number(2), json!({})));
    }

    #[tokio::test]
    async fn unsupported_version_is_answered_with_latest() {
        let (_session, mut reader, mut writer) =
            start(Role::Server(identity()), SessionOptions::default());

        writer
            .write_frame(
                r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"1999-01-01","clientInfo":{"name":"old","version":"0"}}}"#,
            )
            .await
            .unwrap();
        let resp = into_response(next(&mut reader).await);
        let Outcome::Result(result) = resp.outcome else {
            panic!("initialize failed");
        };
        assert_eq!(result["protocolVersion"], LATEST_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn second_initialize_is_rejected() {
        let (_session, mut reader, mut writer) =
            start(Role::Server(identity()), SessionOptions::default());

        initialize(&mut reader, &mut writer).await;
        let resp = initialize(&mut reader, &mut writer).await;
        assert_eq!(error_code(&resp), ErrorCode::InvalidRequest.code());
    }

    #[tokio::test]
    async fn invalid_initialize_params_leave_session_unconnected() {
        let (session, mut reader, mut writer) =
            start(Role::Server(identity()), SessionOptions::default());

        writer
            .write_frame(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"capabilities":[]}}"#)
            .await
            .unwrap();
        let resp = into_response(next(&mut reader).await);
        assert_eq!(error_code(&resp), ErrorCode::InvalidParams.code());
        assert_eq!(session.state(), SessionState::Unconnected);
    }

    #[tokio::test]
    async fn unknown_methods_are_answered_not_fatal() {
        let (session, mut reader, mut writer) =
            start(Role::Server(identity()), SessionOptions::default());
        initialize(&mut reader, &mut writer).await;

        writer
            .write_frame(r#"{"jsonrpc":"2.0","id":"x","method":"resources/list"}"#)
            .await
            .unwrap();
        let resp = into_response(next(&mut reader).await);
        assert_eq!(error_code(&resp), ErrorCode::MethodNotFound.code());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn malformed_frames_are_reported_and_skipped() {
        let (session, mut reader, mut writer) =
            start(Role::Server(identity()), SessionOptions::default());

        writer.write_frame("not valid json").await.unwrap();
        let resp = into_response(next(&mut reader).await);
        assert!(resp.id.is_none());
        assert_eq!(error_code(&resp), ErrorCode::ParseError.code());

        writer.write_frame(r#"{"id":4,"method":"x"}"#).await.unwrap();
        let resp = into_response(next(&mut reader).await);
        assert_eq!(error_code(&resp), ErrorCode::InvalidRequest.code());

        let resp = initialize(&mut reader, &mut writer).await;
        assert!(matches!(resp.outcome, Outcome::Result(_)));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn repeated_decode_failures_stop_the_session() {
        let options = SessionOptions {
            max_consecutive_decode_errors: 2,
        };
        let (session, mut reader, mut writer) = start(Role::Server(identity()), options);

        writer.write_frame("garbage").await.unwrap();
        writer.write_frame("more garbage").await.unwrap();
        next(&mut reader).await;
        next(&mut reader).await;

        tokio::time::timeout(WAIT, session.wait_until_stopped())
            .await
            .expect("session did not stop");
        assert!(session.is_stopped());
    }

    #[tokio::test]
    async fn unknown_response_ids_are_dropped() {
        let (session, mut reader, mut writer) =
            start(Role::Server(identity()), SessionOptions::default());
        initialize(&mut reader, &mut writer).await;

        writer
            .write_frame(r#"{"jsonrpc":"2.0","id":99,"result":{}}"#)
            .await
            .unwrap();
        writer
            .write_frame(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#)
            .await
            .unwrap();

        let resp = into_response(next(&mut reader).await);
        assert_eq!(resp.id, Some(RequestId::Number(2)));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn notifications_are_never_answered() {
        let (_session, mut reader, mut writer) =
            start(Role::Server(identity()), SessionOptions::default());
        initialize(&mut reader, &mut writer).await;

        writer
            .write_frame(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await
            .unwrap();
        writer
            .write_frame(r#"{"jsonrpc":"2.0","method":"notifications/whatever","params":{}}"#)
            .await
            .unwrap();
        writer
            .write_frame(r#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#)
            .await
            .unwrap();

        let resp = into_response(next(&mut reader).await);
        assert_eq!(resp.id, Some(RequestId::Number(3)));
    }

    #[tokio::test]
    async fn panicking_handler_yields_internal_error() {
        let (session, mut reader, mut writer) =
            start(Role::Server(identity()), SessionOptions::default());
        initialize(&mut reader, &mut writer).await;

        writer
            .write_frame(r#"{"jsonrpc":"2.0","id":7,"method":"boom"}"#)
            .await
            .unwrap();
        let resp = into_response(next(&mut reader).await);
        assert_eq!(resp.id, Some(RequestId::Number(7)));
        assert_eq!(error_code(&resp), ErrorCode::InternalError.code());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn cancelled_requests_get_no_response() {
        let (_session, mut reader, mut writer) =
            start(Role::Server(identity()), SessionOptions::default());
        initialize(&mut reader, &mut writer).await;

        writer
            .write_frame(r#"{"jsonrpc":"2.0","id":5,"method":"slow"}"#)
            .await
            .unwrap();
        writer
            .write_frame(
                r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":5,"reason":"user"}}"#,
            )
            .await
            .unwrap();
        writer
            .write_frame(r#"{"jsonrpc":"2.0","id":6,"method":"ping"}"#)
            .await
            .unwrap();

        let resp = into_response(next(&mut reader).await);
        assert_eq!(resp.id, Some(RequestId::Number(6)));
    }

    #[tokio::test]
    async fn eof_fails_pending_requests() {
        let (session, mut reader, writer) = start(Role::Client, SessionOptions::default());

        let caller = session.clone();
        let pending = tokio::spawn(async move {
            caller
                .request(METHOD_INITIALIZE, Some(json!({})), None)
                .await
        });

        let Message::Request(req) = next(&mut reader).await else {
            panic!("expected the initialize request");
        };
        assert_eq!(req.method, METHOD_INITIALIZE);

        drop(reader);
        drop(writer);

        let outcome = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(McpError::SessionClosed)));
        assert!(session.is_stopped());
    }

    #[tokio::test]
    async fn timeout_cancels_and_late_response_is_dropped() {
        let (session, mut reader, mut writer) = start(Role::Client, SessionOptions::default());

        let outcome = session
            .request(METHOD_INITIALIZE, None, Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(outcome, Err(McpError::Timeout(_))));

        let Message::Request(req) = next(&mut reader).await else {
            panic!("expected the initialize request");
        };
        let Message::Notification(cancel) = next(&mut reader).await else {
            panic!("expected a cancellation");
        };
        assert_eq!(cancel.method, NOTIFICATION_CANCELLED);
        assert_eq!(cancel.params.unwrap()["requestId"], json!(1));

        writer
            .write_frame(&protocol::encode(&Message::Response(Response::success(
                req.id,
                json!({}),
            ))))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!session.is_stopped());
        assert!(session.shared.outstanding().waiting.is_empty());
    }

    #[tokio::test]
    async fn client_requests_need_a_handshake() {
        let (session, _reader, _writer) = start(Role::Client, SessionOptions::default());

        let outcome = session.request(METHOD_PING, None, None).await;
        assert!(matches!(outcome, Err(McpError::NotInitialized)));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closes_transport() {
        let (session, mut reader, _writer) =
            start(Role::Server(identity()), SessionOptions::default());

        session.stop().await;
        session.stop().await;
        assert!(session.is_stopped());

        let outcome = session.request(METHOD_PING, None, None).await;
        assert!(matches!(outcome, Err(McpError::SessionClosed)));
        assert!(matches!(
            session.notify("notifications/x", None).await,
            Err(McpError::SessionClosed)
        ));
        assert!(session.peer().is_closed());

        let eof = tokio::time::timeout(WAIT, reader.read_frame()).await.unwrap();
        assert!(eof.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_failure_stops_session_and_fails_pending_requests() {
        let (_peer_in, session_in) = tokio::io::duplex(64 * 1024);
        let (session_out, peer_out) = tokio::io::duplex(64 * 1024);
        let session = Session::start(
            Role::Client,
            Transport::new(session_in, session_out),
            methods(),
            NotificationRegistry::new(),
            SessionOptions::default(),
        );
        assert!(session.transition(SessionState::Unconnected, SessionState::Ready));
        let (mut peer_reader, _) = Transport::new(peer_out, tokio::io::sink()).into_parts();

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.request("slow", None, None).await }
        });
        let Message::Request(req) = next(&mut peer_reader).await else {
            panic!("expected the first request");
        };
        assert_eq!(req.method, "slow");

        // Peer goes away, the next write hits a broken pipe
        drop(peer_reader);

        let second = session.request(METHOD_PING, None, None).await;
        assert!(matches!(second, Err(McpError::Transport(_))), "{second:?}");

        let first = tokio::time::timeout(WAIT, first).await.unwrap().unwrap();
        assert!(matches!(first, Err(McpError::SessionClosed)), "{first:?}");
        assert!(session.is_stopped());
    }

    #[tokio::test]
    async fn stop_does_not_wait_for_a_peer_that_stopped_reading() {
        let (ours, theirs) = Transport::pair(64);
        let session = Session::start(
            Role::Client,
            ours,
            methods(),
            NotificationRegistry::new(),
            SessionOptions::default(),
        );
        assert!(session.transition(SessionState::Unconnected, SessionState::Ready));
        let (_reader, _writer) = theirs.into_parts();

        let blocked = tokio::spawn({
            let session = session.clone();
            async move {
                let params = json!({"name": "swift_echo", "arguments": {"message": "x".repeat(100_000)}});
                session.request("tools/call", Some(params), None).await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        tokio::time::timeout(Duration::from_secs(2), session.stop())
            .await
            .expect("stop waited on a blocked write");
        let outcome = tokio::time::timeout(Duration::from_secs(2), blocked)
            .await
            .expect("blocked request never resolved")
            .unwrap();
        assert!(matches!(outcome, Err(McpError::SessionClosed)), "{outcome:?}");

        let outcome = tokio::time::timeout(WAIT, session.request(METHOD_PING, None, None))
            .await
            .unwrap();
        assert!(matches!(outcome, Err(McpError::SessionClosed)));
    }

    #[tokio::test]
    async fn panicking_notification_handler_keeps_reader_alive() {
        let mut notifications = NotificationRegistry::new();
        notifications.register("notifications/boom", |_| panic!("notification handler exploded"));

        let (ours, theirs) = Transport::pair(64 * 1024);
        let session = Session::start(
            Role::Server(identity()),
            ours,
            methods(),
            notifications,
            SessionOptions::default(),
        );
        let (mut reader, mut writer) = theirs.into_parts();

        writer
            .write_frame(r#"{"jsonrpc":"2.0","method":"notifications/boom"}"#)
            .await
            .unwrap();
        let resp = initialize(&mut reader, &mut writer).await;
        assert!(matches!(resp.outcome, Outcome::Result(_)));
        assert_eq!(session.state(), SessionState::Ready);

        drop(writer);
        drop(reader);
        tokio::time::timeout(WAIT, session.wait_until_stopped())
            .await
            .expect("session did not stop after the peer closed");
    }

    #[test]
    fn detached_context_has_no_peer() {
        let ctx = RequestContext::detached(RequestId::from("r-1"));
        assert_eq!(ctx.request_id(), &RequestId::from("r-1"));
        assert!(ctx.peer().is_closed());
    }
}
