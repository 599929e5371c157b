//! JSON-RPC session
//!
//! The protocol state machine layered on [`crate::transport`]: request-ID
//! allocation, pending-request matching, dispatch of server-initiated
//! traffic, and the LSP lifecycle
//! (`Uninitialized → Initializing → Running → ShuttingDown → Closed`).
//!
//! The session is the sole writer to its transport. Concurrent requesters
//! serialize frame writes through one lock, and responses are matched to
//! callers purely by ID, never by send order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio::time::timeout;

use crate::error::{LspError, LspResult};
use crate::proto::{
    InitializeParams, InitializeResult, Message, Notification, Request, RequestId, Response,
    ResponseError,
};
use crate::settings::Settings;
use crate::transport::{MessageWriter, Transport};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

type PendingSender = oneshot::Sender<LspResult<Response>>;
type NotificationHandler = Box<dyn Fn(Value) + Send + Sync>;
type RequestHandler = Box<dyn Fn(Value) -> Result<Value, ResponseError> + Send + Sync>;

/// Lifecycle states of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Uninitialized = 0,
    Initializing = 1,
    Running = 2,
    ShuttingDown = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initializing,
            2 => Self::Running,
            3 => Self::ShuttingDown,
            4 => Self::Closed,
            _ => Self::Uninitialized,
        }
    }

    fn to_u8(self) -> u8 {
        self as u8
    }

    /// Shutdown has begun or completed; the session will never serve
    /// another request.
    pub fn is_down(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Closed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::ShuttingDown => "shutting down",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Removes the pending entry and tells the server if a request future is
/// dropped mid-flight, so `select!`-style races cancel cleanly.
struct PendingGuard {
    session: Weak<Session>,
    id: u64,
    armed: bool,
}

impl PendingGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.id;
        if let Some(session) = self.session.upgrade()
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            handle.spawn(async move {
                session.cancel(id).await;
            });
        }
    }
}

pub struct Session {
    name: String,
    state: AtomicU8,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingSender>>,
    writer: Mutex<MessageWriter<BoxedWriter>>,
    notification_handlers: RwLock<HashMap<String, NotificationHandler>>,
    request_handlers: RwLock<HashMap<String, RequestHandler>>,
    request_timeout: Duration,
    initialize_timeout: Duration,
    shutdown_timeout: Duration,
}

impl Session {
    /// Wrap a connected byte stream pair and start the reader task.
    ///
    /// `name` labels log lines; it is usually the server config name.
    pub fn connect(
        name: impl Into<String>,
        reader: BoxedReader,
        writer: BoxedWriter,
        settings: &Settings,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            name: name.into(),
            state: AtomicU8::new(SessionState::Uninitialized.to_u8()),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            writer: Mutex::new(MessageWriter::new(writer)),
            notification_handlers: RwLock::new(HashMap::new()),
            request_handlers: RwLock::new(HashMap::new()),
            request_timeout: settings.request_timeout(),
            initialize_timeout: settings.initialize_timeout(),
            shutdown_timeout: settings.shutdown_grace(),
        });

        let reader_session = Arc::clone(&session);
        tokio::spawn(async move {
            reader_session.read_loop(Transport::new(reader)).await;
        });

        session
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(
                from.to_u8(),
                to.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Run the `initialize` handshake. On success the `initialized`
    /// notification is sent automatically and the session is `Running`.
    pub async fn initialize(
        self: &Arc<Self>,
        params: InitializeParams,
    ) -> LspResult<InitializeResult> {
        if !self.transition(SessionState::Uninitialized, SessionState::Initializing) {
            return Err(LspError::InvalidState {
                method: "initialize".to_string(),
                state: self.state(),
            });
        }

        let result = self
            .send_request("initialize", Some(serde_json::to_value(&params)?), self.initialize_timeout)
            .await
            .and_then(|value| {
                serde_json::from_value::<InitializeResult>(value)
                    .map_err(|e| LspError::Protocol(format!("malformed initialize result: {e}")))
            });

        match result {
            Ok(parsed) => {
                self.send_notification("initialized", Some(serde_json::json!({})))
                    .await?;
                if !self.transition(SessionState::Initializing, SessionState::Running) {
                    return Err(LspError::ConnectionLost);
                }
                tracing::info!("{}: session running", self.name);
                Ok(parsed)
            }
            Err(e) => {
                tracing::warn!("{}: initialize failed: {}", self.name, e);
                self.close().await;
                Err(e)
            }
        }
    }

    /// Send a request and wait for the matching response with the default
    /// deadline.
    pub async fn request(self: &Arc<Self>, method: &str, params: Option<Value>) -> LspResult<Value> {
        self.request_with_timeout(method, params, self.request_timeout)
            .await
    }

    /// Send a request with an explicit deadline. A timeout removes the
    /// waiter, notifies the server with `$/cancelRequest`, and leaves the
    /// session `Running`; a late response is matched and discarded.
    pub async fn request_with_timeout(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> LspResult<Value> {
        if is_lifecycle_method(method) {
            return Err(LspError::Protocol(format!(
                "'{}' is lifecycle traffic managed by the session",
                method
            )));
        }
        let state = self.state();
        if state != SessionState::Running {
            return Err(LspError::InvalidState {
                method: method.to_string(),
                state,
            });
        }
        self.send_request(method, params, deadline).await
    }

    /// Fire-and-forget notification. Only legal while `Running`; the
    /// lifecycle notifications are sent by the session itself.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> LspResult<()> {
        if is_lifecycle_method(method) {
            return Err(LspError::Protocol(format!(
                "'{}' is lifecycle traffic managed by the session",
                method
            )));
        }
        let state = self.state();
        if state != SessionState::Running {
            return Err(LspError::InvalidState {
                method: method.to_string(),
                state,
            });
        }
        self.send_notification(method, params).await
    }

    /// Register a handler for a server-initiated notification method.
    ///
    /// At most one handler per method; registering again replaces the
    /// previous handler.
    pub async fn on_notification<F>(&self, method: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.notification_handlers
            .write()
            .await
            .insert(method.to_string(), Box::new(handler));
    }

    /// Register a handler for a server-to-client request method. Same
    /// replace-on-reregister semantics as [`Session::on_notification`].
    /// Without a handler the server receives a MethodNotFound error.
    pub async fn on_request<F>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Result<Value, ResponseError> + Send + Sync + 'static,
    {
        self.request_handlers
            .write()
            .await
            .insert(method.to_string(), Box::new(handler));
    }

    /// Release the waiter for an in-flight request with `Cancelled` and
    /// tell the server. The server's eventual response, if any, is dropped
    /// by the unknown-id path.
    pub async fn cancel(&self, id: u64) {
        let sender = self.pending.lock().await.remove(&id);
        if let Some(tx) = sender {
            let _ = tx.send(Err(LspError::Cancelled));
        }
        let _ = self
            .send_notification("$/cancelRequest", Some(serde_json::json!({ "id": id })))
            .await;
    }

    /// Run the `shutdown`/`exit` sequence. The `exit` notification goes
    /// out once the `shutdown` response arrives or the shutdown timeout
    /// elapses. Idempotent once shutdown has begun.
    pub async fn shutdown(self: &Arc<Self>) -> LspResult<()> {
        if !self.transition(SessionState::Running, SessionState::ShuttingDown) {
            return match self.state() {
                state if state.is_down() => Ok(()),
                state => Err(LspError::InvalidState {
                    method: "shutdown".to_string(),
                    state,
                }),
            };
        }

        match self.send_request("shutdown", None, self.shutdown_timeout).await {
            Ok(_) => {}
            Err(e) if e.is_fatal_to_session() => {
                self.close().await;
                return Ok(());
            }
            Err(e) => {
                tracing::debug!("{}: shutdown request failed: {}", self.name, e);
            }
        }

        let _ = self.send_notification("exit", None).await;
        // EOF on the server's stdin, for servers that wait on it
        let _ = self.writer.lock().await.close().await;
        self.close().await;
        tracing::info!("{}: session closed", self.name);
        Ok(())
    }

    /// Mark the session closed and fail every pending request. Invoked on
    /// transport failure, process death, and at the end of shutdown.
    pub(crate) async fn close(&self) {
        self.set_state(SessionState::Closed);

        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            tracing::debug!(
                "{}: failing {} pending requests, connection closed",
                self.name,
                pending.len()
            );
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(LspError::ConnectionLost));
            }
        }
    }

    async fn send_request(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> LspResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let mut guard = PendingGuard {
            session: Arc::downgrade(self),
            id,
            armed: true,
        };

        let request = Request::new(id, method, params);
        tracing::trace!("{}: request {} {}", self.name, id, method);

        if let Err(e) = self.write(&request).await {
            guard.disarm();
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match timeout(deadline, rx).await {
            Ok(Ok(outcome)) => {
                guard.disarm();
                outcome.and_then(|response| response.into_result().map_err(LspError::from))
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(LspError::Cancelled)
            }
            Err(_) => {
                guard.disarm();
                self.pending.lock().await.remove(&id);
                let _ = self
                    .send_notification("$/cancelRequest", Some(serde_json::json!({ "id": id })))
                    .await;
                Err(LspError::Timeout {
                    method: method.to_string(),
                    timeout: deadline,
                })
            }
        }
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> LspResult<()> {
        self.write(&Notification::new(method, params)).await
    }

    /// Write one framed message. A write failure is fatal to the session.
    async fn write<T: Serialize>(&self, payload: &T) -> LspResult<()> {
        let result = {
            let mut writer = self.writer.lock().await;
            writer.write(payload).await
        };
        if let Err(e) = result {
            if !self.state().is_down() {
                tracing::error!("{}: write failed: {}", self.name, e);
            }
            self.close().await;
            return Err(LspError::ConnectionLost);
        }
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut transport: Transport<BoxedReader>) {
        loop {
            match transport.read_message().await {
                Ok(message) => self.dispatch(message).await,
                Err(e) => {
                    if !self.state().is_down() {
                        tracing::error!("{}: read error: {}", self.name, e);
                    }
                    self.close().await;
                    break;
                }
            }
            if self.state() == SessionState::Closed {
                break;
            }
        }
    }

    async fn dispatch(&self, message: Message) {
        match message {
            Message::Response(response) => {
                let Some(id) = response.id.as_ref().and_then(RequestId::as_number) else {
                    tracing::debug!("{}: response without usable id dropped", self.name);
                    return;
                };
                let sender = self.pending.lock().await.remove(&id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(Ok(response));
                    }
                    None => {
                        // Timed-out, cancelled, or never ours. Protocol
                        // violation at worst; never fatal.
                        tracing::debug!(
                            "{}: response for unknown request id {} dropped",
                            self.name,
                            id
                        );
                    }
                }
            }
            Message::Request(request) => {
                self.handle_server_request(request).await;
            }
            Message::Notification(notification) => {
                let params = notification.params.unwrap_or(Value::Null);
                let handlers = self.notification_handlers.read().await;
                match handlers.get(&notification.method) {
                    Some(handler) => handler(params),
                    None => {
                        tracing::trace!(
                            "{}: unhandled notification {}",
                            self.name,
                            notification.method
                        );
                    }
                }
            }
        }
    }

    async fn handle_server_request(&self, request: Request) {
        let params = request.params.unwrap_or(Value::Null);
        let result = {
            let handlers = self.request_handlers.read().await;
            match handlers.get(&request.method) {
                Some(handler) => handler(params),
                None => {
                    tracing::debug!(
                        "{}: unhandled server request {}",
                        self.name,
                        request.method
                    );
                    Err(ResponseError::method_not_found(&request.method))
                }
            }
        };

        let response = match result {
            Ok(value) => Response::success(request.id, value),
            Err(error) => Response::failure(request.id, error),
        };
        let _ = self.write(&response).await;
    }
}

fn is_lifecycle_method(method: &str) -> bool {
    matches!(method, "initialize" | "initialized" | "shutdown" | "exit")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ClientCapabilities;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio::sync::mpsc;

    struct FakeServer {
        transport: Transport<ReadHalf<DuplexStream>>,
        writer: MessageWriter<WriteHalf<DuplexStream>>,
    }

    fn connect(settings: &Settings) -> (Arc<Session>, FakeServer) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let session = Session::connect(
            "fake-ls",
            Box::new(client_read),
            Box::new(client_write),
            settings,
        );
        let server = FakeServer {
            transport: Transport::new(server_read),
            writer: MessageWriter::new(server_write),
        };
        (session, server)
    }

    impl FakeServer {
        async fn recv(&mut self) -> Message {
            self.transport.read_message().await.unwrap()
        }

        async fn expect_request(&mut self, method: &str) -> Request {
            match self.recv().await {
                Message::Request(req) => {
                    assert_eq!(req.method, method);
                    req
                }
                other => panic!("expected '{}' request, got {:?}", method, other),
            }
        }

        async fn expect_notification(&mut self, method: &str) -> Notification {
            match self.recv().await {
                Message::Notification(n) => {
                    assert_eq!(n.method, method);
                    n
                }
                other => panic!("expected '{}' notification, got {:?}", method, other),
            }
        }

        async fn respond(&mut self, id: RequestId, result: Value) {
            self.writer
                .write(&Response::success(id, result))
                .await
                .unwrap();
        }

        async fn respond_error(&mut self, id: RequestId, code: i32, message: &str) {
            self.writer
                .write(&Response::failure(
                    id,
                    ResponseError {
                        code,
                        message: message.to_string(),
                        data: None,
                    },
                ))
                .await
                .unwrap();
        }

        async fn send_notification(&mut self, method: &str, params: Value) {
            self.writer
                .write(&Notification::new(method, Some(params)))
                .await
                .unwrap();
        }

        async fn send_request(&mut self, id: u64, method: &str, params: Value) {
            self.writer
                .write(&Request::new(id, method, Some(params)))
                .await
                .unwrap();
        }
    }

    fn init_params() -> InitializeParams {
        InitializeParams {
            process_id: Some(std::process::id()),
            root_uri: Some("file:///tmp/workspace".to_string()),
            capabilities: ClientCapabilities::baseline(),
            client_info: None,
            initialization_options: None,
        }
    }

    /// Drive the handshake from both ends and leave the session `Running`.
    async fn handshake(session: &Arc<Session>, server: &mut FakeServer, caps: Value) {
        let sess = Arc::clone(session);
        let init = tokio::spawn(async move { sess.initialize(init_params()).await });

        let req = server.expect_request("initialize").await;
        server
            .respond(req.id, serde_json::json!({ "capabilities": caps }))
            .await;
        server.expect_notification("initialized").await;

        init.await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn test_request_before_initialize_fails() {
        let (session, _server) = connect(&Settings::default());

        let err = session
            .request("textDocument/hover", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LspError::InvalidState {
                state: SessionState::Uninitialized,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_initialize_reaches_running() {
        let (session, mut server) = connect(&Settings::default());
        handshake(
            &session,
            &mut server,
            serde_json::json!({ "hoverProvider": true }),
        )
        .await;

        let err = session.initialize(init_params()).await.unwrap_err();
        assert!(matches!(err, LspError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_responses_match_by_id_out_of_order() {
        let (session, mut server) = connect(&Settings::default());
        handshake(&session, &mut server, serde_json::json!({})).await;

        let one = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.request("test/one", None).await })
        };
        let two = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.request("test/two", None).await })
        };

        // Collect both requests, then answer in reverse arrival order.
        let first = match server.recv().await {
            Message::Request(r) => r,
            other => panic!("expected request, got {:?}", other),
        };
        let second = match server.recv().await {
            Message::Request(r) => r,
            other => panic!("expected request, got {:?}", other),
        };

        server
            .respond(
                second.id.clone(),
                serde_json::json!({ "for": second.method }),
            )
            .await;
        server
            .respond(first.id.clone(), serde_json::json!({ "for": first.method }))
            .await;

        let result_one = one.await.unwrap().unwrap();
        let result_two = two.await.unwrap().unwrap();
        assert_eq!(result_one["for"], "test/one");
        assert_eq!(result_two["for"], "test/two");
    }

    #[tokio::test]
    async fn test_server_error_surfaces_to_caller() {
        let (session, mut server) = connect(&Settings::default());
        handshake(&session, &mut server, serde_json::json!({})).await;

        let pending = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.request("test/fails", None).await })
        };

        let req = server.expect_request("test/fails").await;
        server
            .respond_error(req.id, -32602, "invalid params")
            .await;

        match pending.await.unwrap().unwrap_err() {
            LspError::Server { code, message } => {
                assert_eq!(code, -32602);
                assert_eq!(message, "invalid params");
            }
            other => panic!("expected server error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_leaves_session_usable() {
        let (session, mut server) = connect(&Settings::default());
        handshake(&session, &mut server, serde_json::json!({})).await;

        let err = session
            .request_with_timeout("test/slow", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::Timeout { .. }));
        assert_eq!(session.state(), SessionState::Running);

        // Server saw the request and then the cancellation for its id.
        let slow = server.expect_request("test/slow").await;
        let cancel = server.expect_notification("$/cancelRequest").await;
        assert_eq!(
            cancel.params.unwrap()["id"],
            serde_json::json!(slow.id.as_number().unwrap())
        );

        // A fresh request still round-trips.
        let pending = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.request("test/ok", None).await })
        };
        let req = server.expect_request("test/ok").await;
        server.respond(req.id, serde_json::json!(1)).await;
        assert_eq!(pending.await.unwrap().unwrap(), serde_json::json!(1));
    }

    #[tokio::test]
    async fn test_stray_response_is_dropped() {
        let (session, mut server) = connect(&Settings::default());
        handshake(&session, &mut server, serde_json::json!({})).await;

        server
            .respond(RequestId::Number(9999), serde_json::json!("nobody asked"))
            .await;

        // Session survives and keeps serving.
        let pending = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.request("test/after", None).await })
        };
        let req = server.expect_request("test/after").await;
        server.respond(req.id, serde_json::json!("ok")).await;
        assert_eq!(pending.await.unwrap().unwrap(), serde_json::json!("ok"));
    }

    #[tokio::test]
    async fn test_unregistered_notification_ignored_then_handler_sees_future_ones() {
        let (session, mut server) = connect(&Settings::default());
        handshake(&session, &mut server, serde_json::json!({})).await;

        // No handler yet: dropped without harm.
        server
            .send_notification("custom/progress", serde_json::json!({ "n": 1 }))
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .on_notification("custom/progress", move |params| {
                let _ = tx.send(params);
            })
            .await;

        server
            .send_notification("custom/progress", serde_json::json!({ "n": 2 }))
            .await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received["n"], 2);
        // The missed notification is not replayed.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handler_registration_overwrites() {
        let (session, mut server) = connect(&Settings::default());
        handshake(&session, &mut server, serde_json::json!({})).await;

        let (tx_old, mut rx_old) = mpsc::unbounded_channel();
        session
            .on_notification("custom/event", move |_| {
                let _ = tx_old.send(());
            })
            .await;

        let (tx_new, mut rx_new) = mpsc::unbounded_channel();
        session
            .on_notification("custom/event", move |_| {
                let _ = tx_new.send(());
            })
            .await;

        server
            .send_notification("custom/event", serde_json::json!({}))
            .await;

        rx_new.recv().await.unwrap();
        assert!(rx_old.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_server_request_without_handler_gets_method_not_found() {
        let (session, mut server) = connect(&Settings::default());
        handshake(&session, &mut server, serde_json::json!({})).await;

        server
            .send_request(1, "window/workDoneProgress/create", serde_json::json!({}))
            .await;

        match server.recv().await {
            Message::Response(resp) => {
                let err = resp.into_result().unwrap_err();
                assert_eq!(err.code, crate::proto::error_codes::METHOD_NOT_FOUND);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_request_dispatches_to_handler() {
        let (session, mut server) = connect(&Settings::default());
        handshake(&session, &mut server, serde_json::json!({})).await;

        session
            .on_request("workspace/configuration", |params| {
                let items = params["items"].as_array().map(|a| a.len()).unwrap_or(0);
                Ok(Value::Array(vec![Value::Null; items]))
            })
            .await;

        server
            .send_request(
                7,
                "workspace/configuration",
                serde_json::json!({ "items": [{}, {}] }),
            )
            .await;

        match server.recv().await {
            Message::Response(resp) => {
                assert_eq!(resp.id, Some(RequestId::Number(7)));
                let result = resp.into_result().unwrap();
                assert_eq!(result.as_array().unwrap().len(), 2);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_sequence_sends_exit() {
        let (session, mut server) = connect(&Settings::default());
        handshake(&session, &mut server, serde_json::json!({})).await;

        let shutdown = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.shutdown().await })
        };

        let req = server.expect_request("shutdown").await;
        server.respond(req.id, Value::Null).await;
        server.expect_notification("exit").await;

        tokio_test::assert_ok!(shutdown.await.unwrap());
        assert_eq!(session.state(), SessionState::Closed);

        // Requests after shutdown fail with a lifecycle error.
        let err = session.request("test/late", None).await.unwrap_err();
        assert!(matches!(err, LspError::InvalidState { .. }));

        // And shutdown is idempotent.
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_timeout_still_sends_exit() {
        let settings = Settings {
            shutdown_grace_secs: 0,
            ..Settings::default()
        };
        let (session, mut server) = connect(&settings);
        handshake(&session, &mut server, serde_json::json!({})).await;

        let shutdown = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.shutdown().await })
        };

        // Never answer the shutdown request; exit must come anyway.
        server.expect_request("shutdown").await;
        loop {
            match server.recv().await {
                Message::Notification(n) if n.method == "exit" => break,
                // the timed-out shutdown request gets a cancellation
                Message::Notification(n) if n.method == "$/cancelRequest" => continue,
                other => panic!("expected exit, got {:?}", other),
            }
        }

        shutdown.await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_transport_close_fails_pending_requests() {
        let (session, mut server) = connect(&Settings::default());
        handshake(&session, &mut server, serde_json::json!({})).await;

        let pending = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.request("test/never", None).await })
        };
        server.expect_request("test/never").await;

        drop(server);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, LspError::ConnectionLost));

        // Reader task notices EOF and closes the session.
        tokio::time::timeout(Duration::from_secs(1), async {
            while session.state() != SessionState::Closed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_dropping_request_future_cancels_on_server() {
        let (session, mut server) = connect(&Settings::default());
        handshake(&session, &mut server, serde_json::json!({})).await;

        {
            let session = Arc::clone(&session);
            tokio::select! {
                _ = session.request("test/abandoned", None) => {
                    panic!("request should not complete")
                }
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }

        let req = server.expect_request("test/abandoned").await;
        let cancel = server.expect_notification("$/cancelRequest").await;
        assert_eq!(
            cancel.params.unwrap()["id"],
            serde_json::json!(req.id.as_number().unwrap())
        );
    }

    #[tokio::test]
    async fn test_lifecycle_methods_rejected_from_request_api() {
        let (session, mut server) = connect(&Settings::default());
        handshake(&session, &mut server, serde_json::json!({})).await;

        for method in ["initialize", "initialized", "shutdown", "exit"] {
            let err = session.request(method, None).await.unwrap_err();
            assert!(matches!(err, LspError::Protocol(_)), "method {}", method);
        }
        let err = session.notify("exit", None).await.unwrap_err();
        assert!(matches!(err, LspError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_notify_requires_running() {
        let (session, _server) = connect(&Settings::default());
        let err = session
            .notify("textDocument/didOpen", None)
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::InvalidState { .. }));
    }
}
