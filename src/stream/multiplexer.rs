//! Single-socket multiplexer for the panel's realtime streams.
//!
//! One websocket carries status, console, heap and tick events. The status
//! stream flows from the moment the socket opens; the others stay silent
//! until a `{"stream":...,"type":"start"}` frame activates them. Decoded
//! events fan out to every subscriber of the matching stream, each in its
//! own task, so a slow handler never stalls the receiver.

use std::collections::HashSet;
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{
    HeaderValue, InvalidHeaderValue, COOKIE, ORIGIN, USER_AGENT,
};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::cookies::{SERVER_COOKIE, SESSION_COOKIE};
use crate::gateway::{ATERNOS_BASE_URL, BROWSER_USER_AGENT};
use crate::retry::with_timeout;
use crate::server::{ServerInfo, ServerStatus};
use crate::stream::proto::{decode_event, OutboundFrame, StreamEvent, StreamKind, HEARTBEAT_FRAME};
use crate::stream::registry::{SubscriptionId, SubscriptionRegistry};

/// Production websocket endpoint for the realtime streams.
pub const HERMES_ENDPOINT: &str = "wss://aternos.org/hermes/";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = SplitSink<Socket, Message>;
type SocketStream = SplitStream<Socket>;

/// Async callback run when the server waits in the queue for confirmation.
pub type ConfirmHook = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(49);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

#[derive(Clone, Debug)]
pub struct StreamOptions {
    pub endpoint: String,
    pub origin: String,
    pub user_agent: String,
    pub keepalive_interval: Duration,
    pub connect_timeout: Duration,
    /// Confirm the queued start automatically. Needs a confirm hook.
    pub auto_confirm: bool,
    /// Activate subscribed streams when the server reports "starting".
    pub auto_activate: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            endpoint: HERMES_ENDPOINT.to_string(),
            origin: ATERNOS_BASE_URL.to_string(),
            user_agent: BROWSER_USER_AGENT.to_string(),
            keepalive_interval: StreamDefaults::KEEPALIVE_INTERVAL,
            connect_timeout: StreamDefaults::CONNECT_TIMEOUT,
            auto_confirm: false,
            auto_activate: false,
        }
    }
}

impl StreamOptions {
    /// Sets an explicit websocket endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end().to_string();
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_auto_confirm(mut self, enabled: bool) -> Self {
        self.auto_confirm = enabled;
        self
    }

    pub fn with_auto_activate(mut self, enabled: bool) -> Self {
        self.auto_activate = enabled;
        self
    }
}

/// Errors produced by stream transport and protocol handling.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid handshake header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    /// The socket is not open: `connect` was never called or the connection
    /// is gone.
    #[error("stream socket is not connected")]
    NotConnected,

    #[error("invalid connection state: {0:?}")]
    InvalidState(ConnectionState),

    #[error("websocket handshake timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("confirm request failed: {0}")]
    Confirm(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    /// Terminal. Reached through `close` or when the receiver exits.
    Closed,
}

/// What `close` does with handler tasks that are still running.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum HandlerDrain {
    /// Leave them running to completion on their own.
    #[default]
    Detach,
    /// Await every one of them.
    Wait,
    /// Cancel them.
    Abort,
}

/// Payload accepted by [`StreamMultiplexer::send`].
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Text(String),
    Json(Value),
}

impl Outbound {
    fn into_text(self) -> Result<String, serde_json::Error> {
        match self {
            Self::Text(text) => Ok(text),
            Self::Json(value) => serde_json::to_string(&value),
        }
    }
}

impl From<String> for Outbound {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Outbound {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Value> for Outbound {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

struct Inner {
    options: StreamOptions,
    session_cookie: SecretString,
    server_id: String,
    state: watch::Sender<ConnectionState>,
    sink: AsyncMutex<Option<SocketSink>>,
    registry: SubscriptionRegistry,
    activated: RwLock<HashSet<StreamKind>>,
    confirmed: AtomicBool,
    confirm_hook: RwLock<Option<ConfirmHook>>,
    handlers: Mutex<JoinSet<()>>,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn is_activated(&self, kind: StreamKind) -> bool {
        !kind.requires_activation()
            || self
                .activated
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&kind)
    }

    fn set_activated(&self, kind: StreamKind, active: bool) {
        let mut activated = self.activated.write().unwrap_or_else(PoisonError::into_inner);
        if active {
            activated.insert(kind);
        } else {
            activated.remove(&kind);
        }
    }

    /// Non-status streams with at least one subscriber.
    fn activation_targets(&self) -> Vec<StreamKind> {
        self.registry
            .kinds()
            .into_iter()
            .filter(|kind| kind.requires_activation())
            .collect()
    }

    async fn send_text(&self, text: String) -> Result<(), StreamError> {
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => sink.send(Message::Text(text)).await.map_err(StreamError::from),
            None => Err(StreamError::NotConnected),
        }
    }

    async fn send(&self, payload: Outbound) -> Result<(), StreamError> {
        let text = payload.into_text()?;
        self.send_text(text).await.map_err(|err| {
            if matches!(err, StreamError::NotConnected) {
                warn!(event = "stream_send_not_connected", server = %self.server_id);
            }
            err
        })
    }

    async fn activate(&self, kind: StreamKind) -> Result<(), StreamError> {
        let Some(frame) = OutboundFrame::start(kind) else {
            return Ok(());
        };
        debug!(event = "stream_activation_requested", stream = %kind);
        self.set_activated(kind, true);
        let result = self.send_text(frame.to_text()?).await;
        if result.is_err() {
            self.set_activated(kind, false);
        }
        result
    }

    async fn activate_subscribed(&self, event: &StreamEvent) {
        let Some(info) = event.as_status().map(ServerInfo::from_value) else {
            return;
        };
        if info.status() != ServerStatus::Starting {
            return;
        }
        for kind in self.activation_targets() {
            if let Err(err) = self.activate(kind).await {
                warn!(event = "stream_activation_failed", stream = %kind, error = %err);
            }
        }
    }

    async fn confirm_if_queued(&self, event: &StreamEvent) {
        let Some(info) = event.as_status().map(ServerInfo::from_value) else {
            return;
        };
        if !info.is_pending_confirmation() {
            return;
        }
        if self.confirmed.swap(true, Ordering::SeqCst) {
            return;
        }

        let hook = self
            .confirm_hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(hook) = hook else {
            warn!(event = "stream_auto_confirm_without_hook", server = %self.server_id);
            return;
        };

        info!(event = "stream_auto_confirm", server = %self.server_id);
        if let Err(reason) = hook().await {
            warn!(
                event = "stream_auto_confirm_failed",
                error = %StreamError::Confirm(reason)
            );
        }
    }

    fn dispatch_text(&self, text: &str) {
        let event = match decode_event(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(event = "stream_frame_invalid", error = %err);
                return;
            }
        };
        let Some(kind) = event.kind() else {
            debug!(event = "stream_frame_ignored");
            return;
        };
        if !self.is_activated(kind) {
            debug!(event = "stream_frame_dropped", stream = %kind);
            return;
        }

        let handlers = self.registry.matching(kind);
        if handlers.is_empty() {
            return;
        }

        let mut tasks = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        for (handler, args) in handlers {
            tasks.spawn(handler(event.clone(), args));
        }
    }

    async fn mark_closed(&self) {
        self.sink.lock().await.take();
        self.state.send_replace(ConnectionState::Closed);
    }
}

/// Owns one websocket connection and its background tasks.
pub struct StreamMultiplexer {
    inner: Arc<Inner>,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamMultiplexer {
    pub fn new(
        options: StreamOptions,
        session_cookie: SecretString,
        server_id: impl Into<String>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                options,
                session_cookie,
                server_id: server_id.into(),
                state,
                sink: AsyncMutex::new(None),
                registry: SubscriptionRegistry::new(),
                activated: RwLock::new(HashSet::new()),
                confirmed: AtomicBool::new(false),
                confirm_hook: RwLock::new(None),
                handlers: Mutex::new(JoinSet::new()),
            }),
            tasks: Vec::new(),
        }
    }

    /// Installs the callback used by auto-confirm.
    pub fn set_confirm_hook(&self, hook: ConfirmHook) {
        *self
            .inner
            .confirm_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub fn options(&self) -> &StreamOptions {
        &self.inner.options
    }

    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Returns a cloneable sender for outbound frames.
    ///
    /// The sender does not keep the connection alive; once the multiplexer
    /// is dropped every send fails with [`StreamError::NotConnected`].
    pub fn sender(&self) -> StreamSender {
        StreamSender {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscribe<F, Fut>(&self, kind: StreamKind, handler: F) -> SubscriptionId
    where
        F: Fn(StreamEvent, Arc<[Value]>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe_with_args(kind, Vec::new(), handler)
    }

    /// Subscribes with arguments that are passed back on every invocation.
    pub fn subscribe_with_args<F, Fut>(
        &self,
        kind: StreamKind,
        args: Vec<Value>,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(StreamEvent, Arc<[Value]>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.registry.insert(kind, args, handler)
    }

    /// Returns `false` when the subscription was already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.registry.remove(id)
    }

    /// Opens the websocket and starts the keepalive and receiver tasks.
    pub async fn connect(&mut self) -> Result<(), StreamError> {
        let state = self.inner.state();
        if state != ConnectionState::Disconnected {
            return Err(StreamError::InvalidState(state));
        }
        self.inner.state.send_replace(ConnectionState::Connecting);

        let socket = match self.open_socket().await {
            Ok(socket) => socket,
            Err(err) => {
                warn!(event = "stream_connect_failed", error = %err);
                self.inner.state.send_replace(ConnectionState::Disconnected);
                return Err(err);
            }
        };

        let (sink, stream) = socket.split();
        *self.inner.sink.lock().await = Some(sink);
        self.inner.confirmed.store(false, Ordering::SeqCst);
        self.inner
            .activated
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.register_builtins();
        self.inner.state.send_replace(ConnectionState::Open);
        info!(
            event = "stream_connected",
            endpoint = %self.inner.options.endpoint,
            server = %self.inner.server_id
        );

        self.tasks.push(tokio::spawn(keepalive_loop(
            Arc::clone(&self.inner),
            self.inner.options.keepalive_interval,
        )));
        self.tasks
            .push(tokio::spawn(receiver_loop(Arc::clone(&self.inner), stream)));
        Ok(())
    }

    async fn open_socket(&self) -> Result<Socket, StreamError> {
        let options = &self.inner.options;
        let mut request = options.endpoint.as_str().into_client_request()?;
        let cookie = format!(
            "{SESSION_COOKIE}={}; {SERVER_COOKIE}={}",
            self.inner.session_cookie.expose_secret(),
            self.inner.server_id
        );
        let headers = request.headers_mut();
        headers.insert(COOKIE, HeaderValue::from_str(&cookie)?);
        headers.insert(ORIGIN, HeaderValue::from_str(&options.origin)?);
        headers.insert(USER_AGENT, HeaderValue::from_str(&options.user_agent)?);

        let (socket, _) = with_timeout(options.connect_timeout, connect_async(request))
            .await
            .map_err(|_| StreamError::ConnectTimeout(options.connect_timeout))??;
        Ok(socket)
    }

    fn register_builtins(&self) {
        let options = &self.inner.options;
        if options.auto_confirm {
            let weak = Arc::downgrade(&self.inner);
            self.inner
                .registry
                .insert(StreamKind::Status, Vec::new(), move |event, _| {
                    let weak = Weak::clone(&weak);
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            inner.confirm_if_queued(&event).await;
                        }
                    }
                });
        }
        if options.auto_activate {
            let weak = Arc::downgrade(&self.inner);
            self.inner
                .registry
                .insert(StreamKind::Status, Vec::new(), move |event, _| {
                    let weak = Weak::clone(&weak);
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            inner.activate_subscribed(&event).await;
                        }
                    }
                });
        }
    }

    pub async fn send(&self, payload: impl Into<Outbound>) -> Result<(), StreamError> {
        self.inner.send(payload.into()).await
    }

    /// Sends a console command. A leading slash is not required.
    pub async fn command(&self, command: impl Into<String>) -> Result<(), StreamError> {
        let frame = OutboundFrame::console_command(command);
        self.inner.send_text(frame.to_text()?).await
    }

    /// Activates a non-status stream right away, e.g. when attaching to a
    /// server that is already running.
    pub async fn activate(&self, kind: StreamKind) -> Result<(), StreamError> {
        self.inner.activate(kind).await
    }

    /// Resolves once the connection reaches [`ConnectionState::Closed`].
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }

    /// Stops the background tasks and closes the socket. No events are
    /// delivered afterwards.
    pub async fn close(&mut self, drain: HandlerDrain) -> Result<(), StreamError> {
        for task in self.tasks.drain(..) {
            task.abort();
        }

        let sink = self.inner.sink.lock().await.take();
        let closed = match sink {
            Some(mut sink) => sink.close().await.map_err(StreamError::from),
            None => Ok(()),
        };
        self.inner.state.send_replace(ConnectionState::Closed);

        let mut handlers = mem::take(
            &mut *self
                .inner
                .handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        match drain {
            HandlerDrain::Detach => handlers.detach_all(),
            HandlerDrain::Wait => while handlers.join_next().await.is_some() {},
            HandlerDrain::Abort => handlers.shutdown().await,
        }
        info!(event = "stream_closed", server = %self.inner.server_id, drain = ?drain);
        closed
    }
}

impl Drop for StreamMultiplexer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Cloneable handle for sending frames from handlers or other tasks.
#[derive(Clone)]
pub struct StreamSender {
    inner: Weak<Inner>,
}

impl StreamSender {
    fn upgrade(&self) -> Result<Arc<Inner>, StreamError> {
        self.inner.upgrade().ok_or(StreamError::NotConnected)
    }

    pub async fn send(&self, payload: impl Into<Outbound>) -> Result<(), StreamError> {
        self.upgrade()?.send(payload.into()).await
    }

    pub async fn command(&self, command: impl Into<String>) -> Result<(), StreamError> {
        let frame = OutboundFrame::console_command(command);
        self.upgrade()?.send_text(frame.to_text()?).await
    }

    pub async fn activate(&self, kind: StreamKind) -> Result<(), StreamError> {
        self.upgrade()?.activate(kind).await
    }
}

async fn keepalive_loop(inner: Arc<Inner>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        if let Err(err) = inner.send_text(HEARTBEAT_FRAME.to_string()).await {
            debug!(event = "stream_keepalive_stopped", error = %err);
            return;
        }
    }
}

async fn receiver_loop(inner: Arc<Inner>, mut stream: SocketStream) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => inner.dispatch_text(&text),
            Ok(Message::Ping(payload)) => {
                let mut sink = inner.sink.lock().await;
                if let Some(sink) = sink.as_mut() {
                    if let Err(err) = sink.send(Message::Pong(payload)).await {
                        warn!(event = "stream_pong_failed", error = %err);
                    }
                }
            }
            Ok(Message::Close(frame)) => {
                debug!(event = "stream_close_frame", frame = ?frame);
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(event = "stream_receive_failed", error = %err);
                break;
            }
        }
    }
    info!(event = "stream_receiver_exited", server = %inner.server_id);
    inner.mark_closed().await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures_util::FutureExt;
    use secrecy::SecretString;
    use serde_json::json;

    use super::{
        ConfirmHook, ConnectionState, HandlerDrain, StreamError, StreamMultiplexer, StreamOptions,
        HERMES_ENDPOINT,
    };
    use crate::stream::proto::{StreamEvent, StreamKind};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime")
    }

    fn multiplexer(options: StreamOptions) -> StreamMultiplexer {
        StreamMultiplexer::new(options, SecretString::new("session".to_string()), "srv1")
    }

    fn status_frame(info: serde_json::Value) -> String {
        json!({"type": "status", "message": info.to_string()}).to_string()
    }

    async fn drain_handlers(mux: &StreamMultiplexer) {
        let mut tasks = std::mem::take(&mut *mux.inner.handlers.lock().expect("handlers"));
        while tasks.join_next().await.is_some() {}
    }

    #[test]
    fn defaults_use_hermes_endpoint_and_opt_out_behaviors() {
        let options = StreamOptions::default();
        assert_eq!(options.endpoint, HERMES_ENDPOINT);
        assert_eq!(options.keepalive_interval, Duration::from_secs(49));
        assert!(!options.auto_confirm);
        assert!(!options.auto_activate);

        let options = options.with_endpoint("ws://127.0.0.1:1/hermes/  \n");
        assert_eq!(options.endpoint, "ws://127.0.0.1:1/hermes/");
    }

    #[test]
    fn send_before_connect_is_an_error() {
        runtime().block_on(async {
            let mux = multiplexer(StreamOptions::default());
            let error = mux.send("raw").await.expect_err("not connected");
            assert!(matches!(error, StreamError::NotConnected));
            let error = mux.command("list").await.expect_err("not connected");
            assert!(matches!(error, StreamError::NotConnected));
            assert_eq!(mux.state(), ConnectionState::Disconnected);
        });
    }

    #[test]
    fn failed_connect_returns_to_disconnected() {
        runtime().block_on(async {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
            let addr = listener.local_addr().expect("addr");
            drop(listener);

            let mut mux = multiplexer(
                StreamOptions::default().with_endpoint(format!("ws://{addr}/hermes/")),
            );
            assert!(mux.connect().await.is_err());
            assert_eq!(mux.state(), ConnectionState::Disconnected);
        });
    }

    #[test]
    fn inactive_streams_are_not_dispatched() {
        runtime().block_on(async {
            let mux = multiplexer(StreamOptions::default());
            let lines = Arc::new(Mutex::new(Vec::new()));
            mux.subscribe(StreamKind::Console, {
                let lines = Arc::clone(&lines);
                move |event: StreamEvent, _| {
                    let lines = Arc::clone(&lines);
                    async move {
                        if let Some(line) = event.as_console_line() {
                            lines.lock().expect("lines").push(line.to_string());
                        }
                    }
                }
            });

            let frame = r#"{"type":"line","data":"early\n"}"#;
            mux.inner.dispatch_text(frame);
            drain_handlers(&mux).await;
            assert!(lines.lock().expect("lines").is_empty());

            mux.inner.set_activated(StreamKind::Console, true);
            mux.inner.dispatch_text(r#"{"type":"line","data":"late\n"}"#);
            drain_handlers(&mux).await;
            assert_eq!(*lines.lock().expect("lines"), vec!["late".to_string()]);
        });
    }

    #[test]
    fn status_reaches_every_subscriber_with_bound_args() {
        runtime().block_on(async {
            let mux = multiplexer(StreamOptions::default());
            let seen = Arc::new(Mutex::new(Vec::new()));
            for tag in ["a", "b"] {
                let seen = Arc::clone(&seen);
                mux.subscribe_with_args(StreamKind::Status, vec![json!(tag)], move |_, args| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().expect("seen").push(args[0].clone());
                    }
                });
            }

            mux.inner.dispatch_text(&status_frame(json!({"status": 0})));
            drain_handlers(&mux).await;
            let mut seen = seen.lock().expect("seen").clone();
            seen.sort_by_key(|value| value.to_string());
            assert_eq!(seen, vec![json!("a"), json!("b")]);
        });
    }

    #[test]
    fn invalid_frames_are_skipped() {
        runtime().block_on(async {
            let mux = multiplexer(StreamOptions::default());
            let calls = Arc::new(AtomicUsize::new(0));
            mux.subscribe(StreamKind::Status, {
                let calls = Arc::clone(&calls);
                move |_, _| {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });

            mux.inner.dispatch_text("{not json");
            mux.inner.dispatch_text(r#"{"type":"connected"}"#);
            drain_handlers(&mux).await;
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn activation_targets_only_subscribed_streams() {
        let mux = multiplexer(StreamOptions::default());
        assert!(mux.inner.activation_targets().is_empty());

        mux.subscribe(StreamKind::Status, |_, _| async {});
        assert!(mux.inner.activation_targets().is_empty());

        let heap = mux.subscribe(StreamKind::Heap, |_, _| async {});
        mux.subscribe(StreamKind::Console, |_, _| async {});
        assert_eq!(
            mux.inner.activation_targets(),
            vec![StreamKind::Console, StreamKind::Heap]
        );

        mux.unsubscribe(heap);
        assert_eq!(mux.inner.activation_targets(), vec![StreamKind::Console]);
    }

    #[test]
    fn auto_confirm_fires_once_per_connection() {
        runtime().block_on(async {
            let mux = multiplexer(StreamOptions::default().with_auto_confirm(true));
            let confirms = Arc::new(AtomicUsize::new(0));
            let hook: ConfirmHook = {
                let confirms = Arc::clone(&confirms);
                Arc::new(move || {
                    let confirms = Arc::clone(&confirms);
                    async move {
                        confirms.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), String>(())
                    }
                    .boxed()
                })
            };
            mux.set_confirm_hook(hook);
            mux.register_builtins();

            let queued = status_frame(json!({
                "status": 10,
                "class": "queueing",
                "queue": {"pending": "pending"}
            }));
            for _ in 0..3 {
                mux.inner.dispatch_text(&queued);
            }
            drain_handlers(&mux).await;
            assert_eq!(confirms.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn auto_confirm_ignores_other_statuses() {
        runtime().block_on(async {
            let mux = multiplexer(StreamOptions::default().with_auto_confirm(true));
            let confirms = Arc::new(AtomicUsize::new(0));
            let hook: ConfirmHook = {
                let confirms = Arc::clone(&confirms);
                Arc::new(move || {
                    confirms.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<(), String>(()) }.boxed()
                })
            };
            mux.set_confirm_hook(hook);
            mux.register_builtins();

            mux.inner.dispatch_text(&status_frame(json!({
                "status": 10,
                "class": "queueing",
                "queue": {"pending": "waiting"}
            })));
            mux.inner
                .dispatch_text(&status_frame(json!({"status": 1, "class": "online"})));
            drain_handlers(&mux).await;
            assert_eq!(confirms.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn close_without_connect_reaches_closed_state() {
        runtime().block_on(async {
            let mut mux = multiplexer(StreamOptions::default());
            mux.close(HandlerDrain::Wait).await.expect("close");
            assert_eq!(mux.state(), ConnectionState::Closed);
            tokio::time::timeout(Duration::from_secs(1), mux.closed())
                .await
                .expect("closed resolves");

            let error = mux.connect().await.expect_err("closed is terminal");
            assert!(matches!(error, StreamError::InvalidState(ConnectionState::Closed)));
        });
    }
}
