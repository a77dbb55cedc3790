//! Single WebSocket session with keepalive and liveness detection.
//!
//! Each `SocketSession` runs as a tokio task that:
//! 1. Performs the handshake against the endpoint (TLS when `wss://`).
//! 2. Sends the subscription message, if configured.
//! 3. Reads frames and forwards them to the owner's callback.
//! 4. Sends periodic keepalive pings and watches for silence.
//! 5. Ends on the first failure or on request, emitting exactly one
//!    [`SessionEvent::Disconnected`].
//!
//! A session never reconnects by itself. Owners watch the event channel and
//! open a new session when their reconnect policy says so.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tracing::{debug, error, info, warn};

use crate::error::QuayError;

/// A decoded frame handed to the owner.
#[derive(Debug, Clone, Copy)]
pub enum Frame<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

impl<'a> Frame<'a> {
    /// Raw payload bytes, regardless of frame type.
    pub fn as_bytes(&self) -> &'a [u8] {
        match *self {
            Frame::Text(t) => t.as_bytes(),
            Frame::Binary(b) => b,
        }
    }
}

/// Callback invoked for each received data frame.
///
/// Parameters: `(session_id, frame)`. An `Err` is logged and the session keeps
/// reading; one bad message must not end the stream.
pub type OnFrameCallback = Arc<dyn Fn(usize, Frame<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Keepalive ping format; varies by exchange.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PingPayload {
    /// Send a text frame (e.g. `"ping"`).
    Text { text: String },
    /// Send a JSON object as text (e.g. `{"op":"ping"}`).
    Json { json: serde_json::Value },
    /// Use the standard WebSocket ping frame.
    #[serde(rename = "websocket")]
    WebSocket,
}

/// Configuration for a single session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Session identifier (unique within an aggregator).
    pub id: usize,
    /// Full WebSocket URL (e.g. `wss://stream.example.com/ws`).
    pub url: String,
    /// Message to send immediately after the handshake.
    pub subscribe_msg: Option<String>,
    /// Extra HTTP headers for the handshake.
    pub extra_headers: HashMap<String, String>,
    /// Interval between keepalive pings; zero disables keepalive.
    pub keep_alive: Duration,
    /// Silence allowed before the session is declared dead.
    pub keep_alive_timeout: Option<Duration>,
    /// Ping format; a WebSocket ping frame when unset.
    pub ping_payload: Option<PingPayload>,
}

impl SessionConfig {
    pub fn new(id: usize, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            subscribe_msg: None,
            extra_headers: HashMap::new(),
            keep_alive: Duration::ZERO,
            keep_alive_timeout: None,
            ping_payload: None,
        }
    }

    /// Liveness deadline in effect, `None` when keepalive is disabled.
    pub fn effective_keep_alive_timeout(&self) -> Option<Duration> {
        if self.keep_alive.is_zero() {
            None
        } else {
            Some(self.keep_alive_timeout.unwrap_or(self.keep_alive * 3))
        }
    }
}

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The handshake (DNS, TCP, TLS, or HTTP upgrade) failed.
    HandshakeFailed(String),
    /// The peer sent a close frame.
    PeerClosed,
    /// The stream ended without a close frame.
    StreamEnded,
    /// A read or write failed.
    Transport(String),
    /// Nothing arrived within the keepalive timeout.
    KeepAliveTimeout,
    /// The owner closed the session.
    Requested,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HandshakeFailed(e) => write!(f, "handshake failed: {e}"),
            Self::PeerClosed => write!(f, "peer closed"),
            Self::StreamEnded => write!(f, "stream ended"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::KeepAliveTimeout => write!(f, "keepalive timeout"),
            Self::Requested => write!(f, "closed by owner"),
        }
    }
}

/// Connectivity notifications delivered to the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { id: usize },
    Disconnected { id: usize, reason: DisconnectReason },
}

impl SessionEvent {
    pub fn id(&self) -> usize {
        match self {
            Self::Connected { id } | Self::Disconnected { id, .. } => *id,
        }
    }
}

/// Sender half of a session event channel.
pub type SessionEventSender = mpsc::UnboundedSender<SessionEvent>;

/// Receiver half of a session event channel.
pub type SessionEventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Cheap, cloneable control surface for a running session.
#[derive(Clone)]
pub struct SessionHandle {
    id: usize,
    outbound_tx: mpsc::Sender<String>,
    state_rx: watch::Receiver<SessionState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Queue a text message. Returns `false` once the session is closing or
    /// closed; never panics.
    pub async fn send(&self, msg: String) -> bool {
        if matches!(self.state(), SessionState::Closing | SessionState::Closed) {
            return false;
        }
        self.outbound_tx.send(msg).await.is_ok()
    }

    /// Ask the session to close. Idempotent.
    pub fn close(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Wait until the session has reached [`SessionState::Closed`].
    pub async fn wait_closed(&self) {
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }
}

/// One physical WebSocket connection managed by a background tokio task.
pub struct SocketSession {
    handle: SessionHandle,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl SocketSession {
    /// Start connecting. Must be called from within a tokio runtime.
    ///
    /// Frames go to `on_frame`; `Connected` / `Disconnected` go to `events`.
    pub fn connect(config: SessionConfig, on_frame: OnFrameCallback, events: SessionEventSender) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(64);

        let handle = SessionHandle {
            id: config.id,
            outbound_tx,
            state_rx,
            shutdown_tx: Arc::new(shutdown_tx),
        };

        let task = tokio::spawn(async move {
            session_task(config, on_frame, events, state_tx, outbound_rx, shutdown_rx).await;
        });

        Self { handle, task: Some(task) }
    }

    pub fn id(&self) -> usize {
        self.handle.id
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    /// Send a text message on this session. See [`SessionHandle::send`].
    pub async fn send(&self, msg: String) -> bool {
        self.handle.send(msg).await
    }

    pub fn close(&self) {
        self.handle.close();
    }

    pub async fn wait_closed(&self) {
        self.handle.wait_closed().await;
    }

    /// Close the session and wait for its task to finish.
    pub async fn stop(&mut self) {
        self.handle.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SocketSession {
    fn drop(&mut self) {
        self.handle.close();
    }
}

/// Runs the session and reports its end exactly once.
async fn session_task(
    config: SessionConfig,
    on_frame: OnFrameCallback,
    events: SessionEventSender,
    state_tx: watch::Sender<SessionState>,
    outbound_rx: mpsc::Receiver<String>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let id = config.id;
    let reason = run_session(&config, &on_frame, &events, &state_tx, outbound_rx, shutdown_rx).await;

    match &reason {
        DisconnectReason::Requested => info!("[ws-{id}] closed"),
        other => warn!("[ws-{id}] disconnected: {other}"),
    }
    state_tx.send_replace(SessionState::Closed);
    let _ = events.send(SessionEvent::Disconnected { id, reason });
}

/// Connect, subscribe, then read/write/ping until something ends the session.
async fn run_session(
    config: &SessionConfig,
    on_frame: &OnFrameCallback,
    events: &SessionEventSender,
    state_tx: &watch::Sender<SessionState>,
    mut outbound_rx: mpsc::Receiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> DisconnectReason {
    let id = config.id;

    if *shutdown_rx.borrow() {
        return DisconnectReason::Requested;
    }

    info!("[ws-{id}] connecting to {}", config.url);

    let ws_stream = tokio::select! {
        res = connect_ws(config) => match res {
            Ok(s) => s,
            Err(e) => {
                error!("[ws-{id}] connection failed: {e}");
                return DisconnectReason::HandshakeFailed(e.to_string());
            }
        },
        _ = shutdown_rx.changed() => return DisconnectReason::Requested,
    };

    state_tx.send_replace(SessionState::Open);
    info!("[ws-{id}] connected");
    let _ = events.send(SessionEvent::Connected { id });

    let (mut ws_write, mut ws_read) = ws_stream.split();

    if let Some(ref sub_msg) = config.subscribe_msg {
        debug!("[ws-{id}] subscribing: {sub_msg}");
        if let Err(e) = ws_write.send(Message::Text(sub_msg.clone().into())).await {
            return DisconnectReason::Transport(e.to_string());
        }
    }

    let mut ping_timer = (!config.keep_alive.is_zero()).then(|| {
        let mut interval = tokio::time::interval_at(Instant::now() + config.keep_alive, config.keep_alive);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let silence_limit = config.effective_keep_alive_timeout();
    let mut last_seen = Instant::now();

    loop {
        let deadline = silence_limit.map(|limit| last_seen + limit);

        tokio::select! {
            _ = shutdown_rx.changed() => {
                state_tx.send_replace(SessionState::Closing);
                let _ = ws_write.close().await;
                return DisconnectReason::Requested;
            }

            msg = ws_read.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => deliver(id, on_frame, Frame::Text(text.as_str())),
                    Some(Ok(Message::Binary(data))) => deliver(id, on_frame, Frame::Binary(&data)),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => return DisconnectReason::PeerClosed,
                    Some(Ok(_)) => {} // Pong, raw Frame
                    Some(Err(e)) => return DisconnectReason::Transport(e.to_string()),
                    None => return DisconnectReason::StreamEnded,
                }
            }

            Some(msg) = outbound_rx.recv() => {
                if let Err(e) = ws_write.send(Message::Text(msg.into())).await {
                    return DisconnectReason::Transport(e.to_string());
                }
            }

            _ = next_tick(&mut ping_timer) => {
                let ping = match &config.ping_payload {
                    Some(PingPayload::Text { text }) => Message::Text(text.clone().into()),
                    Some(PingPayload::Json { json }) => Message::Text(json.to_string().into()),
                    Some(PingPayload::WebSocket) | None => Message::Ping(Vec::new().into()),
                };
                if let Err(e) = ws_write.send(ping).await {
                    return DisconnectReason::Transport(e.to_string());
                }
            }

            _ = sleep_until_opt(deadline) => return DisconnectReason::KeepAliveTimeout,
        }
    }
}

/// Hand a frame to the owner, containing errors and panics.
fn deliver(id: usize, on_frame: &OnFrameCallback, frame: Frame<'_>) {
    match std::panic::catch_unwind(AssertUnwindSafe(|| on_frame(id, frame))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("[ws-{id}] frame handler error: {e:#}"),
        Err(_) => error!("[ws-{id}] frame handler panicked"),
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

/// Establish the WebSocket connection, adding the configured headers.
async fn connect_ws(
    config: &SessionConfig,
) -> Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    QuayError,
> {
    let parsed = url::Url::parse(&config.url)
        .map_err(|e| QuayError::WebSocket(format!("invalid url {}: {e}", config.url)))?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(QuayError::WebSocket(format!("unsupported scheme: {}", parsed.scheme())));
    }

    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| QuayError::WebSocket(e.to_string()))?;

    for (key, value) in &config.extra_headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| QuayError::WebSocket(format!("bad header name {key}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| QuayError::WebSocket(format!("bad header value for {key}: {e}")))?;
        request.headers_mut().insert(name, value);
    }

    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| QuayError::WebSocket(e.to_string()))?;
    Ok(stream)
}
