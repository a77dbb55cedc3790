//! Socket session and aggregator behavior against local WebSocket servers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use quay_core::ws::{
    AggregateEvent, DisconnectReason, Frame, MemberStatus, MultiSocketAggregator, OnFrameCallback, PingPayload,
    SessionConfig, SessionEvent, SessionState, SocketSession,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

/// Bind a local server that runs `handler` for every accepted socket.
async fn spawn_server<F, Fut>(handler: F) -> String
where
    F: Fn(WebSocketStream<TcpStream>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Ok(ws) = tokio_tungstenite::accept_async(tcp).await {
                    handler(ws).await;
                }
            });
        }
    });
    format!("ws://{addr}")
}

/// Echo text frames back; close when the peer sends `"bye"`.
async fn echo(mut ws: WebSocketStream<TcpStream>) {
    while let Some(Ok(msg)) = ws.next().await {
        match msg {
            Message::Text(t) if t.as_str() == "bye" => {
                let _ = ws.close(None).await;
                break;
            }
            Message::Text(t) => {
                if ws.send(Message::Text(t)).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

fn collecting_callback() -> (OnFrameCallback, mpsc::UnboundedReceiver<(usize, String)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cb: OnFrameCallback = Arc::new(move |id: usize, frame: Frame<'_>| {
        let text = String::from_utf8_lossy(frame.as_bytes()).into_owned();
        tx.send((id, text))?;
        Ok(())
    });
    (cb, rx)
}

#[tokio::test]
async fn subscribe_and_send_roundtrip() {
    let url = spawn_server(echo).await;
    let (on_frame, mut frames) = collecting_callback();
    let (ev_tx, mut events) = mpsc::unbounded_channel();

    let mut cfg = SessionConfig::new(3, url);
    cfg.subscribe_msg = Some(r#"{"op":"subscribe"}"#.into());
    let mut session = SocketSession::connect(cfg, on_frame, ev_tx);

    let ev = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(ev, SessionEvent::Connected { id: 3 });
    assert_eq!(session.state(), SessionState::Open);

    let (id, text) = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(id, 3);
    assert_eq!(text, r#"{"op":"subscribe"}"#);

    assert!(session.send("hello".into()).await);
    let (_, text) = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(text, "hello");

    session.stop().await;
    let ev = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(ev, SessionEvent::Disconnected { id: 3, reason: DisconnectReason::Requested });
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!session.send("late".into()).await);
}

#[tokio::test]
async fn failing_callback_keeps_session_open() {
    let url = spawn_server(echo).await;
    let (tx, mut frames) = mpsc::unbounded_channel();
    let on_frame: OnFrameCallback = Arc::new(move |_: usize, frame: Frame<'_>| -> anyhow::Result<()> {
        let text = String::from_utf8_lossy(frame.as_bytes()).into_owned();
        match text.as_str() {
            "boom" => anyhow::bail!("handler rejected frame"),
            "panic" => panic!("handler bug"),
            _ => {
                tx.send(text)?;
                Ok(())
            }
        }
    });
    let (ev_tx, mut events) = mpsc::unbounded_channel();
    let mut session = SocketSession::connect(SessionConfig::new(0, url), on_frame, ev_tx);
    assert!(matches!(timeout(WAIT, events.recv()).await.unwrap(), Some(SessionEvent::Connected { .. })));

    for msg in ["boom", "panic", "ok"] {
        assert!(session.send(msg.into()).await);
    }
    let text = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(text, "ok");
    assert_eq!(session.state(), SessionState::Open);
    assert!(events.try_recv().is_err());

    session.stop().await;
}

#[tokio::test]
async fn peer_close_is_reported_once() {
    let url = spawn_server(echo).await;
    let (on_frame, _frames) = collecting_callback();
    let (ev_tx, mut events) = mpsc::unbounded_channel();
    let session = SocketSession::connect(SessionConfig::new(0, url), on_frame, ev_tx);

    assert!(matches!(timeout(WAIT, events.recv()).await.unwrap(), Some(SessionEvent::Connected { .. })));
    assert!(session.send("bye".into()).await);

    let ev = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(ev, SessionEvent::Disconnected { id: 0, reason: DisconnectReason::PeerClosed });
    drop(session);
    assert!(timeout(WAIT, events.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn text_ping_payload_is_sent() {
    let (seen_tx, mut seen) = mpsc::unbounded_channel::<String>();
    let url = spawn_server(move |mut ws| {
        let seen_tx = seen_tx.clone();
        async move {
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(t) = msg {
                    let _ = seen_tx.send(t.as_str().to_string());
                }
            }
        }
    })
    .await;

    let (on_frame, _frames) = collecting_callback();
    let (ev_tx, _events) = mpsc::unbounded_channel();
    let mut cfg = SessionConfig::new(0, url);
    cfg.keep_alive = Duration::from_millis(50);
    cfg.ping_payload = Some(PingPayload::Text { text: "ping".into() });
    let mut session = SocketSession::connect(cfg, on_frame, ev_tx);

    let got = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(got, "ping");
    session.stop().await;
}

#[tokio::test]
async fn silent_peer_trips_keepalive_timeout() {
    // Holds the socket without reading, so pings are never answered.
    let url = spawn_server(|ws| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(ws);
    })
    .await;

    let (on_frame, _frames) = collecting_callback();
    let (ev_tx, mut events) = mpsc::unbounded_channel();
    let mut cfg = SessionConfig::new(0, url);
    cfg.keep_alive = Duration::from_millis(50);
    cfg.keep_alive_timeout = Some(Duration::from_millis(200));
    let _session = SocketSession::connect(cfg, on_frame, ev_tx);

    assert!(matches!(timeout(WAIT, events.recv()).await.unwrap(), Some(SessionEvent::Connected { .. })));
    let ev = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(ev, SessionEvent::Disconnected { id: 0, reason: DisconnectReason::KeepAliveTimeout });
}

#[tokio::test]
async fn aggregator_folds_three_members() {
    let mut urls = Vec::new();
    for _ in 0..3 {
        urls.push(spawn_server(echo).await);
    }
    let configs = urls.iter().enumerate().map(|(i, u)| SessionConfig::new(100 + i, u.clone())).collect();

    let (on_frame, mut frames) = collecting_callback();
    let (mut agg, mut events) = MultiSocketAggregator::open(configs, on_frame).unwrap();
    assert_eq!(agg.member_count(), 3);

    assert_eq!(timeout(WAIT, events.recv()).await.unwrap(), Some(AggregateEvent::Connected));
    assert!(agg.is_connected());

    // Every member shares the callback and is renumbered 0..n.
    assert!(agg.send_all("tick").await);
    let mut ids = Vec::new();
    for _ in 0..3 {
        let (id, text) = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
        assert_eq!(text, "tick");
        ids.push(id);
    }
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2]);

    // Server for member 1 closes; the aggregate goes down once and siblings follow.
    assert!(agg.member(1).unwrap().send("bye".into()).await);
    let ev = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(ev, AggregateEvent::Disconnected { member: 1, reason: DisconnectReason::PeerClosed });

    for i in 0..3 {
        let handle = agg.member(i).unwrap();
        timeout(WAIT, handle.wait_closed()).await.unwrap();
    }
    assert!(agg.session_states().iter().all(|s| *s == SessionState::Closed));
    assert!(!agg.is_connected());
    assert!(!agg.send_all("late").await);

    agg.stop().await;
    assert_eq!(agg.member_status(0), Some(MemberStatus::Disconnected));
    assert!(timeout(WAIT, events.recv()).await.unwrap().is_none());
}
