//! End-to-end feed behavior against a local WebSocket server.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use quay_core::config::StreamConfig;
use quay_core::types::DeliveryMode;
use quay_core::ws::DisconnectReason;
use quay_md::{ApplyOutcome, BookStore, CanonicalJsonParser, FeedEvent, MarketFeed};
use rust_decimal_macros::dec;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(10);

fn book(seq: u64, bids: serde_json::Value, asks: serde_json::Value) -> String {
    json!({ "symbol": "BTC-USD", "type": "book", "seq": seq, "bids": bids, "asks": asks }).to_string()
}

fn trades(ids: &[u64]) -> String {
    let trades: Vec<_> = ids
        .iter()
        .map(|id| json!({ "id": id, "price": "100", "qty": "0.1", "side": "buy" }))
        .collect();
    json!({ "symbol": "BTC-USD", "type": "trades", "ts": 1, "trades": trades }).to_string()
}

/// First connection: snapshot, delta, trades 1-2, then close.
/// Later connections: a new snapshot and trades 2-3, then stay open.
async fn spawn_exchange() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let n = connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                    return;
                };
                let frames = if n == 0 {
                    vec![
                        book(1, json!([["100", "1"]]), json!([["101", "1"]])),
                        book(2, json!([["100.5", "2"]]), json!([])),
                        trades(&[1, 2]),
                    ]
                } else {
                    vec![book(10, json!([["99", "3"]]), json!([["102", "1"]])), trades(&[2, 3])]
                };
                for frame in frames {
                    if ws.send(Message::Text(frame.into())).await.is_err() {
                        return;
                    }
                }
                if n == 0 {
                    let _ = ws.close(None).await;
                    return;
                }
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_close() {
                        break;
                    }
                }
            });
        }
    });
    format!("ws://{addr}")
}

#[tokio::test]
async fn feed_rebuilds_book_and_filters_replayed_trades_after_reconnect() {
    let url = spawn_exchange().await;
    let config: StreamConfig = serde_json::from_value(json!({
        "label": "demo_books",
        "endpoints": [url],
        "delivery_mode": "full_book_first_then_deltas",
    }))
    .unwrap();
    assert_eq!(config.delivery_mode, DeliveryMode::FullBookFirstThenDeltas);

    let store = BookStore::new();
    let mut feed = MarketFeed::new(config, Arc::new(CanonicalJsonParser), store.clone());
    let mut events = feed.start().unwrap();

    let mut seen = Vec::new();
    let mut connected = 0;
    let mut trade_ids = Vec::new();
    while connected < 2 || !trade_ids.contains(&3) {
        let event = timeout(WAIT, events.recv()).await.expect("feed went quiet").expect("feed ended");
        match &event {
            FeedEvent::Connected => connected += 1,
            FeedEvent::Trades { trades, .. } => trade_ids.extend(trades.iter().map(|t| t.trade_id)),
            _ => {}
        }
        seen.push(event);
    }

    assert_eq!(trade_ids, vec![1, 2, 3]);

    let disconnects: Vec<_> = seen.iter().filter(|e| matches!(e, FeedEvent::Disconnected { .. })).collect();
    assert_eq!(disconnects.len(), 1);
    assert!(matches!(
        disconnects[0],
        FeedEvent::Disconnected { member: 0, reason: DisconnectReason::PeerClosed }
    ));

    assert!(seen.iter().any(|e| matches!(
        e,
        FeedEvent::Book { outcome: ApplyOutcome::Delta { skipped: 0 }, .. }
    )));
    let snapshots = seen
        .iter()
        .filter(|e| matches!(e, FeedEvent::Book { outcome: ApplyOutcome::Snapshot { .. }, .. }))
        .count();
    assert_eq!(snapshots, 2);

    // The second session's snapshot replaced everything from the first.
    assert_eq!(store.best_bid("BTC-USD"), Some((dec!(99), dec!(3))));
    assert_eq!(store.best_ask("BTC-USD"), Some((dec!(102), dec!(1))));
    assert_eq!(store.snapshot("BTC-USD").unwrap().last_sequence(), Some(10));

    feed.stop().await;
    assert!(!feed.is_running());
    assert!(store.is_empty());
}

#[tokio::test]
async fn unreachable_endpoint_keeps_retrying_until_stopped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config: StreamConfig =
        serde_json::from_value(json!({ "label": "dead", "endpoints": [format!("ws://{addr}")] })).unwrap();
    let mut feed = MarketFeed::new(config, Arc::new(CanonicalJsonParser), BookStore::new());
    let mut events = feed.start().unwrap();

    for _ in 0..2 {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert!(matches!(
            event,
            FeedEvent::Disconnected { member: 0, reason: DisconnectReason::HandshakeFailed(_) }
        ));
    }
    assert!(feed.is_running());

    feed.stop().await;
    assert!(!feed.is_running());
}
