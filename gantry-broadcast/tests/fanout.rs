//! Observer protocol tests: sequencing, snapshots, resync, fan-out scale.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use gantry_broadcast::{BroadcastServer, ChannelEvent, Envelope, SnapshotSource};
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

struct StubSnapshots;

#[async_trait]
impl SnapshotSource for StubSnapshots {
    async fn current(&self, channels: &[String]) -> HashMap<String, serde_json::Value> {
        channels
            .iter()
            .map(|channel| (channel.clone(), json!({ "stub": channel })))
            .collect()
    }
}

async fn spawn_server() -> BroadcastServer {
    BroadcastServer::spawn("127.0.0.1:0".parse().unwrap(), Arc::new(StubSnapshots))
        .await
        .unwrap()
}

async fn connect(
    server: &BroadcastServer,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let (ws, _) = connect_async(format!("ws://{}", server.local_addr()))
        .await
        .unwrap();
    ws
}

async fn next_envelope<S>(ws: &mut S) -> Envelope
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match ws.next().await.expect("stream open").expect("frame") {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn handshake_then_subscribe_yields_snapshot() {
    let server = spawn_server().await;
    let mut ws = connect(&server).await;

    let handshake = next_envelope(&mut ws).await;
    assert_eq!(handshake.seq, 1);
    assert_eq!(handshake.payload["type"], "HANDSHAKE");
    assert_eq!(handshake.payload["server"], "gantry");

    ws.send(Message::Text(
        json!({ "type": "SUBSCRIBE", "channels": ["equity", "positions"] }).to_string(),
    ))
    .await
    .unwrap();

    let snapshot = next_envelope(&mut ws).await;
    assert_eq!(snapshot.seq, 2);
    assert_eq!(snapshot.payload["type"], "SNAPSHOT");
    assert!(snapshot.payload["channels"]["equity"].is_object());
    assert!(snapshot.payload["channels"]["positions"].is_object());
}

#[tokio::test]
async fn events_reach_only_subscribed_channels_in_sequence() {
    let server = spawn_server().await;
    let publisher = server.publisher();
    let mut ws = connect(&server).await;
    let _ = next_envelope(&mut ws).await;

    ws.send(Message::Text(
        json!({ "type": "SUBSCRIBE", "channels": ["equity"] }).to_string(),
    ))
    .await
    .unwrap();
    let _ = next_envelope(&mut ws).await; // snapshot

    // Give the subscription a moment to register before publishing.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    publisher.publish(ChannelEvent::new("orders", json!({ "ignored": true })));
    publisher.publish(ChannelEvent::new("equity", json!({ "equity": "100000" })));
    publisher.publish(ChannelEvent::new("equity", json!({ "equity": "100100" })));

    let first = next_envelope(&mut ws).await;
    let second = next_envelope(&mut ws).await;
    assert_eq!(first.channel, "equity");
    assert_eq!(second.channel, "equity");
    assert!(second.seq == first.seq + 1, "gap-free per connection");
    assert_eq!(first.payload["equity"], "100000");
}

#[tokio::test]
async fn resync_is_answered_with_a_fresh_snapshot() {
    let server = spawn_server().await;
    let mut ws = connect(&server).await;
    let _ = next_envelope(&mut ws).await;

    ws.send(Message::Text(
        json!({ "type": "SUBSCRIBE", "channels": ["regime"] }).to_string(),
    ))
    .await
    .unwrap();
    let snapshot = next_envelope(&mut ws).await;

    ws.send(Message::Text(
        json!({ "type": "RESYNC", "last_seen_seq": snapshot.seq }).to_string(),
    ))
    .await
    .unwrap();
    let resynced = next_envelope(&mut ws).await;
    assert_eq!(resynced.payload["type"], "SNAPSHOT");
    assert!(resynced.seq > snapshot.seq);
    assert_eq!(
        resynced.payload["next_seq"].as_u64().unwrap(),
        resynced.seq + 1
    );
}

#[tokio::test]
async fn fifty_observers_each_see_monotonic_sequences() {
    let server = spawn_server().await;
    let publisher = server.publisher();

    let mut observers = Vec::new();
    for _ in 0..50 {
        let mut ws = connect(&server).await;
        let _ = next_envelope(&mut ws).await;
        ws.send(Message::Text(
            json!({ "type": "SUBSCRIBE", "channels": ["health"] }).to_string(),
        ))
        .await
        .unwrap();
        let _ = next_envelope(&mut ws).await;
        observers.push(ws);
    }

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    for i in 0..5 {
        publisher.publish(ChannelEvent::new("health", json!({ "beat": i })));
    }

    for ws in &mut observers {
        let mut last_seq = 0;
        for _ in 0..5 {
            let frame = next_envelope(ws).await;
            assert!(frame.seq > last_seq, "sequence must strictly increase");
            last_seq = frame.seq;
        }
    }
}
