//! Broadcast bus: one multiplexed push channel per observer.
//!
//! Observers subscribe to channels (`positions`, `orders`, `equity`,
//! `regime`, `health`, `market:{symbol}`) over a WebSocket. Every outbound
//! frame carries a per-connection, strictly increasing sequence number.
//! Subscribing yields a whole-state `SNAPSHOT`; a client that detects a gap
//! requests `RESYNC` and receives a fresh snapshot. Observers are read-only
//! and cannot mutate engine state.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket failure: {0}")]
    WebSocket(String),
}

/// One value published to a channel. Fan-out and sequencing happen per
/// connection downstream.
#[derive(Clone, Debug)]
pub struct ChannelEvent {
    pub channel: String,
    pub payload: serde_json::Value,
}

impl ChannelEvent {
    pub fn new(channel: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }
}

/// Wire envelope for every outbound frame.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Envelope {
    pub seq: u64,
    pub ts: chrono::DateTime<Utc>,
    pub channel: String,
    pub payload: serde_json::Value,
}

/// Messages a client may send. Anything else is ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientMessage {
    #[serde(rename = "SUBSCRIBE")]
    Subscribe { channels: Vec<String> },
    #[serde(rename = "RESYNC")]
    Resync { last_seen_seq: u64 },
}

/// Supplies current whole-state values for snapshot frames.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Current value of each requested channel.
    async fn current(&self, channels: &[String]) -> HashMap<String, serde_json::Value>;
}

/// Handle used by the trading process to publish channel events.
#[derive(Clone)]
pub struct BusPublisher {
    tx: broadcast::Sender<ChannelEvent>,
}

impl BusPublisher {
    pub fn publish(&self, event: ChannelEvent) {
        let _ = self.tx.send(event);
    }

    /// Convenience for `market:{symbol}` frames.
    pub fn publish_market(&self, symbol: &str, payload: serde_json::Value) {
        self.publish(ChannelEvent::new(format!("market:{symbol}"), payload));
    }
}

/// The WebSocket fan-out server.
pub struct BroadcastServer {
    addr: SocketAddr,
    publisher: BusPublisher,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl BroadcastServer {
    /// Bind and start accepting observers.
    pub async fn spawn(
        addr: SocketAddr,
        snapshots: Arc<dyn SnapshotSource>,
    ) -> BusResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        let (tx, _) = broadcast::channel(4096);
        let publisher = BusPublisher { tx: tx.clone() };
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            info!(addr = %bound, "broadcast bus listening");
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let events = tx.subscribe();
                                let snapshots = snapshots.clone();
                                tokio::spawn(async move {
                                    if let Err(err) = serve_observer(stream, events, snapshots).await {
                                        debug!(%peer, error = %err, "observer connection closed");
                                    }
                                });
                            }
                            Err(err) => {
                                warn!(error = %err, "broadcast accept failed");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            addr: bound,
            publisher,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn publisher(&self) -> BusPublisher {
        self.publisher.clone()
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

impl Drop for BroadcastServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

struct Observer {
    subscriptions: HashSet<String>,
    seq: u64,
}

impl Observer {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn wants(&self, channel: &str) -> bool {
        self.subscriptions.contains(channel)
    }
}

async fn serve_observer(
    stream: TcpStream,
    mut events: broadcast::Receiver<ChannelEvent>,
    snapshots: Arc<dyn SnapshotSource>,
) -> BusResult<()> {
    let ws = accept_async(stream)
        .await
        .map_err(|err| BusError::WebSocket(err.to_string()))?;
    let (mut sink, mut source) = ws.split();
    let mut observer = Observer {
        subscriptions: HashSet::new(),
        seq: 0,
    };

    let handshake = Envelope {
        seq: observer.next_seq(),
        ts: Utc::now(),
        channel: "system".into(),
        payload: json!({
            "type": "HANDSHAKE",
            "server": "gantry",
            "next_seq": observer.seq + 1,
        }),
    };
    send_frame(&mut sink, &handshake).await?;

    loop {
        tokio::select! {
            incoming = source.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => return Err(BusError::WebSocket(err.to_string())),
                    None => return Ok(()),
                };
                let Message::Text(text) = message else { continue };
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Subscribe { channels }) => {
                        observer.subscriptions.extend(channels);
                        send_snapshot(&mut sink, &mut observer, snapshots.as_ref()).await?;
                    }
                    Ok(ClientMessage::Resync { last_seen_seq }) => {
                        debug!(last_seen_seq, "observer requested resync");
                        send_snapshot(&mut sink, &mut observer, snapshots.as_ref()).await?;
                    }
                    Err(err) => {
                        debug!(error = %err, "ignoring malformed client message");
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if !observer.wants(&event.channel) {
                            continue;
                        }
                        let frame = Envelope {
                            seq: observer.next_seq(),
                            ts: Utc::now(),
                            channel: event.channel,
                            payload: event.payload,
                        };
                        send_frame(&mut sink, &frame).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // The observer missed events; per protocol a gap is
                        // only ever followed by a fresh snapshot.
                        warn!(skipped, "observer lagged; sending snapshot");
                        send_snapshot(&mut sink, &mut observer, snapshots.as_ref()).await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

async fn send_snapshot<S>(
    sink: &mut S,
    observer: &mut Observer,
    snapshots: &dyn SnapshotSource,
) -> BusResult<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let channels: Vec<String> = observer.subscriptions.iter().cloned().collect();
    let state = snapshots.current(&channels).await;
    let frame = Envelope {
        seq: observer.next_seq(),
        ts: Utc::now(),
        channel: "system".into(),
        payload: json!({
            "type": "SNAPSHOT",
            "channels": state,
            "next_seq": observer.seq + 1,
        }),
    };
    send_frame(sink, &frame).await
}

async fn send_frame<S>(sink: &mut S, frame: &Envelope) -> BusResult<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(frame)
        .map_err(|err| BusError::WebSocket(err.to_string()))?;
    sink.send(Message::Text(text))
        .await
        .map_err(|err| BusError::WebSocket(err.to_string()))
}
