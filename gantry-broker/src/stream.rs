//! Single-reader broker event stream over a persistent WebSocket.

use futures::StreamExt;
use gantry_core::BrokerEvent;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::{BrokerError, BrokerResult};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connected broker event stream. Exactly one reader per process consumes
/// it; events arrive sequenced monotonically per broker session.
pub struct EventStream {
    socket: WsStream,
    last_seq: Option<u64>,
}

impl EventStream {
    /// Connect to `url`. The caller embeds the resume position in the URL
    /// (`?from_seq=`), so a reconnect replays from the last seen sequence.
    pub async fn connect(url: &str) -> BrokerResult<Self> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|err| BrokerError::Transport(err.to_string()))?;
        debug!(%url, "broker event stream connected");
        Ok(Self {
            socket,
            last_seq: None,
        })
    }

    /// Highest sequence number observed on this connection.
    #[must_use]
    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Read the next event frame. `Ok(None)` means the broker closed the
    /// stream cleanly; callers reconnect and run a full reconciliation
    /// before resuming normal processing.
    pub async fn next_event(&mut self) -> BrokerResult<Option<BrokerEvent>> {
        loop {
            let message = match self.socket.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => return Err(BrokerError::Transport(err.to_string())),
                None => return Ok(None),
            };
            match message {
                Message::Text(text) => {
                    let event: BrokerEvent = serde_json::from_str(&text)
                        .map_err(|err| BrokerError::Serialization(err.to_string()))?;
                    if let Some(last) = self.last_seq {
                        if event.seq <= last {
                            debug!(seq = event.seq, last, "skipping replayed broker event");
                            continue;
                        }
                        if event.seq > last + 1 {
                            warn!(
                                seq = event.seq,
                                last, "gap in broker event stream; reconciliation will cover it"
                            );
                        }
                    }
                    self.last_seq = Some(event.seq);
                    return Ok(Some(event));
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => return Ok(None),
                other => {
                    debug!(?other, "ignoring non-text frame on broker stream");
                    continue;
                }
            }
        }
    }
}
