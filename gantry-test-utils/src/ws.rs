//! Mock broker event stream (WebSocket) with resume-by-seq.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::state::MockExchangeState;

pub struct MockEventStream {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MockEventStream {
    pub async fn spawn(state: MockExchangeState) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _peer)) => {
                                let state = state.clone();
                                tokio::spawn(async move {
                                    if let Err(err) = serve_stream(state, stream).await {
                                        tracing::warn!(error = %err, "mock event stream connection ended");
                                    }
                                });
                            }
                            Err(err) => {
                                tracing::error!(error = %err, "mock event stream accept failed");
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

impl Drop for MockEventStream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

async fn serve_stream(state: MockExchangeState, stream: TcpStream) -> Result<()> {
    let captured_query = Arc::new(StdMutex::new(String::new()));
    let query_clone = captured_query.clone();
    let ws_stream = accept_hdr_async(stream, move |req: &Request, resp: Response| {
        if let Ok(mut query) = query_clone.lock() {
            *query = req.uri().query().unwrap_or_default().to_string();
        }
        Ok(resp)
    })
    .await?;

    let from_seq = captured_query
        .lock()
        .map(|query| {
            query
                .split('&')
                .find_map(|pair| pair.strip_prefix("from_seq="))
                .and_then(|value| value.parse::<u64>().ok())
        })
        .unwrap_or(None)
        .unwrap_or(0);

    let mut live = state.subscribe();
    let mut sink = ws_stream;

    // Backlog first, then the live feed; the consumer dedups by seq.
    for event in state.events_from(from_seq) {
        sink.send(Message::Text(serde_json::to_string(&event)?)).await?;
    }
    loop {
        match live.recv().await {
            Ok(event) => {
                sink.send(Message::Text(serde_json::to_string(&event)?)).await?;
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "mock event stream lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}
