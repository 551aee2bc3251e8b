#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use fleetsync::config::FleetConfig;

pub const WAIT: Duration = Duration::from_secs(5);

/// In-process stand-in for the backend's telemetry channel.
///
/// Every accepted connection reports its request URI, forwards each text
/// frame it receives, and relays whatever the test pushes.
pub struct MockChannel {
    pub addr: SocketAddr,
    pub uris: mpsc::UnboundedReceiver<String>,
    pub received: mpsc::UnboundedReceiver<String>,
    pub closed: mpsc::UnboundedReceiver<()>,
    push: broadcast::Sender<String>,
}

impl MockChannel {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (uri_tx, uris) = mpsc::unbounded_channel();
        let (received_tx, received) = mpsc::unbounded_channel();
        let (closed_tx, closed) = mpsc::unbounded_channel();
        let (push, _) = broadcast::channel::<String>(64);

        let push_for_server = push.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let uri_tx = uri_tx.clone();
                let received_tx = received_tx.clone();
                let closed_tx = closed_tx.clone();
                let mut push_rx = push_for_server.subscribe();

                tokio::spawn(async move {
                    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        let _ = uri_tx.send(req.uri().to_string());
                        Ok(resp)
                    };
                    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                        return;
                    };
                    let (mut tx, mut rx) = ws.split();
                    loop {
                        tokio::select! {
                            msg = rx.next() => match msg {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = received_tx.send(text.as_str().to_owned());
                                }
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                Some(Ok(_)) => {}
                            },
                            frame = push_rx.recv() => match frame {
                                Ok(frame) => {
                                    if tx.send(Message::Text(frame.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Err(broadcast::error::RecvError::Lagged(_)) => {}
                                Err(broadcast::error::RecvError::Closed) => break,
                            },
                        }
                    }
                    let _ = closed_tx.send(());
                });
            }
        });

        Self {
            addr,
            uris,
            received,
            closed,
            push,
        }
    }

    /// Send a frame to every connected client.
    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.push.send(frame.into());
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub async fn next_uri(&mut self) -> String {
        tokio::time::timeout(WAIT, self.uris.recv())
            .await
            .expect("client should connect in time")
            .expect("mock channel alive")
    }

    pub async fn next_frame(&mut self) -> serde_json::Value {
        let text = self.next_text().await;
        serde_json::from_str(&text).expect("client frames should be JSON")
    }

    pub async fn next_text(&mut self) -> String {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("frame should arrive in time")
            .expect("mock channel alive")
    }

    pub async fn wait_closed(&mut self) {
        tokio::time::timeout(WAIT, self.closed.recv())
            .await
            .expect("connection should close in time")
            .expect("mock channel alive");
    }
}

/// Config pointing at `mock`, with the probe pushed out of the way.
pub fn config_for(mock: &MockChannel) -> FleetConfig {
    let mut config = FleetConfig::default();
    config.channel.url = Some(mock.url());
    config.channel.connect_timeout_ms = 2_000;
    config.channel.probe_interval_ms = 60_000;
    config
}
