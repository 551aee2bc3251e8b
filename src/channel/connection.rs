use futures::{SinkExt, StreamExt};
use rand::Rng;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;

use crate::config::{ChannelConfig, ReconnectConfig};
use crate::fleet::FleetStore;
use crate::protocol::{decode_frame, ControlFrame, Handshake, InboundEvent, OutboundMessage};
use crate::session::Session;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Lifecycle of the telemetry channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Connecting,
    Open,
}

/// Settings a channel task runs with.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Channel address without the session parameter.
    pub url: Url,
    pub role: String,
    pub connect_timeout: Duration,
    pub probe_interval: Duration,
    pub outbound_capacity: usize,
    pub reconnect: Option<Backoff>,
}

impl ChannelSettings {
    pub fn new(url: Url, channel: &ChannelConfig, reconnect: &ReconnectConfig) -> Self {
        Self {
            url,
            role: channel.role.clone(),
            connect_timeout: channel.connect_timeout(),
            probe_interval: channel.probe_interval(),
            outbound_capacity: channel.outbound_capacity.max(1),
            reconnect: reconnect.enabled.then(|| Backoff {
                initial: reconnect.initial_backoff(),
                max: reconnect.max_backoff(),
            }),
        }
    }

    /// The address actually dialled: `url` plus `session_id=<token>`.
    pub fn url_for(&self, token: &str) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("session_id", token);
        url
    }
}

/// Exponential reconnect delay bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

struct ActiveChannel {
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

/// Owns the persistent channel to the backend.
///
/// At most one channel is live at a time. The channel task:
/// - Connects to `{url}?session_id={token}`
/// - Sends the role handshake before anything else, then reports `Open`
/// - Runs a select! loop: probe timer, inbound frames, outbound queue, shutdown
/// - Decodes each inbound frame and applies it to the [`FleetStore`] in order
/// - On disconnect: reports `Closed`, then either exits or retries with
///   exponential backoff depending on [`ChannelSettings::reconnect`]
///
/// Failures never surface as errors; they are logged and visible through
/// [`ConnectionManager::state`].
pub struct ConnectionManager {
    settings: ChannelSettings,
    store: FleetStore,
    state: Arc<watch::Sender<ChannelState>>,
    outbound: parking_lot::Mutex<Option<mpsc::Sender<String>>>,
    active: tokio::sync::Mutex<Option<ActiveChannel>>,
}

impl ConnectionManager {
    pub fn new(settings: ChannelSettings, store: FleetStore) -> Self {
        let (state, _) = watch::channel(ChannelState::Closed);
        Self {
            settings,
            store,
            state: Arc::new(state),
            outbound: parking_lot::Mutex::new(None),
            active: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Open a channel for `session`, replacing any existing one.
    ///
    /// Does nothing for an unauthenticated session. Connection problems
    /// are logged and leave the state `Closed`.
    pub async fn start(&self, session: &Session) {
        if !session.authenticated {
            tracing::debug!("no authenticated session, not opening channel");
            return;
        }

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            tracing::debug!("replacing existing channel");
            self.close(previous).await;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.settings.outbound_capacity);
        *self.outbound.lock() = Some(outbound_tx);
        self.state.send_replace(ChannelState::Connecting);

        let task = tokio::spawn(channel_loop(
            self.settings.clone(),
            session.token.clone(),
            self.store.clone(),
            self.state.clone(),
            shutdown_rx,
            outbound_rx,
        ));
        *active = Some(ActiveChannel { shutdown_tx, task });
    }

    /// Close the channel and wait for its task to finish.
    ///
    /// Idempotent. Once this returns nothing more is written to the wire.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        if let Some(channel) = active.take() {
            self.close(channel).await;
        }
        self.state.send_replace(ChannelState::Closed);
    }

    async fn close(&self, channel: ActiveChannel) {
        self.outbound.lock().take();
        let _ = channel.shutdown_tx.send(true);
        if let Err(e) = channel.task.await {
            if e.is_panic() {
                tracing::error!(error = %e, "channel task panicked");
            }
        }
    }

    /// Queue a message for the backend.
    ///
    /// A no-op with a warning when the channel is not open or the outbound
    /// queue is full. Never blocks.
    pub fn send(&self, message: impl Into<OutboundMessage>) {
        if self.state() != ChannelState::Open {
            tracing::warn!(state = ?self.state(), "channel not open, dropping outbound message");
            return;
        }
        let text = match message.into().into_text() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize outbound message");
                return;
            }
        };
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            tracing::warn!("channel not open, dropping outbound message");
            return;
        };
        match tx.try_send(text) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("outbound queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("channel task exited, dropping message");
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(channel) = self.active.get_mut().take() {
            let _ = channel.shutdown_tx.send(true);
            channel.task.abort();
        }
    }
}

/// Why a single connection ended.
#[derive(Debug, PartialEq, Eq)]
enum ChannelExit {
    Shutdown,
    Lost,
}

async fn channel_loop(
    settings: ChannelSettings,
    token: String,
    store: FleetStore,
    state: Arc<watch::Sender<ChannelState>>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut outbound_rx: mpsc::Receiver<String>,
) {
    let url = settings.url_for(&token);
    let mut backoff = settings.reconnect.map(|b| b.initial);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        state.send_replace(ChannelState::Connecting);

        let connect = tokio::select! {
            result = tokio::time::timeout(
                settings.connect_timeout,
                tokio_tungstenite::connect_async(url.as_str()),
            ) => result,
            _ = shutdown_rx.changed() => break,
        };

        match connect {
            Ok(Ok((ws_stream, _))) => {
                backoff = settings.reconnect.map(|b| b.initial);
                tracing::info!(channel = %settings.url, "channel connected");

                let exit = run_channel(
                    ws_stream,
                    &settings,
                    &token,
                    &store,
                    &state,
                    &mut shutdown_rx,
                    &mut outbound_rx,
                )
                .await;
                if exit == ChannelExit::Shutdown {
                    break;
                }
                tracing::warn!(channel = %settings.url, "channel lost");
            }
            Ok(Err(e)) => {
                tracing::warn!(channel = %settings.url, error = %e, "channel connection failed");
            }
            Err(_) => {
                tracing::warn!(
                    channel = %settings.url,
                    timeout_ms = settings.connect_timeout.as_millis() as u64,
                    "channel connection timed out"
                );
            }
        }
        state.send_replace(ChannelState::Closed);

        let (Some(policy), Some(delay)) = (settings.reconnect, backoff) else {
            break;
        };
        let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
        let wait = delay + Duration::from_millis(jitter);
        tracing::debug!(wait_ms = wait.as_millis() as u64, "reconnecting after backoff");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown_rx.changed() => break,
        }
        backoff = Some((delay * 2).min(policy.max));
    }

    state.send_replace(ChannelState::Closed);
}

async fn run_channel(
    ws_stream: WsStream,
    settings: &ChannelSettings,
    token: &str,
    store: &FleetStore,
    state: &watch::Sender<ChannelState>,
    shutdown_rx: &mut watch::Receiver<bool>,
    outbound_rx: &mut mpsc::Receiver<String>,
) -> ChannelExit {
    let (mut sink, mut stream) = ws_stream.split();

    // The handshake must be the first frame on the wire.
    let handshake = Handshake {
        role: &settings.role,
        id: token,
    };
    let handshake = match serde_json::to_string(&handshake) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode handshake");
            return ChannelExit::Lost;
        }
    };
    if let Err(e) = sink.send(Message::Text(handshake.into())).await {
        tracing::warn!(error = %e, "failed to send handshake");
        return ChannelExit::Lost;
    }
    state.send_replace(ChannelState::Open);

    let mut probe = tokio::time::interval(settings.probe_interval);
    probe.tick().await; // Skip the first immediate tick.

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_frame(store, text.as_str()),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => handle_frame(store, text),
                        Err(_) => tracing::warn!(len = data.len(), "discarding non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            return ChannelExit::Lost;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(?frame, "backend closed channel");
                        return ChannelExit::Lost;
                    }
                    None => return ChannelExit::Lost,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "channel read failed");
                        return ChannelExit::Lost;
                    }
                }
            }
            _ = probe.tick() => {
                if *state.borrow() != ChannelState::Open {
                    continue;
                }
                let ping = match serde_json::to_string(&ControlFrame::ping_now()) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode ping");
                        continue;
                    }
                };
                if sink.send(Message::Text(ping.into())).await.is_err() {
                    return ChannelExit::Lost;
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(text) = outbound else {
                    let _ = sink.send(Message::Close(None)).await;
                    return ChannelExit::Shutdown;
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    return ChannelExit::Lost;
                }
            }
            _ = shutdown_rx.changed() => {
                // Flush what the operator already queued, then say goodbye.
                while let Ok(text) = outbound_rx.try_recv() {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        return ChannelExit::Shutdown;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                return ChannelExit::Shutdown;
            }
        }
    }
}

fn handle_frame(store: &FleetStore, text: &str) {
    match decode_frame(text) {
        Some(InboundEvent::Heartbeat) => tracing::trace!("pong"),
        Some(event) => {
            if let Some(event) = event.into_fleet_event() {
                store.apply(event);
            }
        }
        None => {}
    }
}
