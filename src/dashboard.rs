//! The read side of the sync layer, and the owner of everything behind it.

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelSettings, ChannelState, ConnectionManager};
use crate::config::{ConfigError, FleetConfig};
use crate::fleet::{FleetSnapshot, FleetStore, LoggedEvent, RosterEntry, StalenessMonitor};
use crate::protocol::OutboundMessage;
use crate::session::{Session, SessionContext};

/// Fleet telemetry synchronisation, as seen by presentation code.
///
/// Owns the fleet store, the connection manager, and the staleness monitor.
/// Consumers only ever get immutable snapshots, so every change goes
/// through the reconciler.
pub struct FleetSync {
    store: FleetStore,
    connection: Arc<ConnectionManager>,
    staleness: StalenessMonitor,
    follower_cancel: CancellationToken,
    follower: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl FleetSync {
    /// Build from config. Must be called from within a tokio runtime.
    pub fn new(config: &FleetConfig) -> Result<Self, ConfigError> {
        let url = config.channel_url()?;
        let settings = ChannelSettings::new(url, &config.channel, &config.reconnect);
        Ok(Self::with_settings(
            settings,
            FleetStore::with_log_capacity(config.event_log.capacity),
            config.staleness.sweep_interval(),
            config.staleness.window(),
        ))
    }

    pub fn with_settings(
        settings: ChannelSettings,
        store: FleetStore,
        sweep_interval: std::time::Duration,
        staleness_window: std::time::Duration,
    ) -> Self {
        let staleness = StalenessMonitor::spawn(store.clone(), sweep_interval, staleness_window);
        let connection = Arc::new(ConnectionManager::new(settings, store.clone()));
        Self {
            store,
            connection,
            staleness,
            follower_cancel: CancellationToken::new(),
            follower: parking_lot::Mutex::new(None),
        }
    }

    /// Current fleet snapshot.
    pub fn snapshot(&self) -> Arc<FleetSnapshot> {
        self.store.snapshot()
    }

    /// Notified after every applied event or staleness demotion.
    pub fn subscribe(&self) -> watch::Receiver<Arc<FleetSnapshot>> {
        self.store.subscribe()
    }

    /// Snapshot changes as a stream, starting with the current one.
    pub fn updates(&self) -> WatchStream<Arc<FleetSnapshot>> {
        WatchStream::new(self.store.subscribe())
    }

    pub fn event_log(&self) -> Vec<LoggedEvent> {
        self.store.event_log()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LoggedEvent> {
        self.store.subscribe_events()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.connection.state()
    }

    pub fn watch_channel_state(&self) -> watch::Receiver<ChannelState> {
        self.connection.watch_state()
    }

    /// Send an operator message. Dropped with a warning if the channel is not open.
    pub fn send(&self, message: impl Into<OutboundMessage>) {
        self.connection.send(message);
    }

    /// Add robots from the backend roster that are not known yet.
    pub fn seed(&self, roster: impl IntoIterator<Item = RosterEntry>) -> usize {
        self.store.seed(roster)
    }

    /// Open a channel for `session` directly, without a session context.
    /// Does nothing after [`FleetSync::shutdown`].
    pub async fn connect(&self, session: &Session) {
        if self.is_shut_down() {
            tracing::warn!("fleet sync is shut down, not opening channel");
            return;
        }
        self.connection.start(session).await;
    }

    pub async fn disconnect(&self) {
        self.connection.stop().await;
    }

    /// Keep the channel in step with `sessions`: a login opens it, a logout
    /// (or the context going away) closes it. Replaces any previous follower.
    /// Does nothing after [`FleetSync::shutdown`].
    pub fn follow(&self, sessions: &SessionContext) {
        if self.is_shut_down() {
            tracing::warn!("fleet sync is shut down, not following sessions");
            return;
        }
        let connection = self.connection.clone();
        let cancel = self.follower_cancel.child_token();
        let mut rx = sessions.subscribe();

        let task = tokio::spawn(async move {
            loop {
                let session = rx.borrow_and_update().clone();
                if session.authenticated {
                    connection.start(&session).await;
                } else {
                    connection.stop().await;
                }
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            tracing::debug!("session context dropped, closing channel");
                            break;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            connection.stop().await;
        });

        if let Some(previous) = self.follower.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stop following sessions, close the channel, and stop the staleness
    /// monitor. Idempotent and terminal: later `follow` and `connect` calls
    /// are ignored.
    pub async fn shutdown(&mut self) {
        self.follower_cancel.cancel();
        let follower = self.follower.lock().take();
        if let Some(task) = follower {
            let _ = task.await;
        }
        self.connection.stop().await;
        self.staleness.stop().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.follower_cancel.is_cancelled()
    }

    /// The underlying store, for callers that apply events themselves.
    pub fn store(&self) -> &FleetStore {
        &self.store
    }
}

impl Drop for FleetSync {
    fn drop(&mut self) {
        self.follower_cancel.cancel();
        if let Some(task) = self.follower.get_mut().take() {
            task.abort();
        }
    }
}
