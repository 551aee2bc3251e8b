use std::sync::Arc;
use tokio::sync::watch;

/// The operator's authenticated identity.
///
/// The token is opaque: it is handed to the backend as the channel's
/// `session_id` and in the handshake, and never interpreted locally.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub authenticated: bool,
    pub token: String,
}

impl Session {
    pub fn authenticated(token: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            token: token.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("authenticated", &self.authenticated)
            .field("token", &if self.token.is_empty() { "" } else { "<redacted>" })
            .finish()
    }
}

/// Holds the current session and tells observers when it changes.
///
/// Cloning shares the same underlying session.
#[derive(Clone)]
pub struct SessionContext {
    tx: Arc<watch::Sender<Session>>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    /// Start with no session.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Session::anonymous());
        Self { tx: Arc::new(tx) }
    }

    /// Record a successful login. Observers are only notified if the
    /// session actually changed.
    pub fn login(&self, token: impl Into<String>) {
        let session = Session::authenticated(token);
        self.tx.send_if_modified(|current| {
            if *current == session {
                return false;
            }
            *current = session;
            true
        });
    }

    /// Drop the session, e.g. on logout or when the backend rejects it.
    pub fn logout(&self) {
        self.tx.send_if_modified(|current| {
            if !current.authenticated && current.token.is_empty() {
                return false;
            }
            *current = Session::anonymous();
            true
        });
    }

    pub fn current(&self) -> Session {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.tx.subscribe()
    }
}
