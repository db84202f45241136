//! Protocol client seam
//!
//! The WhatsApp Web protocol (pairing handshake, credential storage, framing,
//! transport) lives in an external library. The controller only needs the
//! small capability surface defined here: open a session, receive its events,
//! check registration, send text and end the session.

use super::state::{CloseReason, Identity};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failures reported by the protocol library.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The network or socket failed while carrying a request.
    #[error("transport error: {0}")]
    Transport(String),

    /// The library or server rejected the request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session could not be opened or is no longer usable.
    #[error("client unavailable: {0}")]
    Unavailable(String),
}

/// Notifications delivered by an open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A fresh pairing code; supersedes any earlier one.
    Qr(String),
    Opened(Identity),
    Closed(CloseReason),
    /// The library persisted new credentials.
    CredentialsUpdated,
    MessageReceived { from: String, text: String },
}

/// Parameters handed to the library when a session is opened.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Directory holding durable session material.
    pub session_dir: PathBuf,
    /// Browser triple advertised to the phone: (client, browser, version).
    pub browser: [String; 3],
    pub connect_timeout: Duration,
    pub keep_alive_interval: Duration,
    /// Capacity of the per-session event channel.
    pub event_buffer: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            session_dir: PathBuf::from("./session"),
            browser: [
                "WhatsApp API".to_string(),
                "Chrome".to_string(),
                "1.0.0".to_string(),
            ],
            connect_timeout: Duration::from_secs(60),
            keep_alive_interval: Duration::from_secs(10),
            event_buffer: 64,
        }
    }
}

/// A freshly opened session: its command handle and its event stream.
///
/// The stream stays open until the session ends.
pub struct OpenedSession {
    pub handle: Arc<dyn SessionHandle>,
    pub events: mpsc::Receiver<ClientEvent>,
}

/// Entry point into the protocol library.
#[async_trait]
pub trait ProtocolClient: Send + Sync + 'static {
    /// Start a session. Returns once the library acknowledged the start; the
    /// handshake itself continues in the background and reports through
    /// [`OpenedSession::events`].
    async fn open(&self, options: &SessionOptions) -> Result<OpenedSession, ClientError>;
}

/// Commands available on a live session.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    /// Whether `address` belongs to a WhatsApp account.
    async fn check_registered(&self, address: &str) -> Result<bool, ClientError>;

    async fn send_text(&self, address: &str, text: &str) -> Result<(), ClientError>;

    /// Terminate the session. Safe to call more than once.
    async fn end(&self);
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted protocol client for controller and gateway tests.

    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Handle that answers registration checks from its client's set.
    #[derive(Default)]
    pub struct ScriptedHandle {
        pub registered: Arc<Mutex<HashSet<String>>>,
        pub fail_send: AtomicBool,
        pub sent: Mutex<Vec<(String, String)>>,
        pub ended: AtomicBool,
    }

    #[async_trait]
    impl SessionHandle for ScriptedHandle {
        async fn check_registered(&self, address: &str) -> Result<bool, ClientError> {
            Ok(self
                .registered
                .lock()
                .map(|set| set.contains(address))
                .unwrap_or(false))
        }

        async fn send_text(&self, address: &str, text: &str) -> Result<(), ClientError> {
            if self.fail_send.load(Ordering::SeqCst) {
                return Err(ClientError::Transport("socket closed".into()));
            }
            if let Ok(mut sent) = self.sent.lock() {
                sent.push((address.to_string(), text.to_string()));
            }
            Ok(())
        }

        async fn end(&self) {
            self.ended.store(true, Ordering::SeqCst);
        }
    }

    /// Client that hands out [`ScriptedHandle`]s and keeps the event sender of
    /// the most recent session so tests can play the library's part.
    #[derive(Default)]
    pub struct ScriptedClient {
        pub opens: AtomicUsize,
        pub fail_open: AtomicBool,
        pub registered: Arc<Mutex<HashSet<String>>>,
        pub sessions: Mutex<Vec<(Arc<ScriptedHandle>, mpsc::Sender<ClientEvent>)>>,
    }

    impl ScriptedClient {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn register(&self, address: &str) {
            if let Ok(mut set) = self.registered.lock() {
                set.insert(address.to_string());
            }
        }

        pub fn latest(&self) -> Option<(Arc<ScriptedHandle>, mpsc::Sender<ClientEvent>)> {
            self.sessions.lock().ok().and_then(|s| s.last().cloned())
        }

        /// Emit an event on the most recent session.
        pub async fn emit(&self, event: ClientEvent) {
            let (_, tx) = self.latest().expect("no session opened");
            tx.send(event).await.expect("session event channel closed");
        }
    }

    #[async_trait]
    impl ProtocolClient for ScriptedClient {
        async fn open(&self, options: &SessionOptions) -> Result<OpenedSession, ClientError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(ClientError::Unavailable("session store locked".into()));
            }
            let handle = Arc::new(ScriptedHandle {
                registered: self.registered.clone(),
                ..Default::default()
            });
            let (tx, rx) = mpsc::channel(options.event_buffer);
            if let Ok(mut sessions) = self.sessions.lock() {
                sessions.push((handle.clone(), tx));
            }
            Ok(OpenedSession { handle, events: rx })
        }
    }
}
