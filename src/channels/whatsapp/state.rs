//! Connection state store
//!
//! Holds the single [`ConnectionState`] of a running gateway. Reads are cheap
//! snapshots; every mutation goes through [`ConnectionStateStore::transition`],
//! which applies one [`ConnectionEvent`] under the watch channel's write lock
//! so no reader ever sees a half-updated combination of fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Discrete connection status of the bridged session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    LoggedOut,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::LoggedOut => "LoggedOut",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The paired account, known once the session is open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Display (push) name of the account
    pub name: String,
    /// Canonical address, e.g. `5511999999999@s.whatsapp.net`
    pub id: String,
}

/// Why a protocol session closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// The account unlinked this device; stored credentials are void.
    LoggedOut,
    /// The transport dropped.
    ConnectionLost,
    /// Another client took over the session.
    Replaced,
    /// The session could not be opened or failed for another reason.
    Failed(String),
}

impl CloseReason {
    pub fn is_logged_out(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }

    /// Whether opening a new session may succeed without operator action.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ConnectionLost)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoggedOut => f.write_str("logged out"),
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::Replaced => f.write_str("replaced by another session"),
            Self::Failed(detail) => write!(f, "failed: {}", detail),
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectRequested,
    QrIssued(String),
    Opened(Identity),
    Closed(CloseReason),
    RestartRequested,
}

impl ConnectionEvent {
    /// Short name for log lines (QR payloads and identities stay out of logs).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectRequested => "connect",
            Self::QrIssued(_) => "qr",
            Self::Opened(_) => "opened",
            Self::Closed(_) => "closed",
            Self::RestartRequested => "restart",
        }
    }
}

/// Snapshot of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: Phase,
    pub pending_qr: Option<String>,
    pub identity: Option<Identity>,
    pub last_transition_at: DateTime<Utc>,
}

impl ConnectionState {
    fn initial() -> Self {
        Self {
            phase: Phase::Disconnected,
            pending_qr: None,
            identity: None,
            last_transition_at: Utc::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }

    fn enter(&mut self, phase: Phase, now: DateTime<Utc>) {
        self.phase = phase;
        self.pending_qr = None;
        self.identity = None;
        self.last_transition_at = now;
    }

    /// Apply `event` in place. Returns false when the event does not apply to
    /// the current phase, in which case nothing was touched.
    fn apply(&mut self, event: &ConnectionEvent, now: DateTime<Utc>) -> bool {
        use ConnectionEvent as E;
        use Phase as P;

        match (self.phase, event) {
            (P::Disconnected | P::LoggedOut, E::ConnectRequested) => {
                self.enter(P::Connecting, now);
                true
            }
            (P::Connecting, E::QrIssued(payload)) => {
                self.pending_qr = Some(payload.clone());
                true
            }
            (P::Connecting, E::Opened(identity)) => {
                self.enter(P::Connected, now);
                self.identity = Some(identity.clone());
                true
            }
            (P::Connecting | P::Connected, E::Closed(reason)) => {
                let next = if reason.is_logged_out() {
                    P::LoggedOut
                } else {
                    P::Disconnected
                };
                self.enter(next, now);
                true
            }
            (_, E::RestartRequested) => {
                self.enter(P::Disconnected, now);
                true
            }
            _ => false,
        }
    }
}

/// Result of one [`ConnectionStateStore::transition`] call.
#[derive(Debug, Clone)]
pub struct Transition {
    pub state: ConnectionState,
    pub applied: bool,
}

/// Owner of the process-wide connection state.
pub struct ConnectionStateStore {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::initial());
        Self { tx }
    }

    /// Latest committed snapshot.
    pub fn read(&self) -> ConnectionState {
        self.tx.borrow().clone()
    }

    /// Apply one event atomically and return the resulting snapshot.
    pub fn transition(&self, event: &ConnectionEvent) -> Transition {
        let now = Utc::now();
        let mut applied = false;
        self.tx.send_if_modified(|state| {
            applied = state.apply(event, now);
            applied
        });
        Transition {
            state: self.read(),
            applied,
        }
    }

    /// Receiver notified after every applied transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}
