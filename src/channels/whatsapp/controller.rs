//! Connection Controller
//!
//! Bridges the protocol library's asynchronous events and the operator's
//! commands into the [`ConnectionStateStore`].
//!
//! Every state change travels through one bounded queue drained by a single
//! consumer task, which is the only caller of `transition`. Events are applied
//! strictly in arrival order, so a `Closed` reported by the transport always
//! lands before a `connect` that was queued after it.
//!
//! Each accepted connect and each restart starts a new session generation.
//! Events pumped from an older generation are dropped, which keeps a torn-down
//! session from resurrecting state after a restart.

use super::address::Recipient;
use super::client::{ClientEvent, OpenedSession, ProtocolClient, SessionHandle, SessionOptions};
use super::state::{
    CloseReason, ConnectionEvent, ConnectionState, ConnectionStateStore, Phase, Transition,
};
use crate::error::{GatewayError, Result};
use crate::utils::preview;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

/// What the controller does after the transport drops a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Stay disconnected until an explicit `connect()`.
    Manual,
    /// Issue one `connect()` after the delay, unless something else moved the
    /// connection on in the meantime.
    AfterDelay(Duration),
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub session: SessionOptions,
    /// Capacity of the event/command queue.
    pub queue_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            queue_capacity: 64,
            reconnect: ReconnectPolicy::Manual,
        }
    }
}

/// Result of a `connect()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectOutcome {
    /// A new session is being opened.
    Started,
    AlreadyConnecting,
    AlreadyConnected,
}

/// Acknowledgement of a delivered message.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub to: String,
    pub delivered_at: DateTime<Utc>,
}

struct Envelope {
    event: ConnectionEvent,
    /// Session generation that produced the event; `None` for operator commands.
    generation: Option<u64>,
    reply: Option<oneshot::Sender<Applied>>,
}

struct Applied {
    transition: Transition,
    generation: u64,
}

struct ActiveSession {
    generation: u64,
    handle: Arc<dyn SessionHandle>,
    pump: JoinHandle<()>,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

struct Inner {
    store: Arc<ConnectionStateStore>,
    client: Arc<dyn ProtocolClient>,
    settings: ControllerSettings,
    queue: mpsc::Sender<Envelope>,
    generation: AtomicU64,
    session: Mutex<Option<ActiveSession>>,
}

/// Cloneable handle to the controller; all clones share one session.
#[derive(Clone)]
pub struct ConnectionController {
    inner: Arc<Inner>,
}

impl ConnectionController {
    /// Create the controller and spawn its event loop on the current runtime.
    pub fn new(
        store: Arc<ConnectionStateStore>,
        client: Arc<dyn ProtocolClient>,
        settings: ControllerSettings,
    ) -> Self {
        let (queue, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let inner = Arc::new(Inner {
            store,
            client,
            settings,
            queue,
            generation: AtomicU64::new(0),
            session: Mutex::new(None),
        });
        tokio::spawn(run_event_loop(rx, Arc::downgrade(&inner)));
        Self { inner }
    }

    pub fn store(&self) -> &Arc<ConnectionStateStore> {
        &self.inner.store
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.store.read()
    }

    /// Start a session unless one is already in flight or open.
    ///
    /// Returns once the library acknowledged the session start; pairing and
    /// login continue in the background.
    pub async fn connect(&self) -> Result<ConnectOutcome> {
        let applied = self.submit(ConnectionEvent::ConnectRequested, None).await?;
        if !applied.transition.applied {
            let outcome = match applied.transition.state.phase {
                Phase::Connected => ConnectOutcome::AlreadyConnected,
                _ => ConnectOutcome::AlreadyConnecting,
            };
            tracing::info!("WhatsApp: connect ignored ({:?})", outcome);
            return Ok(outcome);
        }

        let generation = applied.generation;
        tracing::info!("WhatsApp: starting session (generation {})", generation);

        match self.inner.client.open(&self.inner.settings.session).await {
            Ok(opened) => {
                self.install(generation, opened).await;
                Ok(ConnectOutcome::Started)
            }
            Err(e) => {
                tracing::error!("WhatsApp: failed to open session: {}", e);
                let reason = CloseReason::Failed(e.to_string());
                self.submit(ConnectionEvent::Closed(reason), Some(generation))
                    .await?;
                Err(GatewayError::Internal(e.to_string()))
            }
        }
    }

    /// Drop whatever session exists and return to `Disconnected`.
    pub async fn restart(&self) -> Result<ConnectionState> {
        tracing::info!("WhatsApp: restarting connection");
        let applied = self.submit(ConnectionEvent::RestartRequested, None).await?;

        // A connect queued behind the restart may already own the slot.
        let restarted = applied.generation;
        self.inner
            .end_session_where(|generation| generation < restarted)
            .await;
        Ok(applied.transition.state)
    }

    /// Send a text message to a registered account.
    pub async fn send(&self, recipient: &Recipient, text: &str) -> Result<DeliveryReceipt> {
        if !self.inner.store.read().is_connected() {
            return Err(GatewayError::NotConnected);
        }
        let handle = self
            .current_handle()
            .await
            .ok_or(GatewayError::NotConnected)?;

        let registered = handle
            .check_registered(recipient.address())
            .await
            .map_err(|e| GatewayError::Internal(format!("registration check failed: {e}")))?;
        if !registered {
            return Err(GatewayError::RecipientNotFound(recipient.number().to_string()));
        }

        handle
            .send_text(recipient.address(), text)
            .await
            .map_err(|e| GatewayError::DeliveryFailed(e.to_string()))?;

        tracing::info!(
            "WhatsApp: message sent to {}: {}",
            recipient,
            preview(text, 50)
        );
        Ok(DeliveryReceipt {
            to: recipient.number().to_string(),
            delivered_at: Utc::now(),
        })
    }

    /// End the live session, if any. Used on process shutdown.
    pub async fn shutdown(&self) {
        let session = self.inner.session.lock().await.take();
        if let Some(session) = session {
            tracing::info!("WhatsApp: closing session");
            session.handle.end().await;
        }
    }

    async fn current_handle(&self) -> Option<Arc<dyn SessionHandle>> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.handle.clone())
    }

    async fn submit(&self, event: ConnectionEvent, generation: Option<u64>) -> Result<Applied> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .queue
            .send(Envelope {
                event,
                generation,
                reply: Some(reply),
            })
            .await
            .map_err(|_| GatewayError::Internal("connection event loop stopped".into()))?;
        rx.await
            .map_err(|_| GatewayError::Internal("connection event loop dropped a reply".into()))
    }

    /// Park a freshly opened session in the slot and start pumping its events.
    async fn install(&self, generation: u64, opened: OpenedSession) {
        let OpenedSession { handle, events } = opened;

        let mut slot = self.inner.session.lock().await;
        if self.inner.generation.load(Ordering::Acquire) != generation {
            drop(slot);
            tracing::info!("WhatsApp: session {} superseded before it was installed", generation);
            handle.end().await;
            return;
        }

        let pump = tokio::spawn(pump_events(events, self.inner.queue.clone(), generation));
        let previous = slot.replace(ActiveSession {
            generation,
            handle,
            pump,
        });
        drop(slot);

        if let Some(previous) = previous {
            tracing::debug!("WhatsApp: ending leftover session {}", previous.generation);
            previous.handle.end().await;
        }
    }
}

impl Inner {
    fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        let Envelope {
            event,
            generation,
            reply,
        } = envelope;
        let current = self.generation.load(Ordering::Acquire);

        if let Some(stale) = generation
            && stale != current
        {
            tracing::debug!(
                "WhatsApp: dropping '{}' event from session {} (current {})",
                event.kind(),
                stale,
                current
            );
            if let Some(reply) = reply {
                let transition = Transition {
                    state: self.store.read(),
                    applied: false,
                };
                let _ = reply.send(Applied {
                    transition,
                    generation: current,
                });
            }
            return;
        }

        let transition = self.store.transition(&event);
        let mut generation = current;

        if transition.applied {
            tracing::debug!(
                "WhatsApp: '{}' applied, phase is now {}",
                event.kind(),
                transition.state.phase
            );
            match event {
                ConnectionEvent::ConnectRequested | ConnectionEvent::RestartRequested => {
                    generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                }
                ConnectionEvent::Closed(reason) => self.on_closed(current, reason),
                _ => {}
            }
        } else if event != ConnectionEvent::ConnectRequested {
            tracing::warn!(
                "WhatsApp: ignoring '{}' event in phase {}",
                event.kind(),
                transition.state.phase
            );
        }

        if let Some(reply) = reply {
            let _ = reply.send(Applied {
                transition,
                generation,
            });
        }
    }

    fn on_closed(self: &Arc<Self>, generation: u64, reason: CloseReason) {
        if reason.is_logged_out() {
            tracing::warn!("WhatsApp: logged out. Use /connect to pair again");
        } else {
            tracing::warn!("WhatsApp: connection closed ({}). Use /connect to reconnect", reason);
        }

        let inner = self.clone();
        tokio::spawn(async move {
            inner.teardown(generation).await;

            let ReconnectPolicy::AfterDelay(delay) = inner.settings.reconnect else {
                return;
            };
            if !reason.is_recoverable() {
                return;
            }

            tokio::time::sleep(delay).await;
            if inner.generation.load(Ordering::Acquire) != generation {
                return;
            }
            tracing::info!("WhatsApp: reconnecting after {:?}", delay);
            let controller = ConnectionController { inner };
            if let Err(e) = controller.connect().await {
                tracing::error!("WhatsApp: reconnect failed: {}", e);
            }
        });
    }

    /// End the session of `generation` if it still occupies the slot.
    async fn teardown(&self, generation: u64) {
        self.end_session_where(|active| active == generation).await;
    }

    async fn end_session_where<F>(&self, owned: F)
    where
        F: FnOnce(u64) -> bool,
    {
        let session = {
            let mut slot = self.session.lock().await;
            match slot.as_ref() {
                Some(active) if owned(active.generation) => slot.take(),
                _ => None,
            }
        };
        if let Some(session) = session {
            tracing::debug!("WhatsApp: ending session {}", session.generation);
            session.handle.end().await;
        }
    }
}

async fn run_event_loop(mut rx: mpsc::Receiver<Envelope>, inner: Weak<Inner>) {
    while let Some(envelope) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.dispatch(envelope);
    }
    tracing::debug!("WhatsApp: connection event loop stopped");
}

/// Forward one session's library events into the controller queue.
async fn pump_events(
    mut events: mpsc::Receiver<ClientEvent>,
    queue: mpsc::Sender<Envelope>,
    generation: u64,
) {
    let mut closed = false;

    while let Some(event) = events.recv().await {
        let event = match event {
            ClientEvent::Qr(code) => {
                tracing::info!("WhatsApp: QR code generated, open /qr to scan it");
                ConnectionEvent::QrIssued(code)
            }
            ClientEvent::Opened(identity) => {
                tracing::info!(
                    "WhatsApp: connected as {} ({})",
                    identity.name,
                    identity.id
                );
                ConnectionEvent::Opened(identity)
            }
            ClientEvent::Closed(reason) => {
                closed = true;
                ConnectionEvent::Closed(reason)
            }
            ClientEvent::CredentialsUpdated => {
                tracing::debug!("WhatsApp: credentials updated");
                continue;
            }
            ClientEvent::MessageReceived { from, text } => {
                tracing::info!("WhatsApp: message from {}: {}", from, preview(&text, 100));
                continue;
            }
        };

        let envelope = Envelope {
            event,
            generation: Some(generation),
            reply: None,
        };
        if queue.send(envelope).await.is_err() {
            return;
        }
    }

    if !closed {
        let envelope = Envelope {
            event: ConnectionEvent::Closed(CloseReason::ConnectionLost),
            generation: Some(generation),
            reply: None,
        };
        let _ = queue.send(envelope).await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::client::testing::ScriptedClient;
    use super::super::client::{ClientError, SessionHandle};
    use super::super::state::Identity;
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;

    fn alice() -> Identity {
        Identity {
            name: "Alice".to_string(),
            id: "551199@s".to_string(),
        }
    }

    fn controller_with(client: Arc<dyn ProtocolClient>, reconnect: ReconnectPolicy) -> ConnectionController {
        let settings = ControllerSettings {
            reconnect,
            ..Default::default()
        };
        ConnectionController::new(Arc::new(ConnectionStateStore::new()), client, settings)
    }

    fn controller(client: Arc<ScriptedClient>) -> ConnectionController {
        controller_with(client, ReconnectPolicy::Manual)
    }

    async fn wait_until<F>(controller: &ConnectionController, pred: F) -> ConnectionState
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut rx = controller.store().subscribe();
        let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(pred))
            .await
            .expect("timed out waiting for state")
            .expect("store dropped")
            .clone();
        state
    }

    async fn connected(client: &Arc<ScriptedClient>) -> ConnectionController {
        let controller = controller(client.clone());
        controller.connect().await.unwrap();
        client.emit(ClientEvent::Opened(alice())).await;
        wait_until(&controller, |s| s.phase == Phase::Connected).await;
        controller
    }

    #[tokio::test]
    async fn test_connect_qr_open_scenario() {
        let client = ScriptedClient::new();
        let controller = controller(client.clone());

        assert_eq!(controller.connect().await.unwrap(), ConnectOutcome::Started);
        assert_eq!(controller.state().phase, Phase::Connecting);

        client.emit(ClientEvent::Qr("abc".into())).await;
        let state = wait_until(&controller, |s| s.pending_qr.is_some()).await;
        assert_eq!(state.phase, Phase::Connecting);
        assert_eq!(state.pending_qr.as_deref(), Some("abc"));

        client.emit(ClientEvent::Opened(alice())).await;
        let state = wait_until(&controller, |s| s.phase == Phase::Connected).await;
        assert_eq!(state.identity.unwrap().name, "Alice");
        assert!(state.pending_qr.is_none());
    }

    #[tokio::test]
    async fn test_connect_while_connecting_is_noop() {
        let client = ScriptedClient::new();
        let controller = controller(client.clone());
        controller.connect().await.unwrap();
        let before = controller.state();

        let outcome = controller.connect().await.unwrap();
        assert_eq!(outcome, ConnectOutcome::AlreadyConnecting);
        assert_eq!(controller.state(), before);
        assert_eq!(client.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_while_connected_reports_connected() {
        let client = ScriptedClient::new();
        let controller = connected(&client).await;
        assert_eq!(
            controller.connect().await.unwrap(),
            ConnectOutcome::AlreadyConnected
        );
        assert_eq!(client.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_connects_open_once() {
        let client = ScriptedClient::new();
        let controller = controller(client.clone());

        let (a, b) = tokio::join!(controller.connect(), controller.connect());
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| *o != ConnectOutcome::Started);
        assert_eq!(
            outcomes,
            vec![ConnectOutcome::Started, ConnectOutcome::AlreadyConnecting]
        );
        assert_eq!(client.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_failure_returns_to_disconnected() {
        let client = ScriptedClient::new();
        client.fail_open.store(true, Ordering::SeqCst);
        let controller = controller(client.clone());

        let err = controller.connect().await.unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
        assert_eq!(controller.state().phase, Phase::Disconnected);

        client.fail_open.store(false, Ordering::SeqCst);
        assert_eq!(controller.connect().await.unwrap(), ConnectOutcome::Started);
    }

    #[tokio::test]
    async fn test_logged_out_then_connect() {
        let client = ScriptedClient::new();
        let controller = connected(&client).await;
        let (first, _) = client.latest().unwrap();

        client.emit(ClientEvent::Closed(CloseReason::LoggedOut)).await;
        let state = wait_until(&controller, |s| s.phase == Phase::LoggedOut).await;
        assert!(state.pending_qr.is_none());
        assert!(state.identity.is_none());

        assert_eq!(controller.connect().await.unwrap(), ConnectOutcome::Started);
        assert_eq!(controller.state().phase, Phase::Connecting);

        // the logged-out session was torn down
        tokio::time::timeout(Duration::from_secs(2), async {
            while !first.ended.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_restart_ends_session_and_clears_state() {
        let client = ScriptedClient::new();
        let controller = connected(&client).await;
        let (handle, _) = client.latest().unwrap();

        let state = controller.restart().await.unwrap();
        assert_eq!(state.phase, Phase::Disconnected);
        assert!(state.identity.is_none());
        assert!(handle.ended.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_restart_from_disconnected_succeeds() {
        let controller = controller(ScriptedClient::new());
        let state = controller.restart().await.unwrap();
        assert_eq!(state.phase, Phase::Disconnected);
    }

    #[tokio::test]
    async fn test_events_from_old_session_are_dropped() {
        let client = ScriptedClient::new();
        let controller = controller(client.clone());
        controller.connect().await.unwrap();
        let (_, old_tx) = client.latest().unwrap();

        controller.restart().await.unwrap();
        controller.connect().await.unwrap();

        // pump of the old session was aborted or its events are stale
        let _ = old_tx.send(ClientEvent::Opened(alice())).await;
        client.emit(ClientEvent::Qr("fresh".into())).await;
        let state = wait_until(&controller, |s| s.pending_qr.is_some()).await;
        assert_eq!(state.phase, Phase::Connecting);
        assert_eq!(state.pending_qr.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_event_stream_end_means_disconnected() {
        let client = ScriptedClient::new();
        let controller = connected(&client).await;
        client.sessions.lock().unwrap().clear();

        let state = wait_until(&controller, |s| s.phase == Phase::Disconnected).await;
        assert!(state.identity.is_none());
    }

    #[tokio::test]
    async fn test_send_delivers_to_registered_number() {
        let client = ScriptedClient::new();
        client.register("5511999999999@s.whatsapp.net");
        let controller = connected(&client).await;

        let recipient = Recipient::parse("5511999999999").unwrap();
        let receipt = controller.send(&recipient, "hi").await.unwrap();
        assert_eq!(receipt.to, "5511999999999");

        let (handle, _) = client.latest().unwrap();
        let sent = handle.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![("5511999999999@s.whatsapp.net".to_string(), "hi".to_string())]
        );
    }

    #[tokio::test]
    async fn test_send_unregistered_number() {
        let client = ScriptedClient::new();
        let controller = connected(&client).await;

        let recipient = Recipient::parse("5511999999999").unwrap();
        let err = controller.send(&recipient, "hi").await.unwrap_err();
        assert!(matches!(err, GatewayError::RecipientNotFound(_)));
    }

    #[tokio::test]
    async fn test_send_transport_failure() {
        let client = ScriptedClient::new();
        client.register("5511999999999@s.whatsapp.net");
        let controller = connected(&client).await;
        let (handle, _) = client.latest().unwrap();
        handle.fail_send.store(true, Ordering::SeqCst);

        let recipient = Recipient::parse("5511999999999").unwrap();
        let err = controller.send(&recipient, "hi").await.unwrap_err();
        assert!(matches!(err, GatewayError::DeliveryFailed(_)));
    }

    #[tokio::test]
    async fn test_auto_reconnect_after_connection_lost() {
        let client = ScriptedClient::new();
        let controller = controller_with(
            client.clone(),
            ReconnectPolicy::AfterDelay(Duration::from_millis(10)),
        );
        controller.connect().await.unwrap();
        client.emit(ClientEvent::Opened(alice())).await;
        wait_until(&controller, |s| s.phase == Phase::Connected).await;

        client
            .emit(ClientEvent::Closed(CloseReason::ConnectionLost))
            .await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while client.opens.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(controller.state().phase, Phase::Connecting);
    }

    #[tokio::test]
    async fn test_no_auto_reconnect_after_logout() {
        let client = ScriptedClient::new();
        let controller = controller_with(
            client.clone(),
            ReconnectPolicy::AfterDelay(Duration::from_millis(10)),
        );
        controller.connect().await.unwrap();
        client.emit(ClientEvent::Closed(CloseReason::LoggedOut)).await;
        wait_until(&controller, |s| s.phase == Phase::LoggedOut).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.opens.load(Ordering::SeqCst), 1);
        assert_eq!(controller.state().phase, Phase::LoggedOut);
    }

    mockall::mock! {
        pub Handle {}

        #[async_trait]
        impl SessionHandle for Handle {
            async fn check_registered(&self, address: &str) -> std::result::Result<bool, ClientError>;
            async fn send_text(&self, address: &str, text: &str) -> std::result::Result<(), ClientError>;
            async fn end(&self);
        }
    }

    struct FixedClient {
        handle: Arc<MockHandle>,
        events: std::sync::Mutex<Option<mpsc::Receiver<ClientEvent>>>,
    }

    #[async_trait]
    impl ProtocolClient for FixedClient {
        async fn open(&self, _options: &SessionOptions) -> std::result::Result<OpenedSession, ClientError> {
            let events = self
                .events
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| ClientError::Unavailable("already opened".into()))?;
            Ok(OpenedSession {
                handle: self.handle.clone(),
                events,
            })
        }
    }

    #[tokio::test]
    async fn test_send_outside_connected_never_touches_client() {
        let mut handle = MockHandle::new();
        handle.expect_check_registered().never();
        handle.expect_send_text().never();
        handle.expect_end().times(1).return_const(());

        let (_tx, rx) = mpsc::channel(8);
        let client = Arc::new(FixedClient {
            handle: Arc::new(handle),
            events: std::sync::Mutex::new(Some(rx)),
        });
        let controller = controller_with(client, ReconnectPolicy::Manual);
        let recipient = Recipient::parse("5511999999999").unwrap();

        // Disconnected
        let err = controller.send(&recipient, "hi").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotConnected));

        // Connecting
        controller.connect().await.unwrap();
        let err = controller.send(&recipient, "hi").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotConnected));

        // Disconnected again after restart
        controller.restart().await.unwrap();
        let err = controller.send(&recipient, "hi").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotConnected));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_restart_racing_connect_keeps_new_session() {
        for _ in 0..200 {
            let client = ScriptedClient::new();
            let controller = connected(&client).await;

            let restart = tokio::spawn({
                let controller = controller.clone();
                async move { controller.restart().await }
            });
            let connect = tokio::spawn({
                let controller = controller.clone();
                async move { controller.connect().await }
            });
            restart.await.unwrap().unwrap();
            connect.await.unwrap().unwrap();

            if controller.state().phase == Phase::Connecting {
                let (handle, _) = client.latest().unwrap();
                assert!(!handle.ended.load(Ordering::SeqCst));
                assert!(controller.current_handle().await.is_some());
            }
        }
    }

    #[tokio::test]
    async fn test_restart_ends_only_older_sessions() {
        let client = ScriptedClient::new();
        let controller = connected(&client).await;
        let (first, _) = client.latest().unwrap();

        controller.restart().await.unwrap();
        assert!(first.ended.load(Ordering::SeqCst));

        controller.connect().await.unwrap();
        let (second, _) = client.latest().unwrap();
        let current = controller.inner.generation.load(Ordering::Acquire);
        controller
            .inner
            .end_session_where(|generation| generation < current)
            .await;
        assert!(!second.ended.load(Ordering::SeqCst));
        assert!(controller.current_handle().await.is_some());
    }

    #[tokio::test]
    async fn test_failed_registration_check_is_internal() {
        let mut handle = MockHandle::new();
        handle
            .expect_check_registered()
            .times(1)
            .returning(|_| Err(ClientError::Protocol("usync timeout".into())));
        handle.expect_send_text().never();
        handle.expect_end().return_const(());

        let (tx, rx) = mpsc::channel(8);
        let client = Arc::new(FixedClient {
            handle: Arc::new(handle),
            events: std::sync::Mutex::new(Some(rx)),
        });
        let controller = controller_with(client, ReconnectPolicy::Manual);
        controller.connect().await.unwrap();
        tx.send(ClientEvent::Opened(alice())).await.unwrap();
        wait_until(&controller, |s| s.phase == Phase::Connected).await;

        let recipient = Recipient::parse("5511999999999").unwrap();
        let err = controller.send(&recipient, "hi").await.unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
    }
}
