//! WhatsApp Web adapter
//!
//! Implements [`ProtocolClient`] on top of `whatsapp-rust`. Each `open` builds a
//! fresh bot over the SQLite session store, runs it in the background and
//! translates its events into [`ClientEvent`]s.

use super::client::{
    ClientError, ClientEvent, OpenedSession, ProtocolClient, SessionHandle, SessionOptions,
};
use super::sqlx_store::SqlxStore;
use super::state::{CloseReason, Identity};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use wacore::store::traits::DeviceStore;
use wacore::types::events::Event;
use wacore_binary::jid::Jid;
use waproto::whatsapp::Message;
use whatsapp_rust::bot::Bot;
use whatsapp_rust::client::Client;
use whatsapp_rust_tokio_transport::TokioWebSocketTransportFactory;
use whatsapp_rust_ureq_http_client::UreqHttpClient;

/// Protocol client backed by `whatsapp-rust`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WhatsAppClient;

impl WhatsAppClient {
    pub fn new() -> Self {
        Self
    }
}

/// Shared between the event callback and the session handle.
#[derive(Default)]
struct Live {
    client: Mutex<Option<Arc<Client>>>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl ProtocolClient for WhatsAppClient {
    async fn open(&self, options: &SessionOptions) -> Result<OpenedSession, ClientError> {
        let store = SqlxStore::open_dir(&options.session_dir)
            .await
            .map_err(|e| ClientError::Unavailable(format!("session store: {e}")))?;

        match store.device_exists().await {
            Ok(true) => tracing::info!("WhatsApp: resuming paired session"),
            Ok(false) => tracing::info!("WhatsApp: no paired session, a QR code will follow"),
            Err(e) => tracing::warn!("WhatsApp: couldn't check device state: {}", e),
        }
        tracing::debug!(
            "WhatsApp: opening session as {:?} (timeout {:?}, keep-alive {:?})",
            options.browser,
            options.connect_timeout,
            options.keep_alive_interval
        );

        let (tx, rx) = mpsc::channel(options.event_buffer.max(1));
        let live = Arc::new(Live::default());

        let callback_tx = tx.clone();
        let callback_live = live.clone();
        let callback_store = store.clone();
        let mut bot = Bot::builder()
            .with_backend(Arc::new(store))
            .with_transport_factory(TokioWebSocketTransportFactory::new())
            .with_http_client(UreqHttpClient::new())
            .on_event(move |event, client| {
                let tx = callback_tx.clone();
                let live = callback_live.clone();
                let store = callback_store.clone();
                async move {
                    if let Some(event) = translate(event, client, &live, &store).await {
                        let _ = tx.send(event).await;
                    }
                }
            })
            .build()
            .await
            .map_err(|e| ClientError::Unavailable(format!("failed to build client: {e}")))?;

        let runner = tokio::spawn(async move {
            let reason = match bot.run().await {
                Ok(handle) => match handle.await {
                    Ok(_) => CloseReason::ConnectionLost,
                    Err(e) => CloseReason::Failed(format!("client task: {e}")),
                },
                Err(e) => CloseReason::Failed(e.to_string()),
            };
            tracing::debug!("WhatsApp: client task finished ({})", reason);
            let _ = tx.send(ClientEvent::Closed(reason)).await;
        });
        *live.runner.lock().await = Some(runner);

        Ok(OpenedSession {
            handle: Arc::new(WhatsAppSession { live }),
            events: rx,
        })
    }
}

async fn translate(
    event: Event,
    client: Arc<Client>,
    live: &Live,
    store: &SqlxStore,
) -> Option<ClientEvent> {
    match event {
        Event::PairingQrCode { code, .. } => Some(ClientEvent::Qr(code)),
        Event::PairSuccess(_) => {
            tracing::info!("WhatsApp: pairing successful");
            Some(ClientEvent::CredentialsUpdated)
        }
        Event::Connected(_) => {
            *live.client.lock().await = Some(client);
            Some(ClientEvent::Opened(identity(store).await))
        }
        Event::LoggedOut(_) => {
            *live.client.lock().await = None;
            // A logged-out device can't be resumed; start the next pairing clean.
            if let Err(e) = store.wipe().await {
                tracing::warn!("WhatsApp: failed to clear session store: {}", e);
            }
            Some(ClientEvent::Closed(CloseReason::LoggedOut))
        }
        Event::Disconnected(_) => {
            *live.client.lock().await = None;
            Some(ClientEvent::Closed(CloseReason::ConnectionLost))
        }
        Event::Message(msg, info) => {
            let text = extract_text(&msg)?;
            let from = info.source.sender.to_string();
            Some(ClientEvent::MessageReceived { from, text })
        }
        other => {
            tracing::debug!("WhatsApp: unhandled event: {:?}", other);
            None
        }
    }
}

/// Identity of the paired account, read back from the stored device record.
async fn identity(store: &SqlxStore) -> Identity {
    match store.load().await {
        Ok(Some(device)) => Identity {
            name: device.push_name.clone(),
            id: device.pn.as_ref().map(|jid| jid.to_string()).unwrap_or_default(),
        },
        Ok(None) => Identity::default(),
        Err(e) => {
            tracing::warn!("WhatsApp: couldn't read device record: {}", e);
            Identity::default()
        }
    }
}

/// Unwrap the wrappers linked devices and disappearing chats put around content.
fn unwrap_message(msg: &Message) -> &Message {
    if let Some(ref dsm) = msg.device_sent_message
        && let Some(ref inner) = dsm.message
    {
        return unwrap_message(inner);
    }
    if let Some(ref eph) = msg.ephemeral_message
        && let Some(ref inner) = eph.message
    {
        return unwrap_message(inner);
    }
    msg
}

fn extract_text(msg: &Message) -> Option<String> {
    let msg = unwrap_message(msg);
    if let Some(ref conv) = msg.conversation
        && !conv.is_empty()
    {
        return Some(conv.clone());
    }
    msg.extended_text_message
        .as_ref()
        .and_then(|ext| ext.text.clone())
}

struct WhatsAppSession {
    live: Arc<Live>,
}

impl WhatsAppSession {
    async fn client(&self) -> Result<Arc<Client>, ClientError> {
        self.live
            .client
            .lock()
            .await
            .clone()
            .ok_or_else(|| ClientError::Unavailable("session is not connected".into()))
    }
}

fn parse_jid(address: &str) -> Result<Jid, ClientError> {
    address
        .parse()
        .map_err(|e| ClientError::Protocol(format!("invalid address {address}: {e}")))
}

#[async_trait]
impl SessionHandle for WhatsAppSession {
    async fn check_registered(&self, address: &str) -> Result<bool, ClientError> {
        let client = self.client().await?;
        let jid = parse_jid(address)?;
        let results = client
            .contacts()
            .is_on_whatsapp(&[jid.user.as_str()])
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(results.iter().any(|r| r.is_registered))
    }

    async fn send_text(&self, address: &str, text: &str) -> Result<(), ClientError> {
        let client = self.client().await?;
        let jid = parse_jid(address)?;
        let message = Message {
            conversation: Some(text.to_string()),
            ..Default::default()
        };
        client
            .send_message(jid, message)
            .await
            .map(|_| ())
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn end(&self) {
        if let Some(client) = self.live.client.lock().await.take() {
            client.disconnect().await;
        }
        if let Some(runner) = self.live.runner.lock().await.take() {
            runner.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_plain_conversation() {
        let msg = Message {
            conversation: Some("hello".into()),
            ..Default::default()
        };
        assert_eq!(extract_text(&msg).as_deref(), Some("hello"));
    }

    #[test]
    fn test_empty_message_has_no_text() {
        assert!(extract_text(&Message::default()).is_none());
    }

    #[test]
    fn test_parse_jid_full_address() {
        assert!(parse_jid("5511999999999@s.whatsapp.net").is_ok());
    }
}
