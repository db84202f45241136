//! WhatsApp Integration
//!
//! Keeps the gateway's view of the WhatsApp Web session: the connection state
//! store, the controller that feeds it from protocol events and operator
//! commands, and the seam to the protocol library.

mod address;
mod client;
mod controller;
mod state;

#[cfg(feature = "whatsapp")]
mod bot;
#[cfg(feature = "whatsapp")]
pub(crate) mod sqlx_store;

pub use address::{Recipient, USER_SERVER};
pub use client::{
    ClientError, ClientEvent, OpenedSession, ProtocolClient, SessionHandle, SessionOptions,
};
pub use controller::{
    ConnectOutcome, ConnectionController, ControllerSettings, DeliveryReceipt, ReconnectPolicy,
};
pub use state::{
    CloseReason, ConnectionEvent, ConnectionState, ConnectionStateStore, Identity, Phase,
    Transition,
};

#[cfg(feature = "whatsapp")]
pub use bot::WhatsAppClient;

#[cfg(test)]
pub(crate) use client::testing;
