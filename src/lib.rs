//! whatsgate - HTTP gateway for a WhatsApp Web session
//!
//! Pairs a single WhatsApp account by QR code and exposes a few JSON
//! endpoints to check the connection and send text messages.
//!
//! ## Quick Start
//!
//! ```bash
//! # Start the gateway on 0.0.0.0:10000
//! whatsgate serve
//!
//! # Then, from another shell
//! curl localhost:10000/connect
//! open http://localhost:10000/qr
//! curl -X POST localhost:10000/send \
//!      -H 'content-type: application/json' \
//!      -d '{"number": "5511999999999", "message": "hi"}'
//! ```

pub mod channels;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod utils;

// Re-export commonly used types
pub use error::{ErrorCode, GatewayError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
