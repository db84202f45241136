//! Channel Integrations
//!
//! Messaging channels bridged by the gateway. WhatsApp is the only one; the
//! protocol adapter itself is compiled in with the `whatsapp` feature.

pub mod whatsapp;
