//! Error taxonomy
//!
//! Every failure a caller of the gateway can observe maps to one
//! [`GatewayError`] variant with a stable [`ErrorCode`]. None of them are
//! fatal to the process.

use crate::channels::whatsapp::ClientError;
use serde::Serialize;
use thiserror::Error;

/// Stable machine-readable error codes surfaced in HTTP responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    NotConnected,
    InvalidInput,
    RecipientNotFound,
    DeliveryFailed,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotConnected => "NotConnected",
            Self::InvalidInput => "InvalidInput",
            Self::RecipientNotFound => "RecipientNotFound",
            Self::DeliveryFailed => "DeliveryFailed",
            Self::InternalError => "InternalError",
        }
    }

    /// HTTP status code used when this error reaches the gateway.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotConnected | Self::InvalidInput | Self::RecipientNotFound => 400,
            Self::DeliveryFailed | Self::InternalError => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("WhatsApp is not connected. Use /connect first.")]
    NotConnected,

    #[error("{0}")]
    InvalidInput(String),

    #[error("Number not found on WhatsApp: {0}")]
    RecipientNotFound(String),

    #[error("Failed to deliver message: {0}")]
    DeliveryFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotConnected => ErrorCode::NotConnected,
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::RecipientNotFound(_) => ErrorCode::RecipientNotFound,
            Self::DeliveryFailed(_) => ErrorCode::DeliveryFailed,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

impl From<ClientError> for GatewayError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Transport(msg) => Self::DeliveryFailed(msg),
            ClientError::Protocol(msg) | ClientError::Unavailable(msg) => Self::Internal(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
