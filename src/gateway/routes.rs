//! Gateway HTTP routes
//!
//! Handlers read the connection state store for queries and go through the
//! controller for commands. They never keep a session handle between calls.

use axum::{
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AppState;
use super::pages;
use crate::channels::whatsapp::{ConnectOutcome, Identity, Phase, Recipient};
use crate::error::{ErrorCode, GatewayError};
use crate::utils::preview;

/// Characters of the message echoed back by `/send`.
const PREVIEW_CHARS: usize = 100;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    accepted: bool,
    error: ErrorCode,
    message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let code = self.code();
        let status =
            StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected ({}): {}", code, self);
        }
        let body = ErrorBody {
            accepted: false,
            error: code,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Endpoint listing for the index route.
#[derive(Serialize)]
pub struct Endpoints {
    pub connect: &'static str,
    pub qr: &'static str,
    pub send: &'static str,
    pub status: &'static str,
    pub restart: &'static str,
    pub test: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub phase: Phase,
    pub endpoints: Endpoints,
}

/// GET /
pub async fn index(State(state): State<AppState>) -> Json<IndexResponse> {
    Json(IndexResponse {
        service: "whatsgate",
        version: crate::VERSION,
        phase: state.controller.state().phase,
        endpoints: Endpoints {
            connect: "GET /connect",
            qr: "GET /qr",
            send: "POST /send",
            status: "GET /status",
            restart: "POST /restart",
            test: "GET /test",
        },
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub phase: Phase,
    pub has_qr: bool,
    pub identity: Option<Identity>,
    pub last_transition_at: DateTime<Utc>,
}

/// GET /status
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.controller.state();
    Json(StatusResponse {
        phase: snapshot.phase,
        has_qr: snapshot.pending_qr.is_some(),
        identity: snapshot.identity,
        last_transition_at: snapshot.last_transition_at,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub accepted: bool,
    pub outcome: ConnectOutcome,
    pub message: &'static str,
}

/// GET /connect
pub async fn connect(State(state): State<AppState>) -> Result<Json<ConnectResponse>, GatewayError> {
    let outcome = state.controller.connect().await?;
    let message = match outcome {
        ConnectOutcome::Started => "Connecting... wait a few seconds, then open /qr to scan the code",
        ConnectOutcome::AlreadyConnecting => "Already connecting. Open /qr or wait",
        ConnectOutcome::AlreadyConnected => "WhatsApp is already connected",
    };
    Ok(Json(ConnectResponse {
        accepted: true,
        outcome,
        message,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoQrResponse {
    pub accepted: bool,
    pub message: String,
    pub tip: &'static str,
}

/// GET /qr
pub async fn qr(State(state): State<AppState>) -> Result<Response, GatewayError> {
    let snapshot = state.controller.state();
    let Some(code) = snapshot.pending_qr else {
        return Ok(Json(NoQrResponse {
            accepted: false,
            message: format!("QR code not available. Phase: {}", snapshot.phase),
            tip: "Use /connect first and wait a few seconds",
        })
        .into_response());
    };

    let page = pages::qr_page(&code)
        .map_err(|e| GatewayError::Internal(format!("failed to render QR code: {e}")))?;
    Ok(Html(page).into_response())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartResponse {
    pub accepted: bool,
    pub message: &'static str,
    pub phase: Phase,
}

/// POST /restart
pub async fn restart(State(state): State<AppState>) -> Result<Json<RestartResponse>, GatewayError> {
    let snapshot = state.controller.restart().await?;
    Ok(Json(RestartResponse {
        accepted: true,
        message: "Connection restarted. Use /connect again",
        phase: snapshot.phase,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub accepted: bool,
    pub to: String,
    pub preview: String,
}

/// POST /send
pub async fn send(
    State(state): State<AppState>,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> Result<Json<SendResponse>, GatewayError> {
    if !state.controller.state().is_connected() {
        return Err(GatewayError::NotConnected);
    }

    let Json(request) = body.map_err(|e| GatewayError::invalid_input(e.body_text()))?;
    let (number, message) = match (request.number, request.message) {
        (Some(number), Some(message)) if !number.trim().is_empty() && !message.is_empty() => {
            (number, message)
        }
        _ => {
            return Err(GatewayError::invalid_input(
                "Required parameters: number and message",
            ));
        }
    };
    let recipient = Recipient::parse(&number)?;

    let receipt = state.controller.send(&recipient, &message).await?;
    Ok(Json(SendResponse {
        accepted: true,
        to: receipt.to,
        preview: preview(&message, PREVIEW_CHARS),
    }))
}

/// GET /test
pub async fn test_page() -> Html<&'static str> {
    Html(pages::TEST_PAGE)
}
