//! HTTP Gateway
//!
//! JSON endpoints for pairing the WhatsApp session and sending messages,
//! plus a browser test page.

pub mod pages;
pub mod routes;

use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use std::future::Future;
use tokio::net::TcpListener;

use crate::channels::whatsapp::ConnectionController;

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: ConnectionController,
}

impl AppState {
    pub fn new(controller: ConnectionController) -> Self {
        Self { controller }
    }
}

/// Create the gateway router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::index))
        .route("/status", get(routes::status))
        .route("/connect", get(routes::connect))
        .route("/qr", get(routes::qr))
        .route("/send", post(routes::send))
        .route("/restart", post(routes::restart))
        .route("/test", get(routes::test_page))
        .with_state(state)
}

/// Serve the gateway on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("Listener has no local address")?;
    tracing::info!("Gateway listening on http://{}", addr);
    tracing::info!("Test page: http://{}/test", addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;

    tracing::info!("Gateway stopped");
    Ok(())
}
