//! HTTP intake for inbound chat events.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::chat::InboundEvent;
use crate::engine::Dispatcher;

/// Build the router: `POST /events` and `GET /health`.
pub fn build_router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/events", post(events_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Accept an event and dispatch it in the background.
async fn events_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(event): Json<InboundEvent>,
) -> impl IntoResponse {
    if event.channel.trim().is_empty() || event.thread.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "channel and thread are required"})),
        );
    }

    tracing::debug!(thread = %event.thread, channel = %event.channel, "accepted event");
    tokio::spawn(async move {
        dispatcher.handle(event).await;
    });
    (StatusCode::ACCEPTED, Json(json!({"status": "accepted"})))
}

/// Serve until Ctrl-C.
pub async fn serve(dispatcher: Arc<Dispatcher>, host: &str, port: u16) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "chatforge listening");

    axum::serve(listener, build_router(dispatcher))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
