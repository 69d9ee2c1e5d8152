//! Webhook update source: an axum server Telegram posts updates to.

use crate::protocol::Update;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::future::Future;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn receive_update(State(updates): State<mpsc::Sender<Update>>, body: Bytes) -> StatusCode {
    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(error) => {
            tracing::warn!(error = %error, "Rejecting malformed update");
            return StatusCode::BAD_REQUEST;
        }
    };

    tracing::debug!(update_id = update.update_id, "Received update");
    match updates.send(update).await {
        Ok(()) => StatusCode::OK,
        Err(_) => {
            tracing::error!("Dispatcher stopped, cannot accept update");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// The secret part of the webhook URL is the bot token itself.
pub fn webhook_path(token: &str) -> String {
    format!("/bot{}", token)
}

pub fn router(token: &str, updates: mpsc::Sender<Update>) -> Router {
    Router::new()
        .route(&webhook_path(token), post(receive_update))
        .with_state(updates)
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
}

/// Full URL to register with `setWebhook`.
pub fn webhook_url(public_url: &str, token: &str) -> String {
    format!("{}{}", public_url.trim_end_matches('/'), webhook_path(token))
}

pub async fn serve(
    listen: &str,
    app: Router,
    shutdown: impl Future<Output = &'static str> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(addr = %listener.local_addr()?, "Webhook server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let signal = shutdown.await;
            tracing::info!(signal, "Stopping webhook server");
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_url_joins_public_base() {
        assert_eq!(
            webhook_url("https://bot.example.com/", "1:abc"),
            "https://bot.example.com/bot1:abc"
        );
        assert_eq!(webhook_path("1:abc"), "/bot1:abc");
    }
}
