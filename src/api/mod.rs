// HTTP surface: event ingress from the gateway client, health, metrics, and status.

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

use crate::metrics;
use crate::relay::{MessageEvent, PresenceEvent, Relay};

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(relay: Arc<Relay>) -> Router {
    let state = AppState { relay };

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status))
        // Events pushed by the gateway connection
        .route("/events/message", post(message_event))
        .route("/events/presence", post(presence_event))
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "guild-relay" }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        metrics::gather_metrics(),
    )
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.relay.status())
}

// ── Event ingress ─────────────────────────────────────────────────────

/// Accept a message event. Handling runs on its own task so the producer is
/// never blocked on backend round-trips.
async fn message_event(
    State(state): State<AppState>,
    Json(event): Json<MessageEvent>,
) -> impl IntoResponse {
    metrics::EVENTS_RECEIVED_TOTAL
        .with_label_values(&["message"])
        .inc();
    let relay = state.relay.clone();
    tokio::spawn(async move {
        relay.handle_message(event, Utc::now()).await;
    });
    StatusCode::ACCEPTED
}

async fn presence_event(
    State(state): State<AppState>,
    Json(event): Json<PresenceEvent>,
) -> impl IntoResponse {
    metrics::EVENTS_RECEIVED_TOTAL
        .with_label_values(&["presence"])
        .inc();
    let relay = state.relay.clone();
    tokio::spawn(async move {
        relay.handle_presence(event, Utc::now()).await;
    });
    StatusCode::ACCEPTED
}
