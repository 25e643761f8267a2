//! Admin HTTP surface.
//!
//! Provides endpoints for:
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)
//! - Daemon and job snapshots (`/v1/daemons`, `/v1/jobs`)
//!
//! Handlers never touch coordinator state; they ask the event loop for a
//! [`Snapshot`] and render it.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::event::{Event, EventSender};
use crate::metrics;
use crate::snapshot::Snapshot;

/// Create the HTTP router.
pub fn create_router(events: EventSender) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/daemons", get(list_daemons))
        .route("/v1/jobs", get(list_jobs))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(events)
}

async fn snapshot(events: &EventSender) -> Option<Snapshot> {
    let (tx, rx) = oneshot::channel();
    events.send(Event::Snapshot(tx)).ok()?;
    rx.await.ok()
}

fn unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": "coordinator is not running" })),
    )
        .into_response()
}

/// Health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler(State(events): State<EventSender>) -> Response {
    match snapshot(&events).await {
        Some(snapshot) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics::render(&snapshot),
        )
            .into_response(),
        None => unavailable(),
    }
}

/// List daemons as JSON.
pub async fn list_daemons(State(events): State<EventSender>) -> Response {
    match snapshot(&events).await {
        Some(snapshot) => Json(snapshot.daemons).into_response(),
        None => unavailable(),
    }
}

/// List open jobs as JSON.
pub async fn list_jobs(State(events): State<EventSender>) -> Response {
    match snapshot(&events).await {
        Some(snapshot) => Json(snapshot.jobs).into_response(),
        None => unavailable(),
    }
}
