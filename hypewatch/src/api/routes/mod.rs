//! API route modules.
//!
//! Organizes routes by resource type.

pub mod channels;
pub mod health;
pub mod hype_events;
pub mod logging;
pub mod ws;

use axum::{Json, Router, routing::get};
use serde::Serialize;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .nest("/api/health", health::router())
        .nest("/api/channels", channels::router())
        .nest("/api/hype-events", hype_events::router())
        .nest("/api/logging", logging::router())
        .nest("/ws", ws::router())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct RootResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub health: &'static str,
    pub websockets: [&'static str; 3],
}

async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        name: "hypewatch",
        version: env!("CARGO_PKG_VERSION"),
        health: "/api/health",
        websockets: ["/ws/metrics", "/ws/hype", "/ws/channel/{name}"],
    })
}
