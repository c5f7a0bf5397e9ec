//! Health check routes.

use axum::{Json, Router, extract::State, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::server::AppState;
use crate::pipeline::WindowStats;

/// Create the health router.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    /// Whether the chat connection is currently up
    pub chat_connected: bool,
    pub channels_count: usize,
    pub channels: Vec<String>,
    pub buffer_stats: WindowStats,
    pub metrics_subscribers: usize,
    pub hype_subscribers: usize,
}

/// Health check endpoint.
///
/// The service reports healthy while it can answer; a dropped chat connection shows up
/// in `chat_connected` only, since the client reconnects on its own.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let channels = state.channels.list();

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        chat_connected: state.channels.source_connected(),
        channels_count: channels.len(),
        channels,
        buffer_stats: state.aggregator.window().stats(),
        metrics_subscribers: state.metrics_registry.count(),
        hype_subscribers: state.hype_registry.count(),
    })
}

#[cfg(test)]
mod tests {
    use super::super::create_router;
    use super::super::test_support::{get, send, state};
    use axum::http::StatusCode;
    use chat_source::ChatMessage;

    #[tokio::test]
    async fn test_health_reports_channels_and_buffer() {
        let state = state(&["foo", "bar"]);
        state
            .aggregator
            .window()
            .insert("foo", ChatMessage::new("foo", "u", "hi"));

        let (status, body) = send(create_router(state), get("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["chat_connected"], false);
        assert_eq!(body["channels_count"], 2);
        assert_eq!(body["channels"], serde_json::json!(["foo", "bar"]));
        assert_eq!(body["buffer_stats"]["channels"]["foo"], 1);
        assert_eq!(body["metrics_subscribers"], 0);
    }
}
