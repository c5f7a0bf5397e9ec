//! Channel management and live channel data routes.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/api/channels` | List monitored channels |
//! | POST | `/api/channels` | Start monitoring a channel |
//! | DELETE | `/api/channels/{name}` | Stop monitoring a channel |
//! | GET | `/api/channels/{name}/metrics` | Current metrics snapshot |
//! | GET | `/api/channels/{name}/velocity` | Per-second velocity history |
//! | GET | `/api/channels/{name}/messages` | Most recent buffered messages |
//! | GET | `/api/channels/{name}/baseline` | Burst detector baseline |

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::get,
};
use chat_source::{ChatMessage, normalize_channel};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::pipeline::{AddOutcome, BaselineSnapshot, ChannelMetrics, VelocityPoint};

const DEFAULT_VELOCITY_SECONDS: i64 = 60;
const MAX_VELOCITY_SECONDS: i64 = 300;
const DEFAULT_MESSAGE_COUNT: i64 = 50;
const MAX_MESSAGE_COUNT: i64 = 500;

/// Create the channels router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_channels).post(add_channel))
        .route("/{name}", axum::routing::delete(remove_channel))
        .route("/{name}/metrics", get(get_metrics))
        .route("/{name}/velocity", get(get_velocity))
        .route("/{name}/messages", get(get_messages))
        .route("/{name}/baseline", get(get_baseline))
}

#[derive(Debug, Deserialize)]
pub struct AddChannelRequest {
    pub channel: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Joined,
    AlreadyJoined,
    Left,
}

impl From<AddOutcome> for ChannelStatus {
    fn from(outcome: AddOutcome) -> Self {
        match outcome {
            AddOutcome::Joined => Self::Joined,
            AddOutcome::AlreadyJoined => Self::AlreadyJoined,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChannelResponse {
    pub status: ChannelStatus,
    pub channel: String,
}

#[derive(Debug, Deserialize)]
pub struct VelocityQuery {
    pub seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct VelocityResponse {
    pub channel: String,
    pub seconds: u32,
    pub points: Vec<VelocityPoint>,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub count: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub channel: String,
    pub count: usize,
    /// Oldest first.
    pub messages: Vec<Arc<ChatMessage>>,
}

async fn list_channels(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.channels.list())
}

async fn add_channel(
    State(state): State<AppState>,
    Json(request): Json<AddChannelRequest>,
) -> ApiResult<Json<ChannelResponse>> {
    let (channel, outcome) = state.channels.add(&request.channel).await?;
    Ok(Json(ChannelResponse {
        status: outcome.into(),
        channel,
    }))
}

async fn remove_channel(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ChannelResponse>> {
    let channel = state.channels.remove(&name).await?;
    Ok(Json(ChannelResponse {
        status: ChannelStatus::Left,
        channel,
    }))
}

async fn get_metrics(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<ChannelMetrics> {
    Json(state.aggregator.compute_metrics(&name, Utc::now()))
}

async fn get_velocity(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<VelocityQuery>,
) -> ApiResult<Json<VelocityResponse>> {
    let seconds = query.seconds.unwrap_or(DEFAULT_VELOCITY_SECONDS);
    if !(1..=MAX_VELOCITY_SECONDS).contains(&seconds) {
        return Err(ApiError::validation(format!(
            "seconds must be between 1 and {}",
            MAX_VELOCITY_SECONDS
        )));
    }

    let seconds = seconds as u32;
    let points = state.aggregator.velocity_history(&name, Utc::now(), seconds);
    Ok(Json(VelocityResponse {
        channel: normalize_channel(&name),
        seconds,
        points,
    }))
}

async fn get_messages(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<MessagesResponse>> {
    let count = query.count.unwrap_or(DEFAULT_MESSAGE_COUNT);
    if !(1..=MAX_MESSAGE_COUNT).contains(&count) {
        return Err(ApiError::validation(format!(
            "count must be between 1 and {}",
            MAX_MESSAGE_COUNT
        )));
    }

    let messages = state.aggregator.window().most_recent(&name, count as usize);
    Ok(Json(MessagesResponse {
        channel: normalize_channel(&name),
        count: messages.len(),
        messages,
    }))
}

async fn get_baseline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<BaselineSnapshot> {
    Json(state.detector.snapshot(&name, Utc::now()))
}
