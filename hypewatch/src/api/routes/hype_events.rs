//! Stored hype event routes.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    routing::get,
};
use chat_source::normalize_channel;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::database::models::HypeEventRecord;
use crate::database::repositories::HypeEventRepository;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;
const DEFAULT_HOURS: i64 = 24;
const MAX_HOURS: i64 = 168;

/// Create the hype events router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_events))
        .route("/recent", get(recent_events))
        .route("/export", get(export_events))
        .route("/{id}", get(get_event))
}

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub channel: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct EventListResponse {
    pub events: Vec<HypeEventRecord>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct RecentEventsQuery {
    pub channel: Option<String>,
    pub hours: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RecentEventsResponse {
    pub events: Vec<HypeEventRecord>,
    pub hours: i64,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub channel: Option<String>,
}

fn repository(state: &AppState) -> ApiResult<&Arc<dyn HypeEventRepository>> {
    state
        .hype_repository
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("Hype event storage not available"))
}

/// Canonical channel filter; blank means all channels.
fn channel_filter(channel: Option<&str>) -> Option<String> {
    channel.map(normalize_channel).filter(|c| !c.is_empty())
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> ApiResult<Json<EventListResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(ApiError::validation(format!(
            "limit must be between 1 and {}",
            MAX_LIMIT
        )));
    }
    let offset = query.offset.unwrap_or(0);
    if offset < 0 {
        return Err(ApiError::validation("offset must not be negative"));
    }

    let repo = repository(&state)?;
    let channel = channel_filter(query.channel.as_deref());
    let events = repo.list(channel.as_deref(), limit, offset).await?;
    let total = repo.count(channel.as_deref()).await?;

    Ok(Json(EventListResponse {
        events: events.into_iter().map(HypeEventRecord::from).collect(),
        total,
        limit,
        offset,
    }))
}

async fn recent_events(
    State(state): State<AppState>,
    Query(query): Query<RecentEventsQuery>,
) -> ApiResult<Json<RecentEventsResponse>> {
    let hours = query.hours.unwrap_or(DEFAULT_HOURS);
    if !(1..=MAX_HOURS).contains(&hours) {
        return Err(ApiError::validation(format!(
            "hours must be between 1 and {}",
            MAX_HOURS
        )));
    }

    let repo = repository(&state)?;
    let channel = channel_filter(query.channel.as_deref());
    let since = Utc::now() - Duration::hours(hours);
    let events: Vec<HypeEventRecord> = repo
        .list_since(channel.as_deref(), since)
        .await?
        .into_iter()
        .map(HypeEventRecord::from)
        .collect();

    Ok(Json(RecentEventsResponse {
        count: events.len(),
        events,
        hours,
    }))
}

async fn export_events(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<impl IntoResponse> {
    let repo = repository(&state)?;
    let channel = channel_filter(query.channel.as_deref());
    let csv = repo.export_csv(channel.as_deref()).await?;

    let disposition = format!(
        "attachment; filename=hype_events_{}.csv",
        channel.as_deref().unwrap_or("all")
    );

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        csv,
    ))
}

async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<HypeEventRecord>> {
    let event = repository(&state)?.get_by_id(id).await?;
    Ok(Json(event.into()))
}
