//! Hype event rows and their API representation.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::time::{datetime_to_ms, ms_to_datetime};
use crate::pipeline::{EmoteCount, HypeEvent};

/// CSV export header.
pub const CSV_HEADER: &str = "channel,timestamp,velocity,baseline_mean,baseline_std,multiplier";

/// Row of the `hype_events` table.
#[derive(Debug, Clone, FromRow, PartialEq)]
pub struct HypeEventDbModel {
    pub id: i64,
    pub channel: String,
    /// Unix epoch milliseconds (UTC)
    pub timestamp: i64,
    pub velocity: f64,
    pub baseline_mean: f64,
    pub baseline_std: f64,
    pub multiplier: f64,
    /// JSON `[[token, count], ...]`, NULL when no emotes were trending
    pub top_emotes_json: Option<String>,
}

impl HypeEventDbModel {
    /// Row for a freshly detected event; `id` is assigned on insert.
    pub fn from_event(event: &HypeEvent) -> crate::Result<Self> {
        let top_emotes_json = if event.top_emotes.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&event.top_emotes)?)
        };

        Ok(Self {
            id: 0,
            channel: event.channel.clone(),
            timestamp: datetime_to_ms(event.timestamp),
            velocity: event.velocity,
            baseline_mean: event.baseline_mean,
            baseline_std: event.baseline_std,
            multiplier: event.multiplier,
            top_emotes_json,
        })
    }

    /// Decoded emotes; unreadable JSON reads as none.
    pub fn top_emotes(&self) -> Vec<EmoteCount> {
        self.top_emotes_json
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default()
    }

    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{:.1},{:.1},{:.1},{:.2}",
            self.channel,
            ms_to_datetime(self.timestamp).to_rfc3339_opts(SecondsFormat::Millis, true),
            self.velocity,
            self.baseline_mean,
            self.baseline_std,
            self.multiplier
        )
    }
}

/// A stored hype event as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HypeEventRecord {
    pub id: i64,
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    pub velocity: f64,
    pub baseline_mean: f64,
    pub baseline_std: f64,
    pub multiplier: f64,
    pub top_emotes: Vec<EmoteCount>,
}

impl From<HypeEventDbModel> for HypeEventRecord {
    fn from(model: HypeEventDbModel) -> Self {
        Self {
            top_emotes: model.top_emotes(),
            id: model.id,
            channel: model.channel,
            timestamp: ms_to_datetime(model.timestamp),
            velocity: model.velocity,
            baseline_mean: model.baseline_mean,
            baseline_std: model.baseline_std,
            multiplier: model.multiplier,
        }
    }
}
