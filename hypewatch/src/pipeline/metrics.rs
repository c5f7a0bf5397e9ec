//! Windowed channel statistics.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chat_source::{ChatMessage, normalize_channel};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::window::ChannelWindow;

/// Horizon of the velocity signal, in seconds.
pub const VELOCITY_HORIZON_SECS: i64 = 1;
/// Horizon of the message count, in seconds.
pub const MINUTE_HORIZON_SECS: i64 = 60;
/// Horizon of unique chatters, emotes and average length, in seconds.
pub const ACTIVITY_HORIZON_SECS: i64 = 300;

/// Emote token and how often it was used.
pub type EmoteCount = (String, usize);

/// Point-in-time statistics for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetrics {
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    /// Messages in the last second.
    pub messages_per_second: f64,
    pub messages_last_minute: usize,
    pub unique_chatters_5min: usize,
    /// Most used emotes over five minutes, most frequent first.
    pub top_emotes: Vec<EmoteCount>,
    /// Mean content length in characters over five minutes, one decimal.
    pub avg_message_length: f64,
}

impl ChannelMetrics {
    /// An all-zero snapshot.
    pub fn empty(channel: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            channel: channel.into(),
            timestamp,
            messages_per_second: 0.0,
            messages_last_minute: 0,
            unique_chatters_5min: 0,
            top_emotes: Vec::new(),
            avg_message_length: 0.0,
        }
    }
}

/// One bar of the velocity chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VelocityPoint {
    pub timestamp: DateTime<Utc>,
    pub velocity: usize,
}

/// Computes [`ChannelMetrics`] from a [`ChannelWindow`]. Holds no state of its own.
pub struct MetricsAggregator {
    window: Arc<ChannelWindow>,
    top_emotes_limit: usize,
}

impl MetricsAggregator {
    pub fn new(window: Arc<ChannelWindow>, top_emotes_limit: usize) -> Self {
        Self {
            window,
            top_emotes_limit,
        }
    }

    pub fn window(&self) -> &Arc<ChannelWindow> {
        &self.window
    }

    pub fn compute_metrics(&self, channel: &str, now: DateTime<Utc>) -> ChannelMetrics {
        let channel = normalize_channel(channel);

        let since = |secs: i64| now - Duration::seconds(secs);

        let last_second = self.window.query(&channel, since(VELOCITY_HORIZON_SECS));
        let last_minute = self.window.query(&channel, since(MINUTE_HORIZON_SECS));
        let last_five = self.window.query(&channel, since(ACTIVITY_HORIZON_SECS));

        ChannelMetrics {
            messages_per_second: last_second.len() as f64,
            messages_last_minute: last_minute.len(),
            unique_chatters_5min: unique_chatters(&last_five),
            top_emotes: top_emotes(&last_five, self.top_emotes_limit),
            avg_message_length: avg_message_length(&last_five),
            channel,
            timestamp: now,
        }
    }

    /// Per-second message counts for the `seconds` seconds before `now`, oldest first.
    ///
    /// The point stamped `t` counts messages in `[t - 1s, t)`.
    pub fn velocity_history(
        &self,
        channel: &str,
        now: DateTime<Utc>,
        seconds: u32,
    ) -> Vec<VelocityPoint> {
        let seconds = i64::from(seconds);
        let earliest = now - Duration::seconds(seconds + 1);
        let messages = self.window.query(channel, earliest);

        (1..=seconds)
            .rev()
            .map(|i| {
                let point = now - Duration::seconds(i);
                let start = point - Duration::seconds(VELOCITY_HORIZON_SECS);
                let velocity = messages
                    .iter()
                    .filter(|m| m.timestamp >= start && m.timestamp < point)
                    .count();
                VelocityPoint {
                    timestamp: point,
                    velocity,
                }
            })
            .collect()
    }
}

fn unique_chatters(messages: &[Arc<ChatMessage>]) -> usize {
    messages
        .iter()
        .map(|m| m.username.to_lowercase())
        .collect::<HashSet<_>>()
        .len()
}

/// Counts descending; equal counts keep first-seen order.
fn top_emotes(messages: &[Arc<ChatMessage>], limit: usize) -> Vec<EmoteCount> {
    let mut counts: Vec<EmoteCount> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for emote in messages.iter().flat_map(|m| m.emotes.iter()) {
        match index.get(emote.as_str()) {
            Some(&i) => counts[i].1 += 1,
            None => {
                index.insert(emote.as_str(), counts.len());
                counts.push((emote.clone(), 1));
            }
        }
    }

    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.truncate(limit);
    counts
}

fn avg_message_length(messages: &[Arc<ChatMessage>]) -> f64 {
    if messages.is_empty() {
        return 0.0;
    }
    let total: usize = messages.iter().map(|m| m.char_len()).sum();
    round_to(total as f64 / messages.len() as f64, 1)
}

/// Round half away from zero to `decimals` places.
pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
