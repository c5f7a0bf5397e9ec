//! The set of monitored channels.

use std::sync::Arc;

use chat_source::{ChatSource, normalize_channel};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use super::detector::BurstDetector;
use super::window::ChannelWindow;
use crate::error::{Error, Result};

/// Result of adding a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddOutcome {
    Joined,
    AlreadyJoined,
}

/// Channels the pipeline reports on every tick, in the order they were added.
///
/// Adding joins the channel on the chat source; removing leaves it and discards the
/// channel's buffered messages and detector state.
pub struct MonitoredChannels {
    channels: RwLock<Vec<String>>,
    source: Option<Arc<dyn ChatSource>>,
    window: Arc<ChannelWindow>,
    detector: Arc<BurstDetector>,
}

impl MonitoredChannels {
    pub fn new(
        initial: impl IntoIterator<Item = String>,
        source: Option<Arc<dyn ChatSource>>,
        window: Arc<ChannelWindow>,
        detector: Arc<BurstDetector>,
    ) -> Self {
        let mut channels: Vec<String> = Vec::new();
        for channel in initial.into_iter().map(|c| normalize_channel(&c)) {
            if !channel.is_empty() && !channels.contains(&channel) {
                channels.push(channel);
            }
        }

        Self {
            channels: RwLock::new(channels),
            source,
            window,
            detector,
        }
    }

    /// Snapshot of the monitored channels.
    pub fn list(&self) -> Vec<String> {
        self.channels.read().clone()
    }

    pub fn contains(&self, channel: &str) -> bool {
        let channel = normalize_channel(channel);
        self.channels.read().contains(&channel)
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }

    pub fn source(&self) -> Option<&Arc<dyn ChatSource>> {
        self.source.as_ref()
    }

    /// Whether the chat source is currently connected. `false` without a source.
    pub fn source_connected(&self) -> bool {
        self.source.as_ref().is_some_and(|s| s.is_connected())
    }

    pub async fn add(&self, channel: &str) -> Result<(String, AddOutcome)> {
        let channel = normalize_channel(channel);
        if channel.is_empty() {
            return Err(Error::validation("Channel name cannot be empty"));
        }
        if self.contains(&channel) {
            return Ok((channel, AddOutcome::AlreadyJoined));
        }

        if let Some(source) = &self.source {
            source.join_channel(&channel).await?;
        }

        {
            let mut channels = self.channels.write();
            if channels.contains(&channel) {
                return Ok((channel, AddOutcome::AlreadyJoined));
            }
            channels.push(channel.clone());
        }

        info!(%channel, "Channel monitoring started");
        Ok((channel, AddOutcome::Joined))
    }

    pub async fn remove(&self, channel: &str) -> Result<String> {
        let channel = normalize_channel(channel);
        if !self.contains(&channel) {
            return Err(Error::not_found("Channel", channel));
        }

        if let Some(source) = &self.source {
            source.leave_channel(&channel).await?;
        }

        self.channels.write().retain(|c| c != &channel);
        self.window.clear(&channel);
        self.detector.reset(&channel);

        info!(%channel, "Channel monitoring stopped");
        Ok(channel)
    }
}
