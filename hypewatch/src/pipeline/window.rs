//! Bounded per-channel message window.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chat_source::{ChatMessage, normalize_channel};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

/// Occupancy snapshot.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WindowStats {
    pub total_channels: usize,
    pub max_per_channel: usize,
    /// Buffered messages per channel.
    pub channels: BTreeMap<String, usize>,
}

/// Recent messages per channel, oldest first.
///
/// Each channel holds at most `capacity` messages; inserting into a full channel evicts the
/// oldest one. Order is ingestion order, which is authoritative even when timestamps arrive
/// slightly out of order. Each channel sits behind its own lock, so ingestion on one channel
/// never contends with reads of another.
pub struct ChannelWindow {
    capacity: usize,
    windows: DashMap<String, Mutex<VecDeque<Arc<ChatMessage>>>>,
}

impl ChannelWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            windows: DashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a message, creating the channel's window on first use.
    pub fn insert(&self, channel: &str, message: impl Into<Arc<ChatMessage>>) {
        let key = normalize_channel(channel);
        let message = message.into();

        if let Some(window) = self.windows.get(&key) {
            push_bounded(&mut window.lock(), message, self.capacity);
            return;
        }

        let window = self
            .windows
            .entry(key)
            .or_insert_with(|| Mutex::new(VecDeque::with_capacity(self.capacity.min(1024))));
        push_bounded(&mut window.lock(), message, self.capacity);
    }

    /// Messages with `timestamp >= since`, oldest first. Unknown channels yield nothing.
    pub fn query(&self, channel: &str, since: DateTime<Utc>) -> Vec<Arc<ChatMessage>> {
        let Some(window) = self.windows.get(&normalize_channel(channel)) else {
            return Vec::new();
        };
        let window = window.lock();
        window
            .iter()
            .filter(|m| m.timestamp >= since)
            .cloned()
            .collect()
    }

    /// The last `count` messages in arrival order.
    pub fn most_recent(&self, channel: &str, count: usize) -> Vec<Arc<ChatMessage>> {
        let Some(window) = self.windows.get(&normalize_channel(channel)) else {
            return Vec::new();
        };
        let window = window.lock();
        let skip = window.len().saturating_sub(count);
        window.iter().skip(skip).cloned().collect()
    }

    /// Drop everything buffered for a channel.
    pub fn clear(&self, channel: &str) {
        self.windows.remove(&normalize_channel(channel));
    }

    pub fn clear_all(&self) {
        self.windows.clear();
    }

    /// Buffered message count for a channel.
    pub fn len(&self, channel: &str) -> usize {
        self.windows
            .get(&normalize_channel(channel))
            .map(|w| w.lock().len())
            .unwrap_or(0)
    }

    /// Channels that currently have a window, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.windows.iter().map(|e| e.key().clone()).collect();
        channels.sort();
        channels
    }

    pub fn stats(&self) -> WindowStats {
        let channels: BTreeMap<String, usize> = self
            .windows
            .iter()
            .map(|e| (e.key().clone(), e.value().lock().len()))
            .collect();
        WindowStats {
            total_channels: channels.len(),
            max_per_channel: self.capacity,
            channels,
        }
    }
}

fn push_bounded(
    window: &mut VecDeque<Arc<ChatMessage>>,
    message: Arc<ChatMessage>,
    capacity: usize,
) {
    while window.len() >= capacity {
        window.pop_front();
    }
    window.push_back(message);
}
