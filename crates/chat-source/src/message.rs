//! Chat message types.
//!
//! A [`ChatMessage`] is one chat line observed on a channel. It is created once by the
//! ingestion side and never mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalize a channel name into its canonical key: trimmed, without the IRC `#`
/// prefix, lowercased.
pub fn normalize_channel(name: &str) -> String {
    name.trim().trim_start_matches('#').to_lowercase()
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique message ID (platform-specific, UUID when the platform gives none)
    pub id: String,
    /// Canonical channel key
    pub channel: String,
    /// Display name of the sender
    pub username: String,
    /// Message content
    pub content: String,
    /// Distinct emote tokens present in the content, in order of first appearance
    #[serde(default)]
    pub emotes: Vec<String>,
    /// Badge names carried by the sender
    #[serde(default)]
    pub badges: Vec<String>,
    /// Time the message was sent (UTC)
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a new chat message stamped with the current time.
    pub fn new(
        channel: impl AsRef<str>,
        username: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: normalize_channel(channel.as_ref()),
            username: username.into(),
            content: content.into(),
            emotes: Vec::new(),
            badges: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Set the message ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the emote tokens. Duplicates are dropped, first occurrence wins.
    pub fn with_emotes<I, S>(mut self, emotes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.emotes.clear();
        for emote in emotes {
            let emote = emote.into();
            if !emote.is_empty() && !self.emotes.contains(&emote) {
                self.emotes.push(emote);
            }
        }
        self
    }

    /// Set the badge names.
    pub fn with_badges<I, S>(mut self, badges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.badges = badges.into_iter().map(Into::into).collect();
        self
    }

    /// Set the timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Length of the content in characters (Unicode scalar values).
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_new() {
        let msg = ChatMessage::new("#SomeChannel", "TestUser", "Hello world!");

        assert_eq!(msg.channel, "somechannel");
        assert_eq!(msg.username, "TestUser");
        assert_eq!(msg.content, "Hello world!");
        assert!(msg.emotes.is_empty());
        assert!(msg.badges.is_empty());
        assert!(uuid::Uuid::parse_str(&msg.id).is_ok());
    }

    #[test]
    fn test_with_emotes_dedups() {
        let msg = ChatMessage::new("c", "u", "KEKW KEKW LUL")
            .with_emotes(["KEKW", "LUL", "KEKW", ""]);

        assert_eq!(msg.emotes, vec!["KEKW", "LUL"]);
    }

    #[test]
    fn test_char_len_counts_scalars() {
        let msg = ChatMessage::new("c", "u", "héllo 世界");
        assert_eq!(msg.char_len(), 8);
    }

    #[test]
    fn test_normalize_channel() {
        assert_eq!(normalize_channel("  #Forsen "), "forsen");
        assert_eq!(normalize_channel("xqc"), "xqc");
    }
}
