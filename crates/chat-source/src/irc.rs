//! Twitch IRC line parsing.
//!
//! Twitch IRC format with tags:
//! `@badge-info=;badges=broadcaster/1;display-name=User;emotes=25:0-4;id=xxx;tmi-sent-ts=1700000000000;user-id=456 :user!user@user.tmi.twitch.tv PRIVMSG #channel :Kappa hi`

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::error::{ChatSourceError, Result};
use crate::message::{ChatMessage, normalize_channel};

/// A parsed, relevant IRC line.
#[derive(Debug, Clone, PartialEq)]
pub enum IrcEvent {
    /// Server keepalive; the payload must be echoed back in a `PONG`.
    Ping(String),
    /// A chat message.
    Message(ChatMessage),
    /// The server asks the client to reconnect.
    Reconnect,
}

/// Parse a single IRC line.
///
/// Returns `Ok(None)` for lines that carry nothing the pipeline needs (numerics, JOIN echoes,
/// USERSTATE, ...). A `PRIVMSG` that cannot be decoded yields a protocol error.
pub fn parse_line(line: &str) -> Result<Option<IrcEvent>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Ok(None);
    }

    if let Some(payload) = line.strip_prefix("PING") {
        let payload = payload.trim();
        let payload = if payload.is_empty() {
            ":tmi.twitch.tv"
        } else {
            payload
        };
        return Ok(Some(IrcEvent::Ping(payload.to_string())));
    }

    let (tags, remaining) = split_tags(line);

    let mut parts = remaining.splitn(4, ' ');
    let prefix = parts.next().unwrap_or_default();
    let command = parts.next().unwrap_or_default();

    match command {
        "PRIVMSG" => {}
        "RECONNECT" => return Ok(Some(IrcEvent::Reconnect)),
        _ => return Ok(None),
    }

    let channel = parts
        .next()
        .filter(|c| c.starts_with('#'))
        .ok_or_else(|| ChatSourceError::protocol("PRIVMSG without channel"))?;
    let content = parts
        .next()
        .ok_or_else(|| ChatSourceError::protocol("PRIVMSG without content"))?;
    let content = content.strip_prefix(':').unwrap_or(content);

    let nick = prefix
        .strip_prefix(':')
        .and_then(|s| s.split('!').next())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ChatSourceError::protocol("PRIVMSG without sender prefix"))?;

    let username = tags
        .get("display-name")
        .filter(|name| !name.is_empty())
        .cloned()
        .unwrap_or_else(|| nick.to_string());

    let mut message = ChatMessage::new(normalize_channel(channel), username, content)
        .with_timestamp(parse_sent_ts(tags.get("tmi-sent-ts").map(String::as_str)));

    if let Some(id) = tags.get("id").filter(|id| !id.is_empty()) {
        message = message.with_id(id.clone());
    }
    if let Some(badges) = tags.get("badges") {
        message = message.with_badges(parse_badges(badges));
    }
    if let Some(emotes) = tags.get("emotes") {
        message = message.with_emotes(parse_emotes(emotes, content));
    }

    Ok(Some(IrcEvent::Message(message)))
}

/// Split the optional `@tags` section off a line.
fn split_tags(line: &str) -> (HashMap<String, String>, &str) {
    let mut tags = HashMap::new();
    let Some(rest) = line.strip_prefix('@') else {
        return (tags, line);
    };
    let Some((tag_str, remaining)) = rest.split_once(' ') else {
        return (tags, "");
    };

    for tag in tag_str.split(';') {
        if let Some((key, value)) = tag.split_once('=') {
            tags.insert(key.to_string(), unescape_tag_value(value));
        }
    }
    (tags, remaining)
}

/// Undo IRCv3 tag value escaping.
fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn parse_sent_ts(value: Option<&str>) -> DateTime<Utc> {
    value
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

/// `subscriber/12,premium/1` -> `["subscriber", "premium"]`
fn parse_badges(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter_map(|badge| badge.split('/').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// `25:0-4,12-16/1902:6-10` -> the emote names, taken from the content at the first
/// position of each emote. Positions index Unicode scalar values.
fn parse_emotes(value: &str, content: &str) -> Vec<String> {
    if value.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = content.chars().collect();
    let mut emotes = Vec::new();

    for entry in value.split('/') {
        let Some((_, positions)) = entry.split_once(':') else {
            continue;
        };
        let Some(first) = positions.split(',').next() else {
            continue;
        };
        let Some((start, end)) = first.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) else {
            debug!(entry, "Skipping malformed emote position");
            continue;
        };
        if start > end || end >= chars.len() {
            debug!(entry, "Emote position outside message content");
            continue;
        }

        let name: String = chars[start..=end].iter().collect();
        if !emotes.contains(&name) {
            emotes.push(name);
        }
    }

    emotes
}
