//! Twitch chat ingestion.
//!
//! Connects to Twitch IRC over WebSocket, parses `PRIVMSG` lines into [`ChatMessage`]s and
//! forwards them to the consumer through an `mpsc` channel.

pub mod client;
pub mod error;
pub mod irc;
pub mod message;

pub use client::{ChatSource, TWITCH_IRC_URL, TwitchChatClient, TwitchChatConfig};
pub use error::{ChatSourceError, Result};
pub use irc::{IrcEvent, parse_line};
pub use message::{ChatMessage, normalize_channel};
