//! JSON messages pushed to WebSocket subscribers.

use serde::Serialize;

use super::broadcast::Payload;
use super::detector::HypeEvent;
use super::metrics::ChannelMetrics;
use crate::error::Result;

/// An outbound update, tagged by `type`.
///
/// ```json
/// {"type":"metrics","channel":"foo","timestamp":"2024-05-01T12:00:00Z","messages_per_second":12.0, ...}
/// {"type":"hype_event","channel":"foo","timestamp":"2024-05-01T12:00:00Z","velocity":40.0, ...}
/// ```
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage<'a> {
    Metrics(&'a ChannelMetrics),
    HypeEvent(&'a HypeEvent),
}

impl OutboundMessage<'_> {
    pub fn channel(&self) -> &str {
        match self {
            Self::Metrics(metrics) => &metrics.channel,
            Self::HypeEvent(event) => &event.channel,
        }
    }

    pub fn to_payload(&self) -> Result<Payload> {
        let body = serde_json::to_string(self)?;
        Ok(Payload::new(self.channel(), body))
    }
}

/// Reply to a client keepalive.
pub const PONG: &str = "pong";
