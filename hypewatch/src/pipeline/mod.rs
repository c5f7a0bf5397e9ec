//! The real-time analytics pipeline.
//!
//! Chat messages land in the [`ChannelWindow`]. Once per tick the [`PipelineEngine`] asks
//! the [`MetricsAggregator`] for a snapshot of every monitored channel, feeds the velocity
//! to the [`BurstDetector`], and pushes metrics and detected bursts to the subscribers
//! registered in the two [`BroadcastRegistry`]s.

pub mod broadcast;
pub mod channels;
pub mod detector;
pub mod engine;
pub mod messages;
pub mod metrics;
pub mod window;

pub use broadcast::{BroadcastRegistry, ChannelSink, Payload, Sink, SinkId};
pub use channels::{AddOutcome, MonitoredChannels};
pub use detector::{BaselineSnapshot, BurstDetector, DetectorState, HypeEvent};
pub use engine::{PipelineEngine, TickReport};
pub use messages::OutboundMessage;
pub use metrics::{ChannelMetrics, EmoteCount, MetricsAggregator, VelocityPoint};
pub use window::{ChannelWindow, WindowStats};
