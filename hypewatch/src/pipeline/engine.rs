//! The fixed-interval loop driving metrics, detection and fan-out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broadcast::BroadcastRegistry;
use super::channels::MonitoredChannels;
use super::detector::{BurstDetector, HypeEvent};
use super::messages::OutboundMessage;
use super::metrics::MetricsAggregator;
use crate::database::repositories::HypeEventRepository;
use crate::error::Result;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Channels fully processed.
    pub channels: usize,
    pub bursts: usize,
    /// Channels whose processing failed.
    pub failures: usize,
    /// Bursts that could not be stored (they were still broadcast).
    pub persist_failures: usize,
}

pub struct PipelineEngine {
    channels: Arc<MonitoredChannels>,
    aggregator: Arc<MetricsAggregator>,
    detector: Arc<BurstDetector>,
    metrics_registry: Arc<BroadcastRegistry>,
    hype_registry: Arc<BroadcastRegistry>,
    repository: Option<Arc<dyn HypeEventRepository>>,
    tick_interval: Duration,
}

impl PipelineEngine {
    pub fn new(
        channels: Arc<MonitoredChannels>,
        aggregator: Arc<MetricsAggregator>,
        detector: Arc<BurstDetector>,
        metrics_registry: Arc<BroadcastRegistry>,
        hype_registry: Arc<BroadcastRegistry>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            channels,
            aggregator,
            detector,
            metrics_registry,
            hype_registry,
            repository: None,
            tick_interval,
        }
    }

    /// Store detected bursts through `repository`.
    pub fn with_repository(mut self, repository: Arc<dyn HypeEventRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Spawn [`run`](Self::run) on the runtime.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Tick until `cancel` fires.
    ///
    /// A tick that overruns the interval is followed immediately by the next one; missed
    /// ticks are not replayed.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.tick_interval.as_millis() as u64,
            "Pipeline loop started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = interval.tick() => {
                    let report = self.tick(Utc::now(), &cancel).await;
                    debug!(
                        channels = report.channels,
                        bursts = report.bursts,
                        failures = report.failures,
                        "Tick complete"
                    );
                }
            }
        }

        info!("Pipeline loop stopped");
    }

    /// Process every monitored channel once, in order.
    ///
    /// Cancellation is observed between channels. A failing channel is logged and skipped.
    pub async fn tick(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> TickReport {
        let mut report = TickReport::default();

        for channel in self.channels.list() {
            if cancel.is_cancelled() {
                debug!("Tick interrupted by shutdown");
                break;
            }

            match self.process_channel(&channel, now, &mut report).await {
                Ok(()) => report.channels += 1,
                Err(e) => {
                    error!(%channel, error = %e, "Failed to process channel");
                    report.failures += 1;
                }
            }
        }

        report
    }

    async fn process_channel(
        &self,
        channel: &str,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let metrics = self.aggregator.compute_metrics(channel, now);
        let velocity = metrics.messages_per_second;

        self.detector.record_velocity(channel, velocity, now);
        if let Some(event) =
            self.detector
                .check_for_burst(channel, velocity, &metrics.top_emotes, now)
        {
            report.bursts += 1;
            if !self.persist(&event).await {
                report.persist_failures += 1;
            }
            let payload = OutboundMessage::HypeEvent(&event).to_payload()?;
            self.hype_registry.broadcast(&payload).await;
        }

        let payload = OutboundMessage::Metrics(&metrics).to_payload()?;
        self.metrics_registry.broadcast(&payload).await;
        Ok(())
    }

    /// Store a burst; failures are logged, never propagated.
    async fn persist(&self, event: &HypeEvent) -> bool {
        let Some(repository) = &self.repository else {
            return true;
        };
        match repository.create(event).await {
            Ok(id) => {
                debug!(channel = %event.channel, id, "Hype event stored");
                true
            }
            Err(e) => {
                warn!(channel = %event.channel, error = %e, "Failed to store hype event");
                false
            }
        }
    }
}
