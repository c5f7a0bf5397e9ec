//! Service container for dependency injection.
//!
//! The ServiceContainer builds every pipeline service once, hands out shared references
//! and owns the background tasks (pipeline loop, chat client, ingestion).

use std::sync::Arc;
use std::time::Duration;

use chat_source::{ChatMessage, ChatSource, TwitchChatClient, TwitchChatConfig};
use parking_lot::Mutex;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::Result;
use crate::config::AppConfig;
use crate::database::repositories::{HypeEventRepository, SqlxHypeEventRepository};
use crate::pipeline::{
    BroadcastRegistry, BurstDetector, ChannelWindow, MetricsAggregator, MonitoredChannels,
    PipelineEngine,
};

/// Buffered chat messages between the chat client and the window.
const INGEST_CAPACITY: usize = 4096;

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Service container holding all application services.
pub struct ServiceContainer {
    pub config: AppConfig,
    /// Database connection pool.
    pub pool: SqlitePool,
    pub window: Arc<ChannelWindow>,
    pub aggregator: Arc<MetricsAggregator>,
    pub detector: Arc<BurstDetector>,
    /// Subscribers of per-tick metrics.
    pub metrics_registry: Arc<BroadcastRegistry>,
    /// Subscribers of hype events.
    pub hype_registry: Arc<BroadcastRegistry>,
    pub hype_repository: Arc<dyn HypeEventRepository>,
    pub channels: Arc<MonitoredChannels>,
    pub engine: Arc<PipelineEngine>,
    chat_client: Option<Arc<TwitchChatClient>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Build the services with a Twitch chat client for the configured channels.
    pub fn new(config: AppConfig, pool: SqlitePool) -> Self {
        let chat_config = TwitchChatConfig::default()
            .with_access_token(config.twitch_access_token.clone())
            .with_nick(config.twitch_nick.clone());
        let client = TwitchChatClient::new(chat_config, config.default_channels.clone());
        Self::with_chat_client(config, pool, Some(Arc::new(client)))
    }

    /// Build the services with an explicit (or no) chat client.
    pub fn with_chat_client(
        config: AppConfig,
        pool: SqlitePool,
        chat_client: Option<Arc<TwitchChatClient>>,
    ) -> Self {
        info!("Initializing service container");

        let window = Arc::new(ChannelWindow::new(config.message_buffer_size));
        let aggregator = Arc::new(MetricsAggregator::new(
            window.clone(),
            config.top_emotes_limit,
        ));
        let detector = Arc::new(BurstDetector::new(config.detector.clone()));
        let metrics_registry = Arc::new(BroadcastRegistry::new(
            "metrics",
            config.sink_send_timeout,
        ));
        let hype_registry = Arc::new(BroadcastRegistry::new("hype", config.sink_send_timeout));

        let hype_repository: Arc<dyn HypeEventRepository> =
            Arc::new(SqlxHypeEventRepository::new(pool.clone()));

        let source = chat_client
            .clone()
            .map(|client| client as Arc<dyn ChatSource>);
        let channels = Arc::new(MonitoredChannels::new(
            config.default_channels.clone(),
            source,
            window.clone(),
            detector.clone(),
        ));

        let engine = Arc::new(
            PipelineEngine::new(
                channels.clone(),
                aggregator.clone(),
                detector.clone(),
                metrics_registry.clone(),
                hype_registry.clone(),
                config.tick_interval,
            )
            .with_repository(hype_repository.clone()),
        );

        info!(
            channels = ?channels.list(),
            buffer_size = config.message_buffer_size,
            "Service container initialized"
        );

        Self {
            config,
            pool,
            window,
            aggregator,
            detector,
            metrics_registry,
            hype_registry,
            hype_repository,
            channels,
            engine,
            chat_client,
            tasks: Mutex::new(Vec::new()),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start the background tasks: the pipeline loop and, when configured, the chat
    /// client together with the ingestion task feeding its messages into the window.
    pub fn initialize(&self) {
        let mut tasks = self.tasks.lock();

        tasks.push(self.engine.clone().start(self.cancellation_token.clone()));

        if let Some(client) = &self.chat_client {
            let (tx, rx) = mpsc::channel(INGEST_CAPACITY);
            tasks.push(tokio::spawn(ingest(
                self.window.clone(),
                self.channels.clone(),
                rx,
                self.cancellation_token.clone(),
            )));

            let client = client.clone();
            let cancel = self.cancellation_token.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = client.run(tx, cancel).await {
                    error!(error = %e, "Chat client stopped");
                }
            }));
        } else {
            warn!("Running without a chat connection");
        }

        info!(tasks = tasks.len(), "Background services started");
    }

    pub fn chat_client(&self) -> Option<&Arc<TwitchChatClient>> {
        self.chat_client.as_ref()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);

        self.cancellation_token.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let shutdown_result =
            tokio::time::timeout(timeout, futures::future::join_all(tasks)).await;
        if shutdown_result.is_err() {
            warn!("Shutdown timeout reached, forcing shutdown");
        }

        info!("Closing database pool...");
        self.pool.close().await;

        info!("Services shut down");
        Ok(())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

/// Move chat messages from the chat client into the window until cancelled or the
/// sender side is gone. Messages for channels that are not monitored (for example ones
/// still in flight after a removal) are dropped.
pub async fn ingest(
    window: Arc<ChannelWindow>,
    channels: Arc<MonitoredChannels>,
    mut rx: mpsc::Receiver<ChatMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => {
                let Some(message) = message else {
                    break;
                };
                if !channels.contains(&message.channel) {
                    trace!(channel = %message.channel, "Dropping message for unmonitored channel");
                    continue;
                }
                let channel = message.channel.clone();
                window.insert(&channel, message);
            }
        }
    }
    debug!("Ingestion task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use chrono::Utc;

    fn monitored(window: &Arc<ChannelWindow>, names: &[&str]) -> Arc<MonitoredChannels> {
        Arc::new(MonitoredChannels::new(
            names.iter().map(|n| n.to_string()),
            None,
            window.clone(),
            Arc::new(BurstDetector::new(DetectorConfig::default())),
        ))
    }

    #[tokio::test]
    async fn test_ingest_moves_messages_into_window() {
        let window = Arc::new(ChannelWindow::new(10));
        let channels = monitored(&window, &["foo", "bar"]);
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ingest(window.clone(), channels, rx, cancel.clone()));

        tx.send(ChatMessage::new("Foo", "u", "one")).await.unwrap();
        tx.send(ChatMessage::new("bar", "u", "two")).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(window.len("foo"), 1);
        assert_eq!(window.len("bar"), 1);
        assert_eq!(window.query("foo", Utc::now() - chrono::Duration::seconds(5)).len(), 1);
    }

    #[tokio::test]
    async fn test_ingest_ignores_unmonitored_channels() {
        let window = Arc::new(ChannelWindow::new(10));
        let channels = monitored(&window, &["foo"]);
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ingest(window.clone(), channels, rx, cancel.clone()));

        tx.send(ChatMessage::new("foo", "u", "one")).await.unwrap();
        tx.send(ChatMessage::new("other", "u", "two")).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(window.len("foo"), 1);
        assert_eq!(window.len("other"), 0);
        assert_eq!(window.stats().total_channels, 1);
    }

    #[tokio::test]
    async fn test_late_message_after_remove_is_dropped() {
        let window = Arc::new(ChannelWindow::new(10));
        let channels = monitored(&window, &["foo"]);
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ingest(window.clone(), channels.clone(), rx, cancel.clone()));

        channels.remove("foo").await.unwrap();
        tx.send(ChatMessage::new("foo", "u", "late")).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(channels.list().is_empty());
        assert_eq!(window.len("foo"), 0);
        assert_eq!(window.stats().total_channels, 0);
    }

    #[tokio::test]
    async fn test_ingest_stops_on_cancel() {
        let window = Arc::new(ChannelWindow::new(10));
        let channels = monitored(&window, &[]);
        let (_tx, rx) = mpsc::channel::<ChatMessage>(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ingest(window, channels, rx, cancel.clone()));

        cancel.cancel();
        handle.await.unwrap();
    }
}
