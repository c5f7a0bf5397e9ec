//! Fan-out of serialized updates to live subscribers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Default per-sink delivery timeout.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Identity of a registered sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(Uuid);

impl SinkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A serialized update together with the channel it concerns.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub channel: String,
    pub body: Arc<str>,
}

impl Payload {
    pub fn new(channel: impl Into<String>, body: impl Into<Arc<str>>) -> Self {
        Self {
            channel: channel.into(),
            body: body.into(),
        }
    }
}

/// A live subscriber.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    fn id(&self) -> SinkId;

    /// Whether this sink wants `payload` at all. Skipped payloads are not failures.
    fn accepts(&self, _payload: &Payload) -> bool {
        true
    }

    /// Attempt delivery. An error marks the sink as dead.
    async fn deliver(&self, payload: &Payload) -> Result<()>;

    /// Called once a registry drops the sink after a failed delivery. A sink registered
    /// with several registries uses this to tear down all of its registrations.
    fn close(&self) {}
}

/// Sink backed by a bounded queue, drained by a connection writer task.
pub struct ChannelSink {
    id: SinkId,
    channel: Option<String>,
    tx: mpsc::Sender<Arc<str>>,
    closed: CancellationToken,
}

impl ChannelSink {
    /// Sink for every payload, plus the receiving end of its queue.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: SinkId::new(),
                channel: None,
                tx,
                closed: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Sink that only accepts payloads for `channel`.
    pub fn scoped(
        channel: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (mut sink, rx) = Self::new(capacity);
        sink.channel = Some(channel.into());
        (sink, rx)
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    /// Fires when any registry drops this sink; the queue's reader should stop then.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[async_trait]
impl Sink for ChannelSink {
    fn id(&self) -> SinkId {
        self.id
    }

    fn accepts(&self, payload: &Payload) -> bool {
        self.channel
            .as_deref()
            .is_none_or(|channel| channel == payload.channel)
    }

    async fn deliver(&self, payload: &Payload) -> Result<()> {
        self.tx
            .send(payload.body.clone())
            .await
            .map_err(|_| Error::sink("subscriber queue closed"))
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub skipped: usize,
    /// Sinks that failed and were unregistered.
    pub failed: usize,
}

/// The set of live subscribers for one kind of update.
pub struct BroadcastRegistry {
    name: &'static str,
    send_timeout: Duration,
    sinks: RwLock<HashMap<SinkId, Arc<dyn Sink>>>,
}

impl BroadcastRegistry {
    pub fn new(name: &'static str, send_timeout: Duration) -> Self {
        Self {
            name,
            send_timeout,
            sinks: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Add a sink. Registering the same id again replaces the entry.
    pub fn register(&self, sink: Arc<dyn Sink>) -> SinkId {
        let id = sink.id();
        let count = {
            let mut sinks = self.sinks.write();
            sinks.insert(id, sink);
            sinks.len()
        };
        info!(registry = self.name, sink = %id, count, "Subscriber registered");
        id
    }

    /// Remove a sink. Unknown ids are ignored.
    pub fn unregister(&self, id: SinkId) -> bool {
        let (removed, count) = {
            let mut sinks = self.sinks.write();
            let removed = sinks.remove(&id).is_some();
            (removed, sinks.len())
        };
        if removed {
            info!(registry = self.name, sink = %id, count, "Subscriber unregistered");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.sinks.read().len()
    }

    /// Push `payload` to every interested sink concurrently.
    ///
    /// Each delivery is bounded by the send timeout. Sinks that fail or time out are
    /// unregistered; the others are unaffected.
    pub async fn broadcast(&self, payload: &Payload) -> BroadcastReport {
        let sinks: Vec<Arc<dyn Sink>> = self.sinks.read().values().cloned().collect();
        if sinks.is_empty() {
            return BroadcastReport::default();
        }

        let mut report = BroadcastReport::default();
        let targets: Vec<Arc<dyn Sink>> = sinks
            .into_iter()
            .filter(|sink| {
                let accepted = sink.accepts(payload);
                if !accepted {
                    report.skipped += 1;
                }
                accepted
            })
            .collect();

        let deliveries = targets.iter().map(|sink| async move {
            let outcome = match tokio::time::timeout(self.send_timeout, sink.deliver(payload)).await
            {
                Ok(result) => result,
                Err(_) => Err(Error::sink(format!(
                    "delivery timed out after {:?}",
                    self.send_timeout
                ))),
            };
            (sink, outcome)
        });

        for (sink, outcome) in join_all(deliveries).await {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    let id = sink.id();
                    debug!(registry = self.name, sink = %id, error = %e, "Dropping subscriber");
                    self.unregister(id);
                    sink.close();
                    report.failed += 1;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingSink {
        id: SinkId,
        received: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: SinkId::new(),
                received: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn id(&self) -> SinkId {
            self.id
        }

        async fn deliver(&self, payload: &Payload) -> Result<()> {
            self.received.lock().push(payload.body.to_string());
            Ok(())
        }
    }

    struct FailingSink(SinkId);

    #[async_trait]
    impl Sink for FailingSink {
        fn id(&self) -> SinkId {
            self.0
        }

        async fn deliver(&self, _payload: &Payload) -> Result<()> {
            Err(Error::sink("connection reset"))
        }
    }

    struct StalledSink(SinkId);

    #[async_trait]
    impl Sink for StalledSink {
        fn id(&self) -> SinkId {
            self.0
        }

        async fn deliver(&self, _payload: &Payload) -> Result<()> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    fn payload(channel: &str, body: &str) -> Payload {
        Payload::new(channel, body)
    }

    #[tokio::test]
    async fn test_failing_sink_is_isolated() {
        let registry = BroadcastRegistry::new("metrics", DEFAULT_SEND_TIMEOUT);
        let a = RecordingSink::new();
        let b = RecordingSink::new();
        let failing_id = SinkId::new();
        registry.register(a.clone());
        registry.register(Arc::new(FailingSink(failing_id)));
        registry.register(b.clone());
        assert_eq!(registry.count(), 3);

        let report = registry.broadcast(&payload("c", "hello")).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(registry.count(), 2);
        assert_eq!(*a.received.lock(), vec!["hello"]);
        assert_eq!(*b.received.lock(), vec!["hello"]);
        assert!(!registry.unregister(failing_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_sink_times_out() {
        let registry = BroadcastRegistry::new("hype", Duration::from_millis(500));
        let healthy = RecordingSink::new();
        registry.register(healthy.clone());
        registry.register(Arc::new(StalledSink(SinkId::new())));

        let started = tokio::time::Instant::now();
        let report = registry.broadcast(&payload("c", "x")).await;

        assert_eq!(started.elapsed(), Duration::from_millis(500));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(registry.count(), 1);
        assert_eq!(healthy.received.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_register_is_idempotent_and_unregister_tolerant() {
        let registry = BroadcastRegistry::new("metrics", DEFAULT_SEND_TIMEOUT);
        let sink = RecordingSink::new();

        let id = registry.register(sink.clone());
        registry.register(sink.clone());
        assert_eq!(registry.count(), 1);

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert_eq!(registry.count(), 0);

        let report = registry.broadcast(&payload("c", "nobody")).await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_to_queue() {
        let registry = BroadcastRegistry::new("metrics", DEFAULT_SEND_TIMEOUT);
        let (sink, mut rx) = ChannelSink::new(8);
        registry.register(Arc::new(sink));

        registry.broadcast(&payload("a", "one")).await;
        registry.broadcast(&payload("b", "two")).await;

        assert_eq!(&*rx.recv().await.unwrap(), "one");
        assert_eq!(&*rx.recv().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn test_scoped_sink_filters_channels() {
        let registry = BroadcastRegistry::new("metrics", DEFAULT_SEND_TIMEOUT);
        let (sink, mut rx) = ChannelSink::scoped("a", 8);
        assert_eq!(sink.channel(), Some("a"));
        registry.register(Arc::new(sink));

        let skipped = registry.broadcast(&payload("b", "other")).await;
        assert_eq!(skipped.skipped, 1);
        assert_eq!(skipped.delivered, 0);

        registry.broadcast(&payload("a", "mine")).await;
        assert_eq!(&*rx.recv().await.unwrap(), "mine");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_sink_is_dropped() {
        let registry = BroadcastRegistry::new("metrics", DEFAULT_SEND_TIMEOUT);
        let (sink, rx) = ChannelSink::new(1);
        registry.register(Arc::new(sink));
        drop(rx);

        let report = registry.broadcast(&payload("a", "gone")).await;
        assert_eq!(report.failed, 1);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_channel_sink_times_out() {
        let registry = BroadcastRegistry::new("metrics", Duration::from_millis(100));
        let (sink, _rx) = ChannelSink::new(1);
        registry.register(Arc::new(sink));

        assert_eq!(registry.broadcast(&payload("a", "1")).await.delivered, 1);
        assert_eq!(registry.broadcast(&payload("a", "2")).await.failed, 1);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_channel_sink_is_closed() {
        let registry = BroadcastRegistry::new("metrics", Duration::from_secs(1));
        let (sink, rx) = ChannelSink::new(4);
        let closed = sink.closed();
        registry.register(Arc::new(sink));

        registry.broadcast(&payload("a", "1")).await;
        assert!(!closed.is_cancelled());

        drop(rx);
        registry.broadcast(&payload("a", "2")).await;
        assert!(closed.is_cancelled());
    }
}
