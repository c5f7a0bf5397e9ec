use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{ChatSourceError, Result};
use crate::irc::{IrcEvent, parse_line};
use crate::message::{ChatMessage, normalize_channel};

/// Twitch IRC over secure WebSocket.
pub const TWITCH_IRC_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

const COMMAND_BUFFER: usize = 64;

type IrcStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The inbound chat collaborator seen by the service.
#[async_trait]
pub trait ChatSource: Send + Sync + 'static {
    /// Start receiving messages for `channel`. Joining an already joined channel is a no-op.
    async fn join_channel(&self, channel: &str) -> Result<()>;

    /// Stop receiving messages for `channel`. Leaving an unknown channel is a no-op.
    async fn leave_channel(&self, channel: &str) -> Result<()>;

    /// Currently joined channels, sorted.
    fn joined_channels(&self) -> Vec<String>;

    fn is_connected(&self) -> bool;
}

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

#[derive(Clone, Debug)]
pub struct TwitchChatConfig {
    pub url: String,
    /// OAuth token; anonymous read-only login when absent.
    pub access_token: Option<String>,
    /// Login name matching the token. Ignored for anonymous connections.
    pub nick: Option<String>,
    pub base_reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for TwitchChatConfig {
    fn default() -> Self {
        Self {
            url: TWITCH_IRC_URL.to_string(),
            access_token: None,
            nick: None,
            base_reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 60000,
            max_reconnect_attempts: None,
        }
    }
}

impl TwitchChatConfig {
    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_nick(mut self, nick: Option<String>) -> Self {
        self.nick = nick.filter(|n| !n.trim().is_empty());
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based), doubling up to the cap.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_reconnect_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_reconnect_delay_ms);
        Duration::from_millis(delay)
    }

    fn handshake(&self, channels: &[String]) -> Vec<String> {
        let mut lines = vec!["CAP REQ :twitch.tv/tags twitch.tv/commands".to_string()];

        let (pass, nick) = match &self.access_token {
            Some(token) => {
                let pass = if token.starts_with("oauth:") {
                    format!("PASS {token}")
                } else {
                    format!("PASS oauth:{token}")
                };
                let nick = self
                    .nick
                    .clone()
                    .unwrap_or_else(generate_anonymous_nick)
                    .to_lowercase();
                (pass, nick)
            }
            None => ("PASS oauth:".to_string(), generate_anonymous_nick()),
        };
        lines.push(pass);
        lines.push(format!("NICK {nick}"));

        lines.extend(channels.iter().map(|c| format!("JOIN #{c}")));
        lines
    }
}

fn generate_anonymous_nick() -> String {
    let random_num: u32 = rand::random::<u32>() % 100000;
    format!("justinfan{random_num}")
}

/// Twitch chat client.
///
/// The channel set survives reconnects: every (re)connect joins all channels in it, and
/// join/leave calls while connected are forwarded as `JOIN`/`PART` commands.
pub struct TwitchChatClient {
    config: TwitchChatConfig,
    channels: RwLock<BTreeSet<String>>,
    connected: AtomicBool,
    reconnect_count: AtomicU32,
    command_tx: mpsc::Sender<String>,
    command_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl TwitchChatClient {
    pub fn new(config: TwitchChatConfig, channels: impl IntoIterator<Item = String>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let channels = channels
            .into_iter()
            .map(|c| normalize_channel(&c))
            .filter(|c| !c.is_empty())
            .collect();

        Self {
            config,
            channels: RwLock::new(channels),
            connected: AtomicBool::new(false),
            reconnect_count: AtomicU32::new(0),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
        }
    }

    pub fn config(&self) -> &TwitchChatConfig {
        &self.config
    }

    /// Consecutive failed connection attempts since the last successful connect.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::SeqCst)
    }

    /// Connect and forward chat messages into `sink` until `cancel` fires, the sink is
    /// closed, or the reconnect attempts are exhausted. May only be called once.
    pub async fn run(
        self: Arc<Self>,
        sink: mpsc::Sender<ChatMessage>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut command_rx = self
            .command_rx
            .lock()
            .take()
            .ok_or_else(|| ChatSourceError::other("chat client is already running"))?;

        install_rustls_provider();

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connect() => result,
            };

            match connected {
                Ok((mut stream, announced)) => {
                    attempt = 0;
                    self.reconnect_count.store(0, Ordering::SeqCst);
                    self.connected.store(true, Ordering::SeqCst);

                    // Queued commands are superseded by the sync against the current set.
                    while command_rx.try_recv().is_ok() {}

                    let outcome = match self.sync_membership(&mut stream, &announced).await {
                        Ok(()) => self.session(stream, &mut command_rx, &sink, &cancel).await,
                        Err(e) => {
                            warn!(error = %e, "Failed to sync channel membership");
                            SessionEnd::Disconnected
                        }
                    };
                    self.connected.store(false, Ordering::SeqCst);

                    match outcome {
                        SessionEnd::Cancelled => break,
                        SessionEnd::SinkClosed => {
                            info!("Chat message receiver dropped, stopping chat client");
                            break;
                        }
                        SessionEnd::Disconnected => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Chat connection failed");
                }
            }

            attempt += 1;
            self.reconnect_count.store(attempt, Ordering::SeqCst);
            if let Some(max) = self.config.max_reconnect_attempts
                && attempt > max
            {
                error!(attempts = max, "Max reconnect attempts reached");
                return Err(ChatSourceError::connection(format!(
                    "gave up after {max} reconnect attempts"
                )));
            }

            let delay = self.config.reconnect_delay(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to chat");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {},
                _ = cancel.cancelled() => break,
            }
        }

        debug!("Chat client stopped");
        Ok(())
    }

    /// Open the socket and send the handshake. Returns the channels the handshake joined.
    async fn connect(&self) -> Result<(IrcStream, Vec<String>)> {
        info!(url = %self.config.url, "Connecting to chat");
        let (mut stream, _) = connect_async(self.config.url.as_str()).await?;

        let channels = self.joined_channels();
        for line in self.config.handshake(&channels) {
            stream.send(Message::Text(line.into())).await?;
        }

        info!(channels = ?channels, "Connected to chat");
        Ok((stream, channels))
    }

    /// Commands that bring the server in line with the channel set after a handshake
    /// that joined `announced`. Joins and leaves made while the handshake was in flight
    /// were not forwarded, since the client was not yet connected.
    fn membership_commands(&self, announced: &[String]) -> Vec<String> {
        let current = self.channels.read();
        let joins = current
            .iter()
            .filter(|c| !announced.contains(*c))
            .map(|c| format!("JOIN #{c}"));
        let parts = announced
            .iter()
            .filter(|c| !current.contains(*c))
            .map(|c| format!("PART #{c}"));
        joins.chain(parts).collect()
    }

    async fn sync_membership(&self, stream: &mut IrcStream, announced: &[String]) -> Result<()> {
        for command in self.membership_commands(announced) {
            debug!(%command, "Syncing channel membership");
            stream.send(Message::Text(command.into())).await?;
        }
        Ok(())
    }

    async fn session(
        &self,
        mut stream: IrcStream,
        command_rx: &mut mpsc::Receiver<String>,
        sink: &mpsc::Sender<ChatMessage>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = stream.close(None).await;
                    return SessionEnd::Cancelled;
                }

                Some(command) = command_rx.recv() => {
                    trace!(%command, "Sending chat command");
                    if let Err(e) = stream.send(Message::Text(command.into())).await {
                        error!(error = %e, "Failed to send chat command");
                        return SessionEnd::Disconnected;
                    }
                }

                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("Chat connection closed");
                            return SessionEnd::Disconnected;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            error!(error = %e, "Chat WebSocket error");
                            return SessionEnd::Disconnected;
                        }
                    };

                    for line in text.as_str().split("\r\n").filter(|l| !l.is_empty()) {
                        match parse_line(line) {
                            Ok(Some(IrcEvent::Message(message))) => {
                                if sink.send(message).await.is_err() {
                                    return SessionEnd::SinkClosed;
                                }
                            }
                            Ok(Some(IrcEvent::Ping(payload))) => {
                                let pong = format!("PONG {payload}");
                                if let Err(e) = stream.send(Message::Text(pong.into())).await {
                                    error!(error = %e, "Failed to answer PING");
                                    return SessionEnd::Disconnected;
                                }
                            }
                            Ok(Some(IrcEvent::Reconnect)) => {
                                info!("Server requested reconnect");
                                let _ = stream.close(None).await;
                                return SessionEnd::Disconnected;
                            }
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, line, "Dropping malformed chat line"),
                        }
                    }
                }
            }
        }
    }

    async fn send_command(&self, command: String) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ChatSourceError::connection("chat client is not running"))
    }
}

enum SessionEnd {
    Cancelled,
    SinkClosed,
    Disconnected,
}

#[async_trait]
impl ChatSource for TwitchChatClient {
    async fn join_channel(&self, channel: &str) -> Result<()> {
        let channel = normalize_channel(channel);
        if channel.is_empty() {
            return Err(ChatSourceError::other("channel name is empty"));
        }
        if !self.channels.write().insert(channel.clone()) {
            return Ok(());
        }

        self.send_command(format!("JOIN #{channel}")).await?;
        info!(%channel, "Joined channel");
        Ok(())
    }

    async fn leave_channel(&self, channel: &str) -> Result<()> {
        let channel = normalize_channel(channel);
        if !self.channels.write().remove(&channel) {
            return Ok(());
        }

        self.send_command(format!("PART #{channel}")).await?;
        info!(%channel, "Left channel");
        Ok(())
    }

    fn joined_channels(&self) -> Vec<String> {
        self.channels.read().iter().cloned().collect()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 1000)]
    #[case(2, 2000)]
    #[case(3, 4000)]
    #[case(6, 32000)]
    #[case(7, 60000)]
    #[case(50, 60000)]
    fn test_reconnect_delay_backoff(#[case] attempt: u32, #[case] expected_ms: u64) {
        let config = TwitchChatConfig::default();
        assert_eq!(
            config.reconnect_delay(attempt),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn test_anonymous_handshake() {
        let config = TwitchChatConfig::default();
        let lines = config.handshake(&["foo".to_string(), "bar".to_string()]);

        assert_eq!(lines[0], "CAP REQ :twitch.tv/tags twitch.tv/commands");
        assert_eq!(lines[1], "PASS oauth:");
        assert!(lines[2].starts_with("NICK justinfan"));
        assert_eq!(&lines[3..], ["JOIN #foo", "JOIN #bar"]);
    }

    #[test]
    fn test_authenticated_handshake_adds_oauth_prefix() {
        let config = TwitchChatConfig::default()
            .with_access_token(Some("abc123".to_string()))
            .with_nick(Some("MyBot".to_string()));
        let lines = config.handshake(&[]);

        assert_eq!(lines[1], "PASS oauth:abc123");
        assert_eq!(lines[2], "NICK mybot");
        assert_eq!(lines.len(), 3);

        let config = TwitchChatConfig::default().with_access_token(Some("oauth:xyz".to_string()));
        assert_eq!(config.handshake(&[])[1], "PASS oauth:xyz");
    }

    #[test]
    fn test_blank_token_is_anonymous() {
        let config = TwitchChatConfig::default().with_access_token(Some("  ".to_string()));
        assert!(config.access_token.is_none());
    }

    #[tokio::test]
    async fn test_join_and_leave_while_disconnected() {
        let client = TwitchChatClient::new(
            TwitchChatConfig::default(),
            vec!["#Seed".to_string(), String::new()],
        );
        assert_eq!(client.joined_channels(), vec!["seed"]);
        assert!(!client.is_connected());

        client.join_channel("Other").await.unwrap();
        client.join_channel("other").await.unwrap();
        assert_eq!(client.joined_channels(), vec!["other", "seed"]);

        client.leave_channel("SEED").await.unwrap();
        client.leave_channel("missing").await.unwrap();
        assert_eq!(client.joined_channels(), vec!["other"]);

        assert!(client.join_channel("  ").await.is_err());
    }

    #[tokio::test]
    async fn test_membership_changes_during_handshake_are_resent() {
        let client = TwitchChatClient::new(
            TwitchChatConfig::default(),
            vec!["foo".to_string(), "gone".to_string()],
        );
        let announced = client.joined_channels();
        assert!(client.membership_commands(&announced).is_empty());

        client.join_channel("bar").await.unwrap();
        client.leave_channel("gone").await.unwrap();
        assert_eq!(
            client.membership_commands(&announced),
            vec!["JOIN #bar", "PART #gone"]
        );
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let client = Arc::new(TwitchChatClient::new(TwitchChatConfig::default(), vec![]));
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        client.clone().run(tx.clone(), cancel.clone()).await.unwrap();
        assert!(client.run(tx, cancel).await.is_err());
    }
}
