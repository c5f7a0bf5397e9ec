//! Environment-driven service configuration.
//!
//! Every setting is optional. Values that fail to parse are reported with a warning and
//! replaced by the default; [`AppConfig::validate`] rejects values that parse but make no
//! sense (zero capacity, non-positive thresholds, ...).

use std::str::FromStr;
use std::time::Duration;

use chat_source::normalize_channel;
use tracing::warn;

use crate::error::{Error, Result};

/// Burst detector tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Length of the rolling baseline window.
    pub window: Duration,
    /// Number of standard deviations above the mean that counts as a burst.
    pub threshold_std: f64,
    /// Minimum time between two bursts on the same channel.
    pub cooldown: Duration,
    /// Velocities below this never trigger.
    pub min_velocity: f64,
    /// Samples required before the baseline is trusted.
    pub min_samples: usize,
    /// Substituted for a zero standard deviation.
    pub std_epsilon: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            threshold_std: 2.0,
            cooldown: Duration::from_secs(30),
            min_velocity: 5.0,
            min_samples: 10,
            std_epsilon: 0.1,
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Events retained per channel.
    pub message_buffer_size: usize,
    pub detector: DetectorConfig,
    pub top_emotes_limit: usize,
    pub tick_interval: Duration,
    /// Per-sink delivery timeout.
    pub sink_send_timeout: Duration,
    /// Channels monitored from startup, normalized.
    pub default_channels: Vec<String>,
    pub twitch_access_token: Option<String>,
    pub twitch_nick: Option<String>,
    pub database_url: String,
    pub api_bind_address: String,
    pub api_port: u16,
    /// Allowed CORS origins; `*` allows any.
    pub cors_origins: Vec<String>,
    pub log_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            message_buffer_size: 10_000,
            detector: DetectorConfig::default(),
            top_emotes_limit: 10,
            tick_interval: Duration::from_millis(1000),
            sink_send_timeout: Duration::from_millis(2000),
            default_channels: Vec::new(),
            twitch_access_token: None,
            twitch_nick: None,
            database_url: "sqlite:hypewatch.db?mode=rwc".to_string(),
            api_bind_address: "0.0.0.0".to_string(),
            api_port: 8000,
            cors_origins: vec!["*".to_string()],
            log_dir: "logs".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the process environment.
    ///
    /// Supported env vars:
    /// - `MESSAGE_BUFFER_SIZE`, `TOP_EMOTES_LIMIT`
    /// - `HYPE_WINDOW_SECONDS`, `HYPE_THRESHOLD_STD`, `HYPE_COOLDOWN_SECONDS`, `HYPE_MIN_VELOCITY`
    /// - `TICK_INTERVAL_MS`, `SINK_SEND_TIMEOUT_MS`
    /// - `DEFAULT_CHANNELS` (comma separated)
    /// - `TWITCH_ACCESS_TOKEN`, `TWITCH_NICK`
    /// - `DATABASE_URL`, `API_BIND_ADDRESS`, `API_PORT`, `CORS_ORIGINS`, `LOG_DIR`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let detector = DetectorConfig {
            window: Duration::from_secs(parse_or(
                &get,
                "HYPE_WINDOW_SECONDS",
                defaults.detector.window.as_secs(),
            )),
            threshold_std: parse_or(&get, "HYPE_THRESHOLD_STD", defaults.detector.threshold_std),
            cooldown: Duration::from_secs(parse_or(
                &get,
                "HYPE_COOLDOWN_SECONDS",
                defaults.detector.cooldown.as_secs(),
            )),
            min_velocity: parse_or(&get, "HYPE_MIN_VELOCITY", defaults.detector.min_velocity),
            ..defaults.detector.clone()
        };

        Self {
            message_buffer_size: parse_or(
                &get,
                "MESSAGE_BUFFER_SIZE",
                defaults.message_buffer_size,
            ),
            detector,
            top_emotes_limit: parse_or(&get, "TOP_EMOTES_LIMIT", defaults.top_emotes_limit),
            tick_interval: Duration::from_millis(parse_or(
                &get,
                "TICK_INTERVAL_MS",
                defaults.tick_interval.as_millis() as u64,
            )),
            sink_send_timeout: Duration::from_millis(parse_or(
                &get,
                "SINK_SEND_TIMEOUT_MS",
                defaults.sink_send_timeout.as_millis() as u64,
            )),
            default_channels: get("DEFAULT_CHANNELS")
                .map(|v| split_channels(&v))
                .unwrap_or_default(),
            twitch_access_token: get("TWITCH_ACCESS_TOKEN").map(|v| v.trim().to_string()),
            twitch_nick: get("TWITCH_NICK").map(|v| v.trim().to_string()),
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            api_bind_address: get("API_BIND_ADDRESS").unwrap_or(defaults.api_bind_address),
            api_port: parse_or(&get, "API_PORT", defaults.api_port),
            cors_origins: get("CORS_ORIGINS")
                .map(|v| split_list(&v))
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.cors_origins),
            log_dir: get("LOG_DIR").unwrap_or(defaults.log_dir),
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.message_buffer_size == 0 {
            return Err(Error::config("MESSAGE_BUFFER_SIZE must be greater than 0"));
        }
        if self.detector.window.is_zero() {
            return Err(Error::config("HYPE_WINDOW_SECONDS must be greater than 0"));
        }
        if !(self.detector.threshold_std.is_finite() && self.detector.threshold_std > 0.0) {
            return Err(Error::config("HYPE_THRESHOLD_STD must be a positive number"));
        }
        if !(self.detector.min_velocity.is_finite() && self.detector.min_velocity >= 0.0) {
            return Err(Error::config("HYPE_MIN_VELOCITY must not be negative"));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::config("TICK_INTERVAL_MS must be greater than 0"));
        }
        if self.sink_send_timeout.is_zero() {
            return Err(Error::config("SINK_SEND_TIMEOUT_MS must be greater than 0"));
        }
        Ok(())
    }

    /// Whether any origin is allowed.
    pub fn cors_allow_any(&self) -> bool {
        self.cors_origins.iter().any(|o| o == "*")
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Debug,
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, default = ?default, "Invalid config value, using default");
            default
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn split_channels(raw: &str) -> Vec<String> {
    let mut channels: Vec<String> = Vec::new();
    for channel in raw.split(',').map(normalize_channel) {
        if !channel.is_empty() && !channels.contains(&channel) {
            channels.push(channel);
        }
    }
    channels
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> AppConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]);
        assert_eq!(config.message_buffer_size, 10_000);
        assert_eq!(config.detector, DetectorConfig::default());
        assert_eq!(config.top_emotes_limit, 10);
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.api_port, 8000);
        assert!(config.default_channels.is_empty());
        assert!(config.twitch_access_token.is_none());
        assert!(config.cors_allow_any());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("MESSAGE_BUFFER_SIZE", "500"),
            ("HYPE_WINDOW_SECONDS", "120"),
            ("HYPE_THRESHOLD_STD", "3.5"),
            ("HYPE_COOLDOWN_SECONDS", "10"),
            ("HYPE_MIN_VELOCITY", "2"),
            ("DEFAULT_CHANNELS", " #Foo, bar,,foo "),
            ("TWITCH_ACCESS_TOKEN", "abc"),
            ("CORS_ORIGINS", "http://a.test, http://b.test"),
            ("API_PORT", "9000"),
        ]);

        assert_eq!(config.message_buffer_size, 500);
        assert_eq!(config.detector.window, Duration::from_secs(120));
        assert_eq!(config.detector.threshold_std, 3.5);
        assert_eq!(config.detector.cooldown, Duration::from_secs(10));
        assert_eq!(config.detector.min_velocity, 2.0);
        assert_eq!(config.default_channels, vec!["foo", "bar"]);
        assert_eq!(config.twitch_access_token.as_deref(), Some("abc"));
        assert_eq!(config.cors_origins, vec!["http://a.test", "http://b.test"]);
        assert!(!config.cors_allow_any());
        assert_eq!(config.api_port, 9000);
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let config = from_pairs(&[
            ("MESSAGE_BUFFER_SIZE", "lots"),
            ("HYPE_THRESHOLD_STD", "two"),
            ("API_PORT", "99999"),
            ("TWITCH_ACCESS_TOKEN", "   "),
        ]);
        assert_eq!(config.message_buffer_size, 10_000);
        assert_eq!(config.detector.threshold_std, 2.0);
        assert_eq!(config.api_port, 8000);
        assert!(config.twitch_access_token.is_none());
    }

    #[test]
    fn test_validate_rejects_unusable_values() {
        assert!(from_pairs(&[("MESSAGE_BUFFER_SIZE", "0")]).validate().is_err());
        assert!(from_pairs(&[("HYPE_THRESHOLD_STD", "0")]).validate().is_err());
        assert!(from_pairs(&[("HYPE_THRESHOLD_STD", "-1.5")]).validate().is_err());
        assert!(from_pairs(&[("TICK_INTERVAL_MS", "0")]).validate().is_err());
        assert!(from_pairs(&[("HYPE_WINDOW_SECONDS", "0")]).validate().is_err());
    }
}
