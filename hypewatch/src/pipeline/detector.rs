//! Velocity burst ("hype") detection against a rolling baseline.
//!
//! Per channel the detector keeps the velocity samples of the last `window` plus the time
//! of the last emitted event. A velocity fires when it is above the noise floor, the
//! channel is out of cooldown, enough samples exist and it exceeds
//! `mean + threshold_std * std` of the retained samples.

use std::collections::VecDeque;

use chat_source::normalize_channel;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::metrics::{EmoteCount, round_to};
use crate::config::DetectorConfig;

/// A detected burst.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypeEvent {
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    pub velocity: f64,
    pub baseline_mean: f64,
    pub baseline_std: f64,
    /// `velocity / baseline_mean`, or the velocity itself when the mean is zero.
    pub multiplier: f64,
    pub top_emotes: Vec<EmoteCount>,
}

/// Detector lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorState {
    /// Not enough samples to judge.
    Cold,
    /// Tracking a baseline, ready to fire.
    Warm,
    /// A burst fired recently; new ones are suppressed.
    Cooldown,
}

/// Read-only view of a channel's baseline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaselineSnapshot {
    pub channel: String,
    pub mean: f64,
    pub std: f64,
    pub samples: usize,
    pub state: DetectorState,
    pub last_burst: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ChannelBaseline {
    samples: VecDeque<(DateTime<Utc>, f64)>,
    last_burst: Option<DateTime<Utc>>,
}

impl ChannelBaseline {
    fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        while self.samples.front().is_some_and(|(ts, _)| *ts < cutoff) {
            self.samples.pop_front();
        }
    }

    fn in_cooldown(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        self.last_burst.is_some_and(|last| now - last < cooldown)
    }

    fn values(&self) -> impl Iterator<Item = f64> + Clone + '_ {
        self.samples.iter().map(|(_, v)| *v)
    }
}

pub struct BurstDetector {
    config: DetectorConfig,
    window: Duration,
    cooldown: Duration,
    channels: DashMap<String, ChannelBaseline>,
}

impl BurstDetector {
    pub fn new(config: DetectorConfig) -> Self {
        let window = Duration::from_std(config.window).unwrap_or(Duration::seconds(60));
        let cooldown = Duration::from_std(config.cooldown).unwrap_or(Duration::seconds(30));
        Self {
            config,
            window,
            cooldown,
            channels: DashMap::new(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Append a velocity sample and drop samples older than the baseline window.
    pub fn record_velocity(&self, channel: &str, velocity: f64, now: DateTime<Utc>) {
        let mut baseline = self.channels.entry(normalize_channel(channel)).or_default();
        baseline.samples.push_back((now, velocity));
        baseline.evict_before(now - self.window);
    }

    /// Decide whether `velocity` is a burst. Emitting an event starts the cooldown.
    pub fn check_for_burst(
        &self,
        channel: &str,
        velocity: f64,
        top_emotes: &[EmoteCount],
        now: DateTime<Utc>,
    ) -> Option<HypeEvent> {
        let channel = normalize_channel(channel);
        let mut baseline = self.channels.get_mut(&channel)?;

        if baseline.in_cooldown(now, self.cooldown) {
            return None;
        }
        if velocity < self.config.min_velocity {
            return None;
        }
        if baseline.samples.len() < self.config.min_samples.max(2) {
            return None;
        }

        let (mean, std) = mean_and_std(baseline.values())?;
        let std = if std == 0.0 { self.config.std_epsilon } else { std };
        let threshold = mean + self.config.threshold_std * std;

        if velocity <= threshold {
            return None;
        }

        let multiplier = if mean > 0.0 { velocity / mean } else { velocity };
        baseline.last_burst = Some(now);
        drop(baseline);

        info!(
            %channel,
            velocity,
            mean = round_to(mean, 1),
            std = round_to(std, 1),
            threshold = round_to(threshold, 1),
            multiplier = round_to(multiplier, 1),
            "Hype detected"
        );

        Some(HypeEvent {
            channel,
            timestamp: now,
            velocity,
            baseline_mean: round_to(mean, 2),
            baseline_std: round_to(std, 2),
            multiplier: round_to(multiplier, 2),
            top_emotes: top_emotes.to_vec(),
        })
    }

    /// `(mean, std)` of the retained samples, rounded to 2 decimals; `(0, 0)` below two
    /// samples.
    pub fn baseline(&self, channel: &str) -> (f64, f64) {
        self.channels
            .get(&normalize_channel(channel))
            .and_then(|b| mean_and_std(b.values()))
            .map(|(mean, std)| (round_to(mean, 2), round_to(std, 2)))
            .unwrap_or((0.0, 0.0))
    }

    pub fn state(&self, channel: &str, now: DateTime<Utc>) -> DetectorState {
        let Some(baseline) = self.channels.get(&normalize_channel(channel)) else {
            return DetectorState::Cold;
        };
        if baseline.in_cooldown(now, self.cooldown) {
            DetectorState::Cooldown
        } else if baseline.samples.len() < self.config.min_samples.max(2) {
            DetectorState::Cold
        } else {
            DetectorState::Warm
        }
    }

    pub fn snapshot(&self, channel: &str, now: DateTime<Utc>) -> BaselineSnapshot {
        let channel = normalize_channel(channel);
        let (mean, std) = self.baseline(&channel);
        let (samples, last_burst) = self
            .channels
            .get(&channel)
            .map(|b| (b.samples.len(), b.last_burst))
            .unwrap_or((0, None));

        BaselineSnapshot {
            state: self.state(&channel, now),
            channel,
            mean,
            std,
            samples,
            last_burst,
        }
    }

    /// Forget samples and cooldown for a channel.
    pub fn reset(&self, channel: &str) {
        let channel = normalize_channel(channel);
        if self.channels.remove(&channel).is_some() {
            debug!(%channel, "Detector state reset");
        }
    }

    /// Channels with detector state, sorted.
    pub fn tracked_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        channels.sort();
        channels
    }
}

/// Mean and Bessel-corrected sample standard deviation. `None` below two values.
fn mean_and_std(values: impl Iterator<Item = f64> + Clone) -> Option<(f64, f64)> {
    let n = values.clone().count();
    if n < 2 {
        return None;
    }
    let mean = values.clone().sum::<f64>() / n as f64;
    let variance = values.map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    Some((mean, variance.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn detector() -> BurstDetector {
        BurstDetector::new(DetectorConfig::default())
    }

    /// Record `count` samples of `value`, one per second, ending at `end`.
    fn warm_up(
        detector: &BurstDetector,
        channel: &str,
        value: f64,
        count: i64,
        end: DateTime<Utc>,
    ) {
        for i in (0..count).rev() {
            detector.record_velocity(channel, value, end - Duration::seconds(i));
        }
    }

    #[test]
    fn test_flat_baseline_uses_epsilon() {
        let detector = detector();
        let now = Utc::now();
        warm_up(&detector, "c", 10.0, 12, now - Duration::seconds(1));

        let event = detector
            .check_for_burst("c", 10.3, &[], now)
            .expect("10.3 is above 10.0 + 2 * 0.1");
        assert_eq!(event.baseline_mean, 10.0);
        assert_eq!(event.baseline_std, 0.1);
        assert_eq!(event.multiplier, 1.03);
        assert_eq!(event.velocity, 10.3);
        assert_eq!(event.timestamp, now);
    }

    #[test]
    fn test_flat_baseline_below_epsilon_threshold() {
        let detector = detector();
        let now = Utc::now();
        warm_up(&detector, "c", 10.0, 12, now - Duration::seconds(1));

        assert!(detector.check_for_burst("c", 10.15, &[], now).is_none());
    }

    #[test]
    fn test_cooldown_gate() {
        let detector = detector();
        let t = Utc::now();
        warm_up(&detector, "c", 6.0, 20, t - Duration::seconds(1));

        assert!(detector.check_for_burst("c", 50.0, &[], t).is_some());
        assert_eq!(detector.state("c", t), DetectorState::Cooldown);

        let t29 = t + Duration::seconds(29);
        assert!(detector.check_for_burst("c", 500.0, &[], t29).is_none());

        let t31 = t + Duration::seconds(31);
        warm_up(&detector, "c", 6.0, 20, t31 - Duration::seconds(1));
        assert!(detector.check_for_burst("c", 50.0, &[], t31).is_some());
    }

    #[rstest]
    #[case(0.0)]
    #[case(1.0)]
    #[case(4.99)]
    fn test_noise_floor(#[case] velocity: f64) {
        let detector = detector();
        let now = Utc::now();
        warm_up(&detector, "c", 0.0, 30, now - Duration::seconds(1));

        assert!(detector.check_for_burst("c", velocity, &[], now).is_none());
    }

    #[test]
    fn test_noise_floor_with_no_baseline() {
        let detector = detector();
        assert!(detector.check_for_burst("empty", 1.0, &[], Utc::now()).is_none());
    }

    #[test]
    fn test_requires_ten_samples() {
        let detector = detector();
        let now = Utc::now();
        warm_up(&detector, "c", 1.0, 9, now - Duration::seconds(1));

        assert_eq!(detector.state("c", now), DetectorState::Cold);
        assert!(detector.check_for_burst("c", 100.0, &[], now).is_none());

        detector.record_velocity("c", 1.0, now);
        assert_eq!(detector.state("c", now), DetectorState::Warm);
        assert!(detector.check_for_burst("c", 100.0, &[], now).is_some());
    }

    #[test]
    fn test_zero_mean_multiplier_is_velocity() {
        let detector = detector();
        let now = Utc::now();
        warm_up(&detector, "c", 0.0, 15, now - Duration::seconds(1));

        let event = detector.check_for_burst("c", 7.0, &[], now).unwrap();
        assert_eq!(event.multiplier, 7.0);
    }

    #[test]
    fn test_samples_outside_window_are_evicted() {
        let detector = detector();
        let now = Utc::now();
        detector.record_velocity("c", 100.0, now - Duration::seconds(120));
        warm_up(&detector, "c", 2.0, 5, now);

        assert_eq!(detector.snapshot("c", now).samples, 5);
        assert_eq!(detector.baseline("c"), (2.0, 0.0));
    }

    #[test]
    fn test_baseline_uses_sample_std() {
        let detector = detector();
        let now = Utc::now();
        for (i, v) in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0].iter().enumerate() {
            detector.record_velocity("c", *v, now + Duration::milliseconds(i as i64));
        }
        // population std is 2.0; sample std is sqrt(32 / 7)
        assert_eq!(detector.baseline("c"), (5.0, 2.14));
    }

    #[test]
    fn test_baseline_needs_two_samples() {
        let detector = detector();
        assert_eq!(detector.baseline("unknown"), (0.0, 0.0));
        detector.record_velocity("c", 3.0, Utc::now());
        assert_eq!(detector.baseline("c"), (0.0, 0.0));
    }

    #[test]
    fn test_top_emotes_are_carried() {
        let detector = detector();
        let now = Utc::now();
        warm_up(&detector, "c", 5.0, 12, now - Duration::seconds(1));
        let emotes = vec![("PogChamp".to_string(), 12)];

        let event = detector.check_for_burst("c", 40.0, &emotes, now).unwrap();
        assert_eq!(event.top_emotes, emotes);
    }

    #[test]
    fn test_reset_clears_state() {
        let detector = detector();
        let now = Utc::now();
        warm_up(&detector, "Chan", 6.0, 12, now - Duration::seconds(1));
        assert!(detector.check_for_burst("chan", 60.0, &[], now).is_some());
        assert_eq!(detector.tracked_channels(), vec!["chan"]);

        detector.reset("CHAN");
        assert!(detector.tracked_channels().is_empty());
        assert_eq!(detector.state("chan", now), DetectorState::Cold);
        assert_eq!(detector.snapshot("chan", now).last_burst, None);
    }
}
