//! Exponential backoff with jitter and an elapsed-time budget.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Backoff parameters for reconnecting to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Factor applied to the delay after each attempt.
    pub multiplier: f64,
    /// Upper bound on a single delay.
    pub max_interval: Duration,
    /// Total time allowed before giving up.
    pub max_elapsed: Duration,
    /// Each delay is drawn from `interval * (1 ± randomization)`.
    pub randomization: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(15),
            max_elapsed: Duration::from_secs(60),
            randomization: 0.5,
        }
    }
}

impl BackoffConfig {
    /// Same parameters without jitter, for deterministic schedules.
    pub fn without_jitter(mut self) -> Self {
        self.randomization = 0.0;
        self
    }
}

/// One run of retries. Create a new one per disconnect.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
    started: Instant,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial_interval,
            started: Instant::now(),
            config,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Budget left before giving up.
    pub fn remaining(&self) -> Duration {
        self.config.max_elapsed.saturating_sub(self.elapsed())
    }

    /// Delay before the next attempt, or `None` once waiting that long would
    /// exceed the elapsed-time budget.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.randomized(self.current);
        if self.elapsed() + delay > self.config.max_elapsed {
            return None;
        }

        self.current = self
            .current
            .mul_f64(self.config.multiplier)
            .min(self.config.max_interval);
        Some(delay)
    }

    fn randomized(&self, interval: Duration) -> Duration {
        let spread = self.config.randomization.clamp(0.0, 1.0);
        if spread == 0.0 {
            return interval;
        }
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        interval.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_secs).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn full_backoff_sequence() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig::default().without_jitter());
        let mut delays = Vec::new();

        while let Some(delay) = backoff.next_delay() {
            delays.push(delay);
            tokio::time::sleep(delay).await;
        }

        // 1 + 2 + 4 + 8 + 15 + 15 + 15 = 60; one more would overshoot.
        assert_eq!(delays, secs(&[1, 2, 4, 8, 15, 15, 15]));
        assert!(backoff.elapsed() <= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_budget_shrinks_to_zero() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig::default().without_jitter());
        assert_eq!(backoff.remaining(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(backoff.remaining(), Duration::from_secs(15));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backoff.remaining(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_capped() {
        let config = BackoffConfig {
            max_elapsed: Duration::from_secs(3600),
            ..BackoffConfig::default().without_jitter()
        };
        let mut backoff = ExponentialBackoff::new(config);

        let delays: Vec<_> = (0..8).filter_map(|_| backoff.next_delay()).collect();

        assert_eq!(delays.last(), Some(&Duration::from_secs(15)));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(15)));
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_stays_within_spread() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig::default());

        let first = backoff.next_delay().unwrap();

        assert!(first >= Duration::from_millis(500));
        assert!(first <= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_stops_immediately() {
        let config = BackoffConfig {
            max_elapsed: Duration::from_millis(500),
            ..BackoffConfig::default().without_jitter()
        };
        let mut backoff = ExponentialBackoff::new(config);

        assert_eq!(backoff.next_delay(), None);
    }
}
