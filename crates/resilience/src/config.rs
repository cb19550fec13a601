use configuration::RetrySettings;
use rand::Rng;
use std::time::Duration;

/// Configuration for retry behavior. One instance per `ResilienceManager`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the exponential part of the delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Upper bound of the uniform random jitter added to every delay.
    pub jitter: Duration,
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            jitter: Duration::from_millis(500),
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// The deterministic part of the delay after failed attempt `attempt`
    /// (1-indexed): `min(initial * multiplier^(attempt-1), max)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let initial_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = initial_ms * self.backoff_multiplier.powi(exponent as i32);
        Duration::from_millis(delay_ms.min(max_ms) as u64)
    }

    /// `base_delay(attempt)` plus a uniform random jitter in `[0, jitter]`.
    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 { 0 } else { rng.gen_range(0..=jitter_ms) };
        self.base_delay(attempt) + Duration::from_millis(jitter)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_multiplier: settings.backoff_multiplier,
            jitter: Duration::from_millis(settings.jitter_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn policy() -> RetryConfig {
        RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1_000))
            .with_backoff_multiplier(2.0)
    }

    #[test]
    fn base_delays_grow_and_cap() {
        let config = policy();
        let delays: Vec<u128> = (1..=5).map(|n| config.base_delay(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000]);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = policy().with_jitter(Duration::from_millis(50));
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=5 {
            for _ in 0..100 {
                let delay = config.delay_for_attempt(attempt, &mut rng);
                let base = config.base_delay(attempt);
                assert!(delay >= base);
                assert!(delay <= base + Duration::from_millis(50));
            }
        }
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let config = policy();
        assert_eq!(config.base_delay(10_000), Duration::from_millis(1_000));
        assert_eq!(config.base_delay(0), Duration::from_millis(100));
    }

    #[test]
    fn built_from_settings() {
        let settings = RetrySettings {
            max_attempts: 3,
            initial_delay_ms: 250,
            max_delay_ms: 4_000,
            backoff_multiplier: 3.0,
            jitter_ms: 0,
        };
        let config = RetryConfig::from(&settings);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay(3), Duration::from_millis(2_250));
        assert_eq!(config.jitter, Duration::ZERO);
    }
}
