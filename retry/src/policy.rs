//! Retry eligibility and backoff computation.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::classifier::ErrorKind;
use crate::classifier::RequestError;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (so `max_retries + 1` calls at most).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Scale each delay by a uniform factor in `[0.5, 1.0]`.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Same policy without randomness, for deterministic callers.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

/// Default retry predicate.
///
/// The attempt budget is enforced by the executor, not here.
pub fn should_retry(error: &RequestError, _attempt: u32, _config: &RetryConfig) -> bool {
    error.kind.is_transient()
}

/// Backoff before retry number `attempt + 1`.
///
/// `min(base * factor^attempt, max)`, then scaled by jitter when enabled.
pub fn compute_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let raw = config.base_delay_ms as f64 * config.backoff_factor.powi(exponent);
    let capped = raw.min(config.max_delay_ms as f64).max(0.0);
    let delay_ms = if config.jitter {
        apply_jitter(capped)
    } else {
        capped
    };
    Duration::from_millis(delay_ms as u64)
}

/// Delay for a concrete failure, honouring a server `Retry-After` hint on
/// rate limits.
pub(crate) fn delay_for(error: &RequestError, attempt: u32, config: &RetryConfig) -> Duration {
    let computed = compute_delay(attempt, config);
    match (error.kind, error.retry_after) {
        (ErrorKind::RateLimit, Some(hint)) => computed
            .max(hint)
            .min(Duration::from_millis(config.max_delay_ms)),
        _ => computed,
    }
}

fn apply_jitter(delay_ms: f64) -> f64 {
    let factor: f64 = rand::rng().random_range(0.5..=1.0);
    delay_ms * factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 30_000);
        assert_eq!(config.backoff_factor, 2.0);
        assert!(config.jitter);
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let config = RetryConfig::default().without_jitter();
        assert_eq!(compute_delay(0, &config), Duration::from_millis(1000));
        assert_eq!(compute_delay(1, &config), Duration::from_millis(2000));
        assert_eq!(compute_delay(4, &config), Duration::from_millis(16_000));
        assert_eq!(compute_delay(5, &config), Duration::from_millis(30_000));
        assert_eq!(compute_delay(200, &config), Duration::from_millis(30_000));
    }

    #[test]
    fn backoff_is_monotonic_and_bounded_without_jitter() {
        let config = RetryConfig::default().without_jitter();
        let max = Duration::from_millis(config.max_delay_ms);
        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let delay = compute_delay(attempt, &config);
            assert!(delay <= max, "attempt {attempt} exceeded cap: {delay:?}");
            assert!(delay >= previous, "attempt {attempt} went backwards");
            previous = delay;
        }
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let config = RetryConfig::default();
        for _ in 0..200 {
            let delay = compute_delay(1, &config).as_millis();
            assert!(
                (1000..=2000).contains(&delay),
                "jittered delay {delay} out of range [1000, 2000]"
            );
        }
        for _ in 0..50 {
            assert!(compute_delay(30, &config) <= Duration::from_millis(30_000));
        }
    }

    #[test]
    fn retry_eligibility_by_kind() {
        let config = RetryConfig::default();
        for attempt in [0, 1, 7] {
            assert!(should_retry(&RequestError::network("reset"), attempt, &config));
            assert!(should_retry(
                &RequestError::timeout(Duration::from_secs(1)),
                attempt,
                &config
            ));
            assert!(should_retry(&RequestError::http(502, "bad gateway"), attempt, &config));
            assert!(should_retry(&RequestError::http(429, "slow down"), attempt, &config));
            assert!(!should_retry(&RequestError::http(401, "expired"), attempt, &config));
            assert!(!should_retry(&RequestError::http(403, "denied"), attempt, &config));
            assert!(!should_retry(&RequestError::http(422, "invalid"), attempt, &config));
        }
    }

    #[test]
    fn rate_limit_hint_extends_the_delay() {
        let config = RetryConfig::default().without_jitter();
        let err = RequestError::http(429, "slow down").with_retry_after(Duration::from_secs(5));
        assert_eq!(delay_for(&err, 0, &config), Duration::from_secs(5));

        let huge = RequestError::http(429, "slow down").with_retry_after(Duration::from_secs(600));
        assert_eq!(delay_for(&huge, 0, &config), Duration::from_secs(30));

        let server = RequestError::http(500, "oops").with_retry_after(Duration::from_secs(5));
        assert_eq!(delay_for(&server, 0, &config), Duration::from_secs(1));
    }
}
