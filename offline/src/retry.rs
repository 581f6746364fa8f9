//! Retry policy for failed remote executions.

use crate::error::ConfigError;
use std::env;
use std::time::Duration;
use stowage_engine::ExecutionError;

pub const DEFAULT_MAX_RETRIES: u32 = 10;
pub const DEFAULT_RETRY_BASE_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_MS: u64 = 60_000;

/// Backoff doubles per attempt up to this exponent.
const MAX_BACKOFF_EXPONENT: u32 = 8;

/// Retry settings loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_RETRY_BASE_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_MS,
        }
    }
}

impl RetrySettings {
    /// Load from `STOWAGE_MAX_RETRIES`, `STOWAGE_RETRY_BASE_MS` and
    /// `STOWAGE_RETRY_MAX_MS`. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            name: &'static str,
            default: T,
        ) -> Result<T, ConfigError> {
            match lookup(name) {
                None => Ok(default),
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue { name, value }),
            }
        }

        let settings = Self {
            max_retries: parse(&lookup, "STOWAGE_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            base_delay_ms: parse(&lookup, "STOWAGE_RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS)?,
            max_delay_ms: parse(&lookup, "STOWAGE_RETRY_MAX_MS", DEFAULT_RETRY_MAX_MS)?,
        };
        if settings.base_delay_ms > settings.max_delay_ms {
            return Err(ConfigError::OutOfOrder {
                name: "STOWAGE_RETRY_BASE_MS",
                other: "STOWAGE_RETRY_MAX_MS",
            });
        }
        Ok(settings)
    }
}

/// Exponential backoff with deterministic jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(RetrySettings::default())
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Whether a failure on attempt `retry_count` (0-based) may be retried.
    pub fn should_retry(&self, error: &ExecutionError, retry_count: u32) -> bool {
        error.is_retriable() && retry_count < self.max_retries
    }

    /// Delay before the attempt after `retry_count` failures.
    ///
    /// Jitter adds up to a quarter of the delay and depends only on `seed`
    /// and the attempt number.
    pub fn delay(&self, retry_count: u32, seed: &str) -> Duration {
        let factor = 1u32 << retry_count.min(MAX_BACKOFF_EXPONENT);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if !self.jitter {
            return delay;
        }

        let millis = delay.as_millis() as u64;
        let spread = (millis / 4).max(1);
        let mixed = seed_hash(seed)
            .wrapping_mul(6364136223846793005)
            .wrapping_add(u64::from(retry_count).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        delay + Duration::from_millis((mixed >> 16) % spread)
    }
}

/// FNV-1a over the seed bytes.
fn seed_hash(seed: &str) -> u64 {
    seed.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn settings_default_when_unset() {
        let settings = RetrySettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, RetrySettings::default());
    }

    #[test]
    fn settings_parse_overrides() {
        let settings = RetrySettings::from_lookup(lookup(&[
            ("STOWAGE_MAX_RETRIES", "3"),
            ("STOWAGE_RETRY_BASE_MS", " 50 "),
        ]))
        .unwrap();
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.base_delay_ms, 50);
        assert_eq!(settings.max_delay_ms, DEFAULT_RETRY_MAX_MS);
    }

    #[test]
    fn settings_reject_garbage() {
        let err = RetrySettings::from_lookup(lookup(&[("STOWAGE_MAX_RETRIES", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "STOWAGE_MAX_RETRIES", .. }));

        let err = RetrySettings::from_lookup(lookup(&[
            ("STOWAGE_RETRY_BASE_MS", "500"),
            ("STOWAGE_RETRY_MAX_MS", "100"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfOrder { .. }));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default().without_jitter();
        assert_eq!(policy.delay(0, "tx"), Duration::from_secs(1));
        assert_eq!(policy.delay(1, "tx"), Duration::from_secs(2));
        assert_eq!(policy.delay(4, "tx"), Duration::from_secs(16));
        assert_eq!(policy.delay(6, "tx"), Duration::from_secs(60));
        assert_eq!(policy.delay(30, "tx"), Duration::from_secs(60));
    }

    #[test]
    fn jitter_is_bounded_and_deterministic() {
        let policy = RetryPolicy::default();
        for attempt in 0..12 {
            let base = policy.clone().without_jitter().delay(attempt, "tx-1");
            let jittered = policy.delay(attempt, "tx-1");
            assert!(jittered >= base);
            assert!(jittered <= base + base / 4);
            assert_eq!(jittered, policy.delay(attempt, "tx-1"));
        }
    }

    #[test]
    fn only_retriable_errors_within_budget_retry() {
        let policy = RetryPolicy::default();
        let transient = ExecutionError::retriable("offline");
        assert!(policy.should_retry(&transient, 0));
        assert!(policy.should_retry(&transient, 9));
        assert!(!policy.should_retry(&transient, 10));
        assert!(!policy.should_retry(&ExecutionError::non_retriable("bad request"), 0));
    }
}
