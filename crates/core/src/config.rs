//! Daemon core configuration.
//!
//! Everything the core needs from the outside world: how long cached
//! authorizations stay valid, how many renewal workers may run at once,
//! where the three KV handles connect, and how cleanup deletes retry.
//! Loading (file, env) is the launcher's concern; this module owns the
//! shapes and the validation.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default lifetime of cached authorizations.
pub const DEFAULT_AUTH_VALID_SECS: u64 = 300;

/// Default lower bound of the renewal worker pool.
pub const DEFAULT_MIN_WORKERS: usize = 4;

/// Default upper bound of the renewal worker pool.
pub const DEFAULT_MAX_WORKERS: usize = 16;

/// Default number of retry attempts for flush cleanup deletes.
pub const DEFAULT_CLEANUP_MAX_RETRIES: u32 = 3;

/// Default delay between flush cleanup delete attempts.
pub const DEFAULT_CLEANUP_DELAY: Duration = Duration::from_millis(100);

/// Retry policy for the flush protocol's cleanup deletes.
///
/// The delay is part of the config rather than a literal in the delete
/// path so tests can run the retry loop in milliseconds.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub(crate) max_retries: u32,
    pub(crate) delay: Duration,
}

#[bon::bon]
impl RetryConfig {
    /// Creates a retry configuration.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_CLEANUP_MAX_RETRIES)] max_retries: u32,
        #[builder(default = DEFAULT_CLEANUP_DELAY)] delay: Duration,
    ) -> Self {
        Self { max_retries, delay }
    }

    /// Maximum number of retry attempts. `0` disables retries.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay between attempts.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: DEFAULT_CLEANUP_MAX_RETRIES, delay: DEFAULT_CLEANUP_DELAY }
    }
}

/// Renewal worker pool bounds.
///
/// The pool admits at most `max` concurrent renewal tasks; `min` is the
/// floor a supervisor should keep warm and must not exceed `max`.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Lower pool bound.
    #[serde(default = "default_min_workers")]
    pub min: usize,
    /// Upper pool bound (the concurrency limit).
    #[serde(default = "default_max_workers")]
    pub max: usize,
}

#[bon::bon]
impl WorkerConfig {
    /// Creates a validated worker pool configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `max` is zero or `min > max`.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MIN_WORKERS)] min: usize,
        #[builder(default = DEFAULT_MAX_WORKERS)] max: usize,
    ) -> Result<Self, ConfigError> {
        let config = Self { min, max };
        config.validate()?;
        Ok(config)
    }

    /// Checks the pool bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max == 0 {
            return Err(ConfigError::MustBePositive { field: "workers.max", value: "0".into() });
        }
        if self.min > self.max {
            return Err(ConfigError::InvalidRelation {
                field_a: "workers.min",
                value_a: self.min.to_string(),
                field_b: "workers.max",
                value_b: self.max.to_string(),
            });
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { min: DEFAULT_MIN_WORKERS, max: DEFAULT_MAX_WORKERS }
    }
}

/// Connection parameters for one KV handle.
///
/// The daemon holds three: one for storage commands, one for publishing,
/// and one dedicated to the request subscription (a subscribed connection
/// issues no other commands).
#[derive(Debug, Clone, Deserialize)]
pub struct KvConnConfig {
    /// Connection URL of the KV server.
    pub url: String,
}

/// Top-level core configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FlushdConfig {
    /// Lifetime in seconds of cached authorizations. Positive.
    #[serde(default = "default_auth_valid_secs")]
    pub auth_valid_secs: u64,
    /// Renewal worker pool bounds.
    #[serde(default)]
    pub workers: WorkerConfig,
    /// KV handle used for storage commands.
    pub storage: KvConnConfig,
    /// KV handle used for publishing responses.
    pub publisher: KvConnConfig,
    /// KV handle dedicated to the request subscription.
    pub subscriber: KvConnConfig,
}

impl FlushdConfig {
    /// Checks every field that deserialization alone cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth_valid_secs == 0 {
            return Err(ConfigError::MustBePositive {
                field: "auth_valid_secs",
                value: "0".into(),
            });
        }
        self.workers.validate()
    }

    /// The authorization cache TTL as a [`Duration`].
    #[must_use]
    pub fn auth_valid(&self) -> Duration {
        Duration::from_secs(self.auth_valid_secs)
    }
}

fn default_auth_valid_secs() -> u64 {
    DEFAULT_AUTH_VALID_SECS
}

fn default_min_workers() -> usize {
    DEFAULT_MIN_WORKERS
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}
