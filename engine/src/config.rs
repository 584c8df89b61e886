//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Default backoff unit: an entry that failed `n` times waits `n * BASE_DELAY`.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);

/// Default number of failed attempts before an entry is marked failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default cache time-to-live: 30 days.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default period of the background sync timer.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default attempts for the version-conflict retry loop.
pub const DEFAULT_CONFLICT_MAX_ATTEMPTS: u32 = 3;

/// Default fixed delay between version-conflict retries.
pub const DEFAULT_CONFLICT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Tunables for the queue, cache, processor and conflict resolver.
///
/// Durations are (de)serialized as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Backoff unit for failed queue entries
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Failed attempts before an entry becomes `failed`
    pub max_retries: u32,
    /// Age after which a cached entity is treated as absent
    #[serde(with = "duration_millis")]
    pub cache_ttl: Duration,
    /// Period of the background processing timer
    #[serde(with = "duration_millis")]
    pub sync_interval: Duration,
    /// Attempts made by the conflict resolver before giving up
    pub conflict_max_attempts: u32,
    /// Delay between conflict resolver attempts
    #[serde(with = "duration_millis")]
    pub conflict_retry_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
            cache_ttl: DEFAULT_CACHE_TTL,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            conflict_max_attempts: DEFAULT_CONFLICT_MAX_ATTEMPTS,
            conflict_retry_delay: DEFAULT_CONFLICT_RETRY_DELAY,
        }
    }
}

impl SyncConfig {
    /// Load configuration from `TRIPSYNC_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = parse_var(&lookup, "TRIPSYNC_BASE_DELAY_MS")? {
            config.base_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&lookup, "TRIPSYNC_MAX_RETRIES")? {
            config.max_retries = n;
        }
        if let Some(ms) = parse_var(&lookup, "TRIPSYNC_CACHE_TTL_MS")? {
            config.cache_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "TRIPSYNC_SYNC_INTERVAL_MS")? {
            config.sync_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&lookup, "TRIPSYNC_CONFLICT_MAX_ATTEMPTS")? {
            config.conflict_max_attempts = n;
        }
        if let Some(ms) = parse_var(&lookup, "TRIPSYNC_CONFLICT_RETRY_DELAY_MS")? {
            config.conflict_retry_delay = Duration::from_millis(ms);
        }

        if config.max_retries == 0 {
            return Err(ConfigError::Invalid {
                key: "TRIPSYNC_MAX_RETRIES",
                reason: "must be at least 1".to_string(),
            });
        }
        if config.conflict_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "TRIPSYNC_CONFLICT_MAX_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key,
                reason: format!("'{raw}' is not a valid number"),
            }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
