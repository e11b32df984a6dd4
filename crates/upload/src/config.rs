//! Coordinator configuration.
//!
//! Loaded from a JSON file when present; every field has a default so a
//! partial file (or none at all) is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shardup_transfer::DEFAULT_CHUNK_SIZE;

use crate::error::UploadError;

/// Default number of chunk uploads in flight across all files.
pub const DEFAULT_MAX_CONCURRENT: usize = 6;

/// Default capacity of the coordinator event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Retry policy for transient remote failures, with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts per operation, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(rename = "initialDelayMs", with = "duration_ms")]
    pub initial_delay: Duration,
    /// Backoff cap.
    #[serde(rename = "maxDelayMs", with = "duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately, for tests and local services.
    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
        }
    }

    /// Effective attempt bound; a zero bound still makes one attempt.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.max(1.0).powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }
}

/// Configuration for an [`UploadCoordinator`](crate::UploadCoordinator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadConfig {
    /// Chunk size in bytes.
    pub chunk_size: u64,
    /// Limiter capacity shared by every file.
    pub max_concurrent: usize,
    pub retry: RetryPolicy,
    pub event_buffer: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            retry: RetryPolicy::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl UploadConfig {
    /// Loads config from a JSON file.
    ///
    /// A missing file yields the defaults. A file that fails to parse is
    /// logged and also yields the defaults.
    pub fn load(path: &Path) -> Result<Self, UploadError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)?;
        match Self::from_json(&data) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "config loaded");
                Ok(config)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    /// Parses config from a JSON string.
    pub fn from_json(data: &str) -> Result<Self, UploadError> {
        Ok(serde_json::from_str(data)?)
    }

    /// Writes config as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), UploadError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = UploadConfig::default();
        assert_eq!(config.chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.max_concurrent, 6);
        assert_eq!(config.event_buffer, 256);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(200));
        assert_eq!(config.retry.max_delay, Duration::from_secs(5));
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(retry.delay_for_attempt(10), Duration::from_secs(5));
        assert_eq!(retry.delay_for_attempt(500), Duration::from_secs(5));
    }

    #[test]
    fn no_delay_policy() {
        let retry = RetryPolicy::no_delay(3);
        assert_eq!(retry.attempts(), 3);
        assert_eq!(retry.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(retry.delay_for_attempt(5), Duration::ZERO);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::no_delay(0).attempts(), 1);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config =
            UploadConfig::from_json(r#"{"maxConcurrent": 2, "retry": {"initialDelayMs": 50}}"#)
                .unwrap();
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(50));
        assert_eq!(config.retry.max_attempts, 4);
    }

    #[test]
    fn serializes_durations_as_millis() {
        let json = serde_json::to_value(RetryPolicy::default()).unwrap();
        assert_eq!(json["initialDelayMs"], 200);
        assert_eq!(json["maxDelayMs"], 5000);
        assert_eq!(json["maxAttempts"], 4);
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = UploadConfig::load(&dir.path().join("missing.json")).unwrap();
        assert_eq!(config, UploadConfig::default());
    }

    #[test]
    fn load_invalid_json_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shardup.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(UploadConfig::load(&path).unwrap(), UploadConfig::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("shardup.json");
        let config = UploadConfig {
            chunk_size: 1024,
            max_concurrent: 3,
            retry: RetryPolicy::no_delay(2),
            event_buffer: 16,
        };
        config.save(&path).unwrap();
        assert_eq!(UploadConfig::load(&path).unwrap(), config);
    }
}
