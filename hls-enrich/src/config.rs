//! Process settings and pipeline engine tuning.
//!
//! Process-wide settings come from the environment (optionally seeded from a
//! `.env` file). Per-pipeline settings such as AI credentials live in the
//! pipeline config documents persisted through the task store.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Default SQLite database URL.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:hls-enrich.db?mode=rwc";

/// Timing and capacity knobs shared by every stage of a pipeline instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Downstream queue length at which a stage stops consuming its head.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Number of segments kept in the final queue before the oldest is evicted.
    #[serde(default = "default_retention")]
    pub retention: usize,
    /// Delay between driver passes after a success or no-op.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Delay after a failed driver pass.
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    /// Delay when the final queue is within retention.
    #[serde(default = "default_idle_ms")]
    pub retention_idle_ms: u64,
    /// Delay when no new input stream was elected.
    #[serde(default = "default_idle_ms")]
    pub selector_idle_ms: u64,
    /// Grace period used by reset, both before rejecting and after persisting.
    #[serde(default = "default_idle_ms")]
    pub reset_grace_ms: u64,
    /// Delay between supervisor passes.
    #[serde(default = "default_run_interval_ms")]
    pub run_interval_ms: u64,
    /// Delay after a failed supervisor pass.
    #[serde(default = "default_run_backoff_ms")]
    pub run_backoff_ms: u64,
    /// Consecutive failures before the head of a stage is dead-lettered.
    /// Zero retries forever.
    #[serde(default = "default_max_stage_attempts")]
    pub max_stage_attempts: u32,
    /// Number of dead letters remembered per task.
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

fn default_queue_capacity() -> usize {
    10
}

fn default_retention() -> usize {
    9
}

fn default_tick_ms() -> u64 {
    200
}

fn default_error_backoff_ms() -> u64 {
    10_000
}

fn default_idle_ms() -> u64 {
    1_000
}

fn default_run_interval_ms() -> u64 {
    300
}

fn default_run_backoff_ms() -> u64 {
    3_500
}

fn default_max_stage_attempts() -> u32 {
    5
}

fn default_dead_letter_capacity() -> usize {
    32
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            retention: default_retention(),
            tick_ms: default_tick_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            retention_idle_ms: default_idle_ms(),
            selector_idle_ms: default_idle_ms(),
            reset_grace_ms: default_idle_ms(),
            run_interval_ms: default_run_interval_ms(),
            run_backoff_ms: default_run_backoff_ms(),
            max_stage_attempts: default_max_stage_attempts(),
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn retention_idle(&self) -> Duration {
        Duration::from_millis(self.retention_idle_ms)
    }

    pub fn selector_idle(&self) -> Duration {
        Duration::from_millis(self.selector_idle_ms)
    }

    pub fn reset_grace(&self) -> Duration {
        Duration::from_millis(self.reset_grace_ms)
    }

    pub fn run_interval(&self) -> Duration {
        Duration::from_millis(self.run_interval_ms)
    }

    pub fn run_backoff(&self) -> Duration {
        Duration::from_millis(self.run_backoff_ms)
    }

    /// Check the relations between knobs.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::config("queue_capacity must be greater than 0"));
        }
        if self.retention == 0 {
            return Err(Error::config("retention must be greater than 0"));
        }
        if self.tick_ms == 0 {
            return Err(Error::config("tick_ms must be greater than 0"));
        }
        Ok(())
    }
}

/// Process-wide settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub log_dir: PathBuf,
    /// Filter directive applied over `RUST_LOG` once logging is up.
    pub log_filter: Option<String>,
    /// Root of the per-pipeline working directories.
    pub workdir: PathBuf,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Receiver of OCR results. Callbacks are skipped when unset.
    pub callback_url: Option<String>,
    /// Total timeout for AI provider and callback requests.
    pub request_timeout: Duration,
    pub engine: EngineConfig,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self> {
        let engine_defaults = EngineConfig::default();
        let engine = EngineConfig {
            queue_capacity: env_parse("HLS_ENRICH_QUEUE_CAPACITY", engine_defaults.queue_capacity)?,
            retention: env_parse("HLS_ENRICH_RETENTION", engine_defaults.retention)?,
            max_stage_attempts: env_parse(
                "HLS_ENRICH_MAX_STAGE_ATTEMPTS",
                engine_defaults.max_stage_attempts,
            )?,
            ..engine_defaults
        };
        engine.validate()?;

        Ok(Self {
            database_url: env_or("DATABASE_URL", DEFAULT_DATABASE_URL),
            log_dir: PathBuf::from(env_or("LOG_DIR", "logs")),
            log_filter: std::env::var("HLS_ENRICH_LOG_FILTER")
                .ok()
                .filter(|directive| !directive.trim().is_empty()),
            workdir: PathBuf::from(env_or("HLS_ENRICH_WORKDIR", "data")),
            ffmpeg_path: env_or("FFMPEG_PATH", "ffmpeg"),
            ffprobe_path: env_or("FFPROBE_PATH", "ffprobe"),
            callback_url: std::env::var("HLS_ENRICH_CALLBACK_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            request_timeout: Duration::from_secs(env_parse("HLS_ENRICH_REQUEST_TIMEOUT_SECS", 120)?),
            engine,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("invalid {}={}: {}", key, raw, e))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.retention, 9);
        assert_eq!(config.tick_interval(), Duration::from_millis(200));
        assert_eq!(config.error_backoff(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"queue_capacity": 3}"#).unwrap();
        assert_eq!(config.queue_capacity, 3);
        assert_eq!(config.retention, 9);
        assert_eq!(config.max_stage_attempts, 5);
    }

    #[test]
    fn test_engine_rejects_zero_capacity() {
        let config = EngineConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }
}
