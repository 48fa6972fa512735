//! Runtime configuration
//!
//! Every section has a `Default`, so a config file only needs the keys it
//! changes. `STORYWEAVE_*` environment variables override file values.

use crate::domain::value_objects::EventType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub stream: StreamConfig,
    pub playback: PlaybackConfig,
    pub prefetch: PrefetchConfig,
    pub progress: ProgressConfig,
    pub server: ServerConfig,
}

/// Server-side push stream settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Heartbeat period while a connection is suspended
    pub heartbeat_interval_ms: u64,
    /// `retry_after` hint sent with generation errors, also the retry delay
    pub error_retry_after_secs: u64,
    /// Already-materialized events pushed per option after a decision
    pub speculative_lookahead: usize,
    /// Frames buffered between the dispatcher and the connection
    pub frame_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            error_retry_after_secs: 5,
            speculative_lookahead: 3,
            frame_buffer: 64,
        }
    }
}

impl StreamConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.error_retry_after_secs)
    }
}

/// Client playback settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Buffered blocking events above which the connection is closed
    pub high_watermark: usize,
    /// Buffered blocking events below which the connection is reopened
    pub low_watermark: usize,
    pub auto_advance: bool,
    /// Pause after a voice line (or instantly shown text) before moving on
    pub auto_advance_delay_ms: u64,
    /// `None` waits for a choice forever
    pub choice_timeout_ms: Option<u64>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            high_watermark: 20,
            low_watermark: 5,
            auto_advance: true,
            auto_advance_delay_ms: 1_500,
            choice_timeout_ms: Some(30_000),
        }
    }
}

impl PlaybackConfig {
    pub fn auto_advance_delay(&self) -> Duration {
        Duration::from_millis(self.auto_advance_delay_ms)
    }

    pub fn choice_timeout(&self) -> Option<Duration> {
        self.choice_timeout_ms.map(Duration::from_millis)
    }
}

/// Asset prefetch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Whole-request limit for remote assets
    pub request_timeout_ms: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl PrefetchConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let millis = self.base_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// HTTP front end settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Directory for stories, versions and progress; in memory when unset
    pub data_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            data_dir: None,
        }
    }
}

/// Progress persistence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Event types after which progress is written
    pub checkpoint_types: Vec<EventType>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            checkpoint_types: vec![
                EventType::Decision,
                EventType::ChapterStart,
                EventType::ChapterEnd,
                EventType::SceneStart,
                EventType::SceneEnd,
                EventType::StoryEnd,
            ],
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

impl AppConfig {
    /// Read a JSON config file, apply environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: AppConfig = serde_json::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = AppConfig::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parsed(&lookup, "STORYWEAVE_HEARTBEAT_MS")? {
            self.stream.heartbeat_interval_ms = v;
        }
        if let Some(v) = parsed(&lookup, "STORYWEAVE_RETRY_AFTER_SECS")? {
            self.stream.error_retry_after_secs = v;
        }
        if let Some(v) = parsed(&lookup, "STORYWEAVE_LOOKAHEAD")? {
            self.stream.speculative_lookahead = v;
        }
        if let Some(v) = parsed(&lookup, "STORYWEAVE_HIGH_WATERMARK")? {
            self.playback.high_watermark = v;
        }
        if let Some(v) = parsed(&lookup, "STORYWEAVE_LOW_WATERMARK")? {
            self.playback.low_watermark = v;
        }
        if let Some(v) = parsed(&lookup, "STORYWEAVE_AUTO_ADVANCE")? {
            self.playback.auto_advance = v;
        }
        if let Some(v) = parsed(&lookup, "STORYWEAVE_PREFETCH_CONCURRENCY")? {
            self.prefetch.concurrency = v;
        }
        if let Some(v) = parsed(&lookup, "STORYWEAVE_PREFETCH_ATTEMPTS")? {
            self.prefetch.max_attempts = v;
        }
        if let Some(v) = parsed(&lookup, "STORYWEAVE_BIND")? {
            self.server.bind_address = v;
        }
        if let Some(v) = parsed::<PathBuf, _>(&lookup, "STORYWEAVE_DATA_DIR")? {
            self.server.data_dir = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.playback.low_watermark >= self.playback.high_watermark {
            return Err(ConfigError::invalid(format!(
                "low_watermark ({}) must be below high_watermark ({})",
                self.playback.low_watermark, self.playback.high_watermark
            )));
        }
        if self.prefetch.concurrency == 0 {
            return Err(ConfigError::invalid("prefetch.concurrency must be at least 1"));
        }
        if self.prefetch.max_attempts == 0 {
            return Err(ConfigError::invalid("prefetch.max_attempts must be at least 1"));
        }
        if self.prefetch.request_timeout_ms == 0 {
            return Err(ConfigError::invalid("prefetch.request_timeout_ms must be positive"));
        }
        if self.stream.heartbeat_interval_ms == 0 {
            return Err(ConfigError::invalid("stream.heartbeat_interval_ms must be positive"));
        }
        if self.stream.frame_buffer == 0 {
            return Err(ConfigError::invalid("stream.frame_buffer must be at least 1"));
        }
        Ok(())
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.prefetch.concurrency, 4);
        assert_eq!(config.stream.heartbeat_interval(), Duration::from_secs(30));
        assert!(config.progress.checkpoint_types.contains(&EventType::Decision));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"playback": {{"high_watermark": 8, "low_watermark": 2}}}}"#).unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.playback.high_watermark, 8);
        assert_eq!(config.playback.low_watermark, 2);
        assert!(config.playback.auto_advance);
        assert_eq!(config.stream, StreamConfig::default());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = AppConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn overrides_win_over_defaults() {
        let env: HashMap<&str, &str> = [
            ("STORYWEAVE_PREFETCH_CONCURRENCY", "2"),
            ("STORYWEAVE_AUTO_ADVANCE", "false"),
        ]
        .into_iter()
        .collect();
        let mut config = AppConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.prefetch.concurrency, 2);
        assert!(!config.playback.auto_advance);
    }

    #[test]
    fn bad_override_names_the_key() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(|k| (k == "STORYWEAVE_HIGH_WATERMARK").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("STORYWEAVE_HIGH_WATERMARK"));
    }

    #[test]
    fn validation_rejects_inverted_watermarks_and_zero_limits() {
        let mut config = AppConfig::default();
        config.playback.low_watermark = config.playback.high_watermark;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.prefetch.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.prefetch.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let prefetch = PrefetchConfig {
            base_backoff_ms: 100,
            max_backoff_ms: 350,
            ..PrefetchConfig::default()
        };
        assert_eq!(prefetch.backoff(1), Duration::from_millis(100));
        assert_eq!(prefetch.backoff(2), Duration::from_millis(200));
        assert_eq!(prefetch.backoff(3), Duration::from_millis(350));
        assert_eq!(prefetch.backoff(80), Duration::from_millis(350));
    }
}
