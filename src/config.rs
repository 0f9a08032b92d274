//! Configuration types for book-dl

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Download behavior configuration (staging directory, worker pool, progress)
///
/// Used as a flattened sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Directory that holds staging files until they are taken (default: "./downloads")
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Maximum concurrent transfers (default: 4)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Minimum interval between progress notifications for one download (default: 250ms)
    ///
    /// Progress is coalesced: bytes arriving faster than this are reported in
    /// the next notification, never dropped from the counters.
    #[serde(default = "default_progress_interval", with = "duration_serde")]
    pub progress_interval: Duration,

    /// How long `shutdown()` waits for running transfers to stop (default: 30s)
    #[serde(default = "default_shutdown_timeout", with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            max_concurrent_downloads: default_max_concurrent(),
            progress_interval: default_progress_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// HTTP transport configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    /// TCP/TLS connect timeout (default: 30s)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Maximum time to wait for the next body chunk before treating the
    /// connection as stalled (default: 60s)
    #[serde(default = "default_read_timeout", with = "duration_serde")]
    pub read_timeout: Duration,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

/// Notification delivery configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Capacity of the broadcast channel behind `subscribe()` (default: 1000)
    ///
    /// Subscribers that fall further behind than this observe a lag error.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Capacity of the listener dispatch queue (default: 256)
    ///
    /// When full, the oldest pending progress notification is dropped.
    /// Lifecycle notifications are never dropped.
    #[serde(default = "default_listener_queue_capacity")]
    pub listener_queue_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: default_event_channel_capacity(),
            listener_queue_capacity: default_listener_queue_capacity(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try (default: 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 500ms)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 10 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Main configuration for [`DownloadManager`](crate::DownloadManager)
///
/// `download` and `notifications` are flattened so the JSON form stays flat;
/// `retry` and `http` are nested objects.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Staging directory, worker pool and progress settings
    #[serde(flatten)]
    pub download: DownloadConfig,

    /// Retry policy for transient network failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// HTTP client settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Listener and subscriber delivery settings
    #[serde(flatten)]
    pub notifications: NotificationConfig,
}

impl Config {
    /// Parse a configuration from JSON, filling unspecified fields with defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Staging directory
    pub fn staging_dir(&self) -> &PathBuf {
        &self.download.staging_dir
    }

    /// Check settings that would make the manager unusable
    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent_downloads == 0 {
            return Err(Error::Config {
                message: "max_concurrent_downloads must be at least 1".to_string(),
                key: Some("max_concurrent_downloads".to_string()),
            });
        }
        if self.download.staging_dir.as_os_str().is_empty() {
            return Err(Error::Config {
                message: "staging_dir must not be empty".to_string(),
                key: Some("staging_dir".to_string()),
            });
        }
        if self.notifications.listener_queue_capacity == 0 {
            return Err(Error::Config {
                message: "listener_queue_capacity must be at least 1".to_string(),
                key: Some("listener_queue_capacity".to_string()),
            });
        }
        if self.notifications.event_channel_capacity == 0 {
            return Err(Error::Config {
                message: "event_channel_capacity must be at least 1".to_string(),
                key: Some("event_channel_capacity".to_string()),
            });
        }
        if self.retry.backoff_multiplier.is_nan() || self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config {
                message: format!(
                    "backoff_multiplier must be >= 1.0, got {}",
                    self.retry.backoff_multiplier
                ),
                key: Some("retry.backoff_multiplier".to_string()),
            });
        }
        Ok(())
    }
}

// Default value functions
fn default_staging_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_max_concurrent() -> usize {
    4
}

fn default_progress_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_user_agent() -> String {
    format!("book-dl/{}", env!("CARGO_PKG_VERSION"))
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_listener_queue_capacity() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    1
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper (milliseconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
