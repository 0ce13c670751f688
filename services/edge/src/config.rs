//! Configuration management for the doorcam edge agent.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files. The loaded [`EdgeConfig`] is immutable
//! and handed to each component at startup.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the edge agent.
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeConfig {
    /// Device identity and credential
    pub device: DeviceConfig,

    /// Motion trigger configuration
    #[serde(default)]
    pub motion: MotionConfig,

    /// Snapshot capture configuration
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Motion sensor and frame source selection
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Local spool configuration
    #[serde(default)]
    pub spool: SpoolConfig,

    /// Upload client configuration
    pub upload: UploadConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Health/stats reporting configuration
    #[serde(default)]
    pub health: HealthConfig,
}

/// Device identity.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Device identifier registered with the backend
    pub device_id: String,

    /// Per-device API key presented on every write call
    pub api_key: String,
}

/// Motion trigger thresholds and timing.
#[derive(Debug, Clone, Deserialize)]
pub struct MotionConfig {
    /// Score threshold; a frame must score strictly above this to count as motion
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,

    /// Minimum changed area in pixels for a frame to count as motion
    #[serde(default = "default_min_area")]
    pub min_area: u32,

    /// Contiguous above-threshold time required before a trigger fires
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Length of the display session started by a trigger
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,

    /// Quiet period after a display session during which triggers are suppressed
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Length of an operator pause
    #[serde(default = "default_pause_ms")]
    pub pause_ms: u64,
}

/// Snapshot capture configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Delay between trigger and snapshot (defaults to half the session duration)
    #[serde(default)]
    pub snapshot_delay_ms: Option<u64>,

    /// Immediate capture attempts before a session is abandoned
    #[serde(default = "default_capture_attempts")]
    pub max_attempts: u32,

    /// Media format written to the spool (file extension)
    #[serde(default = "default_media_format")]
    pub format: String,
}

/// Sensor and frame source selection.
#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    /// Motion sensor mode ("simulated")
    #[serde(default = "default_sensor_mode")]
    pub sensor_mode: String,

    /// Frame source mode ("file" or "simulated")
    #[serde(default = "default_frame_mode")]
    pub frame_mode: String,

    /// Snapshot file served by the "file" frame source
    #[serde(default)]
    pub snapshot_path: Option<String>,

    /// Interval between simulated motion bursts in seconds
    #[serde(default = "default_simulated_interval")]
    pub simulated_interval_secs: u64,

    /// Sensor frame interval in milliseconds
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
}

/// Local spool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SpoolConfig {
    /// Spool directory
    #[serde(default = "default_spool_dir")]
    pub dir: String,

    /// Failed attempts tolerated before a job is dead-lettered
    #[serde(default = "default_spool_max_attempts")]
    pub max_attempts: u32,

    /// Base retry delay in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Maximum retry delay in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Jitter applied to each retry delay, as a fraction of the delay
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Lease lifetime in seconds before an in-flight job becomes leasable again
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_secs: u64,

    /// How long delivered jobs are kept before being purged
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

/// Upload client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Event API base URL
    pub backend_url: String,

    /// Timeout for event API calls in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for media uploads in seconds
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,

    /// Interval between spool drain passes in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum jobs delivered concurrently
    #[serde(default = "default_upload_concurrency")]
    pub concurrency: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Health/stats reporting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Interval between stats reports in seconds
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
}

// Default value functions
fn default_sensitivity() -> f64 {
    25.0
}
fn default_min_area() -> u32 {
    5000
}
fn default_debounce_ms() -> u64 {
    200
}
fn default_duration_ms() -> u64 {
    10_000
}
fn default_cooldown_ms() -> u64 {
    5_000
}
fn default_pause_ms() -> u64 {
    300_000
}
fn default_capture_attempts() -> u32 {
    3
}
fn default_media_format() -> String {
    "jpg".to_string()
}
fn default_sensor_mode() -> String {
    "simulated".to_string()
}
fn default_frame_mode() -> String {
    "simulated".to_string()
}
fn default_simulated_interval() -> u64 {
    10
}
fn default_frame_interval_ms() -> u64 {
    33
}
fn default_spool_dir() -> String {
    "spool".to_string()
}
fn default_spool_max_attempts() -> u32 {
    8
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_cap_ms() -> u64 {
    300_000
}
fn default_jitter_ratio() -> f64 {
    0.2
}
fn default_lease_timeout() -> u64 {
    120
}
fn default_retention() -> u64 {
    86_400
}
fn default_request_timeout() -> u64 {
    10
}
fn default_upload_timeout() -> u64 {
    30
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_upload_concurrency() -> usize {
    2
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_health_interval() -> u64 {
    30
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            sensitivity: default_sensitivity(),
            min_area: default_min_area(),
            debounce_ms: default_debounce_ms(),
            duration_ms: default_duration_ms(),
            cooldown_ms: default_cooldown_ms(),
            pause_ms: default_pause_ms(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            snapshot_delay_ms: None,
            max_attempts: default_capture_attempts(),
            format: default_media_format(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            sensor_mode: default_sensor_mode(),
            frame_mode: default_frame_mode(),
            snapshot_path: None,
            simulated_interval_secs: default_simulated_interval(),
            frame_interval_ms: default_frame_interval_ms(),
        }
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            dir: default_spool_dir(),
            max_attempts: default_spool_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            jitter_ratio: default_jitter_ratio(),
            lease_timeout_secs: default_lease_timeout(),
            retention_secs: default_retention(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
        }
    }
}

impl EdgeConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with EDGE_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. EDGE__UPLOAD__BACKEND_URL
            .add_source(
                Environment::with_prefix("EDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("EDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.device.device_id.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "device.device_id".to_string(),
            ));
        }
        if self.device.api_key.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "device.api_key".to_string(),
            ));
        }

        if self.upload.backend_url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "upload.backend_url".to_string(),
            ));
        }
        if !self.upload.backend_url.starts_with("http://")
            && !self.upload.backend_url.starts_with("https://")
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "upload.backend_url".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }
        if self.upload.concurrency == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "upload.concurrency".to_string(),
                message: "Concurrency must be greater than 0".to_string(),
            });
        }

        if self.motion.sensitivity < 0.0 || self.motion.sensitivity.is_nan() {
            return Err(ConfigValidationError::InvalidValue {
                field: "motion.sensitivity".to_string(),
                message: "Sensitivity must be a non-negative number".to_string(),
            });
        }
        if self.motion.duration_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "motion.duration_ms".to_string(),
                message: "Session duration must be greater than 0".to_string(),
            });
        }

        if let Some(delay) = self.capture.snapshot_delay_ms {
            if delay > self.motion.duration_ms {
                return Err(ConfigValidationError::InvalidValue {
                    field: "capture.snapshot_delay_ms".to_string(),
                    message: "Snapshot delay must fall within the session duration".to_string(),
                });
            }
        }
        if self.capture.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.max_attempts".to_string(),
                message: "At least one capture attempt is required".to_string(),
            });
        }

        if self.spool.dir.is_empty() {
            return Err(ConfigValidationError::MissingField("spool.dir".to_string()));
        }
        if self.spool.backoff_base_ms == 0 || self.spool.backoff_base_ms > self.spool.backoff_cap_ms
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "spool.backoff_base_ms".to_string(),
                message: "Base delay must be positive and not exceed the cap".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.spool.jitter_ratio) {
            return Err(ConfigValidationError::InvalidValue {
                field: "spool.jitter_ratio".to_string(),
                message: "Jitter ratio must be in [0, 1)".to_string(),
            });
        }

        match self.sources.frame_mode.as_str() {
            "simulated" => {}
            "file" if self.sources.snapshot_path.is_some() => {}
            "file" => {
                return Err(ConfigValidationError::MissingField(
                    "sources.snapshot_path".to_string(),
                ))
            }
            other => {
                return Err(ConfigValidationError::InvalidValue {
                    field: "sources.frame_mode".to_string(),
                    message: format!("Unknown frame source mode: {}", other),
                })
            }
        }
        if self.sources.sensor_mode != "simulated" {
            return Err(ConfigValidationError::InvalidValue {
                field: "sources.sensor_mode".to_string(),
                message: format!("Unknown sensor mode: {}", self.sources.sensor_mode),
            });
        }

        Ok(())
    }
}

impl MotionConfig {
    /// Get debounce window as Duration.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Get display session duration as Duration.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Get cooldown as Duration.
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Get pause window as Duration.
    pub fn pause_window(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}

impl EdgeConfig {
    /// Effective snapshot delay; mid-session unless configured.
    pub fn snapshot_delay(&self) -> Duration {
        match self.capture.snapshot_delay_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.motion.duration() / 2,
        }
    }
}

impl SpoolConfig {
    /// Get base retry delay as Duration.
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Get maximum retry delay as Duration.
    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    /// Get lease timeout as Duration.
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    /// Get retention window as Duration.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl UploadConfig {
    /// Get request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Get upload timeout as Duration.
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    /// Get drain interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
pub(crate) fn test_config() -> EdgeConfig {
    EdgeConfig {
        device: DeviceConfig {
            device_id: "doorcam-01".to_string(),
            api_key: "dev-secret-key-12345".to_string(),
        },
        motion: MotionConfig::default(),
        capture: CaptureConfig::default(),
        sources: SourcesConfig::default(),
        spool: SpoolConfig::default(),
        upload: UploadConfig {
            backend_url: "http://localhost:8000".to_string(),
            request_timeout_secs: 10,
            upload_timeout_secs: 30,
            poll_interval_ms: 1_000,
            concurrency: 2,
        },
        logging: LoggingConfig::default(),
        health: HealthConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let config = test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_device_id() {
        let mut config = test_config();
        config.device.device_id = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_invalid_backend_url() {
        let mut config = test_config();
        config.upload.backend_url = "ftp://backend".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_snapshot_delay_defaults_to_mid_session() {
        let mut config = test_config();
        config.motion.duration_ms = 15_000;
        assert_eq!(config.snapshot_delay(), Duration::from_millis(7_500));

        config.capture.snapshot_delay_ms = Some(3_000);
        assert_eq!(config.snapshot_delay(), Duration::from_secs(3));
    }

    #[test]
    fn test_snapshot_delay_outside_session() {
        let mut config = test_config();
        config.capture.snapshot_delay_ms = Some(config.motion.duration_ms + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_base_above_cap() {
        let mut config = test_config();
        config.spool.backoff_base_ms = config.spool.backoff_cap_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_source_requires_path() {
        let mut config = test_config();
        config.sources.frame_mode = "file".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));

        config.sources.snapshot_path = Some("/tmp/snapshot.jpg".to_string());
        assert!(config.validate().is_ok());
    }
}
