use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub camera: CameraConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub enrollment: EnrollmentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub base_url: String,
    /// Absent means requests never time out; a hung call stalls the loop until it resolves.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub url: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_fps")]
    pub fps: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_recognition_quality")]
    pub jpeg_quality: f32,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub overlay_snapshot: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollmentConfig {
    #[serde(default = "default_quota")]
    pub quota: usize,
    #[serde(default = "default_enrollment_quality")]
    pub jpeg_quality: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            jpeg_quality: default_recognition_quality(),
            auto_start: false,
            overlay_snapshot: None,
        }
    }
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            quota: default_quota(),
            jpeg_quality: default_enrollment_quality(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RecognitionConfig {
    /// Trigger period for the recognition loop. Zero means "as fast as the
    /// pipeline allows", which a tokio interval expresses as its 1ms floor.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(MIN_INTERVAL_MS))
    }
}

const MIN_INTERVAL_MS: u64 = 1;

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.service.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("service.base_url must not be empty".into()));
        }
        for (field, q) in [
            ("recognition.jpeg_quality", self.recognition.jpeg_quality),
            ("enrollment.jpeg_quality", self.enrollment.jpeg_quality),
        ] {
            if !(q > 0.0 && q <= 1.0) {
                return Err(ConfigError::Invalid(format!("{field} must be in (0, 1], got {q}")));
            }
        }
        if self.enrollment.quota == 0 {
            return Err(ConfigError::Invalid("enrollment.quota must be at least 1".into()));
        }
        if self.camera.mode == "polling" && !(self.camera.fps > 0.0) {
            return Err(ConfigError::Invalid("camera.fps must be positive in polling mode".into()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_mode() -> String {
    "mjpeg".into()
}
fn default_fps() -> f64 {
    10.0
}
fn default_interval_ms() -> u64 {
    0
}
fn default_recognition_quality() -> f32 {
    0.85
}
fn default_quota() -> usize {
    10
}
fn default_enrollment_quality() -> f32 {
    0.9
}
fn default_log_level() -> String {
    "info".into()
}
