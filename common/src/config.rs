use serde::Deserialize;
use std::path::Path;

/// Top-level configuration shared by the relay server and the producer.
///
/// Every section has defaults, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub annotate: AnnotateConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_placeholder_path")]
    pub placeholder_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Binary payloads of this many bytes or fewer are treated as noise.
    #[serde(default = "default_min_frame_bytes")]
    pub min_frame_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_pacing_interval_ms")]
    pub pacing_interval_ms: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnnotateConfig {
    /// `none` or `border`.
    #[serde(default = "default_annotate_kind")]
    pub kind: String,
    #[serde(default = "default_annotate_color")]
    pub color: [u8; 3],
    #[serde(default = "default_annotate_thickness")]
    pub thickness: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// `mjpeg`, `polling` or `directory`.
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Camera URL for `mjpeg`/`polling`, image directory for `directory`.
    #[serde(default)]
    pub source: String,
    #[serde(default = "default_fps")]
    pub fps: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            placeholder_path: default_placeholder_path(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            min_frame_bytes: default_min_frame_bytes(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            pacing_interval_ms: default_pacing_interval_ms(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for AnnotateConfig {
    fn default() -> Self {
        Self {
            kind: default_annotate_kind(),
            color: default_annotate_color(),
            thickness: default_annotate_thickness(),
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            mode: default_mode(),
            source: String::new(),
            fps: default_fps(),
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

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

// Default value functions
fn default_bind() -> String {
    "0.0.0.0:3001".into()
}
fn default_placeholder_path() -> String {
    "placeholder.jpg".into()
}
fn default_min_frame_bytes() -> usize {
    5000
}
fn default_pacing_interval_ms() -> u64 {
    100
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_annotate_kind() -> String {
    "none".into()
}
fn default_annotate_color() -> [u8; 3] {
    [255, 0, 0]
}
fn default_annotate_thickness() -> u32 {
    4
}
fn default_relay_url() -> String {
    "ws://127.0.0.1:3001/ws".into()
}
fn default_mode() -> String {
    "mjpeg".into()
}
fn default_fps() -> f64 {
    10.0
}
fn default_log_level() -> String {
    "info".into()
}
