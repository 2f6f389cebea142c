use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AttendcamConfig {
    pub camera: CameraConfig,
    pub channel: ChannelConfig,
    pub capture: CaptureConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Camera device index (e.g., 0 for /dev/video0)
    #[serde(default = "default_camera_index")]
    pub index: u32,

    /// Ideal capture resolution (width, height)
    #[serde(default = "default_camera_resolution")]
    pub resolution: (u32, u32),

    /// Capability hint for transports that support it ("user" = front-facing)
    #[serde(default = "default_facing_mode")]
    pub facing_mode: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChannelConfig {
    /// Recognition backend endpoint (ws:// or wss://)
    #[serde(default = "default_channel_url")]
    pub url: String,

    /// Bearer token appended to the endpoint as a `token` query parameter
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Reconnect attempts before the channel is reported as failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential reconnect backoff, in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff ceiling, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CaptureConfig {
    /// Capture cadence, in milliseconds per frame
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// JPEG quality factor (1-100), fixed for the lifetime of a session
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    /// How long a transient outcome indicator stays visible, in milliseconds
    #[serde(default = "default_indicator_hold_ms")]
    pub indicator_hold_ms: u64,

    /// Window after stop during which late outcomes are still surfaced
    #[serde(default = "default_drain_window_ms")]
    pub drain_window_ms: u64,
}

impl AttendcamConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("attendcam.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            // Start with default values
            .set_default("camera.index", default_camera_index() as i64)?
            .set_default(
                "camera.resolution",
                vec![
                    default_camera_resolution().0 as i64,
                    default_camera_resolution().1 as i64,
                ],
            )?
            .set_default("camera.facing_mode", default_facing_mode())?
            .set_default("channel.url", default_channel_url())?
            .set_default("channel.max_retries", default_max_retries() as i64)?
            .set_default("channel.base_delay_ms", default_base_delay_ms() as i64)?
            .set_default("channel.max_delay_ms", default_max_delay_ms() as i64)?
            .set_default("capture.interval_ms", default_interval_ms() as i64)?
            .set_default("capture.jpeg_quality", default_jpeg_quality() as i64)?
            .set_default("session.indicator_hold_ms", default_indicator_hold_ms() as i64)?
            .set_default("session.drain_window_ms", default_drain_window_ms() as i64)?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with ATTENDCAM_ prefix
            .add_source(Environment::with_prefix("ATTENDCAM").separator("_"))
            .build()?;

        let config: AttendcamConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.resolution.0 == 0 || self.camera.resolution.1 == 0 {
            return Err(ConfigError::Message(
                "camera.resolution dimensions must be non-zero".to_string(),
            ));
        }

        if !self.channel.url.starts_with("ws://") && !self.channel.url.starts_with("wss://") {
            return Err(ConfigError::Message(format!(
                "channel.url must be a ws:// or wss:// endpoint, got: {}",
                self.channel.url
            )));
        }

        if self.channel.max_retries == 0 {
            return Err(ConfigError::Message(
                "channel.max_retries must be at least 1".to_string(),
            ));
        }

        if self.capture.interval_ms == 0 {
            return Err(ConfigError::Message(
                "capture.interval_ms must be non-zero".to_string(),
            ));
        }

        if self.capture.jpeg_quality == 0 || self.capture.jpeg_quality > 100 {
            return Err(ConfigError::Message(format!(
                "capture.jpeg_quality must be within 1-100, got: {}",
                self.capture.jpeg_quality
            )));
        }

        Ok(())
    }
}

impl Default for AttendcamConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                index: default_camera_index(),
                resolution: default_camera_resolution(),
                facing_mode: default_facing_mode(),
            },
            channel: ChannelConfig {
                url: default_channel_url(),
                auth_token: None,
                max_retries: default_max_retries(),
                base_delay_ms: default_base_delay_ms(),
                max_delay_ms: default_max_delay_ms(),
            },
            capture: CaptureConfig {
                interval_ms: default_interval_ms(),
                jpeg_quality: default_jpeg_quality(),
            },
            session: SessionConfig {
                indicator_hold_ms: default_indicator_hold_ms(),
                drain_window_ms: default_drain_window_ms(),
            },
        }
    }
}

fn default_camera_index() -> u32 {
    0
}

fn default_camera_resolution() -> (u32, u32) {
    (1280, 720)
}

fn default_facing_mode() -> String {
    "user".to_string()
}

fn default_channel_url() -> String {
    "ws://127.0.0.1:8000/ws/attendance".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_jpeg_quality() -> u8 {
    80
}

fn default_indicator_hold_ms() -> u64 {
    2000
}

fn default_drain_window_ms() -> u64 {
    250
}
