use crate::media::{ProbeSettings, RelayParams};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_device")]
    pub device: String,

    #[serde(default = "default_stream_url")]
    pub stream_url: String,

    #[serde(default = "default_captures_dir")]
    pub captures_dir: PathBuf,

    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    #[serde(default = "default_v4l2_ctl_path")]
    pub v4l2_ctl_path: PathBuf,

    #[serde(default = "default_input_format")]
    pub input_format: String,

    #[serde(default = "default_framerate")]
    pub framerate: u32,

    #[serde(default = "default_video_size")]
    pub video_size: String,

    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    #[serde(default = "default_probe_max_attempts")]
    pub probe_max_attempts: u32,

    #[serde(default = "default_probe_attempt_timeout")]
    pub probe_attempt_timeout_secs: u64,

    #[serde(default = "default_capture_timeout")]
    pub capture_timeout_secs: u64,

    #[serde(default = "default_trim_timeout")]
    pub trim_timeout_secs: u64,

    #[serde(default = "default_control_timeout")]
    pub control_timeout_secs: u64,

    #[serde(default = "default_fix_ownership")]
    pub fix_ownership: bool,
}

fn default_device() -> String {
    "/dev/video0".to_string()
}

fn default_stream_url() -> String {
    "rtsp://camera-mediamtx:8554/webcam".to_string()
}

fn default_captures_dir() -> PathBuf {
    PathBuf::from("./captures")
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_v4l2_ctl_path() -> PathBuf {
    PathBuf::from("v4l2-ctl")
}

fn default_input_format() -> String {
    "mjpeg".to_string()
}

fn default_framerate() -> u32 {
    15
}

fn default_video_size() -> String {
    "1280x720".to_string()
}

fn default_probe_interval_ms() -> u64 {
    200
}

fn default_probe_max_attempts() -> u32 {
    25
}

fn default_probe_attempt_timeout() -> u64 {
    10
}

fn default_capture_timeout() -> u64 {
    30
}

fn default_trim_timeout() -> u64 {
    600
}

fn default_control_timeout() -> u64 {
    5
}

fn default_fix_ownership() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: default_device(),
            stream_url: default_stream_url(),
            captures_dir: default_captures_dir(),
            ffmpeg_path: default_ffmpeg_path(),
            v4l2_ctl_path: default_v4l2_ctl_path(),
            input_format: default_input_format(),
            framerate: default_framerate(),
            video_size: default_video_size(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_max_attempts: default_probe_max_attempts(),
            probe_attempt_timeout_secs: default_probe_attempt_timeout(),
            capture_timeout_secs: default_capture_timeout(),
            trim_timeout_secs: default_trim_timeout(),
            control_timeout_secs: default_control_timeout(),
            fix_ownership: default_fix_ownership(),
        }
    }
}

impl Config {
    /// Load configuration from `$CAMCTL_CONFIG` or ~/.config/camctl/config.json
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            tracing::info!(
                "Config file not found at {:?}, creating default config",
                config_path
            );
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let contents = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let config = Self::from_json(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

        tracing::info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        Ok(serde_json::from_str(contents)?)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        tracing::info!("Saved config to {:?}", config_path);
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("CAMCTL_CONFIG") {
            return Ok(PathBuf::from(path));
        }

        let config_dir = if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(dir)
        } else {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            PathBuf::from(home).join(".config")
        };

        Ok(config_dir.join("camctl").join("config.json"))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.device.is_empty() {
            return Err(anyhow::anyhow!("device cannot be empty"));
        }

        if self.stream_url.is_empty() {
            return Err(anyhow::anyhow!("stream_url cannot be empty"));
        }

        if self.captures_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("captures_dir cannot be empty"));
        }

        if self.ffmpeg_path.as_os_str().is_empty() || self.v4l2_ctl_path.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("ffmpeg_path and v4l2_ctl_path cannot be empty"));
        }

        if self.framerate == 0 {
            return Err(anyhow::anyhow!("framerate must be at least 1"));
        }

        if self.probe_max_attempts == 0 {
            return Err(anyhow::anyhow!("probe_max_attempts must be at least 1"));
        }

        let size_ok = self
            .video_size
            .split_once('x')
            .is_some_and(|(w, h)| w.parse::<u32>().is_ok() && h.parse::<u32>().is_ok());
        if !size_ok {
            return Err(anyhow::anyhow!(
                "video_size must look like <width>x<height>, got {:?}",
                self.video_size
            ));
        }

        Ok(())
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            ffmpeg: self.ffmpeg_path.clone(),
            stream_url: self.stream_url.clone(),
            interval: Duration::from_millis(self.probe_interval_ms),
            max_attempts: self.probe_max_attempts,
            attempt_timeout: Duration::from_secs(self.probe_attempt_timeout_secs),
        }
    }

    pub fn relay_params(&self) -> RelayParams {
        RelayParams {
            device: self.device.clone(),
            input_format: self.input_format.clone(),
            framerate: self.framerate,
            video_size: self.video_size.clone(),
            stream_url: self.stream_url.clone(),
        }
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    /// Upper bound on one post-recording re-encode
    pub fn trim_timeout(&self) -> Duration {
        Duration::from_secs(self.trim_timeout_secs)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }
}
