//! Pipeline configuration
//!
//! Configuration is resolved once per init from environment variables
//! layered over defaults, then frozen for the duration of a run. It is
//! only mutated between stop/start cycles (the quality controller
//! rewrites the bitrate before a restart).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VideoError};
use crate::video::backend::DeviceProbe;

/// Default V4L2 capture device
pub const DEFAULT_DEVICE: &str = "/dev/video0";
/// Default VAAPI render node
pub const DEFAULT_VAAPI_DEVICE: &str = "/dev/dri/renderD128";
/// Default target frame rate
pub const DEFAULT_FPS: u32 = 30;
/// Default x264 bitrate token
pub const DEFAULT_BITRATE: &str = "4M";

/// Hardware acceleration mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccelMode {
    /// Probe for VAAPI first, then QSV, else software
    Auto,
    /// Force the VAAPI path
    Vaapi,
    /// Force the Intel QSV path
    Qsv,
    /// Force the libx264 software path
    None,
}

impl HwAccelMode {
    /// Parse a mode string, case-insensitive. Unrecognized values return None.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "vaapi" => Some(Self::Vaapi),
            "qsv" => Some(Self::Qsv),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Vaapi => "vaapi",
            Self::Qsv => "qsv",
            Self::None => "none",
        }
    }
}

/// Video pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capture device path
    pub device: PathBuf,
    /// Target frame rate, accepted range 1-120
    pub fps: u32,
    /// Bitrate token passed to the encoder verbatim (e.g. "4M")
    pub bitrate: String,
    /// Hardware acceleration mode
    pub hwaccel: HwAccelMode,
    /// VAAPI render node path
    pub vaapi_device: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            fps: DEFAULT_FPS,
            bitrate: DEFAULT_BITRATE.to_string(),
            hwaccel: HwAccelMode::Auto,
            vaapi_device: PathBuf::from(DEFAULT_VAAPI_DEVICE),
        }
    }
}

impl PipelineConfig {
    /// Resolve configuration from process environment variables
    ///
    /// Recognized variables: `VIDEO_DEVICE`, `VIDEO_FPS`, `VIDEO_BITRATE`,
    /// `VIDEO_HWACCEL`, `VIDEO_VAAPI_DEVICE`.
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Resolve configuration through an injectable variable lookup
    ///
    /// Invalid or out-of-range values leave the default in place rather
    /// than failing: a misconfigured appliance should still stream.
    pub fn from_env_with<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dev) = lookup("VIDEO_DEVICE").map(|v| v.trim().to_string()) {
            if !dev.is_empty() {
                config.device = PathBuf::from(dev);
            }
        }

        if let Some(fps_str) = lookup("VIDEO_FPS") {
            if let Ok(fps) = fps_str.trim().parse::<u32>() {
                if (1..=120).contains(&fps) {
                    config.fps = fps;
                } else {
                    tracing::warn!("VIDEO_FPS {} out of range 1-120, keeping {}", fps, config.fps);
                }
            }
        }

        if let Some(bitrate) = lookup("VIDEO_BITRATE").map(|v| v.trim().to_string()) {
            if !bitrate.is_empty() {
                // Accepted verbatim, the encoder validates it
                config.bitrate = bitrate;
            }
        }

        if let Some(mode_str) = lookup("VIDEO_HWACCEL") {
            match HwAccelMode::parse(&mode_str) {
                Some(mode) => config.hwaccel = mode,
                None => {
                    tracing::warn!(
                        "Unrecognized VIDEO_HWACCEL {:?}, keeping {}",
                        mode_str.trim(),
                        config.hwaccel.as_str()
                    );
                }
            }
        }

        if let Some(dev) = lookup("VIDEO_VAAPI_DEVICE").map(|v| v.trim().to_string()) {
            if !dev.is_empty() {
                config.vaapi_device = PathBuf::from(dev);
            }
        }

        config
    }

    /// Check that the capture device is present
    ///
    /// Advisory only: the device may disappear after this check, and the
    /// subprocess supervisor handles that failure independently.
    pub fn validate(&self, probe: &dyn DeviceProbe) -> Result<()> {
        if !probe.exists(&self.device) {
            return Err(VideoError::DeviceNotFound {
                device: self.device.display().to_string(),
            });
        }
        Ok(())
    }

    /// Frame interval derived from the configured rate
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(1) / self.fps.max(1)
    }

    /// Device path as a displayable string
    pub fn device_str(&self) -> String {
        self.device.display().to_string()
    }
}
