pub mod capture;
pub mod display;
pub mod error;
pub mod ioctl;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use v4l::FourCC;

pub use error::{Error, Result, TopologyError};

use crate::display::framebuffer::{PixelRole, ScanoutFormat};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub display: DisplayConfig,
}

impl Config {
    /// Load defaults, then an optional TOML file, then `SCANOUT__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("SCANOUT").separator("__"))
            .build()?
            .try_deserialize::<Config>()?;

        config.capture.validate()?;
        config.display.validate()?;
        Ok(config)
    }
}

/// How capture buffers are made reachable once the driver allocated them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferMemory {
    /// Every plane is mapped into our address space
    Mmap,
    /// Every plane is exported as a DMA-BUF descriptor for the display to import
    DmaBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub device: PathBuf,
    /// Four character pixel format code, e.g. `NV12`
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub memory: BufferMemory,
    pub buffer_count: u32,
}

impl CaptureConfig {
    /// Reject configurations that cannot describe a capture session
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::config(format!(
                "capture size {}x{} has a zero dimension",
                self.width, self.height
            )));
        }
        if self.buffer_count == 0 {
            return Err(Error::config("buffer_count must be at least 1"));
        }
        utils::parse_fourcc(&self.format)?;
        Ok(())
    }

    pub fn fourcc(&self) -> Result<FourCC> {
        utils::parse_fourcc(&self.format)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video11"),
            format: "NV12".into(),
            width: 1920,
            height: 1080,
            memory: BufferMemory::Mmap,
            buffer_count: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Candidate DRM nodes, tried in order
    pub devices: Vec<PathBuf>,
    /// Format of GPU composited and test pattern buffers
    pub format: String,
    /// Format of buffers handed over by the capture device
    pub camera_format: String,
    /// Scan out the built-in pattern instead of imported capture buffers
    pub test_pattern: bool,
    /// XRGB8888 colour of the pattern
    pub pattern_color: u32,
}

impl DisplayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(Error::config("no display device candidates configured"));
        }
        self.display_format()?;
        self.camera_format()?;
        Ok(())
    }

    pub fn display_format(&self) -> Result<ScanoutFormat> {
        ScanoutFormat::for_role(PixelRole::Display, &self.format)
    }

    pub fn camera_format(&self) -> Result<ScanoutFormat> {
        ScanoutFormat::for_role(PixelRole::Capture, &self.camera_format)
    }

    /// Format the primary plane must accept for the configured source
    pub fn plane_format(&self) -> Result<ScanoutFormat> {
        if self.test_pattern {
            self.display_format()
        } else {
            self.camera_format()
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            devices: vec![
                "/dev/dri/card0".into(),
                "/dev/dri/card1".into(),
                "/dev/dri/renderD128".into(),
            ],
            format: "XR24".into(),
            camera_format: "NV12".into(),
            test_pattern: true,
            pattern_color: 0x0020_4080,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.capture.validate().is_ok());
        assert!(config.display.validate().is_ok());
        assert_eq!(config.capture.buffer_count, 5);
    }

    #[test]
    fn zero_dimension_is_config_error() {
        let config = CaptureConfig {
            height: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_buffers_is_config_error() {
        let config = CaptureConfig {
            buffer_count: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn three_char_format_is_config_error() {
        let config = CaptureConfig {
            format: "NV1".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn display_rejects_second_format_per_role() {
        let config = DisplayConfig {
            format: "AR24".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn plane_format_follows_source() {
        let mut config = DisplayConfig::default();
        assert_eq!(config.plane_format().unwrap(), ScanoutFormat::Xrgb8888);
        config.test_pattern = false;
        assert_eq!(config.plane_format().unwrap(), ScanoutFormat::Nv12);
    }

    #[test]
    fn loads_toml_and_rejects_unknown_memory_tag() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.toml");
        std::fs::write(
            &good,
            "[capture]\nformat = \"NV12\"\nwidth = 1280\nheight = 720\nmemory = \"dmabuf\"\n",
        )
        .unwrap();
        let config = Config::load(Some(&good)).unwrap();
        assert_eq!(config.capture.width, 1280);
        assert_eq!(config.capture.memory, BufferMemory::DmaBuf);
        assert_eq!(config.capture.buffer_count, 5);

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[capture]\nmemory = \"userptr\"\n").unwrap();
        assert!(matches!(Config::load(Some(&bad)), Err(Error::Config(_))));
    }
}
