//! Multi-planar V4L2 capture session

use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;

use tracing::{debug, error, info, instrument, warn};
use v4l::FourCC;

use super::device::{
    BufType, DeviceCapabilities, FormatRequest, NegotiatedFormat, V4l2Device, VideoDevice,
};
use super::format::{size_supported, FormatDescription, FrameSize};
use super::frame::CapturedFrame;
use super::pool::CaptureBufferPool;
use crate::error::{Error, Result};
use crate::CaptureConfig;

/// One capture stream on one device
///
/// `start` walks capabilities, format, buffers and streaming in order;
/// dropping the session stops streaming, releases the buffers and closes
/// the device.
pub struct CaptureSession<D: VideoDevice = V4l2Device> {
    pool: CaptureBufferPool<D::Mapping>,
    device: D,
    config: CaptureConfig,
    fourcc: FourCC,
    capabilities: Option<DeviceCapabilities>,
    multiplanar: bool,
    format: Option<NegotiatedFormat>,
    streaming: bool,
}

impl CaptureSession<V4l2Device> {
    /// Validate `config`, then open the device node at `path`
    pub fn open(path: impl AsRef<Path>, config: CaptureConfig) -> Result<Self> {
        config.validate()?;
        let device = V4l2Device::open(path)?;
        Self::with_device(device, config)
    }
}

impl<D: VideoDevice> CaptureSession<D> {
    pub fn with_device(device: D, config: CaptureConfig) -> Result<Self> {
        config.validate()?;
        let fourcc = config.fourcc()?;
        Ok(Self {
            pool: CaptureBufferPool::new(config.memory),
            device,
            config,
            fourcc,
            capabilities: None,
            multiplanar: false,
            format: None,
            streaming: false,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn pool(&self) -> &CaptureBufferPool<D::Mapping> {
        &self.pool
    }

    pub fn format(&self) -> Option<&NegotiatedFormat> {
        self.format.as_ref()
    }

    pub fn is_multiplanar(&self) -> bool {
        self.multiplanar
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn check_capabilities(&mut self) -> Result<&DeviceCapabilities> {
        let caps = self.device.query_capabilities()?;
        info!(
            "Device: {} ({}) on {}, version {}.{}.{}",
            caps.card,
            caps.driver,
            caps.bus_info,
            (caps.version >> 16) & 0xff,
            (caps.version >> 8) & 0xff,
            caps.version & 0xff
        );

        if !caps.streaming() {
            return Err(Error::Unsupported(format!(
                "{} does not support streaming I/O",
                caps.card
            )));
        }

        self.multiplanar = caps.multiplanar();
        if !self.multiplanar {
            warn!("{} only offers single-planar capture", caps.card);
        }
        Ok(self.capabilities.insert(caps))
    }

    /// Every format the device offers on the active buffer queue
    pub fn formats(&self) -> Result<Vec<FormatDescription>> {
        let buf_type = if self.multiplanar {
            BufType::VideoCaptureMplane
        } else {
            BufType::VideoCapture
        };

        let mut formats = Vec::new();
        while let Some(format) = self.device.enum_format(buf_type, formats.len() as u32)? {
            formats.push(format);
        }
        Ok(formats)
    }

    pub fn frame_sizes(&self, fourcc: FourCC) -> Result<Vec<FrameSize>> {
        let mut sizes = Vec::new();
        while let Some(size) = self.device.enum_frame_size(fourcc, sizes.len() as u32)? {
            sizes.push(size);
        }
        Ok(sizes)
    }

    /// Check the configured fourcc and frame size against what the device offers
    pub fn check_format(&mut self) -> Result<()> {
        let formats = self.formats()?;
        if formats.is_empty() {
            return Err(Error::Format("device offers no formats".into()));
        }
        for format in &formats {
            debug!(
                "Format {}: {} ({}){}",
                format.index,
                format.fourcc,
                format.description,
                if format.compressed { " compressed" } else { "" }
            );
        }

        if !formats.iter().any(|f| f.fourcc == self.fourcc) {
            return Err(Error::Format(format!(
                "{} is not offered by the device",
                self.fourcc
            )));
        }

        let (width, height) = (self.config.width, self.config.height);
        let sizes = self.frame_sizes(self.fourcc)?;
        if sizes.is_empty() {
            debug!("No frame sizes reported for {}, accepting {width}x{height}", self.fourcc);
        }
        if !size_supported(&sizes, width, height) {
            return Err(Error::Size {
                fourcc: self.fourcc.to_string(),
                width,
                height,
            });
        }
        Ok(())
    }

    pub fn set_format(&mut self) -> Result<&NegotiatedFormat> {
        self.require_multiplanar()?;

        let request = FormatRequest {
            fourcc: self.fourcc,
            width: self.config.width,
            height: self.config.height,
        };
        let format = self.device.set_format(&request)?;

        if format.fourcc != request.fourcc {
            warn!("Driver changed format: {} -> {}", request.fourcc, format.fourcc);
        }
        if (format.width, format.height) != (request.width, request.height) {
            warn!(
                "Driver changed resolution: {}x{} -> {}x{}",
                request.width, request.height, format.width, format.height
            );
        }
        info!(
            "Format set: {} {}x{}, {} planes",
            format.fourcc,
            format.width,
            format.height,
            format.planes.len()
        );
        Ok(self.format.insert(format))
    }

    pub fn request_buffers(&mut self) -> Result<u32> {
        self.require_multiplanar()?;
        self.pool.request(&self.device, self.config.buffer_count)
    }

    pub fn map_buffers(&mut self) -> Result<()> {
        self.pool.map(&self.device)
    }

    pub fn queue_buffers(&mut self) -> Result<()> {
        self.pool.queue_all(&self.device)
    }

    /// Run the whole bring-up sequence and start streaming
    ///
    /// On failure the device is left not streaming and any buffers acquired
    /// along the way are released.
    #[instrument(skip(self), fields(format = %self.fourcc, width = self.config.width, height = self.config.height))]
    pub fn start(&mut self) -> Result<()> {
        if self.streaming {
            return Err(Error::invalid_state("capture is already streaming"));
        }

        if let Err(err) = self.bring_up() {
            if let Err(release) = self.pool.release(&self.device) {
                warn!("Releasing buffers after failed start: {release}");
            }
            return Err(err);
        }

        self.streaming = true;
        info!("Capture streaming with {} buffers", self.pool.len());
        Ok(())
    }

    fn bring_up(&mut self) -> Result<()> {
        self.check_capabilities()?;
        self.check_format()?;
        self.set_format()?;
        self.request_buffers()?;
        self.map_buffers()?;
        self.queue_buffers()?;
        self.device.stream_on()
    }

    /// Stop streaming and release every buffer
    pub fn stop(&mut self) -> Result<()> {
        let stopped = if self.streaming {
            self.streaming = false;
            info!("Capture stopped");
            self.device.stream_off()
        } else {
            Ok(())
        };
        let released = self.pool.release(&self.device);
        stopped.and(released)
    }

    /// Block until the driver hands back the next filled buffer
    pub fn dequeue(&mut self) -> Result<CapturedFrame> {
        if !self.streaming {
            return Err(Error::invalid_state("capture is not streaming"));
        }
        let format = self
            .format
            .as_ref()
            .ok_or_else(|| Error::invalid_state("no format negotiated"))?;

        let buffer = self.pool.dequeue(&self.device)?;
        metrics::counter!("scanout_capture_frames_total").increment(1);
        Ok(CapturedFrame::new(buffer, format))
    }

    pub fn requeue(&mut self, index: u32) -> Result<()> {
        self.pool.requeue(&self.device, index)
    }

    /// Persisting frames is left to external tooling
    pub fn save_to_file(&self, frame: &CapturedFrame, path: impl AsRef<Path>) -> Result<()> {
        debug!(
            "Not saving frame {} to {}",
            frame.sequence,
            path.as_ref().display()
        );
        Ok(())
    }

    fn require_multiplanar(&self) -> Result<()> {
        if self.multiplanar {
            Ok(())
        } else {
            Err(Error::Unsupported("single-planar capture buffers".into()))
        }
    }
}

impl<D: VideoDevice + AsFd> AsFd for CaptureSession<D> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.device.as_fd()
    }
}

impl<D: VideoDevice> Drop for CaptureSession<D> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Capture teardown failed: {e}");
        }
    }
}
