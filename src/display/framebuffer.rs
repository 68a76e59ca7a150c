//! Framebuffer registry and the closed set of scanout pixel formats

use std::os::fd::BorrowedFd;

use drm::buffer::DrmFourcc;
use tracing::{debug, info};

use super::kms::{FramebufferDesc, KmsDevice};
use super::resources::{Acquisitions, Resource};
use crate::error::{Error, Result};

/// Which side of the pipeline produced a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelRole {
    /// GPU composited output and the built-in pattern
    Display,
    /// Buffers handed over by the capture device
    Capture,
}

/// Pixel formats a framebuffer can be registered with, one per role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanoutFormat {
    /// Single plane, 32 bits per pixel
    Xrgb8888,
    /// Luma plane followed by interleaved half-resolution chroma
    Nv12,
}

impl ScanoutFormat {
    /// Accept only the format whitelisted for `role`
    pub fn for_role(role: PixelRole, code: &str) -> Result<Self> {
        match (role, code) {
            (PixelRole::Display, "XR24") => Ok(Self::Xrgb8888),
            (PixelRole::Capture, "NV12") => Ok(Self::Nv12),
            _ => Err(Error::UnsupportedFormat(format!(
                "{code} is not supported for {role:?} buffers"
            ))),
        }
    }

    pub fn drm_fourcc(self) -> DrmFourcc {
        match self {
            Self::Xrgb8888 => DrmFourcc::Xrgb8888,
            Self::Nv12 => DrmFourcc::Nv12,
        }
    }

    /// Little-endian code as listed in a plane's format table
    pub fn code(self) -> u32 {
        self.drm_fourcc() as u32
    }

    pub fn bits_per_pixel(self) -> u32 {
        match self {
            Self::Xrgb8888 => 32,
            Self::Nv12 => 12,
        }
    }

    /// Pair memory handles with pitches and offsets for add-framebuffer
    ///
    /// A single NV12 handle carries chroma right after `stride * height`
    /// bytes of luma; two handles carry one plane each.
    pub fn layout(
        self,
        handles: &[u32],
        width: u32,
        height: u32,
        stride: u32,
    ) -> Result<FramebufferDesc> {
        let mut desc = FramebufferDesc {
            width,
            height,
            format: self.drm_fourcc(),
            handles: [0; 4],
            pitches: [0; 4],
            offsets: [0; 4],
        };

        match (self, handles) {
            (Self::Xrgb8888, &[handle]) => {
                desc.handles[0] = handle;
                desc.pitches[0] = stride;
            }
            (Self::Nv12, &[handle]) => {
                desc.handles[..2].copy_from_slice(&[handle, handle]);
                desc.pitches[..2].copy_from_slice(&[stride, stride]);
                desc.offsets[1] = stride.checked_mul(height).ok_or_else(|| {
                    Error::Unsupported(format!("{height} lines of {stride} bytes overflow"))
                })?;
            }
            (Self::Nv12, &[luma, chroma]) => {
                desc.handles[..2].copy_from_slice(&[luma, chroma]);
                desc.pitches[..2].copy_from_slice(&[stride, stride]);
            }
            _ => {
                return Err(Error::Unsupported(format!(
                    "{self:?} framebuffer from {} memory handles",
                    handles.len()
                )))
            }
        }
        Ok(desc)
    }
}

/// Framebuffer built from imported DMA-BUF memory for one frame
///
/// Holds the GEM handles and the framebuffer; releasing it removes the
/// framebuffer before closing the handles.
#[derive(Debug)]
pub struct FrameImport {
    fb: u32,
    held: Acquisitions,
}

impl FrameImport {
    pub fn fb(&self) -> u32 {
        self.fb
    }

    fn release<K: KmsDevice>(mut self, kms: &K) {
        self.held.release_all(kms);
    }
}

/// Tracks every framebuffer the display session registered
///
/// The pattern framebuffer lives for the whole session and is held on the
/// session's acquisition list. Imported frames are registered per scanout:
/// the one on screen is `current`, and the one it replaced is `retiring`
/// until the flip that superseded it completes.
#[derive(Debug, Default)]
pub struct FramebufferRegistry {
    pattern_fb: Option<u32>,
    current: Option<FrameImport>,
    retiring: Option<FrameImport>,
}

impl FramebufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pattern_fb(&self) -> Option<u32> {
        self.pattern_fb
    }

    pub fn current_fb(&self) -> Option<u32> {
        self.current.as_ref().map(FrameImport::fb)
    }

    pub fn retiring_fb(&self) -> Option<u32> {
        self.retiring.as_ref().map(FrameImport::fb)
    }

    /// Register GEM memory as a framebuffer; the caller owns the result
    pub fn create_from_memory<K: KmsDevice>(
        kms: &K,
        handles: &[u32],
        width: u32,
        height: u32,
        stride: u32,
        format: ScanoutFormat,
    ) -> Result<u32> {
        let desc = format.layout(handles, width, height, stride)?;
        let fb = kms.add_fb(&desc)?;
        debug!(fb, ?format, width, height, stride, "framebuffer registered");
        Ok(fb)
    }

    pub fn destroy<K: KmsDevice>(kms: &K, fb: u32) -> Result<()> {
        kms.remove_fb(fb)
    }

    /// Allocate, fill and register the solid colour pattern
    ///
    /// The dumb buffer and framebuffer go on `held`. The CPU mapping only
    /// lives while the pattern is drawn.
    pub fn create_test_pattern<K: KmsDevice>(
        &mut self,
        kms: &K,
        held: &mut Acquisitions,
        width: u32,
        height: u32,
        color: u32,
    ) -> Result<u32> {
        if let Some(fb) = self.pattern_fb {
            return Ok(fb);
        }

        let format = ScanoutFormat::Xrgb8888;
        let mut scope = held.scope(kms);

        let dumb = kms.create_dumb(width, height, format.bits_per_pixel())?;
        scope.push(Resource::DumbBuffer(dumb.handle));

        kms.fill_dumb(dumb.handle, color)?;

        let fb = Self::create_from_memory(kms, &[dumb.handle], width, height, dumb.pitch, format)?;
        scope.push(Resource::Framebuffer(fb));
        scope.commit();

        info!("Test pattern {width}x{height} #{color:06x} as framebuffer {fb}");
        self.pattern_fb = Some(fb);
        Ok(fb)
    }

    /// Import the DMA-BUF planes of one frame and register them
    ///
    /// Nothing is left registered if any step fails.
    pub fn import_frame<K: KmsDevice>(
        kms: &K,
        fds: &[BorrowedFd<'_>],
        width: u32,
        height: u32,
        stride: u32,
        format: ScanoutFormat,
    ) -> Result<FrameImport> {
        let mut held = Acquisitions::new();
        let mut scope = held.scope(kms);

        let mut handles = Vec::with_capacity(fds.len());
        for fd in fds {
            let gem = kms.import_dmabuf(*fd)?;
            scope.push(Resource::GemHandle(gem));
            handles.push(gem);
        }

        let fb = Self::create_from_memory(kms, &handles, width, height, stride, format)?;
        scope.push(Resource::Framebuffer(fb));
        scope.commit();

        Ok(FrameImport { fb, held })
    }

    /// `import` is now on its way to the screen; the frame it replaces retires
    pub fn present(&mut self, import: FrameImport) {
        self.retiring = self.current.replace(import);
    }

    /// The pattern is on its way to the screen; any imported frame retires
    pub fn present_pattern(&mut self) {
        if let Some(previous) = self.current.take() {
            self.retiring = Some(previous);
        }
    }

    /// Drop an import whose flip was never submitted
    pub fn discard<K: KmsDevice>(&mut self, kms: &K, import: FrameImport) {
        debug!(fb = import.fb, "discarding unsubmitted frame");
        import.release(kms);
    }

    /// A flip completed: the frame it superseded can go
    pub fn retire<K: KmsDevice>(&mut self, kms: &K) {
        if let Some(old) = self.retiring.take() {
            debug!(fb = old.fb, "retiring frame");
            old.release(kms);
        }
    }

    /// Release every imported frame, newest first
    ///
    /// The pattern stays registered; it goes with the session's list.
    pub fn release<K: KmsDevice>(&mut self, kms: &K) {
        self.retire(kms);
        if let Some(current) = self.current.take() {
            current.release(kms);
        }
    }

}
