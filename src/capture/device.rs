//! Capture control protocol
//!
//! [`VideoDevice`] is the request/response surface the capture session is
//! written against. [`V4l2Device`] speaks it to a real multi-planar V4L2
//! node; tests drive the session through scripted implementations.

use std::fs::{File, OpenOptions};
use std::ops::Deref;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info};
use v4l::capability::Flags as CapFlags;
use v4l::FourCC;

use super::format::{FormatDescription, FrameSize, SizeRange};
use super::sys::{self, KernelStruct};
use crate::error::{Error, Result, ResultExt};
use crate::ioctl::retry;
use crate::utils;

/// Capability summary returned by the query-capabilities request
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub version: u32,
    /// Capabilities of this node, `device_caps` when the driver reports them
    pub flags: CapFlags,
}

impl DeviceCapabilities {
    pub fn streaming(&self) -> bool {
        self.flags.contains(CapFlags::STREAMING)
    }

    pub fn multiplanar(&self) -> bool {
        self.flags.contains(CapFlags::VIDEO_CAPTURE_MPLANE)
    }
}

/// Buffer queue the session talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufType {
    VideoCapture,
    VideoCaptureMplane,
}

impl BufType {
    pub fn raw(self) -> u32 {
        match self {
            Self::VideoCapture => sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            Self::VideoCaptureMplane => sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
        }
    }
}

/// Format the session asks the driver to commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    pub fourcc: FourCC,
    pub width: u32,
    pub height: u32,
}

/// Per-plane line pitch and image size chosen by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneFormat {
    pub bytes_per_line: u32,
    pub size_image: u32,
}

/// Format the driver actually committed, possibly adjusted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub fourcc: FourCC,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<PlaneFormat>,
}

/// Where a plane lives in the device's buffer space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: u32,
    pub length: u32,
}

/// Completed capture handed back by dequeue-buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub sequence: u32,
    pub timestamp: Duration,
    pub bytes_used: Vec<u32>,
}

/// Capture control requests, one method per kernel request
///
/// Enumeration requests return `Ok(None)` once `index` runs past the end of
/// the driver's list.
pub trait VideoDevice {
    /// CPU mapping of one plane, unmapped when dropped
    type Mapping: Deref<Target = [u8]>;

    fn query_capabilities(&self) -> Result<DeviceCapabilities>;

    fn enum_format(&self, buf_type: BufType, index: u32) -> Result<Option<FormatDescription>>;

    fn enum_frame_size(&self, fourcc: FourCC, index: u32) -> Result<Option<FrameSize>>;

    fn set_format(&self, request: &FormatRequest) -> Result<NegotiatedFormat>;

    /// Returns the number of buffers the driver actually allocated
    fn request_buffers(&self, count: u32) -> Result<u32>;

    fn query_buffer(&self, index: u32) -> Result<Vec<PlaneLayout>>;

    fn map_plane(&self, index: u32, plane: usize, layout: &PlaneLayout) -> Result<Self::Mapping>;

    fn export_plane(&self, index: u32, plane: usize) -> Result<OwnedFd>;

    fn queue_buffer(&self, index: u32, num_planes: usize) -> Result<()>;

    fn dequeue_buffer(&self, num_planes: usize) -> Result<DequeuedBuffer>;

    fn stream_on(&self) -> Result<()>;

    fn stream_off(&self) -> Result<()>;
}

/// Multi-planar V4L2 capture node
pub struct V4l2Device {
    file: File,
    path: PathBuf,
}

impl V4l2Device {
    /// Open a character device node read-write
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        utils::ensure_char_device(path)?;

        info!("Opening capture device {}", path.display());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::device(path, format!("cannot open: {e}")))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn mplane_buffer(index: u32, planes: &mut [sys::v4l2_plane]) -> sys::v4l2_buffer {
        let mut buf = sys::v4l2_buffer::zeroed();
        buf.index = index;
        buf.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        buf.memory = sys::V4L2_MEMORY_MMAP;
        buf.length = planes.len() as u32;
        buf.m.planes = planes.as_mut_ptr();
        buf
    }
}

impl AsFd for V4l2Device {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl VideoDevice for V4l2Device {
    type Mapping = MmapMut;

    fn query_capabilities(&self) -> Result<DeviceCapabilities> {
        let mut caps = sys::v4l2_capability::zeroed();
        retry(|| unsafe { sys::vidioc_querycap(self.fd(), &mut caps) }).driver("VIDIOC_QUERYCAP")?;

        let bits = if caps.capabilities & sys::V4L2_CAP_DEVICE_CAPS != 0 {
            caps.device_caps
        } else {
            caps.capabilities
        };

        Ok(DeviceCapabilities {
            driver: sys::c_str(&caps.driver),
            card: sys::c_str(&caps.card),
            bus_info: sys::c_str(&caps.bus_info),
            version: caps.version,
            flags: CapFlags::from_bits_truncate(bits),
        })
    }

    fn enum_format(&self, buf_type: BufType, index: u32) -> Result<Option<FormatDescription>> {
        let mut desc = sys::v4l2_fmtdesc::zeroed();
        desc.index = index;
        desc.type_ = buf_type.raw();

        match retry(|| unsafe { sys::vidioc_enum_fmt(self.fd(), &mut desc) }) {
            Ok(_) => Ok(Some(FormatDescription {
                index,
                fourcc: FourCC::from(desc.pixelformat),
                description: sys::c_str(&desc.description),
                compressed: desc.flags & sys::V4L2_FMT_FLAG_COMPRESSED != 0,
            })),
            Err(nix::errno::Errno::EINVAL) => Ok(None),
            Err(e) => Err(Error::driver("VIDIOC_ENUM_FMT", e)),
        }
    }

    fn enum_frame_size(&self, fourcc: FourCC, index: u32) -> Result<Option<FrameSize>> {
        let mut frmsize = sys::v4l2_frmsizeenum::zeroed();
        frmsize.index = index;
        frmsize.pixel_format = u32::from(fourcc);

        match retry(|| unsafe { sys::vidioc_enum_framesizes(self.fd(), &mut frmsize) }) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINVAL) => return Ok(None),
            Err(e) => return Err(Error::driver("VIDIOC_ENUM_FRAMESIZES", e)),
        }

        // SAFETY: the kernel fills the union member selected by `type_`.
        let size = unsafe {
            match frmsize.type_ {
                sys::V4L2_FRMSIZE_TYPE_DISCRETE => FrameSize::Discrete {
                    width: frmsize.size.discrete.width,
                    height: frmsize.size.discrete.height,
                },
                kind => {
                    let s = frmsize.size.stepwise;
                    let width = SizeRange {
                        min: s.min_width,
                        max: s.max_width,
                        step: s.step_width,
                    };
                    let height = SizeRange {
                        min: s.min_height,
                        max: s.max_height,
                        step: s.step_height,
                    };
                    if kind == sys::V4L2_FRMSIZE_TYPE_CONTINUOUS {
                        FrameSize::Continuous { width, height }
                    } else {
                        debug_assert_eq!(kind, sys::V4L2_FRMSIZE_TYPE_STEPWISE);
                        FrameSize::Stepwise { width, height }
                    }
                }
            }
        };
        Ok(Some(size))
    }

    fn set_format(&self, request: &FormatRequest) -> Result<NegotiatedFormat> {
        let mut format = sys::v4l2_format::zeroed();
        format.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        // SAFETY: `pix_mp` is the member selected by the MPLANE buffer type.
        unsafe {
            format.fmt.pix_mp.pixelformat = u32::from(request.fourcc);
            format.fmt.pix_mp.width = request.width;
            format.fmt.pix_mp.height = request.height;
            format.fmt.pix_mp.field = sys::V4L2_FIELD_ANY;
        }

        retry(|| unsafe { sys::vidioc_s_fmt(self.fd(), &mut format) }).driver("VIDIOC_S_FMT")?;

        // SAFETY: as above; the packed struct is copied out by value.
        let pix_mp = unsafe { format.fmt.pix_mp };
        let num_planes = (pix_mp.num_planes as usize).min(sys::VIDEO_MAX_PLANES);
        let plane_fmt = pix_mp.plane_fmt;
        let planes = plane_fmt[..num_planes]
            .iter()
            .map(|p| PlaneFormat {
                bytes_per_line: p.bytesperline,
                size_image: p.sizeimage,
            })
            .collect();

        Ok(NegotiatedFormat {
            fourcc: FourCC::from(pix_mp.pixelformat),
            width: pix_mp.width,
            height: pix_mp.height,
            planes,
        })
    }

    fn request_buffers(&self, count: u32) -> Result<u32> {
        let mut req = sys::v4l2_requestbuffers::zeroed();
        req.count = count;
        req.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        req.memory = sys::V4L2_MEMORY_MMAP;

        retry(|| unsafe { sys::vidioc_reqbufs(self.fd(), &mut req) }).driver("VIDIOC_REQBUFS")?;
        Ok(req.count)
    }

    fn query_buffer(&self, index: u32) -> Result<Vec<PlaneLayout>> {
        let mut planes = [sys::v4l2_plane::zeroed(); sys::VIDEO_MAX_PLANES];
        let mut buf = Self::mplane_buffer(index, &mut planes);

        retry(|| unsafe { sys::vidioc_querybuf(self.fd(), &mut buf) }).driver("VIDIOC_QUERYBUF")?;

        let count = (buf.length as usize).min(sys::VIDEO_MAX_PLANES);
        Ok(planes[..count]
            .iter()
            .map(|p| PlaneLayout {
                // SAFETY: MMAP buffers report their plane offsets in `mem_offset`.
                offset: unsafe { p.m.mem_offset },
                length: p.length,
            })
            .collect())
    }

    fn map_plane(&self, index: u32, plane: usize, layout: &PlaneLayout) -> Result<MmapMut> {
        // SAFETY: the region is owned by the driver for as long as the
        // buffers stay allocated; the pool drops mappings before freeing them.
        unsafe {
            MmapOptions::new()
                .offset(layout.offset as u64)
                .len(layout.length as usize)
                .map_mut(&self.file)
        }
        .map_err(|e| Error::exhausted(format!("mmap of buffer {index} plane {plane}"), e))
    }

    fn export_plane(&self, index: u32, plane: usize) -> Result<OwnedFd> {
        let mut exp = sys::v4l2_exportbuffer::zeroed();
        exp.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        exp.index = index;
        exp.plane = plane as u32;
        exp.flags = (libc::O_CLOEXEC | libc::O_RDWR) as u32;

        retry(|| unsafe { sys::vidioc_expbuf(self.fd(), &mut exp) }).driver("VIDIOC_EXPBUF")?;
        // SAFETY: a successful export hands us a fresh descriptor we now own.
        Ok(unsafe { OwnedFd::from_raw_fd(exp.fd) })
    }

    fn queue_buffer(&self, index: u32, num_planes: usize) -> Result<()> {
        let mut planes = vec![sys::v4l2_plane::zeroed(); num_planes];
        let mut buf = Self::mplane_buffer(index, &mut planes);

        retry(|| unsafe { sys::vidioc_qbuf(self.fd(), &mut buf) }).driver("VIDIOC_QBUF")?;
        Ok(())
    }

    fn dequeue_buffer(&self, num_planes: usize) -> Result<DequeuedBuffer> {
        let mut planes = vec![sys::v4l2_plane::zeroed(); num_planes];
        let mut buf = Self::mplane_buffer(0, &mut planes);

        retry(|| unsafe { sys::vidioc_dqbuf(self.fd(), &mut buf) }).driver("VIDIOC_DQBUF")?;

        let timestamp = Duration::from_secs(buf.timestamp.tv_sec as u64)
            + Duration::from_micros(buf.timestamp.tv_usec as u64);
        debug!(index = buf.index, sequence = buf.sequence, "dequeued buffer");

        let count = (buf.length as usize).min(planes.len());
        Ok(DequeuedBuffer {
            index: buf.index,
            sequence: buf.sequence,
            timestamp,
            bytes_used: planes[..count].iter().map(|p| p.bytesused).collect(),
        })
    }

    fn stream_on(&self) -> Result<()> {
        let buf_type = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE as libc::c_int;
        retry(|| unsafe { sys::vidioc_streamon(self.fd(), &buf_type) }).driver("VIDIOC_STREAMON")?;
        Ok(())
    }

    fn stream_off(&self) -> Result<()> {
        let buf_type = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE as libc::c_int;
        retry(|| unsafe { sys::vidioc_streamoff(self.fd(), &buf_type) })
            .driver("VIDIOC_STREAMOFF")?;
        Ok(())
    }
}
