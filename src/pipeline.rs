//! Capture → scanout loop
//!
//! Owns the one blocking wait in the process: a poll on the capture and
//! display descriptors. Capture buffers that are on screen stay dequeued
//! until a later flip has replaced them.

use std::io;
use std::os::fd::AsFd;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, instrument, warn};
use v4l::FourCC;

use crate::capture::{CaptureSession, V4l2Device, VideoDevice};
use crate::display::{DrmCard, KmsDevice, KmsDisplay, PixelRole, ScanoutFormat, ScanoutSource};
use crate::error::{Error, Result, ResultExt};
use crate::ioctl::retry;
use crate::{BufferMemory, Config};

const POLL_TIMEOUT_MS: u16 = 1000;

/// The buffer on screen stays out until a later flip; the driver needs another
const MIN_CAMERA_BUFFERS: usize = 2;

/// Display layout of a captured fourcc
fn capture_format(fourcc: FourCC) -> Result<ScanoutFormat> {
    ScanoutFormat::for_role(PixelRole::Capture, &String::from_utf8_lossy(&fourcc.repr))
}

/// Capture buffers between the capture queue and the screen
#[derive(Debug, Default)]
struct Handoff {
    /// Shown by the last completed flip
    on_screen: Option<u32>,
    /// Submitted in the pending flip
    in_flight: Option<u32>,
}

impl Handoff {
    fn submitted(&mut self, index: u32) {
        self.in_flight = Some(index);
    }

    /// A flip completed; returns the buffer it superseded, free to requeue
    fn flipped(&mut self) -> Option<u32> {
        let shown = self.in_flight.take()?;
        self.on_screen.replace(shown)
    }
}

pub struct Pipeline<V = V4l2Device, K = DrmCard>
where
    V: VideoDevice + AsFd,
    K: KmsDevice + AsFd,
{
    display: KmsDisplay<K>,
    capture: CaptureSession<V>,
    test_pattern: bool,
    handoff: Handoff,
    presented: u64,
}

impl Pipeline {
    /// Bring up the display and the capture stream described by `config`
    #[instrument(skip(config))]
    pub fn open(config: Config) -> Result<Self> {
        if !config.display.test_pattern {
            if config.capture.memory != BufferMemory::DmaBuf {
                return Err(Error::config(
                    "scanning out capture buffers requires dmabuf memory",
                ));
            }
            if (config.capture.buffer_count as usize) < MIN_CAMERA_BUFFERS {
                return Err(Error::config(format!(
                    "scanning out capture buffers needs buffer_count >= {MIN_CAMERA_BUFFERS}"
                )));
            }
            if config.capture.format != config.display.camera_format {
                return Err(Error::UnsupportedFormat(format!(
                    "capturing {} but the display imports {}",
                    config.capture.format, config.display.camera_format
                )));
            }
        }
        let test_pattern = config.display.test_pattern;

        let mut display = KmsDisplay::open(config.display)?;
        display.initialize()?;
        display.mode_set()?;

        let mut capture = CaptureSession::open(&config.capture.device, config.capture.clone())?;
        capture.start()?;

        Self::new(capture, display, test_pattern)
    }
}

impl<V, K> Pipeline<V, K>
where
    V: VideoDevice + AsFd,
    K: KmsDevice + AsFd,
{
    /// Join a started capture session and a mode-set display
    ///
    /// Scanning out capture buffers needs a fourcc the display can lay out
    /// and enough buffers that one can stay on screen.
    pub fn new(
        capture: CaptureSession<V>,
        display: KmsDisplay<K>,
        test_pattern: bool,
    ) -> Result<Self> {
        if !test_pattern {
            let format = capture
                .format()
                .ok_or_else(|| Error::invalid_state("capture format not negotiated"))?;
            capture_format(format.fourcc)?;

            let granted = capture.pool().len();
            if granted < MIN_CAMERA_BUFFERS {
                return Err(Error::exhausted(
                    format!("{granted} capture buffers, scanout needs {MIN_CAMERA_BUFFERS}"),
                    Errno::ENOMEM,
                ));
            }
        }

        Ok(Self {
            display,
            capture,
            test_pattern,
            handoff: Handoff::default(),
            presented: 0,
        })
    }

    pub fn capture(&self) -> &CaptureSession<V> {
        &self.capture
    }

    pub fn display(&self) -> &KmsDisplay<K> {
        &self.display
    }

    /// Frames submitted for scanout so far
    pub fn presented(&self) -> u64 {
        self.presented
    }

    /// Run until `limit` frames were submitted, or forever
    pub fn run(&mut self, limit: Option<u64>) -> Result<()> {
        info!(
            "Pipeline running ({})",
            if self.test_pattern { "test pattern" } else { "camera" }
        );
        while limit.map_or(true, |limit| self.presented < limit) {
            self.step()?;
        }
        Ok(())
    }

    /// Wait for either device once and service whatever became ready
    pub fn step(&mut self) -> Result<()> {
        let (capture_ready, display_ready) = {
            let mut fds = [
                PollFd::new(self.capture.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.display.as_fd(), PollFlags::POLLIN),
            ];
            let ready =
                retry(|| poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS))).driver("poll")?;
            if ready == 0 {
                warn!("No capture or display activity for {POLL_TIMEOUT_MS} ms");
                return Ok(());
            }

            let hangup = PollFlags::POLLERR | PollFlags::POLLHUP;
            for (fd, device) in fds.iter().zip(["capture", "display"]) {
                let failed = fd.revents().filter(|events| events.intersects(hangup));
                if let Some(events) = failed {
                    return Err(Error::driver(
                        "poll",
                        io::Error::other(format!("{device} descriptor reported {events:?}")),
                    ));
                }
            }

            let readable = |fd: &PollFd<'_>| {
                fd.revents()
                    .is_some_and(|events| events.intersects(PollFlags::POLLIN))
            };
            (readable(&fds[0]), readable(&fds[1]))
        };

        if display_ready {
            self.on_flip_events()?;
        }
        if capture_ready {
            self.on_capture_frame()?;
        }
        Ok(())
    }

    fn on_flip_events(&mut self) -> Result<()> {
        let completed = self.display.handle_event()?;
        for _ in 0..completed {
            if let Some(index) = self.handoff.flipped() {
                self.capture.requeue(index)?;
            }
        }
        Ok(())
    }

    fn on_capture_frame(&mut self) -> Result<()> {
        let frame = self.capture.dequeue()?;

        if self.test_pattern {
            self.capture.requeue(frame.index)?;
            if !self.display.flip_pending() {
                self.display.scanout(ScanoutSource::TestPattern)?;
                self.presented += 1;
            }
            return Ok(());
        }

        if self.display.flip_pending() {
            debug!(sequence = frame.sequence, "flip pending, dropping frame");
            metrics::counter!("scanout_frames_dropped_total").increment(1);
            return self.capture.requeue(frame.index);
        }

        let result = capture_format(frame.fourcc).and_then(|format| {
            let fds = self.capture.pool().dmabuf_fds(frame.index)?;
            self.display.scanout(ScanoutSource::DmaBuf {
                fds: &fds,
                width: frame.width,
                height: frame.height,
                stride: frame.stride(),
                format,
            })
        });

        match result {
            Ok(()) => {
                self.handoff.submitted(frame.index);
                self.presented += 1;
                Ok(())
            }
            Err(e) => {
                self.capture.requeue(frame.index)?;
                Err(e)
            }
        }
    }
}
