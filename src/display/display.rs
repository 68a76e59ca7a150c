//! KMS scanout session
//!
//! Walks `Closed → TopologyResolved → ModeCommitted → Flipping`. The session
//! never waits on the device itself: the caller polls its descriptor and
//! calls [`KmsDisplay::handle_event`] once it is readable.

use std::os::fd::{AsFd, BorrowedFd};

use tracing::{debug, info, instrument};

use super::card::{self, DrmCard};
use super::commit::{AtomicCommitScheduler, FrameState};
use super::framebuffer::{FramebufferRegistry, ScanoutFormat};
use super::kms::KmsDevice;
use super::resources::Acquisitions;
use super::topology::{Topology, TopologyResolver};
use crate::error::{Error, Result};
use crate::DisplayConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    Closed,
    TopologyResolved,
    ModeCommitted,
    Flipping,
}

/// What to put on screen next
#[derive(Debug, Clone, Copy)]
pub enum ScanoutSource<'a> {
    TestPattern,
    /// Capture or GPU buffer exported as one DMA-BUF per plane
    DmaBuf {
        fds: &'a [BorrowedFd<'a>],
        width: u32,
        height: u32,
        stride: u32,
        format: ScanoutFormat,
    },
}

pub struct KmsDisplay<K: KmsDevice = DrmCard> {
    kms: K,
    config: DisplayConfig,
    plane_format: ScanoutFormat,
    state: DisplayState,
    acquisitions: Acquisitions,
    registry: FramebufferRegistry,
    topology: Option<Topology>,
    scheduler: Option<AtomicCommitScheduler>,
}

impl KmsDisplay<DrmCard> {
    /// Probe the configured candidates and open the first usable card
    pub fn open(config: DisplayConfig) -> Result<Self> {
        config.validate()?;
        let card = card::probe(&config.devices)?;
        Self::with_device(card, config)
    }
}

impl<K: KmsDevice> KmsDisplay<K> {
    pub fn with_device(kms: K, config: DisplayConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            plane_format: config.plane_format()?,
            kms,
            config,
            state: DisplayState::Closed,
            acquisitions: Acquisitions::new(),
            registry: FramebufferRegistry::new(),
            topology: None,
            scheduler: None,
        })
    }

    pub fn device(&self) -> &K {
        &self.kms
    }

    pub fn state(&self) -> DisplayState {
        self.state
    }

    pub fn topology(&self) -> Option<&Topology> {
        self.topology.as_ref()
    }

    pub fn registry(&self) -> &FramebufferRegistry {
        &self.registry
    }

    pub fn acquisitions(&self) -> &Acquisitions {
        &self.acquisitions
    }

    pub fn frame_state(&self) -> Option<&FrameState> {
        self.scheduler.as_ref().map(AtomicCommitScheduler::state)
    }

    pub fn flip_pending(&self) -> bool {
        self.frame_state().is_some_and(FrameState::flip_pending)
    }

    /// Resolve the output path and build the pattern framebuffer
    ///
    /// Everything acquired is handed back if any step fails.
    #[instrument(skip(self))]
    pub fn initialize(&mut self) -> Result<&Topology> {
        if self.state != DisplayState::Closed {
            return Err(Error::invalid_state(format!(
                "initialize called in {:?}",
                self.state
            )));
        }

        let mut scope = self.acquisitions.scope(&self.kms);
        let resolver = TopologyResolver::new(&self.kms)?;
        let topology = resolver.resolve(self.plane_format.code(), &mut scope)?;

        self.registry.create_test_pattern(
            &self.kms,
            &mut scope,
            topology.mode.width,
            topology.mode.height,
            self.config.pattern_color,
        )?;
        scope.commit();

        self.state = DisplayState::TopologyResolved;
        Ok(self.topology.insert(topology))
    }

    /// Commit the pinned mode with the pattern on the primary plane
    pub fn mode_set(&mut self) -> Result<()> {
        if self.state != DisplayState::TopologyResolved {
            return Err(Error::invalid_state(format!(
                "mode set called in {:?}",
                self.state
            )));
        }
        let (topology, fb) = match (&self.topology, self.registry.pattern_fb()) {
            (Some(topology), Some(fb)) => (topology, fb),
            _ => return Err(Error::invalid_state("topology not resolved")),
        };

        let mut scheduler = AtomicCommitScheduler::new(topology);
        let size = (topology.mode.width, topology.mode.height);
        scheduler.mode_set(&self.kms, &mut self.acquisitions, topology, fb, size)?;

        self.scheduler = Some(scheduler);
        self.state = DisplayState::ModeCommitted;
        Ok(())
    }

    /// Submit a non-blocking flip to `source`
    ///
    /// Rejected with [`Error::FlipPending`] while the previous flip has not
    /// completed; the caller decides whether to drop or retry the frame.
    pub fn scanout(&mut self, source: ScanoutSource<'_>) -> Result<()> {
        let scheduler = match (self.state, self.scheduler.as_mut()) {
            (DisplayState::ModeCommitted | DisplayState::Flipping, Some(scheduler)) => scheduler,
            _ => {
                return Err(Error::invalid_state(format!(
                    "scanout called in {:?}",
                    self.state
                )))
            }
        };
        if scheduler.state().flip_pending() {
            return Err(Error::FlipPending);
        }

        match source {
            ScanoutSource::TestPattern => {
                let fb = self
                    .registry
                    .pattern_fb()
                    .ok_or_else(|| Error::invalid_state("no pattern framebuffer"))?;
                scheduler.update(&self.kms, fb)?;
                self.registry.present_pattern();
            }
            ScanoutSource::DmaBuf {
                fds,
                width,
                height,
                stride,
                format,
            } => {
                if let Some(topology) = &self.topology {
                    if (width, height) != (topology.mode.width, topology.mode.height) {
                        return Err(Error::Unsupported(format!(
                            "scaling {width}x{height} to {}x{}",
                            topology.mode.width, topology.mode.height
                        )));
                    }
                    if !topology.plane_formats.contains(&format.code()) {
                        return Err(Error::UnsupportedFormat(format!(
                            "plane {} does not scan out {format:?}",
                            topology.plane
                        )));
                    }
                }

                let import = FramebufferRegistry::import_frame(
                    &self.kms, fds, width, height, stride, format,
                )?;
                if let Err(e) = scheduler.update(&self.kms, import.fb()) {
                    self.registry.discard(&self.kms, import);
                    return Err(e);
                }
                self.registry.present(import);
            }
        }

        self.state = DisplayState::Flipping;
        Ok(())
    }

    /// Drain the completion events that are readable right now
    ///
    /// Returns how many of our flips completed.
    pub fn handle_event(&mut self) -> Result<usize> {
        let Some(scheduler) = self.scheduler.as_mut() else {
            return Err(Error::invalid_state("no mode committed"));
        };

        let mut completed = 0;
        for event in self.kms.read_flip_events()? {
            if scheduler.complete(&event) {
                self.registry.retire(&self.kms);
                completed += 1;
            }
        }
        if completed > 0 {
            debug!(
                sequence = scheduler.state().sequence(),
                "{completed} flips completed"
            );
        }
        Ok(completed)
    }
}

impl<K: KmsDevice + AsFd> AsFd for KmsDisplay<K> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.kms.as_fd()
    }
}

impl<K: KmsDevice> Drop for KmsDisplay<K> {
    fn drop(&mut self) {
        // Imported frames first, then the session list newest first
        self.registry.release(&self.kms);
        let released = self.acquisitions.release_all(&self.kms);
        if released > 0 {
            info!("Display released {released} kernel objects");
        }
    }
}
