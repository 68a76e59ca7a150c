//! Display control protocol
//!
//! Every KMS object is addressed by its raw 32-bit id so the resolver and
//! the commit scheduler stay independent of any one binding.

use std::collections::HashMap;
use std::os::fd::BorrowedFd;
use std::time::Duration;

use drm::buffer::DrmFourcc;
use drm::control::AtomicCommitFlags;

use crate::error::{Error, Result};

/// Kernel object classes the session acquires and hands back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Connector,
    Encoder,
    Crtc,
    Plane,
}

impl ObjectKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Connector => "connector",
            Self::Encoder => "encoder",
            Self::Crtc => "crtc",
            Self::Plane => "plane",
        }
    }
}

/// Value of the `type` property of primary planes
pub const PLANE_TYPE_PRIMARY: u64 = drm::control::PlaneType::Primary as u64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardResources {
    pub framebuffers: Vec<u32>,
    pub crtcs: Vec<u32>,
    pub connectors: Vec<u32>,
    pub encoders: Vec<u32>,
}

impl CardResources {
    /// Position of `crtc` in the global CRTC list, the bit it occupies in masks
    pub fn crtc_index(&self, crtc: u32) -> Option<usize> {
        self.crtcs.iter().position(|&c| c == crtc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    Connected,
    Disconnected,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeInfo {
    /// Position in the connector's mode list
    pub index: usize,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub vrefresh: u32,
    pub preferred: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub id: u32,
    pub name: String,
    pub connection: Connection,
    pub modes: Vec<ModeInfo>,
    pub encoders: Vec<u32>,
    pub current_encoder: Option<u32>,
}

impl ConnectorInfo {
    /// The preferred mode, else the first one listed
    pub fn pick_mode(&self) -> Option<&ModeInfo> {
        self.modes
            .iter()
            .find(|m| m.preferred)
            .or_else(|| self.modes.first())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderInfo {
    pub id: u32,
    pub current_crtc: Option<u32>,
    /// Bit `i` set means the i-th CRTC of the resource list can drive it
    pub possible_crtcs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrtcInfo {
    pub id: u32,
    pub framebuffer: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneInfo {
    pub id: u32,
    pub possible_crtcs: u32,
    pub formats: Vec<u32>,
    pub current_crtc: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Property {
    pub id: u32,
    pub value: u64,
}

/// Properties of one object keyed by name
pub type PropertyMap = HashMap<String, Property>;

/// Look up a property a commit cannot do without
pub fn require_property(
    props: &PropertyMap,
    kind: ObjectKind,
    object: u32,
    name: &'static str,
) -> Result<u32> {
    props
        .get(name)
        .map(|p| p.id)
        .ok_or(Error::PropertyLookup {
            object: kind.name(),
            id: object,
            property: name,
        })
}

/// Property writes applied together or not at all
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicRequest {
    entries: Vec<(u32, u32, u64)>,
}

impl AtomicRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, object: u32, property: u32, value: u64) {
        self.entries.push((object, property, value));
    }

    /// `(object, property, value)` in insertion order
    pub fn entries(&self) -> &[(u32, u32, u64)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Layout handed to add-framebuffer; unused planes carry handle 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferDesc {
    pub width: u32,
    pub height: u32,
    pub format: DrmFourcc,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbBufferInfo {
    pub handle: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
}

/// Completion of a page-flip commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipEvent {
    pub sequence: u32,
    pub timestamp: Duration,
    pub crtc: u32,
}

/// KMS requests used by the display session
pub trait KmsDevice {
    fn resources(&self) -> Result<CardResources>;

    fn connector_info(&self, id: u32) -> Result<ConnectorInfo>;

    fn encoder_info(&self, id: u32) -> Result<EncoderInfo>;

    fn crtc_info(&self, id: u32) -> Result<CrtcInfo>;

    fn plane_ids(&self) -> Result<Vec<u32>>;

    fn plane_info(&self, id: u32) -> Result<PlaneInfo>;

    fn object_properties(&self, id: u32, kind: ObjectKind) -> Result<PropertyMap>;

    /// Hand back an object looked up earlier; only meaningful for bindings
    /// that allocate per lookup
    fn release_object(&self, _kind: ObjectKind, _id: u32) {}

    fn create_mode_blob(&self, connector: u32, mode: &ModeInfo) -> Result<u64>;

    fn destroy_blob(&self, blob: u64) -> Result<()>;

    fn commit(&self, request: &AtomicRequest, flags: AtomicCommitFlags) -> Result<()>;

    fn add_fb(&self, desc: &FramebufferDesc) -> Result<u32>;

    fn remove_fb(&self, fb: u32) -> Result<()>;

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> Result<DumbBufferInfo>;

    /// Map the dumb buffer, fill every pixel with `color`, then unmap it
    fn fill_dumb(&self, handle: u32, color: u32) -> Result<()>;

    fn destroy_dumb(&self, handle: u32) -> Result<()>;

    /// Translate a DMA-BUF descriptor into a GEM handle
    fn import_dmabuf(&self, fd: BorrowedFd<'_>) -> Result<u32>;

    fn close_gem(&self, handle: u32) -> Result<()>;

    /// Completion events currently readable; never blocks for more
    fn read_flip_events(&self) -> Result<Vec<FlipEvent>>;
}
