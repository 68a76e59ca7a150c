//! Scripted capture and display devices
//!
//! Both mocks record every request they receive and can be told to fail at
//! a chosen point. Shared state sits behind `Rc` so a test can keep looking
//! at it after the session that owned the device is gone.

#![allow(dead_code)]

use std::cell::{Cell, OnceCell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io;
use std::ops::Deref;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use drm::buffer::DrmFourcc;
use drm::control::AtomicCommitFlags;
use scanout::capture::device::{
    BufType, DequeuedBuffer, DeviceCapabilities, FormatRequest, NegotiatedFormat, PlaneFormat,
    PlaneLayout, VideoDevice,
};
use scanout::capture::format::{FormatDescription, FrameSize};
use scanout::display::kms::{
    AtomicRequest, CardResources, Connection, ConnectorInfo, CrtcInfo, DumbBufferInfo,
    EncoderInfo, FlipEvent, FramebufferDesc, KmsDevice, ModeInfo, ObjectKind, PlaneInfo,
    Property, PropertyMap, PLANE_TYPE_PRIMARY,
};
use scanout::display::resources::Resource;
use scanout::{CaptureConfig, DisplayConfig, Error, Result};
use v4l::capability::Flags as CapFlags;
use v4l::FourCC;

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    QueryCapabilities,
    EnumFormat(u32),
    EnumFrameSize(u32),
    SetFormat,
    RequestBuffers(u32),
    QueryBuffer(u32),
    MapPlane(u32, usize),
    ExportPlane(u32, usize),
    Queue(u32),
    Dequeue,
    StreamOn,
    StreamOff,
}

/// CPU mapping that keeps the live-mapping counter honest
pub struct MockMapping {
    data: Vec<u8>,
    live: Rc<Cell<usize>>,
}

impl Deref for MockMapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for MockMapping {
    fn drop(&mut self) {
        self.live.set(self.live.get() - 1);
    }
}

pub struct MockVideoDevice {
    pub capabilities: CapFlags,
    pub formats: Vec<FourCC>,
    pub sizes: Vec<FrameSize>,
    /// Upper bound on what request-buffers grants
    pub granted: Option<u32>,
    pub planes: usize,
    pub plane_length: u32,
    /// Size the driver commits instead of the requested one
    pub adjust_size: Option<(u32, u32)>,
    /// Fail mapping or exporting this (buffer, plane)
    pub fail_map: Option<(u32, usize)>,
    pub fail_queue: Option<u32>,
    pub fail_stream_on: bool,
    pub calls: Rc<RefCell<Vec<Call>>>,
    pub live_mappings: Rc<Cell<usize>>,
    queued: RefCell<VecDeque<u32>>,
    sequence: Cell<u32>,
    node: OnceCell<File>,
}

impl MockVideoDevice {
    /// Multi-planar NV12 camera offering exactly 1920x1080
    pub fn nv12_1080p() -> Self {
        Self {
            capabilities: CapFlags::VIDEO_CAPTURE_MPLANE | CapFlags::STREAMING,
            formats: vec![FourCC::new(b"YUYV"), FourCC::new(b"NV12")],
            sizes: vec![FrameSize::Discrete {
                width: 1920,
                height: 1080,
            }],
            granted: None,
            planes: 1,
            plane_length: 4096,
            adjust_size: None,
            fail_map: None,
            fail_queue: None,
            fail_stream_on: false,
            calls: Rc::default(),
            live_mappings: Rc::default(),
            queued: RefCell::default(),
            sequence: Cell::new(0),
            node: OnceCell::new(),
        }
    }

    /// Descriptor polls as hung up from now on
    pub fn hung_up(self) -> Self {
        let (ours, peer) = UnixStream::pair().unwrap();
        drop(peer);
        self.node.set(File::from(OwnedFd::from(ours))).unwrap();
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }

    fn injected(&self, index: u32, plane: usize) -> Result<()> {
        if self.fail_map == Some((index, plane)) {
            return Err(Error::exhausted(
                format!("buffer {index} plane {plane}"),
                io::Error::from_raw_os_error(libc::ENOMEM),
            ));
        }
        Ok(())
    }
}

/// Always readable, so a poll loop services the device on every pass
fn null_node(node: &OnceCell<File>) -> BorrowedFd<'_> {
    node.get_or_init(|| File::open("/dev/null").unwrap()).as_fd()
}

impl AsFd for MockVideoDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        null_node(&self.node)
    }
}

pub fn count(calls: &[Call], pred: impl Fn(&Call) -> bool) -> usize {
    calls.iter().filter(|c| pred(c)).count()
}

impl VideoDevice for MockVideoDevice {
    type Mapping = MockMapping;

    fn query_capabilities(&self) -> Result<DeviceCapabilities> {
        self.record(Call::QueryCapabilities);
        Ok(DeviceCapabilities {
            driver: "mock".into(),
            card: "Mock Camera".into(),
            bus_info: "platform:mock".into(),
            version: 0x0006_0800,
            flags: self.capabilities,
        })
    }

    fn enum_format(&self, _buf_type: BufType, index: u32) -> Result<Option<FormatDescription>> {
        self.record(Call::EnumFormat(index));
        Ok(self
            .formats
            .get(index as usize)
            .map(|&fourcc| FormatDescription {
                index,
                fourcc,
                description: String::from_utf8_lossy(&fourcc.repr).into_owned(),
                compressed: false,
            }))
    }

    fn enum_frame_size(&self, _fourcc: FourCC, index: u32) -> Result<Option<FrameSize>> {
        self.record(Call::EnumFrameSize(index));
        Ok(self.sizes.get(index as usize).copied())
    }

    fn set_format(&self, request: &FormatRequest) -> Result<NegotiatedFormat> {
        self.record(Call::SetFormat);
        let (width, height) = self.adjust_size.unwrap_or((request.width, request.height));
        Ok(NegotiatedFormat {
            fourcc: request.fourcc,
            width,
            height,
            planes: vec![
                PlaneFormat {
                    bytes_per_line: width,
                    size_image: self.plane_length,
                };
                self.planes
            ],
        })
    }

    fn request_buffers(&self, count: u32) -> Result<u32> {
        self.record(Call::RequestBuffers(count));
        Ok(self.granted.map_or(count, |granted| granted.min(count)))
    }

    fn query_buffer(&self, index: u32) -> Result<Vec<PlaneLayout>> {
        self.record(Call::QueryBuffer(index));
        Ok((0..self.planes)
            .map(|plane| PlaneLayout {
                offset: index * 0x10_0000 + plane as u32 * self.plane_length,
                length: self.plane_length,
            })
            .collect())
    }

    fn map_plane(&self, index: u32, plane: usize, layout: &PlaneLayout) -> Result<MockMapping> {
        self.record(Call::MapPlane(index, plane));
        self.injected(index, plane)?;
        self.live_mappings.set(self.live_mappings.get() + 1);
        Ok(MockMapping {
            data: vec![index as u8; layout.length as usize],
            live: Rc::clone(&self.live_mappings),
        })
    }

    fn export_plane(&self, index: u32, plane: usize) -> Result<OwnedFd> {
        self.record(Call::ExportPlane(index, plane));
        self.injected(index, plane)?;
        Ok(OwnedFd::from(File::open("/dev/null")?))
    }

    fn queue_buffer(&self, index: u32, _num_planes: usize) -> Result<()> {
        self.record(Call::Queue(index));
        if self.fail_queue == Some(index) {
            return Err(Error::driver(
                "VIDIOC_QBUF",
                io::Error::from_raw_os_error(libc::EINVAL),
            ));
        }
        self.queued.borrow_mut().push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&self, num_planes: usize) -> Result<DequeuedBuffer> {
        self.record(Call::Dequeue);
        let index = self.queued.borrow_mut().pop_front().ok_or_else(|| {
            Error::driver("VIDIOC_DQBUF", io::Error::from_raw_os_error(libc::EAGAIN))
        })?;
        let sequence = self.sequence.get();
        self.sequence.set(sequence + 1);
        Ok(DequeuedBuffer {
            index,
            sequence,
            timestamp: Duration::from_millis(33 * u64::from(sequence)),
            bytes_used: vec![self.plane_length; num_planes],
        })
    }

    fn stream_on(&self) -> Result<()> {
        self.record(Call::StreamOn);
        if self.fail_stream_on {
            return Err(Error::driver(
                "VIDIOC_STREAMON",
                io::Error::from_raw_os_error(libc::EIO),
            ));
        }
        Ok(())
    }

    fn stream_off(&self) -> Result<()> {
        self.record(Call::StreamOff);
        self.queued.borrow_mut().clear();
        Ok(())
    }
}

pub fn capture_config(buffer_count: u32) -> CaptureConfig {
    CaptureConfig {
        format: "NV12".into(),
        width: 1920,
        height: 1080,
        buffer_count,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

pub const CRTC_A: u32 = 100;
pub const CRTC_B: u32 = 101;
pub const HDMI_OFF: u32 = 200;
pub const HDMI_ON: u32 = 201;
pub const ENCODER: u32 = 300;
/// Planes 0..=3 of the plane list; only index 2 is primary and on CRTC_B
pub const PLANES: [u32; 4] = [400, 401, 402, 403];

pub const PLANE_PROPS: [&str; 10] = [
    "FB_ID", "CRTC_ID", "SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H",
];

const PLANE_TYPE_OVERLAY: u64 = 0;
const PLANE_TYPE_CURSOR: u64 = 2;

fn property_map(base: u32, names: &[&str]) -> PropertyMap {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            (
                name.to_string(),
                Property {
                    id: base + i as u32,
                    value: 0,
                },
            )
        })
        .collect()
}

fn plane_properties(base: u32, plane_type: u64) -> PropertyMap {
    let mut props = property_map(base, &PLANE_PROPS);
    props.insert(
        "type".into(),
        Property {
            id: base + 50,
            value: plane_type,
        },
    );
    props
}

#[derive(Default)]
pub struct KmsState {
    pub resources: RefCell<CardResources>,
    pub connectors: RefCell<HashMap<u32, ConnectorInfo>>,
    pub encoders: RefCell<HashMap<u32, EncoderInfo>>,
    pub crtcs: RefCell<HashMap<u32, CrtcInfo>>,
    pub planes: RefCell<Vec<PlaneInfo>>,
    pub properties: RefCell<HashMap<u32, PropertyMap>>,
    /// Lookups not yet released, per object
    pub outstanding: RefCell<HashMap<(ObjectKind, u32), usize>>,
    pub released: RefCell<Vec<(ObjectKind, u32)>>,
    pub blobs: RefCell<Vec<u64>>,
    pub framebuffers: RefCell<HashMap<u32, FramebufferDesc>>,
    /// Dumb buffer handle to the colour it was filled with
    pub dumbs: RefCell<HashMap<u32, Option<u32>>>,
    pub gems: RefCell<Vec<u32>>,
    pub commits: RefCell<Vec<(AtomicRequest, AtomicCommitFlags)>>,
    pub events: RefCell<VecDeque<FlipEvent>>,
    pub fail_commits: Cell<bool>,
    /// Teardown-relevant requests in the order they arrived
    pub log: RefCell<Vec<String>>,
    next_id: Cell<u32>,
    node: OnceCell<File>,
}

#[derive(Clone, Default)]
pub struct MockKms(pub Rc<KmsState>);

impl Deref for MockKms {
    type Target = KmsState;

    fn deref(&self) -> &KmsState {
        &self.0
    }
}

pub fn mode(index: usize, width: u32, height: u32, preferred: bool) -> ModeInfo {
    ModeInfo {
        index,
        name: format!("{width}x{height}"),
        width,
        height,
        vrefresh: 60,
        preferred,
    }
}

impl AsFd for MockKms {
    fn as_fd(&self) -> BorrowedFd<'_> {
        null_node(&self.0.node)
    }
}

impl MockKms {
    /// Two CRTCs, a disconnected and a connected HDMI output, one encoder
    /// that can only drive CRTC_B, and four planes of which only `PLANES[2]`
    /// is both primary and able to feed CRTC_B.
    pub fn single_output() -> Self {
        let kms = Self::default();
        kms.next_id.set(1000);

        *kms.resources.borrow_mut() = CardResources {
            framebuffers: vec![],
            crtcs: vec![CRTC_A, CRTC_B],
            connectors: vec![HDMI_OFF, HDMI_ON],
            encoders: vec![ENCODER],
        };

        kms.connectors.borrow_mut().extend([
            (
                HDMI_OFF,
                ConnectorInfo {
                    id: HDMI_OFF,
                    name: "HDMI-A-1".into(),
                    connection: Connection::Disconnected,
                    modes: vec![],
                    encoders: vec![ENCODER],
                    current_encoder: None,
                },
            ),
            (
                HDMI_ON,
                ConnectorInfo {
                    id: HDMI_ON,
                    name: "HDMI-A-2".into(),
                    connection: Connection::Connected,
                    modes: vec![mode(0, 1280, 720, false), mode(1, 1920, 1080, true)],
                    encoders: vec![ENCODER],
                    current_encoder: Some(ENCODER),
                },
            ),
        ]);

        kms.encoders.borrow_mut().insert(
            ENCODER,
            EncoderInfo {
                id: ENCODER,
                current_crtc: None,
                possible_crtcs: 0b10,
            },
        );

        for crtc in [CRTC_A, CRTC_B] {
            kms.crtcs.borrow_mut().insert(
                crtc,
                CrtcInfo {
                    id: crtc,
                    framebuffer: None,
                },
            );
        }

        let xr24 = DrmFourcc::Xrgb8888 as u32;
        let nv12 = DrmFourcc::Nv12 as u32;
        let planes = [
            (0b01, PLANE_TYPE_PRIMARY),
            (0b10, PLANE_TYPE_OVERLAY),
            (0b10, PLANE_TYPE_PRIMARY),
            (0b11, PLANE_TYPE_CURSOR),
        ];
        for (i, (possible_crtcs, plane_type)) in planes.into_iter().enumerate() {
            let id = PLANES[i];
            kms.planes.borrow_mut().push(PlaneInfo {
                id,
                possible_crtcs,
                formats: vec![xr24, nv12],
                current_crtc: None,
            });
            kms.properties
                .borrow_mut()
                .insert(id, plane_properties(id * 100, plane_type));
        }

        let mut props = kms.properties.borrow_mut();
        props.insert(HDMI_OFF, property_map(HDMI_OFF * 100, &["CRTC_ID"]));
        props.insert(HDMI_ON, property_map(HDMI_ON * 100, &["CRTC_ID"]));
        props.insert(CRTC_A, property_map(CRTC_A * 100, &["MODE_ID", "ACTIVE"]));
        props.insert(CRTC_B, property_map(CRTC_B * 100, &["MODE_ID", "ACTIVE"]));
        drop(props);

        kms
    }

    /// Every handle or object still held by someone
    pub fn outstanding_handles(&self) -> usize {
        self.outstanding.borrow().values().sum::<usize>()
            + self.blobs.borrow().len()
            + self.framebuffers.borrow().len()
            + self.dumbs.borrow().len()
            + self.gems.borrow().len()
    }

    pub fn lookups_held(&self, kind: ObjectKind, id: u32) -> usize {
        self.outstanding
            .borrow()
            .get(&(kind, id))
            .copied()
            .unwrap_or(0)
    }

    pub fn property_id(&self, object: u32, name: &str) -> u32 {
        self.properties.borrow()[&object][name].id
    }

    pub fn remove_property(&self, object: u32, name: &str) {
        if let Some(props) = self.properties.borrow_mut().get_mut(&object) {
            props.remove(name);
        }
    }

    pub fn queue_flip(&self, sequence: u32, timestamp: Duration) {
        self.events.borrow_mut().push_back(FlipEvent {
            sequence,
            timestamp,
            crtc: CRTC_B,
        });
    }

    /// Look an object up the way the resolver does and describe the hold
    pub fn hold(&self, kind: ObjectKind, id: u32) -> Resource {
        match kind {
            ObjectKind::Connector => self.connector_info(id).map(drop),
            ObjectKind::Encoder => self.encoder_info(id).map(drop),
            ObjectKind::Crtc => self.crtc_info(id).map(drop),
            ObjectKind::Plane => self.plane_info(id).map(drop),
        }
        .unwrap();
        Resource::Object { kind, id }
    }

    pub fn hold_blob(&self) -> Resource {
        let mode = self.connectors.borrow()[&HDMI_ON].modes[0].clone();
        Resource::PropertyBlob(self.create_mode_blob(HDMI_ON, &mode).unwrap())
    }

    pub fn commit_count(&self) -> usize {
        self.commits.borrow().len()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    fn next(&self) -> u32 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn acquire(&self, kind: ObjectKind, id: u32) {
        *self.outstanding.borrow_mut().entry((kind, id)).or_default() += 1;
    }

    fn referenced_by_fb(&self, handle: u32) -> bool {
        self.framebuffers
            .borrow()
            .values()
            .any(|fb| fb.handles.contains(&handle))
    }

    fn missing(what: &str, id: u32) -> Error {
        Error::driver(
            "mock lookup",
            io::Error::new(io::ErrorKind::NotFound, format!("{what} {id}")),
        )
    }
}

impl KmsDevice for MockKms {
    fn resources(&self) -> Result<CardResources> {
        Ok(self.resources.borrow().clone())
    }

    fn connector_info(&self, id: u32) -> Result<ConnectorInfo> {
        let info = self
            .connectors
            .borrow()
            .get(&id)
            .cloned()
            .ok_or_else(|| Self::missing("connector", id))?;
        self.acquire(ObjectKind::Connector, id);
        Ok(info)
    }

    fn encoder_info(&self, id: u32) -> Result<EncoderInfo> {
        let info = self
            .encoders
            .borrow()
            .get(&id)
            .copied()
            .ok_or_else(|| Self::missing("encoder", id))?;
        self.acquire(ObjectKind::Encoder, id);
        Ok(info)
    }

    fn crtc_info(&self, id: u32) -> Result<CrtcInfo> {
        let info = self
            .crtcs
            .borrow()
            .get(&id)
            .copied()
            .ok_or_else(|| Self::missing("crtc", id))?;
        self.acquire(ObjectKind::Crtc, id);
        Ok(info)
    }

    fn plane_ids(&self) -> Result<Vec<u32>> {
        Ok(self.planes.borrow().iter().map(|p| p.id).collect())
    }

    fn plane_info(&self, id: u32) -> Result<PlaneInfo> {
        let info = self
            .planes
            .borrow()
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| Self::missing("plane", id))?;
        self.acquire(ObjectKind::Plane, id);
        Ok(info)
    }

    fn object_properties(&self, id: u32, _kind: ObjectKind) -> Result<PropertyMap> {
        Ok(self
            .properties
            .borrow()
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    fn release_object(&self, kind: ObjectKind, id: u32) {
        let mut outstanding = self.outstanding.borrow_mut();
        let held = outstanding.entry((kind, id)).or_default();
        assert!(*held > 0, "{kind:?} {id} released more often than looked up");
        *held -= 1;
        if *held == 0 {
            outstanding.remove(&(kind, id));
        }
        self.released.borrow_mut().push((kind, id));
        self.log
            .borrow_mut()
            .push(format!("release {} {id}", kind.name()));
    }

    fn create_mode_blob(&self, connector: u32, mode: &ModeInfo) -> Result<u64> {
        assert!(
            self.connectors.borrow()[&connector]
                .modes
                .contains(mode),
            "mode {mode:?} not listed by connector {connector}"
        );
        let blob = u64::from(self.next());
        self.blobs.borrow_mut().push(blob);
        Ok(blob)
    }

    fn destroy_blob(&self, blob: u64) -> Result<()> {
        let mut blobs = self.blobs.borrow_mut();
        let pos = blobs
            .iter()
            .position(|&b| b == blob)
            .ok_or_else(|| Self::missing("blob", blob as u32))?;
        blobs.remove(pos);
        self.log.borrow_mut().push(format!("destroy blob {blob}"));
        Ok(())
    }

    fn commit(&self, request: &AtomicRequest, flags: AtomicCommitFlags) -> Result<()> {
        if self.fail_commits.get() {
            return Err(Error::driver(
                "DRM_IOCTL_MODE_ATOMIC",
                io::Error::from_raw_os_error(libc::EINVAL),
            ));
        }
        self.commits.borrow_mut().push((request.clone(), flags));
        Ok(())
    }

    fn add_fb(&self, desc: &FramebufferDesc) -> Result<u32> {
        for &handle in desc.handles.iter().filter(|&&h| h != 0) {
            let known =
                self.dumbs.borrow().contains_key(&handle) || self.gems.borrow().contains(&handle);
            assert!(known, "framebuffer over unknown memory handle {handle}");
        }
        let fb = self.next();
        self.framebuffers.borrow_mut().insert(fb, *desc);
        Ok(fb)
    }

    fn remove_fb(&self, fb: u32) -> Result<()> {
        self.framebuffers
            .borrow_mut()
            .remove(&fb)
            .ok_or_else(|| Self::missing("framebuffer", fb))?;
        self.log.borrow_mut().push(format!("remove fb {fb}"));
        Ok(())
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> Result<DumbBufferInfo> {
        let handle = self.next();
        self.dumbs.borrow_mut().insert(handle, None);
        Ok(DumbBufferInfo {
            handle,
            width,
            height,
            pitch: width * bpp / 8,
        })
    }

    fn fill_dumb(&self, handle: u32, color: u32) -> Result<()> {
        assert!(
            !self.referenced_by_fb(handle),
            "dumb buffer {handle} drawn after registration"
        );
        let mut dumbs = self.dumbs.borrow_mut();
        let slot = dumbs
            .get_mut(&handle)
            .ok_or_else(|| Self::missing("dumb buffer", handle))?;
        *slot = Some(color);
        Ok(())
    }

    fn destroy_dumb(&self, handle: u32) -> Result<()> {
        assert!(
            !self.referenced_by_fb(handle),
            "dumb buffer {handle} destroyed while registered"
        );
        self.dumbs
            .borrow_mut()
            .remove(&handle)
            .ok_or_else(|| Self::missing("dumb buffer", handle))?;
        self.log.borrow_mut().push(format!("destroy dumb {handle}"));
        Ok(())
    }

    fn import_dmabuf(&self, _fd: BorrowedFd<'_>) -> Result<u32> {
        let gem = self.next();
        self.gems.borrow_mut().push(gem);
        Ok(gem)
    }

    fn close_gem(&self, handle: u32) -> Result<()> {
        assert!(
            !self.referenced_by_fb(handle),
            "GEM handle {handle} closed while a framebuffer uses it"
        );
        let mut gems = self.gems.borrow_mut();
        let pos = gems
            .iter()
            .position(|&g| g == handle)
            .ok_or_else(|| Self::missing("gem", handle))?;
        gems.remove(pos);
        self.log.borrow_mut().push(format!("close gem {handle}"));
        Ok(())
    }

    fn read_flip_events(&self) -> Result<Vec<FlipEvent>> {
        Ok(self.events.borrow_mut().drain(..).collect())
    }
}

pub fn display_config(test_pattern: bool) -> DisplayConfig {
    DisplayConfig {
        test_pattern,
        ..Default::default()
    }
}
