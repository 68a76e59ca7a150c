//! DRM card backed by the `drm` crate

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::num::NonZeroU32;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};

use drm::buffer::{Buffer, DrmFourcc, DrmModifier, PlanarBuffer};
use drm::control::atomic::AtomicModeReq;
use drm::control::dumbbuffer::DumbBuffer;
use drm::control::{
    connector, crtc, encoder, from_u32, plane, property, AtomicCommitFlags, CrtcListFilter, Event,
    FbCmd2Flags, ModeTypeFlags, RawResourceHandle,
};
use drm::control::Device as ControlDevice;
use drm::{ClientCapability, Device as BasicDevice};
use tracing::{debug, info};

use super::kms::{
    AtomicRequest, CardResources, Connection, ConnectorInfo, CrtcInfo, DumbBufferInfo,
    EncoderInfo, FlipEvent, FramebufferDesc, KmsDevice, ModeInfo, ObjectKind, PlaneInfo,
    Property, PropertyMap,
};
use crate::error::{Error, Result, ResultExt};
use crate::ioctl::retry_io;

/// Open DRM node with universal planes and atomic modesetting enabled
pub struct DrmCard {
    file: File,
    path: PathBuf,
    dumb_buffers: RefCell<HashMap<u32, DumbBuffer>>,
}

impl AsFd for DrmCard {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl BasicDevice for DrmCard {}
impl ControlDevice for DrmCard {}

/// Open the first candidate that exposes at least one connector and one CRTC
pub fn probe(candidates: &[PathBuf]) -> Result<DrmCard> {
    for path in candidates {
        match DrmCard::open(path) {
            Ok(card) => return Ok(card),
            Err(e) => debug!("Skipping {}: {e}", path.display()),
        }
    }

    let tried: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
    Err(Error::device(
        tried.join(", "),
        "no display device with connectors and CRTCs",
    ))
}

impl DrmCard {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::device(path, format!("cannot open: {e}")))?;

        let card = Self {
            file,
            path: path.to_path_buf(),
            dumb_buffers: RefCell::new(HashMap::new()),
        };

        for cap in [ClientCapability::UniversalPlanes, ClientCapability::Atomic] {
            card.set_client_capability(cap, true)
                .map_err(|e| Error::device(path, format!("client capability {cap:?}: {e}")))?;
        }

        let res = card.resources()?;
        if res.connectors.is_empty() || res.crtcs.is_empty() {
            return Err(Error::device(
                path,
                format!(
                    "{} connectors, {} CRTCs",
                    res.connectors.len(),
                    res.crtcs.len()
                ),
            ));
        }

        if let Ok(driver) = card.get_driver() {
            info!(
                "Display device {}: {} ({} connectors, {} CRTCs, {} encoders)",
                path.display(),
                driver.name().to_string_lossy(),
                res.connectors.len(),
                res.crtcs.len(),
                res.encoders.len()
            );
        }
        Ok(card)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encode a CRTC filter as a bitmask over the global CRTC list
    fn crtc_mask(&self, filter: CrtcListFilter) -> Result<u32> {
        let res = retry_io(|| self.resource_handles()).driver("DRM_IOCTL_MODE_GETRESOURCES")?;
        let compatible = res.filter_crtcs(filter);
        Ok(res
            .crtcs()
            .iter()
            .enumerate()
            .filter(|(_, crtc)| compatible.contains(crtc))
            .fold(0, |mask, (index, _)| mask | 1 << index))
    }

    fn property_map<T>(&self, object: T) -> Result<PropertyMap>
    where
        T: drm::control::ResourceHandle + Copy,
    {
        let values =
            retry_io(|| self.get_properties(object)).driver("DRM_IOCTL_MODE_OBJ_GETPROPERTIES")?;

        let (props, raw_values) = values.as_props_and_values();
        let mut map = PropertyMap::new();
        for (&prop, &value) in props.iter().zip(raw_values) {
            let info =
                retry_io(|| self.get_property(prop)).driver("DRM_IOCTL_MODE_GETPROPERTY")?;
            if let Ok(name) = info.name().to_str() {
                map.insert(
                    name.to_owned(),
                    Property {
                        id: u32::from(prop),
                        value,
                    },
                );
            }
        }
        Ok(map)
    }

    fn mode_info(index: usize, mode: &drm::control::Mode) -> ModeInfo {
        let (width, height) = mode.size();
        ModeInfo {
            index,
            name: mode.name().to_string_lossy().into_owned(),
            width: width.into(),
            height: height.into(),
            vrefresh: mode.vrefresh(),
            preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
        }
    }
}

fn handle<T: From<RawResourceHandle>>(id: u32) -> Result<T> {
    from_u32(id).ok_or_else(|| Error::invalid_state("object id 0 does not name a KMS object"))
}

fn raw(id: Option<impl Into<u32>>) -> Option<u32> {
    id.map(Into::into)
}

/// Framebuffer layout in the shape add-framebuffer-2 expects
struct Planar<'a>(&'a FramebufferDesc);

impl PlanarBuffer for Planar<'_> {
    fn size(&self) -> (u32, u32) {
        (self.0.width, self.0.height)
    }

    fn format(&self) -> DrmFourcc {
        self.0.format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        None
    }

    fn pitches(&self) -> [u32; 4] {
        self.0.pitches
    }

    fn handles(&self) -> [Option<drm::buffer::Handle>; 4] {
        self.0.handles.map(from_u32)
    }

    fn offsets(&self) -> [u32; 4] {
        self.0.offsets
    }
}

impl KmsDevice for DrmCard {
    fn resources(&self) -> Result<CardResources> {
        let res = retry_io(|| self.resource_handles()).driver("DRM_IOCTL_MODE_GETRESOURCES")?;
        Ok(CardResources {
            framebuffers: res.framebuffers().iter().map(|&h| h.into()).collect(),
            crtcs: res.crtcs().iter().map(|&h| h.into()).collect(),
            connectors: res.connectors().iter().map(|&h| h.into()).collect(),
            encoders: res.encoders().iter().map(|&h| h.into()).collect(),
        })
    }

    fn connector_info(&self, id: u32) -> Result<ConnectorInfo> {
        let h: connector::Handle = handle(id)?;
        let info =
            retry_io(|| self.get_connector(h, true)).driver("DRM_IOCTL_MODE_GETCONNECTOR")?;

        let connection = match info.state() {
            connector::State::Connected => Connection::Connected,
            connector::State::Disconnected => Connection::Disconnected,
            connector::State::Unknown => Connection::Unknown,
        };

        Ok(ConnectorInfo {
            id,
            name: format!("{}-{}", info.interface().as_str(), info.interface_id()),
            connection,
            modes: info
                .modes()
                .iter()
                .enumerate()
                .map(|(i, m)| Self::mode_info(i, m))
                .collect(),
            encoders: info.encoders().iter().map(|&e| e.into()).collect(),
            current_encoder: raw(info.current_encoder()),
        })
    }

    fn encoder_info(&self, id: u32) -> Result<EncoderInfo> {
        let h: encoder::Handle = handle(id)?;
        let info = retry_io(|| self.get_encoder(h)).driver("DRM_IOCTL_MODE_GETENCODER")?;
        Ok(EncoderInfo {
            id,
            current_crtc: raw(info.crtc()),
            possible_crtcs: self.crtc_mask(info.possible_crtcs())?,
        })
    }

    fn crtc_info(&self, id: u32) -> Result<CrtcInfo> {
        let h: crtc::Handle = handle(id)?;
        let info = retry_io(|| self.get_crtc(h)).driver("DRM_IOCTL_MODE_GETCRTC")?;
        Ok(CrtcInfo {
            id,
            framebuffer: raw(info.framebuffer()),
        })
    }

    fn plane_ids(&self) -> Result<Vec<u32>> {
        let planes =
            retry_io(|| self.plane_handles()).driver("DRM_IOCTL_MODE_GETPLANERESOURCES")?;
        Ok(planes.into_iter().map(u32::from).collect())
    }

    fn plane_info(&self, id: u32) -> Result<PlaneInfo> {
        let h: plane::Handle = handle(id)?;
        let info = retry_io(|| self.get_plane(h)).driver("DRM_IOCTL_MODE_GETPLANE")?;
        Ok(PlaneInfo {
            id,
            possible_crtcs: self.crtc_mask(info.possible_crtcs())?,
            formats: info.formats().to_vec(),
            current_crtc: raw(info.crtc()),
        })
    }

    fn object_properties(&self, id: u32, kind: ObjectKind) -> Result<PropertyMap> {
        match kind {
            ObjectKind::Connector => self.property_map(handle::<connector::Handle>(id)?),
            ObjectKind::Encoder => Ok(PropertyMap::new()),
            ObjectKind::Crtc => self.property_map(handle::<crtc::Handle>(id)?),
            ObjectKind::Plane => self.property_map(handle::<plane::Handle>(id)?),
        }
    }

    fn create_mode_blob(&self, connector: u32, mode: &ModeInfo) -> Result<u64> {
        let h: connector::Handle = handle(connector)?;
        let info =
            retry_io(|| self.get_connector(h, false)).driver("DRM_IOCTL_MODE_GETCONNECTOR")?;
        let drm_mode = info.modes().get(mode.index).copied().ok_or_else(|| {
            Error::invalid_state(format!("connector {connector} lost mode {}", mode.name))
        })?;

        match retry_io(|| self.create_property_blob(&drm_mode))
            .driver("DRM_IOCTL_MODE_CREATEPROPBLOB")?
        {
            property::Value::Blob(id) => Ok(id),
            other => Err(Error::invalid_state(format!(
                "property blob came back as {other:?}"
            ))),
        }
    }

    fn destroy_blob(&self, blob: u64) -> Result<()> {
        retry_io(|| self.destroy_property_blob(blob)).driver("DRM_IOCTL_MODE_DESTROYPROPBLOB")
    }

    fn commit(&self, request: &AtomicRequest, flags: AtomicCommitFlags) -> Result<()> {
        let mut entries = Vec::with_capacity(request.len());
        for &(object, prop, value) in request.entries() {
            let object = NonZeroU32::new(object)
                .ok_or_else(|| Error::invalid_state("atomic write to object id 0"))?;
            let prop: property::Handle = handle(prop)?;
            entries.push((object, prop, value));
        }

        retry_io(|| {
            let mut req = AtomicModeReq::new();
            for &(object, prop, value) in &entries {
                req.add_raw_property(object, prop, value);
            }
            self.atomic_commit(flags, req)
        })
        .driver("DRM_IOCTL_MODE_ATOMIC")
    }

    fn add_fb(&self, desc: &FramebufferDesc) -> Result<u32> {
        let fb = retry_io(|| self.add_planar_framebuffer(&Planar(desc), FbCmd2Flags::empty()))
            .map_err(|e| Error::exhausted("framebuffer registration", e))?;
        Ok(fb.into())
    }

    fn remove_fb(&self, fb: u32) -> Result<()> {
        let h = handle(fb)?;
        retry_io(|| self.destroy_framebuffer(h)).driver("DRM_IOCTL_MODE_RMFB")
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> Result<DumbBufferInfo> {
        let db = retry_io(|| self.create_dumb_buffer((width, height), DrmFourcc::Xrgb8888, bpp))
            .map_err(|e| Error::exhausted(format!("{width}x{height} dumb buffer"), e))?;

        let info = DumbBufferInfo {
            handle: u32::from(db.handle()),
            width,
            height,
            pitch: db.pitch(),
        };
        self.dumb_buffers.borrow_mut().insert(info.handle, db);
        Ok(info)
    }

    fn fill_dumb(&self, handle: u32, color: u32) -> Result<()> {
        let mut buffers = self.dumb_buffers.borrow_mut();
        let db = buffers
            .get_mut(&handle)
            .ok_or_else(|| Error::invalid_state(format!("unknown dumb buffer {handle}")))?;

        let mut mapping = self
            .map_dumb_buffer(db)
            .map_err(|e| Error::exhausted(format!("mapping dumb buffer {handle}"), e))?;
        for pixel in mapping.chunks_exact_mut(4) {
            pixel.copy_from_slice(&color.to_le_bytes());
        }
        Ok(())
    }

    fn destroy_dumb(&self, handle: u32) -> Result<()> {
        let db = self
            .dumb_buffers
            .borrow_mut()
            .remove(&handle)
            .ok_or_else(|| Error::invalid_state(format!("unknown dumb buffer {handle}")))?;
        self.destroy_dumb_buffer(db).driver("DRM_IOCTL_MODE_DESTROY_DUMB")
    }

    fn import_dmabuf(&self, fd: BorrowedFd<'_>) -> Result<u32> {
        let gem = retry_io(|| self.prime_fd_to_buffer(fd))
            .map_err(|e| Error::exhausted("DMA-BUF import", e))?;
        Ok(gem.into())
    }

    fn close_gem(&self, gem: u32) -> Result<()> {
        let h: drm::buffer::Handle = handle(gem)?;
        retry_io(|| self.close_buffer(h)).driver("DRM_IOCTL_GEM_CLOSE")
    }

    fn read_flip_events(&self) -> Result<Vec<FlipEvent>> {
        let Some(events) = read_ready(|| self.receive_events())? else {
            return Ok(Vec::new());
        };

        let mut flips = Vec::new();
        for event in events {
            match event {
                Event::PageFlip(flip) => flips.push(FlipEvent {
                    sequence: flip.frame,
                    timestamp: flip.duration,
                    crtc: flip.crtc.into(),
                }),
                _ => debug!("Ignoring non page-flip DRM event"),
            }
        }
        Ok(flips)
    }
}

/// Non-blocking event read; `None` when nothing is pending
fn read_ready<T>(read: impl FnMut() -> io::Result<T>) -> Result<Option<T>> {
    match retry_io(read) {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(Error::driver("read(drm event)", e)),
    }
}
