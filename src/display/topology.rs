//! Connector → encoder → CRTC → plane resolution
//!
//! Every object looked up is either kept, in which case it is recorded on
//! the caller's acquisition list, or released again immediately.

use tracing::{debug, info, instrument};

use super::kms::{
    CardResources, Connection, ConnectorInfo, CrtcInfo, EncoderInfo, KmsDevice, ModeInfo,
    ObjectKind, PlaneInfo, PLANE_TYPE_PRIMARY,
};
use super::resources::{Acquisitions, Resource};
use crate::error::{Result, TopologyError};
use crate::utils;

/// The pinned output path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub connector: u32,
    pub connector_name: String,
    pub mode: ModeInfo,
    pub encoder: u32,
    pub crtc: u32,
    /// Position of `crtc` in the resource list
    pub crtc_index: usize,
    pub plane: u32,
    /// Formats the plane scans out
    pub plane_formats: Vec<u32>,
}

pub struct TopologyResolver<'k, K: KmsDevice> {
    kms: &'k K,
    resources: CardResources,
}

fn mask_has(mask: u32, index: usize) -> bool {
    index < 32 && mask & (1 << index) != 0
}

impl<'k, K: KmsDevice> TopologyResolver<'k, K> {
    pub fn new(kms: &'k K) -> Result<Self> {
        let resources = kms.resources()?;
        Ok(Self { kms, resources })
    }

    pub fn resources(&self) -> &CardResources {
        &self.resources
    }

    /// First connector that is connected and lists at least one mode
    pub fn resolve_connector(&self, held: &mut Acquisitions) -> Result<ConnectorInfo> {
        for &id in &self.resources.connectors {
            let connector = match self.kms.connector_info(id) {
                Ok(connector) => connector,
                Err(e) => {
                    debug!("Connector {id} unavailable: {e}");
                    continue;
                }
            };

            if connector.connection == Connection::Connected && !connector.modes.is_empty() {
                held.push(Resource::Object {
                    kind: ObjectKind::Connector,
                    id,
                });
                return Ok(connector);
            }

            debug!(
                "Rejecting connector {} ({:?}, {} modes)",
                connector.name,
                connector.connection,
                connector.modes.len()
            );
            self.kms.release_object(ObjectKind::Connector, id);
        }
        Err(TopologyError::NoConnector.into())
    }

    /// The connector's bound encoder, else the first of its encoders that resolves
    pub fn resolve_encoder(
        &self,
        connector: &ConnectorInfo,
        held: &mut Acquisitions,
    ) -> Result<EncoderInfo> {
        let candidates = connector
            .current_encoder
            .into_iter()
            .chain(connector.encoders.iter().copied());

        for id in candidates {
            match self.kms.encoder_info(id) {
                Ok(encoder) => {
                    held.push(Resource::Object {
                        kind: ObjectKind::Encoder,
                        id,
                    });
                    return Ok(encoder);
                }
                Err(e) => debug!("Encoder {id} unavailable: {e}"),
            }
        }
        Err(TopologyError::NoEncoder.into())
    }

    /// The encoder's bound CRTC, else the first one its mask allows
    pub fn resolve_crtc(
        &self,
        encoder: &EncoderInfo,
        held: &mut Acquisitions,
    ) -> Result<(CrtcInfo, usize)> {
        let bound = encoder
            .current_crtc
            .and_then(|crtc| Some((self.resources.crtc_index(crtc)?, crtc)));
        let compatible = self
            .resources
            .crtcs
            .iter()
            .copied()
            .enumerate()
            .filter(|&(index, _)| mask_has(encoder.possible_crtcs, index));

        for (index, id) in bound.into_iter().chain(compatible) {
            match self.kms.crtc_info(id) {
                Ok(crtc) => {
                    held.push(Resource::Object {
                        kind: ObjectKind::Crtc,
                        id,
                    });
                    return Ok((crtc, index));
                }
                Err(e) => debug!("CRTC {id} unavailable: {e}"),
            }
        }
        Err(TopologyError::NoCrtc.into())
    }

    /// First primary plane that can feed CRTC `crtc_index` and scans out `format`
    pub fn resolve_plane(
        &self,
        crtc_index: usize,
        format: u32,
        held: &mut Acquisitions,
    ) -> Result<PlaneInfo> {
        for id in self.kms.plane_ids()? {
            let plane = match self.kms.plane_info(id) {
                Ok(plane) => plane,
                Err(e) => {
                    debug!("Plane {id} unavailable: {e}");
                    continue;
                }
            };

            match self.plane_matches(&plane, crtc_index, format) {
                Ok(true) => {
                    held.push(Resource::Object {
                        kind: ObjectKind::Plane,
                        id,
                    });
                    return Ok(plane);
                }
                Ok(false) => self.kms.release_object(ObjectKind::Plane, id),
                Err(e) => {
                    self.kms.release_object(ObjectKind::Plane, id);
                    return Err(e);
                }
            }
        }
        Err(TopologyError::NoPlane.into())
    }

    fn plane_matches(&self, plane: &PlaneInfo, crtc_index: usize, format: u32) -> Result<bool> {
        if !mask_has(plane.possible_crtcs, crtc_index) {
            debug!("Plane {} cannot feed CRTC index {crtc_index}", plane.id);
            return Ok(false);
        }

        let props = self.kms.object_properties(plane.id, ObjectKind::Plane)?;
        let plane_type = props.get("type").map(|p| p.value);
        if plane_type != Some(PLANE_TYPE_PRIMARY) {
            debug!("Plane {} has type {plane_type:?}, not primary", plane.id);
            return Ok(false);
        }

        if !plane.formats.contains(&format) {
            debug!(
                "Plane {} does not scan out {}",
                plane.id,
                utils::fourcc_name(format)
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Run all four stages and pick the connector's mode
    #[instrument(skip(self, held), fields(format = %utils::fourcc_name(format)))]
    pub fn resolve(&self, format: u32, held: &mut Acquisitions) -> Result<Topology> {
        let connector = self.resolve_connector(held)?;
        let encoder = self.resolve_encoder(&connector, held)?;
        let (crtc, crtc_index) = self.resolve_crtc(&encoder, held)?;
        let plane = self.resolve_plane(crtc_index, format, held)?;

        let mode = connector
            .pick_mode()
            .cloned()
            .ok_or(TopologyError::NoConnector)?;

        info!(
            "Output {}: {}x{}@{} ({}), encoder {}, CRTC {}, plane {}",
            connector.name,
            mode.width,
            mode.height,
            mode.vrefresh,
            mode.name,
            encoder.id,
            crtc.id,
            plane.id
        );

        Ok(Topology {
            connector: connector.id,
            connector_name: connector.name,
            mode,
            encoder: encoder.id,
            crtc: crtc.id,
            crtc_index,
            plane: plane.id,
            plane_formats: plane.formats,
        })
    }
}
