//! Atomic mode set and page-flip scheduling

use std::time::Duration;

use drm::control::AtomicCommitFlags;
use tracing::{debug, info, instrument, trace, warn};

use super::kms::{require_property, AtomicRequest, FlipEvent, KmsDevice, ObjectKind};
use super::resources::{Acquisitions, Resource};
use super::topology::Topology;
use crate::error::{Error, Result};

/// Progress of the flips on one CRTC
///
/// Only a successful flip submission sets `flip_pending`, and only the
/// completion of that flip clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameState {
    sequence: u32,
    timestamp: Option<Duration>,
    flip_pending: bool,
    refresh_hz: Option<f64>,
}

impl FrameState {
    /// Vblank sequence of the last completed flip
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn timestamp(&self) -> Option<Duration> {
        self.timestamp
    }

    pub fn flip_pending(&self) -> bool {
        self.flip_pending
    }

    /// Rate derived from the last two completions
    pub fn refresh_hz(&self) -> Option<f64> {
        self.refresh_hz
    }

    fn submitted(&mut self) {
        self.flip_pending = true;
    }

    fn completed(&mut self, event: &FlipEvent) {
        self.refresh_hz = match self.timestamp {
            Some(previous) if event.timestamp > previous => {
                Some(1.0 / (event.timestamp - previous).as_secs_f64())
            }
            _ => None,
        };
        self.sequence = event.sequence;
        self.timestamp = Some(event.timestamp);
        self.flip_pending = false;
    }
}

/// Builds and submits the atomic transactions for one output
#[derive(Debug)]
pub struct AtomicCommitScheduler {
    connector: u32,
    crtc: u32,
    plane: u32,
    /// `FB_ID` of the plane, known once the mode is committed
    fb_property: Option<u32>,
    state: FrameState,
}

impl AtomicCommitScheduler {
    pub fn new(topology: &Topology) -> Self {
        Self {
            connector: topology.connector,
            crtc: topology.crtc,
            plane: topology.plane,
            fb_property: None,
            state: FrameState::default(),
        }
    }

    pub fn state(&self) -> &FrameState {
        &self.state
    }

    pub fn mode_committed(&self) -> bool {
        self.fb_property.is_some()
    }

    /// Light up the output with `fb` on the primary plane in one blocking commit
    ///
    /// The mode blob stays on `held` for as long as the mode is active. If
    /// any property is missing or the commit fails, nothing is applied and
    /// the blob is destroyed again.
    #[instrument(skip(self, kms, held, topology), fields(crtc = self.crtc, plane = self.plane))]
    pub fn mode_set<K: KmsDevice>(
        &mut self,
        kms: &K,
        held: &mut Acquisitions,
        topology: &Topology,
        fb: u32,
        fb_size: (u32, u32),
    ) -> Result<()> {
        if self.mode_committed() {
            return Err(Error::invalid_state("mode already committed"));
        }

        let mut scope = held.scope(kms);
        let blob = kms.create_mode_blob(topology.connector, &topology.mode)?;
        scope.push(Resource::PropertyBlob(blob));

        let connector_props = kms.object_properties(self.connector, ObjectKind::Connector)?;
        let crtc_props = kms.object_properties(self.crtc, ObjectKind::Crtc)?;
        let plane_props = kms.object_properties(self.plane, ObjectKind::Plane)?;

        let connector_prop =
            |name| require_property(&connector_props, ObjectKind::Connector, self.connector, name);
        let crtc_prop = |name| require_property(&crtc_props, ObjectKind::Crtc, self.crtc, name);
        let plane_prop = |name| require_property(&plane_props, ObjectKind::Plane, self.plane, name);

        let (src_w, src_h) = fb_size;
        let (mode_w, mode_h) = (topology.mode.width, topology.mode.height);

        let mut request = AtomicRequest::new();
        request.add(self.connector, connector_prop("CRTC_ID")?, self.crtc.into());
        request.add(self.crtc, crtc_prop("MODE_ID")?, blob);
        request.add(self.crtc, crtc_prop("ACTIVE")?, 1);

        let fb_property = plane_prop("FB_ID")?;
        request.add(self.plane, fb_property, fb.into());
        request.add(self.plane, plane_prop("CRTC_ID")?, self.crtc.into());
        // Source rectangle is 16.16 fixed point
        request.add(self.plane, plane_prop("SRC_X")?, 0);
        request.add(self.plane, plane_prop("SRC_Y")?, 0);
        request.add(self.plane, plane_prop("SRC_W")?, u64::from(src_w) << 16);
        request.add(self.plane, plane_prop("SRC_H")?, u64::from(src_h) << 16);
        request.add(self.plane, plane_prop("CRTC_X")?, 0);
        request.add(self.plane, plane_prop("CRTC_Y")?, 0);
        request.add(self.plane, plane_prop("CRTC_W")?, mode_w.into());
        request.add(self.plane, plane_prop("CRTC_H")?, mode_h.into());

        kms.commit(&request, AtomicCommitFlags::ALLOW_MODESET)?;
        scope.commit();

        self.fb_property = Some(fb_property);
        info!(
            "Mode {} committed on CRTC {} with framebuffer {fb}",
            topology.mode.name, self.crtc
        );
        Ok(())
    }

    /// Queue `fb` for the next vblank without waiting for it
    pub fn update<K: KmsDevice>(&mut self, kms: &K, fb: u32) -> Result<()> {
        if self.state.flip_pending {
            return Err(Error::FlipPending);
        }
        let fb_property = self
            .fb_property
            .ok_or_else(|| Error::invalid_state("no mode committed"))?;

        let mut request = AtomicRequest::new();
        request.add(self.plane, fb_property, fb.into());
        kms.commit(
            &request,
            AtomicCommitFlags::NONBLOCK | AtomicCommitFlags::PAGE_FLIP_EVENT,
        )?;

        self.state.submitted();
        metrics::counter!("scanout_flips_submitted_total").increment(1);
        trace!(fb, "flip submitted");
        Ok(())
    }

    /// Apply one completion event; returns whether it completed our pending flip
    pub fn complete(&mut self, event: &FlipEvent) -> bool {
        if event.crtc != self.crtc {
            debug!("Ignoring flip event for CRTC {}", event.crtc);
            return false;
        }
        if !self.state.flip_pending {
            warn!("Flip event {} with no flip pending", event.sequence);
            return false;
        }

        self.state.completed(event);
        metrics::counter!("scanout_flips_completed_total").increment(1);
        if let Some(hz) = self.state.refresh_hz {
            metrics::gauge!("scanout_refresh_hz").set(hz);
        }
        trace!(sequence = event.sequence, "flip completed");
        true
    }
}
