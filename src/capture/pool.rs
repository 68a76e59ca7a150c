//! Capture buffer pool
//!
//! Owns the driver-allocated buffers once they are reachable from user
//! space, either as CPU mappings or as exported DMA-BUF descriptors, and
//! tracks which side currently owns each buffer.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use tracing::{debug, info, warn};

use super::device::{DequeuedBuffer, PlaneLayout, VideoDevice};
use super::sys::VIDEO_MAX_PLANES;
use crate::error::{Error, Result};
use crate::BufferMemory;

/// Who may touch a buffer right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Reachable from user space but not yet handed to the driver
    Idle,
    /// Owned by the driver; must not be read or exported
    Queued,
    /// Filled by the driver and handed back to us
    Dequeued,
}

enum PlaneBacking<M> {
    Mapped(M),
    Exported(OwnedFd),
}

struct Plane<M> {
    layout: PlaneLayout,
    backing: PlaneBacking<M>,
}

/// One driver buffer; all of its planes are attached or detached together
pub struct CaptureBuffer<M> {
    index: u32,
    planes: Vec<Plane<M>>,
    state: BufferState,
}

impl<M> CaptureBuffer<M> {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    pub fn plane_lengths(&self) -> impl Iterator<Item = u32> + '_ {
        self.planes.iter().map(|p| p.layout.length)
    }
}

pub struct CaptureBufferPool<M> {
    memory: BufferMemory,
    /// Buffers the driver granted; zero until `request` succeeds
    slots: u32,
    buffers: Vec<CaptureBuffer<M>>,
}

impl<M> CaptureBufferPool<M>
where
    M: std::ops::Deref<Target = [u8]>,
{
    pub fn new(memory: BufferMemory) -> Self {
        Self {
            memory,
            slots: 0,
            buffers: Vec::new(),
        }
    }

    pub fn memory(&self) -> BufferMemory {
        self.memory
    }

    /// Buffers granted by the driver
    pub fn len(&self) -> usize {
        self.slots as usize
    }

    pub fn is_empty(&self) -> bool {
        self.slots == 0
    }

    /// Planes currently attached across every buffer
    pub fn mapped_planes(&self) -> usize {
        self.buffers.iter().map(|b| b.planes.len()).sum()
    }

    pub fn buffers(&self) -> &[CaptureBuffer<M>] {
        &self.buffers
    }

    /// Ask the driver for `count` buffers, resizing to whatever it grants
    pub fn request<D>(&mut self, device: &D, count: u32) -> Result<u32>
    where
        D: VideoDevice<Mapping = M>,
    {
        if !self.buffers.is_empty() {
            return Err(Error::invalid_state("buffers are still attached"));
        }

        let granted = device.request_buffers(count)?;
        if granted == 0 {
            return Err(Error::exhausted(
                format!("driver granted no buffers out of {count}"),
                io::Error::from_raw_os_error(libc::ENOMEM),
            ));
        }
        if granted != count {
            warn!("Driver adjusted buffer count: requested {count}, got {granted}");
        }

        self.slots = granted;
        Ok(granted)
    }

    /// Attach every plane of every granted buffer
    ///
    /// Either all buffers end up attached, or none do: a failure part way
    /// through drops every plane attached so far, including the earlier
    /// planes of the buffer that failed.
    pub fn map<D>(&mut self, device: &D) -> Result<()>
    where
        D: VideoDevice<Mapping = M>,
    {
        if self.slots == 0 {
            return Err(Error::invalid_state("no buffers requested"));
        }
        if !self.buffers.is_empty() {
            return Err(Error::invalid_state("buffers are already attached"));
        }

        let mut attached = Vec::with_capacity(self.slots as usize);
        for index in 0..self.slots {
            match self.attach(device, index) {
                Ok(buffer) => attached.push(buffer),
                Err(err) => {
                    let planes: usize = attached.iter().map(|b| b.planes.len()).sum();
                    warn!(
                        "Attaching buffer {index} failed, unwinding {planes} planes of {} buffers",
                        attached.len()
                    );
                    drop(attached);
                    return Err(err);
                }
            }
        }

        info!(
            "Attached {} buffers as {:?}",
            attached.len(),
            self.memory
        );
        self.buffers = attached;
        Ok(())
    }

    fn attach<D>(&self, device: &D, index: u32) -> Result<CaptureBuffer<M>>
    where
        D: VideoDevice<Mapping = M>,
    {
        let layouts = device.query_buffer(index)?;
        if layouts.is_empty() || layouts.len() > VIDEO_MAX_PLANES {
            return Err(Error::Unsupported(format!(
                "buffer {index} reports {} planes",
                layouts.len()
            )));
        }

        let mut planes = Vec::with_capacity(layouts.len());
        for (plane, layout) in layouts.into_iter().enumerate() {
            let backing = match self.memory {
                BufferMemory::Mmap => PlaneBacking::Mapped(device.map_plane(index, plane, &layout)?),
                BufferMemory::DmaBuf => PlaneBacking::Exported(device.export_plane(index, plane)?),
            };
            debug!(index, plane, offset = layout.offset, length = layout.length, "plane attached");
            planes.push(Plane { layout, backing });
        }

        Ok(CaptureBuffer {
            index,
            planes,
            state: BufferState::Idle,
        })
    }

    /// Hand every idle buffer to the driver, stopping at the first failure
    pub fn queue_all<D>(&mut self, device: &D) -> Result<()>
    where
        D: VideoDevice<Mapping = M>,
    {
        if self.buffers.is_empty() {
            return Err(Error::invalid_state("no buffers attached"));
        }
        for buffer in self.buffers.iter_mut().filter(|b| b.state == BufferState::Idle) {
            device.queue_buffer(buffer.index, buffer.planes.len())?;
            buffer.state = BufferState::Queued;
        }
        Ok(())
    }

    /// Take the next filled buffer back from the driver
    pub fn dequeue<D>(&mut self, device: &D) -> Result<DequeuedBuffer>
    where
        D: VideoDevice<Mapping = M>,
    {
        let num_planes = self
            .buffers
            .first()
            .map(|b| b.planes.len())
            .ok_or_else(|| Error::invalid_state("no buffers attached"))?;

        let dequeued = device.dequeue_buffer(num_planes)?;
        let buffer = self.buffer_mut(dequeued.index)?;
        if buffer.state != BufferState::Queued {
            return Err(Error::invalid_state(format!(
                "driver returned buffer {} which was {:?}",
                dequeued.index, buffer.state
            )));
        }
        buffer.state = BufferState::Dequeued;
        Ok(dequeued)
    }

    /// Give a dequeued buffer back to the driver
    pub fn requeue<D>(&mut self, device: &D, index: u32) -> Result<()>
    where
        D: VideoDevice<Mapping = M>,
    {
        let buffer = self.buffer_mut(index)?;
        if buffer.state != BufferState::Dequeued {
            return Err(Error::invalid_state(format!(
                "buffer {index} is {:?}, not dequeued",
                buffer.state
            )));
        }
        let num_planes = buffer.planes.len();
        device.queue_buffer(index, num_planes)?;
        self.buffer_mut(index)?.state = BufferState::Queued;
        Ok(())
    }

    /// CPU view of each plane of a dequeued, mapped buffer
    pub fn plane_data(&self, index: u32) -> Result<Vec<&[u8]>> {
        let buffer = self.dequeued(index)?;
        buffer
            .planes
            .iter()
            .map(|plane| match &plane.backing {
                PlaneBacking::Mapped(mapping) => Ok(&mapping[..]),
                PlaneBacking::Exported(_) => Err(Error::invalid_state(format!(
                    "buffer {index} is exported, not mapped"
                ))),
            })
            .collect()
    }

    /// DMA-BUF descriptor of each plane of a dequeued, exported buffer
    pub fn dmabuf_fds(&self, index: u32) -> Result<Vec<BorrowedFd<'_>>> {
        let buffer = self.dequeued(index)?;
        buffer
            .planes
            .iter()
            .map(|plane| match &plane.backing {
                PlaneBacking::Exported(fd) => Ok(fd.as_fd()),
                PlaneBacking::Mapped(_) => Err(Error::invalid_state(format!(
                    "buffer {index} is mapped, not exported"
                ))),
            })
            .collect()
    }

    /// Detach every plane, then hand the allocation back to the driver
    pub fn release<D>(&mut self, device: &D) -> Result<()>
    where
        D: VideoDevice<Mapping = M>,
    {
        let planes = self.mapped_planes();
        self.buffers.clear();
        if planes > 0 {
            debug!("Detached {planes} planes");
        }

        if self.slots == 0 {
            return Ok(());
        }
        self.slots = 0;
        device.request_buffers(0)?;
        Ok(())
    }

    fn buffer_mut(&mut self, index: u32) -> Result<&mut CaptureBuffer<M>> {
        self.buffers
            .get_mut(index as usize)
            .ok_or_else(|| Error::invalid_state(format!("no buffer with index {index}")))
    }

    fn dequeued(&self, index: u32) -> Result<&CaptureBuffer<M>> {
        let buffer = self
            .buffers
            .get(index as usize)
            .ok_or_else(|| Error::invalid_state(format!("no buffer with index {index}")))?;
        if buffer.state != BufferState::Dequeued {
            return Err(Error::invalid_state(format!(
                "buffer {index} is {:?}, not dequeued",
                buffer.state
            )));
        }
        Ok(buffer)
    }
}
