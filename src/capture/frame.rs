use std::time::Duration;

use v4l::FourCC;

use super::device::{DequeuedBuffer, NegotiatedFormat};

/// Metadata of a frame the driver handed back
///
/// The pixels stay in the pool's buffer `index` until it is requeued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub index: u32,
    pub sequence: u32,
    /// Driver timestamp, monotonic clock
    pub timestamp: Duration,
    pub fourcc: FourCC,
    pub width: u32,
    pub height: u32,
    /// Line pitch per plane
    pub strides: Vec<u32>,
    pub bytes_used: Vec<u32>,
}

impl CapturedFrame {
    pub fn new(buffer: DequeuedBuffer, format: &NegotiatedFormat) -> Self {
        Self {
            index: buffer.index,
            sequence: buffer.sequence,
            timestamp: buffer.timestamp,
            fourcc: format.fourcc,
            width: format.width,
            height: format.height,
            strides: format.planes.iter().map(|p| p.bytes_per_line).collect(),
            bytes_used: buffer.bytes_used,
        }
    }

    /// Stride of the first plane, the one display import is laid out from
    pub fn stride(&self) -> u32 {
        self.strides.first().copied().unwrap_or(self.width)
    }
}
