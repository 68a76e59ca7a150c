pub mod device;
pub mod format;
pub mod frame;
pub mod pool;
pub mod sys;
pub mod v4l2;

pub use device::{V4l2Device, VideoDevice};
pub use frame::CapturedFrame;
pub use pool::{BufferState, CaptureBufferPool};
pub use v4l2::CaptureSession;
