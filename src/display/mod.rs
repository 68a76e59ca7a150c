pub mod card;
pub mod commit;
pub mod display;
pub mod framebuffer;
pub mod kms;
pub mod resources;
pub mod topology;

pub use card::{probe, DrmCard};
pub use commit::{AtomicCommitScheduler, FrameState};
pub use display::{DisplayState, KmsDisplay, ScanoutSource};
pub use framebuffer::{FramebufferRegistry, PixelRole, ScanoutFormat};
pub use kms::KmsDevice;
pub use topology::{Topology, TopologyResolver};
