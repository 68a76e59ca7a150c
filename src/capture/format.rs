//! Format and frame size negotiation rules

use v4l::FourCC;

/// One entry of the device's format enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescription {
    pub index: u32,
    pub fourcc: FourCC,
    pub description: String,
    pub compressed: bool,
}

/// Inclusive range with an optional step, one per axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeRange {
    pub min: u32,
    pub max: u32,
    pub step: u32,
}

impl SizeRange {
    /// `value` lies in `[min, max]` and sits on the step grid anchored at `min`
    pub fn contains_on_step(&self, value: u32) -> bool {
        let step = self.step.max(1);
        self.contains(value) && (value - self.min) % step == 0
    }

    pub fn contains(&self, value: u32) -> bool {
        self.min <= value && value <= self.max
    }
}

/// One entry of the device's frame size enumeration for a fourcc
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSize {
    Discrete { width: u32, height: u32 },
    Stepwise { width: SizeRange, height: SizeRange },
    Continuous { width: SizeRange, height: SizeRange },
}

impl FrameSize {
    pub fn accepts(&self, width: u32, height: u32) -> bool {
        match self {
            Self::Discrete {
                width: w,
                height: h,
            } => *w == width && *h == height,
            Self::Stepwise {
                width: w,
                height: h,
            } => w.contains_on_step(width) && h.contains_on_step(height),
            Self::Continuous {
                width: w,
                height: h,
            } => w.contains(width) && h.contains(height),
        }
    }
}

/// An empty enumeration means the driver does not restrict the size.
pub fn size_supported(sizes: &[FrameSize], width: u32, height: u32) -> bool {
    sizes.is_empty() || sizes.iter().any(|size| size.accepts(width, height))
}
