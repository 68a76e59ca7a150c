//! Error types for the capture and scanout sessions

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Display topology could not be resolved
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TopologyError {
    #[error("no connected connector with at least one mode")]
    NoConnector,
    #[error("no encoder available for the chosen connector")]
    NoEncoder,
    #[error("no CRTC compatible with the chosen encoder")]
    NoCrtc,
    #[error("no primary plane compatible with the chosen CRTC and format")]
    NoPlane,
}

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    /// Caller supplied parameters are invalid; raised before any device I/O
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device node missing, of the wrong type or not openable
    #[error("Device error: {}: {reason}", path.display())]
    Device { path: PathBuf, reason: String },

    /// A single control request failed
    #[error("{request} failed: {source}")]
    Driver {
        request: &'static str,
        #[source]
        source: io::Error,
    },

    /// Requested fourcc is not offered by the device
    #[error("Format error: {0}")]
    Format(String),

    /// Requested frame size is not offered for the negotiated fourcc
    #[error("Frame size {width}x{height} is not supported for format {fourcc}")]
    Size {
        fourcc: String,
        width: u32,
        height: u32,
    },

    /// Pixel format is not one this crate knows how to lay out
    #[error("Unsupported pixel format: {0}")]
    UnsupportedFormat(String),

    /// Device capability this crate does not implement
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Mapping or kernel object allocation failed mid-sequence
    #[error("Resource exhaustion: {what}: {source}")]
    ResourceExhaustion {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    /// A property needed for an atomic commit is not exposed by the object
    #[error("Property {property} not found on {object} {id}")]
    PropertyLookup {
        object: &'static str,
        id: u32,
        property: &'static str,
    },

    /// A non-blocking commit is still waiting for its completion event
    #[error("Page flip already pending")]
    FlipPending,

    /// Operation called in the wrong lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn device(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::Device {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn driver(request: &'static str, source: impl Into<io::Error>) -> Self {
        Self::Driver {
            request,
            source: source.into(),
        }
    }

    pub fn exhausted(what: impl Into<String>, source: impl Into<io::Error>) -> Self {
        Self::ResourceExhaustion {
            what: what.into(),
            source: source.into(),
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Kernel errno behind a driver or exhaustion error, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Driver { source, .. } | Self::ResourceExhaustion { source, .. } => {
                source.raw_os_error()
            }
            Self::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Extension trait tagging low-level failures with the request that produced them
pub trait ResultExt<T> {
    fn driver(self, request: &'static str) -> Result<T>;
}

impl<T, E: Into<io::Error>> ResultExt<T> for std::result::Result<T, E> {
    fn driver(self, request: &'static str) -> Result<T> {
        self.map_err(|e| Error::driver(request, e))
    }
}
