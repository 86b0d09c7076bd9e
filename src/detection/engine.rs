//! Interface to the marker recognition engine

use std::path::PathBuf;
use thiserror::Error;

use crate::markers::MarkerCalibration;
use crate::pipeline::messages::{LoadRequest, Matrix4Data};
use crate::pipeline::types::FrameBuffer;

/// Error raised while configuring or running an engine
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot decode marker image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("invalid camera calibration: {0}")]
    InvalidCamera(String),

    #[error("invalid marker {path}: {reason}")]
    InvalidMarker { path: PathBuf, reason: String },

    #[error("no markers to load")]
    NoMarkers,

    #[error("engine is not loaded")]
    NotLoaded,
}

/// A marker located in a frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerHit {
    /// Position of the marker in the load order
    pub index: usize,
    /// Marker-to-camera transform, column-major, OpenGL camera space, millimetres
    pub transform: Matrix4Data,
}

/// Marker recognition backend driven by the detection worker.
///
/// All methods are blocking and run on the blocking thread pool.
pub trait MarkerEngine: Send + Sync + 'static {
    /// Load the camera calibration for the processing resolution in `request`
    /// and return the camera projection
    fn load_camera(&mut self, request: &LoadRequest) -> Result<Matrix4Data, DetectionError>;

    /// Load every marker in order. Fails if any marker cannot be loaded.
    fn load_markers(&mut self, refs: &[String]) -> Result<Vec<MarkerCalibration>, DetectionError>;

    /// Search a processing-resolution RGBA frame for the best matching marker
    fn detect(&mut self, frame: &FrameBuffer) -> Option<MarkerHit>;

    /// Drop everything loaded so far
    fn unload(&mut self);
}
