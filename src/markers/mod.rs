//! Marker registry and pose handling

mod pose;
mod registry;

pub use pose::Pose3D;
pub use registry::{
    Marker, MarkerCalibration, MarkerHandle, MarkerRegistry, PoseUpdate, RegistryError,
    TrackingState,
};
