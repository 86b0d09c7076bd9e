//! Tracking pipeline
//!
//! The render side and the detection worker are connected by two channels.
//! A single capture buffer travels between them: the render side fills it,
//! hands it to the worker with a request, and gets it back with the result.
//!
//! - `FrameExchange` owns the buffer on the render side and enforces the protocol
//! - `TrackingCoordinator` ties capture, display, and the marker registry together
//! - Stages implement the `PipelineStage` trait and run in their own task
//! - `PipelineHealth` counts buffers, skips, and protocol violations

pub mod clock;
pub mod coordinator;
pub mod exchange;
pub mod health;
pub mod messages;
pub mod stage;
pub mod state;
pub mod types;

pub use clock::TrackingClock;
pub use coordinator::TrackingCoordinator;
pub use exchange::{DetectionOutcome, ExchangeError, ExchangeState, FrameExchange};
pub use health::{HealthAlert, HealthMonitor, PipelineHealth};
pub use messages::{LoadRequest, Matrix4Data, WorkerEvent, WorkerRequest};
pub use stage::{PipelineStage, spawn_stage};
pub use state::PipelineState;
pub use types::{FrameBuffer, Timestamp};
