//! Marker detection: the engine seam, the reference template engine and the
//! worker stage that drives it

mod engine;
mod kernel;
pub mod projection;
mod template;
mod worker;

#[cfg(test)]
pub(crate) mod fixtures;

pub use engine::{DetectionError, MarkerEngine, MarkerHit};
pub use kernel::MatchKernel;
pub use projection::FieldOfView;
pub use template::TemplateEngine;
pub use worker::{DetectionWorker, WorkerState};
